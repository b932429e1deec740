//! Handshake and service message constructors.
//!
//! Covers the fixed subset of the TL schema the transport layer itself
//! speaks: the auth key exchange and the session service messages.
//! Everything else travels as opaque bytes.

use crate::tl::{TlReader, TlWriter};
use crate::WireError;
use bytes::Bytes;

/// Constructor identifiers
pub mod ids {
    /// `req_pq#60469778`
    pub const REQ_PQ: u32 = 0x60469778;
    /// `resPQ#05162463`
    pub const RES_PQ: u32 = 0x05162463;
    /// `p_q_inner_data#83c95aec`
    pub const P_Q_INNER_DATA: u32 = 0x83c95aec;
    /// `req_DH_params#d712e4be`
    pub const REQ_DH_PARAMS: u32 = 0xd712e4be;
    /// `server_DH_params_fail#79cb045d`
    pub const SERVER_DH_PARAMS_FAIL: u32 = 0x79cb045d;
    /// `server_DH_params_ok#d0e8075c`
    pub const SERVER_DH_PARAMS_OK: u32 = 0xd0e8075c;
    /// `server_DH_inner_data#b5890dba`
    pub const SERVER_DH_INNER_DATA: u32 = 0xb5890dba;
    /// `client_DH_inner_data#6643b654`
    pub const CLIENT_DH_INNER_DATA: u32 = 0x6643b654;
    /// `set_client_DH_params#f5045f1f`
    pub const SET_CLIENT_DH_PARAMS: u32 = 0xf5045f1f;
    /// `dh_gen_ok#3bcbf734`
    pub const DH_GEN_OK: u32 = 0x3bcbf734;
    /// `dh_gen_retry#46dc1fb9`
    pub const DH_GEN_RETRY: u32 = 0x46dc1fb9;
    /// `dh_gen_fail#a69dae02`
    pub const DH_GEN_FAIL: u32 = 0xa69dae02;

    /// `msg_container#73f1f8dc`
    pub const MSG_CONTAINER: u32 = 0x73f1f8dc;
    /// `rpc_result#f35c6d01`
    pub const RPC_RESULT: u32 = 0xf35c6d01;
    /// `msgs_ack#62d6b459`
    pub const MSGS_ACK: u32 = 0x62d6b459;
    /// `bad_msg_notification#a7eff811`
    pub const BAD_MSG_NOTIFICATION: u32 = 0xa7eff811;
    /// `bad_server_salt#edab447b`
    pub const BAD_SERVER_SALT: u32 = 0xedab447b;
    /// `new_session_created#9ec20908`
    pub const NEW_SESSION_CREATED: u32 = 0x9ec20908;
    /// `pong#347773c5`
    pub const PONG: u32 = 0x347773c5;
    /// `ping#7abe77ec`
    pub const PING: u32 = 0x7abe77ec;
    /// `ping_delay_disconnect#f3427b8c`
    pub const PING_DELAY_DISCONNECT: u32 = 0xf3427b8c;
    /// `msgs_state_req#da69fb52`
    pub const MSGS_STATE_REQ: u32 = 0xda69fb52;
    /// `msgs_state_info#04deb57d`
    pub const MSGS_STATE_INFO: u32 = 0x04deb57d;
    /// `msgs_all_info#8cc0d131`
    pub const MSGS_ALL_INFO: u32 = 0x8cc0d131;
    /// `msg_detailed_info#276d3ec6`
    pub const MSG_DETAILED_INFO: u32 = 0x276d3ec6;
    /// `msg_new_detailed_info#809db6df`
    pub const MSG_NEW_DETAILED_INFO: u32 = 0x809db6df;
    /// `msg_resend_req#7d861a08`
    pub const MSG_RESEND_REQ: u32 = 0x7d861a08;
    /// `http_wait#9299359f`
    pub const HTTP_WAIT: u32 = 0x9299359f;
    /// `gzip_packed#3072cfa1`
    pub const GZIP_PACKED: u32 = 0x3072cfa1;
}

/// `req_pq nonce:int128 = ResPQ`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqPq {
    /// Client nonce
    pub nonce: [u8; 16],
}

impl ReqPq {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(20);
        w.write_u32(ids::REQ_PQ).write_int128(&self.nonce);
        w.finish()
    }

    /// Parse a boxed value
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::REQ_PQ)?;
        Ok(Self {
            nonce: r.read_int128()?,
        })
    }
}

/// `resPQ nonce server_nonce pq:string server_public_key_fingerprints:Vector<long>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResPq {
    /// Echo of the client nonce
    pub nonce: [u8; 16],
    /// Server-chosen nonce
    pub server_nonce: [u8; 16],
    /// Big-endian product of two primes
    pub pq: Vec<u8>,
    /// Fingerprints of the RSA keys the server can decrypt with
    pub fingerprints: Vec<u64>,
}

impl ResPq {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(64 + self.fingerprints.len() * 8);
        w.write_u32(ids::RES_PQ)
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_bytes(&self.pq)
            .write_vector_u64(&self.fingerprints);
        w.finish()
    }

    /// Parse a boxed value
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::RES_PQ)?;
        Ok(Self {
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            pq: r.read_bytes()?.to_vec(),
            fingerprints: r.read_vector_u64(true)?,
        })
    }
}

/// `p_q_inner_data pq p q nonce server_nonce new_nonce:int256`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PqInnerData {
    /// Product as received
    pub pq: Vec<u8>,
    /// Smaller factor, big-endian
    pub p: Vec<u8>,
    /// Larger factor, big-endian
    pub q: Vec<u8>,
    /// Client nonce
    pub nonce: [u8; 16],
    /// Server nonce
    pub server_nonce: [u8; 16],
    /// Client secret nonce
    pub new_nonce: [u8; 32],
}

impl PqInnerData {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(96);
        w.write_u32(ids::P_Q_INNER_DATA)
            .write_bytes(&self.pq)
            .write_bytes(&self.p)
            .write_bytes(&self.q)
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_int256(&self.new_nonce);
        w.finish()
    }

    /// Parse a boxed value, returning it with the number of bytes consumed
    pub fn parse_prefix(data: &[u8]) -> Result<(Self, usize), WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::P_Q_INNER_DATA)?;
        let value = Self {
            pq: r.read_bytes()?.to_vec(),
            p: r.read_bytes()?.to_vec(),
            q: r.read_bytes()?.to_vec(),
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            new_nonce: r.read_int256()?,
        };
        Ok((value, r.position()))
    }
}

/// `req_DH_params nonce server_nonce p q public_key_fingerprint encrypted_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqDhParams {
    /// Client nonce
    pub nonce: [u8; 16],
    /// Server nonce
    pub server_nonce: [u8; 16],
    /// Smaller factor, big-endian
    pub p: Vec<u8>,
    /// Larger factor, big-endian
    pub q: Vec<u8>,
    /// Fingerprint of the RSA key used for `encrypted_data`
    pub fingerprint: u64,
    /// RSA-encrypted `p_q_inner_data` with hash and padding
    pub encrypted_data: Vec<u8>,
}

impl ReqDhParams {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(340);
        w.write_u32(ids::REQ_DH_PARAMS)
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_bytes(&self.p)
            .write_bytes(&self.q)
            .write_u64(self.fingerprint)
            .write_bytes(&self.encrypted_data);
        w.finish()
    }

    /// Parse a boxed value
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::REQ_DH_PARAMS)?;
        Ok(Self {
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            p: r.read_bytes()?.to_vec(),
            q: r.read_bytes()?.to_vec(),
            fingerprint: r.read_u64()?,
            encrypted_data: r.read_bytes()?.to_vec(),
        })
    }
}

/// `Server_DH_Params`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerDhParams {
    /// `server_DH_params_ok`
    Ok {
        /// Client nonce
        nonce: [u8; 16],
        /// Server nonce
        server_nonce: [u8; 16],
        /// AES-IGE encrypted `server_DH_inner_data` with hash and padding
        encrypted_answer: Vec<u8>,
    },
    /// `server_DH_params_fail`
    Fail {
        /// Client nonce
        nonce: [u8; 16],
        /// Server nonce
        server_nonce: [u8; 16],
        /// Hash of the client's new nonce
        new_nonce_hash: [u8; 16],
    },
}

impl ServerDhParams {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(640);
        match self {
            Self::Ok {
                nonce,
                server_nonce,
                encrypted_answer,
            } => {
                w.write_u32(ids::SERVER_DH_PARAMS_OK)
                    .write_int128(nonce)
                    .write_int128(server_nonce)
                    .write_bytes(encrypted_answer);
            }
            Self::Fail {
                nonce,
                server_nonce,
                new_nonce_hash,
            } => {
                w.write_u32(ids::SERVER_DH_PARAMS_FAIL)
                    .write_int128(nonce)
                    .write_int128(server_nonce)
                    .write_int128(new_nonce_hash);
            }
        }
        w.finish()
    }

    /// Parse a boxed value
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = TlReader::new(data);
        match r.read_u32()? {
            ids::SERVER_DH_PARAMS_OK => Ok(Self::Ok {
                nonce: r.read_int128()?,
                server_nonce: r.read_int128()?,
                encrypted_answer: r.read_bytes()?.to_vec(),
            }),
            ids::SERVER_DH_PARAMS_FAIL => Ok(Self::Fail {
                nonce: r.read_int128()?,
                server_nonce: r.read_int128()?,
                new_nonce_hash: r.read_int128()?,
            }),
            other => Err(WireError::UnexpectedConstructor(other)),
        }
    }
}

/// `server_DH_inner_data nonce server_nonce g:int dh_prime:string g_a:string server_time:int`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDhInnerData {
    /// Client nonce
    pub nonce: [u8; 16],
    /// Server nonce
    pub server_nonce: [u8; 16],
    /// Generator
    pub g: i32,
    /// Big-endian 2048-bit safe prime
    pub dh_prime: Vec<u8>,
    /// Big-endian `g^a mod dh_prime`
    pub g_a: Vec<u8>,
    /// Server unix time
    pub server_time: i32,
}

impl ServerDhInnerData {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(600);
        w.write_u32(ids::SERVER_DH_INNER_DATA)
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_i32(self.g)
            .write_bytes(&self.dh_prime)
            .write_bytes(&self.g_a)
            .write_i32(self.server_time);
        w.finish()
    }

    /// Parse a boxed value, returning it with the number of bytes consumed
    pub fn parse_prefix(data: &[u8]) -> Result<(Self, usize), WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::SERVER_DH_INNER_DATA)?;
        let value = Self {
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            g: r.read_i32()?,
            dh_prime: r.read_bytes()?.to_vec(),
            g_a: r.read_bytes()?.to_vec(),
            server_time: r.read_i32()?,
        };
        Ok((value, r.position()))
    }
}

/// `client_DH_inner_data nonce server_nonce retry_id:long g_b:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDhInnerData {
    /// Client nonce
    pub nonce: [u8; 16],
    /// Server nonce
    pub server_nonce: [u8; 16],
    /// Zero on the first attempt, then the aux hash of the rejected key
    pub retry_id: u64,
    /// Big-endian `g^b mod dh_prime`
    pub g_b: Vec<u8>,
}

impl ClientDhInnerData {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(320);
        w.write_u32(ids::CLIENT_DH_INNER_DATA)
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_u64(self.retry_id)
            .write_bytes(&self.g_b);
        w.finish()
    }

    /// Parse a boxed value, returning it with the number of bytes consumed
    pub fn parse_prefix(data: &[u8]) -> Result<(Self, usize), WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::CLIENT_DH_INNER_DATA)?;
        let value = Self {
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            retry_id: r.read_u64()?,
            g_b: r.read_bytes()?.to_vec(),
        };
        Ok((value, r.position()))
    }
}

/// `set_client_DH_params nonce server_nonce encrypted_data:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetClientDhParams {
    /// Client nonce
    pub nonce: [u8; 16],
    /// Server nonce
    pub server_nonce: [u8; 16],
    /// AES-IGE encrypted `client_DH_inner_data` with hash and padding
    pub encrypted_data: Vec<u8>,
}

impl SetClientDhParams {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(400);
        w.write_u32(ids::SET_CLIENT_DH_PARAMS)
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_bytes(&self.encrypted_data);
        w.finish()
    }

    /// Parse a boxed value
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = TlReader::new(data);
        r.expect_constructor(ids::SET_CLIENT_DH_PARAMS)?;
        Ok(Self {
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            encrypted_data: r.read_bytes()?.to_vec(),
        })
    }
}

/// Outcome of `set_client_DH_params`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGenKind {
    /// `dh_gen_ok`, carries `new_nonce_hash1`
    Ok,
    /// `dh_gen_retry`, carries `new_nonce_hash2`
    Retry,
    /// `dh_gen_fail`, carries `new_nonce_hash3`
    Fail,
}

impl DhGenKind {
    /// The number mixed into the matching new nonce hash
    pub fn hash_number(self) -> u8 {
        match self {
            Self::Ok => 1,
            Self::Retry => 2,
            Self::Fail => 3,
        }
    }

    fn constructor(self) -> u32 {
        match self {
            Self::Ok => ids::DH_GEN_OK,
            Self::Retry => ids::DH_GEN_RETRY,
            Self::Fail => ids::DH_GEN_FAIL,
        }
    }
}

/// `Set_client_DH_params_answer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGenAnswer {
    /// Which answer the server gave
    pub kind: DhGenKind,
    /// Client nonce
    pub nonce: [u8; 16],
    /// Server nonce
    pub server_nonce: [u8; 16],
    /// `new_nonce_hash1`, `2` or `3` depending on `kind`
    pub new_nonce_hash: [u8; 16],
}

impl DhGenAnswer {
    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::with_capacity(52);
        w.write_u32(self.kind.constructor())
            .write_int128(&self.nonce)
            .write_int128(&self.server_nonce)
            .write_int128(&self.new_nonce_hash);
        w.finish()
    }

    /// Parse a boxed value
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = TlReader::new(data);
        let kind = match r.read_u32()? {
            ids::DH_GEN_OK => DhGenKind::Ok,
            ids::DH_GEN_RETRY => DhGenKind::Retry,
            ids::DH_GEN_FAIL => DhGenKind::Fail,
            other => return Err(WireError::UnexpectedConstructor(other)),
        };
        Ok(Self {
            kind,
            nonce: r.read_int128()?,
            server_nonce: r.read_int128()?,
            new_nonce_hash: r.read_int128()?,
        })
    }
}

/// One message inside a `msg_container`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerItem {
    /// Inner message id
    pub msg_id: u64,
    /// Inner sequence number
    pub seq_no: u32,
    /// Inner message body
    pub body: Bytes,
}

/// Service messages exchanged inside an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    /// `msg_container messages:vector<%Message>`
    Container(Vec<ContainerItem>),
    /// `rpc_result req_msg_id:long result:Object`
    RpcResult {
        /// Request the result answers
        req_msg_id: u64,
        /// Opaque result body
        result: Bytes,
    },
    /// `msgs_ack msg_ids:Vector<long>`
    MsgsAck {
        /// Acknowledged ids
        msg_ids: Vec<u64>,
    },
    /// `bad_msg_notification`
    BadMsgNotification {
        /// Rejected message
        bad_msg_id: u64,
        /// Its sequence number
        bad_msg_seqno: i32,
        /// Reason code
        error_code: i32,
    },
    /// `bad_server_salt`
    BadServerSalt {
        /// Rejected message
        bad_msg_id: u64,
        /// Its sequence number
        bad_msg_seqno: i32,
        /// Reason code, always 48
        error_code: i32,
        /// Salt to use from now on
        new_server_salt: u64,
    },
    /// `new_session_created`
    NewSessionCreated {
        /// First message id the server saw in this session
        first_msg_id: u64,
        /// Server-side session identifier
        unique_id: u64,
        /// Current salt
        server_salt: u64,
    },
    /// `pong msg_id:long ping_id:long`
    Pong {
        /// Id of the ping message
        msg_id: u64,
        /// Echoed ping id
        ping_id: u64,
    },
    /// `ping ping_id:long`
    Ping {
        /// Ping id to echo
        ping_id: u64,
    },
    /// `ping_delay_disconnect ping_id:long disconnect_delay:int`
    PingDelayDisconnect {
        /// Ping id to echo
        ping_id: u64,
        /// Seconds of silence after which the server closes the connection
        disconnect_delay: i32,
    },
    /// `msgs_state_req msg_ids:Vector<long>`
    MsgsStateReq {
        /// Ids to report on
        msg_ids: Vec<u64>,
    },
    /// `msgs_state_info req_msg_id:long info:string`
    MsgsStateInfo {
        /// The `msgs_state_req` being answered
        req_msg_id: u64,
        /// One state byte per requested id
        info: Bytes,
    },
    /// `msgs_all_info msg_ids:Vector<long> info:string`
    MsgsAllInfo {
        /// Ids described
        msg_ids: Vec<u64>,
        /// One state byte per id
        info: Bytes,
    },
    /// `msg_detailed_info`
    MsgDetailedInfo {
        /// Our message
        msg_id: u64,
        /// The server's answer to it
        answer_msg_id: u64,
        /// Answer size
        bytes: i32,
        /// Status
        status: i32,
    },
    /// `msg_new_detailed_info`
    MsgNewDetailedInfo {
        /// The server's answer
        answer_msg_id: u64,
        /// Answer size
        bytes: i32,
        /// Status
        status: i32,
    },
    /// `msg_resend_req msg_ids:Vector<long>`
    MsgResendReq {
        /// Ids to resend
        msg_ids: Vec<u64>,
    },
    /// `http_wait max_delay:int wait_after:int max_wait:int`
    HttpWait {
        /// Milliseconds the server may delay an answer
        max_delay: i32,
        /// Milliseconds to wait after the last message before answering
        wait_after: i32,
        /// Longest hold in milliseconds
        max_wait: i32,
    },
    /// `gzip_packed packed_data:string`, delivered compressed
    GzipPacked(Bytes),
    /// Any other constructor; the whole body
    Other(Bytes),
}

impl ServiceMessage {
    /// Parse a message body.
    ///
    /// Unknown constructors are returned as [`ServiceMessage::Other`].
    pub fn parse(body: &Bytes) -> Result<Self, WireError> {
        let mut r = TlReader::new(body);
        let constructor = r.read_u32()?;
        let message = match constructor {
            ids::MSG_CONTAINER => {
                let count = r.read_count(16)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let msg_id = r.read_u64()?;
                    let seq_no = r.read_u32()?;
                    let len = r.read_i32()?;
                    if len < 0 {
                        return Err(WireError::Malformed("negative container item length"));
                    }
                    let start = r.position();
                    r.read_raw(len as usize)?;
                    items.push(ContainerItem {
                        msg_id,
                        seq_no,
                        body: body.slice(start..start + len as usize),
                    });
                }
                Self::Container(items)
            }
            ids::RPC_RESULT => {
                let req_msg_id = r.read_u64()?;
                Self::RpcResult {
                    req_msg_id,
                    result: body.slice(r.position()..),
                }
            }
            ids::MSGS_ACK => Self::MsgsAck {
                msg_ids: r.read_vector_u64(true)?,
            },
            ids::BAD_MSG_NOTIFICATION => Self::BadMsgNotification {
                bad_msg_id: r.read_u64()?,
                bad_msg_seqno: r.read_i32()?,
                error_code: r.read_i32()?,
            },
            ids::BAD_SERVER_SALT => Self::BadServerSalt {
                bad_msg_id: r.read_u64()?,
                bad_msg_seqno: r.read_i32()?,
                error_code: r.read_i32()?,
                new_server_salt: r.read_u64()?,
            },
            ids::NEW_SESSION_CREATED => Self::NewSessionCreated {
                first_msg_id: r.read_u64()?,
                unique_id: r.read_u64()?,
                server_salt: r.read_u64()?,
            },
            ids::PONG => Self::Pong {
                msg_id: r.read_u64()?,
                ping_id: r.read_u64()?,
            },
            ids::PING => Self::Ping {
                ping_id: r.read_u64()?,
            },
            ids::PING_DELAY_DISCONNECT => Self::PingDelayDisconnect {
                ping_id: r.read_u64()?,
                disconnect_delay: r.read_i32()?,
            },
            ids::MSGS_STATE_REQ => Self::MsgsStateReq {
                msg_ids: r.read_vector_u64(true)?,
            },
            ids::MSGS_STATE_INFO => Self::MsgsStateInfo {
                req_msg_id: r.read_u64()?,
                info: Bytes::copy_from_slice(r.read_bytes()?),
            },
            ids::MSGS_ALL_INFO => Self::MsgsAllInfo {
                msg_ids: r.read_vector_u64(true)?,
                info: Bytes::copy_from_slice(r.read_bytes()?),
            },
            ids::MSG_DETAILED_INFO => Self::MsgDetailedInfo {
                msg_id: r.read_u64()?,
                answer_msg_id: r.read_u64()?,
                bytes: r.read_i32()?,
                status: r.read_i32()?,
            },
            ids::MSG_NEW_DETAILED_INFO => Self::MsgNewDetailedInfo {
                answer_msg_id: r.read_u64()?,
                bytes: r.read_i32()?,
                status: r.read_i32()?,
            },
            ids::MSG_RESEND_REQ => Self::MsgResendReq {
                msg_ids: r.read_vector_u64(true)?,
            },
            ids::HTTP_WAIT => Self::HttpWait {
                max_delay: r.read_i32()?,
                wait_after: r.read_i32()?,
                max_wait: r.read_i32()?,
            },
            ids::GZIP_PACKED => Self::GzipPacked(body.clone()),
            _ => Self::Other(body.clone()),
        };
        Ok(message)
    }

    /// Serialize with constructor
    pub fn to_bytes(&self) -> Bytes {
        let mut w = TlWriter::new();
        match self {
            Self::Container(items) => {
                w.write_u32(ids::MSG_CONTAINER).write_i32(items.len() as i32);
                for item in items {
                    w.write_u64(item.msg_id)
                        .write_u32(item.seq_no)
                        .write_i32(item.body.len() as i32)
                        .write_raw(&item.body);
                }
            }
            Self::RpcResult { req_msg_id, result } => {
                w.write_u32(ids::RPC_RESULT)
                    .write_u64(*req_msg_id)
                    .write_raw(result);
            }
            Self::MsgsAck { msg_ids } => {
                w.write_u32(ids::MSGS_ACK).write_vector_u64(msg_ids);
            }
            Self::BadMsgNotification {
                bad_msg_id,
                bad_msg_seqno,
                error_code,
            } => {
                w.write_u32(ids::BAD_MSG_NOTIFICATION)
                    .write_u64(*bad_msg_id)
                    .write_i32(*bad_msg_seqno)
                    .write_i32(*error_code);
            }
            Self::BadServerSalt {
                bad_msg_id,
                bad_msg_seqno,
                error_code,
                new_server_salt,
            } => {
                w.write_u32(ids::BAD_SERVER_SALT)
                    .write_u64(*bad_msg_id)
                    .write_i32(*bad_msg_seqno)
                    .write_i32(*error_code)
                    .write_u64(*new_server_salt);
            }
            Self::NewSessionCreated {
                first_msg_id,
                unique_id,
                server_salt,
            } => {
                w.write_u32(ids::NEW_SESSION_CREATED)
                    .write_u64(*first_msg_id)
                    .write_u64(*unique_id)
                    .write_u64(*server_salt);
            }
            Self::Pong { msg_id, ping_id } => {
                w.write_u32(ids::PONG).write_u64(*msg_id).write_u64(*ping_id);
            }
            Self::Ping { ping_id } => {
                w.write_u32(ids::PING).write_u64(*ping_id);
            }
            Self::PingDelayDisconnect {
                ping_id,
                disconnect_delay,
            } => {
                w.write_u32(ids::PING_DELAY_DISCONNECT)
                    .write_u64(*ping_id)
                    .write_i32(*disconnect_delay);
            }
            Self::MsgsStateReq { msg_ids } => {
                w.write_u32(ids::MSGS_STATE_REQ).write_vector_u64(msg_ids);
            }
            Self::MsgsStateInfo { req_msg_id, info } => {
                w.write_u32(ids::MSGS_STATE_INFO)
                    .write_u64(*req_msg_id)
                    .write_bytes(info);
            }
            Self::MsgsAllInfo { msg_ids, info } => {
                w.write_u32(ids::MSGS_ALL_INFO)
                    .write_vector_u64(msg_ids)
                    .write_bytes(info);
            }
            Self::MsgDetailedInfo {
                msg_id,
                answer_msg_id,
                bytes,
                status,
            } => {
                w.write_u32(ids::MSG_DETAILED_INFO)
                    .write_u64(*msg_id)
                    .write_u64(*answer_msg_id)
                    .write_i32(*bytes)
                    .write_i32(*status);
            }
            Self::MsgNewDetailedInfo {
                answer_msg_id,
                bytes,
                status,
            } => {
                w.write_u32(ids::MSG_NEW_DETAILED_INFO)
                    .write_u64(*answer_msg_id)
                    .write_i32(*bytes)
                    .write_i32(*status);
            }
            Self::MsgResendReq { msg_ids } => {
                w.write_u32(ids::MSG_RESEND_REQ).write_vector_u64(msg_ids);
            }
            Self::HttpWait {
                max_delay,
                wait_after,
                max_wait,
            } => {
                w.write_u32(ids::HTTP_WAIT)
                    .write_i32(*max_delay)
                    .write_i32(*wait_after)
                    .write_i32(*max_wait);
            }
            Self::GzipPacked(body) | Self::Other(body) => {
                w.write_raw(body);
            }
        }
        w.finish()
    }

    /// Whether the message needs an acknowledgement from the peer
    pub fn is_content_related(&self) -> bool {
        !matches!(
            self,
            Self::Container(_) | Self::MsgsAck { .. } | Self::HttpWait { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_pq_layout() {
        let nonce = [0x11u8; 16];
        let bytes = ReqPq { nonce }.to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &[0x78, 0x97, 0x46, 0x60]);
        assert_eq!(ReqPq::parse(&bytes).unwrap().nonce, nonce);
    }

    #[test]
    fn test_res_pq_parse() {
        let res_pq = ResPq {
            nonce: [1; 16],
            server_nonce: [2; 16],
            pq: vec![0x17, 0xed, 0x48, 0x94, 0x1a, 0x08, 0xf9, 0x81],
            fingerprints: vec![0xc3b42b026ce86b21],
        };
        let parsed = ResPq::parse(&res_pq.to_bytes()).unwrap();
        assert_eq!(parsed, res_pq);
    }

    #[test]
    fn test_wrong_constructor() {
        let bytes = ReqPq { nonce: [0; 16] }.to_bytes();
        assert_eq!(
            ResPq::parse(&bytes),
            Err(WireError::UnexpectedConstructor(ids::REQ_PQ))
        );
        assert!(matches!(
            ServerDhParams::parse(&bytes),
            Err(WireError::UnexpectedConstructor(_))
        ));
    }

    #[test]
    fn test_parse_prefix_reports_consumed() {
        let inner = ServerDhInnerData {
            nonce: [3; 16],
            server_nonce: [4; 16],
            g: 3,
            dh_prime: vec![0xc7; 256],
            g_a: vec![0x42; 256],
            server_time: 1_700_000_000,
        };
        let mut bytes = inner.to_bytes().to_vec();
        let serialized_len = bytes.len();
        bytes.extend_from_slice(&[0u8; 12]);

        let (parsed, consumed) = ServerDhInnerData::parse_prefix(&bytes).unwrap();
        assert_eq!(parsed, inner);
        assert_eq!(consumed, serialized_len);
    }

    #[test]
    fn test_dh_gen_answer_kinds() {
        for kind in [DhGenKind::Ok, DhGenKind::Retry, DhGenKind::Fail] {
            let answer = DhGenAnswer {
                kind,
                nonce: [5; 16],
                server_nonce: [6; 16],
                new_nonce_hash: [7; 16],
            };
            assert_eq!(DhGenAnswer::parse(&answer.to_bytes()).unwrap(), answer);
        }
        assert_eq!(DhGenKind::Retry.hash_number(), 2);
    }

    #[test]
    fn test_container_items_share_buffer() {
        let ack = ServiceMessage::MsgsAck { msg_ids: vec![8, 12] }.to_bytes();
        let result = ServiceMessage::RpcResult {
            req_msg_id: 8,
            result: Bytes::from_static(b"\x01\x02\x03\x04"),
        }
        .to_bytes();
        let container = ServiceMessage::Container(vec![
            ContainerItem {
                msg_id: 101,
                seq_no: 2,
                body: ack.clone(),
            },
            ContainerItem {
                msg_id: 105,
                seq_no: 3,
                body: result.clone(),
            },
        ])
        .to_bytes();

        let ServiceMessage::Container(items) = ServiceMessage::parse(&container).unwrap() else {
            panic!("expected container");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].msg_id, 105);
        assert_eq!(
            ServiceMessage::parse(&items[0].body).unwrap(),
            ServiceMessage::MsgsAck { msg_ids: vec![8, 12] }
        );
        assert_eq!(
            ServiceMessage::parse(&items[1].body).unwrap(),
            ServiceMessage::RpcResult {
                req_msg_id: 8,
                result: Bytes::from_static(b"\x01\x02\x03\x04"),
            }
        );
    }

    #[test]
    fn test_container_item_overrun() {
        let mut w = TlWriter::new();
        w.write_u32(ids::MSG_CONTAINER)
            .write_i32(1)
            .write_u64(4)
            .write_u32(1)
            .write_i32(64)
            .write_u32(0);
        let bytes = w.finish();
        assert!(matches!(
            ServiceMessage::parse(&bytes),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn test_unknown_and_gzip_are_opaque() {
        let unknown = Bytes::from_static(&[0x15, 0xc4, 0xb5, 0x1c, 0, 0, 0, 0]);
        assert_eq!(
            ServiceMessage::parse(&unknown).unwrap(),
            ServiceMessage::Other(unknown.clone())
        );

        let mut w = TlWriter::new();
        w.write_u32(ids::GZIP_PACKED).write_bytes(&[0x1f, 0x8b, 0x08]);
        let gzip = w.finish();
        assert_eq!(
            ServiceMessage::parse(&gzip).unwrap(),
            ServiceMessage::GzipPacked(gzip.clone())
        );
    }

    #[test]
    fn test_content_related() {
        assert!(!ServiceMessage::MsgsAck { msg_ids: vec![] }.is_content_related());
        assert!(ServiceMessage::Ping { ping_id: 1 }.is_content_related());
        assert!(!ServiceMessage::HttpWait {
            max_delay: 0,
            wait_after: 0,
            max_wait: 25000
        }
        .is_content_related());
    }
}
