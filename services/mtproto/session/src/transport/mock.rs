//! Scripted in-process server for tests.
//!
//! [`HandshakeServer`] plays the server side of the auth key exchange with a
//! throwaway RSA key. [`MockServer`] adds an encrypted session on top that
//! answers pings and state queries and echoes every opaque request back as
//! its `rpc_result`. [`MockBehavior`] scripts the ways it can misbehave.
//! [`MockTransportFactory`] hands the connection manager transports wired
//! straight into a shared [`MockServer`].

use super::{EventSink, Slot, Transport, TransportFactory};
use crate::config::{ConnectionConfig, TransportKind};
use crate::dc::DcEndpoint;
use crate::error::TransportError;
use bytes::Bytes;
use mtproto_crypto::dh::KNOWN_DH_PRIME;
use mtproto_crypto::hash::sha1;
use mtproto_crypto::kdf::{handshake_key_iv, initial_salt, new_nonce_hash};
use mtproto_crypto::rsa::to_fixed_be;
use mtproto_crypto::{
    aes_ige, decrypt_message, encrypt_message, AesKeyIv, AuthKey, Direction, MessageHeader,
    RsaKeyRing, RsaPublicKey, AUTH_KEY_SIZE,
};
use mtproto_wire::{
    auth_key_id, decode_plain, encode_plain, ids, msg_id_at, ClientDhInnerData, ContainerItem,
    DhGenAnswer, DhGenKind, PqInnerData, ReqDhParams, ReqPq, ResPq, ServerDhInnerData,
    ServerDhParams, ServiceMessage, SetClientDhParams, TlReader, BAD_AUTH_KEY_CODE,
};
use num_bigint::BigUint;
use rand::RngCore;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Modulus of the throwaway test key
pub const TEST_RSA_MODULUS: &str = "EB485ECCBB5536CDD63B393D1E39C1D3ABC52D402B123DCB389B9C4A87966EBD\
    980DF45FA19D462B8F20485F21B9338DBE3247E220E8A4EDB3EBBABAF19729752924125AD59B40F31C\
    744766238B0A51EE9A956E635E49A9C74A90636A7D10D5E474A526F8D37CC0B2B2DB6B01ED6C7C0659\
    2884610F6E04D96B6ADE2DCFFA8A472963B14AA82E3CFD43C0FC8061D7F4EA3844B5E19B752748E0C7\
    AE4BD2522D8729E4CAE7FA8544FEA94D99E923BF2C427D2EA312CC7263A9B4153319F221477DDD275A\
    3AEFA278BE4A82748BDCD483215794AC2A8C77DC68B8ED7E01AF9C3FC9F9F7ABCED6C747B0A90E8DCA\
    1169F36D9E61C93E74C6F0D0224C293EF705F5";

/// Private exponent of the throwaway test key
pub const TEST_RSA_PRIVATE_EXPONENT: &str = "1A376DACC560F8E2D5B0B2AF8F3B2350592EF6DC54104BC765AEDD2A\
    E6D1C9D42169C8A591460B881602245E494D3023E6A206A579424302638E6C37A16CD5074386CBEEC827\
    6D04C9D261144DF893B54E6F76201F3D65DADFA47CD33F0DE17EDBDE6D7A9AB6420BDCBD963A65B41566\
    FA741BD22858864B4F08AB9747268A0580B0C54428C63B8F3D167D1C27CFD98F17587F008DAF8DA7B878\
    AA3A6FD450476AB0C1D247ECBC0C10D9B3CC72DAAFDCF84DB68F97731C383190FC966BA54C18D56138AE\
    2B77EAD9988BC2718BA1D9362C3DC998036A7FAEDA5ED04F80CF485233270D6000C54FAFF7414E333B7A\
    343E4CE2205F9F2EF55C81DF6CA500870C61";

/// Fingerprint of the throwaway test key
pub const TEST_RSA_FINGERPRINT: u64 = 0x625bf9195424c8af;

/// Public exponent of the throwaway test key
const TEST_RSA_EXPONENT: u64 = 65537;
/// `pq` challenge, `1229739323 * 1402015859`
const TEST_PQ: u64 = 0x17ED48941A08F981;
/// Generator offered with the known prime
const TEST_G: u32 = 3;
/// Fingerprint of a key nobody has, offered first
const UNKNOWN_FINGERPRINT: u64 = 0xdead;
/// Ping id the server sends with [`MockBehavior::PingClient`]
pub const SERVER_PING_ID: u64 = 0x5eed;
/// Id the server asks about with [`MockBehavior::PingClient`]; older than
/// anything the client received
pub const SERVER_QUERIED_MSG_ID: u64 = (1 << 32) | 1;

fn test_public_key() -> Option<RsaPublicKey> {
    RsaPublicKey::from_hex(TEST_RSA_MODULUS, TEST_RSA_EXPONENT).ok()
}

/// Key ring trusting only the throwaway test key
pub fn test_key_ring() -> RsaKeyRing {
    RsaKeyRing::new(test_public_key().into_iter().collect())
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn hashed_prefix_matches(data: &[u8], consumed: usize) -> bool {
    data.len() >= 20 + consumed && sha1(&[&data[20..20 + consumed]])[..] == data[..20]
}

/// Server side of the auth key exchange
#[derive(Debug)]
pub struct HandshakeServer {
    key: Option<RsaPublicKey>,
    private_exponent: BigUint,
    prime: BigUint,
    retries: u32,
    retries_left: u32,
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    tmp: Option<AesKeyIv>,
    a: BigUint,
    server_time: i32,
    retry_id: u64,
    auth_key: Option<AuthKey>,
}

impl HandshakeServer {
    /// Server answering `dh_gen_ok` at the first attempt
    pub fn new() -> Self {
        Self {
            key: test_public_key(),
            private_exponent: BigUint::parse_bytes(TEST_RSA_PRIVATE_EXPONENT.as_bytes(), 16)
                .unwrap_or_default(),
            prime: BigUint::parse_bytes(KNOWN_DH_PRIME.as_bytes(), 16).unwrap_or_default(),
            retries: 0,
            retries_left: 0,
            nonce: [0; 16],
            server_nonce: [0; 16],
            new_nonce: [0; 32],
            tmp: None,
            a: BigUint::default(),
            server_time: 0,
            retry_id: 0,
            auth_key: None,
        }
    }

    /// Answer `dh_gen_retry` this many times before `dh_gen_ok`
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self.retries_left = retries;
        self
    }

    /// Key agreed in the last completed exchange
    pub fn auth_key(&self) -> Option<&AuthKey> {
        self.auth_key.as_ref()
    }

    /// Salt the client should derive
    pub fn initial_salt(&self) -> u64 {
        initial_salt(&self.new_nonce, &self.server_nonce)
    }

    /// Server time sent in `server_DH_inner_data`
    pub fn server_time(&self) -> i32 {
        self.server_time
    }

    /// Answer a client message body; `None` if it is rejected
    pub fn respond(&mut self, body: &[u8]) -> Option<Bytes> {
        match TlReader::new(body).peek_u32().ok()? {
            ids::REQ_PQ => self.res_pq(body),
            ids::REQ_DH_PARAMS => self.server_dh_params(body),
            ids::SET_CLIENT_DH_PARAMS => self.dh_gen(body),
            other => {
                debug!("Mock server ignoring constructor {:#010x}", other);
                None
            }
        }
    }

    fn res_pq(&mut self, body: &[u8]) -> Option<Bytes> {
        let req = ReqPq::parse(body).ok()?;
        self.retries_left = self.retries;
        self.retry_id = 0;
        self.tmp = None;
        self.auth_key = None;
        self.nonce = req.nonce;
        rand::thread_rng().fill_bytes(&mut self.server_nonce);

        let fingerprints = match &self.key {
            Some(key) => vec![UNKNOWN_FINGERPRINT, key.fingerprint()],
            None => vec![UNKNOWN_FINGERPRINT],
        };
        Some(
            ResPq {
                nonce: self.nonce,
                server_nonce: self.server_nonce,
                pq: TEST_PQ.to_be_bytes().to_vec(),
                fingerprints,
            }
            .to_bytes(),
        )
    }

    fn server_dh_params(&mut self, body: &[u8]) -> Option<Bytes> {
        let req = ReqDhParams::parse(body).ok()?;
        if req.nonce != self.nonce || req.server_nonce != self.server_nonce {
            return None;
        }
        let key = self.key.as_ref()?;
        if req.fingerprint != key.fingerprint() {
            return None;
        }

        let decrypted = BigUint::from_bytes_be(&req.encrypted_data)
            .modpow(&self.private_exponent, key.modulus());
        let data = to_fixed_be(&decrypted, 255);
        let (inner, consumed) = PqInnerData::parse_prefix(&data[20..]).ok()?;
        if !hashed_prefix_matches(&data, consumed) || inner.nonce != self.nonce {
            return None;
        }
        self.new_nonce = inner.new_nonce;

        let mut secret = [0u8; AUTH_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);
        self.a = BigUint::from_bytes_be(&secret);
        let g_a = BigUint::from(TEST_G).modpow(&self.a, &self.prime);
        self.server_time = (unix_now_ms() / 1000) as i32;

        let inner = ServerDhInnerData {
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            g: TEST_G as i32,
            dh_prime: to_fixed_be(&self.prime, AUTH_KEY_SIZE),
            g_a: to_fixed_be(&g_a, AUTH_KEY_SIZE),
            server_time: self.server_time,
        }
        .to_bytes();

        let mut answer = sha1(&[&inner]).to_vec();
        answer.extend_from_slice(&inner);
        let used = answer.len();
        answer.resize(used + (16 - used % 16) % 16, 0);
        rand::thread_rng().fill_bytes(&mut answer[used..]);

        let tmp = handshake_key_iv(&self.new_nonce, &self.server_nonce);
        aes_ige::encrypt(&tmp.key, &tmp.iv, &mut answer).ok()?;
        self.tmp = Some(tmp);

        Some(
            ServerDhParams::Ok {
                nonce: self.nonce,
                server_nonce: self.server_nonce,
                encrypted_answer: answer,
            }
            .to_bytes(),
        )
    }

    fn dh_gen(&mut self, body: &[u8]) -> Option<Bytes> {
        let req = SetClientDhParams::parse(body).ok()?;
        if req.nonce != self.nonce || req.server_nonce != self.server_nonce {
            return None;
        }
        let tmp = self.tmp.as_ref()?;
        let mut data = req.encrypted_data;
        aes_ige::decrypt(&tmp.key, &tmp.iv, &mut data).ok()?;
        if data.len() < 20 {
            return None;
        }
        let (inner, consumed) = ClientDhInnerData::parse_prefix(&data[20..]).ok()?;
        if !hashed_prefix_matches(&data, consumed) || inner.retry_id != self.retry_id {
            return None;
        }

        let shared = BigUint::from_bytes_be(&inner.g_b).modpow(&self.a, &self.prime);
        let mut raw = [0u8; AUTH_KEY_SIZE];
        raw.copy_from_slice(&to_fixed_be(&shared, AUTH_KEY_SIZE));
        let auth_key = AuthKey::new(raw);

        let kind = if self.retries_left > 0 {
            self.retries_left -= 1;
            self.retry_id = auth_key.aux_hash();
            DhGenKind::Retry
        } else {
            DhGenKind::Ok
        };
        let hash = new_nonce_hash(&self.new_nonce, kind.hash_number(), auth_key.aux_hash());
        if kind == DhGenKind::Ok {
            self.auth_key = Some(auth_key);
        }

        Some(
            DhGenAnswer {
                kind,
                nonce: self.nonce,
                server_nonce: self.server_nonce,
                new_nonce_hash: hash,
            }
            .to_bytes(),
        )
    }
}

impl Default for HandshakeServer {
    fn default() -> Self {
        Self::new()
    }
}

/// How a [`MockServer`] misbehaves
///
/// Behaviors that lose, reject, or fail something do it once; the server
/// behaves normally afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Answer everything
    #[default]
    Normal,
    /// Answer `req_pq`, then go silent
    StallAfterPq,
    /// Answer the first encrypted packet with -404 and forget the key
    RejectKeyOnce,
    /// Lose the first encrypted packet and close the connection
    DropFirstEncrypted,
    /// Ignore the first request without a trace
    SwallowFirstRequest,
    /// Reject the first request with `bad_msg_notification` and this code
    BadMsgOnce(i32),
    /// Reject the first request with `bad_server_salt` carrying this salt
    BadSaltOnce(u64),
    /// Announce each new session with `new_session_created` carrying this salt
    AnnounceSessions(u64),
    /// Send a ping and a state query along with the first result
    PingClient,
    /// Never answer pings
    IgnorePings,
    /// Fail this many connection attempts
    FailConnects(u32),
    /// Never connect IPv4 transports
    SlowIpv4,
}

/// Scripted server with an encrypted session
#[derive(Debug)]
pub struct MockServer {
    behavior: MockBehavior,
    handshake: HandshakeServer,
    auth_key: Option<AuthKey>,
    salt: u64,
    last_msg_id: u64,
    seq_no: u32,
    requests: Vec<Bytes>,
    handshakes: usize,
    pings: usize,
    seen: BTreeSet<u64>,
    session_ids: Vec<u64>,
    salts: Vec<u64>,
    state_queries: usize,
    client_pongs: Vec<u64>,
    client_state_infos: Vec<Bytes>,
}

impl MockServer {
    /// Create a server
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            handshake: HandshakeServer::new(),
            auth_key: None,
            salt: 0,
            last_msg_id: 0,
            seq_no: 0,
            requests: Vec::new(),
            handshakes: 0,
            pings: 0,
            seen: BTreeSet::new(),
            session_ids: Vec::new(),
            salts: Vec::new(),
            state_queries: 0,
            client_pongs: Vec::new(),
            client_state_infos: Vec::new(),
        }
    }

    /// Share an already negotiated key with the client
    pub fn install_key(&mut self, auth_key: AuthKey, salt: u64) {
        self.auth_key = Some(auth_key);
        self.salt = salt;
        self.seq_no = 0;
    }

    /// Opaque request bodies received so far
    pub fn requests(&self) -> &[Bytes] {
        &self.requests
    }

    /// Number of completed key exchanges
    pub fn completed_handshakes(&self) -> usize {
        self.handshakes
    }

    /// Number of pings answered
    pub fn pings(&self) -> usize {
        self.pings
    }

    /// Client session ids in the order they first appeared
    pub fn session_ids(&self) -> &[u64] {
        &self.session_ids
    }

    /// Salt of every encrypted packet received
    pub fn salts(&self) -> &[u64] {
        &self.salts
    }

    /// Number of `msgs_state_req` answered
    pub fn state_queries(&self) -> usize {
        self.state_queries
    }

    /// Ping ids the client answered with `pong`
    pub fn client_pongs(&self) -> &[u64] {
        &self.client_pongs
    }

    /// `msgs_state_info` bodies the client sent
    pub fn client_state_infos(&self) -> &[Bytes] {
        &self.client_state_infos
    }

    /// Whether the transport should lose `payload` and close
    fn take_drop(&mut self, payload: &Bytes) -> bool {
        if self.behavior == MockBehavior::DropFirstEncrypted && auth_key_id(payload) != Some(0) {
            self.behavior = MockBehavior::Normal;
            return true;
        }
        false
    }

    /// Whether the next connection attempt should fail
    fn take_connect_failure(&mut self) -> bool {
        match self.behavior {
            MockBehavior::FailConnects(0) => {
                self.behavior = MockBehavior::Normal;
                false
            }
            MockBehavior::FailConnects(left) => {
                self.behavior = if left > 1 {
                    MockBehavior::FailConnects(left - 1)
                } else {
                    MockBehavior::Normal
                };
                true
            }
            _ => false,
        }
    }

    /// Current session key
    pub fn auth_key(&self) -> Option<&AuthKey> {
        self.auth_key.as_ref()
    }

    /// Answer one packet payload
    pub fn handle(&mut self, payload: &Bytes) -> Option<Bytes> {
        if auth_key_id(payload) == Some(0) {
            self.handle_plain(payload)
        } else {
            self.handle_encrypted(payload)
        }
    }

    fn next_msg_id(&mut self) -> u64 {
        let mut msg_id = msg_id_at(unix_now_ms()) | 1;
        if msg_id <= self.last_msg_id {
            msg_id = self.last_msg_id + 4;
        }
        self.last_msg_id = msg_id;
        msg_id
    }

    fn next_seq_no(&mut self, content_related: bool) -> u32 {
        let seq_no = self.seq_no * 2 + u32::from(content_related);
        if content_related {
            self.seq_no += 1;
        }
        seq_no
    }

    fn handle_plain(&mut self, payload: &Bytes) -> Option<Bytes> {
        let message = decode_plain(payload).ok()?;
        if self.behavior == MockBehavior::StallAfterPq && ReqPq::parse(&message.body).is_err() {
            return None;
        }
        let answer = self.handshake.respond(&message.body)?;
        if let Some(key) = self.handshake.auth_key() {
            if self.auth_key.as_ref() != Some(key) {
                self.auth_key = Some(key.clone());
                self.salt = self.handshake.initial_salt();
                self.seq_no = 0;
                self.handshakes += 1;
            }
        }
        let msg_id = self.next_msg_id();
        Some(encode_plain(msg_id, &answer))
    }

    fn handle_encrypted(&mut self, payload: &Bytes) -> Option<Bytes> {
        let bad_key = Bytes::copy_from_slice(&BAD_AUTH_KEY_CODE.to_le_bytes());
        let Some(key) = self.auth_key.clone() else {
            return Some(bad_key);
        };
        if self.behavior == MockBehavior::RejectKeyOnce {
            self.behavior = MockBehavior::Normal;
            self.auth_key = None;
            return Some(bad_key);
        }
        let Ok(message) = decrypt_message(&key, payload, Direction::ClientToServer) else {
            return Some(bad_key);
        };

        let session_id = message.header.session_id;
        self.salts.push(message.header.salt);
        let mut replies = Vec::new();
        if !self.session_ids.contains(&session_id) {
            self.session_ids.push(session_id);
            if let MockBehavior::AnnounceSessions(salt) = self.behavior {
                self.salt = salt;
                replies.push(ServiceMessage::NewSessionCreated {
                    first_msg_id: message.header.msg_id,
                    unique_id: rand::random(),
                    server_salt: salt,
                });
            }
        }

        let items = match ServiceMessage::parse(&message.body) {
            Ok(ServiceMessage::Container(items)) => {
                self.seen.insert(message.header.msg_id);
                items
            }
            _ => vec![ContainerItem {
                msg_id: message.header.msg_id,
                seq_no: message.header.seq_no,
                body: message.body.clone(),
            }],
        };

        let mut acks = Vec::new();
        for item in items {
            let parsed = ServiceMessage::parse(&item.body);
            if let Ok(ServiceMessage::Other(_)) = &parsed {
                if let Some(reply) = self.reject_request(&item) {
                    replies.extend(reply);
                    continue;
                }
            }
            self.seen.insert(item.msg_id);

            match parsed {
                Ok(
                    ServiceMessage::Ping { ping_id }
                    | ServiceMessage::PingDelayDisconnect { ping_id, .. },
                ) => {
                    if self.behavior == MockBehavior::IgnorePings {
                        continue;
                    }
                    self.pings += 1;
                    replies.push(ServiceMessage::Pong {
                        msg_id: item.msg_id,
                        ping_id,
                    });
                }
                Ok(ServiceMessage::MsgsStateReq { msg_ids }) => {
                    self.state_queries += 1;
                    let info: Vec<u8> = msg_ids
                        .iter()
                        .map(|id| if self.seen.contains(id) { 4 | 8 } else { 2 })
                        .collect();
                    replies.push(ServiceMessage::MsgsStateInfo {
                        req_msg_id: item.msg_id,
                        info: Bytes::from(info),
                    });
                }
                Ok(ServiceMessage::Pong { ping_id, .. }) => {
                    self.client_pongs.push(ping_id);
                    acks.push(item.msg_id);
                }
                Ok(ServiceMessage::MsgsStateInfo { info, .. }) => {
                    self.client_state_infos.push(info);
                    acks.push(item.msg_id);
                }
                Ok(ServiceMessage::Other(body)) => {
                    self.requests.push(body.clone());
                    acks.push(item.msg_id);
                    replies.push(ServiceMessage::RpcResult {
                        req_msg_id: item.msg_id,
                        result: body,
                    });
                    if self.behavior == MockBehavior::PingClient {
                        self.behavior = MockBehavior::Normal;
                        replies.push(ServiceMessage::Ping {
                            ping_id: SERVER_PING_ID,
                        });
                        replies.push(ServiceMessage::MsgsStateReq {
                            msg_ids: vec![SERVER_QUERIED_MSG_ID],
                        });
                    }
                }
                _ => {}
            }
        }
        if !acks.is_empty() {
            replies.insert(0, ServiceMessage::MsgsAck { msg_ids: acks });
        }
        self.seal(&key, session_id, replies)
    }

    /// Replies standing in for a request the script rejects; `Some(empty)`
    /// swallows it
    fn reject_request(&mut self, item: &ContainerItem) -> Option<Vec<ServiceMessage>> {
        let reply = match self.behavior {
            MockBehavior::SwallowFirstRequest => Vec::new(),
            MockBehavior::BadMsgOnce(error_code) => vec![ServiceMessage::BadMsgNotification {
                bad_msg_id: item.msg_id,
                bad_msg_seqno: item.seq_no as i32,
                error_code,
            }],
            MockBehavior::BadSaltOnce(new_server_salt) => {
                self.salt = new_server_salt;
                vec![ServiceMessage::BadServerSalt {
                    bad_msg_id: item.msg_id,
                    bad_msg_seqno: item.seq_no as i32,
                    error_code: 48,
                    new_server_salt,
                }]
            }
            _ => return None,
        };
        self.behavior = MockBehavior::Normal;
        Some(reply)
    }

    fn seal(&mut self, key: &AuthKey, session_id: u64, mut replies: Vec<ServiceMessage>) -> Option<Bytes> {
        let (body, content_related) = match replies.len() {
            0 => return None,
            1 => {
                let reply = replies.pop()?;
                (reply.to_bytes(), reply.is_content_related())
            }
            _ => {
                let mut items = Vec::with_capacity(replies.len());
                for reply in &replies {
                    let msg_id = self.next_msg_id();
                    let seq_no = self.next_seq_no(reply.is_content_related());
                    items.push(ContainerItem {
                        msg_id,
                        seq_no,
                        body: reply.to_bytes(),
                    });
                }
                (ServiceMessage::Container(items).to_bytes(), false)
            }
        };
        let header = MessageHeader {
            salt: self.salt,
            session_id,
            msg_id: self.next_msg_id(),
            seq_no: self.next_seq_no(content_related),
        };
        encrypt_message(key, &header, &body, Direction::ServerToClient).ok()
    }
}

/// Creates transports connected to one shared [`MockServer`]
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    server: Arc<Mutex<MockServer>>,
}

impl MockTransportFactory {
    /// Factory with a fresh server
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            server: Arc::new(Mutex::new(MockServer::new(behavior))),
        }
    }

    /// Factory whose server already shares `auth_key` with the client
    pub fn with_auth_key(behavior: MockBehavior, auth_key: AuthKey, salt: u64) -> Self {
        let factory = Self::new(behavior);
        factory.server().install_key(auth_key, salt);
        factory
    }

    /// Lock the shared server
    pub fn server(&self) -> MutexGuard<'_, MockServer> {
        self.server.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        _kind: TransportKind,
        _config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(MockTransport {
            server: self.server.clone(),
            sink,
            connected: false,
        }))
    }
}

/// Transport answering synchronously from a [`MockServer`]
struct MockTransport {
    server: Arc<Mutex<MockServer>>,
    sink: EventSink,
    connected: bool,
}

impl MockTransport {
    fn server(&self) -> MutexGuard<'_, MockServer> {
        self.server.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for MockTransport {
    fn connect_tcp(&mut self, _endpoint: &DcEndpoint) {
        if self.connected {
            return;
        }
        let (fail, stall) = {
            let mut server = self.server();
            let stall = server.behavior == MockBehavior::SlowIpv4 && self.sink.slot() == Slot::V4;
            (!stall && server.take_connect_failure(), stall)
        };
        if fail {
            self.sink.error(false);
        } else if !stall {
            self.connected = true;
            self.sink.connected();
        }
    }

    fn connect_http(&mut self, endpoint: &DcEndpoint) {
        self.connect_tcp(endpoint);
    }

    fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let answer = {
            let mut server = self.server();
            if server.take_drop(&payload) {
                drop(server);
                self.connected = false;
                self.sink.disconnected();
                return Ok(());
            }
            server.handle(&payload)
        };
        if let Some(answer) = answer {
            self.sink.received(answer);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn name(&self) -> String {
        match self.sink.slot() {
            Slot::V4 => "Mock".to_string(),
            Slot::V6 => "Mock6".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEventKind;
    use tokio::sync::mpsc;

    #[test]
    fn test_key_ring_has_test_key() {
        let ring = test_key_ring();
        assert_eq!(ring.len(), 1);
        assert!(ring.find(&[TEST_RSA_FINGERPRINT]).is_some());
    }

    #[test]
    fn test_server_ignores_garbage() {
        let mut server = HandshakeServer::new();
        assert!(server.respond(&[1, 2, 3, 4, 5, 6, 7, 8]).is_none());
        assert!(server.respond(&[]).is_none());
    }

    #[test]
    fn test_unknown_key_gets_bad_key_code() {
        let mut server = MockServer::new(MockBehavior::Normal);
        let payload = Bytes::from(vec![0x11u8; 64]);
        let answer = server.handle(&payload).unwrap();
        assert_eq!(answer.as_ref(), &BAD_AUTH_KEY_CODE.to_le_bytes());
    }

    #[tokio::test]
    async fn test_transport_needs_connect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = MockTransportFactory::new(MockBehavior::Normal);
        let mut transport = factory
            .create(TransportKind::Tcp, &ConnectionConfig::default(), EventSink::new(Slot::V4, 2, tx))
            .unwrap();
        assert!(matches!(
            transport.send(Bytes::from_static(b"x")),
            Err(TransportError::NotConnected)
        ));

        let endpoint = DcEndpoint {
            address: "127.0.0.1".to_string(),
            port: 443,
            flags: Default::default(),
        };
        transport.connect_tcp(&endpoint);
        transport.connect_http(&endpoint);
        assert_eq!(rx.recv().await.unwrap().kind, TransportEventKind::Connected);
        assert!(rx.try_recv().is_err());
        assert!(transport.is_connected());
        assert_eq!(transport.name(), "Mock");

        // answer to an unknown key is the -404 code
        transport.send(Bytes::from(vec![0x22u8; 64])).unwrap();
        match rx.recv().await.unwrap().kind {
            TransportEventKind::Received(payload) => {
                assert_eq!(payload.as_ref(), &BAD_AUTH_KEY_CODE.to_le_bytes())
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
