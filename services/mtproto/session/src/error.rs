//! Session error types.

use mtproto_crypto::CryptoError;
use mtproto_wire::WireError;
use thiserror::Error;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered HTTP with a non-success status
    #[error("http status {0}")]
    HttpStatus(u16),

    /// Packet framing failure
    #[error("framing error: {0}")]
    Wire(#[from] WireError),

    /// Server sent a negative transport error code
    #[error("transport error code {0}")]
    ErrorCode(i32),

    /// Connect or probe did not complete in time
    #[error("timed out")]
    Timeout,

    /// Peer closed the connection
    #[error("connection closed")]
    Closed,

    /// Transport is not in a state that can send
    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether the failure suggests the server no longer knows our auth key
    pub fn may_be_bad_key(&self) -> bool {
        matches!(self, Self::ErrorCode(code) if *code == mtproto_wire::BAD_AUTH_KEY_CODE)
            || matches!(self, Self::HttpStatus(404))
    }
}

/// Errors raised by the auth key exchange
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Message arrived in a step that does not expect it
    #[error("unexpected message in step {0}")]
    UnexpectedStep(&'static str),

    /// Echoed nonce differs from ours
    #[error("nonce mismatch")]
    NonceMismatch,

    /// Server nonce differs from the one in resPQ
    #[error("server nonce mismatch")]
    ServerNonceMismatch,

    /// None of the offered fingerprints matches a trusted key
    #[error("no trusted rsa key among fingerprints {0:x?}")]
    NoMatchingKey(Vec<u64>),

    /// SHA-1 prefix of the decrypted DH answer is wrong
    #[error("dh answer hash mismatch")]
    AnswerHashMismatch,

    /// Server rejected req_DH_params
    #[error("server refused dh params")]
    DhParamsFailed,

    /// new_nonce_hash in the final answer is wrong
    #[error("new nonce hash mismatch")]
    NewNonceHashMismatch,

    /// Server reported dh_gen_fail
    #[error("server reported dh_gen_fail")]
    DhGenFailed,

    /// dh_gen_retry was returned too many times
    #[error("too many dh_gen_retry answers ({0})")]
    TooManyRetries(u32),

    /// Cryptographic check failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Malformed handshake message
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errors returned by the connection handle
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// `start` was called on a running connection
    #[error("connection already started")]
    AlreadyStarted,

    /// No endpoints are known for the datacenter
    #[error("unknown datacenter {0}")]
    UnknownDc(i32),

    /// Worker thread could not be spawned
    #[error("failed to spawn connection thread: {0}")]
    Spawn(#[source] std::io::Error),
}
