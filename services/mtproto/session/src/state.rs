//! Connection states and the events a connection emits.

use crate::session_data::{MsgId, RequestId};
use bytes::Bytes;
use std::fmt;

/// Step of the auth key exchange the connection is waiting in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// `req_pq` sent, waiting for `resPQ`
    PqSent,
    /// `req_DH_params` sent, waiting for `Server_DH_Params`
    DhParamsSent,
    /// `set_client_DH_params` sent, waiting for the `dh_gen_*` answer
    DhClientParamsSent,
}

/// Why the last connection attempt was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Socket, HTTP, or connect timeout failure
    Transport,
    /// Undecodable packet or message
    Framing,
    /// Auth key exchange failed
    Handshake,
    /// Server does not know our auth key
    BadAuthKey,
    /// Nothing received for too long while requests were pending
    Stale,
    /// Server sent something the session cannot recover from
    Protocol,
}

/// Classification of failures, used to pick the recovery path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    /// Malformed packet; drop the stream and reconnect
    Framing,
    /// Socket or HTTP failure; retry with backoff
    Transport,
    /// Key exchange violation; discard handshake state and reconnect
    Handshake,
    /// Server does not know the key; drop it and reconnect at once
    BadAuthKey,
    /// Client clock is off; resync time and salt, then resend
    ClockSkew,
    /// Server forgot the session; reset it and resend everything
    SessionExpired,
}

impl ProtocolFault {
    /// Whether recovery tears the connection down
    pub fn restarts_connection(self) -> bool {
        !matches!(self, Self::ClockSkew | Self::SessionExpired)
    }

    /// Failure state reported when the connection is restarted
    pub fn failure_reason(self) -> FailureReason {
        match self {
            Self::Framing => FailureReason::Framing,
            Self::Transport => FailureReason::Transport,
            Self::Handshake => FailureReason::Handshake,
            Self::BadAuthKey => FailureReason::BadAuthKey,
            Self::ClockSkew | Self::SessionExpired => FailureReason::Protocol,
        }
    }
}

/// Observable connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started
    Idle,
    /// Transports are connecting
    Connecting,
    /// Transport is up, creating an auth key
    WaitingForAuthKey(HandshakeStep),
    /// Encrypted session established
    Connected,
    /// Transport closed, waiting to retry
    Disconnected,
    /// Last attempt failed, waiting to retry
    Failed(FailureReason),
    /// Kill requested, reporting undelivered requests
    Finishing,
    /// Worker exited
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::WaitingForAuthKey(step) => write!(f, "waiting for auth key ({:?})", step),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed(reason) => write!(f, "failed ({:?})", reason),
            Self::Finishing => write!(f, "finishing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Events emitted by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// State changed
    StateChanged(ConnectionState),
    /// An RPC result or an update arrived
    DataReceived {
        /// Request the result answers; `None` for updates
        request_id: Option<RequestId>,
        /// Server message id carrying the data
        msg_id: MsgId,
        /// Opaque TL body
        payload: Bytes,
    },
    /// Transport or protocol error
    Error {
        /// Whether the server may have forgotten our auth key
        may_be_bad_key: bool,
    },
    /// Requests still pending when the connection was killed
    NotDelivered(Vec<RequestId>),
    /// Worker finished; nothing follows
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_recovery_paths() {
        assert!(ProtocolFault::Framing.restarts_connection());
        assert!(ProtocolFault::BadAuthKey.restarts_connection());
        assert!(!ProtocolFault::ClockSkew.restarts_connection());
        assert!(!ProtocolFault::SessionExpired.restarts_connection());
        assert_eq!(
            ProtocolFault::Handshake.failure_reason(),
            FailureReason::Handshake
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Failed(FailureReason::Stale).to_string(),
            "failed (Stale)"
        );
    }
}
