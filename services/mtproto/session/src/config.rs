//! Connection configuration.

use mtproto_crypto::RsaKeyRing;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which transport a connection uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Framed TCP
    Tcp,
    /// HTTP POST long polling
    Http,
    /// Race TCP against HTTP and keep the winner
    #[default]
    Auto,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Http => write!(f, "http"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Configuration for a connection to one datacenter
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Transport to use
    pub transport: TransportKind,
    /// Also try the IPv6 endpoint
    pub try_ipv6: bool,
    /// Keys trusted for the auth key exchange
    pub rsa_keys: RsaKeyRing,
    /// Interval between pings while connected
    pub ping_interval: Duration,
    /// Delay the server waits before dropping an idle connection
    pub ping_disconnect_delay: Duration,
    /// A ping unanswered for this long marks the connection stale
    pub ping_timeout: Duration,
    /// Initial connect timeout
    pub connect_timeout: Duration,
    /// Connect timeout ceiling after doubling
    pub max_connect_timeout: Duration,
    /// Initial wait for any data after sending
    pub wait_received: Duration,
    /// Ceiling of the receive wait after doubling
    pub max_wait_received: Duration,
    /// Silence with outstanding requests after which the connection is restarted
    pub old_connection_timeout: Duration,
    /// How often the silence check runs
    pub old_connection_check: Duration,
    /// Unacknowledged requests older than this are asked about with `msgs_state_req`
    pub state_query_after: Duration,
    /// How often sent requests are checked for a state query
    pub state_check_interval: Duration,
    /// First retry delay after a failure
    pub retry_initial: Duration,
    /// Retry delay ceiling
    pub retry_ceiling: Duration,
    /// Fraction of random jitter applied to retry delays
    pub retry_jitter: f64,
    /// Time to wait for IPv4 after IPv6 connected first
    pub ipv4_grace: Duration,
    /// Time HTTP keeps waiting for TCP after winning the race
    pub http_grace: Duration,
    /// Time after which an undecided race fails
    pub race_timeout: Duration,
    /// Timeout for a TCP connect plus probe
    pub tcp_timeout: Duration,
    /// Timeout for a single HTTP request
    pub http_timeout: Duration,
    /// Longest server hold requested by http_wait
    pub http_wait_max: Duration,
    /// Concurrent HTTP requests
    pub max_http_requests: usize,
    /// Largest accepted transport packet
    pub max_packet_size: usize,
    /// Largest serialized container
    pub max_container_bytes: usize,
    /// Most messages in one container
    pub max_container_messages: usize,
    /// dh_gen_retry answers accepted before failing the exchange
    pub handshake_retries: u32,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Auto,
            try_ipv6: false,
            rsa_keys: RsaKeyRing::default(),
            ping_interval: Duration::from_secs(30),
            ping_disconnect_delay: Duration::from_secs(75),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(8),
            max_connect_timeout: Duration::from_secs(64),
            wait_received: Duration::from_secs(4),
            max_wait_received: Duration::from_secs(64),
            old_connection_timeout: Duration::from_secs(192),
            old_connection_check: Duration::from_secs(10),
            state_query_after: Duration::from_secs(10),
            state_check_interval: Duration::from_secs(1),
            retry_initial: Duration::from_secs(1),
            retry_ceiling: Duration::from_secs(30),
            retry_jitter: 0.2,
            ipv4_grace: Duration::from_secs(1),
            http_grace: Duration::from_secs(2),
            race_timeout: Duration::from_secs(10),
            tcp_timeout: Duration::from_secs(8),
            http_timeout: Duration::from_secs(40),
            http_wait_max: Duration::from_secs(25),
            max_http_requests: 4,
            max_packet_size: mtproto_wire::DEFAULT_MAX_PACKET_SIZE,
            max_container_bytes: 64 * 1024,
            max_container_messages: 1020,
            handshake_retries: 5,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("auto".parse::<TransportKind>().unwrap(), TransportKind::Auto);
        assert!("udp".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Http.to_string(), "http");
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.transport, TransportKind::Auto);
        assert!(config.ping_timeout < config.ping_interval);
        assert!(config.state_check_interval < config.state_query_after);
        assert!(config.rsa_keys.is_empty());
        assert_eq!(config.max_container_messages, 1020);
    }
}
