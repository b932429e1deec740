//! Keepalive with `ping_delay_disconnect`/`pong` and RTT measurement.
//!
//! Pings carry ids derived from monotonic time, so they never repeat
//! within a process. Outstanding pings are tracked until the matching
//! pong arrives or they age out. Send times use tokio's clock, the same one
//! the connection manager's timers run on.

use bytes::Bytes;
use mtproto_wire::ServiceMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Pings older than this are forgotten
const OUTSTANDING_LIFETIME: Duration = Duration::from_secs(60);

/// Build a `ping_delay_disconnect` body
pub fn build_ping(ping_id: u64, disconnect_delay: Duration) -> Bytes {
    ServiceMessage::PingDelayDisconnect {
        ping_id,
        disconnect_delay: disconnect_delay.as_secs().min(i32::MAX as u64) as i32,
    }
    .to_bytes()
}

/// Build a `pong` answering a server ping
pub fn build_pong(msg_id: u64, ping_id: u64) -> Bytes {
    ServiceMessage::Pong { msg_id, ping_id }.to_bytes()
}

/// Generate a ping id based on monotonic time
pub fn next_ping_id() -> u64 {
    static START: once_cell::sync::Lazy<std::time::Instant> =
        once_cell::sync::Lazy::new(std::time::Instant::now);
    static LAST: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    let elapsed_ns = (START.elapsed().as_nanos() & 0xFFFF_FFFF_FFFF_FFFF) as u64;
    let previous = LAST.fetch_max(elapsed_ns, std::sync::atomic::Ordering::Relaxed);
    if elapsed_ns > previous {
        elapsed_ns
    } else {
        LAST.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }
}

/// Outstanding pings and their send times
#[derive(Debug, Default)]
pub struct KeepaliveState {
    outstanding: HashMap<u64, Instant>,
}

impl KeepaliveState {
    /// Record a ping being sent
    pub fn record_ping(&mut self, ping_id: u64) {
        let now = Instant::now();
        self.outstanding.insert(ping_id, now);

        if let Some(cutoff) = now.checked_sub(OUTSTANDING_LIFETIME) {
            self.outstanding.retain(|_, &mut time| time > cutoff);
        }
    }

    /// Process a pong and return the RTT if the ping was ours
    pub fn process_pong(&mut self, ping_id: u64) -> Option<Duration> {
        self.outstanding
            .remove(&ping_id)
            .map(|send_time| send_time.elapsed())
    }

    /// Whether some ping has gone unanswered for longer than `timeout`
    pub fn overdue(&self, timeout: Duration) -> bool {
        self.outstanding
            .values()
            .any(|send_time| send_time.elapsed() > timeout)
    }

    /// Number of unanswered pings
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Forget every outstanding ping
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtproto_wire::ids;

    #[test]
    fn test_ping_pong_bodies() {
        let ping = build_ping(0x1122, Duration::from_secs(75));
        match ServiceMessage::parse(&ping).unwrap() {
            ServiceMessage::PingDelayDisconnect {
                ping_id,
                disconnect_delay,
            } => {
                assert_eq!(ping_id, 0x1122);
                assert_eq!(disconnect_delay, 75);
            }
            other => panic!("unexpected {:?}", other),
        }

        let pong = build_pong(7, 9);
        assert_eq!(&pong[..4], &ids::PONG.to_le_bytes());
    }

    #[test]
    fn test_ping_ids_increase() {
        let id1 = next_ping_id();
        let id2 = next_ping_id();
        let id3 = next_ping_id();
        assert!(id2 > id1);
        assert!(id3 > id2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_tracking() {
        let mut state = KeepaliveState::default();
        state.record_ping(42);
        assert_eq!(state.outstanding(), 1);
        tokio::time::advance(Duration::from_millis(5)).await;

        assert!(state.overdue(Duration::from_millis(1)));
        assert!(!state.overdue(Duration::from_secs(10)));

        let rtt = state.process_pong(42).unwrap();
        assert_eq!(rtt, Duration::from_millis(5));
        assert!(state.process_pong(42).is_none());
        assert!(!state.overdue(Duration::from_millis(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_pings_are_forgotten() {
        let mut state = KeepaliveState::default();
        state.record_ping(1);
        tokio::time::advance(OUTSTANDING_LIFETIME + Duration::from_secs(1)).await;
        state.record_ping(2);
        assert_eq!(state.outstanding(), 1);
        assert!(state.process_pong(1).is_none());
        assert!(!state.overdue(Duration::from_secs(1)));

        state.clear();
        assert_eq!(state.outstanding(), 0);
    }
}
