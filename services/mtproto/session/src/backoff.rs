//! Retry backoff for reconnect attempts

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tracks consecutive connection failures and computes retry delays
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Delay after the first failure
    initial: Duration,
    /// Largest delay ever returned
    ceiling: Duration,
    /// Fraction of random jitter, 0.2 means ±20%
    jitter: f64,
    /// Number of consecutive failures
    failures: u32,
    /// Timestamp of first failure in current sequence
    first_failure: Option<Instant>,
    /// Timestamp of last failure
    last_failure: Option<Instant>,
}

impl RetryBackoff {
    /// Create a new backoff tracker
    pub fn new(initial: Duration, ceiling: Duration, jitter: f64) -> Self {
        Self {
            initial,
            ceiling: ceiling.max(initial),
            jitter: jitter.clamp(0.0, 1.0),
            failures: 0,
            first_failure: None,
            last_failure: None,
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        let now = Instant::now();
        self.failures = self.failures.saturating_add(1);
        self.first_failure.get_or_insert(now);
        self.last_failure = Some(now);

        let base = self.base_delay();
        let delay = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            base.mul_f64(factor).min(self.ceiling)
        } else {
            base
        };

        debug!(
            "Recorded connection failure {} (retry in {:?})",
            self.failures, delay
        );
        delay
    }

    /// Record a successful connection; returns whether failures were pending
    pub fn record_success(&mut self) -> bool {
        let had_failures = self.failures > 0;
        if had_failures {
            if let Some(first) = self.first_failure {
                debug!(
                    "Connection recovered after {} failures over {:?}",
                    self.failures,
                    first.elapsed()
                );
            }
        }
        self.failures = 0;
        self.first_failure = None;
        self.last_failure = None;
        had_failures
    }

    /// Current consecutive failure count
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Time since the last recorded failure
    pub fn since_last_failure(&self) -> Option<Duration> {
        self.last_failure.map(|last| last.elapsed())
    }

    fn base_delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}
