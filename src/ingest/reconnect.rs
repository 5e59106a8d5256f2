use rand::Rng;
use std::time::{Duration, Instant};

/// How a worker paces reopen attempts for a failing source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive empty reads before the source is closed and reopened.
    pub max_consecutive_misses: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            max_consecutive_misses: 30,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay before the given retry (0-based), capped at max.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// `base_backoff` plus up to 25% jitter, still capped at max.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Per-source retry bookkeeping, owned by one camera worker.
#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    failed_opens: u32,
    misses: u32,
    retry_at: Option<Instant>,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failed_opens: 0,
            misses: 0,
            retry_at: None,
        }
    }

    /// Whether an open attempt is due.
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    /// Record a failed open; returns the delay until the next attempt.
    pub fn open_failed(&mut self, now: Instant) -> Duration {
        let delay = self.policy.backoff(self.failed_opens);
        self.failed_opens = self.failed_opens.saturating_add(1);
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn opened(&mut self) {
        self.failed_opens = 0;
        self.misses = 0;
        self.retry_at = None;
    }

    pub fn frame_received(&mut self) {
        self.misses = 0;
    }

    /// Record an empty read. Returns true once the source should be reopened.
    pub fn missed(&mut self) -> bool {
        self.misses = self.misses.saturating_add(1);
        if self.misses >= self.policy.max_consecutive_misses {
            self.misses = 0;
            true
        } else {
            false
        }
    }

    pub fn failed_opens(&self) -> u32 {
        self.failed_opens
    }
}
