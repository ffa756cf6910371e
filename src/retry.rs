//! Capped exponential backoff with jitter.
//!
//! The reconciler never sleeps inside a tick, so instead of a blocking retry
//! loop this module tracks *when* the next attempt is allowed. A failed resize
//! pushes the next attempt out by the current delay; a success resets it.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Backoff parameters for substrate calls that failed.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor applied after each consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Tracks consecutive failures and the earliest time the next attempt may run.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
    next_delay: Duration,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next_delay = config.initial_delay;
        Self {
            config,
            failures: 0,
            next_delay,
            retry_at: None,
        }
    }

    /// True when no failure is pending or the backoff window has elapsed.
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    /// Record a retryable failure. Returns the delay until the next attempt.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        // Jitter: 0.5x to 1.5x of the delay, never above the cap
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.next_delay.as_secs_f64() * jitter)
            .min(self.config.max_delay);

        self.failures += 1;
        self.retry_at = Some(now + delay);
        self.next_delay = Duration::from_secs_f64(
            (self.next_delay.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        delay
    }

    /// Record a failure that will not go away by itself (quota, bad spec).
    /// Jumps straight to the capped delay.
    pub fn record_permanent_failure(&mut self, now: Instant) -> Duration {
        self.failures += 1;
        self.next_delay = self.config.max_delay;
        self.retry_at = Some(now + self.config.max_delay);
        self.config.max_delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_delay = self.config.initial_delay;
        self.retry_at = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }

    #[test]
    fn fresh_backoff_is_ready() {
        let backoff = Backoff::new(config());
        assert!(backoff.ready(Instant::now()));
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn failure_defers_next_attempt() {
        let mut backoff = Backoff::new(config());
        let now = Instant::now();
        let delay = backoff.record_failure(now);

        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1500));
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + delay));
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff = Backoff::new(config());
        let now = Instant::now();
        for _ in 0..20 {
            let delay = backoff.record_failure(now);
            assert!(delay <= Duration::from_secs(8));
        }
        assert_eq!(backoff.failures(), 20);
    }

    #[test]
    fn permanent_failure_uses_max_delay() {
        let mut backoff = Backoff::new(config());
        let now = Instant::now();
        assert_eq!(backoff.record_permanent_failure(now), Duration::from_secs(8));
        assert!(!backoff.ready(now + Duration::from_secs(7)));
    }

    #[test]
    fn reset_clears_pending_retry() {
        let mut backoff = Backoff::new(config());
        let now = Instant::now();
        backoff.record_failure(now);
        backoff.reset();
        assert!(backoff.ready(now));
        assert_eq!(backoff.failures(), 0);
    }
}
