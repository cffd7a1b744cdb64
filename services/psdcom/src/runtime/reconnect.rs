//! Reconnection backoff
//!
//! Exponential backoff with jitter for sessions that failed to open or lost
//! their connection. Attempts are unlimited; the delay is capped.

use std::time::Duration;

use rand::Rng;

/// Floor applied to every delay so a faulted session never busy-loops
pub const MIN_DELAY: Duration = Duration::from_millis(50);

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_config(
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter: bool,
    ) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            backoff_multiplier,
            jitter,
        }
    }
}

/// Per-session backoff state
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Failed attempts since the last success
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget failures after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt; counts one more failure
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.policy.backoff_multiplier.max(1.0);
        let exponent = attempt.min(32) as i32;

        // Exponential backoff: delay = initial_delay * (multiplier ^ attempt)
        let base_ms = self.policy.initial_delay.as_millis() as f64 * multiplier.powi(exponent);
        let max_ms = self.policy.max_delay.max(MIN_DELAY).as_millis() as f64;
        let mut delay_ms = base_ms.min(max_ms);

        // Add jitter (±25% of delay)
        if self.policy.jitter && delay_ms > 0.0 {
            let range = delay_ms * 0.25;
            delay_ms += rand::thread_rng().gen_range(-range..range);
        }

        Duration::from_millis(delay_ms.max(0.0) as u64).max(MIN_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let mut backoff = Backoff::new(policy(false));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempts(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(policy(true));
        for _ in 0..50 {
            backoff.reset();
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(75) && d <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_zero_delay_never_busy_loops() {
        let mut backoff = Backoff::new(ReconnectPolicy::from_config(0, 0, 0.0, false));
        for _ in 0..3 {
            assert_eq!(backoff.next_delay(), MIN_DELAY);
        }
    }
}
