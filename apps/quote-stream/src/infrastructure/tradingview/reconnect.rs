//! Reconnect Backoff
//!
//! Exponential backoff with jitter between connection attempts. The delay
//! starts at `initial_delay`, grows by `multiplier` per failed attempt, never
//! exceeds `max_delay` (jitter included), and returns to `initial_delay`
//! after a connection reaches `Connected`.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Randomization as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Backoff state across consecutive failed attempts.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is
    /// exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let base = self.base_delay(self.attempt_count);
        self.attempt_count += 1;
        Some(self.apply_jitter(base))
    }

    /// Forget failed attempts after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Failed attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// `initial * multiplier^attempt`, capped at `max_delay`.
    fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = initial * self.config.multiplier.max(1.0).powi(exponent);
        if scaled.is_finite() {
            Duration::from_secs_f64(scaled.clamp(0.0, max))
        } else {
            self.config.max_delay
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * factor;
        let jitter: f64 = rand::rng().random_range(-spread..=spread);
        let jittered = (delay.as_secs_f64() + jitter).max(0.001);
        Duration::from_secs_f64(jittered).min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            jitter_factor: 0.0,
            max_attempts,
            ..ReconnectConfig::default()
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn doubles_up_to_the_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        let delays: Vec<u64> = (0..7)
            .map(|_| policy.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn max_attempts_stops_retrying() {
        let mut policy = ReconnectPolicy::new(no_jitter(2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn jitter_stays_within_bounds_and_cap() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
            let first = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&first), "{first}ms");

            for _ in 0..10 {
                assert!(policy.next_delay().unwrap() <= Duration::from_secs(30));
            }
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        for _ in 0..5_000 {
            assert!(policy.next_delay().unwrap() <= Duration::from_secs(30));
        }
    }
}
