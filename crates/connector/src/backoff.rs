//! Backoff policies
//!
//! `ReconnectPolicy` paces feed reconnects (exponential, jittered, reset after
//! a sustained connection). `retry_delay` paces batch write retries.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions (0.2 = ±20%)
    pub jitter_factor: f64,
    /// Connected time after which the delay resets to `initial_delay`
    pub reset_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.2,
            reset_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    /// Last jittered delay handed out; the next is never shorter
    last_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            last_delay: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Un-jittered delay for the next attempt, then advance the schedule
    pub fn next_base_delay(&mut self) -> Duration {
        self.attempts += 1;
        let delay = self.current_delay;
        let scaled = self.current_delay.as_secs_f64() * self.config.multiplier;
        let next = if scaled.is_finite() && scaled > 0.0 {
            Duration::from_secs_f64(scaled.min(self.config.max_delay.as_secs_f64()))
        } else {
            self.config.max_delay
        };
        self.current_delay = next.min(self.config.max_delay);
        delay
    }

    /// Jittered delay for the next attempt, never above `max_delay` and
    /// never below the previous delay until the next reset
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base_delay();
        let delay = self
            .apply_jitter(base)
            .max(self.last_delay)
            .min(self.config.max_delay);
        self.last_delay = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.last_delay = Duration::ZERO;
        self.attempts = 0;
    }

    /// Reset once a connection has been up for `reset_after`
    pub fn observe_connected_for(&mut self, connected: Duration) -> bool {
        if self.attempts > 0 && connected >= self.config.reset_after {
            self.reset();
            return true;
        }
        false
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }
        let base = duration.as_secs_f64();
        let range = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((base + jitter).max(0.001))
    }
}

/// `base * 2^(attempt-1)`, capped at `max`. `attempt` starts at 1.
pub fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            reset_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_delays_non_decreasing_up_to_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_reset_after_sustained_connection() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        policy.next_delay();
        policy.next_delay();
        assert!(!policy.observe_connected_for(Duration::from_secs(59)));
        assert_eq!(policy.next_delay(), Duration::from_secs(4));
        assert!(policy.observe_connected_for(Duration::from_secs(60)));
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.2,
            ..no_jitter()
        });
        for _ in 0..20 {
            policy.reset();
            let d = policy.next_delay();
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        for _ in 0..10 {
            assert!(policy.next_delay() <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_jittered_delays_never_decrease_at_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.2,
            ..no_jitter()
        });
        let delays: Vec<Duration> = (0..30).map(|_| policy.next_delay()).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert!(delays[29] >= Duration::from_secs(8));

        policy.reset();
        assert!(policy.next_delay() <= Duration::from_millis(1200));
    }

    #[test]
    fn test_retry_delay() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(retry_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(base, max, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(base, max, 10), max);
        assert_eq!(retry_delay(base, max, 100), max);
    }
}
