//! Exponential backoff for retrying transient backend failures

use std::time::Duration;

use rand::Rng;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Ceiling on the computed delay, in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier applied after each attempt
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Exponential backoff calculator with jitter.
///
/// The first call to [`next_delay`](Self::next_delay) yields the initial
/// delay; each subsequent call multiplies it, capped at the configured
/// maximum.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    next_delay_ms: u64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms;
        Self {
            config,
            next_delay_ms: initial,
            attempt: 0,
        }
    }

    /// Backoff seeded with a retry interval, everything else defaulted.
    pub fn with_initial_delay(initial: Duration) -> Self {
        Self::with_config(BackoffConfig {
            initial_delay_ms: initial.as_millis() as u64,
            ..BackoffConfig::default()
        })
    }

    /// Get the delay to sleep before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let base = self.next_delay_ms as f64;
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay_ms = if self.config.jitter_factor > 0.0 {
            let jitter_range = capped * self.config.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + jitter).max(1.0) as u64
        } else {
            capped.max(1.0) as u64
        };

        let grown = base * self.config.multiplier;
        self.next_delay_ms = grown.min(self.config.max_delay_ms as f64) as u64;

        Duration::from_millis(delay_ms)
    }

    /// Reset to the initial state
    pub fn reset(&mut self) {
        self.next_delay_ms = self.config.initial_delay_ms;
        self.attempt = 0;
    }

    /// Number of delays handed out since construction or reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: u64, max: u64) -> ExponentialBackoff {
        ExponentialBackoff::with_config(BackoffConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_first_delay_is_initial() {
        let mut backoff = no_jitter(500, 10_000);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_delays_grow() {
        let mut backoff = no_jitter(100, 10_000);
        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert!(d2 > d1);
        assert!(d3 > d2);
    }

    #[test]
    fn test_delay_caps_at_max() {
        let mut backoff = no_jitter(1_000, 5_000);
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay().as_millis() <= 5_000);
    }

    #[test]
    fn test_reset() {
        let mut backoff = no_jitter(100, 10_000);
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
