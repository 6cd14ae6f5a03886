//! Retry delay policy for failed uploads
//!
//! A backoff is a counter plus a formula. It never limits the number of
//! attempts; the uploader retries until it gets a non-retryable answer.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    default_base_delay_ms, default_max_delay_ms, default_multiplier, BackoffConfig,
};

/// Successive retry delays for one upload run
pub trait Backoff: Send {
    /// Delay before the next attempt. Never smaller than the previous value
    /// returned since the last reset.
    fn next_delay(&mut self) -> Duration;

    /// Start over from the initial delay
    fn reset(&mut self);
}

/// Builds a fresh backoff for each upload run
pub type BackoffFactory = Arc<dyn Fn() -> Box<dyn Backoff> + Send + Sync>;

/// `base * multiplier^attempt`, capped, plus optional jitter in `[0, delay)`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    jitter: bool,
    attempt: u32,
    previous: Duration,
}

impl ExponentialBackoff {
    /// Build from configuration, replacing unusable values with defaults
    pub fn from_config(config: &BackoffConfig) -> Self {
        let base_ms = if config.base_delay_ms == 0 {
            tracing::warn!(
                base_delay_ms = config.base_delay_ms,
                "Invalid backoff base delay, using default"
            );
            default_base_delay_ms()
        } else {
            config.base_delay_ms
        };

        let multiplier = if config.multiplier.is_finite() && config.multiplier >= 1.0 {
            config.multiplier
        } else {
            tracing::warn!(
                multiplier = config.multiplier,
                "Invalid backoff multiplier, using default"
            );
            default_multiplier()
        };

        let max_ms = if config.max_delay_ms == 0 {
            default_max_delay_ms()
        } else {
            config.max_delay_ms
        };

        Self::new(
            Duration::from_millis(base_ms),
            multiplier,
            Duration::from_millis(max_ms.max(base_ms)),
            config.jitter,
        )
    }

    pub fn new(base: Duration, multiplier: f64, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            multiplier,
            max,
            jitter,
            attempt: 0,
            previous: Duration::ZERO,
        }
    }

    /// A factory producing backoffs with this configuration
    pub fn factory(config: &BackoffConfig) -> BackoffFactory {
        let template = Self::from_config(config);
        Arc::new(move || Box::new(template.clone()) as Box<dyn Backoff>)
    }

    fn raw_delay(&self) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let exp_ms = self.base.as_millis() as f64 * self.multiplier.powf(self.attempt as f64);
        if !exp_ms.is_finite() || exp_ms >= max_ms {
            self.max
        } else {
            Duration::from_millis(exp_ms as u64)
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let raw = self.raw_delay();
        let jittered = if self.jitter && raw.as_millis() > 0 {
            let extra = fastrand::u64(0..raw.as_millis() as u64);
            raw + Duration::from_millis(extra)
        } else {
            raw
        };

        let delay = jittered.min(self.max).max(self.previous);
        self.previous = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
        self.previous = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(base_ms),
            2.0,
            Duration::from_millis(max_ms),
            false,
        )
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let mut backoff = no_jitter(100, 1_000);
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = no_jitter(100, 1_000);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_monotonic_and_capped() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(50),
            2.0,
            Duration::from_millis(5_000),
            true,
        );
        let mut previous = Duration::ZERO;
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(5_000));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(5_000));
    }

    #[test]
    fn test_unbounded_calls_do_not_overflow() {
        let mut backoff = no_jitter(3_000, 1_800_000);
        for _ in 0..10_000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_800_000));
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let config = BackoffConfig {
            base_delay_ms: 0,
            multiplier: 0.5,
            max_delay_ms: 0,
            jitter: false,
        };
        let mut backoff = ExponentialBackoff::from_config(&config);
        assert_eq!(backoff.next_delay(), Duration::from_millis(3_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(6_000));
    }
}
