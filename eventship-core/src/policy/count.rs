//! Count-based flush policy

use crate::config::default_flush_at;

const MIN_FLUSH_AT: u32 = 1;
const MAX_FLUSH_AT: u32 = 100;

/// Flush once `threshold` events have been stored since the last flush
#[derive(Debug, Clone)]
pub struct CountFlushPolicy {
    threshold: u32,
    count: u32,
}

impl CountFlushPolicy {
    /// Thresholds outside `1..=100` fall back to the default of 30
    pub fn new(flush_at: u32) -> Self {
        let threshold = if (MIN_FLUSH_AT..=MAX_FLUSH_AT).contains(&flush_at) {
            flush_at
        } else {
            tracing::warn!(
                flush_at,
                default = default_flush_at(),
                "Flush count out of range, using default"
            );
            default_flush_at()
        };
        Self {
            threshold,
            count: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn should_flush(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn update_state(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for CountFlushPolicy {
    fn default() -> Self {
        Self::new(default_flush_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flushes_every_threshold_events() {
        let mut policy = CountFlushPolicy::default();
        for round in 0..3 {
            for n in 1..30 {
                policy.update_state();
                assert!(!policy.should_flush(), "round {round}, event {n}");
            }
            policy.update_state();
            assert!(policy.should_flush(), "round {round}, event 30");
            policy.reset();
            assert!(!policy.should_flush());
        }
    }

    #[test]
    fn test_out_of_range_threshold_uses_default() {
        assert_eq!(CountFlushPolicy::new(0).threshold(), 30);
        assert_eq!(CountFlushPolicy::new(101).threshold(), 30);
        assert_eq!(CountFlushPolicy::new(1).threshold(), 1);
        assert_eq!(CountFlushPolicy::new(100).threshold(), 100);
    }
}
