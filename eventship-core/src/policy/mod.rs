//! Flush policies
//!
//! Each policy answers "should the open batch be flushed now?". The
//! [`FlushPolicyEngine`] combines them: it flushes when any policy asks to,
//! and resets all of them together once a flush actually starts.

mod count;
mod frequency;
mod startup;

pub use count::CountFlushPolicy;
pub use frequency::FrequencyFlushPolicy;
pub use startup::StartupFlushPolicy;

use std::sync::Arc;

use crate::config::QueueConfig;

/// Callback fired by time-based policies
pub type FlushTrigger = Arc<dyn Fn() + Send + Sync>;

/// One of the supported flush policies
pub enum FlushPolicy {
    Count(CountFlushPolicy),
    Frequency(FrequencyFlushPolicy),
    Startup(StartupFlushPolicy),
}

impl FlushPolicy {
    pub fn should_flush(&self) -> bool {
        match self {
            FlushPolicy::Count(policy) => policy.should_flush(),
            FlushPolicy::Frequency(_) => false,
            FlushPolicy::Startup(policy) => policy.should_flush(),
        }
    }

    pub fn update_state(&mut self) {
        if let FlushPolicy::Count(policy) = self {
            policy.update_state();
        }
    }

    pub fn reset(&mut self) {
        match self {
            FlushPolicy::Count(policy) => policy.reset(),
            FlushPolicy::Frequency(_) => {}
            FlushPolicy::Startup(policy) => policy.reset(),
        }
    }

    pub fn schedule(&mut self, trigger: FlushTrigger, span: tracing::Span) {
        if let FlushPolicy::Frequency(policy) = self {
            policy.schedule(trigger, span);
        }
    }

    pub fn cancel_schedule(&mut self) {
        if let FlushPolicy::Frequency(policy) = self {
            policy.cancel_schedule();
        }
    }
}

impl From<CountFlushPolicy> for FlushPolicy {
    fn from(policy: CountFlushPolicy) -> Self {
        FlushPolicy::Count(policy)
    }
}

impl From<FrequencyFlushPolicy> for FlushPolicy {
    fn from(policy: FrequencyFlushPolicy) -> Self {
        FlushPolicy::Frequency(policy)
    }
}

impl From<StartupFlushPolicy> for FlushPolicy {
    fn from(policy: StartupFlushPolicy) -> Self {
        FlushPolicy::Startup(policy)
    }
}

/// Facade over the active policies
pub struct FlushPolicyEngine {
    policies: Vec<FlushPolicy>,
}

impl FlushPolicyEngine {
    pub fn new(policies: Vec<FlushPolicy>) -> Self {
        Self { policies }
    }

    /// Count, frequency and (optionally) startup policies from configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        let mut policies = vec![
            FlushPolicy::from(CountFlushPolicy::new(config.flush_at)),
            FlushPolicy::from(FrequencyFlushPolicy::new(config.flush_interval_ms)),
        ];
        if config.startup_flush {
            policies.push(StartupFlushPolicy::new().into());
        }
        Self::new(policies)
    }

    pub fn should_flush(&self) -> bool {
        self.policies.iter().any(FlushPolicy::should_flush)
    }

    pub fn update_state(&mut self) {
        self.policies.iter_mut().for_each(FlushPolicy::update_state);
    }

    pub fn reset(&mut self) {
        self.policies.iter_mut().for_each(FlushPolicy::reset);
    }

    pub fn schedule(&mut self, trigger: FlushTrigger, span: &tracing::Span) {
        for policy in &mut self.policies {
            policy.schedule(Arc::clone(&trigger), span.clone());
        }
    }

    pub fn cancel_schedule(&mut self) {
        self.policies
            .iter_mut()
            .for_each(FlushPolicy::cancel_schedule);
    }
}

impl Default for FlushPolicyEngine {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_policy_triggers_flush() {
        let mut engine = FlushPolicyEngine::new(vec![
            CountFlushPolicy::new(2).into(),
            StartupFlushPolicy::new().into(),
        ]);
        assert!(engine.should_flush());

        engine.reset();
        assert!(!engine.should_flush());

        engine.update_state();
        assert!(!engine.should_flush());
        engine.update_state();
        assert!(engine.should_flush());

        engine.reset();
        assert!(!engine.should_flush());
    }

    #[test]
    fn test_count_only_engine() {
        let mut engine = FlushPolicyEngine::new(vec![CountFlushPolicy::default().into()]);
        for _ in 0..29 {
            engine.update_state();
            assert!(!engine.should_flush());
        }
        engine.update_state();
        assert!(engine.should_flush());
        engine.reset();
        assert!(!engine.should_flush());
    }

    #[test]
    fn test_from_config_without_startup() {
        let config = QueueConfig {
            startup_flush: false,
            ..Default::default()
        };
        let engine = FlushPolicyEngine::from_config(&config);
        assert!(!engine.should_flush());
        assert_eq!(engine.policies.len(), 2);
    }

    #[test]
    fn test_default_engine_starts_with_startup_flush_pending() {
        let engine = FlushPolicyEngine::default();
        assert!(engine.should_flush());
    }
}
