//! Time-based flush policy
//!
//! Unlike the other policies this one is not polled from `put`: `schedule`
//! starts a timer task that calls the trigger on every tick until
//! `cancel_schedule` (or drop) cancels it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::FlushTrigger;
use crate::config::default_flush_interval_ms;

pub struct FrequencyFlushPolicy {
    interval: Duration,
    timer: Option<(CancellationToken, JoinHandle<()>)>,
}

impl FrequencyFlushPolicy {
    /// Intervals below 1 ms fall back to the 10 s default
    pub fn new(interval_ms: u64) -> Self {
        let interval_ms = if interval_ms < 1 {
            tracing::warn!(
                interval_ms,
                default = default_flush_interval_ms(),
                "Flush interval out of range, using default"
            );
            default_flush_interval_ms()
        } else {
            interval_ms
        };
        Self {
            interval: Duration::from_millis(interval_ms),
            timer: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer
            .as_ref()
            .is_some_and(|(token, _)| !token.is_cancelled())
    }

    /// Start calling `trigger` every interval, replacing any running timer
    pub fn schedule(&mut self, trigger: FlushTrigger, span: tracing::Span) {
        self.cancel_schedule();

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let interval = self.interval;

        let handle = tokio::spawn(
            async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancelled.cancelled() => break,
                        _ = ticker.tick() => {
                            tracing::trace!("Frequency flush tick");
                            trigger();
                        }
                    }
                }
                tracing::debug!("Frequency flush timer stopped");
            }
            .instrument(span),
        );

        self.timer = Some((token, handle));
    }

    pub fn cancel_schedule(&mut self) {
        if let Some((token, _handle)) = self.timer.take() {
            token.cancel();
        }
    }
}

impl Drop for FrequencyFlushPolicy {
    fn drop(&mut self) {
        self.cancel_schedule();
    }
}
