//! Flush once when the queue first starts

/// Asks for one flush per process, consumed by the first reset
#[derive(Debug, Clone, Default)]
pub struct StartupFlushPolicy {
    fired: bool,
}

impl StartupFlushPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_flush(&self) -> bool {
        !self.fired
    }

    pub fn reset(&mut self) {
        self.fired = true;
    }
}
