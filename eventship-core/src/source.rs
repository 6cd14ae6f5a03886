//! Source configuration state
//!
//! The server-side source configuration decides whether this client may send
//! at all. State changes go through [`SourceConfigAction`] and the pure
//! [`reduce`] function; [`SourceConfigStore`] publishes each new state on a
//! `watch` channel and doubles as the gate the queue consults per event.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Latest known source configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    #[serde(default)]
    pub source_id: Option<String>,

    #[serde(default = "default_enabled")]
    pub is_source_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_id: None,
            is_source_enabled: true,
        }
    }
}

/// Actions that change the source configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfigAction {
    /// Replace the state with a freshly fetched configuration
    Update(SourceConfig),
    /// The data plane reported the source as disabled
    DisableSource,
}

/// Apply an action to a state, returning the next state
pub fn reduce(state: &SourceConfig, action: SourceConfigAction) -> SourceConfig {
    match action {
        SourceConfigAction::Update(config) => config,
        SourceConfigAction::DisableSource => SourceConfig {
            is_source_enabled: false,
            ..state.clone()
        },
    }
}

/// Observable holder of the current [`SourceConfig`]
#[derive(Debug)]
pub struct SourceConfigStore {
    tx: watch::Sender<SourceConfig>,
}

impl SourceConfigStore {
    pub fn new(initial: SourceConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Reduce `action` over the current state; subscribers are notified only
    /// when the state actually changes
    pub fn dispatch(&self, action: SourceConfigAction) {
        self.tx.send_if_modified(|state| {
            let next = reduce(state, action);
            if next == *state {
                return false;
            }
            tracing::debug!(
                enabled = next.is_source_enabled,
                source_id = ?next.source_id,
                "Source config updated"
            );
            *state = next;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<SourceConfig> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SourceConfig {
        self.tx.borrow().clone()
    }

    /// Whether new events may be accepted and uploaded
    pub fn is_sending_allowed(&self) -> bool {
        self.tx.borrow().is_source_enabled
    }
}

impl Default for SourceConfigStore {
    fn default() -> Self {
        Self::new(SourceConfig::default())
    }
}
