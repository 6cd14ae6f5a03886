//! Event enrichment applied before an event reaches the queue

use serde_json::{Map, Value};

use crate::event::Event;

/// Library name reported in `context.library`
pub const LIBRARY_NAME: &str = "eventship";

/// One step of the enrichment chain
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    /// Set `context.library` to this crate's name and version
    LibraryContext,
    /// Merge fixed keys into `context`, keeping values the event already has
    StaticContext(Map<String, Value>),
    /// Set `anonymousId` when the event has none
    AnonymousIdFill(String),
}

impl Enrichment {
    pub fn apply(&self, mut event: Event) -> Event {
        match self {
            Enrichment::LibraryContext => {
                let mut library = Map::new();
                library.insert("name".to_string(), Value::from(LIBRARY_NAME));
                library.insert(
                    "version".to_string(),
                    Value::from(env!("CARGO_PKG_VERSION")),
                );
                event
                    .context
                    .insert("library".to_string(), Value::Object(library));
            }
            Enrichment::StaticContext(values) => {
                for (key, value) in values {
                    event
                        .context
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
            Enrichment::AnonymousIdFill(anonymous_id) => {
                if event.anonymous_id.as_deref().map_or(true, str::is_empty) {
                    event.anonymous_id = Some(anonymous_id.clone());
                }
            }
        }
        event
    }
}

/// Enrichments applied in registration order
#[derive(Debug, Clone, Default)]
pub struct EnrichmentChain {
    steps: Vec<Enrichment>,
}

impl EnrichmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Enrichment) {
        self.steps.push(step);
    }

    /// Replace every anonymous-id fill step with one using `anonymous_id`
    pub fn set_anonymous_id(&mut self, anonymous_id: &str) {
        for step in &mut self.steps {
            if let Enrichment::AnonymousIdFill(current) = step {
                *current = anonymous_id.to_string();
            }
        }
    }

    pub fn apply(&self, event: Event) -> Event {
        self.steps.iter().fold(event, |event, step| step.apply(event))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
