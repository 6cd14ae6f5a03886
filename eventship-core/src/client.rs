//! Client facade
//!
//! [`Client`] wires storage, transport, policies and the uploader together
//! for one write key, owns the persisted anonymous id, and carries out the
//! shutdown-and-delete sequence when the data plane rejects the write key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, OnceCell};
use tracing::Instrument;

use crate::backoff::{BackoffFactory, ExponentialBackoff};
use crate::config::Config;
use crate::enrichment::{Enrichment, EnrichmentChain};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::logging::client_span;
use crate::policy::FlushPolicyEngine;
use crate::queue::{BatchUploader, EventQueue, UploadSummary};
use crate::source::{SourceConfig, SourceConfigAction, SourceConfigStore};
use crate::storage::{keys, FileStorage, Storage};
use crate::transport::{HttpTransport, Transport};

/// Builds a [`Client`]
///
/// Storage, transport, backoff and flush policies default to what the
/// configuration describes and can be replaced individually.
pub struct ClientBuilder {
    config: Config,
    storage: Option<Arc<dyn Storage>>,
    transport: Option<Arc<dyn Transport>>,
    backoff: Option<BackoffFactory>,
    policies: Option<FlushPolicyEngine>,
    enrichments: Vec<Enrichment>,
    span: Option<tracing::Span>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
            transport: None,
            backoff: None,
            policies: None,
            enrichments: Vec::new(),
            span: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn backoff(mut self, backoff: BackoffFactory) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn flush_policies(mut self, policies: FlushPolicyEngine) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Add an enrichment step, applied after the built-in ones
    pub fn enrichment(mut self, step: Enrichment) -> Self {
        self.enrichments.push(step);
        self
    }

    /// Merge fixed keys into every event's `context`
    pub fn static_context(self, values: Map<String, Value>) -> Self {
        self.enrichment(Enrichment::StaticContext(values))
    }

    /// Span for every task of this client. Defaults to [`client_span`].
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Open storage, restore the anonymous id and start the queue.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<Client> {
        self.config.queue.validate()?;
        let write_key = self.config.client.checked_write_key()?.to_string();
        let span = self.span.unwrap_or_else(|| client_span(&write_key));

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&self.config.client)?),
        };

        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(
                FileStorage::open(
                    self.config.storage_dir(&write_key),
                    &write_key,
                    self.config.queue.max_batch_bytes,
                )
                .instrument(span.clone())
                .await?,
            ),
        };

        let anonymous_id = load_anonymous_id(storage.as_ref()).await?;

        let mut enrichment = EnrichmentChain::new();
        enrichment.push(Enrichment::LibraryContext);
        enrichment.push(Enrichment::AnonymousIdFill(anonymous_id.clone()));
        for step in self.enrichments {
            enrichment.push(step);
        }

        let source = Arc::new(SourceConfigStore::default());
        let (invalid_tx, invalid_rx) = mpsc::unbounded_channel();
        let uploader = Arc::new(
            BatchUploader::new(
                Arc::clone(&storage),
                transport,
                Arc::clone(&source),
                self.backoff
                    .unwrap_or_else(|| ExponentialBackoff::factory(&self.config.backoff)),
            )
            .with_invalid_write_key_sender(invalid_tx)
            .with_span(span.clone()),
        );

        let queue = EventQueue::new(
            Arc::clone(&storage),
            uploader,
            Arc::clone(&source),
            self.policies
                .unwrap_or_else(|| FlushPolicyEngine::from_config(&self.config.queue)),
            &self.config.queue,
            span.clone(),
        );

        let shared = Arc::new(Shared {
            storage,
            queue,
            invalidated: AtomicBool::new(false),
            invalidation: OnceCell::new(),
            span: span.clone(),
        });
        tokio::spawn(
            watch_invalidation(Arc::downgrade(&shared), invalid_rx).instrument(span.clone()),
        );

        shared.queue.start();
        span.in_scope(|| tracing::info!(anonymous_id = %anonymous_id, "Client ready"));

        Ok(Client {
            write_key,
            shared,
            source,
            enrichment: RwLock::new(enrichment),
            anonymous_id: RwLock::new(anonymous_id),
        })
    }
}

async fn load_anonymous_id(storage: &dyn Storage) -> Result<String> {
    let stored = storage.read_string(keys::ANONYMOUS_ID, "").await;
    if !stored.is_empty() {
        return Ok(stored);
    }
    let generated = uuid::Uuid::new_v4().to_string();
    storage.write_string(keys::ANONYMOUS_ID, &generated).await?;
    tracing::debug!(anonymous_id = %generated, "Generated anonymous id");
    Ok(generated)
}

/// State shared with the invalidation watcher
struct Shared {
    storage: Arc<dyn Storage>,
    queue: EventQueue,
    invalidated: AtomicBool,
    invalidation: OnceCell<()>,
    span: tracing::Span,
}

impl Shared {
    /// Stop everything and delete local data. Runs once; later callers wait
    /// for the first one to finish.
    async fn invalidate(&self) {
        self.invalidation
            .get_or_init(|| async {
                self.invalidated.store(true, Ordering::SeqCst);
                self.queue.shutdown();
                if let Err(e) = self.storage.delete_all().await {
                    tracing::error!(error = %e, "Failed to delete local data");
                }
                tracing::error!("Write key rejected, client invalidated and local data deleted");
            })
            .instrument(self.span.clone())
            .await;
    }
}

async fn watch_invalidation(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<()>) {
    if rx.recv().await.is_none() {
        return;
    }
    if let Some(shared) = shared.upgrade() {
        shared.invalidate().await;
    }
}

/// Analytics client for one write key
pub struct Client {
    write_key: String,
    shared: Arc<Shared>,
    source: Arc<SourceConfigStore>,
    enrichment: RwLock<EnrichmentChain>,
    anonymous_id: RwLock<String>,
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn write_key(&self) -> &str {
        &self.write_key
    }

    /// Whether the write key was rejected. Permanent for this instance.
    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::SeqCst)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_invalidated() {
            Err(Error::InvalidWriteKey)
        } else {
            Ok(())
        }
    }

    /// Enrich and enqueue an event
    pub fn put(&self, event: Event) -> Result<()> {
        self.ensure_valid()?;
        let event = self
            .enrichment
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(event);
        self.shared.queue.put(&event)
    }

    pub fn track(&self, name: &str, properties: Map<String, Value>) -> Result<()> {
        self.put(Event::track(name).with_properties(properties))
    }

    pub fn screen(&self, name: &str, properties: Map<String, Value>) -> Result<()> {
        self.put(Event::screen(name).with_properties(properties))
    }

    pub fn identify(&self, user_id: &str, traits: Map<String, Value>) -> Result<()> {
        let mut event = Event::identify(user_id);
        event
            .context
            .insert("traits".to_string(), Value::Object(traits));
        self.put(event)
    }

    /// Request a rollover and upload without waiting for it
    pub fn flush(&self) -> Result<()> {
        self.ensure_valid()?;
        self.shared.queue.flush();
        Ok(())
    }

    /// Roll over and upload everything pending, waiting for the run to end
    pub async fn flush_and_wait(&self) -> Result<UploadSummary> {
        self.ensure_valid()?;
        let summary = self.shared.queue.flush_and_wait().await?;
        if self.shared.queue.uploader().is_invalidated() {
            self.shared.invalidate().await;
        }
        Ok(summary)
    }

    /// Current anonymous id
    pub fn anonymous_id(&self) -> String {
        self.anonymous_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Replace the anonymous id with a fresh one. Later events start a new
    /// batch.
    pub async fn reset(&self) -> Result<String> {
        self.ensure_valid()?;
        let anonymous_id = uuid::Uuid::new_v4().to_string();
        self.shared
            .storage
            .write_string(keys::ANONYMOUS_ID, &anonymous_id)
            .await?;

        self.enrichment
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set_anonymous_id(&anonymous_id);
        *self
            .anonymous_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = anonymous_id.clone();

        tracing::info!(parent: &self.shared.span, anonymous_id = %anonymous_id, "Anonymous id reset");
        Ok(anonymous_id)
    }

    /// Apply a source configuration received from the control plane
    pub fn update_source_config(&self, config: SourceConfig) {
        self.source.dispatch(SourceConfigAction::Update(config));
    }

    pub fn source_config(&self) -> SourceConfig {
        self.source.current()
    }

    /// Ids of closed batches not yet uploaded
    pub async fn pending_batches(&self) -> Result<Vec<String>> {
        self.ensure_valid()?;
        Ok(self.shared.storage.pending_batches().await)
    }

    /// Wait until every event put so far has been stored
    pub async fn wait_idle(&self) -> Result<()> {
        self.shared.queue.wait_idle().await
    }

    pub fn start(&self) -> Result<()> {
        self.ensure_valid()?;
        self.shared.queue.start();
        Ok(())
    }

    /// Stop accepting events. Stored batches stay on disk.
    pub fn stop(&self) {
        self.shared.queue.stop();
    }

    /// Stop accepting events and abort any retry wait
    pub fn shutdown(&self) {
        self.shared.queue.shutdown();
    }
}
