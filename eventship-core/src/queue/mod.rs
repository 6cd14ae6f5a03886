//! Durable event queue
//!
//! ## Architecture
//!
//! Two background tasks, each strictly sequential:
//! - **writer**: owns every storage mutation made on the ingestion side
//!   (append, rollover, last anonymous id) and drives the flush policies
//! - **upload**: runs [`BatchUploader::flush`] whenever the writer signals
//!
//! `put` only serializes the event and hands it to the writer, so a slow
//! upload never blocks producers. Upload signals are coalesced: while a run
//! is queued, further signals are dropped because that run re-reads the
//! pending index when it starts.

mod upload;

pub use upload::{BatchUploader, RunStop, UploadSummary};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::policy::{FlushPolicyEngine, FlushTrigger};
use crate::source::SourceConfigStore;
use crate::storage::{keys, Storage};

/// Messages handled by the writer task
enum QueueMessage {
    Event {
        json: String,
        anonymous_id: String,
    },
    /// Unconditional rollover and upload
    Flush,
    /// Frequency policy tick
    Tick,
    /// Close the open batch without uploading, then acknowledge
    Rollover(oneshot::Sender<()>),
    /// Acknowledge once every earlier message has been handled
    Barrier(oneshot::Sender<()>),
}

/// Public entry point for events
pub struct EventQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    running: Arc<AtomicBool>,
    policies: Arc<Mutex<FlushPolicyEngine>>,
    source: Arc<SourceConfigStore>,
    uploader: Arc<BatchUploader>,
    max_event_bytes: usize,
    span: tracing::Span,
}

impl EventQueue {
    /// Build the queue and spawn its writer and upload tasks.
    ///
    /// Must be called inside a Tokio runtime. The queue starts `Stopped`.
    pub fn new(
        storage: Arc<dyn Storage>,
        uploader: Arc<BatchUploader>,
        source: Arc<SourceConfigStore>,
        policies: FlushPolicyEngine,
        config: &QueueConfig,
        span: tracing::Span,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::channel(1);
        let running = Arc::new(AtomicBool::new(false));
        let policies = Arc::new(Mutex::new(policies));

        let writer = Writer {
            storage,
            policies: Arc::clone(&policies),
            source: Arc::clone(&source),
            running: Arc::clone(&running),
            upload_tx,
        };
        tokio::spawn(writer.run(rx).instrument(span.clone()));
        tokio::spawn(run_uploads(Arc::clone(&uploader), upload_rx).instrument(span.clone()));

        Self {
            tx,
            running,
            policies,
            source,
            uploader,
            max_event_bytes: config.max_event_bytes,
            span,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start accepting events and arm the time-based flush.
    ///
    /// The first start in a process also flushes whatever earlier sessions
    /// left on disk.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let tx = self.tx.clone();
        let trigger: FlushTrigger = Arc::new(move || {
            let _ = tx.send(QueueMessage::Tick);
        });

        let startup_flush = {
            let mut policies = lock_policies(&self.policies);
            policies.schedule(trigger, &self.span);
            let due = policies.should_flush();
            if due {
                policies.reset();
            }
            due
        };

        self.span.in_scope(|| tracing::info!(startup_flush, "Event queue started"));
        if startup_flush {
            let _ = self.tx.send(QueueMessage::Flush);
        }
    }

    /// Stop accepting events and cancel the time-based flush.
    ///
    /// Stored batches stay on disk and an upload run already in progress
    /// continues.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        lock_policies(&self.policies).cancel_schedule();
        self.span.in_scope(|| tracing::info!("Event queue stopped"));
    }

    /// Stop the queue and abort any backoff wait in the uploader
    pub fn shutdown(&self) {
        self.stop();
        self.uploader.shutdown();
    }

    /// Queue one event for storage.
    ///
    /// A no-op while stopped or while the source does not allow sending.
    /// Fails only when the serialized event is larger than the per-event limit.
    pub fn put(&self, event: &Event) -> Result<()> {
        if !self.is_running() {
            tracing::debug!(event_type = event.event_type.as_str(), "Queue stopped, dropping event");
            return Ok(());
        }
        if !self.source.is_sending_allowed() {
            tracing::debug!(event_type = event.event_type.as_str(), "Source disabled, dropping event");
            return Ok(());
        }

        let json = event.to_json()?;
        if json.len() > self.max_event_bytes {
            self.span.in_scope(|| {
                tracing::error!(
                    size = json.len(),
                    limit = self.max_event_bytes,
                    message_id = %event.message_id,
                    "Event exceeds size limit, dropping it"
                )
            });
            return Err(Error::PayloadTooLarge {
                size: json.len(),
                limit: self.max_event_bytes,
            });
        }

        self.tx
            .send(QueueMessage::Event {
                json,
                anonymous_id: event.anonymous_id.clone().unwrap_or_default(),
            })
            .map_err(|_| Error::ClientShutdown)
    }

    /// Roll over the open batch and upload everything pending, regardless of
    /// the flush policies. Returns immediately.
    pub fn flush(&self) {
        let _ = self.tx.send(QueueMessage::Flush);
    }

    /// Roll over the open batch, then run an upload and wait for it
    pub async fn flush_and_wait(&self) -> Result<UploadSummary> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Rollover(ack_tx))
            .map_err(|_| Error::ClientShutdown)?;
        ack_rx.await.map_err(|_| Error::ClientShutdown)?;

        lock_policies(&self.policies).reset();
        Ok(self.uploader.flush().await)
    }

    /// Wait until every message sent before this call has been handled
    pub async fn wait_idle(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Barrier(ack_tx))
            .map_err(|_| Error::ClientShutdown)?;
        ack_rx.await.map_err(|_| Error::ClientShutdown)
    }

    pub fn uploader(&self) -> &Arc<BatchUploader> {
        &self.uploader
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        // The timer task holds a sender; cancel it so the writer can exit.
        lock_policies(&self.policies).cancel_schedule();
    }
}

fn lock_policies(policies: &Mutex<FlushPolicyEngine>) -> MutexGuard<'_, FlushPolicyEngine> {
    policies
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Writer {
    storage: Arc<dyn Storage>,
    policies: Arc<Mutex<FlushPolicyEngine>>,
    source: Arc<SourceConfigStore>,
    running: Arc<AtomicBool>,
    upload_tx: mpsc::Sender<()>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueueMessage>) {
        let mut last_anonymous_id = self
            .storage
            .read_string(keys::LAST_EVENT_ANONYMOUS_ID, "")
            .await;

        while let Some(message) = rx.recv().await {
            match message {
                QueueMessage::Event { json, anonymous_id } => {
                    if anonymous_id != last_anonymous_id {
                        self.rollover().await;
                        last_anonymous_id = anonymous_id;
                        if let Err(e) = self
                            .storage
                            .write_string(keys::LAST_EVENT_ANONYMOUS_ID, &last_anonymous_id)
                            .await
                        {
                            tracing::error!(error = %e, "Failed to persist last anonymous id");
                        }
                    }

                    if let Err(e) = self.storage.append_event(&json).await {
                        tracing::error!(error = %e, "Failed to store event");
                        continue;
                    }
                    tracing::trace!(bytes = json.len(), "Stored event");

                    let due = {
                        let mut policies = lock_policies(&self.policies);
                        policies.update_state();
                        policies.should_flush()
                    };
                    if due {
                        self.rollover_and_upload().await;
                    }
                }
                QueueMessage::Flush => self.rollover_and_upload().await,
                QueueMessage::Tick => {
                    if self.running.load(Ordering::SeqCst) && self.source.is_sending_allowed() {
                        self.rollover_and_upload().await;
                    }
                }
                QueueMessage::Rollover(ack) => {
                    self.rollover().await;
                    let _ = ack.send(());
                }
                QueueMessage::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        tracing::debug!("Queue writer stopped");
    }

    async fn rollover(&self) {
        if let Err(e) = self.storage.rollover().await {
            tracing::error!(error = %e, "Failed to roll over batch");
        }
    }

    async fn rollover_and_upload(&self) {
        self.rollover().await;
        match self.upload_tx.try_send(()) {
            Ok(()) => tracing::trace!("Upload requested"),
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::trace!("Upload already queued");
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::warn!("Upload task is gone, batch stays pending");
            }
        }
        lock_policies(&self.policies).reset();
    }
}

async fn run_uploads(uploader: Arc<BatchUploader>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        uploader.flush().await;
    }
    tracing::debug!("Upload task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{Backoff, ExponentialBackoff};
    use crate::payload::{batch_suffix, BATCH_PREFIX};
    use crate::policy::{CountFlushPolicy, StartupFlushPolicy};
    use crate::storage::InMemoryStorage;
    use crate::transport::{SendFailure, Transport};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        sent: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        async fn send_data(&self, payload: &str) -> std::result::Result<String, SendFailure> {
            self.sent.lock().unwrap().push(payload.to_string());
            Ok("OK".to_string())
        }

        fn update_anonymous_id_header(&self, _encoded: &str) {}
    }

    struct Harness {
        storage: Arc<InMemoryStorage>,
        transport: Arc<CountingTransport>,
        source: Arc<SourceConfigStore>,
        queue: EventQueue,
    }

    fn harness(policies: FlushPolicyEngine) -> Harness {
        let storage = Arc::new(InMemoryStorage::default());
        let transport = Arc::new(CountingTransport::default());
        let source = Arc::new(SourceConfigStore::default());
        let uploader = Arc::new(BatchUploader::new(
            storage.clone(),
            transport.clone(),
            Arc::clone(&source),
            Arc::new(|| {
                Box::new(ExponentialBackoff::new(
                    Duration::from_millis(1),
                    2.0,
                    Duration::from_millis(10),
                    false,
                )) as Box<dyn Backoff>
            }),
        ));
        let queue = EventQueue::new(
            storage.clone(),
            uploader,
            Arc::clone(&source),
            policies,
            &QueueConfig::default(),
            tracing::Span::none(),
        );
        Harness {
            storage,
            transport,
            source,
            queue,
        }
    }

    fn event(anonymous_id: &str) -> Event {
        Event::track("test").with_anonymous_id(anonymous_id)
    }

    fn stored_batch(anonymous_id: &str) -> String {
        format!(
            r#"{}{{"anonymousId":"{}"}}{}"#,
            BATCH_PREFIX,
            anonymous_id,
            batch_suffix()
        )
    }

    fn sends(h: &Harness) -> usize {
        h.transport.sent.lock().unwrap().len()
    }

    /// Let the upload task run without forcing an upload of our own
    async fn settle(h: &Harness) {
        h.queue.wait_idle().await.unwrap();
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_put_before_start_is_noop() {
        let h = harness(FlushPolicyEngine::new(vec![]));
        h.queue.put(&event("a")).unwrap();
        h.queue.wait_idle().await.unwrap();
        assert_eq!(h.storage.write_count(), 0);
    }

    #[tokio::test]
    async fn test_put_stores_event() {
        let h = harness(FlushPolicyEngine::new(vec![]));
        h.queue.start();
        h.queue.put(&event("a")).unwrap();
        h.queue.put(&event("a")).unwrap();
        h.queue.wait_idle().await.unwrap();
        assert_eq!(h.storage.open_batch_events(), 2);
    }

    #[tokio::test]
    async fn test_put_while_source_disabled_is_noop() {
        let h = harness(FlushPolicyEngine::new(vec![]));
        h.queue.start();
        h.source
            .dispatch(crate::source::SourceConfigAction::DisableSource);
        h.queue.put(&event("a")).unwrap();
        h.queue.wait_idle().await.unwrap();
        assert_eq!(h.storage.write_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_event_is_rejected() {
        let h = harness(FlushPolicyEngine::new(vec![]));
        h.queue.start();
        let mut props = serde_json::Map::new();
        props.insert("blob".to_string(), "x".repeat(40 * 1024).into());
        let big = event("a").with_properties(props);

        assert!(matches!(
            h.queue.put(&big),
            Err(Error::PayloadTooLarge { limit: 32768, .. })
        ));
    }

    #[tokio::test]
    async fn test_anonymous_id_change_rolls_over() {
        let h = harness(FlushPolicyEngine::new(vec![]));
        h.queue.start();
        h.queue.put(&event("a")).unwrap();
        h.queue.put(&event("a")).unwrap();
        h.queue.put(&event("b")).unwrap();
        h.queue.wait_idle().await.unwrap();

        assert_eq!(h.storage.pending_batches().await.len(), 1);
        assert_eq!(h.storage.open_batch_events(), 1);
        assert_eq!(
            h.storage
                .read_string(keys::LAST_EVENT_ANONYMOUS_ID, "")
                .await,
            "b"
        );
    }

    #[tokio::test]
    async fn test_count_threshold_uploads_batch() {
        let h = harness(FlushPolicyEngine::new(vec![CountFlushPolicy::new(3).into()]));
        h.queue.start();
        for _ in 0..3 {
            h.queue.put(&event("a")).unwrap();
        }
        h.queue.wait_idle().await.unwrap();

        // The upload runs on its own task; wait for it through the run lock.
        h.queue.uploader().flush().await;
        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);
        assert!(h.storage.pending_batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_and_wait_uploads_open_batch() {
        let h = harness(FlushPolicyEngine::new(vec![]));
        h.queue.start();
        h.queue.put(&event("a")).unwrap();

        let summary = h.queue.flush_and_wait().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert!(h.storage.pending_batches().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_frequency_flush() {
        let h = harness(FlushPolicyEngine::from_config(&QueueConfig {
            flush_interval_ms: 1_000,
            startup_flush: false,
            ..Default::default()
        }));
        h.queue.start();
        h.queue.put(&event("a")).unwrap();
        h.queue.wait_idle().await.unwrap();

        h.queue.stop();
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        h.queue.wait_idle().await.unwrap();

        assert!(h.storage.pending_batches().await.is_empty());
        assert_eq!(h.storage.open_batch_events(), 1);
        assert!(!h.queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_flush_uploads_previous_session_once() {
        let h = harness(FlushPolicyEngine::new(vec![StartupFlushPolicy::new().into()]));
        h.storage.insert_batch(stored_batch("earlier"));

        h.queue.start();
        settle(&h).await;
        assert_eq!(sends(&h), 1);
        assert!(h.transport.sent.lock().unwrap()[0].contains("earlier"));
        assert!(h.storage.pending_batches().await.is_empty());

        h.storage.insert_batch(stored_batch("later"));
        h.queue.stop();
        h.queue.start();
        settle(&h).await;
        assert_eq!(sends(&h), 1);
        assert_eq!(h.storage.pending_batches().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_tick_uploads_open_batch() {
        let h = harness(FlushPolicyEngine::from_config(&QueueConfig {
            flush_interval_ms: 1_000,
            startup_flush: false,
            ..Default::default()
        }));
        h.queue.start();
        h.queue.put(&event("a")).unwrap();
        settle(&h).await;
        assert_eq!(sends(&h), 0);
        assert_eq!(h.storage.open_batch_events(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle(&h).await;

        assert_eq!(sends(&h), 1);
        assert_eq!(h.storage.open_batch_events(), 0);
        assert!(h.storage.pending_batches().await.is_empty());
    }
}
