//! Batch uploader
//!
//! One run walks the pending index in order and settles each batch before
//! touching the next:
//!
//! - success, 400 and 413 remove the batch
//! - retryable failures wait on the backoff and resend the same batch
//! - 401 stops the run and signals that the write key is invalid
//! - 404 stops the run, keeps the batch, and disables uploads until restart
//!
//! Runs are serialized by a lock and each run re-reads the index after
//! acquiring it, so a batch removed by one run is never sent by the next.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backoff::{Backoff, BackoffFactory};
use crate::payload::{encode_header_value, extract_anonymous_id, update_sent_at};
use crate::source::{SourceConfigAction, SourceConfigStore};
use crate::storage::Storage;
use crate::transport::{Transport, UploadOutcome};

/// Why a run ended before the index was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// Uploads were already disabled; nothing was sent
    Disabled,
    /// The data plane rejected the write key
    InvalidWriteKey,
    /// The data plane reported the source as disabled
    SourceDisabled,
    /// The uploader was shut down during a backoff wait
    Shutdown,
}

/// What one `flush` run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Batches acknowledged by the data plane
    pub uploaded: usize,
    /// Batches removed without a successful upload
    pub dropped: usize,
    /// Send attempts, including retries
    pub attempts: usize,
    /// Backoff waits
    pub retries: usize,
    pub stopped: Option<RunStop>,
}

pub struct BatchUploader {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    source: Arc<SourceConfigStore>,
    backoff: BackoffFactory,
    run_lock: Mutex<()>,
    disabled: AtomicBool,
    invalidated: AtomicBool,
    invalid_write_key_tx: Option<mpsc::UnboundedSender<()>>,
    shutdown: CancellationToken,
    span: tracing::Span,
}

impl BatchUploader {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        source: Arc<SourceConfigStore>,
        backoff: BackoffFactory,
    ) -> Self {
        Self {
            storage,
            transport,
            source,
            backoff,
            run_lock: Mutex::new(()),
            disabled: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            invalid_write_key_tx: None,
            shutdown: CancellationToken::new(),
            span: tracing::Span::none(),
        }
    }

    /// Channel that receives one message when the write key is rejected
    pub fn with_invalid_write_key_sender(mut self, tx: mpsc::UnboundedSender<()>) -> Self {
        self.invalid_write_key_tx = Some(tx);
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Whether uploads were disabled by a source-disabled response
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Whether the data plane rejected the write key during any run
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Abort backoff waits and stop starting new batches
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Upload every pending batch. Never fails; outcomes are logged and
    /// summarized.
    pub async fn flush(&self) -> UploadSummary {
        self.run().instrument(self.span.clone()).await
    }

    async fn run(&self) -> UploadSummary {
        let mut summary = UploadSummary::default();

        if self.is_disabled() {
            tracing::debug!("Uploads disabled, skipping flush");
            summary.stopped = Some(RunStop::Disabled);
            return summary;
        }

        let _run = self.run_lock.lock().await;

        if self.is_disabled() {
            summary.stopped = Some(RunStop::Disabled);
            return summary;
        }

        let pending = self.storage.pending_batches().await;
        if pending.is_empty() {
            tracing::trace!("No pending batches");
            return summary;
        }
        tracing::debug!(pending = pending.len(), "Starting upload run");

        let mut backoff = (self.backoff)();

        for id in pending {
            if self.shutdown.is_cancelled() {
                summary.stopped = Some(RunStop::Shutdown);
                break;
            }

            if !self.storage.batch_exists(&id).await {
                tracing::debug!(batch = %id, "Batch no longer on disk, skipping");
                self.remove_batch(&id).await;
                continue;
            }

            let content = match self.storage.read_batch(&id).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::error!(
                        batch = %id,
                        error = %e,
                        "Failed to read batch, removing it"
                    );
                    self.remove_batch(&id).await;
                    summary.dropped += 1;
                    continue;
                }
            };

            if let ControlFlow::Break(reason) = self
                .upload_batch(&id, &content, backoff.as_mut(), &mut summary)
                .await
            {
                summary.stopped = Some(reason);
                break;
            }
        }

        tracing::info!(
            uploaded = summary.uploaded,
            dropped = summary.dropped,
            attempts = summary.attempts,
            stopped = ?summary.stopped,
            "Upload run finished"
        );
        summary
    }

    async fn upload_batch(
        &self,
        id: &str,
        content: &str,
        backoff: &mut dyn Backoff,
        summary: &mut UploadSummary,
    ) -> ControlFlow<RunStop> {
        loop {
            let payload = update_sent_at(content, Utc::now());

            let anonymous_id = match extract_anonymous_id(&payload) {
                Some(found) => found.to_string(),
                None => {
                    tracing::warn!(batch = %id, "No anonymousId in batch, using a random one");
                    uuid::Uuid::new_v4().to_string()
                }
            };
            self.transport
                .update_anonymous_id_header(&encode_header_value(&anonymous_id));

            summary.attempts += 1;
            let result = self.transport.send_data(&payload).await;

            match UploadOutcome::classify(result) {
                UploadOutcome::Success(response) => {
                    tracing::debug!(batch = %id, response = %response, "Batch uploaded");
                    backoff.reset();
                    self.remove_batch(id).await;
                    summary.uploaded += 1;
                    return ControlFlow::Continue(());
                }
                UploadOutcome::Retryable(failure) => {
                    let delay = backoff.next_delay();
                    summary.retries += 1;
                    tracing::warn!(
                        batch = %id,
                        status = ?failure.status,
                        cause = %failure.cause,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable upload failure"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            tracing::info!(batch = %id, "Uploader shut down during backoff");
                            return ControlFlow::Break(RunStop::Shutdown);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                UploadOutcome::Drop(failure) => {
                    tracing::error!(
                        batch = %id,
                        status = ?failure.status,
                        cause = %failure.cause,
                        "Batch rejected by data plane, removing it"
                    );
                    backoff.reset();
                    self.remove_batch(id).await;
                    summary.dropped += 1;
                    return ControlFlow::Continue(());
                }
                UploadOutcome::InvalidWriteKey(failure) => {
                    tracing::error!(
                        batch = %id,
                        cause = %failure.cause,
                        "Write key rejected, stopping uploads"
                    );
                    self.signal_invalid_write_key();
                    return ControlFlow::Break(RunStop::InvalidWriteKey);
                }
                UploadOutcome::SourceDisabled(failure) => {
                    tracing::error!(
                        batch = %id,
                        cause = %failure.cause,
                        "Source is disabled, uploads paused until restart"
                    );
                    self.disabled.store(true, Ordering::SeqCst);
                    self.source.dispatch(SourceConfigAction::DisableSource);
                    return ControlFlow::Break(RunStop::SourceDisabled);
                }
            }
        }
    }

    async fn remove_batch(&self, id: &str) {
        if let Err(e) = self.storage.remove_batch(id).await {
            tracing::error!(batch = %id, error = %e, "Failed to remove batch");
        }
    }

    fn signal_invalid_write_key(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.invalid_write_key_tx {
            let _ = tx.send(());
        }
    }
}
