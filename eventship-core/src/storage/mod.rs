//! Durable storage for events, batches and small key/value state
//!
//! ## Model
//!
//! Events are appended to one *open* batch. [`Storage::rollover`] closes it:
//! the batch gets its envelope suffix, becomes immutable, and its id is
//! appended to the pending index. The index is a single comma-separated
//! string under [`keys::PENDING_BATCHES`] in the key/value store, so it
//! survives restarts.
//!
//! Every operation that touches the open batch or the index runs under the
//! implementation's internal lock. Rollover (ingestion side) and batch
//! removal (upload side) therefore never interleave their index updates.

mod file;
mod index;
mod memory;
mod properties;

pub use file::FileStorage;
pub use index::PendingBatchIndex;
pub use memory::InMemoryStorage;

use async_trait::async_trait;

use crate::error::Result;

/// Keys used in the key/value store
pub mod keys {
    /// Comma-separated ids of closed, not yet uploaded batches
    pub const PENDING_BATCHES: &str = "pending_batches";
    /// Index used to name the next batch file
    pub const FILE_INDEX: &str = "file_index";
    /// Anonymous id of the current device/user
    pub const ANONYMOUS_ID: &str = "anonymous_id";
    /// Anonymous id carried by the most recently stored event
    pub const LAST_EVENT_ANONYMOUS_ID: &str = "last_event_anonymous_id";
}

/// Contract consumed by the queue and the uploader
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append one serialized event to the open batch, creating it if needed.
    ///
    /// When the open batch has already grown past the configured batch size
    /// it is rolled over first.
    async fn append_event(&self, event: &str) -> Result<()>;

    /// Close the open batch and register it as pending. No-op when no batch
    /// is open.
    async fn rollover(&self) -> Result<()>;

    async fn write_string(&self, key: &str, value: &str) -> Result<()>;
    async fn write_long(&self, key: &str, value: i64) -> Result<()>;
    async fn write_bool(&self, key: &str, value: bool) -> Result<()>;

    async fn read_string(&self, key: &str, default: &str) -> String;
    async fn read_long(&self, key: &str, default: i64) -> i64;
    async fn read_bool(&self, key: &str, default: bool) -> bool;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Pending batch ids in rollover order
    async fn pending_batches(&self) -> Vec<String> {
        PendingBatchIndex::parse(&self.read_string(keys::PENDING_BATCHES, "").await).into_ids()
    }

    /// Whether the content of a batch is still present
    async fn batch_exists(&self, id: &str) -> bool;

    /// Read the full text of a closed batch
    async fn read_batch(&self, id: &str) -> Result<String>;

    /// Delete a batch's content and drop its id from the pending index
    async fn remove_batch(&self, id: &str) -> Result<()>;

    /// Delete every batch and key for this write key. Later writes fail.
    async fn delete_all(&self) -> Result<()>;
}
