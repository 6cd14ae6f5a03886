//! In-memory storage for tests and ephemeral clients

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::index::PendingBatchIndex;
use super::{keys, Storage};
use crate::error::{Error, Result};
use crate::payload::{batch_suffix, BATCH_PREFIX};

/// Storage that keeps batches and keys in process memory
///
/// Batch ids look like `memory://batch-<n>`.
pub struct InMemoryStorage {
    max_batch_bytes: usize,
    state: Mutex<State>,
    writes: AtomicUsize,
}

#[derive(Default)]
struct State {
    open: Option<String>,
    next_batch: u64,
    batches: BTreeMap<String, String>,
    values: HashMap<String, Value>,
    deleted: bool,
}

impl State {
    fn close_open(&mut self) {
        let Some(mut content) = self.open.take() else {
            return;
        };
        content.push_str(&batch_suffix());

        let id = format!("memory://batch-{}", self.next_batch);
        self.next_batch += 1;
        self.batches.insert(id.clone(), content);

        let mut index = self.index();
        index.push(id);
        self.values
            .insert(keys::PENDING_BATCHES.to_string(), Value::from(index.serialize()));
    }

    fn index(&self) -> PendingBatchIndex {
        PendingBatchIndex::parse(
            self.values
                .get(keys::PENDING_BATCHES)
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )
    }
}

impl InMemoryStorage {
    pub fn new(max_batch_bytes: usize) -> Self {
        Self {
            max_batch_bytes,
            state: Mutex::new(State::default()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of mutating calls that reached the store
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of events in the open batch
    pub fn open_batch_events(&self) -> usize {
        self.lock()
            .open
            .as_deref()
            .map(|open| {
                let body = &open[BATCH_PREFIX.len()..];
                if body.is_empty() {
                    0
                } else {
                    serde_json::from_str::<Vec<Value>>(&format!("[{}]", body))
                        .map(|events| events.len())
                        .unwrap_or(0)
                }
            })
            .unwrap_or(0)
    }

    /// Insert a closed batch directly, bypassing the open batch
    pub fn insert_batch(&self, content: impl Into<String>) -> String {
        let mut state = self.lock();
        let id = format!("memory://batch-{}", state.next_batch);
        state.next_batch += 1;
        state.batches.insert(id.clone(), content.into());
        let mut index = state.index();
        index.push(id.clone());
        state
            .values
            .insert(keys::PENDING_BATCHES.to_string(), Value::from(index.serialize()));
        id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_value(&self, key: &str, value: Value) -> Result<()> {
        let mut state = self.lock();
        if state.deleted {
            return Err(Error::ClientShutdown);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        state.values.insert(key.to_string(), value);
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(500 * 1024)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn append_event(&self, event: &str) -> Result<()> {
        let mut state = self.lock();
        if state.deleted {
            return Err(Error::ClientShutdown);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        if state
            .open
            .as_ref()
            .is_some_and(|open| open.len() > self.max_batch_bytes)
        {
            state.close_open();
        }

        match state.open.as_mut() {
            Some(open) => {
                open.push(',');
                open.push_str(event);
            }
            None => state.open = Some(format!("{}{}", BATCH_PREFIX, event)),
        }
        Ok(())
    }

    async fn rollover(&self) -> Result<()> {
        let mut state = self.lock();
        if state.deleted {
            return Err(Error::ClientShutdown);
        }
        if state.open.is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        state.close_open();
        Ok(())
    }

    async fn write_string(&self, key: &str, value: &str) -> Result<()> {
        self.write_value(key, Value::from(value))
    }

    async fn write_long(&self, key: &str, value: i64) -> Result<()> {
        self.write_value(key, Value::from(value))
    }

    async fn write_bool(&self, key: &str, value: bool) -> Result<()> {
        self.write_value(key, Value::from(value))
    }

    async fn read_string(&self, key: &str, default: &str) -> String {
        self.lock()
            .values
            .get(key)
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| default.to_string())
    }

    async fn read_long(&self, key: &str, default: i64) -> i64 {
        self.lock()
            .values
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    async fn read_bool(&self, key: &str, default: bool) -> bool {
        self.lock()
            .values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock().values.remove(key);
        Ok(())
    }

    async fn batch_exists(&self, id: &str) -> bool {
        self.lock().batches.contains_key(id)
    }

    async fn read_batch(&self, id: &str) -> Result<String> {
        self.lock()
            .batches
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("batch not found: {}", id)))
    }

    async fn remove_batch(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.batches.remove(id);
        let mut index = state.index();
        if index.remove(id) {
            state
                .values
                .insert(keys::PENDING_BATCHES.to_string(), Value::from(index.serialize()));
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let mut state = self.lock();
        *state = State {
            deleted: true,
            ..State::default()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_rollover_and_remove() {
        let storage = InMemoryStorage::default();
        storage.append_event(r#"{"n":1}"#).await.unwrap();
        storage.append_event(r#"{"n":2}"#).await.unwrap();
        assert_eq!(storage.open_batch_events(), 2);

        storage.rollover().await.unwrap();
        assert_eq!(storage.open_batch_events(), 0);

        let pending = storage.pending_batches().await;
        assert_eq!(pending, ["memory://batch-0"]);
        let content = storage.read_batch(&pending[0]).await.unwrap();
        assert!(content.starts_with(r#"{"batch":[{"n":1},{"n":2}]"#));

        storage.remove_batch(&pending[0]).await.unwrap();
        assert!(storage.pending_batches().await.is_empty());
        assert!(!storage.batch_exists(&pending[0]).await);
        assert!(storage.read_batch(&pending[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_write_count_tracks_mutations() {
        let storage = InMemoryStorage::default();
        storage.rollover().await.unwrap();
        assert_eq!(storage.write_count(), 0);

        storage.append_event("{}").await.unwrap();
        storage.write_string("k", "v").await.unwrap();
        storage.rollover().await.unwrap();
        assert_eq!(storage.write_count(), 3);
    }

    #[tokio::test]
    async fn test_delete_all() {
        let storage = InMemoryStorage::default();
        storage.insert_batch("{}");
        storage.delete_all().await.unwrap();
        assert!(storage.pending_batches().await.is_empty());
        assert!(storage.write_string("k", "v").await.is_err());
    }
}
