//! File-backed storage
//!
//! Layout inside the storage directory:
//!
//! ```text
//! <write_key>-<n>.tmp            the open batch (at most one)
//! <write_key>-<n>                closed batches, id = absolute path
//! eventship.properties.json      key/value store (index, counters, ids)
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::index::{PendingBatchIndex, ID_SEPARATOR};
use super::properties::PropertiesFile;
use super::{keys, Storage};
use crate::error::{Error, Result};
use crate::payload::{batch_suffix, BATCH_PREFIX};

const TMP_SUFFIX: &str = ".tmp";
const PROPERTIES_FILE: &str = "eventship.properties.json";

/// Durable storage rooted in one directory per write key
pub struct FileStorage {
    directory: PathBuf,
    write_key: String,
    max_batch_bytes: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    props: PropertiesFile,
    open: Option<OpenBatch>,
    deleted: bool,
}

struct OpenBatch {
    index: i64,
    path: PathBuf,
    file: File,
    len: u64,
    has_events: bool,
}

impl OpenBatch {
    async fn create(index: i64, path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(BATCH_PREFIX.as_bytes()).await?;
        file.flush().await?;

        Ok(Self {
            index,
            path,
            file,
            len: BATCH_PREFIX.len() as u64,
            has_events: false,
        })
    }

    async fn append(&mut self, event: &str) -> Result<()> {
        let chunk = if self.has_events {
            format!(",{}", event)
        } else {
            event.to_string()
        };
        self.file.write_all(chunk.as_bytes()).await?;
        self.file.flush().await?;
        self.len += chunk.len() as u64;
        self.has_events = true;
        Ok(())
    }
}

impl FileStorage {
    /// Open (or create) the storage directory and reconcile it with the
    /// persisted pending index
    pub async fn open(
        directory: impl AsRef<Path>,
        write_key: &str,
        max_batch_bytes: usize,
    ) -> Result<Self> {
        if write_key.contains(ID_SEPARATOR) {
            return Err(Error::Config(format!(
                "write key must not contain {:?}",
                ID_SEPARATOR
            )));
        }
        fs::create_dir_all(directory.as_ref()).await?;
        let directory = fs::canonicalize(directory.as_ref()).await?;
        // Batch ids are paths under this directory and the index is comma-joined.
        if directory.to_string_lossy().contains(ID_SEPARATOR) {
            return Err(Error::Config(format!(
                "storage directory {} must not contain {:?}",
                directory.display(),
                ID_SEPARATOR
            )));
        }
        let props = PropertiesFile::load(directory.join(PROPERTIES_FILE)).await;

        let storage = Self {
            directory,
            write_key: write_key.to_string(),
            max_batch_bytes: max_batch_bytes as u64,
            inner: Mutex::new(Inner {
                props,
                open: None,
                deleted: false,
            }),
        };
        storage.reconcile().await?;
        Ok(storage)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn closed_path(&self, index: i64) -> PathBuf {
        self.directory.join(format!("{}-{}", self.write_key, index))
    }

    fn open_path(&self, index: i64) -> PathBuf {
        self.directory
            .join(format!("{}-{}{}", self.write_key, index, TMP_SUFFIX))
    }

    /// Parse `<write_key>-<n>[.tmp]` into `(n, is_open)`
    fn parse_batch_name(&self, name: &str) -> Option<(i64, bool)> {
        let rest = name.strip_prefix(&self.write_key)?.strip_prefix('-')?;
        let (number, is_open) = match rest.strip_suffix(TMP_SUFFIX) {
            Some(number) => (number, true),
            None => (rest, false),
        };
        number
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(|n| (n, is_open))
    }

    /// Bring the index in line with the files on disk after a restart.
    ///
    /// Leftover open batches are closed, ids whose file is gone are dropped,
    /// and closed files missing from the index are appended in file order.
    async fn reconcile(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let mut closed: Vec<(i64, PathBuf)> = Vec::new();
        let mut highest: Option<i64> = None;

        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((number, is_open)) = self.parse_batch_name(name) else {
                continue;
            };
            highest = Some(highest.map_or(number, |h| h.max(number)));

            if is_open {
                if let Some(path) = self.close_leftover(&entry.path(), number).await? {
                    closed.push((number, path));
                }
            } else {
                closed.push((number, entry.path()));
            }
        }
        closed.sort_by_key(|(number, _)| *number);

        let stored_index = inner
            .props
            .get_str(keys::PENDING_BATCHES)
            .unwrap_or_default()
            .to_string();
        let mut index = PendingBatchIndex::parse(&stored_index);
        let on_disk: HashSet<String> = closed.iter().map(|(_, path)| path_to_id(path)).collect();

        let before = index.len();
        index.retain(|id| on_disk.contains(id));
        let dropped = before - index.len();

        let mut recovered = 0;
        for (_, path) in &closed {
            if index.push(path_to_id(path)) {
                recovered += 1;
            }
        }

        let stored_file_index = inner.props.get_i64(keys::FILE_INDEX).unwrap_or(0);
        let next_file_index = highest.map_or(0, |h| h + 1).max(stored_file_index);

        if index.serialize() != stored_index || next_file_index != stored_file_index {
            inner
                .props
                .set(keys::PENDING_BATCHES, Value::from(index.serialize()));
            inner
                .props
                .set(keys::FILE_INDEX, Value::from(next_file_index));
            inner.props.persist().await?;
        }

        tracing::info!(
            directory = %self.directory.display(),
            pending = index.len(),
            dropped,
            recovered,
            "Opened batch storage"
        );

        Ok(())
    }

    /// Close an open batch left behind by a previous process
    ///
    /// Returns `None` when the file held no events and was deleted.
    async fn close_leftover(&self, path: &Path, number: i64) -> Result<Option<PathBuf>> {
        let content = fs::read_to_string(path).await?;

        if content.is_empty() || content == BATCH_PREFIX {
            fs::remove_file(path).await?;
            return Ok(None);
        }

        let suffix = batch_suffix();
        if !content.ends_with(&suffix) {
            let mut file = OpenOptions::new().append(true).open(path).await?;
            file.write_all(suffix.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
        }

        let closed = self.closed_path(number);
        fs::rename(path, &closed).await?;
        tracing::info!(batch = %closed.display(), "Closed batch left open by previous run");
        Ok(Some(closed))
    }

    async fn close_open(&self, inner: &mut Inner) -> Result<()> {
        let Some(open) = inner.open.as_mut() else {
            return Ok(());
        };

        open.file.write_all(batch_suffix().as_bytes()).await?;
        open.file.flush().await?;
        open.file.sync_all().await?;

        let from = open.path.clone();
        let number = open.index;
        inner.open = None;

        // Bump first: a failed rename must not let the next batch reuse this name.
        inner.props.set(keys::FILE_INDEX, Value::from(number + 1));

        let to = self.closed_path(number);
        fs::rename(&from, &to).await?;

        let id = path_to_id(&to);
        let mut index =
            PendingBatchIndex::parse(inner.props.get_str(keys::PENDING_BATCHES).unwrap_or_default());
        index.push(id.clone());
        inner
            .props
            .set(keys::PENDING_BATCHES, Value::from(index.serialize()));
        inner.props.persist().await?;

        tracing::debug!(batch = %id, pending = index.len(), "Rolled over batch");
        Ok(())
    }

    async fn write_value(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.deleted {
            return Err(Error::ClientShutdown);
        }
        inner.props.set(key, value);
        inner.props.persist().await
    }
}

fn path_to_id(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Storage for FileStorage {
    async fn append_event(&self, event: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.deleted {
            return Err(Error::ClientShutdown);
        }

        if inner
            .open
            .as_ref()
            .is_some_and(|open| open.len > self.max_batch_bytes)
        {
            tracing::debug!(
                limit = self.max_batch_bytes,
                "Open batch reached size limit, rolling over"
            );
            self.close_open(inner).await?;
        }

        if inner.open.is_none() {
            let number = inner.props.get_i64(keys::FILE_INDEX).unwrap_or(0);
            inner.open = Some(OpenBatch::create(number, self.open_path(number)).await?);
        }

        let open = inner
            .open
            .as_mut()
            .ok_or_else(|| Error::Storage("no open batch".to_string()))?;
        open.append(event).await
    }

    async fn rollover(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.deleted {
            return Err(Error::ClientShutdown);
        }
        self.close_open(&mut guard).await
    }

    async fn write_string(&self, key: &str, value: &str) -> Result<()> {
        self.write_value(key, Value::from(value)).await
    }

    async fn write_long(&self, key: &str, value: i64) -> Result<()> {
        self.write_value(key, Value::from(value)).await
    }

    async fn write_bool(&self, key: &str, value: bool) -> Result<()> {
        self.write_value(key, Value::from(value)).await
    }

    async fn read_string(&self, key: &str, default: &str) -> String {
        let inner = self.inner.lock().await;
        inner
            .props
            .get_str(key)
            .map(String::from)
            .unwrap_or_else(|| default.to_string())
    }

    async fn read_long(&self, key: &str, default: i64) -> i64 {
        let inner = self.inner.lock().await;
        inner.props.get_i64(key).unwrap_or(default)
    }

    async fn read_bool(&self, key: &str, default: bool) -> bool {
        let inner = self.inner.lock().await;
        inner.props.get_bool(key).unwrap_or(default)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.props.remove(key) {
            inner.props.persist().await?;
        }
        Ok(())
    }

    async fn batch_exists(&self, id: &str) -> bool {
        fs::try_exists(id).await.unwrap_or(false)
    }

    async fn read_batch(&self, id: &str) -> Result<String> {
        Ok(fs::read_to_string(id).await?)
    }

    async fn remove_batch(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match fs::remove_file(id).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(batch = %id, error = %e, "Failed to delete batch file");
            }
        }

        if inner.deleted {
            return Ok(());
        }

        let mut index =
            PendingBatchIndex::parse(inner.props.get_str(keys::PENDING_BATCHES).unwrap_or_default());
        if index.remove(id) {
            inner
                .props
                .set(keys::PENDING_BATCHES, Value::from(index.serialize()));
            inner.props.persist().await?;
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.open = None;
        inner.deleted = true;
        inner.props.clear();

        match fs::remove_dir_all(&self.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(directory = %self.directory.display(), "Deleted batch storage");
        Ok(())
    }
}
