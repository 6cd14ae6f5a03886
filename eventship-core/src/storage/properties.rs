//! JSON key/value file backing the storage's small persistent state

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::error::Result;

pub(crate) struct PropertiesFile {
    path: PathBuf,
    values: Map<String, Value>,
}

impl PropertiesFile {
    /// Load the file, starting empty when it is missing or unreadable
    pub(crate) async fn load(path: PathBuf) -> Self {
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Properties file is corrupt, starting empty"
                    );
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read properties file, starting empty"
                );
                Map::new()
            }
        };

        Self { path, values }
    }

    pub(crate) fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub(crate) fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub(crate) fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub(crate) fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }

    /// Write through a temp file and rename so a crash never leaves half a file
    pub(crate) async fn persist(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_vec(&self.values)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
