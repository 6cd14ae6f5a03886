//! Pending batch index
//!
//! Persisted as `id1,id2,id3`. Batch ids are file paths or synthetic ids that
//! never contain a comma.

/// Separator between ids in the persisted index
pub const ID_SEPARATOR: char = ',';

/// Ordered list of batch ids awaiting upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBatchIndex {
    ids: Vec<String>,
}

impl PendingBatchIndex {
    pub fn parse(raw: &str) -> Self {
        let ids = raw
            .split(ID_SEPARATOR)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        Self { ids }
    }

    pub fn serialize(&self) -> String {
        self.ids.join(&ID_SEPARATOR.to_string())
    }

    /// Append an id unless it is already present
    pub fn push(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Remove an id, returning whether it was present
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|existing| existing != id);
        self.ids.len() != before
    }

    pub fn retain(&mut self, f: impl FnMut(&String) -> bool) {
        self.ids.retain(f);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn into_ids(self) -> Vec<String> {
        self.ids
    }
}
