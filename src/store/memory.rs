//! In-process object store with write counters and failure injection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{ObjectStore, key_segments};
use crate::util::lock;

#[derive(Debug, Default)]
struct Contents {
    values: BTreeMap<String, Vec<u8>>,
    folders: BTreeSet<String>,
}

impl Contents {
    fn ensure_parents(&mut self, key: &str) {
        let mut prefix = String::new();
        let segments: Vec<&str> = key.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            self.folders.insert(prefix.clone());
        }
    }
}

fn is_below(candidate: &str, key: &str) -> bool {
    candidate
        .strip_prefix(key)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Non-durable store backed by ordered maps.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    contents: RwLock<Contents>,
    writes: Mutex<HashMap<String, usize>>,
    failing_prefix: Mutex<Option<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save_bytes` calls for `key`.
    pub fn write_count(&self, key: &str) -> usize {
        lock(&self.writes).get(key).copied().unwrap_or(0)
    }

    /// Reject every write (`save_bytes` and `touch`) whose key starts with
    /// `prefix`. An empty prefix rejects all writes.
    pub fn fail_writes(&self, prefix: impl Into<String>) {
        *lock(&self.failing_prefix) = Some(prefix.into());
    }

    pub fn allow_writes(&self) {
        *lock(&self.failing_prefix) = None;
    }

    /// All value keys currently stored, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.contents.read().await.values.keys().cloned().collect()
    }

    fn check_writable(&self, key: &str) -> Result<(), StoreError> {
        match lock(&self.failing_prefix).as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(StoreError::WriteRejected {
                key: key.to_string(),
                reason: "write failure injected".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        key_segments(key)?;
        self.check_writable(key)?;
        let mut contents = self.contents.write().await;
        contents.ensure_parents(key);
        contents.values.insert(key.to_string(), bytes);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        key_segments(key)?;
        let contents = self.contents.read().await;
        Ok(contents.values.contains_key(key) || contents.folders.contains(key))
    }

    async fn touch(&self, key: &str) -> Result<(), StoreError> {
        self.write(key, Vec::new()).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        key_segments(key)?;
        let mut contents = self.contents.write().await;
        contents
            .values
            .retain(|k, _| k != key && !is_below(k, key));
        contents.folders.retain(|k| k != key && !is_below(k, key));
        Ok(())
    }

    async fn create_or_open_folder(&self, key: &str) -> Result<(), StoreError> {
        key_segments(key)?;
        let mut contents = self.contents.write().await;
        contents.ensure_parents(key);
        contents.folders.insert(key.to_string());
        Ok(())
    }

    async fn save_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.write(key, bytes).await?;
        *lock(&self.writes).entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn load_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        key_segments(key)?;
        Ok(self.contents.read().await.values.get(key).cloned())
    }
}
