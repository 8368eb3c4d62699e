//! Durable object store: hierarchical keys, typed save/load helpers.
//!
//! Keys are `/`-separated logical paths (`State/ss/3`). Values are encoded
//! according to a [`CompressionHint`]: JSON for `None`, named-field
//! MessagePack for `Compact`.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

/// Encoding used for a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionHint {
    /// Plain JSON.
    #[default]
    None,
    /// MessagePack with named fields.
    Compact,
}

/// Whether the caller expects a key to be present when loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// A missing key is unexpected and logged.
    Expected,
    /// A missing key is normal.
    Optional,
}

/// Backend-agnostic durable store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether a value or folder exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Create an empty marker at `key`.
    async fn touch(&self, key: &str) -> Result<(), StoreError>;

    /// Delete `key` and everything below it. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Ensure a folder exists at `key`.
    async fn create_or_open_folder(&self, key: &str) -> Result<(), StoreError>;

    /// Replace the value at `key`.
    async fn save_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read the value at `key`, `None` if absent.
    async fn load_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Values that carry their own save timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
    fn set_timestamp(&mut self, at: DateTime<Utc>);
}

/// Join key segments with `/`.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split and validate a key into its segments.
pub(crate) fn key_segments(key: &str) -> Result<Vec<&str>, StoreError> {
    let segments: Vec<&str> = key.split('/').collect();
    if key.is_empty()
        || segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == ".." || s.contains('\\'))
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(segments)
}

pub fn encode<T: Serialize + ?Sized>(
    key: &str,
    value: &T,
    hint: CompressionHint,
) -> Result<Vec<u8>, StoreError> {
    let encoded = match hint {
        CompressionHint::None => serde_json::to_vec(value).map_err(|e| e.to_string()),
        CompressionHint::Compact => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
    };
    encoded.map_err(|reason| StoreError::Serialization {
        key: key.to_string(),
        reason,
    })
}

pub fn decode<T: DeserializeOwned>(
    key: &str,
    bytes: &[u8],
    hint: CompressionHint,
) -> Result<T, StoreError> {
    let decoded = match hint {
        CompressionHint::None => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        CompressionHint::Compact => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
    };
    decoded.map_err(|reason| StoreError::Serialization {
        key: key.to_string(),
        reason,
    })
}

/// Encode and store `value`.
pub async fn save<T: Serialize + Sync + ?Sized>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
    hint: CompressionHint,
) -> Result<(), StoreError> {
    let bytes = encode(key, value, hint)?;
    store.save_bytes(key, bytes).await
}

/// Store a timestamped value, stamping it with the current time when
/// `force_timestamp` is set.
pub async fn save_timestamped<T: Serialize + Timestamped + Sync>(
    store: &dyn ObjectStore,
    key: &str,
    value: &mut T,
    hint: CompressionHint,
    force_timestamp: bool,
) -> Result<(), StoreError> {
    if force_timestamp {
        value.set_timestamp(Utc::now());
    }
    save(store, key, &*value, hint).await
}

/// Load and decode a value. Missing, unreadable or corrupt values yield `None`.
pub async fn load<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
    presence: Presence,
    hint: CompressionHint,
) -> Option<T> {
    let bytes = match store.load_bytes(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            if presence == Presence::Expected {
                tracing::warn!(key, "Expected stored value is missing");
            }
            return None;
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "Failed to read stored value");
            return None;
        }
    };

    match decode(key, &bytes, hint) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "Stored value is corrupt");
            None
        }
    }
}
