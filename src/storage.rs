//! Storage adapter
//!
//! Opaque key→bytes persistence behind an async trait. Everything the
//! client persists (keychain, pending and settled sequences, JSON-RPC
//! history) goes through this boundary; durable backends live outside the
//! crate. An in-memory backend is provided for tests and as the default.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend failed to read or write
    #[error("Storage backend failed: {0}")]
    Backend(String),

    /// A persisted value could not be decoded
    #[error("Corrupt entry at {key}: {reason}")]
    Corrupt {
        /// Key of the undecodable value
        key: String,
        /// Decoder message
        reason: String,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Abstract key-value storage
///
/// Values are opaque byte strings; callers own the encoding.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value at `key`, if any
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write `value` at `key`, replacing any previous value
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Remove the value at `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// In-memory storage backend
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        MemoryStorage {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Build the canonical storage key for a subsystem table
///
/// Layout: `wc@2:client//<subsystem>:<table>`
pub fn storage_key(subsystem: &str, table: &str) -> String {
    format!("wc@2:client//{}:{}", subsystem, table)
}

/// Load a JSON array of entries from `key`; an absent key is an empty list
pub async fn load_entries<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> StorageResult<Vec<T>> {
    match storage.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(Vec::new()),
    }
}

/// Persist `entries` as a JSON array at `key`
pub async fn save_entries<T: Serialize>(
    storage: &dyn Storage,
    key: &str,
    entries: &[T],
) -> StorageResult<()> {
    let bytes = serde_json::to_vec(entries).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    storage.set(key, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();

        storage.set("k", b"value".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"value".to_vec()));

        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_ok() {
        let storage = MemoryStorage::new();
        storage.delete("never-set").await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_entries() {
        let storage = MemoryStorage::new();
        let key = storage_key("pairing", "settled");

        let entries = vec!["a".to_string(), "b".to_string()];
        save_entries(&storage, &key, &entries).await.unwrap();

        let restored: Vec<String> = load_entries(&storage, &key).await.unwrap();
        assert_eq!(restored, entries);
    }

    #[tokio::test]
    async fn test_absent_key_is_empty_list() {
        let storage = MemoryStorage::new();
        let restored: Vec<String> = load_entries(&storage, "missing").await.unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(
            storage_key("session", "pending"),
            "wc@2:client//session:pending"
        );
    }
}
