//! Persisted topic→key table
//!
//! Maps every topic to its 32-byte symmetric key. The table is loaded at
//! init and flushed to the storage adapter on every mutation, so a settled
//! channel survives restart exactly when its key does.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::KEY_SIZE;
use super::error::{CryptoError, CryptoResult};
use crate::storage::{load_entries, save_entries, storage_key, Storage, StorageResult};
use crate::Topic;

#[derive(Serialize, Deserialize)]
struct KeychainEntry {
    topic: Topic,
    key: String,
}

/// Persisted mapping of topic → symmetric key
pub struct Keychain {
    storage: Arc<dyn Storage>,
    keys: RwLock<HashMap<Topic, [u8; KEY_SIZE]>>,
}

impl Keychain {
    /// Create an empty keychain backed by `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Keychain {
            storage,
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn table_key() -> String {
        storage_key("crypto", "keychain")
    }

    /// Load the persisted table
    pub async fn init(&self) -> StorageResult<()> {
        let entries: Vec<KeychainEntry> =
            load_entries(self.storage.as_ref(), &Self::table_key()).await?;

        let mut keys = self.keys.write().await;
        for entry in entries {
            let bytes = hex::decode(&entry.key).map_err(|e| crate::storage::StorageError::Corrupt {
                key: Self::table_key(),
                reason: e.to_string(),
            })?;
            if bytes.len() != KEY_SIZE {
                return Err(crate::storage::StorageError::Corrupt {
                    key: Self::table_key(),
                    reason: format!("key for {} has length {}", entry.topic, bytes.len()),
                });
            }
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&bytes);
            keys.insert(entry.topic, key);
        }
        Ok(())
    }

    async fn persist(&self) -> StorageResult<()> {
        let entries: Vec<KeychainEntry> = self
            .keys
            .read()
            .await
            .iter()
            .map(|(topic, key)| KeychainEntry {
                topic: topic.clone(),
                key: hex::encode(key),
            })
            .collect();
        save_entries(self.storage.as_ref(), &Self::table_key(), &entries).await
    }

    /// Store `key` at `topic`
    pub async fn set(&self, topic: &str, key: [u8; KEY_SIZE]) -> StorageResult<()> {
        self.keys.write().await.insert(topic.to_string(), key);
        self.persist().await
    }

    /// Read the key at `topic`
    pub async fn get(&self, topic: &str) -> CryptoResult<[u8; KEY_SIZE]> {
        self.keys
            .read()
            .await
            .get(topic)
            .copied()
            .ok_or_else(|| CryptoError::KeyNotFound {
                topic: topic.to_string(),
            })
    }

    /// Whether a key is stored at `topic`
    pub async fn has(&self, topic: &str) -> bool {
        self.keys.read().await.contains_key(topic)
    }

    /// Remove the key at `topic`
    pub async fn delete(&self, topic: &str) -> StorageResult<()> {
        self.keys.write().await.remove(topic);
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_set_get_delete() {
        let keychain = Keychain::new(Arc::new(MemoryStorage::new()));

        keychain.set("topic-a", [7u8; KEY_SIZE]).await.unwrap();
        assert!(keychain.has("topic-a").await);
        assert_eq!(keychain.get("topic-a").await.unwrap(), [7u8; KEY_SIZE]);

        keychain.delete("topic-a").await.unwrap();
        assert!(!keychain.has("topic-a").await);
        assert!(matches!(
            keychain.get("topic-a").await,
            Err(CryptoError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());

        let keychain = Keychain::new(storage.clone());
        keychain.set("topic-a", [9u8; KEY_SIZE]).await.unwrap();
        drop(keychain);

        let restored = Keychain::new(storage);
        restored.init().await.unwrap();
        assert_eq!(restored.get("topic-a").await.unwrap(), [9u8; KEY_SIZE]);
    }
}
