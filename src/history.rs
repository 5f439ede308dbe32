//! JSON-RPC history
//!
//! Records every outgoing request until the matching response arrives or the
//! caller gives up. Entries are persisted so an in-flight request survives a
//! restart; a response routed in after reload still clears its entry even
//! though no caller is waiting anymore.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::relay::jsonrpc::{Request, Response};
use crate::storage::{load_entries, save_entries, storage_key, Storage};
use crate::Topic;

/// A recorded outgoing request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Request id, the correlation key
    pub id: u64,
    /// Topic the request was published on
    pub topic: Topic,
    /// The outgoing request document
    pub request: Request,
    /// Target chain, when the request named one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

/// Ledger of outgoing requests awaiting responses
pub struct JsonRpcHistory {
    storage: Arc<dyn Storage>,
    entries: RwLock<HashMap<u64, HistoryEntry>>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
}

impl JsonRpcHistory {
    /// Create an empty history backed by `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        JsonRpcHistory {
            storage,
            entries: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn table_key() -> String {
        storage_key("jsonrpc", "history")
    }

    /// Restore persisted entries
    ///
    /// Restored requests have no waiter; they are cleared when a response
    /// finally arrives or when explicitly purged.
    pub async fn init(&self) -> Result<()> {
        let persisted: Vec<HistoryEntry> =
            load_entries(self.storage.as_ref(), &Self::table_key()).await?;
        let mut entries = self.entries.write().await;
        for entry in persisted {
            entries.insert(entry.id, entry);
        }
        Ok(())
    }

    /// Record an outgoing request; the receiver resolves with its response
    pub async fn insert(&self, entry: HistoryEntry) -> Result<oneshot::Receiver<Response>> {
        let id = entry.id;
        self.entries.write().await.insert(id, entry);
        self.persist().await?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        Ok(rx)
    }

    /// Route an inbound response to its waiter and clear the entry
    ///
    /// Returns the cleared entry, or `None` when the response matches no
    /// recorded request.
    pub async fn resolve(&self, response: Response) -> Result<Option<HistoryEntry>> {
        let entry = self.entries.write().await.remove(&response.id);
        if entry.is_none() {
            debug!(id = response.id, "response matches no recorded request");
            return Ok(None);
        }
        self.persist().await?;

        if let Some(waiter) = self.waiters.lock().await.remove(&response.id) {
            let _ = waiter.send(response);
        }
        Ok(entry)
    }

    /// Drop a recorded request, abandoning its waiter
    pub async fn purge(&self, id: u64) -> Result<()> {
        self.entries.write().await.remove(&id);
        self.waiters.lock().await.remove(&id);
        self.persist().await
    }

    /// Read a recorded request
    pub async fn get(&self, id: u64) -> Option<HistoryEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    /// Number of requests awaiting responses
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no requests are awaiting responses
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self) -> Result<()> {
        let entries: Vec<HistoryEntry> = self.entries.read().await.values().cloned().collect();
        save_entries(self.storage.as_ref(), &Self::table_key(), &entries).await?;
        Ok(())
    }
}
