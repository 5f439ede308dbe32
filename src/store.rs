//! Subscription store
//!
//! A persisted, TTL-expiring table of pending or settled sequences, keyed
//! by topic, with event emission on every mutation. One instance exists per
//! (engine, phase) pair: pairing pending, pairing settled, session pending,
//! session settled.
//!
//! The store starts disabled: every public operation waits until the
//! persisted entries have been rehydrated and stale ones dropped, so callers
//! never observe a partially-restored table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sequence::types::Relay;
use crate::storage::{load_entries, save_entries, storage_key, Storage};
use crate::Topic;

/// Interval of the TTL heartbeat
pub const BEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Deletion reason for entries that outlived their TTL
pub const REASON_EXPIRED: &str = "EXPIRED";

/// Deletion reason for pending entries whose sequence settled
pub const REASON_SETTLED: &str = "SETTLED";

/// Seconds since the Unix epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A stored sequence with its subscription metadata
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry<T> {
    /// Topic the sequence listens on
    pub topic: Topic,
    /// Relay descriptor the subscription uses
    pub relay: Relay,
    /// Absolute expiry, seconds since the Unix epoch
    pub expiry: u64,
    /// The sequence itself
    pub data: T,
}

/// Store mutation events
#[derive(Clone, Debug)]
pub enum StoreEvent<T> {
    /// A new entry was inserted
    Created(Entry<T>),
    /// An entry's sequence data was replaced
    Updated(Entry<T>),
    /// An entry was removed
    Deleted {
        /// The removed entry
        entry: Entry<T>,
        /// Why it was removed (an error code or a peer-supplied reason)
        reason: String,
    },
}

/// Persisted TTL-expiring table of sequences
pub struct SequenceStore<T> {
    name: String,
    storage: Arc<dyn Storage>,
    default_ttl: u64,
    entries: RwLock<HashMap<Topic, Entry<T>>>,
    timers: Mutex<HashMap<Topic, JoinHandle<()>>>,
    events: broadcast::Sender<StoreEvent<T>>,
    enabled_tx: watch::Sender<bool>,
    enabled_rx: watch::Receiver<bool>,
}

impl<T> SequenceStore<T>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a disabled store persisting under `wc@2:client//<subsystem>:<table>`
    pub fn new(
        subsystem: &str,
        table: &str,
        storage: Arc<dyn Storage>,
        default_ttl: u64,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (enabled_tx, enabled_rx) = watch::channel(false);
        Arc::new(SequenceStore {
            name: storage_key(subsystem, table),
            storage,
            default_ttl,
            entries: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            events,
            enabled_tx,
            enabled_rx,
        })
    }

    /// Restore persisted entries, drop expired ones, enable the store and
    /// start the TTL heartbeat
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let persisted: Vec<Entry<T>> = load_entries(self.storage.as_ref(), &self.name).await?;
        let now = now_secs();

        let mut expired = Vec::new();
        {
            let mut entries = self.entries.write().await;
            for entry in persisted {
                if entries.contains_key(&entry.topic) {
                    return Err(Error::RestoreWillOverride {
                        topic: entry.topic,
                    });
                }
                if entry.expiry <= now {
                    expired.push(entry);
                } else {
                    entries.insert(entry.topic.clone(), entry);
                }
            }
        }
        if !expired.is_empty() {
            self.persist().await?;
            for entry in expired {
                debug!(store = %self.name, topic = %entry.topic, "dropping stale entry on restore");
                let _ = self.events.send(StoreEvent::Deleted {
                    entry,
                    reason: REASON_EXPIRED.to_string(),
                });
            }
        }

        // Arm precise timers for anything already close to its expiry.
        let soon: Vec<(Topic, u64)> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.expiry <= now + BEAT_INTERVAL.as_secs())
            .map(|e| (e.topic.clone(), e.expiry))
            .collect();
        for (topic, expiry) in soon {
            self.arm(topic, expiry).await;
        }

        let _ = self.enabled_tx.send(true);
        self.spawn_heartbeat();
        Ok(())
    }

    /// Wait until the store is enabled
    async fn ready(&self) {
        let mut rx = self.enabled_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribe to mutation events
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent<T>> {
        self.events.subscribe()
    }

    /// Insert `data` at `topic`, or update it if the topic is present
    ///
    /// Absent an explicit expiry the entry lives for the store default TTL.
    /// A duplicate topic degrades to an update so restarts are idempotent.
    pub async fn set(
        self: &Arc<Self>,
        topic: &str,
        data: T,
        relay: Relay,
        expiry: Option<u64>,
    ) -> Result<()> {
        self.ready().await;

        if self.entries.read().await.contains_key(topic) {
            return self.update(topic, data).await;
        }

        let entry = Entry {
            topic: topic.to_string(),
            relay,
            expiry: expiry.unwrap_or_else(|| now_secs() + self.default_ttl),
            data,
        };
        self.entries
            .write()
            .await
            .insert(topic.to_string(), entry.clone());
        self.persist().await?;

        if entry.expiry <= now_secs() + BEAT_INTERVAL.as_secs() {
            self.arm(entry.topic.clone(), entry.expiry).await;
        }
        let _ = self.events.send(StoreEvent::Created(entry));
        Ok(())
    }

    /// Read the entry at `topic`
    pub async fn get(&self, topic: &str) -> Result<Entry<T>> {
        self.ready().await;
        self.entries
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::NoMatchingTopic {
                topic: topic.to_string(),
            })
    }

    /// Whether an entry exists at `topic`
    pub async fn has(&self, topic: &str) -> bool {
        self.ready().await;
        self.entries.read().await.contains_key(topic)
    }

    /// Replace the sequence data at `topic`
    pub async fn update(&self, topic: &str, data: T) -> Result<()> {
        self.ready().await;

        let entry = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(topic).ok_or_else(|| Error::NoMatchingTopic {
                topic: topic.to_string(),
            })?;
            entry.data = data;
            entry.clone()
        };
        self.persist().await?;
        let _ = self.events.send(StoreEvent::Updated(entry));
        Ok(())
    }

    /// Remove the entry at `topic`, cancelling its timer
    pub async fn delete(&self, topic: &str, reason: &str) -> Result<()> {
        self.ready().await;

        let entry = self.entries.write().await.remove(topic);
        let entry = match entry {
            Some(entry) => entry,
            None => {
                return Err(Error::NoMatchingTopic {
                    topic: topic.to_string(),
                })
            }
        };
        if let Some(timer) = self.timers.lock().await.remove(topic) {
            timer.abort();
        }
        self.persist().await?;
        let _ = self.events.send(StoreEvent::Deleted {
            entry,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.ready().await;
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All stored topics
    pub async fn topics(&self) -> Vec<Topic> {
        self.ready().await;
        self.entries.read().await.keys().cloned().collect()
    }

    /// All stored entries
    pub async fn values(&self) -> Vec<Entry<T>> {
        self.ready().await;
        self.entries.read().await.values().cloned().collect()
    }

    async fn persist(&self) -> Result<()> {
        let entries: Vec<Entry<T>> = self.entries.read().await.values().cloned().collect();
        save_entries(self.storage.as_ref(), &self.name, &entries).await?;
        Ok(())
    }

    /// Arm a precise expiry timer; at most one per topic
    async fn arm(self: &Arc<Self>, topic: Topic, expiry: u64) {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(&topic) {
            return;
        }
        let store = Arc::downgrade(self);
        let timer_topic = topic.clone();
        let handle = tokio::spawn(async move {
            let delay = expiry.saturating_sub(now_secs());
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if let Some(store) = store.upgrade() {
                store.timers.lock().await.remove(&timer_topic);
                if let Err(e) = store.delete(&timer_topic, REASON_EXPIRED).await {
                    warn!(topic = %timer_topic, "expiry delete failed: {e}");
                }
            }
        });
        timers.insert(topic, handle);
    }

    /// Rewalk entries every beat and arm timers for those about to expire
    fn spawn_heartbeat(self: &Arc<Self>) {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut beat = tokio::time::interval(BEAT_INTERVAL);
            beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                beat.tick().await;
                let Some(store) = store.upgrade() else { break };
                let horizon = now_secs() + BEAT_INTERVAL.as_secs();
                let soon: Vec<(Topic, u64)> = store
                    .entries
                    .read()
                    .await
                    .values()
                    .filter(|e| e.expiry <= horizon)
                    .map(|e| (e.topic.clone(), e.expiry))
                    .collect();
                for (topic, expiry) in soon {
                    store.arm(topic, expiry).await;
                }
            }
        });
    }
}
