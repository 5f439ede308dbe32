//! Relayer
//!
//! A thin JSON-RPC client over a reconnecting transport. Multiplexes many
//! topic subscriptions over one connection, correlates inbound responses to
//! in-flight requests, decrypts server pushes and re-emits them as
//! `{topic, payload}` events on an internal bus.
//!
//! Transport failures never surface to callers: the I/O loop reconnects
//! unconditionally, restores every held subscription and flushes queued
//! outbound frames.

pub mod jsonrpc;
pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::relay::jsonrpc::{Payload, Request, Response};
use crate::relay::transport::{Transport, TransportError};
use crate::Topic;

/// Default relay endpoint
pub const DEFAULT_RELAY_URL: &str = "wss://relay.walletconnect.org";

/// Default relay protocol name; prefixes every relay RPC method
pub const RELAY_PROTOCOL: &str = "waku";

/// Default TTL for published messages, in seconds
pub const DEFAULT_PUBLISH_TTL: u64 = 86400;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 256;

/// Parameters of `<proto>_publish`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishParams {
    /// Destination topic
    pub topic: Topic,
    /// Hex-encoded message body
    pub message: String,
    /// Relay-side retention, in seconds
    pub ttl: u64,
}

/// Parameters of `<proto>_subscribe`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Topic to subscribe to
    pub topic: Topic,
}

/// Parameters of `<proto>_unsubscribe`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    /// Server-assigned subscription id
    pub id: String,
}

/// Parameters of the `<proto>_subscription` server push
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Server-assigned subscription id
    pub id: String,
    /// Push payload
    pub data: SubscriptionData,
}

/// Body of a `<proto>_subscription` push
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionData {
    /// Hex-encoded message body
    pub message: String,
}

/// A decrypted inbound message, keyed by the topic it arrived on
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Topic the subscription was registered on
    pub topic: Topic,
    /// Decrypted UTF-8 payload (a JSON-RPC document)
    pub payload: String,
}

struct RelayerState {
    crypto: Arc<Crypto>,
    protocol: String,
    outbound: mpsc::UnboundedSender<String>,
    /// In-flight requests awaiting a response
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    /// Subscribe requests whose server-assigned id is not yet known;
    /// bound inside the I/O loop so pushes never race the id binding
    pending_subscribes: Mutex<HashMap<u64, Topic>>,
    /// Subscription id → topic
    subscriptions: Mutex<HashMap<String, Topic>>,
    /// Topic → subscription ids
    topics: Mutex<HashMap<Topic, Vec<String>>>,
    events: broadcast::Sender<InboundMessage>,
}

/// The relayer
#[derive(Clone)]
pub struct Relayer {
    state: Arc<RelayerState>,
    outbound_rx: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

impl Relayer {
    /// Create a relayer using `crypto` for payload sealing
    pub fn new(crypto: Arc<Crypto>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Relayer {
            state: Arc::new(RelayerState {
                crypto,
                protocol: RELAY_PROTOCOL.to_string(),
                outbound,
                pending: Mutex::new(HashMap::new()),
                pending_subscribes: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                events,
            }),
            outbound_rx: Arc::new(std::sync::Mutex::new(Some(outbound_rx))),
        }
    }

    /// Start the I/O loop over `transport`
    pub fn init(&self, transport: Box<dyn Transport>) {
        let rx = self
            .outbound_rx
            .lock()
            .expect("outbound receiver lock")
            .take()
            .expect("relayer initialized twice");
        let relayer = self.clone();
        tokio::spawn(async move {
            relayer.io_loop(transport, rx).await;
        });
    }

    /// Subscribe to the inbound message bus
    pub fn subscribe_events(&self) -> broadcast::Receiver<InboundMessage> {
        self.state.events.subscribe()
    }

    /// Publish `payload` on `topic`
    ///
    /// The payload is sealed under the topic key when one exists, and
    /// hex-encoded plaintext otherwise (pre-settlement handshake traffic).
    pub async fn publish(&self, topic: &str, payload: &str, ttl: Option<u64>) -> Result<()> {
        let message = if self.state.crypto.has_keys(topic).await {
            self.state.crypto.encrypt(topic, payload).await?
        } else {
            hex::encode(payload.as_bytes())
        };
        let params = PublishParams {
            topic: topic.to_string(),
            message,
            ttl: ttl.unwrap_or(DEFAULT_PUBLISH_TTL),
        };
        self.rpc("publish", serde_json::to_value(params)?).await?;
        Ok(())
    }

    /// Subscribe to `topic`; returns the server-assigned subscription id
    pub async fn subscribe(&self, topic: &str) -> Result<String> {
        let params = SubscribeParams {
            topic: topic.to_string(),
        };
        let req = Request::new(
            &format!("{}_subscribe", self.state.protocol),
            serde_json::to_value(params)?,
        );
        self.state
            .pending_subscribes
            .lock()
            .await
            .insert(req.id, topic.to_string());
        let result = self.rpc_request(req).await?;
        let id: String = serde_json::from_value(result).map_err(|_| Error::MissingOrInvalid {
            field: "subscription id".to_string(),
        })?;
        debug!(topic, %id, "subscribed");
        Ok(id)
    }

    /// Drop subscriptions for `topic`
    ///
    /// With `id`, removes exactly that subscription; without, removes every
    /// subscription held for the topic.
    pub async fn unsubscribe(&self, topic: &str, id: Option<&str>) -> Result<()> {
        let ids: Vec<String> = match id {
            Some(one) => {
                let mut topics = self.state.topics.lock().await;
                if let Some(subs) = topics.get_mut(topic) {
                    subs.retain(|s| s != one);
                    if subs.is_empty() {
                        topics.remove(topic);
                    }
                }
                vec![one.to_string()]
            }
            None => self
                .state
                .topics
                .lock()
                .await
                .remove(topic)
                .unwrap_or_default(),
        };

        for sub_id in ids {
            self.state.subscriptions.lock().await.remove(&sub_id);
            let params = UnsubscribeParams { id: sub_id.clone() };
            if let Err(e) = self.rpc("unsubscribe", serde_json::to_value(params)?).await {
                debug!(topic, %sub_id, "unsubscribe failed: {e}");
            }
        }
        Ok(())
    }

    /// Topics with at least one live subscription
    pub async fn subscribed_topics(&self) -> Vec<Topic> {
        self.state.topics.lock().await.keys().cloned().collect()
    }

    async fn rpc(&self, verb: &str, params: Value) -> Result<Value> {
        let req = Request::new(&format!("{}_{}", self.state.protocol, verb), params);
        self.rpc_request(req).await
    }

    async fn rpc_request(&self, req: Request) -> Result<Value> {
        let id = req.id;
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_string(&req)?;
        if self.state.outbound.send(frame).is_err() {
            self.state.pending.lock().await.remove(&id);
            return Err(Error::Transport(TransportError::Disconnected));
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(resp)) => resp.into_result(),
            Ok(Err(_)) => Err(Error::MissingResponse),
            Err(_) => {
                self.state.pending.lock().await.remove(&id);
                self.state.pending_subscribes.lock().await.remove(&id);
                Err(Error::NoMatchingResponse { id })
            }
        }
    }

    async fn io_loop(
        self,
        mut transport: Box<dyn Transport>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut queue: VecDeque<String> = VecDeque::new();
        loop {
            if !transport.is_connected() {
                loop {
                    match transport.reconnect().await {
                        Ok(()) => break,
                        Err(e) => {
                            debug!("reconnect attempt failed: {e}");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
                info!("transport reconnected, restoring subscriptions");
                let relayer = self.clone();
                tokio::spawn(async move { relayer.resubscribe_all().await });
            }

            while let Some(frame) = queue.pop_front() {
                if let Err(e) = transport.send(frame.clone()).await {
                    if transport.is_connected() {
                        warn!("dropping unsendable frame: {e}");
                    } else {
                        queue.push_front(frame);
                    }
                    break;
                }
            }
            if !transport.is_connected() {
                continue;
            }

            tokio::select! {
                maybe = outbound_rx.recv() => match maybe {
                    Some(frame) => queue.push_back(frame),
                    None => break,
                },
                result = transport.receive() => match result {
                    Ok(frame) => self.handle_inbound(frame).await,
                    Err(e) => debug!("transport dropped: {e}"),
                },
            }
        }
    }

    async fn handle_inbound(&self, frame: String) {
        let payload: Payload = match serde_json::from_str(&frame) {
            Ok(p) => p,
            Err(e) => {
                warn!("undecodable inbound frame: {e}");
                return;
            }
        };

        match payload {
            Payload::Response(resp) => {
                // Bind subscription ids before waking the caller so a push
                // arriving right behind the response finds the topic.
                let pending_topic = self.state.pending_subscribes.lock().await.remove(&resp.id);
                if let (Some(topic), Some(Value::String(sub_id))) = (pending_topic, &resp.result) {
                    self.state
                        .subscriptions
                        .lock()
                        .await
                        .insert(sub_id.clone(), topic.clone());
                    self.state
                        .topics
                        .lock()
                        .await
                        .entry(topic)
                        .or_default()
                        .push(sub_id.clone());
                }

                match self.state.pending.lock().await.remove(&resp.id) {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => debug!(id = resp.id, "unmatched response"),
                }
            }
            Payload::Request(req) if req.method.ends_with("_subscription") => {
                self.handle_push(req).await;
            }
            Payload::Request(req) => {
                let resp = Response::error(req.id, -32601, "unknown method");
                if let Ok(frame) = serde_json::to_string(&resp) {
                    let _ = self.state.outbound.send(frame);
                }
            }
        }
    }

    async fn handle_push(&self, req: Request) {
        let ack = Response::result(req.id, json!(true));

        let params: SubscriptionParams = match serde_json::from_value(req.params) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed subscription push: {e}");
                return;
            }
        };

        let topic = match self.state.subscriptions.lock().await.get(&params.id) {
            Some(topic) => topic.clone(),
            None => {
                warn!(id = %params.id, "push for unknown subscription");
                if let Ok(frame) = serde_json::to_string(&ack) {
                    let _ = self.state.outbound.send(frame);
                }
                return;
            }
        };

        let payload = if self.state.crypto.has_keys(&topic).await {
            match self.state.crypto.decrypt(&topic, &params.data.message).await {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(%topic, "dropping undecryptable message: {e}");
                    None
                }
            }
        } else {
            hex::decode(&params.data.message)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .or_else(|| {
                    warn!(%topic, "dropping non-utf8 plaintext message");
                    None
                })
        };

        if let Some(payload) = payload {
            let _ = self.state.events.send(InboundMessage { topic, payload });
        }
        if let Ok(frame) = serde_json::to_string(&ack) {
            let _ = self.state.outbound.send(frame);
        }
    }

    async fn resubscribe_all(&self) {
        let topics: Vec<Topic> = self.state.topics.lock().await.keys().cloned().collect();
        for topic in topics {
            // Server-side state died with the connection; forget the old ids
            // and register afresh.
            self.state.topics.lock().await.insert(topic.clone(), Vec::new());
            self.state
                .subscriptions
                .lock()
                .await
                .retain(|_, t| t != &topic);
            match self.subscribe(&topic).await {
                Ok(id) => debug!(%topic, %id, "resubscribed"),
                Err(e) => warn!(%topic, "resubscribe failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::transport::memory::MemoryRelay;
    use crate::storage::MemoryStorage;

    fn crypto() -> Arc<Crypto> {
        Arc::new(Crypto::new(Arc::new(MemoryStorage::new())))
    }

    fn relayer_on(relay: &MemoryRelay) -> Relayer {
        let relayer = Relayer::new(crypto());
        relayer.init(Box::new(relay.transport()));
        relayer
    }

    #[tokio::test]
    async fn test_publish_subscribe_plaintext() {
        let relay = MemoryRelay::new();
        let alice = relayer_on(&relay);
        let bob = relayer_on(&relay);

        let mut events = bob.subscribe_events();
        bob.subscribe("t1").await.unwrap();
        alice.publish("t1", "{\"id\":1}", None).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "t1");
        assert_eq!(msg.payload, "{\"id\":1}");
    }

    #[tokio::test]
    async fn test_unsubscribe_single_id_keeps_others() {
        let relay = MemoryRelay::new();
        let bob = relayer_on(&relay);

        let id1 = bob.subscribe("t1").await.unwrap();
        let id2 = bob.subscribe("t1").await.unwrap();
        assert_ne!(id1, id2);

        bob.unsubscribe("t1", Some(&id1)).await.unwrap();
        let ids = bob.state.topics.lock().await.get("t1").cloned().unwrap();
        assert_eq!(ids, vec![id2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_clears_topic() {
        let relay = MemoryRelay::new();
        let bob = relayer_on(&relay);

        bob.subscribe("t1").await.unwrap();
        bob.subscribe("t1").await.unwrap();
        bob.unsubscribe("t1", None).await.unwrap();

        assert!(bob.subscribed_topics().await.is_empty());
        assert!(bob.state.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let relay = MemoryRelay::new();
        let alice = relayer_on(&relay);

        let transport = relay.transport();
        let kill = transport.kill_switch();
        let bob = Relayer::new(crypto());
        bob.init(Box::new(transport));

        let mut events = bob.subscribe_events();
        bob.subscribe("t1").await.unwrap();

        kill.kill();
        // Give the loop a beat to notice and re-dial.
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice.publish("t1", "after-reconnect", None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, "after-reconnect");
    }
}
