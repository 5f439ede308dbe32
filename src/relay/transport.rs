//! Framed transport layer
//!
//! Moves JSON-RPC text frames between the client and a relay. The transport
//! is intentionally dumb: framing and reconnection only. Encryption happens
//! above it, in the relayer and the crypto controller.

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Abstract relay transport
///
/// All transports carry UTF-8 JSON-RPC frames and must be able to re-dial
/// after a drop; the relayer reconnects unconditionally.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame
    async fn send(&mut self, frame: String) -> TransportResult<()>;

    /// Receive the next frame
    ///
    /// Blocks until a frame is available or the connection is closed.
    async fn receive(&mut self) -> TransportResult<String>;

    /// Re-establish the connection after a drop
    async fn reconnect(&mut self) -> TransportResult<()>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> TransportResult<()>;
}

/// WebSocket transport to a relay server
pub mod websocket {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    /// Rewrite a relay URL to carry the protocol and version query
    pub fn rewrite_relay_url(url: &str) -> TransportResult<String> {
        let mut parsed =
            url::Url::parse(url).map_err(|e| TransportError::InvalidData(e.to_string()))?;
        parsed
            .query_pairs_mut()
            .append_pair("protocol", "wc")
            .append_pair("version", "2");
        Ok(parsed.to_string())
    }

    /// WebSocket transport connected to a relay server
    pub struct WsTransport {
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        url: String,
        connected: bool,
    }

    impl WsTransport {
        /// Connect to a relay server
        pub async fn connect(relay_url: &str) -> TransportResult<Self> {
            let url = rewrite_relay_url(relay_url)?;
            let (ws, _) = connect_async(&url)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            Ok(WsTransport {
                ws,
                url,
                connected: true,
            })
        }
    }

    #[async_trait]
    impl Transport for WsTransport {
        async fn send(&mut self, frame: String) -> TransportResult<()> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }
            match self.ws.send(Message::Text(frame)).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.connected = false;
                    Err(TransportError::SendFailed(e.to_string()))
                }
            }
        }

        async fn receive(&mut self) -> TransportResult<String> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(text),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = self.ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.connected = false;
                        return Err(TransportError::Disconnected);
                    }
                    Some(Err(e)) => {
                        self.connected = false;
                        return Err(TransportError::ReceiveFailed(e.to_string()));
                    }
                    _ => continue,
                }
            }
        }

        async fn reconnect(&mut self) -> TransportResult<()> {
            let (ws, _) = connect_async(&self.url)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            self.ws = ws;
            self.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.connected = false;
            self.ws
                .close(None)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }
    }
}

/// In-memory relay for tests
///
/// Implements the relay RPC semantics in-process: transports obtained from
/// one [`memory::MemoryRelay`] see each other's publishes, exactly as two
/// clients sharing a relay server would.
pub mod memory {
    use super::*;
    use crate::relay::jsonrpc::{next_id, Payload, Request, Response};
    use crate::relay::{PublishParams, SubscribeParams, SubscriptionData, SubscriptionParams, UnsubscribeParams};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct Subscription {
        id: String,
        client: u64,
    }

    struct RelayCore {
        clients: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
        subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
        /// Messages published to topics nobody was subscribed to yet;
        /// flushed to the first subscriber.
        retained: Mutex<HashMap<String, Vec<String>>>,
        next_client: AtomicU64,
        next_subscription: AtomicU64,
    }

    impl RelayCore {
        fn push(&self, client: u64, frame: String) {
            if let Some(tx) = self.clients.lock().unwrap().get(&client) {
                let _ = tx.send(frame);
            }
        }

        fn drop_client(&self, client: u64) {
            self.clients.lock().unwrap().remove(&client);
            let mut subscriptions = self.subscriptions.lock().unwrap();
            for subs in subscriptions.values_mut() {
                subs.retain(|s| s.client != client);
            }
            subscriptions.retain(|_, subs| !subs.is_empty());
        }
    }

    /// An in-process relay shared by test transports
    pub struct MemoryRelay {
        core: Arc<RelayCore>,
    }

    impl MemoryRelay {
        /// Create an empty relay
        pub fn new() -> Self {
            MemoryRelay {
                core: Arc::new(RelayCore {
                    clients: Mutex::new(HashMap::new()),
                    subscriptions: Mutex::new(HashMap::new()),
                    retained: Mutex::new(HashMap::new()),
                    next_client: AtomicU64::new(1),
                    next_subscription: AtomicU64::new(1),
                }),
            }
        }

        /// Open a new client connection
        pub fn transport(&self) -> MemoryTransport {
            let client_id = self.core.next_client.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            self.core.clients.lock().unwrap().insert(client_id, tx);

            MemoryTransport {
                core: self.core.clone(),
                client_id,
                rx,
                connected: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl Default for MemoryRelay {
        fn default() -> Self {
            Self::new()
        }
    }

    /// A transport endpoint connected to a [`MemoryRelay`]
    pub struct MemoryTransport {
        core: Arc<RelayCore>,
        client_id: u64,
        rx: mpsc::UnboundedReceiver<String>,
        connected: Arc<AtomicBool>,
    }

    impl MemoryTransport {
        /// Obtain a handle that can sever this connection from outside
        pub fn kill_switch(&self) -> KillSwitch {
            KillSwitch {
                core: self.core.clone(),
                client_id: self.client_id,
                connected: self.connected.clone(),
            }
        }

        fn handle_request(&self, req: Request) -> TransportResult<()> {
            let reply = match req.method.as_str() {
                "waku_publish" => {
                    let params: PublishParams = serde_json::from_value(req.params)
                        .map_err(|e| TransportError::InvalidData(e.to_string()))?;
                    self.route_publish(&params.topic, params.message);
                    Response::result(req.id, json!(true))
                }
                "waku_subscribe" => {
                    let params: SubscribeParams = serde_json::from_value(req.params)
                        .map_err(|e| TransportError::InvalidData(e.to_string()))?;
                    let id = format!(
                        "{:016x}",
                        self.core.next_subscription.fetch_add(1, Ordering::Relaxed)
                    );
                    self.core
                        .subscriptions
                        .lock()
                        .unwrap()
                        .entry(params.topic.clone())
                        .or_default()
                        .push(Subscription {
                            id: id.clone(),
                            client: self.client_id,
                        });
                    let reply = Response::result(req.id, json!(id));
                    let frame = serde_json::to_string(&reply)
                        .map_err(|e| TransportError::InvalidData(e.to_string()))?;
                    self.core.push(self.client_id, frame);
                    // Flush anything published before the subscriber arrived;
                    // the reply goes first so ids are bound before pushes land.
                    let backlog = self
                        .core
                        .retained
                        .lock()
                        .unwrap()
                        .remove(&params.topic)
                        .unwrap_or_default();
                    for message in backlog {
                        self.push_subscription(self.client_id, &id, message);
                    }
                    return Ok(());
                }
                "waku_unsubscribe" => {
                    let params: UnsubscribeParams = serde_json::from_value(req.params)
                        .map_err(|e| TransportError::InvalidData(e.to_string()))?;
                    let mut subscriptions = self.core.subscriptions.lock().unwrap();
                    for subs in subscriptions.values_mut() {
                        subs.retain(|s| s.id != params.id);
                    }
                    subscriptions.retain(|_, subs| !subs.is_empty());
                    Response::result(req.id, json!(true))
                }
                other => Response::error(req.id, -32601, &format!("unknown method {other}")),
            };

            let frame = serde_json::to_string(&reply)
                .map_err(|e| TransportError::InvalidData(e.to_string()))?;
            self.core.push(self.client_id, frame);
            Ok(())
        }

        fn route_publish(&self, topic: &str, message: String) {
            let targets: Vec<(u64, String)> = self
                .core
                .subscriptions
                .lock()
                .unwrap()
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| s.client != self.client_id)
                        .map(|s| (s.client, s.id.clone()))
                        .collect()
                })
                .unwrap_or_default();

            if targets.is_empty() {
                self.core
                    .retained
                    .lock()
                    .unwrap()
                    .entry(topic.to_string())
                    .or_default()
                    .push(message);
                return;
            }
            for (client, sub_id) in targets {
                self.push_subscription(client, &sub_id, message.clone());
            }
        }

        fn push_subscription(&self, client: u64, sub_id: &str, message: String) {
            let push = Request {
                id: next_id(),
                jsonrpc: crate::relay::jsonrpc::JSONRPC_VERSION.to_string(),
                method: "waku_subscription".to_string(),
                params: serde_json::to_value(SubscriptionParams {
                    id: sub_id.to_string(),
                    data: SubscriptionData { message },
                })
                .expect("subscription params serialize"),
            };
            if let Ok(frame) = serde_json::to_string(&push) {
                self.core.push(client, frame);
            }
        }
    }

    /// Severs a [`MemoryTransport`] from its relay, simulating a dropped
    /// connection; the transport reports disconnected until `reconnect`.
    pub struct KillSwitch {
        core: Arc<RelayCore>,
        client_id: u64,
        connected: Arc<AtomicBool>,
    }

    impl KillSwitch {
        /// Drop the connection and the relay-side subscription state
        pub fn kill(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.core.drop_client(self.client_id);
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, frame: String) -> TransportResult<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            match serde_json::from_str::<Payload>(&frame) {
                Ok(Payload::Request(req)) => self.handle_request(req),
                // Clients ack pushes with `true`; the relay does not care.
                Ok(Payload::Response(_)) => Ok(()),
                Err(e) => Err(TransportError::InvalidData(e.to_string())),
            }
        }

        async fn receive(&mut self) -> TransportResult<String> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            match self.rx.recv().await {
                Some(frame) => Ok(frame),
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    Err(TransportError::Disconnected)
                }
            }
        }

        async fn reconnect(&mut self) -> TransportResult<()> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.core
                .clients
                .lock()
                .unwrap()
                .insert(self.client_id, tx);
            self.rx = rx;
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            self.core.drop_client(self.client_id);
            Ok(())
        }
    }

}
