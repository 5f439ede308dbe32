//! Accord Relay Server
//!
//! A development WebSocket relay implementing the publish/subscribe RPCs the
//! client speaks:
//! - `waku_publish(topic, message, ttl)` → `true`
//! - `waku_subscribe(topic)` → subscription id
//! - `waku_unsubscribe(id)` → `true`
//! - push: `waku_subscription({id, data: {message}})`
//!
//! The relay never sees plaintext: settled-topic traffic is AEAD-sealed by
//! the clients. Messages published to topics without subscribers are retained
//! briefly and flushed to the first subscriber, so a handshake reply cannot
//! lose the race against the proposer's subscription.
//!
//! Usage:
//!   accord-relay [--port 8765] [--host 0.0.0.0]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};

use accord::relay::jsonrpc::{next_id, Payload, Request, Response, JSONRPC_VERSION};
use accord::relay::{
    PublishParams, SubscribeParams, SubscriptionData, SubscriptionParams, UnsubscribeParams,
};

/// Accord Relay Server
#[derive(Parser)]
#[command(name = "accord-relay")]
#[command(about = "WebSocket publish/subscribe relay for accord clients")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// How many undelivered messages to retain per topic
    #[arg(long, default_value = "32")]
    retention: usize,
}

/// One client's subscription to a topic
struct Subscription {
    id: String,
    client: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Server state
struct RelayState {
    /// Topic → subscriptions
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    /// Messages published before any subscriber arrived
    retained: RwLock<HashMap<String, Vec<String>>>,
    retention: usize,
    next_client: AtomicU64,
    next_subscription: AtomicU64,
}

impl RelayState {
    fn new(retention: usize) -> Self {
        RelayState {
            topics: RwLock::new(HashMap::new()),
            retained: RwLock::new(HashMap::new()),
            retention,
            next_client: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    fn subscription_push(id: &str, message: String) -> String {
        let push = Request {
            id: next_id(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: "waku_subscription".to_string(),
            params: serde_json::to_value(SubscriptionParams {
                id: id.to_string(),
                data: SubscriptionData { message },
            })
            .expect("subscription params serialize"),
        };
        serde_json::to_string(&push).expect("push frame serialize")
    }

    /// Deliver `message` to every subscriber of `topic` except the publisher
    async fn publish(&self, publisher: u64, topic: &str, message: String) {
        {
            let topics = self.topics.read().await;
            let subscribers: Vec<&Subscription> = topics
                .get(topic)
                .map(|subs| subs.iter().filter(|s| s.client != publisher).collect())
                .unwrap_or_default();
            if !subscribers.is_empty() {
                for sub in subscribers {
                    let _ = sub.tx.send(Self::subscription_push(&sub.id, message.clone()));
                }
                return;
            }
        }

        // Nobody is listening yet; retain for the first subscriber.
        let mut retained = self.retained.write().await;
        let backlog = retained.entry(topic.to_string()).or_default();
        backlog.push(message);
        let excess = backlog.len().saturating_sub(self.retention);
        if excess > 0 {
            backlog.drain(..excess);
        }
    }

    async fn subscribe(
        &self,
        client: u64,
        topic: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> String {
        let id = format!("{:016x}", self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id: id.clone(),
                client,
                tx: tx.clone(),
            });

        // Flush retained messages to the newcomer.
        let backlog = self
            .retained
            .write()
            .await
            .remove(topic)
            .unwrap_or_default();
        for message in backlog {
            let _ = tx.send(Self::subscription_push(&id, message));
        }
        id
    }

    async fn unsubscribe(&self, id: &str) {
        let mut topics = self.topics.write().await;
        for subs in topics.values_mut() {
            subs.retain(|s| s.id != id);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }

    async fn drop_client(&self, client: u64) {
        let mut topics = self.topics.write().await;
        for subs in topics.values_mut() {
            subs.retain(|s| s.client != client);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }
}

/// Handle one JSON-RPC request from a connected client
async fn handle_rpc(
    state: &RelayState,
    client: u64,
    tx: &mpsc::UnboundedSender<String>,
    req: Request,
) -> Response {
    match req.method.as_str() {
        "waku_publish" => match serde_json::from_value::<PublishParams>(req.params) {
            Ok(params) => {
                state.publish(client, &params.topic, params.message).await;
                Response::result(req.id, json!(true))
            }
            Err(e) => Response::error(req.id, -32602, &format!("invalid params: {e}")),
        },
        "waku_subscribe" => match serde_json::from_value::<SubscribeParams>(req.params) {
            Ok(params) => {
                let id = state.subscribe(client, &params.topic, tx.clone()).await;
                info!(client, topic = %params.topic, %id, "subscribed");
                Response::result(req.id, json!(id))
            }
            Err(e) => Response::error(req.id, -32602, &format!("invalid params: {e}")),
        },
        "waku_unsubscribe" => match serde_json::from_value::<UnsubscribeParams>(req.params) {
            Ok(params) => {
                state.unsubscribe(&params.id).await;
                Response::result(req.id, json!(true))
            }
            Err(e) => Response::error(req.id, -32602, &format!("invalid params: {e}")),
        },
        other => Response::error(req.id, -32601, &format!("unknown method {other}")),
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<RelayState>) {
    info!("New connection from: {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = state.next_client.fetch_add(1, Ordering::Relaxed);

    loop {
        tokio::select! {
            // Frames from the client
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Payload>(&text) {
                            Ok(Payload::Request(req)) => {
                                let resp = handle_rpc(&state, client_id, &tx, req).await;
                                if let Ok(frame) = serde_json::to_string(&resp) {
                                    if write.send(Message::Text(frame)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            // Push acknowledgements; nothing to do.
                            Ok(Payload::Response(_)) => {}
                            Err(e) => {
                                warn!("Invalid frame from {}: {}", addr, e);
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }

                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }

                    _ => {}
                }
            }

            // Pushes destined for this client
            push = rx.recv() => {
                match push {
                    Some(frame) => {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.drop_client(client_id).await;
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("accord_relay=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    info!("Accord Relay Server listening on ws://{}", addr);

    let state = Arc::new(RelayState::new(args.retention));

    while let Ok((stream, addr)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(handle_connection(stream, addr, state));
    }
}
