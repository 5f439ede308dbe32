//! Client facade
//!
//! Owns every subsystem (storage, crypto, relayer, history and the two
//! sequence engines) and exposes the top-level protocol API. Inter-subsystem
//! wiring happens here: pairing payloads carrying session proposals are
//! routed to the session side, and engine events are re-emitted on one typed
//! client bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::history::JsonRpcHistory;
use crate::relay::jsonrpc::{Request, Response};
use crate::relay::transport::websocket::WsTransport;
use crate::relay::transport::Transport;
use crate::relay::{Relayer, DEFAULT_RELAY_URL};
use crate::sequence::pairing::{PairingKind, PairingState, PAIRING_SETTLED_TTL};
use crate::sequence::session::{SessionKind, SessionState, SESSION_PROPOSE_METHOD};
use crate::sequence::types::{
    AppMetadata, Notification, Outcome, Permissions, Proposal, ProposedPeer, Relay, Settled,
    Signal,
};
use crate::sequence::{Engine, ProposeParams, RespondParams, SequenceEvent, SequenceKind};
use crate::storage::{MemoryStorage, Storage};
use crate::uri::ProposalUri;
use crate::Topic;

/// Client configuration
pub struct ClientConfig {
    /// Whether this client owns permission upgrades (wallets do)
    pub controller: bool,
    /// Metadata shared with peers
    pub metadata: Option<AppMetadata>,
    /// Relay endpoint, dialed when no transport is supplied
    pub relay_url: String,
    /// Storage backend; in-memory when absent
    pub storage: Option<Arc<dyn Storage>>,
    /// Transport override, e.g. an in-memory relay for tests
    pub transport: Option<Box<dyn Transport>>,
    /// How long awaited peer responses may take
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            controller: false,
            metadata: None,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            storage: None,
            transport: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Parameters of [`Client::connect`]
#[derive(Clone, Debug, Default)]
pub struct ConnectParams {
    /// Permissions proposed for the session
    pub permissions: Permissions,
    /// Reuse a settled pairing; a fresh one is created when absent
    pub pairing_topic: Option<Topic>,
}

/// Events emitted on the client bus
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A pairing proposal left this client; show the URI to the peer
    PairingProposal {
        /// Proposal topic
        topic: Topic,
        /// The `wc:` URI to display
        uri: String,
    },
    /// A pairing settled
    PairingSettled {
        /// The settled pairing
        pairing: Settled<PairingState>,
    },
    /// Pairing state changed
    PairingUpdated {
        /// The settled pairing after the merge
        pairing: Settled<PairingState>,
    },
    /// Pairing permissions grew
    PairingUpgraded {
        /// The settled pairing after the merge
        pairing: Settled<PairingState>,
    },
    /// A pairing was torn down
    PairingDeleted {
        /// Its settled topic
        topic: Topic,
        /// Why
        reason: String,
    },
    /// A pairing payload other than a session proposal arrived
    PairingRequest {
        /// Settled pairing topic
        topic: Topic,
        /// The inner request
        request: Request,
    },
    /// The peer proposed a session; answer with `approve` or `reject`
    SessionProposal {
        /// The received proposal
        proposal: Proposal,
    },
    /// A session settled
    SessionSettled {
        /// The settled session
        session: Settled<SessionState>,
    },
    /// Session state changed
    SessionUpdated {
        /// The settled session after the merge
        session: Settled<SessionState>,
    },
    /// Session permissions grew
    SessionUpgraded {
        /// The settled session after the merge
        session: Settled<SessionState>,
    },
    /// The peer forwarded a JSON-RPC request; answer via [`Client::respond`]
    SessionRequest {
        /// Settled session topic
        topic: Topic,
        /// The request to answer, by its id
        request: Request,
        /// Target chain, when the peer named one
        chain_id: Option<String>,
    },
    /// The peer emitted a notification
    SessionNotification {
        /// Settled session topic
        topic: Topic,
        /// The notification
        notification: Notification,
    },
    /// A session was torn down
    SessionDeleted {
        /// Its settled topic
        topic: Topic,
        /// Why
        reason: String,
    },
}

/// The protocol client
#[derive(Clone)]
pub struct Client {
    crypto: Arc<Crypto>,
    relayer: Relayer,
    history: Arc<JsonRpcHistory>,
    pairing: Arc<Engine<PairingKind>>,
    session: Arc<Engine<SessionKind>>,
    events: broadcast::Sender<ClientEvent>,
    metadata: Option<AppMetadata>,
}

impl Client {
    /// Initialize every subsystem and restore persisted state
    pub async fn init(config: ClientConfig) -> Result<Self> {
        let storage = config
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let crypto = Arc::new(Crypto::new(storage.clone()));
        crypto.init().await?;

        let relayer = Relayer::new(crypto.clone());
        let transport: Box<dyn Transport> = match config.transport {
            Some(transport) => transport,
            None => Box::new(WsTransport::connect(&config.relay_url).await?),
        };
        relayer.init(transport);

        let history = Arc::new(JsonRpcHistory::new(storage.clone()));
        history.init().await?;

        let pairing = Engine::<PairingKind>::new(
            crypto.clone(),
            relayer.clone(),
            history.clone(),
            storage.clone(),
            config.controller,
            config.metadata.clone(),
            config.request_timeout,
        );
        pairing.init().await?;

        let session = Engine::<SessionKind>::new(
            crypto.clone(),
            relayer.clone(),
            history.clone(),
            storage,
            config.controller,
            config.metadata.clone(),
            config.request_timeout,
        );
        session.init().await?;

        let (events, _) = broadcast::channel(256);
        let client = Client {
            crypto,
            relayer,
            history,
            pairing,
            session,
            events,
            metadata: config.metadata,
        };
        client.spawn_event_pump();
        Ok(client)
    }

    /// Subscribe to the client event bus
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Establish a session, creating a pairing first when none is supplied
    ///
    /// With no existing pairing, a [`ClientEvent::PairingProposal`] fires
    /// with the URI the peer must scan; `connect` then waits for the pairing
    /// and the session to settle.
    pub async fn connect(&self, params: ConnectParams) -> Result<Settled<SessionState>> {
        let pairing_topic = match params.pairing_topic {
            Some(topic) => {
                self.pairing.get_settled(&topic).await?;
                topic
            }
            None => self.create_pairing().await?,
        };

        let session_events = self.session.subscribe_events();
        let pending = self
            .session
            .propose(ProposeParams {
                relay: Relay::default(),
                permissions: params.permissions,
                pairing_topic: Some(pairing_topic.clone()),
                ttl: None,
            })
            .await?;

        // The proposal travels to the wallet as a pairing payload.
        let proposal = Request::new(
            SESSION_PROPOSE_METHOD,
            serde_json::to_value(&pending.proposal)?,
        );
        self.pairing.request(&pairing_topic, proposal, None).await?;

        self.session.wait_settled(session_events, &pending.topic).await
    }

    async fn create_pairing(&self) -> Result<Topic> {
        let pairing_events = self.pairing.subscribe_events();
        let pending = self
            .pairing
            .propose(ProposeParams {
                relay: Relay::default(),
                permissions: PairingKind::default_permissions(),
                pairing_topic: None,
                ttl: None,
            })
            .await?;
        let settled = self
            .pairing
            .wait_settled(pairing_events, &pending.topic)
            .await?;
        Ok(settled.topic)
    }

    /// Respond to a pairing URI received out-of-band
    ///
    /// Returns the settled pairing topic.
    pub async fn pair(&self, uri: &str) -> Result<Topic> {
        let parsed = ProposalUri::parse(uri)?;
        let proposal = Proposal {
            topic: parsed.topic.clone(),
            relay: parsed.relay.clone(),
            proposer: ProposedPeer {
                public_key: parsed.public_key.clone(),
                controller: parsed.controller,
                metadata: None,
            },
            signal: Signal::Uri {
                uri: uri.to_string(),
            },
            permissions: PairingKind::default_permissions(),
            ttl: PAIRING_SETTLED_TTL,
        };

        let pairing_events = self.pairing.subscribe_events();
        let pending = self
            .pairing
            .respond(RespondParams {
                approved: true,
                proposal,
                state: PairingState {
                    metadata: self.metadata.clone(),
                },
                reason: None,
            })
            .await?;
        if let Some(Outcome::Rejected { reason }) = &pending.outcome {
            return Err(Error::Rejected {
                reason: reason.clone(),
            });
        }
        let settled = self
            .pairing
            .wait_settled(pairing_events, &pending.topic)
            .await?;
        Ok(settled.topic)
    }

    /// Approve a received session proposal
    pub async fn approve(
        &self,
        proposal: Proposal,
        state: SessionState,
    ) -> Result<Settled<SessionState>> {
        let session_events = self.session.subscribe_events();
        let pending = self
            .session
            .respond(RespondParams {
                approved: true,
                proposal,
                state,
                reason: None,
            })
            .await?;
        if let Some(Outcome::Rejected { reason }) = &pending.outcome {
            return Err(Error::Rejected {
                reason: reason.clone(),
            });
        }
        self.session.wait_settled(session_events, &pending.topic).await
    }

    /// Reject a received session proposal
    pub async fn reject(&self, proposal: Proposal, reason: Option<String>) -> Result<()> {
        self.session
            .respond(RespondParams {
                approved: false,
                proposal,
                state: SessionState::default(),
                reason,
            })
            .await?;
        Ok(())
    }

    /// Grow the permissions of a settled session; controller only
    pub async fn upgrade(
        &self,
        topic: &str,
        permissions: Permissions,
    ) -> Result<Settled<SessionState>> {
        self.session.upgrade(topic, permissions).await
    }

    /// Update the shared state of a settled session
    pub async fn update(&self, topic: &str, state: SessionState) -> Result<Settled<SessionState>> {
        self.session.update(topic, state).await
    }

    /// Forward a JSON-RPC request to the session peer
    pub async fn request(
        &self,
        topic: &str,
        request: Request,
        chain_id: Option<String>,
    ) -> Result<Value> {
        self.session.request(topic, request, chain_id).await
    }

    /// Answer an inbound [`ClientEvent::SessionRequest`]
    pub async fn respond(&self, topic: &str, response: Response) -> Result<()> {
        self.session.send(topic, response).await
    }

    /// Emit a notification on a settled session
    pub async fn notify(&self, topic: &str, notification: Notification) -> Result<()> {
        self.session.notify(topic, notification).await
    }

    /// Tear a settled session down
    pub async fn disconnect(&self, topic: &str, reason: &str) -> Result<()> {
        self.session.delete(topic, reason).await
    }

    /// Ping the peer of a settled session or pairing
    pub async fn ping(&self, topic: &str, timeout: Option<Duration>) -> Result<()> {
        if self.session.get_settled(topic).await.is_ok() {
            self.session.ping(topic, timeout).await
        } else {
            self.pairing.ping(topic, timeout).await
        }
    }

    /// All settled pairings
    pub async fn pairings(&self) -> Vec<Settled<PairingState>> {
        self.pairing.settled_sequences().await
    }

    /// All settled sessions
    pub async fn sessions(&self) -> Vec<Settled<SessionState>> {
        self.session.settled_sequences().await
    }

    /// The crypto controller, for key inspection
    pub fn crypto(&self) -> &Arc<Crypto> {
        &self.crypto
    }

    /// The pairing engine
    pub fn pairing(&self) -> &Arc<Engine<PairingKind>> {
        &self.pairing
    }

    /// The session engine
    pub fn session(&self) -> &Arc<Engine<SessionKind>> {
        &self.session
    }

    /// The relayer
    pub fn relayer(&self) -> &Relayer {
        &self.relayer
    }

    /// The JSON-RPC history
    pub fn history(&self) -> &Arc<JsonRpcHistory> {
        &self.history
    }

    fn spawn_event_pump(&self) {
        let pairing = Arc::downgrade(&self.pairing);
        let events = self.events.clone();
        let mut pairing_rx = self.pairing.subscribe_events();
        let mut session_rx = self.session.subscribe_events();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = pairing_rx.recv() => match event {
                        Ok(event) => {
                            let Some(pairing) = pairing.upgrade() else { break };
                            Self::route_pairing_event(&pairing, &events, event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client event pump lagged on pairing events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = session_rx.recv() => match event {
                        Ok(event) => Self::route_session_event(&events, event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client event pump lagged on session events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn route_pairing_event(
        pairing: &Arc<Engine<PairingKind>>,
        events: &broadcast::Sender<ClientEvent>,
        event: SequenceEvent<PairingState>,
    ) {
        match event {
            SequenceEvent::Proposed { pending } => {
                if let Signal::Uri { uri } = &pending.proposal.signal {
                    let _ = events.send(ClientEvent::PairingProposal {
                        topic: pending.topic.clone(),
                        uri: uri.clone(),
                    });
                }
            }
            SequenceEvent::Settled { settled, .. } => {
                let _ = events.send(ClientEvent::PairingSettled { pairing: settled });
            }
            SequenceEvent::Updated { settled } => {
                let _ = events.send(ClientEvent::PairingUpdated { pairing: settled });
            }
            SequenceEvent::Upgraded { settled } => {
                let _ = events.send(ClientEvent::PairingUpgraded { pairing: settled });
            }
            SequenceEvent::Deleted { topic, reason } => {
                let _ = events.send(ClientEvent::PairingDeleted { topic, reason });
            }
            SequenceEvent::Request {
                topic, request, ..
            } => {
                if request.method == SESSION_PROPOSE_METHOD {
                    let id = request.id;
                    match serde_json::from_value::<Proposal>(request.params.clone()) {
                        Ok(proposal) => {
                            // Transport-level ack; the protocol answer goes
                            // out on the proposal topic once the user decides.
                            let _ = pairing.send(&topic, Response::result(id, json!(true))).await;
                            debug!(topic = %proposal.topic, "session proposal received");
                            let _ = events.send(ClientEvent::SessionProposal { proposal });
                        }
                        Err(e) => {
                            let invalid = Error::MissingOrInvalid {
                                field: "session proposal".to_string(),
                            };
                            warn!("undecodable session proposal: {e}");
                            let _ = pairing
                                .send(
                                    &topic,
                                    Response::error(id, invalid.rpc_code(), &invalid.to_string()),
                                )
                                .await;
                        }
                    }
                } else {
                    let _ = events.send(ClientEvent::PairingRequest { topic, request });
                }
            }
            SequenceEvent::Notification { .. }
            | SequenceEvent::Responded { .. }
            | SequenceEvent::Rejected { .. } => {}
        }
    }

    fn route_session_event(
        events: &broadcast::Sender<ClientEvent>,
        event: SequenceEvent<SessionState>,
    ) {
        match event {
            SequenceEvent::Settled { settled, .. } => {
                let _ = events.send(ClientEvent::SessionSettled { session: settled });
            }
            SequenceEvent::Updated { settled } => {
                let _ = events.send(ClientEvent::SessionUpdated { session: settled });
            }
            SequenceEvent::Upgraded { settled } => {
                let _ = events.send(ClientEvent::SessionUpgraded { session: settled });
            }
            SequenceEvent::Request {
                topic,
                request,
                chain_id,
            } => {
                let _ = events.send(ClientEvent::SessionRequest {
                    topic,
                    request,
                    chain_id,
                });
            }
            SequenceEvent::Notification {
                topic,
                notification,
            } => {
                let _ = events.send(ClientEvent::SessionNotification {
                    topic,
                    notification,
                });
            }
            SequenceEvent::Deleted { topic, reason } => {
                let _ = events.send(ClientEvent::SessionDeleted { topic, reason });
            }
            SequenceEvent::Proposed { .. }
            | SequenceEvent::Responded { .. }
            | SequenceEvent::Rejected { .. } => {}
        }
    }
}
