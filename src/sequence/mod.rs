//! Sequence engine
//!
//! One two-phase state machine (pending → settled), instantiated twice: once
//! for pairings (the control channel) and once for sessions (the application
//! channel). The instantiations differ only in their policy object, the
//! [`SequenceKind`] trait: default TTLs, default permissions, the JSON-RPC
//! method namespace and the shape of the mutable state.
//!
//! The engine coordinates proposal, response, settlement, upgrade, update,
//! request, notification and teardown between two peers that communicate
//! only through the relay.

pub mod pairing;
pub mod session;
pub mod types;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::history::{HistoryEntry, JsonRpcHistory};
use crate::relay::jsonrpc::{next_id, Payload, Request, Response, JSONRPC_VERSION};
use crate::relay::Relayer;
use crate::sequence::types::{
    ApprovedOutcome, ControllerRef, Notification, Outcome, Participant, Pending, PendingStatus,
    Permissions, Proposal, ProposedPeer, Relay, Settled, SettledPermissions,
};
use crate::storage::Storage;
use crate::store::{now_secs, SequenceStore, StoreEvent, REASON_EXPIRED, REASON_SETTLED};
use crate::uri::{ProposalUri, URI_VERSION};
use crate::Topic;

/// The policy object distinguishing pairings from sessions
pub trait SequenceKind: Send + Sync + 'static {
    /// Sequence name; also the JSON-RPC namespace (`wc_<name><Verb>`)
    const NAME: &'static str;
    /// Default pending lifetime, in seconds
    const PENDING_TTL: u64;
    /// Default settled lifetime, in seconds
    const SETTLED_TTL: u64;

    /// The mutable participant-shared state
    type State: Clone
        + std::fmt::Debug
        + PartialEq
        + Default
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Permissions proposed when the caller supplies none
    fn default_permissions() -> Permissions;

    /// Build the out-of-band signal for a proposal
    fn signal(uri: ProposalUri, pairing_topic: Option<Topic>) -> Result<types::Signal>;

    /// Union-merge an upgrade into settled permissions; never removes
    fn merge_permissions(current: &mut SettledPermissions, upgrade: &Permissions);

    /// Merge a state update, enforcing field ownership
    fn merge_state(
        current: &mut Self::State,
        update: Self::State,
        sender_is_controller: bool,
    ) -> Result<()>;
}

/// Events emitted by an engine
#[derive(Clone, Debug)]
pub enum SequenceEvent<S> {
    /// A proposal left this client
    Proposed {
        /// The stored pending sequence
        pending: Pending<S>,
    },
    /// A response was sent or received for a pending proposal
    Responded {
        /// The pending sequence carrying its outcome
        pending: Pending<S>,
    },
    /// A sequence settled on both phases of the handshake
    Settled {
        /// The settled sequence
        settled: Settled<S>,
        /// The proposal topic the handshake ran on
        proposal_topic: Topic,
    },
    /// A proposal was rejected or expired unanswered
    Rejected {
        /// The proposal topic
        proposal_topic: Topic,
        /// Peer-supplied reason, or an error code
        reason: String,
    },
    /// Settled state changed
    Updated {
        /// The settled sequence after the merge
        settled: Settled<S>,
    },
    /// Settled permissions grew
    Upgraded {
        /// The settled sequence after the merge
        settled: Settled<S>,
    },
    /// The peer forwarded a JSON-RPC request
    Request {
        /// Settled topic it arrived on
        topic: Topic,
        /// The inner request; answer it via `send` with the same id
        request: Request,
        /// Target chain, when the peer named one
        chain_id: Option<String>,
    },
    /// The peer emitted a notification
    Notification {
        /// Settled topic it arrived on
        topic: Topic,
        /// The notification
        notification: Notification,
    },
    /// A settled sequence was torn down
    Deleted {
        /// The settled topic
        topic: Topic,
        /// Why
        reason: String,
    },
}

/// Parameters of [`Engine::propose`] and [`Engine::create`]
#[derive(Clone, Debug)]
pub struct ProposeParams {
    /// Relay descriptor for the new sequence
    pub relay: Relay,
    /// Proposed permissions
    pub permissions: Permissions,
    /// Settled pairing carrying this proposal (sessions only)
    pub pairing_topic: Option<Topic>,
    /// Settled lifetime override, in seconds
    pub ttl: Option<u64>,
}

impl Default for ProposeParams {
    fn default() -> Self {
        ProposeParams {
            relay: Relay::default(),
            permissions: Permissions::default(),
            pairing_topic: None,
            ttl: None,
        }
    }
}

/// Parameters of [`Engine::respond`]
#[derive(Clone, Debug)]
pub struct RespondParams<S> {
    /// Approve or reject
    pub approved: bool,
    /// The proposal being answered
    pub proposal: Proposal,
    /// Initial shared state announced on approval
    pub state: S,
    /// Rejection reason; defaults to a generic one
    pub reason: Option<String>,
}

// Wire parameter shapes; the approve payload reuses ApprovedOutcome.

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RejectParams {
    reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UpgradeParams {
    permissions: Permissions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UpdateParams<S> {
    state: S,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DeleteParams {
    reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadParams {
    request: Request,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_id: Option<String>,
}

/// A two-phase sequence engine
pub struct Engine<K: SequenceKind> {
    crypto: Arc<Crypto>,
    relayer: Relayer,
    history: Arc<JsonRpcHistory>,
    pending: Arc<SequenceStore<Pending<K::State>>>,
    settled: Arc<SequenceStore<Settled<K::State>>>,
    events: broadcast::Sender<SequenceEvent<K::State>>,
    controller: bool,
    metadata: Option<types::AppMetadata>,
    request_timeout: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SequenceKind> Engine<K> {
    /// Create an engine; [`Engine::init`] must run before use
    pub fn new(
        crypto: Arc<Crypto>,
        relayer: Relayer,
        history: Arc<JsonRpcHistory>,
        storage: Arc<dyn Storage>,
        controller: bool,
        metadata: Option<types::AppMetadata>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let pending = SequenceStore::new(K::NAME, "pending", storage.clone(), K::PENDING_TTL);
        let settled = SequenceStore::new(K::NAME, "settled", storage, K::SETTLED_TTL);
        let (events, _) = broadcast::channel(256);
        Arc::new(Engine {
            crypto,
            relayer,
            history,
            pending,
            settled,
            events,
            controller,
            metadata,
            request_timeout,
            _kind: PhantomData,
        })
    }

    /// Restore persisted sequences, resubscribe their topics and start the
    /// inbound dispatch
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        // Subscribe the pump before restoring so no frame slips between.
        let inbound = self.relayer.subscribe_events();

        self.pending.init().await?;
        self.settled.init().await?;
        for topic in self.settled.topics().await {
            self.relayer.subscribe(&topic).await?;
        }
        for topic in self.pending.topics().await {
            self.relayer.subscribe(&topic).await?;
        }

        self.spawn_inbound_pump(inbound);
        self.spawn_expiry_pump();
        Ok(())
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SequenceEvent<K::State>> {
        self.events.subscribe()
    }

    /// The namespaced JSON-RPC method for `verb`
    fn method(verb: &str) -> String {
        format!("wc_{}{}", K::NAME, verb)
    }

    /// All settled sequences
    pub async fn settled_sequences(&self) -> Vec<Settled<K::State>> {
        self.settled
            .values()
            .await
            .into_iter()
            .map(|entry| entry.data)
            .collect()
    }

    /// All pending sequences
    pub async fn pending_sequences(&self) -> Vec<Pending<K::State>> {
        self.pending
            .values()
            .await
            .into_iter()
            .map(|entry| entry.data)
            .collect()
    }

    /// The settled sequence at `topic`
    pub async fn get_settled(&self, topic: &str) -> Result<Settled<K::State>> {
        Ok(self.settled.get(topic).await?.data)
    }

    /// Propose a new sequence; returns the stored pending entry
    pub async fn propose(self: &Arc<Self>, params: ProposeParams) -> Result<Pending<K::State>> {
        let public_key = self.crypto.generate_keypair().await;
        let topic = Crypto::proposal_topic(&public_key)?;
        let relay = params.relay;

        let proposer = ProposedPeer {
            public_key: public_key.clone(),
            controller: self.controller,
            metadata: self.metadata.clone(),
        };
        let uri = ProposalUri {
            topic: topic.clone(),
            version: URI_VERSION,
            controller: self.controller,
            public_key: public_key.clone(),
            relay: relay.clone(),
        };
        let signal = K::signal(uri, params.pairing_topic)?;
        let proposal = Proposal {
            topic: topic.clone(),
            relay: relay.clone(),
            proposer,
            signal,
            permissions: params.permissions,
            ttl: params.ttl.unwrap_or(K::SETTLED_TTL),
        };

        self.relayer.subscribe(&topic).await?;
        let pending = Pending {
            status: PendingStatus::Proposed,
            topic: topic.clone(),
            relay: relay.clone(),
            local: Participant {
                public_key,
                metadata: self.metadata.clone(),
            },
            proposal,
            outcome: None,
        };
        self.pending
            .set(&topic, pending.clone(), relay, Some(now_secs() + K::PENDING_TTL))
            .await?;

        debug!(kind = K::NAME, %topic, "proposed");
        let _ = self.events.send(SequenceEvent::Proposed {
            pending: pending.clone(),
        });
        Ok(pending)
    }

    /// Propose and await settlement
    ///
    /// Fails with the peer's reason on rejection, or `EXPIRED` when the
    /// pending TTL elapses unanswered.
    pub async fn create(self: &Arc<Self>, params: ProposeParams) -> Result<Settled<K::State>> {
        let events = self.events.subscribe();
        let pending = self.propose(params).await?;
        self.wait_settled(events, &pending.topic).await
    }

    /// Await the settlement of the proposal at `proposal_topic`
    ///
    /// `events` must have been subscribed before the proposal left, so the
    /// settlement cannot race the wait.
    pub async fn wait_settled(
        &self,
        mut events: broadcast::Receiver<SequenceEvent<K::State>>,
        proposal_topic: &str,
    ) -> Result<Settled<K::State>> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(SequenceEvent::Settled {
                        settled,
                        proposal_topic: topic,
                    }) if topic == proposal_topic => return Ok(settled),
                    Ok(SequenceEvent::Rejected {
                        proposal_topic: topic,
                        reason,
                    }) if topic == proposal_topic => return Err(Error::Rejected { reason }),
                    Ok(_) => continue,
                    Err(_) => return Err(Error::MissingResponse),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(K::PENDING_TTL), wait)
            .await
            .map_err(|_| Error::Expired {
                topic: proposal_topic.to_string(),
            })?
    }

    /// Answer a proposal
    ///
    /// Approval derives the settled channel, stores it and announces it on
    /// the proposal topic; the `Settled` event fires once the proposer acks.
    /// Rejection announces the reason and stores nothing settled. A proposal
    /// whose controller claim matches our own is force-rejected.
    pub async fn respond(
        self: &Arc<Self>,
        params: RespondParams<K::State>,
    ) -> Result<Pending<K::State>> {
        let proposal = params.proposal;
        let matching_controller = proposal.proposer.controller == self.controller;
        let approved = params.approved && !matching_controller;
        let reason = if params.approved && matching_controller {
            Error::UnauthorizedMatchingController.code().to_string()
        } else {
            params
                .reason
                .unwrap_or_else(|| "rejected by responder".to_string())
        };

        let public_key = self.crypto.generate_keypair().await;
        let local = Participant {
            public_key: public_key.clone(),
            metadata: self.metadata.clone(),
        };

        if !approved {
            let reject = Request::new(
                &Self::method("Reject"),
                serde_json::to_value(RejectParams {
                    reason: reason.clone(),
                })?,
            );
            self.relayer
                .publish(
                    &proposal.topic,
                    &serde_json::to_string(&Payload::Request(reject))?,
                    Some(K::PENDING_TTL),
                )
                .await?;

            let pending = Pending {
                status: PendingStatus::Responded,
                topic: proposal.topic.clone(),
                relay: proposal.relay.clone(),
                local,
                proposal: proposal.clone(),
                outcome: Some(Outcome::Rejected { reason }),
            };
            let _ = self.events.send(SequenceEvent::Responded {
                pending: pending.clone(),
            });
            return Ok(pending);
        }

        let settled_topic = self
            .crypto
            .generate_shared_key(&public_key, &proposal.proposer.public_key, None)
            .await?;
        self.relayer.subscribe(&settled_topic).await?;
        self.relayer.subscribe(&proposal.topic).await?;

        let expiry = now_secs() + proposal.ttl;
        let controller_key = if proposal.proposer.controller {
            proposal.proposer.public_key.clone()
        } else {
            public_key.clone()
        };
        let settled = Settled {
            topic: settled_topic.clone(),
            relay: proposal.relay.clone(),
            local: local.clone(),
            peer: Participant {
                public_key: proposal.proposer.public_key.clone(),
                metadata: proposal.proposer.metadata.clone(),
            },
            permissions: SettledPermissions {
                permissions: proposal.permissions.clone(),
                controller: ControllerRef {
                    public_key: controller_key,
                },
            },
            expiry,
            state: params.state.clone(),
        };
        self.settled
            .set(&settled_topic, settled.clone(), proposal.relay.clone(), Some(expiry))
            .await?;

        let outcome = ApprovedOutcome {
            topic: settled_topic.clone(),
            relay: proposal.relay.clone(),
            responder: local.clone(),
            expiry,
            state: params.state.clone(),
        };
        let pending = Pending {
            status: PendingStatus::Responded,
            topic: proposal.topic.clone(),
            relay: proposal.relay.clone(),
            local,
            proposal: proposal.clone(),
            outcome: Some(Outcome::Approved(outcome.clone())),
        };
        self.pending
            .set(
                &proposal.topic,
                pending.clone(),
                proposal.relay.clone(),
                Some(now_secs() + K::PENDING_TTL),
            )
            .await?;

        let approve = Request::new(&Self::method("Approve"), serde_json::to_value(&outcome)?);
        let approve_id = approve.id;
        let ack = self
            .history
            .insert(HistoryEntry {
                id: approve_id,
                topic: proposal.topic.clone(),
                request: approve.clone(),
                chain_id: None,
            })
            .await?;
        self.relayer
            .publish(
                &proposal.topic,
                &serde_json::to_string(&Payload::Request(approve))?,
                Some(K::PENDING_TTL),
            )
            .await?;

        let engine = self.clone();
        let proposal_topic = proposal.topic.clone();
        let settled_for_task = settled;
        tokio::spawn(async move {
            engine
                .finalize_settlement(ack, approve_id, proposal_topic, settled_for_task)
                .await;
        });

        debug!(kind = K::NAME, topic = %proposal.topic, "responded");
        let _ = self.events.send(SequenceEvent::Responded {
            pending: pending.clone(),
        });
        Ok(pending)
    }

    /// Responder-side settlement: fires `Settled` once the proposer acks the
    /// approval, or rolls the settled channel back if the ack never comes.
    async fn finalize_settlement(
        self: Arc<Self>,
        ack: tokio::sync::oneshot::Receiver<Response>,
        approve_id: u64,
        proposal_topic: Topic,
        settled: Settled<K::State>,
    ) {
        let acked = match tokio::time::timeout(self.request_timeout, ack).await {
            Ok(Ok(response)) => response.into_result().is_ok(),
            _ => {
                let _ = self.history.purge(approve_id).await;
                false
            }
        };

        if acked {
            let _ = self.events.send(SequenceEvent::Settled {
                settled,
                proposal_topic: proposal_topic.clone(),
            });
            let _ = self.pending.delete(&proposal_topic, REASON_SETTLED).await;
            let _ = self.relayer.unsubscribe(&proposal_topic, None).await;
        } else {
            warn!(kind = K::NAME, topic = %proposal_topic, "approval was not acknowledged");
            let reason = Error::MissingResponse.code();
            let _ = self.settled.delete(&settled.topic, reason).await;
            let _ = self.crypto.delete_keys(&settled.topic).await;
            let _ = self.relayer.unsubscribe(&settled.topic, None).await;
            let _ = self.pending.delete(&proposal_topic, reason).await;
            let _ = self.relayer.unsubscribe(&proposal_topic, None).await;
            let _ = self.events.send(SequenceEvent::Rejected {
                proposal_topic,
                reason: reason.to_string(),
            });
        }
    }

    /// Grow the permissions of a settled sequence; controller only
    pub async fn upgrade(
        &self,
        topic: &str,
        permissions: Permissions,
    ) -> Result<Settled<K::State>> {
        let mut settled = self.settled.get(topic).await?.data;
        if settled.permissions.controller.public_key != settled.local.public_key {
            return Err(Error::UnauthorizedMatchingController);
        }

        let request = Request::new(
            &Self::method("Upgrade"),
            serde_json::to_value(UpgradeParams {
                permissions: permissions.clone(),
            })?,
        );
        self.rpc(topic, request, None, self.request_timeout).await?;

        // Authoritative application happens on ack.
        K::merge_permissions(&mut settled.permissions, &permissions);
        self.settled.update(topic, settled.clone()).await?;
        let _ = self.events.send(SequenceEvent::Upgraded {
            settled: settled.clone(),
        });
        Ok(settled)
    }

    /// Update the mutable state of a settled sequence
    pub async fn update(&self, topic: &str, state: K::State) -> Result<Settled<K::State>> {
        let mut settled = self.settled.get(topic).await?.data;
        let local_is_controller =
            settled.permissions.controller.public_key == settled.local.public_key;

        let mut merged = settled.state.clone();
        K::merge_state(&mut merged, state.clone(), local_is_controller)?;

        let request = Request::new(
            &Self::method("Update"),
            serde_json::to_value(UpdateParams { state })?,
        );
        self.rpc(topic, request, None, self.request_timeout).await?;

        settled.state = merged;
        self.settled.update(topic, settled.clone()).await?;
        let _ = self.events.send(SequenceEvent::Updated {
            settled: settled.clone(),
        });
        Ok(settled)
    }

    /// Forward a JSON-RPC request to the peer
    ///
    /// Permission checks run locally before anything is transmitted.
    pub async fn request(
        &self,
        topic: &str,
        request: Request,
        chain_id: Option<String>,
    ) -> Result<Value> {
        let settled = self.settled.get(topic).await?.data;
        if !settled
            .permissions
            .permissions
            .jsonrpc
            .methods
            .contains(&request.method)
        {
            return Err(Error::UnauthorizedJsonRpcMethod {
                method: request.method,
            });
        }
        if let Some(chain) = &chain_id {
            let allowed = settled
                .permissions
                .permissions
                .blockchain
                .as_ref()
                .map(|b| b.chains.contains(chain))
                .unwrap_or(false);
            if !allowed {
                return Err(Error::UnauthorizedTargetChain {
                    chain_id: chain.clone(),
                });
            }
        }

        // The inner request shares the envelope id, so the peer's answer to
        // the inner id resolves the outer correlation too.
        let outer_id = next_id();
        let mut inner = request;
        inner.id = outer_id;
        let outer = Request {
            id: outer_id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Self::method("Payload"),
            params: serde_json::to_value(PayloadParams {
                request: inner,
                chain_id: chain_id.clone(),
            })?,
        };
        self.rpc(topic, outer, chain_id, self.request_timeout).await
    }

    /// Emit a notification to the peer
    pub async fn notify(&self, topic: &str, notification: Notification) -> Result<()> {
        let settled = self.settled.get(topic).await?.data;
        let local_is_controller =
            settled.permissions.controller.public_key == settled.local.public_key;
        let allowed = local_is_controller
            || settled
                .permissions
                .permissions
                .notifications
                .types
                .contains(&notification.kind);
        if !allowed {
            return Err(Error::UnauthorizedNotificationType {
                kind: notification.kind,
            });
        }

        let request = Request::new(
            &Self::method("Notification"),
            serde_json::to_value(&notification)?,
        );
        self.rpc(topic, request, None, self.request_timeout).await?;
        Ok(())
    }

    /// Tear a settled sequence down
    ///
    /// The peer is notified best-effort; local teardown is unconditional.
    pub async fn delete(&self, topic: &str, reason: &str) -> Result<()> {
        if self.settled.has(topic).await {
            let request = Request::new(
                &Self::method("Delete"),
                serde_json::to_value(DeleteParams {
                    reason: reason.to_string(),
                })?,
            );
            if let Ok(frame) = serde_json::to_string(&Payload::Request(request)) {
                let _ = self.relayer.publish(topic, &frame, None).await;
            }
        }
        self.teardown(topic, reason).await
    }

    /// Ping the peer over a settled topic
    pub async fn ping(&self, topic: &str, timeout: Option<Duration>) -> Result<()> {
        if !self.settled.has(topic).await {
            return Err(Error::NoMatchingTopic {
                topic: topic.to_string(),
            });
        }
        let request = Request::new(&Self::method("Ping"), json!({}));
        self.rpc(topic, request, None, timeout.unwrap_or(self.request_timeout))
            .await?;
        Ok(())
    }

    /// Publish a raw response on a settled topic
    ///
    /// Used to answer inbound payload requests; responses carry no
    /// permission check.
    pub async fn send(&self, topic: &str, response: Response) -> Result<()> {
        if !self.settled.has(topic).await {
            return Err(Error::NoMatchingTopic {
                topic: topic.to_string(),
            });
        }
        self.relayer
            .publish(topic, &serde_json::to_string(&Payload::Response(response))?, None)
            .await
    }

    async fn teardown(&self, topic: &str, reason: &str) -> Result<()> {
        let _ = self.settled.delete(topic, reason).await;
        self.crypto.delete_keys(topic).await?;
        self.relayer.unsubscribe(topic, None).await?;
        let _ = self.events.send(SequenceEvent::Deleted {
            topic: topic.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Record, publish and await the response of an engine request
    async fn rpc(
        &self,
        topic: &str,
        request: Request,
        chain_id: Option<String>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = request.id;
        let response = self
            .history
            .insert(HistoryEntry {
                id,
                topic: topic.to_string(),
                request: request.clone(),
                chain_id,
            })
            .await?;
        self.relayer
            .publish(topic, &serde_json::to_string(&Payload::Request(request))?, None)
            .await?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(Error::MissingResponse),
            Err(_) => {
                self.history.purge(id).await?;
                Err(Error::NoMatchingResponse { id })
            }
        }
    }

    fn spawn_inbound_pump(
        self: &Arc<Self>,
        mut inbound: broadcast::Receiver<crate::relay::InboundMessage>,
    ) {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => {
                        let Some(engine) = engine.upgrade() else { break };
                        if engine.owns(&message.topic).await {
                            engine.handle_payload(&message.topic, &message.payload).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = K::NAME, skipped, "inbound dispatch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Translate store expiries into protocol events and teardown
    fn spawn_expiry_pump(self: &Arc<Self>) {
        let mut pending_events = self.pending.subscribe_events();
        let mut settled_events = self.settled.subscribe_events();
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = pending_events.recv() => match event {
                        Ok(StoreEvent::Deleted { entry, reason }) if reason == REASON_EXPIRED => {
                            let Some(engine) = engine.upgrade() else { break };
                            let _ = engine.relayer.unsubscribe(&entry.topic, None).await;
                            let _ = engine.events.send(SequenceEvent::Rejected {
                                proposal_topic: entry.topic,
                                reason,
                            });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = settled_events.recv() => match event {
                        Ok(StoreEvent::Deleted { entry, reason }) if reason == REASON_EXPIRED => {
                            let Some(engine) = engine.upgrade() else { break };
                            let _ = engine.crypto.delete_keys(&entry.topic).await;
                            let _ = engine.relayer.unsubscribe(&entry.topic, None).await;
                            let _ = engine.events.send(SequenceEvent::Deleted {
                                topic: entry.topic,
                                reason,
                            });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn owns(&self, topic: &str) -> bool {
        self.pending.has(topic).await || self.settled.has(topic).await
    }

    async fn handle_payload(self: &Arc<Self>, topic: &str, payload: &str) {
        match serde_json::from_str::<Payload>(payload) {
            Ok(Payload::Request(request)) => {
                let id = request.id;
                if let Err(e) = self.handle_request(topic, request).await {
                    debug!(kind = K::NAME, topic, "inbound request failed: {e}");
                    let response = Response::error(id, e.rpc_code(), &e.to_string());
                    if let Ok(frame) = serde_json::to_string(&Payload::Response(response)) {
                        let _ = self.relayer.publish(topic, &frame, None).await;
                    }
                }
            }
            Ok(Payload::Response(response)) => {
                let _ = self.history.resolve(response).await;
            }
            Err(e) => warn!(kind = K::NAME, topic, "undecodable payload: {e}"),
        }
    }

    async fn handle_request(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let namespace = format!("wc_{}", K::NAME);
        let verb = request.method.strip_prefix(&namespace).unwrap_or_default();
        match verb {
            "Approve" => self.handle_approve(topic, request).await,
            "Reject" => self.handle_reject(topic, request).await,
            "Upgrade" => self.handle_upgrade(topic, request).await,
            "Update" => self.handle_update(topic, request).await,
            "Delete" => self.handle_delete(topic, request).await,
            "Payload" => self.handle_inbound_payload(topic, request).await,
            "Notification" => self.handle_notification(topic, request).await,
            "Ping" => self.ack(topic, request.id).await,
            _ => Err(Error::JsonRpc {
                code: -32601,
                message: format!("unknown method {}", request.method),
            }),
        }
    }

    async fn ack(&self, topic: &str, id: u64) -> Result<()> {
        let response = Response::result(id, json!(true));
        self.relayer
            .publish(topic, &serde_json::to_string(&Payload::Response(response))?, None)
            .await
    }

    /// Proposer side: the responder announced the settled channel
    async fn handle_approve(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let params: ApprovedOutcome<K::State> = serde_json::from_value(request.params)?;
        let mut pending = self.pending.get(topic).await?.data;
        if pending.status != PendingStatus::Proposed {
            return Err(Error::Settled {
                topic: topic.to_string(),
            });
        }

        let settled_topic = self
            .crypto
            .generate_shared_key(
                &pending.local.public_key,
                &params.responder.public_key,
                None,
            )
            .await?;
        if settled_topic != params.topic {
            self.crypto.delete_keys(&settled_topic).await?;
            return Err(Error::MismatchedTopic {
                expected: settled_topic,
                actual: params.topic,
            });
        }

        self.relayer.subscribe(&settled_topic).await?;
        let controller_key = if pending.proposal.proposer.controller {
            pending.proposal.proposer.public_key.clone()
        } else {
            params.responder.public_key.clone()
        };
        let settled = Settled {
            topic: settled_topic.clone(),
            relay: params.relay.clone(),
            local: pending.local.clone(),
            peer: params.responder.clone(),
            permissions: SettledPermissions {
                permissions: pending.proposal.permissions.clone(),
                controller: ControllerRef {
                    public_key: controller_key,
                },
            },
            expiry: params.expiry,
            state: params.state.clone(),
        };
        self.settled
            .set(&settled_topic, settled.clone(), params.relay.clone(), Some(params.expiry))
            .await?;

        pending.status = PendingStatus::Responded;
        pending.outcome = Some(Outcome::Approved(params));
        self.pending.update(topic, pending.clone()).await?;
        let _ = self.events.send(SequenceEvent::Responded { pending });

        // Acknowledge on the proposal topic, then retire it.
        self.ack(topic, request.id).await?;
        debug!(kind = K::NAME, topic = %settled_topic, "settled");
        let _ = self.events.send(SequenceEvent::Settled {
            settled,
            proposal_topic: topic.to_string(),
        });
        self.pending.delete(topic, REASON_SETTLED).await?;
        self.relayer.unsubscribe(topic, None).await?;
        Ok(())
    }

    /// Proposer side: the responder declined
    async fn handle_reject(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let params: RejectParams = serde_json::from_value(request.params)?;
        let mut pending = self.pending.get(topic).await?.data;
        pending.status = PendingStatus::Responded;
        pending.outcome = Some(Outcome::Rejected {
            reason: params.reason.clone(),
        });
        self.pending.update(topic, pending.clone()).await?;
        let _ = self.events.send(SequenceEvent::Responded { pending });

        self.ack(topic, request.id).await?;
        let _ = self.events.send(SequenceEvent::Rejected {
            proposal_topic: topic.to_string(),
            reason: params.reason.clone(),
        });
        self.pending.delete(topic, &params.reason).await?;
        self.relayer.unsubscribe(topic, None).await?;
        Ok(())
    }

    async fn handle_upgrade(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let params: UpgradeParams = serde_json::from_value(request.params)?;
        let mut settled = self.settled.get(topic).await?.data;
        if settled.permissions.controller.public_key != settled.peer.public_key {
            return Err(Error::UnauthorizedMatchingController);
        }

        K::merge_permissions(&mut settled.permissions, &params.permissions);
        self.settled.update(topic, settled.clone()).await?;
        self.ack(topic, request.id).await?;
        let _ = self.events.send(SequenceEvent::Upgraded { settled });
        Ok(())
    }

    async fn handle_update(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let params: UpdateParams<K::State> = serde_json::from_value(request.params)?;
        let mut settled = self.settled.get(topic).await?.data;
        let sender_is_controller =
            settled.permissions.controller.public_key == settled.peer.public_key;

        let mut merged = settled.state.clone();
        K::merge_state(&mut merged, params.state, sender_is_controller)?;
        settled.state = merged;
        self.settled.update(topic, settled.clone()).await?;
        self.ack(topic, request.id).await?;
        let _ = self.events.send(SequenceEvent::Updated { settled });
        Ok(())
    }

    async fn handle_delete(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let params: DeleteParams = serde_json::from_value(request.params)?;
        self.ack(topic, request.id).await?;
        self.teardown(topic, &params.reason).await
    }

    /// An application request from the peer; re-checked against permissions
    /// and surfaced as an event for the application to answer via `send`
    async fn handle_inbound_payload(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let params: PayloadParams = serde_json::from_value(request.params)?;
        let settled = self.settled.get(topic).await?.data;
        if !settled
            .permissions
            .permissions
            .jsonrpc
            .methods
            .contains(&params.request.method)
        {
            return Err(Error::UnauthorizedJsonRpcMethod {
                method: params.request.method.clone(),
            });
        }
        if let Some(chain) = &params.chain_id {
            let allowed = settled
                .permissions
                .permissions
                .blockchain
                .as_ref()
                .map(|b| b.chains.contains(chain))
                .unwrap_or(false);
            if !allowed {
                return Err(Error::UnauthorizedTargetChain {
                    chain_id: chain.clone(),
                });
            }
        }

        let _ = self.events.send(SequenceEvent::Request {
            topic: topic.to_string(),
            request: params.request,
            chain_id: params.chain_id,
        });
        Ok(())
    }

    async fn handle_notification(self: &Arc<Self>, topic: &str, request: Request) -> Result<()> {
        let notification: Notification = serde_json::from_value(request.params)?;
        let settled = self.settled.get(topic).await?.data;
        let sender_is_controller =
            settled.permissions.controller.public_key == settled.peer.public_key;
        let allowed = sender_is_controller
            || settled
                .permissions
                .permissions
                .notifications
                .types
                .contains(&notification.kind);
        if !allowed {
            return Err(Error::UnauthorizedNotificationType {
                kind: notification.kind,
            });
        }

        self.ack(topic, request.id).await?;
        let _ = self.events.send(SequenceEvent::Notification {
            topic: topic.to_string(),
            notification,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgreementKeypair;
    use crate::relay::transport::memory::MemoryRelay;
    use crate::sequence::session::{SessionKind, SessionState};
    use crate::sequence::types::Signal;
    use crate::storage::MemoryStorage;

    async fn session_engine(relay: &MemoryRelay) -> (Arc<Engine<SessionKind>>, Arc<Crypto>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let crypto = Arc::new(Crypto::new(storage.clone()));
        crypto.init().await.unwrap();

        let relayer = Relayer::new(crypto.clone());
        relayer.init(Box::new(relay.transport()));

        let history = Arc::new(JsonRpcHistory::new(storage.clone()));
        history.init().await.unwrap();

        let engine = Engine::<SessionKind>::new(
            crypto.clone(),
            relayer,
            history,
            storage,
            true,
            None,
            Duration::from_secs(2),
        );
        engine.init().await.unwrap();
        (engine, crypto)
    }

    fn participant(byte: &str) -> Participant {
        Participant {
            public_key: byte.repeat(32),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_settled_expiry_tears_down_key() {
        let relay = MemoryRelay::new();
        let (engine, crypto) = session_engine(&relay).await;

        // Install a key at the topic through the derivation path.
        let topic = "aa".repeat(32);
        let keypair_id = crypto.generate_keypair().await;
        let peer = AgreementKeypair::generate();
        crypto
            .generate_shared_key(&keypair_id, peer.public_key_hex(), Some(topic.clone()))
            .await
            .unwrap();
        assert!(crypto.has_keys(&topic).await);

        let mut events = engine.subscribe_events();
        let expiry = now_secs() + 2;
        let settled = Settled {
            topic: topic.clone(),
            relay: Relay::default(),
            local: participant("11"),
            peer: participant("22"),
            permissions: SettledPermissions {
                permissions: Permissions::default(),
                controller: ControllerRef {
                    public_key: "11".repeat(32),
                },
            },
            expiry,
            state: SessionState::default(),
        };
        engine
            .settled
            .set(&topic, settled, Relay::default(), Some(expiry))
            .await
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(4), async {
            loop {
                if let Ok(SequenceEvent::Deleted { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .expect("expiry within 4s");
        assert_eq!(reason, REASON_EXPIRED);
        assert!(!crypto.has_keys(&topic).await);
        assert!(engine.settled_sequences().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_expiry_behaves_like_rejection() {
        let relay = MemoryRelay::new();
        let (engine, _crypto) = session_engine(&relay).await;

        let topic = "bb".repeat(32);
        let proposal = Proposal {
            topic: topic.clone(),
            relay: Relay::default(),
            proposer: ProposedPeer {
                public_key: "33".repeat(32),
                controller: false,
                metadata: None,
            },
            signal: Signal::Pairing {
                topic: "cc".repeat(32),
            },
            permissions: Permissions::default(),
            ttl: SessionKind::SETTLED_TTL,
        };
        let pending = Pending {
            status: PendingStatus::Proposed,
            topic: topic.clone(),
            relay: Relay::default(),
            local: participant("33"),
            proposal,
            outcome: None,
        };

        let mut events = engine.subscribe_events();
        engine
            .pending
            .set(&topic, pending, Relay::default(), Some(now_secs() + 2))
            .await
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(4), async {
            loop {
                if let Ok(SequenceEvent::Rejected { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .expect("expiry within 4s");
        assert_eq!(reason, REASON_EXPIRED);
        assert!(engine.pending_sequences().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_without_settled_topic_fails() {
        let relay = MemoryRelay::new();
        let (engine, _crypto) = session_engine(&relay).await;

        let err = engine
            .request("dd".repeat(32).as_str(), Request::new("eth_call", json!([])), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_MATCHING_TOPIC");
    }
}
