//! Shared sequence data model
//!
//! The wire and persistence types used by both engine instantiations:
//! relay descriptors, participants, permissions, proposals, pending and
//! settled sequences. Field names follow the camelCase wire layout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Topic;

/// Relay descriptor carried by proposals and settled sequences
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay protocol name
    pub protocol: String,
    /// Protocol-specific parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Default for Relay {
    fn default() -> Self {
        Relay {
            protocol: crate::relay::RELAY_PROTOCOL.to_string(),
            params: None,
        }
    }
}

/// Application metadata shown to the peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    /// Application name
    pub name: String,
    /// Short description
    pub description: String,
    /// Application URL
    pub url: String,
    /// Icon URLs
    pub icons: Vec<String>,
}

/// A settled participant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// X25519 public key, hex-encoded
    pub public_key: String,
    /// Application metadata, if shared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// The proposing participant, carrying its controller claim
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedPeer {
    /// X25519 public key, hex-encoded
    pub public_key: String,
    /// Whether the proposer claims the controller role
    pub controller: bool,
    /// Application metadata, if shared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// JSON-RPC method permissions
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcPermissions {
    /// Allowed method names, in proposal order
    pub methods: Vec<String>,
}

/// Notification type permissions
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPermissions {
    /// Allowed notification types, in proposal order
    pub types: Vec<String>,
}

/// Blockchain permissions (sessions only)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockchainPermissions {
    /// Allowed chain ids, in proposal order
    pub chains: Vec<String>,
}

/// Proposed permissions, before a controller is bound
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    /// JSON-RPC method permissions
    pub jsonrpc: JsonRpcPermissions,
    /// Notification type permissions
    #[serde(default)]
    pub notifications: NotificationPermissions,
    /// Blockchain permissions; populated for sessions only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<BlockchainPermissions>,
}

/// The participant authorized to upgrade permissions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRef {
    /// The controller's public key
    pub public_key: String,
}

/// Settled permissions: the proposed set plus the bound controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettledPermissions {
    /// The negotiated permission set
    #[serde(flatten)]
    pub permissions: Permissions,
    /// The sole participant authorized to upgrade the set
    pub controller: ControllerRef,
}

/// How a responder learns of a proposal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum Signal {
    /// Out-of-band URI (pairing bootstrap)
    Uri {
        /// The `wc:` URI
        uri: String,
    },
    /// An existing pairing carries the proposal (sessions)
    Pairing {
        /// Settled pairing topic
        topic: Topic,
    },
}

/// A broadcast proposal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposal topic the handshake happens on
    pub topic: Topic,
    /// Relay descriptor
    pub relay: Relay,
    /// The proposing participant
    pub proposer: ProposedPeer,
    /// How the responder received this proposal
    pub signal: Signal,
    /// Proposed permissions
    pub permissions: Permissions,
    /// Lifetime of the sequence once settled, in seconds
    pub ttl: u64,
}

/// Pending sequence status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Proposal sent or received, no response yet
    Proposed,
    /// Response sent or received, awaiting acknowledgement
    Responded,
}

/// Outcome of a proposal response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome<S> {
    /// The responder approved and announced the settled channel
    Approved(ApprovedOutcome<S>),
    /// The responder rejected
    Rejected {
        /// Reason supplied by the responder
        reason: String,
    },
}

/// The settlement data announced by an approving responder
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedOutcome<S> {
    /// Settled topic derived from the shared secret
    pub topic: Topic,
    /// Relay descriptor
    pub relay: Relay,
    /// The responding participant
    pub responder: Participant,
    /// Absolute expiry of the settled sequence
    pub expiry: u64,
    /// Initial shared state
    pub state: S,
}

/// A pending sequence, keyed by its proposal topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pending<S> {
    /// Phase of the handshake
    pub status: PendingStatus,
    /// Proposal topic
    pub topic: Topic,
    /// Relay descriptor
    pub relay: Relay,
    /// Our own participant identity
    #[serde(rename = "self")]
    pub local: Participant,
    /// The proposal being negotiated
    pub proposal: Proposal,
    /// Response outcome, present once status is `responded`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome<S>>,
}

/// A settled sequence, keyed by its settled topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settled<S> {
    /// Settled topic; the keychain holds its symmetric key
    pub topic: Topic,
    /// Relay descriptor
    pub relay: Relay,
    /// Our own participant identity
    #[serde(rename = "self")]
    pub local: Participant,
    /// The remote participant
    pub peer: Participant,
    /// Negotiated permissions with the bound controller
    pub permissions: SettledPermissions,
    /// Absolute expiry, seconds since the Unix epoch
    pub expiry: u64,
    /// Mutable participant-shared state
    pub state: S,
}

/// A notification event forwarded to the peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification type; checked against permissions
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary payload
    pub data: Value,
}

/// Append the members of `add` that `dst` lacks, preserving order
pub fn merge_unique(dst: &mut Vec<String>, add: &[String]) {
    for item in add {
        if !dst.contains(item) {
            dst.push(item.clone());
        }
    }
}
