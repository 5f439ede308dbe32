//! Protocol error taxonomy
//!
//! Every protocol-visible failure carries a stable string code (used in
//! logs and deletion reasons) and a numeric code (used on the JSON-RPC
//! wire). Transport failures never surface through this type to protocol
//! callers; the relayer swallows them and reconnects.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::relay::transport::TransportError;
use crate::storage::StorageError;

/// Errors that can occur in protocol operations
#[derive(Error, Debug)]
pub enum Error {
    /// No pending or settled sequence exists at the topic
    #[error("No matching topic: {topic}")]
    NoMatchingTopic {
        /// The topic that was looked up
        topic: String,
    },

    /// An awaited response never arrived within the timeout
    #[error("No matching response for request {id}")]
    NoMatchingResponse {
        /// The JSON-RPC id of the abandoned request
        id: u64,
    },

    /// The settled topic announced by the peer does not match the derived one
    #[error("Mismatched topic: expected {expected}, got {actual}")]
    MismatchedTopic {
        /// Topic derived locally from the shared secret
        expected: String,
        /// Topic announced by the peer
        actual: String,
    },

    /// Both participants claim the same controller role
    #[error("Unauthorized: matching controller flag")]
    UnauthorizedMatchingController,

    /// The JSON-RPC method is not in the sequence permissions
    #[error("Unauthorized JSON-RPC method: {method}")]
    UnauthorizedJsonRpcMethod {
        /// The rejected method name
        method: String,
    },

    /// The notification type is not in the sequence permissions
    #[error("Unauthorized notification type: {kind}")]
    UnauthorizedNotificationType {
        /// The rejected notification type
        kind: String,
    },

    /// The target chain is not in the sequence permissions
    #[error("Unauthorized target chain: {chain_id}")]
    UnauthorizedTargetChain {
        /// The rejected chain id
        chain_id: String,
    },

    /// A required field is absent or malformed
    #[error("Missing or invalid {field}")]
    MissingOrInvalid {
        /// Name of the offending field
        field: String,
    },

    /// A JSON-RPC response carried neither result nor error
    #[error("Missing response")]
    MissingResponse,

    /// The sequence outlived its TTL
    #[error("Expired: {topic}")]
    Expired {
        /// Topic of the expired sequence
        topic: String,
    },

    /// The sequence is already settled
    #[error("Already settled: {topic}")]
    Settled {
        /// Topic of the settled sequence
        topic: String,
    },

    /// Restoring persisted state would overwrite a live entry
    #[error("Restore would override live entry: {topic}")]
    RestoreWillOverride {
        /// The colliding topic
        topic: String,
    },

    /// The peer rejected the proposal
    #[error("Rejected by peer: {reason}")]
    Rejected {
        /// Reason string supplied by the peer
        reason: String,
    },

    /// A JSON-RPC error response with a code outside this taxonomy
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Numeric wire code
        code: i64,
        /// Human-readable message
        message: String,
    },

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Storage adapter failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Envelope (de)serialization failure
    #[error("Serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable string code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoMatchingTopic { .. } => "NO_MATCHING_TOPIC",
            Error::NoMatchingResponse { .. } => "NO_MATCHING_RESPONSE",
            Error::MismatchedTopic { .. } => "MISMATCHED_TOPIC",
            Error::UnauthorizedMatchingController => "UNAUTHORIZED_MATCHING_CONTROLLER",
            Error::UnauthorizedJsonRpcMethod { .. } => "UNAUTHORIZED_JSON_RPC_METHOD",
            Error::UnauthorizedNotificationType { .. } => "UNAUTHORIZED_NOTIFICATION_TYPE",
            Error::UnauthorizedTargetChain { .. } => "UNAUTHORIZED_TARGET_CHAIN",
            Error::MissingOrInvalid { .. } => "MISSING_OR_INVALID",
            Error::MissingResponse => "MISSING_RESPONSE",
            Error::Expired { .. } => "EXPIRED",
            Error::Settled { .. } => "SETTLED",
            Error::RestoreWillOverride { .. } => "RESTORE_WILL_OVERRIDE",
            Error::Rejected { .. } => "REJECTED",
            Error::Crypto(CryptoError::KeyNotFound { .. })
            | Error::Crypto(CryptoError::KeyPairNotFound { .. }) => "KEY_NOT_FOUND",
            Error::Crypto(_) => "DECRYPTION_FAILED",
            Error::Storage(_) => "STORAGE_FAILED",
            Error::Transport(_) => "TRANSPORT_FAILED",
            Error::Serde(_) => "MISSING_OR_INVALID",
            Error::JsonRpc { .. } => "JSON_RPC_ERROR",
        }
    }

    /// Numeric code used when this error travels as a JSON-RPC error
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::MissingOrInvalid { .. } | Error::Serde(_) => 1000,
            Error::MissingResponse => 1001,
            Error::NoMatchingTopic { .. } => 1300,
            Error::NoMatchingResponse { .. } => 1301,
            Error::MismatchedTopic { .. } => 1302,
            Error::Expired { .. } => 1303,
            Error::Settled { .. } => 1304,
            Error::RestoreWillOverride { .. } => 1305,
            Error::Crypto(CryptoError::KeyNotFound { .. })
            | Error::Crypto(CryptoError::KeyPairNotFound { .. }) => 2001,
            Error::Crypto(_) => 2000,
            Error::UnauthorizedJsonRpcMethod { .. } => 3000,
            Error::UnauthorizedNotificationType { .. } => 3001,
            Error::UnauthorizedTargetChain { .. } => 3002,
            Error::UnauthorizedMatchingController => 3003,
            Error::Rejected { .. } => 5000,
            Error::JsonRpc { code, .. } => *code,
            Error::Storage(_) | Error::Transport(_) => -32000,
        }
    }

    /// Reconstruct an error from a JSON-RPC error response
    ///
    /// Codes within the taxonomy map back to their variant; everything
    /// else is preserved verbatim as [`Error::JsonRpc`].
    pub fn from_rpc(code: i64, message: String) -> Self {
        match code {
            1001 => Error::MissingResponse,
            3003 => Error::UnauthorizedMatchingController,
            5000 => Error::Rejected { reason: message },
            _ => Error::JsonRpc { code, message },
        }
    }
}
