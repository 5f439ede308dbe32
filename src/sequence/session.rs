//! Session policy
//!
//! Sessions are the application channel: scoped JSON-RPC methods,
//! notification types and target chains, with accounts exposed by the
//! controller (the wallet) once settled.

use serde::{Deserialize, Serialize};

use super::types::{AppMetadata, Permissions, SettledPermissions, Signal};
use super::SequenceKind;
use crate::error::{Error, Result};
use crate::sequence::types::merge_unique;
use crate::uri::ProposalUri;
use crate::Topic;

/// Settled session lifetime: 7 days
pub const SESSION_SETTLED_TTL: u64 = 604_800;

/// Pending session lifetime: 5 minutes
pub const SESSION_PENDING_TTL: u64 = 300;

/// The method a session proposal travels under, as a pairing payload
pub const SESSION_PROPOSE_METHOD: &str = "wc_sessionPropose";

/// Mutable session state
///
/// The controller owns `accounts`; the non-controller owns `metadata`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Exposed accounts, `namespace:chain:address`
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Metadata of the non-controller application
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// The session instantiation of the sequence engine
pub struct SessionKind;

impl SequenceKind for SessionKind {
    const NAME: &'static str = "session";
    const PENDING_TTL: u64 = SESSION_PENDING_TTL;
    const SETTLED_TTL: u64 = SESSION_SETTLED_TTL;

    type State = SessionState;

    fn default_permissions() -> Permissions {
        Permissions {
            jsonrpc: Default::default(),
            notifications: Default::default(),
            blockchain: Some(Default::default()),
        }
    }

    fn signal(_uri: ProposalUri, pairing_topic: Option<Topic>) -> Result<Signal> {
        let topic = pairing_topic.ok_or(Error::MissingOrInvalid {
            field: "pairing topic".to_string(),
        })?;
        Ok(Signal::Pairing { topic })
    }

    fn merge_permissions(current: &mut SettledPermissions, upgrade: &Permissions) {
        merge_unique(
            &mut current.permissions.jsonrpc.methods,
            &upgrade.jsonrpc.methods,
        );
        merge_unique(
            &mut current.permissions.notifications.types,
            &upgrade.notifications.types,
        );
        if let Some(upgrade_chains) = &upgrade.blockchain {
            let blockchain = current.permissions.blockchain.get_or_insert_with(Default::default);
            merge_unique(&mut blockchain.chains, &upgrade_chains.chains);
        }
    }

    fn merge_state(
        current: &mut Self::State,
        update: Self::State,
        sender_is_controller: bool,
    ) -> Result<()> {
        if !update.accounts.is_empty() {
            if !sender_is_controller {
                return Err(Error::UnauthorizedMatchingController);
            }
            current.accounts = update.accounts;
        }
        if let Some(metadata) = update.metadata {
            if sender_is_controller {
                return Err(Error::UnauthorizedMatchingController);
            }
            current.metadata = Some(metadata);
        }
        Ok(())
    }
}
