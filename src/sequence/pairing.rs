//! Pairing policy
//!
//! Pairings are the long-lived control channel: they settle once from a
//! scanned URI and thereafter mostly carry session proposals, which is why
//! their default permissions whitelist exactly that method.

use serde::{Deserialize, Serialize};

use super::types::{AppMetadata, Permissions, SettledPermissions, Signal};
use super::SequenceKind;
use crate::error::{Error, Result};
use crate::sequence::types::merge_unique;
use crate::uri::ProposalUri;
use crate::Topic;

/// Settled pairing lifetime: 30 days
pub const PAIRING_SETTLED_TTL: u64 = 2_592_000;

/// Pending pairing lifetime: 5 minutes
pub const PAIRING_PENDING_TTL: u64 = 300;

/// Mutable pairing state; only metadata is shared
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PairingState {
    /// Metadata of the non-controller application
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// The pairing instantiation of the sequence engine
pub struct PairingKind;

impl SequenceKind for PairingKind {
    const NAME: &'static str = "pairing";
    const PENDING_TTL: u64 = PAIRING_PENDING_TTL;
    const SETTLED_TTL: u64 = PAIRING_SETTLED_TTL;

    type State = PairingState;

    fn default_permissions() -> Permissions {
        Permissions {
            jsonrpc: super::types::JsonRpcPermissions {
                methods: vec![super::session::SESSION_PROPOSE_METHOD.to_string()],
            },
            notifications: Default::default(),
            blockchain: None,
        }
    }

    fn signal(uri: ProposalUri, _pairing_topic: Option<Topic>) -> Result<Signal> {
        Ok(Signal::Uri { uri: uri.format()? })
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
    }

    fn merge_state(
        current: &mut Self::State,
        update: Self::State,
        sender_is_controller: bool,
    ) -> Result<()> {
        if !sender_is_controller {
            return Err(Error::UnauthorizedMatchingController);
        }
        if let Some(metadata) = update.metadata {
            current.metadata = Some(metadata);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::types::{ControllerRef, JsonRpcPermissions};

    fn settled_permissions(methods: &[&str]) -> SettledPermissions {
        SettledPermissions {
            permissions: Permissions {
                jsonrpc: JsonRpcPermissions {
                    methods: methods.iter().map(|m| m.to_string()).collect(),
                },
                notifications: Default::default(),
                blockchain: None,
            },
            controller: ControllerRef {
                public_key: "cc".into(),
            },
        }
    }

    #[test]
    fn test_default_permissions_allow_session_proposals() {
        let permissions = PairingKind::default_permissions();
        assert_eq!(permissions.jsonrpc.methods, vec!["wc_sessionPropose"]);
        assert!(permissions.notifications.types.is_empty());
    }

    #[test]
    fn test_upgrade_is_union_and_preserves_controller() {
        let mut current = settled_permissions(&["wc_sessionPropose"]);
        let upgrade = Permissions {
            jsonrpc: JsonRpcPermissions {
                methods: vec!["wc_sessionPropose".into(), "custom_method".into()],
            },
            ..Default::default()
        };
        PairingKind::merge_permissions(&mut current, &upgrade);

        assert_eq!(
            current.permissions.jsonrpc.methods,
            vec!["wc_sessionPropose", "custom_method"]
        );
        assert_eq!(current.controller.public_key, "cc");
    }

    #[test]
    fn test_update_requires_controller() {
        let mut state = PairingState::default();
        let update = PairingState {
            metadata: Some(AppMetadata {
                name: "wallet".into(),
                description: String::new(),
                url: String::new(),
                icons: vec![],
            }),
        };

        assert!(PairingKind::merge_state(&mut state, update.clone(), false).is_err());
        PairingKind::merge_state(&mut state, update, true).unwrap();
        assert_eq!(state.metadata.as_ref().unwrap().name, "wallet");
    }
}
