//! End-to-end scenarios: two full clients over an in-memory relay.

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use accord::client::ConnectParams;
use accord::relay::jsonrpc::{Request, Response};
use accord::relay::transport::memory::MemoryRelay;
use accord::sequence::session::SessionState;
use accord::sequence::types::{
    AppMetadata, BlockchainPermissions, JsonRpcPermissions, Notification,
    NotificationPermissions, Permissions, Proposal,
};
use accord::{Client, ClientConfig, ClientEvent, Error};

const WAIT: Duration = Duration::from_secs(5);

fn metadata(name: &str) -> AppMetadata {
    AppMetadata {
        name: name.to_string(),
        description: format!("{name} test client"),
        url: format!("https://{name}.example"),
        icons: vec![],
    }
}

async fn client(relay: &MemoryRelay, controller: bool, name: &str) -> Client {
    Client::init(ClientConfig {
        controller,
        metadata: Some(metadata(name)),
        transport: Some(Box::new(relay.transport())),
        ..Default::default()
    })
    .await
    .expect("client init")
}

fn session_permissions() -> Permissions {
    Permissions {
        jsonrpc: JsonRpcPermissions {
            methods: vec!["eth_sendTransaction".into()],
        },
        notifications: NotificationPermissions {
            types: vec!["accountsChanged".into()],
        },
        blockchain: Some(BlockchainPermissions {
            chains: vec!["eip155:1".into()],
        }),
    }
}

fn wallet_state() -> SessionState {
    SessionState {
        accounts: vec!["eip155:1:0xabc".into()],
        metadata: None,
    }
}

async fn wait_for<F, T>(events: &mut broadcast::Receiver<ClientEvent>, mut pick: F) -> T
where
    F: FnMut(ClientEvent) -> Option<T>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_uri(events: &mut broadcast::Receiver<ClientEvent>) -> String {
    wait_for(events, |event| match event {
        ClientEvent::PairingProposal { uri, .. } => Some(uri),
        _ => None,
    })
    .await
}

async fn wait_for_proposal(events: &mut broadcast::Receiver<ClientEvent>) -> Proposal {
    wait_for(events, |event| match event {
        ClientEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await
}

/// Full handshake: pairing over URI, then a session over the pairing.
/// Returns (dapp, wallet, settled session topic).
async fn establish_session(relay: &MemoryRelay) -> (Client, Client, String) {
    let dapp = client(relay, false, "dapp").await;
    let wallet = client(relay, true, "wallet").await;

    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let connector = dapp.clone();
    let connect = tokio::spawn(async move {
        connector
            .connect(ConnectParams {
                permissions: session_permissions(),
                pairing_topic: None,
            })
            .await
    });

    let uri = wait_for_uri(&mut dapp_events).await;
    wallet.pair(&uri).await.expect("pair");

    let proposal = wait_for_proposal(&mut wallet_events).await;
    let wallet_session = wallet
        .approve(proposal, wallet_state())
        .await
        .expect("approve");

    let dapp_session = tokio::time::timeout(WAIT, connect)
        .await
        .expect("connect timed out")
        .expect("connect task")
        .expect("connect");

    assert_eq!(dapp_session.topic, wallet_session.topic);
    let topic = dapp_session.topic.clone();
    (dapp, wallet, topic)
}

#[tokio::test]
async fn pairing_handshake_shares_topic_and_key() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, _) = establish_session(&relay).await;

    let dapp_pairings = dapp.pairings().await;
    let wallet_pairings = wallet.pairings().await;
    assert_eq!(dapp_pairings.len(), 1);
    assert_eq!(wallet_pairings.len(), 1);
    assert_eq!(dapp_pairings[0].topic, wallet_pairings[0].topic);

    // Both keychains hold the same key bytes under the settled topic.
    let topic = &dapp_pairings[0].topic;
    assert_eq!(
        dapp.crypto().symmetric_key(topic).await.unwrap(),
        wallet.crypto().symmetric_key(topic).await.unwrap()
    );

    // Pending entries were retired on settlement.
    assert!(dapp.pairing().pending_sequences().await.is_empty());
    assert!(wallet.pairing().pending_sequences().await.is_empty());
}

#[tokio::test]
async fn session_settles_with_proposed_permissions_and_accounts() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;

    for client in [&dapp, &wallet] {
        let session = client.session().get_settled(&topic).await.unwrap();
        assert_eq!(
            session.permissions.permissions.jsonrpc.methods,
            vec!["eth_sendTransaction"]
        );
        assert_eq!(session.state.accounts, vec!["eip155:1:0xabc"]);
        // The wallet is the controller on both views.
        let controller_key = &session.permissions.controller.public_key;
        let wallet_view = wallet.session().get_settled(&topic).await.unwrap();
        assert_eq!(controller_key, &wallet_view.permissions.controller.public_key);
    }

    // Settled topic has a key iff it is in the settled store, on both sides.
    assert!(dapp.crypto().has_keys(&topic).await);
    assert!(wallet.crypto().has_keys(&topic).await);
}

#[tokio::test]
async fn upgrade_is_monotonic_on_both_sides() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;
    let mut dapp_events = dapp.events();

    let upgraded = wallet
        .upgrade(
            &topic,
            Permissions {
                jsonrpc: JsonRpcPermissions {
                    methods: vec!["personal_sign".into()],
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        upgraded.permissions.permissions.jsonrpc.methods,
        vec!["eth_sendTransaction", "personal_sign"]
    );

    // The dapp applied the same union on receipt.
    let session = wait_for(&mut dapp_events, |event| match event {
        ClientEvent::SessionUpgraded { session } => Some(session),
        _ => None,
    })
    .await;
    assert_eq!(
        session.permissions.permissions.jsonrpc.methods,
        vec!["eth_sendTransaction", "personal_sign"]
    );
}

#[tokio::test]
async fn upgrade_from_non_controller_fails_locally() {
    let relay = MemoryRelay::new();
    let (dapp, _wallet, topic) = establish_session(&relay).await;

    let err = dapp
        .upgrade(
            &topic,
            Permissions {
                jsonrpc: JsonRpcPermissions {
                    methods: vec!["personal_sign".into()],
                },
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED_MATCHING_CONTROLLER");
}

#[tokio::test]
async fn unauthorized_request_fails_before_transmission() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;
    let mut wallet_events = wallet.events();

    let err = dapp
        .request(&topic, Request::new("eth_chainId", json!([])), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED_JSON_RPC_METHOD");

    // Nothing reached the wallet.
    let seen_request = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            if let Ok(ClientEvent::SessionRequest { .. }) = wallet_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(seen_request.is_err());
}

#[tokio::test]
async fn unauthorized_chain_fails_locally() {
    let relay = MemoryRelay::new();
    let (dapp, _wallet, topic) = establish_session(&relay).await;

    let err = dapp
        .request(
            &topic,
            Request::new("eth_sendTransaction", json!([])),
            Some("eip155:137".into()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED_TARGET_CHAIN");
}

#[tokio::test]
async fn request_roundtrip_resolves_with_peer_response() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;
    let mut wallet_events = wallet.events();

    // Wallet answers the forwarded request by its id.
    let answerer = wallet.clone();
    tokio::spawn(async move {
        loop {
            if let Ok(ClientEvent::SessionRequest { topic, request, .. }) =
                wallet_events.recv().await
            {
                assert_eq!(request.method, "eth_sendTransaction");
                answerer
                    .respond(&topic, Response::result(request.id, json!("0xtxhash")))
                    .await
                    .unwrap();
                return;
            }
        }
    });

    let result = dapp
        .request(
            &topic,
            Request::new("eth_sendTransaction", json!([{"to": "0xabc"}])),
            Some("eip155:1".into()),
        )
        .await
        .unwrap();
    assert_eq!(result, json!("0xtxhash"));

    // The history entry was cleared by the response.
    assert!(dapp.history().is_empty().await);
}

#[tokio::test]
async fn notifications_respect_permissions() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;
    let mut dapp_events = dapp.events();

    // The wallet (controller) may notify with any type.
    wallet
        .notify(
            &topic,
            Notification {
                kind: "accountsChanged".into(),
                data: json!(["eip155:1:0xdef"]),
            },
        )
        .await
        .unwrap();
    let notification = wait_for(&mut dapp_events, |event| match event {
        ClientEvent::SessionNotification { notification, .. } => Some(notification),
        _ => None,
    })
    .await;
    assert_eq!(notification.kind, "accountsChanged");

    // The dapp is bound to the permitted types.
    let err = dapp
        .notify(
            &topic,
            Notification {
                kind: "somethingElse".into(),
                data: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED_NOTIFICATION_TYPE");
}

#[tokio::test]
async fn rejection_surfaces_the_peer_reason() {
    let relay = MemoryRelay::new();
    let dapp = client(&relay, false, "dapp").await;
    let wallet = client(&relay, true, "wallet").await;

    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let connector = dapp.clone();
    let connect = tokio::spawn(async move {
        connector
            .connect(ConnectParams {
                permissions: session_permissions(),
                pairing_topic: None,
            })
            .await
    });

    let uri = wait_for_uri(&mut dapp_events).await;
    wallet.pair(&uri).await.unwrap();

    let proposal = wait_for_proposal(&mut wallet_events).await;
    wallet
        .reject(proposal, Some("user declined".into()))
        .await
        .unwrap();

    let err = tokio::time::timeout(WAIT, connect)
        .await
        .expect("connect timed out")
        .expect("connect task")
        .unwrap_err();
    match err {
        Error::Rejected { reason } => assert_eq!(reason, "user declined"),
        other => panic!("unexpected error: {other:?}"),
    }

    // No settled session anywhere.
    assert!(dapp.sessions().await.is_empty());
    assert!(wallet.sessions().await.is_empty());
}

#[tokio::test]
async fn matching_controller_proposals_are_auto_rejected() {
    let relay = MemoryRelay::new();
    // Two non-controllers: the responder must refuse.
    let dapp = client(&relay, false, "dapp").await;
    let peer = client(&relay, false, "peer").await;

    let mut dapp_events = dapp.events();
    let connector = dapp.clone();
    let connect = tokio::spawn(async move {
        connector
            .connect(ConnectParams {
                permissions: session_permissions(),
                pairing_topic: None,
            })
            .await
    });

    let uri = wait_for_uri(&mut dapp_events).await;
    let err = peer.pair(&uri).await.unwrap_err();
    assert_eq!(err.code(), "REJECTED");

    let connect_result = tokio::time::timeout(WAIT, connect)
        .await
        .expect("connect timed out")
        .expect("connect task");
    assert!(connect_result.is_err());
}

#[tokio::test]
async fn disconnect_tears_down_both_sides() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;
    let mut wallet_events = wallet.events();

    dapp.disconnect(&topic, "USER_DISCONNECTED").await.unwrap();
    assert!(dapp.sessions().await.is_empty());
    assert!(!dapp.crypto().has_keys(&topic).await);

    let reason = wait_for(&mut wallet_events, |event| match event {
        ClientEvent::SessionDeleted { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, "USER_DISCONNECTED");
    assert!(wallet.sessions().await.is_empty());
    assert!(!wallet.crypto().has_keys(&topic).await);
}

#[tokio::test]
async fn ping_roundtrips_on_sessions_and_pairings() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, topic) = establish_session(&relay).await;

    dapp.ping(&topic, None).await.unwrap();

    let pairing_topic = wallet.pairings().await[0].topic.clone();
    wallet.ping(&pairing_topic, None).await.unwrap();

    let err = dapp.ping("00no-such-topic", None).await.unwrap_err();
    assert_eq!(err.code(), "NO_MATCHING_TOPIC");
}

#[tokio::test]
async fn second_session_reuses_the_pairing() {
    let relay = MemoryRelay::new();
    let (dapp, wallet, _) = establish_session(&relay).await;
    let mut wallet_events = wallet.events();

    let pairing_topic = dapp.pairings().await[0].topic.clone();
    let connector = dapp.clone();
    let connect = tokio::spawn(async move {
        connector
            .connect(ConnectParams {
                permissions: session_permissions(),
                pairing_topic: Some(pairing_topic),
            })
            .await
    });

    let proposal = wait_for_proposal(&mut wallet_events).await;
    wallet.approve(proposal, wallet_state()).await.unwrap();

    tokio::time::timeout(WAIT, connect)
        .await
        .expect("connect timed out")
        .expect("connect task")
        .expect("second session");

    assert_eq!(dapp.pairings().await.len(), 1);
    assert_eq!(dapp.sessions().await.len(), 2);
    assert_eq!(wallet.sessions().await.len(), 2);
}

#[tokio::test]
async fn reconnect_restores_subscriptions_and_traffic() {
    let relay = MemoryRelay::new();

    let transport = relay.transport();
    let kill = transport.kill_switch();
    let dapp = Client::init(ClientConfig {
        controller: false,
        metadata: Some(metadata("dapp")),
        transport: Some(Box::new(transport)),
        ..Default::default()
    })
    .await
    .unwrap();
    let wallet = client(&relay, true, "wallet").await;

    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let connector = dapp.clone();
    let connect = tokio::spawn(async move {
        connector
            .connect(ConnectParams {
                permissions: session_permissions(),
                pairing_topic: None,
            })
            .await
    });
    let uri = wait_for_uri(&mut dapp_events).await;
    wallet.pair(&uri).await.unwrap();
    let proposal = wait_for_proposal(&mut wallet_events).await;
    wallet.approve(proposal, wallet_state()).await.unwrap();
    let session = tokio::time::timeout(WAIT, connect)
        .await
        .expect("connect timed out")
        .expect("connect task")
        .unwrap();

    // Sever the dapp's transport; the relayer reconnects and resubscribes.
    kill.kill();
    tokio::time::sleep(Duration::from_millis(200)).await;

    wallet
        .notify(
            &session.topic,
            Notification {
                kind: "accountsChanged".into(),
                data: json!(["eip155:1:0xnew"]),
            },
        )
        .await
        .unwrap();

    let notification = wait_for(&mut dapp_events, |event| match event {
        ClientEvent::SessionNotification { notification, .. } => Some(notification),
        _ => None,
    })
    .await;
    assert_eq!(notification.data, json!(["eip155:1:0xnew"]));
}
