//! TTL and restart behavior across the persistence boundary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use accord::client::ConnectParams;
use accord::relay::transport::memory::MemoryRelay;
use accord::sequence::session::SessionState;
use accord::sequence::types::{
    AppMetadata, JsonRpcPermissions, Notification, NotificationPermissions, Permissions, Proposal,
    Relay,
};
use accord::storage::MemoryStorage;
use accord::store::{now_secs, SequenceStore, StoreEvent, REASON_EXPIRED};
use accord::{Client, ClientConfig, ClientEvent};

const WAIT: Duration = Duration::from_secs(5);

fn metadata(name: &str) -> AppMetadata {
    AppMetadata {
        name: name.to_string(),
        description: format!("{name} test client"),
        url: format!("https://{name}.example"),
        icons: vec![],
    }
}

fn permissions() -> Permissions {
    Permissions {
        jsonrpc: JsonRpcPermissions {
            methods: vec!["eth_sendTransaction".into()],
        },
        notifications: NotificationPermissions {
            types: vec!["accountsChanged".into()],
        },
        blockchain: None,
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

/// Settle a session between a dapp (with the given storage) and a wallet.
async fn settle(
    relay: &MemoryRelay,
    dapp_storage: Arc<MemoryStorage>,
    kill: &mut Option<accord::relay::transport::memory::KillSwitch>,
) -> (Client, Client, String) {
    let transport = relay.transport();
    *kill = Some(transport.kill_switch());
    let dapp = Client::init(ClientConfig {
        controller: false,
        metadata: Some(metadata("dapp")),
        storage: Some(dapp_storage),
        transport: Some(Box::new(transport)),
        ..Default::default()
    })
    .await
    .unwrap();
    let wallet = Client::init(ClientConfig {
        controller: true,
        metadata: Some(metadata("wallet")),
        transport: Some(Box::new(relay.transport())),
        ..Default::default()
    })
    .await
    .unwrap();

    let mut dapp_events = dapp.events();
    let mut wallet_events = wallet.events();

    let connector = dapp.clone();
    let connect = tokio::spawn(async move {
        connector
            .connect(ConnectParams {
                permissions: permissions(),
                pairing_topic: None,
            })
            .await
    });

    let uri = wait_for(&mut dapp_events, |event| match event {
        ClientEvent::PairingProposal { uri, .. } => Some(uri),
        _ => None,
    })
    .await;
    wallet.pair(&uri).await.unwrap();

    let proposal: Proposal = wait_for(&mut wallet_events, |event| match event {
        ClientEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;
    wallet
        .approve(
            proposal,
            SessionState {
                accounts: vec!["eip155:1:0xabc".into()],
                metadata: None,
            },
        )
        .await
        .unwrap();

    let session = tokio::time::timeout(WAIT, connect)
        .await
        .expect("connect timed out")
        .expect("connect task")
        .unwrap();
    (dapp, wallet, session.topic)
}

#[tokio::test]
async fn short_ttl_deletes_on_both_stores() {
    // Simulates both peers' stores holding the same short-lived sequence.
    let proposer: Arc<SequenceStore<String>> =
        SequenceStore::new("proposer", "pending", Arc::new(MemoryStorage::new()), 60);
    let responder: Arc<SequenceStore<String>> =
        SequenceStore::new("responder", "pending", Arc::new(MemoryStorage::new()), 60);
    proposer.init().await.unwrap();
    responder.init().await.unwrap();

    let mut proposer_events = proposer.subscribe_events();
    let mut responder_events = responder.subscribe_events();

    let expiry = now_secs() + 2;
    for store in [&proposer, &responder] {
        store
            .set("t1", "sequence".to_string(), Relay::default(), Some(expiry))
            .await
            .unwrap();
    }

    for events in [&mut proposer_events, &mut responder_events] {
        // Created, then Deleted{EXPIRED} once the timer fires.
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::Created(_)
        ));
        let deleted = tokio::time::timeout(Duration::from_secs(4), events.recv())
            .await
            .expect("expiry within 4s")
            .unwrap();
        match deleted {
            StoreEvent::Deleted { reason, .. } => assert_eq!(reason, REASON_EXPIRED),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(proposer.is_empty().await);
    assert!(responder.is_empty().await);
}

#[tokio::test]
async fn restart_restores_identical_state() {
    let relay = MemoryRelay::new();
    let storage = Arc::new(MemoryStorage::new());
    let mut kill = None;
    let (dapp, wallet, topic) = settle(&relay, storage.clone(), &mut kill).await;

    let sessions_before = dapp.sessions().await;
    let pairings_before = dapp.pairings().await;
    let key_before = dapp.crypto().symmetric_key(&topic).await.unwrap();

    // Stop the first incarnation and bring up a second one on the same
    // storage with a fresh connection.
    kill.take().unwrap().kill();
    drop(dapp);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let restored = Client::init(ClientConfig {
        controller: false,
        metadata: Some(metadata("dapp")),
        storage: Some(storage),
        transport: Some(Box::new(relay.transport())),
        ..Default::default()
    })
    .await
    .unwrap();
    let mut restored_events = restored.events();

    // Bit-equal persisted state.
    assert_eq!(
        serde_json::to_string(&sessions_before).unwrap(),
        serde_json::to_string(&restored.sessions().await).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&pairings_before).unwrap(),
        serde_json::to_string(&restored.pairings().await).unwrap()
    );
    assert_eq!(
        restored.crypto().symmetric_key(&topic).await.unwrap(),
        key_before
    );

    // The restored client resubscribed its settled topics: live traffic
    // from the wallet still arrives.
    wallet
        .notify(
            &topic,
            Notification {
                kind: "accountsChanged".into(),
                data: json!(["eip155:1:0xafter"]),
            },
        )
        .await
        .unwrap();
    let notification = wait_for(&mut restored_events, |event| match event {
        ClientEvent::SessionNotification { notification, .. } => Some(notification),
        _ => None,
    })
    .await;
    assert_eq!(notification.data, json!(["eip155:1:0xafter"]));

    // And the restored side can still reach the wallet.
    restored.ping(&topic, None).await.unwrap();
}

#[tokio::test]
async fn stale_pending_is_dropped_on_restore() {
    // A pending entry whose persisted expiry already passed must be deleted
    // with EXPIRED during init, before the store is observable.
    let storage = Arc::new(MemoryStorage::new());

    let first: Arc<SequenceStore<String>> =
        SequenceStore::new("session", "pending", storage.clone(), 1);
    first.init().await.unwrap();
    first
        .set("t1", "sequence".to_string(), Relay::default(), Some(now_secs() + 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second: Arc<SequenceStore<String>> =
        SequenceStore::new("session", "pending", storage, 1);
    let mut events = second.subscribe_events();
    second.init().await.unwrap();

    assert!(second.is_empty().await);
    // If the first store's timer already removed it, restore sees nothing;
    // otherwise restore itself must have emitted the expiry deletion.
    if let Ok(StoreEvent::Deleted { reason, .. }) = events.try_recv() {
        assert_eq!(reason, REASON_EXPIRED);
    }
}
