//! End-to-end sync scenarios
//!
//! Offline writes replayed on reconnect, two instances racing on one entity,
//! TTL cleanup around subscribers, durable replay across a restart and
//! per-key write ordering.

use std::sync::Arc;
use std::time::Duration;

use entity_sync::cache::{shallow_merge, CacheKey, EntryStatus};
use entity_sync::crosstab::CrossTabHub;
use entity_sync::mutation::{MutationStatus, ServerCall};
use entity_sync::offline::{ActionTemplate, JsonFilePersistence, MemoryPersistence, NetworkStatus};
use entity_sync::transport::fake::FakeServer;
use entity_sync::transport::Method;
use entity_sync::{Config, SyncClient, SyncError};
use proptest::prelude::*;
use serde_json::{json, Value};

// == Helpers ==

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn offline_client(server: &Arc<FakeServer>, network: &NetworkStatus) -> SyncClient {
    SyncClient::builder(
        Config::default(),
        server.clone(),
        Arc::new(MemoryPersistence::new()),
    )
    .network(network.clone())
    .build()
}

fn update_client_1() -> ServerCall {
    ServerCall::Request(ActionTemplate::update("/clients/1"))
}

fn key(raw: &str) -> CacheKey {
    CacheKey::from(raw)
}

// == Scenario A ==

#[tokio::test]
async fn test_offline_mutation_confirms_on_reconnect() {
    let server = Arc::new(FakeServer::new());
    server.seed("/clients/1", json!({"name": "Initial"}), 1);
    let network = NetworkStatus::new(false);
    let client = offline_client(&server, &network);
    client.store().set(key("client:1"), json!({"name": "Initial"}), 1);
    client.start();

    let mut handle = client.mutate(key("client:1"), json!({"name": "A"}), update_client_1());
    assert_eq!(handle.status(), MutationStatus::Applied);
    let shown = client.store().peek(&key("client:1")).unwrap();
    assert_eq!(shown.value["name"], "A");
    assert_eq!(shown.status, EntryStatus::Pending);

    settle().await;
    assert_eq!(client.queue_status().total_actions, 1);
    assert_eq!(server.write_count(), 0);

    network.set_online(true);
    let ack = handle.outcome().await.unwrap();
    assert_eq!(ack.version, 2);
    settle().await;

    let confirmed = client.store().peek(&key("client:1")).unwrap();
    assert_eq!(confirmed.value["name"], "A");
    assert_eq!(confirmed.version, 2);
    assert_eq!(confirmed.status, EntryStatus::Fresh);
    assert_eq!(client.queue_status().total_actions, 0);
    assert_eq!(client.pending_count(), 0);
    client.shutdown();
}

// == Scenario B ==

#[tokio::test]
async fn test_two_tabs_race_and_loser_converges() {
    let server = Arc::new(FakeServer::new());
    server.seed("/clients/1", json!({"name": "Initial"}), 1);
    let hub = CrossTabHub::default();
    let network_a = NetworkStatus::new(false);
    let network_b = NetworkStatus::new(false);
    let tab = |network: &NetworkStatus| {
        SyncClient::builder(
            Config::default(),
            server.clone(),
            Arc::new(MemoryPersistence::new()),
        )
        .network(network.clone())
        .cross_tab(hub.clone())
        .build()
    };
    let a = tab(&network_a);
    let b = tab(&network_b);
    for client in [&a, &b] {
        client.store().set(key("client:1"), json!({"name": "Initial"}), 1);
        client.start();
    }

    let mut from_a = a.mutate(key("client:1"), json!({"name": "From A"}), update_client_1());
    let mut from_b = b.mutate(key("client:1"), json!({"name": "From B"}), update_client_1());
    settle().await;
    assert_eq!(a.queue_status().total_actions, 1);
    assert_eq!(b.queue_status().total_actions, 1);
    assert_eq!(b.store().peek(&key("client:1")).unwrap().value["name"], "From B");

    // A reaches the server first.
    network_a.set_online(true);
    assert_eq!(from_a.outcome().await.unwrap().version, 2);
    settle().await;

    // B's write was computed against version 1.
    network_b.set_online(true);
    let lost = from_b.outcome().await;
    assert!(matches!(lost, Err(SyncError::Conflict { server_version: Some(2), .. })));
    assert_eq!(from_b.status(), MutationStatus::RolledBack);
    assert_eq!(b.conflicts().len(), 1);
    assert!(a.conflicts().is_empty());
    settle().await;

    let winner = server.record("/clients/1").unwrap();
    for client in [&a, &b] {
        let entry = client.store().peek(&key("client:1")).unwrap();
        assert_eq!(entry.value, winner);
        assert_eq!(entry.version, 2);
        assert_eq!(entry.status, EntryStatus::Fresh);
    }
    assert_eq!(b.queue_status().total_actions, 0);
    a.shutdown();
    b.shutdown();
}

// == Scenario C ==

#[tokio::test]
async fn test_ttl_cleanup_spares_subscribed_entries() {
    let server = Arc::new(FakeServer::new());
    let client = offline_client(&server, &NetworkStatus::default());
    let ttl = Duration::from_millis(60_000);
    client.store().set(key("client:1"), json!({}), 1);
    client.store().set(key("client:2"), json!({}), 1);
    let _watching = client.subscribe(&key("client:2"), |_| {});

    let fetched_at = client.store().peek(&key("client:1")).unwrap().fetched_at;
    let removed = client
        .memory()
        .cleanup_stale_entries_at(fetched_at + 60_001, ttl);

    assert_eq!(removed, vec![key("client:1")]);
    assert!(client.store().contains(&key("client:2")));
}

// == Durability ==

#[tokio::test]
async fn test_queue_survives_restart_and_replays_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let server = Arc::new(FakeServer::new());
    server.seed("/clients/1", json!({"name": "one"}), 1);
    server.seed("/clients/2", json!({"name": "two"}), 1);

    let queued_ids = {
        let before = SyncClient::builder(
            Config::default(),
            server.clone(),
            Arc::new(JsonFilePersistence::new(&path)),
        )
        .network(NetworkStatus::new(false))
        .build();
        before.store().set(key("client:1"), json!({"name": "one"}), 1);
        before.store().set(key("client:2"), json!({"name": "two"}), 1);

        before.mutate(key("client:1"), json!({"step": 1}), update_client_1());
        settle().await;
        before.mutate(
            key("client:2"),
            json!({"step": 1}),
            ServerCall::Request(ActionTemplate::update("/clients/2")),
        );
        settle().await;
        before.mutate(key("client:1"), json!({"step": 2}), update_client_1());
        settle().await;

        let ids: Vec<_> = before.queue().actions().iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), 3);
        ids
    };

    let after = SyncClient::builder(
        Config::default(),
        server.clone(),
        Arc::new(JsonFilePersistence::new(&path)),
    )
    .build();
    let restored: Vec<_> = after.queue().actions().iter().map(|a| a.id).collect();
    assert_eq!(restored, queued_ids);

    let report = after.sync_now().await;
    assert_eq!(report.completed, 3);
    let again = after.sync_now().await;
    assert_eq!(again.completed, 0);

    assert_eq!(server.write_count(), 3);
    let endpoints: Vec<_> = server
        .requests()
        .into_iter()
        .filter(|r| r.method != Method::Get)
        .map(|r| r.endpoint)
        .collect();
    assert_eq!(endpoints, vec!["/clients/1", "/clients/2", "/clients/1"]);
    assert_eq!(server.record("/clients/1").unwrap()["step"], 2);
    assert_eq!(server.record("/clients/1").unwrap()["version"], 3);
    assert_eq!(after.store().peek(&key("client:1")).unwrap().version, 3);
}

#[tokio::test]
async fn test_transient_failure_is_not_submitted_twice() {
    let server = Arc::new(FakeServer::new());
    server.seed("/clients/1", json!({"name": "A"}), 1);
    let client = offline_client(&server, &NetworkStatus::new(false));
    client.store().set(key("client:1"), json!({"name": "A"}), 1);
    let mut handle = client.mutate(key("client:1"), json!({"name": "B"}), update_client_1());
    settle().await;

    server.fail_next(SyncError::Timeout(10_000));
    assert_eq!(client.sync_now().await.retried, 1);
    assert_eq!(client.sync_now().await.completed, 1);
    handle.outcome().await.unwrap();

    let writes: Vec<_> = server
        .requests()
        .into_iter()
        .filter_map(|r| r.idempotency_key)
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], writes[1]);
    assert_eq!(server.write_count(), 1);
}

// == Ordering ==

fn field_patch() -> impl Strategy<Value = Value> {
    (prop::sample::select(vec!["a", "b", "c"]), 0i64..100)
        .prop_map(|(field, value)| json!({ field: value }))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_same_key_writes_apply_in_call_order(
        patches in prop::collection::vec(field_patch(), 1..6),
        latency_ms in 0u64..5,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let server = Arc::new(FakeServer::new());
            server.seed("/clients/1", json!({"a": -1}), 1);
            server.set_latency(Some(Duration::from_millis(latency_ms)));
            let client = offline_client(&server, &NetworkStatus::default());
            client.store().set(key("client:1"), json!({"a": -1}), 1);

            let expected = patches
                .iter()
                .fold(json!({"a": -1}), |acc, patch| shallow_merge(&acc, patch));
            let mut handles: Vec<_> = patches
                .iter()
                .map(|patch| client.mutate(key("client:1"), patch.clone(), update_client_1()))
                .collect();

            // Last local write is visible at once.
            let shown = client.store().peek(&key("client:1")).unwrap().value;
            for field in ["a", "b", "c"] {
                prop_assert_eq!(&shown.get(field), &expected.get(field));
            }

            for handle in handles.iter_mut() {
                prop_assert!(handle.outcome().await.is_ok());
            }
            let entry = client.store().peek(&key("client:1")).unwrap();
            for field in ["a", "b", "c"] {
                prop_assert_eq!(&entry.value.get(field), &expected.get(field));
            }
            prop_assert_eq!(entry.version, 1 + patches.len() as u64);
            prop_assert_eq!(entry.status, EntryStatus::Fresh);
            Ok(())
        })?;
    }
}
