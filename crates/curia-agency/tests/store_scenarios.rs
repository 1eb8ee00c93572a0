//! End-to-end scenarios for the agency store.
//!
//! These tests drive the public store surface the way the write and read
//! APIs do: transaction envelopes in, boolean vectors and response trees
//! out, with the TTL sweeper and observer notifications running for real.

use async_trait::async_trait;
use curia_agency::metrics::MetricsRegistry;
use curia_agency::replicator::{LocalReplicator, Replicator};
use curia_agency::store::Store;
use curia_agency::sweeper::{spawn_sweeper, SWEEP_CEILING};
use curia_agency::transport::{
    LoopbackNetwork, NullTransport, RequestHandler, Transport, TransportError,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

fn metrics() -> Arc<MetricsRegistry> {
    Arc::new(MetricsRegistry::new().unwrap())
}

fn plain_store() -> Arc<Store> {
    Arc::new(Store::new(Arc::new(NullTransport), metrics()))
}

#[tokio::test]
async fn test_increment_on_missing_path() {
    let store = plain_store();
    let results = store.apply(&json!([[{ "/counters/a": {"op": "increment"} }]]));
    assert_eq!(results, vec![true]);
    let (_, out) = store.read(&json!([["/counters/a"]]));
    assert_eq!(out, json!([{"counters": {"a": 1}}]));
}

#[tokio::test]
async fn test_conditional_push_applies_exactly_once() {
    let store = plain_store();
    let query = json!([[
        { "/list": {"op": "push", "new": 42} },
        { "/list": {"oldEmpty": true} }
    ]]);
    assert_eq!(store.apply(&query), vec![true]);
    assert_eq!(store.apply(&query), vec![false]);
    let (_, out) = store.read(&json!([["/list"]]));
    assert_eq!(out, json!([{"list": [42]}]));
}

#[tokio::test]
async fn test_ttl_entry_expires_through_sweeper() {
    let store = plain_store();
    let replicator: Arc<dyn Replicator> = Arc::new(LocalReplicator::new(Arc::clone(&store)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        Arc::clone(&store),
        replicator,
        SWEEP_CEILING,
        shutdown_rx,
        metrics(),
    );

    store.apply(&json!([[{ "/session/x": {"op": "set", "new": "ok", "ttl": 50} }]]));
    let (_, out) = store.read(&json!([["/session/x"]]));
    assert_eq!(out, json!([{"session": {"x": "ok"}}]));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (_, out) = store.read(&json!([["/session"]]));
    assert_eq!(out, json!([{"session": {}}]));

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
}

#[tokio::test]
async fn test_root_round_trip() {
    let store = plain_store();
    let tree = json!({"cluster": {"members": [0, 1, 2]}, "version": "0.3"});
    store.apply(&json!([[{ "op": "set", "new": tree }]]));
    let (_, out) = store.read(&json!([["/"]]));
    assert_eq!(out, json!([tree]));
}

#[tokio::test]
async fn test_idempotent_set_is_byte_identical() {
    let store = plain_store();
    let query = json!([[{ "/a": {"op": "set", "new": {"x": [1, 2]}}, "/b": 3 }]]);
    assert_eq!(store.apply(&query), vec![true]);
    let before = serde_json::to_vec(&store.dump()).unwrap();
    assert_eq!(store.apply(&query), vec![true]);
    let after = serde_json::to_vec(&store.dump()).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_concurrent_reads_do_not_disturb_writes() {
    let store = plain_store();
    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let (_, out) = store.read(&json!([["/n"]]));
                // A read observes some prefix of the increments, never
                // anything else.
                let seen = &out[0]["n"];
                assert!(seen.is_i64() || seen == &json!({}));
                tokio::task::yield_now().await;
            }
        }));
    }
    for _ in 0..100 {
        store.apply(&json!([[{ "/n": {"op": "increment"} }]]));
        tokio::task::yield_now().await;
    }
    for reader in readers {
        reader.await.unwrap();
    }
    let (_, out) = store.read(&json!([["/n"]]));
    assert_eq!(out, json!([{"n": 100}]));
}

/// Records every notification body delivered to one observer endpoint.
struct RecordingObserver {
    seen: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl RequestHandler for RecordingObserver {
    async fn handle(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        let value = serde_json::from_slice(body)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        self.seen.lock().unwrap().push((path.to_string(), value));
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_observer_fanout_carries_subtree() {
    let net = LoopbackNetwork::new();
    let observer = Arc::new(RecordingObserver { seen: Mutex::new(Vec::new()) });
    net.register("http://x", observer.clone());

    let transport: Arc<dyn Transport> = Arc::new(net.transport("http://agency"));
    let store = Arc::new(Store::new(transport, metrics()));

    assert!(store.observe("/a", "http://x/cb"));
    store.apply(&json!([[{ "/a/b/c": {"op": "set", "new": 7} }]]));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = observer.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (path, body) = &seen[0];
    assert_eq!(path, "/cb");
    assert_eq!(body, &json!({"b": {"c": 7}}));
}

#[tokio::test]
async fn test_observe_op_registers_through_transaction() {
    let net = LoopbackNetwork::new();
    let observer = Arc::new(RecordingObserver { seen: Mutex::new(Vec::new()) });
    net.register("http://x", observer.clone());

    let transport: Arc<dyn Transport> = Arc::new(net.transport("http://agency"));
    let store = Arc::new(Store::new(transport, metrics()));

    let results = store.apply(&json!([
        [{ "/watched": {"op": "observe", "url": "http://x/hook"} }],
        [{ "/watched/k": 1 }],
    ]));
    assert_eq!(results, vec![true, true]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = observer.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, json!({"k": 1}));
}

#[tokio::test]
async fn test_delete_notifies_ancestor_observer() {
    let net = LoopbackNetwork::new();
    let observer = Arc::new(RecordingObserver { seen: Mutex::new(Vec::new()) });
    net.register("http://x", observer.clone());

    let transport: Arc<dyn Transport> = Arc::new(net.transport("http://agency"));
    let store = Arc::new(Store::new(transport, metrics()));

    store.apply(&json!([[{ "/a/b": 1 }]]));
    store.observe("/a", "http://x/cb");
    store.apply(&json!([[{ "/a/b": {"op": "delete"} }]]));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = observer.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, json!({}));
}
