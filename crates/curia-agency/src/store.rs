//! The agency store.
//!
//! A hierarchical key-value tree accepting transactional writes with
//! preconditions, TTL expiry and change notifications. One process-wide
//! mutex guards the tree and the time table; a transaction batch holds it
//! for its entire duration, and effects become visible to readers only
//! after it is released. Observer notifications are dispatched strictly
//! outside the critical section.

use crate::metrics::MetricsRegistry;
use crate::node::{ApplyEffects, Node, TtlChange};
use crate::transaction::{self, classify, Condition, TxnShape};
use crate::transport::{self, Transport};
use curia_core::path;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Tree plus time table, the unit guarded by the store lock.
#[derive(Debug, Default)]
struct StoreState {
    root: Node,
    /// Expiry timestamp -> URIs of nodes with that TTL. The single sweeper
    /// priority queue; contains exactly the set of nodes with a live TTL.
    time_table: BTreeMap<SystemTime, BTreeSet<String>>,
}

impl StoreState {
    fn schedule(&mut self, when: SystemTime, uri: String) {
        self.time_table.entry(when).or_default().insert(uri);
    }

    fn cancel(&mut self, when: SystemTime, uri: &str) {
        if let Some(set) = self.time_table.get_mut(&when) {
            set.remove(uri);
            if set.is_empty() {
                self.time_table.remove(&when);
            }
        }
    }

    fn entry_count(&self) -> usize {
        self.time_table.values().map(BTreeSet::len).sum()
    }
}

/// The replicated hierarchical key-value store of one agency node.
pub struct Store {
    state: Mutex<StoreState>,
    wake: Notify,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsRegistry>,
}

impl Store {
    pub fn new(transport: Arc<dyn Transport>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { state: Mutex::new(StoreState::default()), wake: Notify::new(), transport, metrics }
    }

    /// Applies an ordered sequence of transactions, each `[ops]` or
    /// `[ops, precondition]`.
    ///
    /// Returns one boolean per transaction: `true` if applied. A failed
    /// precondition skips its transaction without aborting the batch; any
    /// other shape yields `false`. The whole batch runs under a single
    /// acquisition of the store lock, and the sweeper is woken afterwards.
    pub fn apply(&self, query: &Value) -> Vec<bool> {
        let now = SystemTime::now();
        let mut results = Vec::new();
        let mut touched = Vec::new();
        let notifications = {
            let mut st = self.state();
            let Some(entries) = query.as_array() else {
                error!("write queries to the store must be arrays");
                return results;
            };
            for entry in entries {
                let applied = match classify(entry) {
                    TxnShape::Unconditional(ops) => Self::apply_ops(&mut st, ops, now, &mut touched),
                    TxnShape::Guarded(ops, precondition) => {
                        if Self::check_locked(&st, precondition) {
                            Self::apply_ops(&mut st, ops, now, &mut touched)
                        } else {
                            debug!("precondition failed");
                            self.metrics.record_precondition_failure();
                            false
                        }
                    }
                    TxnShape::Malformed => {
                        error!("transactions must be [ops] or [ops, precondition]");
                        false
                    }
                };
                self.metrics.record_transaction(applied);
                results.push(applied);
            }
            self.metrics.set_time_table_size(st.entry_count());
            Self::collect_notifications(&st, &touched)
        };
        self.dispatch(notifications);
        self.wake.notify_one();
        results
    }

    /// Applies unconditional entries (no preconditions).
    ///
    /// This is the pipe for internally generated and replicated mutations,
    /// such as the TTL sweeper's delete batches arriving back through the
    /// leader path.
    pub fn apply_external(&self, entries: &[Value]) -> Vec<bool> {
        let now = SystemTime::now();
        let mut results = Vec::new();
        let mut touched = Vec::new();
        let notifications = {
            let mut st = self.state();
            for ops in entries {
                let applied = Self::apply_ops(&mut st, ops, now, &mut touched);
                self.metrics.record_transaction(applied);
                results.push(applied);
            }
            self.metrics.set_time_table_size(st.entry_count());
            Self::collect_notifications(&st, &touched)
        };
        self.dispatch(notifications);
        self.wake.notify_one();
        results
    }

    /// Evaluates a precondition object against the current state.
    pub fn check(&self, precondition: &Value) -> bool {
        Self::check_locked(&self.state(), precondition)
    }

    /// Executes read queries: an array of arrays of paths.
    ///
    /// For each inner array one response tree is produced containing exactly
    /// the requested subtrees; paths subsumed by an already-kept prefix are
    /// dropped and missing paths materialise as empty objects.
    pub fn read(&self, queries: &Value) -> (Vec<bool>, Value) {
        let st = self.state();
        let mut success = Vec::new();
        let mut out = Vec::new();
        let Some(list) = queries.as_array() else {
            error!("read queries to the store must be arrays");
            return (success, Value::Array(out));
        };
        for query in list {
            let (ok, tree) = Self::read_one(&st, query);
            success.push(ok);
            out.push(tree);
        }
        (success, Value::Array(out))
    }

    /// Serialises the tree and the live time table for diagnostics.
    pub fn dump(&self) -> Value {
        let st = self.state();
        let mut table = Map::new();
        for (when, uris) in &st.time_table {
            let ms = when.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
            table.insert(ms.to_string(), json!(uris.iter().collect::<Vec<_>>()));
        }
        json!({ "store": st.root.to_value(), "time_table": Value::Object(table) })
    }

    /// Registers an observer URI at a path, creating the node if needed.
    /// Returns whether the observer was newly added.
    pub fn observe(&self, path_str: &str, url: &str) -> bool {
        let mut st = self.state();
        let segments = path::split(path_str);
        st.root.lookup_mut_or_create(&segments).add_observer(url)
    }

    /// Deregisters an observer URI. Returns whether it was present.
    pub fn unobserve(&self, path_str: &str, url: &str) -> bool {
        let mut st = self.state();
        let segments = path::split(path_str);
        match st.root.lookup_mut(&segments) {
            Some(node) => node.remove_observer(url),
            None => false,
        }
    }

    /// Earliest expiry in the time table, if any.
    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.state().time_table.keys().next().copied()
    }

    /// Builds the batch of `delete` transactions for every entry expired at
    /// `now`, in expiry order. Entries are left in the table: they disappear
    /// when the deletions are applied, so a failed submission is retried on
    /// the next sweeper cycle.
    pub fn expired_deletes(&self, now: SystemTime) -> Option<Value> {
        let st = self.state();
        let mut txns = Vec::new();
        for (when, uris) in &st.time_table {
            if *when > now {
                break;
            }
            for uri in uris {
                txns.push(transaction::delete_txn(uri));
            }
        }
        if txns.is_empty() {
            None
        } else {
            Some(Value::Array(txns))
        }
    }

    /// Wake handle signalled by writers, awaited by the sweeper.
    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_ops(
        st: &mut StoreState,
        ops: &Value,
        now: SystemTime,
        touched: &mut Vec<String>,
    ) -> bool {
        let mut effects = ApplyEffects::default();
        let ok = st.root.apply(ops, "/", now, &mut effects);
        let ApplyEffects { ttl, touched: uris } = effects;
        for change in ttl {
            match change {
                TtlChange::Schedule { when, uri } => st.schedule(when, uri),
                TtlChange::Cancel { when, uri } => st.cancel(when, &uri),
            }
        }
        touched.extend(uris);
        ok
    }

    fn check_locked(st: &StoreState, precondition: &Value) -> bool {
        let Some(conditions) = precondition.as_object() else {
            warn!("cannot check precondition: not an object");
            return false;
        };
        let mut holds = true;
        for (path_str, condition) in conditions {
            let segments = path::split(path_str);
            let node = st.root.lookup(&segments);
            match Condition::parse(condition) {
                Err(e) => {
                    error!(path = %path_str, "{e}");
                    holds = false;
                }
                Ok(Condition::Exact(literal)) => {
                    if node.map(Node::to_value).as_ref() != Some(&literal) {
                        holds = false;
                    }
                }
                Ok(Condition::Predicates { old, is_array, old_empty }) => {
                    if let Some(expected) = old {
                        if node.map(Node::to_value).as_ref() != Some(&expected) {
                            holds = false;
                        }
                    }
                    if let Some(required) = is_array {
                        let is_arr = node
                            .map(|n| n.is_leaf() && n.value().is_some_and(Value::is_array))
                            .unwrap_or(false);
                        if is_arr != required {
                            holds = false;
                        }
                    }
                    if let Some(required) = old_empty {
                        if node.is_none() != required {
                            holds = false;
                        }
                    }
                }
            }
        }
        holds
    }

    fn read_one(st: &StoreState, query: &Value) -> (bool, Value) {
        let Some(paths) = query.as_array() else {
            return (false, Value::Object(Map::new()));
        };
        let mut ok = true;
        let mut raw: Vec<&str> = Vec::new();
        for p in paths {
            match p.as_str() {
                Some(s) => raw.push(s),
                None => ok = false,
            }
        }
        raw.sort_unstable();

        // Keep a path only if no already-kept path covers it segment-wise.
        let mut kept: Vec<Vec<String>> = Vec::new();
        for s in raw {
            let segments = path::split(s);
            if !kept.iter().any(|k| path::covers(k, &segments)) {
                kept.push(segments);
            }
        }

        let mut tree = Value::Object(Map::new());
        for segments in kept {
            let sub = st
                .root
                .lookup(&segments)
                .map(Node::to_value)
                .unwrap_or_else(|| Value::Object(Map::new()));
            insert_at(&mut tree, &segments, sub);
        }
        (ok, tree)
    }

    /// Collects `(observer URL, subtree body)` pairs for every mutated URI:
    /// each node on the path from the root to the target (inclusive) that
    /// carries observers produces one notification.
    fn collect_notifications(st: &StoreState, touched: &[String]) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        for uri in touched {
            let segments = path::split(uri);
            let mut node = &st.root;
            push_observed(node, &mut out);
            for seg in &segments {
                match node.child(seg) {
                    Some(child) => {
                        node = child;
                        push_observed(node, &mut out);
                    }
                    None => break,
                }
            }
        }
        out
    }

    /// Fire-and-forget delivery of observer notifications, off the lock.
    fn dispatch(&self, notifications: Vec<(String, Value)>) {
        for (url, body) in notifications {
            let Some((endpoint, path)) = transport::split_url(&url) else {
                warn!(url, "invalid observer URI");
                continue;
            };
            let transport = Arc::clone(&self.transport);
            let bytes = serde_json::to_vec(&body).unwrap_or_default();
            tokio::spawn(async move {
                transport.notify(&endpoint, &path, bytes).await;
            });
        }
    }
}

fn push_observed(node: &Node, out: &mut Vec<(String, Value)>) {
    if node.observers().is_empty() {
        return;
    }
    let body = node.to_value();
    for url in node.observers() {
        out.push((url.clone(), body.clone()));
    }
}

/// Grafts `sub` into `tree` at `segments`, creating objects along the way.
fn insert_at(tree: &mut Value, segments: &[String], sub: Value) {
    if segments.is_empty() {
        *tree = sub;
        return;
    }
    if !matches!(tree, Value::Object(_)) {
        *tree = Value::Object(Map::new());
    }
    if let Value::Object(map) = tree {
        let entry =
            map.entry(segments[0].clone()).or_insert_with(|| Value::Object(Map::new()));
        insert_at(entry, &segments[1..], sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;

    fn store() -> Store {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        Store::new(Arc::new(NullTransport), metrics)
    }

    #[test]
    fn test_apply_batch_in_order() {
        let s = store();
        let results = s.apply(&json!([
            [{ "/a": {"op": "set", "new": 1} }],
            [{ "/a": {"op": "increment"} }],
        ]));
        assert_eq!(results, vec![true, true]);
        let (_, out) = s.read(&json!([["/a"]]));
        assert_eq!(out, json!([{"a": 2}]));
    }

    #[test]
    fn test_malformed_shapes_are_false() {
        let s = store();
        let results = s.apply(&json!([
            [],
            [{ "/a": 1 }, {}, {}],
            "not an array",
            [{ "/b": 2 }],
        ]));
        assert_eq!(results, vec![false, false, false, true]);
    }

    #[test]
    fn test_conditional_push_applies_once() {
        let s = store();
        let query = json!([[
            { "/list": {"op": "push", "new": 42} },
            { "/list": {"oldEmpty": true} }
        ]]);
        assert_eq!(s.apply(&query), vec![true]);
        assert_eq!(s.apply(&query), vec![false]);
        let (_, out) = s.read(&json!([["/list"]]));
        assert_eq!(out, json!([{"list": [42]}]));
    }

    #[test]
    fn test_precondition_all_keys_must_hold() {
        let s = store();
        s.apply(&json!([[{ "/a": 1, "/b": 2 }]]));
        // Second key fails, so the whole precondition fails.
        let results = s.apply(&json!([[
            { "/c": 3 },
            { "/a": 1, "/b": {"old": 99} }
        ]]));
        assert_eq!(results, vec![false]);
        let (_, out) = s.read(&json!([["/c"]]));
        assert_eq!(out, json!([{"c": {}}]));
    }

    #[test]
    fn test_precondition_literal_and_predicates() {
        let s = store();
        s.apply(&json!([[{ "/v": 7, "/arr": [1] }]]));
        assert!(s.check(&json!({"/v": 7})));
        assert!(!s.check(&json!({"/v": 8})));
        assert!(s.check(&json!({"/arr": {"isArray": true}})));
        assert!(s.check(&json!({"/v": {"isArray": false}})));
        assert!(s.check(&json!({"/missing": {"oldEmpty": true}})));
        assert!(!s.check(&json!({"/v": {"oldEmpty": true}})));
        assert!(s.check(&json!({"/v": {"old": 7}})));
    }

    #[test]
    fn test_non_boolean_predicate_fails_precondition() {
        let s = store();
        assert!(!s.check(&json!({"/x": {"isArray": "yes"}})));
    }

    #[test]
    fn test_read_missing_path_materialises_empty_object() {
        let s = store();
        let (success, out) = s.read(&json!([["/nothing/here"]]));
        assert_eq!(success, vec![true]);
        assert_eq!(out, json!([{"nothing": {"here": {}}}]));
    }

    #[test]
    fn test_read_subsumption_is_segment_wise() {
        let s = store();
        s.apply(&json!([[{ "/a/b": 1, "/ab": 2 }]]));
        let (_, out) = s.read(&json!([["/a", "/a/b", "/ab"]]));
        // "/a/b" is covered by "/a"; "/ab" is not.
        assert_eq!(out, json!([{"a": {"b": 1}, "ab": 2}]));
    }

    #[test]
    fn test_read_multiple_query_lists() {
        let s = store();
        s.apply(&json!([[{ "/x": 1, "/y": 2 }]]));
        let (success, out) = s.read(&json!([["/x"], ["/y"]]));
        assert_eq!(success, vec![true, true]);
        assert_eq!(out, json!([{"x": 1}, {"y": 2}]));
    }

    #[test]
    fn test_root_round_trip() {
        let s = store();
        let tree = json!({"a": {"b": [1, 2]}, "c": "leaf"});
        s.apply(&json!([[{ "op": "set", "new": tree }]]));
        let (_, out) = s.read(&json!([["/"]]));
        assert_eq!(out, json!([tree]));
    }

    #[test]
    fn test_idempotent_set() {
        let s = store();
        let query = json!([[{ "/a/b": {"op": "set", "new": {"k": 1}} }]]);
        assert_eq!(s.apply(&query), vec![true]);
        let before = s.dump();
        assert_eq!(s.apply(&query), vec![true]);
        assert_eq!(s.dump(), before);
    }

    #[test]
    fn test_time_table_tracks_live_ttls() {
        let s = store();
        s.apply(&json!([[{ "/session/x": {"op": "set", "new": "ok", "ttl": 60_000} }]]));
        assert!(s.next_deadline().is_some());
        {
            let st = s.state();
            assert_eq!(st.entry_count(), 1);
            let uris = st.time_table.values().next().unwrap();
            assert!(uris.contains("/session/x"));
        }
        // Overwriting without a TTL clears the entry.
        s.apply(&json!([[{ "/session/x": {"op": "set", "new": "ok"} }]]));
        assert!(s.next_deadline().is_none());
    }

    #[test]
    fn test_expired_deletes_leave_table_untouched() {
        let s = store();
        s.apply(&json!([[{ "/tmp/a": {"op": "set", "new": 1, "ttl": 0} }]]));
        let later = SystemTime::now() + std::time::Duration::from_millis(10);
        let batch = s.expired_deletes(later).unwrap();
        assert_eq!(batch, json!([[{ "/tmp/a": {"op": "delete"} }]]));
        // Still scheduled: only applying the delete clears it.
        assert!(s.next_deadline().is_some());
        s.apply(&batch);
        assert!(s.next_deadline().is_none());
        let (_, out) = s.read(&json!([["/tmp"]]));
        assert_eq!(out, json!([{"tmp": {}}]));
    }

    #[test]
    fn test_apply_external_is_unconditional() {
        let s = store();
        let results = s.apply_external(&[json!({ "/a": {"op": "increment"} })]);
        assert_eq!(results, vec![true]);
        let (_, out) = s.read(&json!([["/a"]]));
        assert_eq!(out, json!([{"a": 1}]));
    }

    #[test]
    fn test_observe_and_unobserve() {
        let s = store();
        assert!(s.observe("/a", "http://x/cb"));
        assert!(!s.observe("/a", "http://x/cb"));
        assert!(s.unobserve("/a", "http://x/cb"));
        assert!(!s.unobserve("/a", "http://x/cb"));
        assert!(!s.unobserve("/missing", "http://x/cb"));
    }

    #[test]
    fn test_dump_contains_tree_and_table() {
        let s = store();
        s.apply(&json!([[{ "/k": {"op": "set", "new": 5, "ttl": 60_000} }]]));
        let dump = s.dump();
        assert_eq!(dump["store"], json!({"k": 5}));
        assert_eq!(dump["time_table"].as_object().unwrap().len(), 1);
    }
}
