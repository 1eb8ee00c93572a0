//! The store tree.
//!
//! A [`Node`] is either a LEAF (holds a JSON value) or INTERNAL (holds an
//! ordered children map); a node whose children map is empty is a leaf, and
//! adding a child promotes it. There are no parent pointers: every operation
//! is path-addressed from the root and a node's URI is the path used to
//! reach it, so ownership stays a plain tree.
//!
//! Mutations do not touch the time table directly. They record TTL
//! scheduling/cancellation and the set of touched URIs in [`ApplyEffects`];
//! the store folds those into its time table and observer dispatch while
//! still holding the store lock.

use crate::transaction::Op;
use curia_core::path;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Whether a node currently holds a value or children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

/// Side effects of applying a mutation payload, replayed onto the store's
/// time table and observer queue by the caller.
#[derive(Debug, Default)]
pub struct ApplyEffects {
    /// Time-table changes in application order.
    pub ttl: Vec<TtlChange>,
    /// URIs of nodes mutated by successful ops, in application order.
    pub touched: Vec<String>,
}

/// One time-table change. Cancellations name the exact `(expiry, uri)` pair
/// so only the entry of the node being cleared is erased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtlChange {
    Schedule { when: SystemTime, uri: String },
    Cancel { when: SystemTime, uri: String },
}

impl ApplyEffects {
    fn schedule(&mut self, when: SystemTime, uri: &str) {
        self.ttl.push(TtlChange::Schedule { when, uri: uri.to_string() });
    }

    fn cancel(&mut self, when: SystemTime, uri: &str) {
        self.ttl.push(TtlChange::Cancel { when, uri: uri.to_string() });
    }

    fn touch(&mut self, uri: &str) {
        self.touched.push(uri.to_string());
    }
}

/// A vertex of the store tree.
#[derive(Debug, Default, Clone)]
pub struct Node {
    value: Option<Value>,
    children: BTreeMap<String, Node>,
    ttl: Option<SystemTime>,
    observers: BTreeSet<String>,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> NodeKind {
        if self.children.is_empty() {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind() == NodeKind::Leaf
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn ttl(&self) -> Option<SystemTime> {
        self.ttl
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub(crate) fn observers(&self) -> &BTreeSet<String> {
        &self.observers
    }

    pub(crate) fn add_observer(&mut self, url: &str) -> bool {
        self.observers.insert(url.to_string())
    }

    pub(crate) fn remove_observer(&mut self, url: &str) -> bool {
        self.observers.remove(url)
    }

    /// Read-only descent. `None` if any segment is missing.
    pub fn lookup(&self, segments: &[String]) -> Option<&Node> {
        let mut cur = self;
        for seg in segments {
            cur = cur.children.get(seg)?;
        }
        Some(cur)
    }

    /// Mutable descent without creation. `None` if any segment is missing.
    pub fn lookup_mut(&mut self, segments: &[String]) -> Option<&mut Node> {
        let mut cur = self;
        for seg in segments {
            cur = cur.children.get_mut(seg)?;
        }
        Some(cur)
    }

    /// Mutating descent, creating intermediate internal nodes on the way.
    pub fn lookup_mut_or_create(&mut self, segments: &[String]) -> &mut Node {
        let mut cur = self;
        for seg in segments {
            cur = cur.children.entry(seg.clone()).or_default();
        }
        cur
    }

    /// Serialises the subtree rooted here.
    ///
    /// Internal nodes become objects of their children; leaves yield their
    /// value, or an empty object when they hold none (this is also how
    /// missing paths materialise in read responses).
    pub fn to_value(&self) -> Value {
        if self.children.is_empty() {
            self.value.clone().unwrap_or_else(|| Value::Object(Map::new()))
        } else {
            let mut map = Map::new();
            for (name, child) in &self.children {
                map.insert(name.clone(), child.to_value());
            }
            Value::Object(map)
        }
    }

    /// Applies a mutation payload at this node.
    ///
    /// An operator object executes here; an object without `op`/`new`
    /// recurses into its keys (keys containing `/` are relative sub-paths,
    /// bare keys name direct children created on demand); any other value is
    /// assigned verbatim. Returns `false` on any structural failure, after
    /// applying whatever preceded it.
    pub fn apply(
        &mut self,
        payload: &Value,
        uri: &str,
        now: SystemTime,
        effects: &mut ApplyEffects,
    ) -> bool {
        let Some(map) = payload.as_object() else {
            self.assign(payload.clone(), uri, effects);
            return true;
        };
        match Op::from_object(map) {
            Err(e) => {
                warn!(uri, error = %e, "malformed operation");
                false
            }
            Ok(Some(op)) => self.exec_op(op, uri, now, effects),
            Ok(None) => {
                let mut ok = true;
                for (key, value) in map {
                    if !self.apply_key(key, value, uri, now, effects) {
                        ok = false;
                    }
                }
                ok
            }
        }
    }

    /// Applies `payload` under one key of a recursion object.
    fn apply_key(
        &mut self,
        key: &str,
        payload: &Value,
        uri: &str,
        now: SystemTime,
        effects: &mut ApplyEffects,
    ) -> bool {
        let segments = if key.contains('/') {
            path::split(key)
        } else {
            vec![key.to_string()]
        };
        if segments.is_empty() {
            // A bare "/" key addresses this node itself.
            return self.apply(payload, uri, now, effects);
        }

        // Descend to the parent of the final segment, creating intermediates.
        let mut cur = self;
        let mut cur_uri = uri.to_string();
        for seg in &segments[..segments.len() - 1] {
            cur_uri = path::join(&cur_uri, seg);
            cur = cur.children.entry(seg.clone()).or_default();
        }
        let last = &segments[segments.len() - 1];
        let target_uri = path::join(&cur_uri, last);

        // `delete` executes at the parent; absent targets are a no-op.
        if is_delete_op(payload) {
            cur.remove_child(last, &target_uri, effects);
            return true;
        }
        let child = cur.children.entry(last.clone()).or_default();
        child.apply(payload, &target_uri, now, effects)
    }

    /// Executes a parsed operator at this node. `Delete` only lands here when
    /// addressed at the root, where it clears the whole tree.
    fn exec_op(&mut self, op: Op, uri: &str, now: SystemTime, effects: &mut ApplyEffects) -> bool {
        match op {
            Op::Set { new, ttl_ms } => {
                self.assign(new, uri, effects);
                if let Some(ms) = ttl_ms {
                    let when = now + Duration::from_millis(ms);
                    self.ttl = Some(when);
                    effects.schedule(when, uri);
                }
                true
            }
            Op::Delete => {
                self.collect_ttl_cancellations(uri, effects);
                self.children.clear();
                self.value = None;
                self.ttl = None;
                effects.touch(uri);
                true
            }
            Op::Increment => {
                let next = self.leaf_i64().map_or(1, |v| v + 1);
                self.assign(json!(next), uri, effects);
                true
            }
            Op::Decrement => {
                let next = self.leaf_i64().map_or(-1, |v| v - 1);
                self.assign(json!(next), uri, effects);
                true
            }
            Op::Push(new) => {
                let mut arr = self.leaf_array().unwrap_or_default();
                arr.push(new);
                self.assign(Value::Array(arr), uri, effects);
                true
            }
            Op::Pop => {
                if let Some(mut arr) = self.leaf_array() {
                    if !arr.is_empty() {
                        arr.pop();
                        self.assign(Value::Array(arr), uri, effects);
                    }
                }
                true
            }
            Op::Prepend(new) => {
                let mut arr = self.leaf_array().unwrap_or_default();
                arr.insert(0, new);
                self.assign(Value::Array(arr), uri, effects);
                true
            }
            Op::Shift => {
                if let Some(mut arr) = self.leaf_array() {
                    if !arr.is_empty() {
                        arr.remove(0);
                        self.assign(Value::Array(arr), uri, effects);
                    }
                }
                true
            }
            Op::Observe(url) => {
                self.observers.insert(url);
                true
            }
            Op::Unobserve(url) => {
                self.observers.remove(&url);
                true
            }
        }
    }

    /// Replaces this subtree with `value`: cancels every TTL below, drops the
    /// children and the node's own TTL, and records the mutation.
    fn assign(&mut self, value: Value, uri: &str, effects: &mut ApplyEffects) {
        self.collect_ttl_cancellations(uri, effects);
        self.ttl = None;
        self.children.clear();
        self.value = Some(value);
        effects.touch(uri);
    }

    /// Removes a direct child, cascading TTL cancellations through the
    /// detached subtree. Returns whether the child existed.
    pub(crate) fn remove_child(
        &mut self,
        name: &str,
        child_uri: &str,
        effects: &mut ApplyEffects,
    ) -> bool {
        match self.children.remove(name) {
            Some(sub) => {
                sub.collect_ttl_cancellations(child_uri, effects);
                effects.touch(child_uri);
                true
            }
            None => false,
        }
    }

    fn collect_ttl_cancellations(&self, uri: &str, effects: &mut ApplyEffects) {
        if let Some(when) = self.ttl {
            effects.cancel(when, uri);
        }
        for (name, child) in &self.children {
            child.collect_ttl_cancellations(&path::join(uri, name), effects);
        }
    }

    fn leaf_i64(&self) -> Option<i64> {
        if !self.children.is_empty() {
            return None;
        }
        self.value.as_ref().and_then(Value::as_i64)
    }

    fn leaf_array(&self) -> Option<Vec<Value>> {
        if !self.children.is_empty() {
            return None;
        }
        self.value.as_ref().and_then(Value::as_array).cloned()
    }
}

fn is_delete_op(payload: &Value) -> bool {
    payload
        .as_object()
        .and_then(|o| o.get("op"))
        .and_then(Value::as_str)
        == Some("delete")
}
