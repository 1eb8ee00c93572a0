//! Transaction envelope, mutation operators and preconditions.
//!
//! A write query is an ordered sequence of transactions. Each transaction is
//! a JSON array of either `[ops]` or `[ops, precondition]`:
//!
//! - `ops` is an object whose keys are paths (absolute or relative) and whose
//!   values are either operator objects, nested objects, or plain values.
//! - `precondition` is an object whose keys are paths and whose values are
//!   either a literal (structural equality) or a predicate object.
//!
//! Operator objects are dispatched through the [`Op`] tagged variant; the
//! string-keyed wire form is parsed exactly once per op object.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Errors raised while parsing an operator object.
///
/// These are structural failures: the transaction carrying the op fails and
/// its entry in the result vector is `false`; the batch continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpError {
    #[error("unknown operation '{0}'")]
    UnknownOp(String),
    #[error("operator '{0}' requires a 'new' value")]
    MissingNew(&'static str),
    #[error("operator '{0}' requires a 'url' value")]
    MissingUrl(&'static str),
    #[error("'ttl' must be an integer number of milliseconds")]
    MalformedTtl,
    #[error("'op' must be a string")]
    NonStringOp,
}

/// A single mutation primitive, applied at a target node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Replace the target subtree with `new`, optionally scheduling expiry
    /// `ttl_ms` milliseconds from now.
    Set { new: Value, ttl_ms: Option<u64> },
    /// Remove the target node from its parent, cascading children and TTLs.
    Delete,
    /// Integer value +1; absent or non-integer initialises to 1.
    Increment,
    /// Integer value -1; absent or non-integer initialises to -1.
    Decrement,
    /// Append `new`; a non-array target is replaced by a one-element array.
    Push(Value),
    /// Remove the last array element. No-op on missing or empty arrays.
    Pop,
    /// Insert `new` at position 0; a non-array target is replaced by `[new]`.
    Prepend(Value),
    /// Remove the first array element. No-op on missing or empty arrays.
    Shift,
    /// Register an observer URI at the target node.
    Observe(String),
    /// Deregister an observer URI at the target node.
    Unobserve(String),
}

impl Op {
    /// Parses an operator object.
    ///
    /// Returns `Ok(None)` if the object is not an operator object at all
    /// (no `op` and no `new` key), in which case the caller recurses into
    /// its keys. An object with `new` but without `op` is a plain `set`.
    pub fn from_object(obj: &Map<String, Value>) -> Result<Option<Op>, OpError> {
        let Some(op) = obj.get("op") else {
            if let Some(new) = obj.get("new") {
                return Ok(Some(Op::Set { new: new.clone(), ttl_ms: None }));
            }
            return Ok(None);
        };
        let Some(name) = op.as_str() else {
            return Err(OpError::NonStringOp);
        };
        let op = match name {
            "set" => Op::Set {
                new: obj.get("new").cloned().ok_or(OpError::MissingNew("set"))?,
                ttl_ms: parse_ttl(obj.get("ttl"))?,
            },
            "delete" => Op::Delete,
            "increment" => Op::Increment,
            "decrement" => Op::Decrement,
            "push" => Op::Push(obj.get("new").cloned().ok_or(OpError::MissingNew("push"))?),
            "pop" => Op::Pop,
            "prepend" => {
                Op::Prepend(obj.get("new").cloned().ok_or(OpError::MissingNew("prepend"))?)
            }
            "shift" => Op::Shift,
            "observe" => Op::Observe(parse_url(obj, "observe")?),
            "unobserve" => Op::Unobserve(parse_url(obj, "unobserve")?),
            other => return Err(OpError::UnknownOp(other.to_string())),
        };
        Ok(Some(op))
    }
}

/// TTLs are integer milliseconds; a floating-point or negative `ttl` is
/// malformed and fails the op.
fn parse_ttl(ttl: Option<&Value>) -> Result<Option<u64>, OpError> {
    match ttl {
        None => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or(OpError::MalformedTtl),
    }
}

fn parse_url(obj: &Map<String, Value>, op: &'static str) -> Result<String, OpError> {
    obj.get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(OpError::MissingUrl(op))
}

// =============================================================================
// Transaction envelope
// =============================================================================

/// The shape of one entry of a write query.
#[derive(Debug, Clone, Copy)]
pub enum TxnShape<'a> {
    /// `[ops]`
    Unconditional(&'a Value),
    /// `[ops, precondition]`
    Guarded(&'a Value, &'a Value),
    /// Anything else: length 0 or >= 3, or not an array.
    Malformed,
}

/// Classifies one transaction entry of an envelope.
pub fn classify(entry: &Value) -> TxnShape<'_> {
    match entry.as_array().map(Vec::as_slice) {
        Some([ops]) => TxnShape::Unconditional(ops),
        Some([ops, precondition]) => TxnShape::Guarded(ops, precondition),
        _ => TxnShape::Malformed,
    }
}

/// Builds the unconditional single-op `delete` transaction for a URI.
///
/// The TTL sweeper submits batches of these through the replicator so that
/// expiry produces the same replicated effects as an explicit delete.
pub fn delete_txn(uri: &str) -> Value {
    let mut op = Map::new();
    op.insert("op".to_string(), Value::String("delete".to_string()));
    let mut ops = Map::new();
    ops.insert(uri.to_string(), Value::Object(op));
    Value::Array(vec![Value::Object(ops)])
}

// =============================================================================
// Preconditions
// =============================================================================

/// A parsed precondition for one path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Structural equality against the node's serialisation.
    Exact(Value),
    /// Predicate object. All present predicates must hold.
    Predicates {
        /// Value equality.
        old: Option<Value>,
        /// Require the node to be a leaf holding an array (or the negation).
        is_array: Option<bool>,
        /// Require the path to be absent (or the negation).
        old_empty: Option<bool>,
    },
}

/// A predicate carried a non-boolean operand. The precondition fails and a
/// fatal diagnostic is logged at the evaluation site.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("non-boolean expression for '{0}' precondition")]
pub struct NonBooleanPredicate(pub &'static str);

impl Condition {
    /// Parses the condition value attached to a precondition path.
    pub fn parse(value: &Value) -> Result<Condition, NonBooleanPredicate> {
        let Some(obj) = value.as_object() else {
            return Ok(Condition::Exact(value.clone()));
        };
        let mut old = None;
        let mut is_array = None;
        let mut old_empty = None;
        for (key, v) in obj {
            match key.as_str() {
                "old" => old = Some(v.clone()),
                "isArray" => {
                    is_array = Some(v.as_bool().ok_or(NonBooleanPredicate("isArray"))?);
                }
                "oldEmpty" => {
                    old_empty = Some(v.as_bool().ok_or(NonBooleanPredicate("oldEmpty"))?);
                }
                other => {
                    warn!(predicate = other, "ignoring unknown precondition predicate");
                }
            }
        }
        Ok(Condition::Predicates { old, is_array, old_empty })
    }
}
