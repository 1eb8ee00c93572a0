//! # Curia Core
//!
//! Core types for CuriaDB, the distributed coordination service.
//!
//! This crate provides the fundamental building blocks shared by the agency
//! store and the constituent role engine:
//! - [`AgentId`] - Type-safe agent identifier
//! - [`Term`] / [`LogIndex`] - Consensus epoch and log position
//! - [`LogInfo`] - Position of the last replicated log entry
//! - [`Role`] - Follower / Candidate / Leader
//! - [`path`] - Path algebra for the hierarchical store

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Identifiers (Newtypes for type safety)
// =============================================================================

/// A unique identifier for an agent (one node of the agency).
///
/// Uses a newtype pattern to prevent mixing up agent ids with terms, indices
/// and other integer types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AgentId(pub u64);

impl AgentId {
    /// Creates a new AgentId from a u64.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the id as a usize for indexing vote tallies.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AgentId {
    #[inline]
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<usize> for AgentId {
    #[inline]
    fn from(id: usize) -> Self {
        Self(id as u64)
    }
}

/// A consensus epoch, advanced on each election. Monotonic per node.
pub type Term = u64;

/// A position in the replicated log.
pub type LogIndex = u64;

/// Position and term of the last entry in the replicated log.
///
/// Carried in vote requests so peers can judge log freshness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    pub index: LogIndex,
    pub term: Term,
}

impl LogInfo {
    pub const fn new(index: LogIndex, term: Term) -> Self {
        Self { index, term }
    }
}

// =============================================================================
// Roles
// =============================================================================

/// The role of a node in the agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    /// Returns the lowercase wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Path algebra
// =============================================================================

pub mod path {
    //! Path algebra for the hierarchical store.
    //!
    //! Paths are `/`-separated: `/seg1/seg2`. Splitting ignores an empty
    //! leading segment and an empty trailing segment, so `/a/b`, `a/b` and
    //! `/a/b/` all name the same node.

    /// Splits a path into its segments.
    ///
    /// Interior empty segments (`/a//b`) are preserved verbatim so malformed
    /// paths stay distinguishable from their collapsed forms.
    pub fn split(path: &str) -> Vec<String> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Vec::new();
        }
        trimmed.split('/').map(str::to_string).collect()
    }

    /// Canonical form of a path: leading `/`, no trailing `/`.
    ///
    /// The root is `/`.
    pub fn normalize(path: &str) -> String {
        let segments = split(path);
        if segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", segments.join("/"))
        }
    }

    /// Appends a segment to a base URI.
    pub fn join(base: &str, segment: &str) -> String {
        if base == "/" || base.is_empty() {
            format!("/{segment}")
        } else {
            format!("{base}/{segment}")
        }
    }

    /// Whether `prefix` names an ancestor-or-self of `path`, segment-wise.
    ///
    /// `/a` covers `/a` and `/a/b`, but not `/ab`.
    pub fn covers(prefix: &[String], path: &[String]) -> bool {
        prefix.len() <= path.len() && prefix.iter().zip(path.iter()).all(|(a, b)| a == b)
    }
}
