//! Constituent: the leader-election role engine.
//!
//! Each agency node runs one [`Constituent`] maintaining its role
//! (Follower / Candidate / Leader), randomized election timers and the
//! per-term vote. The engine talks to peers through the [`Transport`]
//! capability handle and persists `(term, voted_for)` through the
//! [`Replicator`]; it owns no network or disk state of its own.
//!
//! [`Transport`]: crate::transport::Transport
//! [`Replicator`]: crate::replicator::Replicator

pub mod engine;
pub mod types;

pub use engine::Constituent;
pub use types::{
    ConstituentStatus, ElectionConfig, NotifyAllBody, VoteRequest, VoteResponse, NOTIFY_ALL_PATH,
    REQUEST_VOTE_PATH,
};
