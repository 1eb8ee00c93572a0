//! # Curia Agency
//!
//! The systems core of CuriaDB: a replicated hierarchical key-value store
//! (the agency store) and a Raft-style leader-election role engine (the
//! constituent). Together they form the control plane every cluster node
//! consults for membership, configuration and supervisory scheduling.
//!
//! The two components are independent workers coordinated through two
//! capability handles: a [`transport::Transport`] for peer requests and a
//! [`replicator::Replicator`] for durable election state and the leader
//! write path.

pub mod config;
pub mod constituent;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod replicator;
pub mod store;
pub mod sweeper;
pub mod transaction;
pub mod transport;

// Re-exports
pub use config::CuriaConfig;
pub use constituent::{Constituent, ElectionConfig, VoteRequest, VoteResponse};
pub use metrics::MetricsRegistry;
pub use node::{Node, NodeKind};
pub use replicator::{ElectionLedger, ElectionRecord, LocalReplicator, Replicator};
pub use store::Store;
pub use sweeper::{spawn_sweeper, SWEEP_CEILING};
pub use transport::{HttpTransport, LoopbackNetwork, Transport};
