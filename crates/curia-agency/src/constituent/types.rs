//! Wire and configuration types for the constituent.

use curia_core::{AgentId, LogIndex, Role, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Path of the vote solicitation endpoint.
pub const REQUEST_VOTE_PATH: &str = "/_api/agency_priv/requestVote";
/// Path of the endpoint-gossip endpoint.
pub const NOTIFY_ALL_PATH: &str = "/_api/agency_priv/notifyAll";

/// Election configuration for one agency node.
///
/// `endpoints` is indexed by agent id; this node's own entry is skipped when
/// broadcasting. The election timer sleeps uniformly in
/// `[min_ping, max_ping]`, and each vote RPC carries a `min_ping` deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// This node's id, an index into `endpoints`.
    pub id: AgentId,
    /// Peer endpoints (`http://host:port`), indexed by agent id.
    pub endpoints: Vec<String>,
    /// Lower bound of the follower election timer.
    pub min_ping: Duration,
    /// Upper bound of the follower election timer.
    pub max_ping: Duration,
    /// Gossip the endpoint list to peers on startup.
    pub notify_peers: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            id: AgentId::new(0),
            endpoints: vec![String::new()],
            min_ping: Duration::from_millis(150),
            max_ping: Duration::from_millis(300),
            notify_peers: false,
        }
    }
}

impl ElectionConfig {
    /// Creates a single-node configuration: the node is a permanent leader.
    pub fn single_node(id: AgentId, endpoint: impl Into<String>) -> Self {
        Self { id, endpoints: vec![endpoint.into()], ..Default::default() }
    }

    /// Creates a multi-node configuration.
    pub fn cluster(id: AgentId, endpoints: Vec<String>) -> Self {
        Self { id, endpoints, ..Default::default() }
    }

    /// Number of configured agency members.
    pub fn size(&self) -> usize {
        self.endpoints.len()
    }
}

/// A vote solicitation, carried as query parameters on a GET request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: AgentId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
}

impl VoteRequest {
    /// Renders the request as the endpoint path with query string.
    pub fn to_path(&self) -> String {
        format!(
            "{REQUEST_VOTE_PATH}?term={}&candidateId={}&prevLogIndex={}&prevLogTerm={}",
            self.term, self.candidate_id, self.prev_log_index, self.prev_log_term
        )
    }

    /// Parses the request back out of query parameters.
    pub fn from_params(params: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            term: params.get("term")?.parse().ok()?,
            candidate_id: AgentId::new(params.get("candidateId")?.parse().ok()?),
            prev_log_index: params.get("prevLogIndex")?.parse().ok()?,
            prev_log_term: params.get("prevLogTerm")?.parse().ok()?,
        })
    }
}

/// Answer to a vote solicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    #[serde(rename = "voteGranted")]
    pub vote_granted: bool,
}

/// Endpoint-gossip payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyAllBody {
    pub endpoints: Vec<String>,
}

/// Snapshot of the constituent's externally visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstituentStatus {
    pub id: AgentId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<AgentId>,
    pub size: usize,
}
