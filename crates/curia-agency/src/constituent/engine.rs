//! The election state machine.
//!
//! One constituent per process. A follower sleeps for a random interval in
//! `[min_ping, max_ping]`; if the window passes without a vote being cast it
//! stands for election. Candidates raise the term, vote for themselves and
//! solicit votes from every peer; a strict majority makes them leader. The
//! leader re-runs the solicitation at its unchanged term, and peers
//! re-affirm it through the idempotent same-term grant rule, which doubles
//! as the heartbeat path. Any response carrying a higher term demotes
//! immediately.
//!
//! Every term write is persisted through the replicator before the engine
//! proceeds; a persist failure is logged and the in-memory transition still
//! happens.

use super::types::{
    ConstituentStatus, ElectionConfig, NotifyAllBody, VoteRequest, VoteResponse, NOTIFY_ALL_PATH,
};
use crate::metrics::MetricsRegistry;
use crate::replicator::Replicator;
use crate::transport::{RequestMethod, Transport};
use curia_core::{AgentId, Role, Term};
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Mutable role-engine state, guarded by its own mutex (distinct from the
/// store lock).
#[derive(Debug)]
struct RoleState {
    term: Term,
    role: Role,
    voted_for: Option<AgentId>,
    leader_id: Option<AgentId>,
    /// Per-peer tally, meaningful only while soliciting.
    votes: Vec<bool>,
    /// Whether a vote was granted or answered during the current window.
    cast: bool,
}

/// The role engine of one agency node.
pub struct Constituent {
    config: ElectionConfig,
    /// Peer endpoints, updated by `notifyAll` gossip.
    endpoints: RwLock<Vec<String>>,
    state: Mutex<RoleState>,
    /// Signalled when a vote is granted, to shorten the follower sleep.
    election_cv: Notify,
    transport: Arc<dyn Transport>,
    replicator: Arc<dyn Replicator>,
    metrics: Arc<MetricsRegistry>,
}

impl Constituent {
    pub fn new(
        config: ElectionConfig,
        transport: Arc<dyn Transport>,
        replicator: Arc<dyn Replicator>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let votes = vec![false; config.size()];
        let endpoints = config.endpoints.clone();
        Arc::new(Self {
            config,
            endpoints: RwLock::new(endpoints),
            state: Mutex::new(RoleState {
                term: 0,
                role: Role::Follower,
                voted_for: None,
                leader_id: None,
                votes,
                cast: false,
            }),
            election_cv: Notify::new(),
            transport,
            replicator,
            metrics,
        })
    }

    pub fn id(&self) -> AgentId {
        self.config.id
    }

    pub fn term(&self) -> Term {
        self.lock_state().term
    }

    pub fn role(&self) -> Role {
        self.lock_state().role
    }

    pub fn leader_id(&self) -> Option<AgentId> {
        self.lock_state().leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Externally visible state, served by the config endpoint.
    pub fn status(&self) -> ConstituentStatus {
        let st = self.lock_state();
        ConstituentStatus {
            id: self.config.id,
            role: st.role,
            term: st.term,
            leader_id: st.leader_id,
            size: self.config.size(),
        }
    }

    /// Current endpoint list (seed configuration merged with gossip).
    pub fn endpoints(&self) -> Vec<String> {
        self.lock_endpoints().clone()
    }

    /// Handles an incoming vote solicitation.
    ///
    /// The vote is granted iff the caller's term is strictly greater than
    /// ours, or it equals ours and the caller is already known as leader
    /// (idempotent re-affirmation, the heartbeat path). A grant adopts the
    /// term, records the vote, demotes to follower, persists
    /// `(term, voted_for)` and shortens any current follower sleep.
    pub async fn vote(&self, req: VoteRequest) -> VoteResponse {
        let granted = {
            let mut st = self.lock_state();
            let grant = req.term > st.term
                || (req.term == st.term && st.leader_id == Some(req.candidate_id));
            if grant {
                st.term = req.term;
                st.cast = true;
                st.voted_for = Some(req.candidate_id);
                st.leader_id = Some(req.candidate_id);
                if st.role != Role::Follower {
                    info!(term = st.term, "role change: converted to follower");
                    st.role = Role::Follower;
                    st.votes.iter_mut().for_each(|v| *v = false);
                }
            }
            grant.then_some((st.term, st.voted_for))
        };
        match granted {
            Some((term, voted_for)) => {
                self.metrics.record_vote_granted();
                self.metrics.set_term(term);
                if let Err(e) = self.replicator.persist(term, voted_for).await {
                    // The in-memory transition stands; divergence is logged.
                    error!(term, error = %e, "failed to persist election record");
                }
                self.election_cv.notify_one();
                VoteResponse { term, vote_granted: true }
            }
            None => VoteResponse { term: self.term(), vote_granted: false },
        }
    }

    /// Handles `notifyAll` gossip: adopts non-empty peer endpoints.
    pub fn handle_notify(&self, term: Term, agency_id: AgentId, body: NotifyAllBody) {
        debug!(term, %agency_id, "endpoint gossip received");
        let mut endpoints = self.lock_endpoints_mut();
        for (i, endpoint) in body.endpoints.into_iter().enumerate() {
            if endpoint.is_empty() {
                continue;
            }
            if let Some(slot) = endpoints.get_mut(i) {
                *slot = endpoint;
            }
        }
    }

    /// Gossips the endpoint list to every peer, fire-and-forget.
    pub async fn notify_all(&self) -> usize {
        let endpoints = self.endpoints();
        let path = format!(
            "{NOTIFY_ALL_PATH}?term={}&agencyId={}",
            self.term(),
            self.config.id
        );
        let body = serde_json::to_vec(&NotifyAllBody { endpoints: endpoints.clone() })
            .unwrap_or_default();
        let mut sent = 0;
        for (i, endpoint) in endpoints.iter().enumerate() {
            if i == self.config.id.as_usize() || endpoint.is_empty() {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let endpoint = endpoint.clone();
            let path = path.clone();
            let body = body.clone();
            tokio::spawn(async move {
                transport.notify(&endpoint, &path, body).await;
            });
            sent += 1;
        }
        sent
    }

    /// Drives the role state machine until shutdown.
    ///
    /// Resumes from the highest durably persisted election record. A
    /// single-node agency skips the state machine entirely and is a
    /// permanent leader.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        match self.replicator.last_election().await {
            Ok(Some(record)) => {
                let mut st = self.lock_state();
                st.term = record.term;
                st.voted_for = record.voted_for;
                info!(term = record.term, "resuming from persisted election state");
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to load persisted election state"),
        }

        if self.config.size() <= 1 {
            self.lead().await;
            info!("single-member agency, permanent leader");
            return;
        }

        if self.config.notify_peers {
            self.notify_all().await;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.role() == Role::Follower {
                self.lock_state().cast = false;
                let window = self.random_wait(1.0, None);
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = self.election_cv.notified() => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                let mut st = self.lock_state();
                if !st.cast && st.role == Role::Follower {
                    info!(term = st.term, "role change: converted to candidate");
                    st.role = Role::Candidate;
                }
            } else {
                self.call_election().await;
            }
        }
        info!("constituent stopped");
    }

    /// Runs for office (or, as leader, re-affirms the incumbency).
    ///
    /// Votes for self, raises the term when candidate, solicits every peer
    /// with a `min_ping` deadline, sleeps a shortened random window, then
    /// evaluates whatever responses arrived in time. Missing or failed
    /// responses count as denied.
    pub(crate) async fn call_election(&self) {
        self.metrics.record_election();
        let (term, raised) = {
            let mut st = self.lock_state();
            st.votes.iter_mut().for_each(|v| *v = false);
            if let Some(own) = st.votes.get_mut(self.config.id.as_usize()) {
                *own = true;
            }
            st.cast = true;
            let raised = st.role == Role::Candidate;
            if raised {
                st.term += 1;
                st.voted_for = Some(self.config.id);
            }
            (st.term, raised)
        };
        if raised {
            self.metrics.set_term(term);
            if let Err(e) = self.replicator.persist(term, Some(self.config.id)).await {
                error!(term, error = %e, "failed to persist election record");
            }
        }

        let last = self.replicator.last_log().await;
        let request = VoteRequest {
            term,
            candidate_id: self.config.id,
            prev_log_index: last.index,
            prev_log_term: last.term,
        };
        let path = request.to_path();
        let deadline = self.config.min_ping;
        let dispatched = tokio::time::Instant::now();

        let mut pending: JoinSet<(usize, Result<Vec<u8>, crate::transport::TransportError>)> =
            JoinSet::new();
        for (i, endpoint) in self.endpoints().into_iter().enumerate() {
            if i == self.config.id.as_usize() || endpoint.is_empty() {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let path = path.clone();
            pending.spawn(async move {
                let result = transport
                    .unary(RequestMethod::Get, &endpoint, &path, Vec::new(), Some(deadline))
                    .await;
                (i, result)
            });
        }

        tokio::time::sleep(self.random_wait(0.5, Some(0.8))).await;

        // Collect every response that lands within the RPC deadline: the
        // collection sleep is shorter than the deadline, so requests still
        // in flight here are awaited for the remainder of theirs. A peer
        // silent past the deadline counts as denied.
        let rpc_deadline = dispatched + deadline;
        let mut higher_term: Option<Term> = None;
        let mut ballots: Vec<(usize, bool)> = Vec::new();
        loop {
            let joined = match tokio::time::timeout_at(rpc_deadline, pending.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => break,
            };
            let Ok((peer, result)) = joined else { continue };
            let granted = match result {
                Ok(body) => match serde_json::from_slice::<VoteResponse>(&body) {
                    Ok(response) => {
                        if response.term > term {
                            higher_term = Some(response.term);
                            break;
                        }
                        response.vote_granted
                    }
                    Err(e) => {
                        warn!(peer, error = %e, "unreadable vote response");
                        false
                    }
                },
                Err(e) => {
                    debug!(peer, error = %e, "vote request failed");
                    false
                }
            };
            ballots.push((peer, granted));
        }
        pending.abort_all();

        if let Some(t) = higher_term {
            self.follow(t).await;
            return;
        }

        let majority = {
            let mut st = self.lock_state();
            for (peer, granted) in ballots {
                if let Some(slot) = st.votes.get_mut(peer) {
                    *slot = granted;
                }
            }
            // A concurrent grant may have demoted us while soliciting.
            if st.role == Role::Follower {
                false
            } else {
                let yea = st.votes.iter().filter(|v| **v).count();
                yea > self.config.size() / 2
            }
        };
        if majority {
            self.lead().await;
        } else {
            self.follow(term).await;
        }
    }

    /// Becomes follower at term `t` (terms never regress), voiding all votes.
    pub(crate) async fn follow(&self, t: Term) {
        let (term, voted_for, term_changed) = {
            let mut st = self.lock_state();
            if st.role != Role::Follower {
                info!(term = t, "role change: converted to follower");
            }
            st.role = Role::Follower;
            let term_changed = t > st.term;
            if term_changed {
                st.term = t;
            }
            st.votes.iter_mut().for_each(|v| *v = false);
            (st.term, st.voted_for, term_changed)
        };
        if term_changed {
            self.metrics.set_term(term);
            if let Err(e) = self.replicator.persist(term, voted_for).await {
                error!(term, error = %e, "failed to persist election record");
            }
        }
    }

    /// Becomes leader, invoking the replicator's leadership hook on the
    /// transition so derived in-memory state is rebuilt.
    pub(crate) async fn lead(&self) {
        let (term, newly) = {
            let mut st = self.lock_state();
            let newly = st.role != Role::Leader;
            st.role = Role::Leader;
            st.leader_id = Some(self.config.id);
            (st.term, newly)
        };
        if newly {
            info!(term, "role change: converted to leader");
            self.replicator.on_lead().await;
        }
    }

    /// A uniform random wait scaled from the ping bounds: the follower
    /// window spans `[min_ping, max_ping]`, the candidate collection window
    /// `[0.5 min_ping, 0.8 min_ping]`.
    fn random_wait(&self, lower: f64, upper: Option<f64>) -> Duration {
        let min = self.config.min_ping.as_secs_f64();
        let max = self.config.max_ping.as_secs_f64();
        let (lo, hi) = match upper {
            Some(upper) => (min * lower, min * upper),
            None => (min * lower, max),
        };
        let secs = if hi > lo { rand::thread_rng().gen_range(lo..hi) } else { lo };
        Duration::from_secs_f64(secs)
    }

    fn lock_state(&self) -> MutexGuard<'_, RoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_endpoints(&self) -> std::sync::RwLockReadGuard<'_, Vec<String>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_endpoints_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<String>> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::LocalReplicator;
    use crate::store::Store;
    use crate::transport::{
        split_query, LoopbackNetwork, NullTransport, RequestHandler, TransportError,
    };
    use async_trait::async_trait;

    fn metrics() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new().unwrap())
    }

    fn local_replicator() -> Arc<LocalReplicator> {
        let store = Arc::new(Store::new(Arc::new(NullTransport), metrics()));
        Arc::new(LocalReplicator::new(store))
    }

    fn three_node(
        id: u64,
        transport: Arc<dyn Transport>,
    ) -> Arc<Constituent> {
        let config = ElectionConfig {
            id: AgentId::new(id),
            endpoints: vec!["http://n0".into(), "http://n1".into(), "http://n2".into()],
            min_ping: Duration::from_millis(10),
            max_ping: Duration::from_millis(20),
            notify_peers: false,
        };
        Constituent::new(config, transport, local_replicator(), metrics())
    }

    #[tokio::test]
    async fn test_vote_granted_on_higher_term() {
        let c = three_node(0, Arc::new(NullTransport));
        let resp = c
            .vote(VoteRequest {
                term: 1,
                candidate_id: AgentId::new(1),
                prev_log_index: 0,
                prev_log_term: 0,
            })
            .await;
        assert!(resp.vote_granted);
        assert_eq!(resp.term, 1);
        assert_eq!(c.term(), 1);
        assert_eq!(c.leader_id(), Some(AgentId::new(1)));
        assert_eq!(c.role(), Role::Follower);
    }

    #[tokio::test]
    async fn test_vote_rejected_same_term_unknown_candidate() {
        let c = three_node(0, Arc::new(NullTransport));
        c.vote(VoteRequest {
            term: 2,
            candidate_id: AgentId::new(1),
            prev_log_index: 0,
            prev_log_term: 0,
        })
        .await;
        // Another candidate at the same term is refused.
        let resp = c
            .vote(VoteRequest {
                term: 2,
                candidate_id: AgentId::new(2),
                prev_log_index: 0,
                prev_log_term: 0,
            })
            .await;
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 2);
        assert_eq!(c.leader_id(), Some(AgentId::new(1)));
    }

    #[tokio::test]
    async fn test_vote_reaffirms_known_leader() {
        let c = three_node(0, Arc::new(NullTransport));
        c.vote(VoteRequest {
            term: 2,
            candidate_id: AgentId::new(1),
            prev_log_index: 0,
            prev_log_term: 0,
        })
        .await;
        let resp = c
            .vote(VoteRequest {
                term: 2,
                candidate_id: AgentId::new(1),
                prev_log_index: 0,
                prev_log_term: 0,
            })
            .await;
        assert!(resp.vote_granted);
        assert_eq!(c.term(), 2);
    }

    #[tokio::test]
    async fn test_term_never_regresses() {
        let c = three_node(0, Arc::new(NullTransport));
        c.vote(VoteRequest {
            term: 5,
            candidate_id: AgentId::new(1),
            prev_log_index: 0,
            prev_log_term: 0,
        })
        .await;
        let resp = c
            .vote(VoteRequest {
                term: 3,
                candidate_id: AgentId::new(2),
                prev_log_index: 0,
                prev_log_term: 0,
            })
            .await;
        assert!(!resp.vote_granted);
        assert_eq!(c.term(), 5);
        c.follow(2).await;
        assert_eq!(c.term(), 5);
    }

    #[tokio::test]
    async fn test_election_without_reachable_peers_returns_follower() {
        let c = three_node(0, Arc::new(NullTransport));
        c.lock_state().role = Role::Candidate;
        c.call_election().await;
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(c.term(), 1);
    }

    struct AlwaysGrant;

    #[async_trait]
    impl RequestHandler for AlwaysGrant {
        async fn handle(&self, path: &str, _body: &[u8]) -> Result<Vec<u8>, TransportError> {
            let (_, params) = split_query(path);
            let req = VoteRequest::from_params(&params)
                .ok_or_else(|| TransportError::Request("bad vote request".into()))?;
            let resp = VoteResponse { term: req.term, vote_granted: true };
            Ok(serde_json::to_vec(&resp).unwrap())
        }
    }

    struct HigherTerm(Term);

    #[async_trait]
    impl RequestHandler for HigherTerm {
        async fn handle(&self, _path: &str, _body: &[u8]) -> Result<Vec<u8>, TransportError> {
            let resp = VoteResponse { term: self.0, vote_granted: false };
            Ok(serde_json::to_vec(&resp).unwrap())
        }
    }

    #[tokio::test]
    async fn test_election_with_majority_leads() {
        let net = LoopbackNetwork::new();
        net.register("http://n1", Arc::new(AlwaysGrant));
        net.register("http://n2", Arc::new(AlwaysGrant));
        let c = three_node(0, Arc::new(net.transport("http://n0")));
        c.lock_state().role = Role::Candidate;
        c.call_election().await;
        assert!(c.is_leader());
        assert_eq!(c.leader_id(), Some(AgentId::new(0)));
        assert_eq!(c.term(), 1);
    }

    #[tokio::test]
    async fn test_votes_landing_after_collection_window_still_count() {
        let net = LoopbackNetwork::new();
        net.register("http://n1", Arc::new(AlwaysGrant));
        net.register("http://n2", Arc::new(AlwaysGrant));
        // Responses arrive after the [0.5, 0.8] min_ping collection sleep
        // has ended but still inside the min_ping RPC deadline.
        net.set_latency("http://n0", "http://n1", Duration::from_millis(85));
        net.set_latency("http://n0", "http://n2", Duration::from_millis(85));
        let config = ElectionConfig {
            id: AgentId::new(0),
            endpoints: vec!["http://n0".into(), "http://n1".into(), "http://n2".into()],
            min_ping: Duration::from_millis(100),
            max_ping: Duration::from_millis(200),
            notify_peers: false,
        };
        let c = Constituent::new(
            config,
            Arc::new(net.transport("http://n0")),
            local_replicator(),
            metrics(),
        );
        c.lock_state().role = Role::Candidate;
        c.call_election().await;
        assert!(c.is_leader());
        assert_eq!(c.term(), 1);
    }

    #[tokio::test]
    async fn test_peers_silent_past_deadline_count_as_denied() {
        let net = LoopbackNetwork::new();
        net.register("http://n1", Arc::new(AlwaysGrant));
        net.register("http://n2", Arc::new(AlwaysGrant));
        net.set_latency("http://n0", "http://n1", Duration::from_millis(500));
        net.set_latency("http://n0", "http://n2", Duration::from_millis(500));
        let config = ElectionConfig {
            id: AgentId::new(0),
            endpoints: vec!["http://n0".into(), "http://n1".into(), "http://n2".into()],
            min_ping: Duration::from_millis(50),
            max_ping: Duration::from_millis(100),
            notify_peers: false,
        };
        let c = Constituent::new(
            config,
            Arc::new(net.transport("http://n0")),
            local_replicator(),
            metrics(),
        );
        c.lock_state().role = Role::Candidate;
        c.call_election().await;
        assert_eq!(c.role(), Role::Follower);
    }

    #[tokio::test]
    async fn test_higher_term_response_demotes() {
        let net = LoopbackNetwork::new();
        net.register("http://n1", Arc::new(HigherTerm(9)));
        net.register("http://n2", Arc::new(HigherTerm(9)));
        let c = three_node(0, Arc::new(net.transport("http://n0")));
        c.lock_state().role = Role::Candidate;
        c.call_election().await;
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(c.term(), 9);
    }

    #[tokio::test]
    async fn test_single_node_is_permanent_leader() {
        let config = ElectionConfig::single_node(AgentId::new(0), "http://only");
        let c = Constituent::new(
            config,
            Arc::new(NullTransport),
            local_replicator(),
            metrics(),
        );
        let (_tx, rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&c).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(c.is_leader());
        assert_eq!(c.leader_id(), Some(AgentId::new(0)));
        // The single-node run loop exits on its own.
        tokio::time::timeout(Duration::from_secs(1), runner).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handle_notify_merges_endpoints() {
        let c = three_node(0, Arc::new(NullTransport));
        c.handle_notify(
            0,
            AgentId::new(2),
            NotifyAllBody {
                endpoints: vec![String::new(), "http://n1-new".into(), String::new()],
            },
        );
        assert_eq!(
            c.endpoints(),
            vec!["http://n0".to_string(), "http://n1-new".into(), "http://n2".into()]
        );
    }
}
