//! Prometheus metrics export for CuriaDB.
//!
//! Metrics are only compiled in when the `metrics` feature is enabled; a
//! no-op twin keeps call sites free of conditional compilation.
//!
//! # Metrics Exported
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `curia_transactions_total` | Counter | Transactions applied |
//! | `curia_transactions_failed_total` | Counter | Transactions rejected |
//! | `curia_precondition_failures_total` | Counter | Failed preconditions |
//! | `curia_ttl_expired_total` | Counter | TTL entries swept |
//! | `curia_elections_total` | Counter | Elections called |
//! | `curia_votes_granted_total` | Counter | Votes granted to peers |
//! | `curia_term` | Gauge | Current consensus term |
//! | `curia_time_table_size` | Gauge | Live TTL entries |

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Error type for metrics operations.
#[derive(Debug)]
pub struct MetricsError(String);

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetricsError: {}", self.0)
    }
}

impl std::error::Error for MetricsError {}

#[cfg(feature = "metrics")]
impl From<prometheus::Error> for MetricsError {
    fn from(e: prometheus::Error) -> Self {
        MetricsError(e.to_string())
    }
}

/// Metrics registry for one CuriaDB node.
#[cfg(feature = "metrics")]
pub struct MetricsRegistry {
    registry: Registry,
    transactions: IntCounter,
    transactions_failed: IntCounter,
    precondition_failures: IntCounter,
    ttl_expired: IntCounter,
    elections: IntCounter,
    votes_granted: IntCounter,
    term: IntGauge,
    time_table_size: IntGauge,
}

#[cfg(feature = "metrics")]
impl MetricsRegistry {
    /// Creates a new metrics registry with all meters registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let transactions =
            IntCounter::with_opts(Opts::new("curia_transactions_total", "Transactions applied"))?;
        let transactions_failed = IntCounter::with_opts(Opts::new(
            "curia_transactions_failed_total",
            "Transactions rejected",
        ))?;
        let precondition_failures = IntCounter::with_opts(Opts::new(
            "curia_precondition_failures_total",
            "Failed preconditions",
        ))?;
        let ttl_expired =
            IntCounter::with_opts(Opts::new("curia_ttl_expired_total", "TTL entries swept"))?;
        let elections =
            IntCounter::with_opts(Opts::new("curia_elections_total", "Elections called"))?;
        let votes_granted =
            IntCounter::with_opts(Opts::new("curia_votes_granted_total", "Votes granted"))?;
        let term = IntGauge::with_opts(Opts::new("curia_term", "Current consensus term"))?;
        let time_table_size =
            IntGauge::with_opts(Opts::new("curia_time_table_size", "Live TTL entries"))?;

        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(transactions_failed.clone()))?;
        registry.register(Box::new(precondition_failures.clone()))?;
        registry.register(Box::new(ttl_expired.clone()))?;
        registry.register(Box::new(elections.clone()))?;
        registry.register(Box::new(votes_granted.clone()))?;
        registry.register(Box::new(term.clone()))?;
        registry.register(Box::new(time_table_size.clone()))?;

        Ok(Self {
            registry,
            transactions,
            transactions_failed,
            precondition_failures,
            ttl_expired,
            elections,
            votes_granted,
            term,
            time_table_size,
        })
    }

    /// Records the outcome of one transaction.
    pub fn record_transaction(&self, applied: bool) {
        if applied {
            self.transactions.inc();
        } else {
            self.transactions_failed.inc();
        }
    }

    /// Records a failed precondition.
    pub fn record_precondition_failure(&self) {
        self.precondition_failures.inc();
    }

    /// Records swept TTL entries.
    pub fn record_ttl_expired(&self, count: u64) {
        self.ttl_expired.inc_by(count);
    }

    /// Records a called election.
    pub fn record_election(&self) {
        self.elections.inc();
    }

    /// Records a vote granted to a peer.
    pub fn record_vote_granted(&self) {
        self.votes_granted.inc();
    }

    /// Sets the current term gauge.
    pub fn set_term(&self, term: u64) {
        self.term.set(term as i64);
    }

    /// Sets the live TTL entry gauge.
    pub fn set_time_table_size(&self, size: usize) {
        self.time_table_size.set(size as i64);
    }

    /// Exports all metrics in the Prometheus text format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| MetricsError(e.to_string()))
    }
}

#[cfg(feature = "metrics")]
impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("transactions", &self.transactions.get())
            .field("precondition_failures", &self.precondition_failures.get())
            .field("ttl_expired", &self.ttl_expired.get())
            .field("elections", &self.elections.get())
            .field("term", &self.term.get())
            .finish()
    }
}

// =============================================================================
// No-op Implementation (when metrics feature is disabled)
// =============================================================================

/// No-op metrics registry when the `metrics` feature is disabled.
#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry;

#[cfg(not(feature = "metrics"))]
impl MetricsRegistry {
    /// Creates a new no-op metrics registry.
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self)
    }

    /// No-op: Records the outcome of one transaction.
    pub fn record_transaction(&self, _applied: bool) {}

    /// No-op: Records a failed precondition.
    pub fn record_precondition_failure(&self) {}

    /// No-op: Records swept TTL entries.
    pub fn record_ttl_expired(&self, _count: u64) {}

    /// No-op: Records a called election.
    pub fn record_election(&self) {}

    /// No-op: Records a vote granted to a peer.
    pub fn record_vote_granted(&self) {}

    /// No-op: Sets the current term gauge.
    pub fn set_term(&self, _term: u64) {}

    /// No-op: Sets the live TTL entry gauge.
    pub fn set_time_table_size(&self, _size: usize) {}

    /// Returns an empty string (no metrics to export).
    pub fn export(&self) -> Result<String, MetricsError> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_transaction(true);
        metrics.record_transaction(false);
        metrics.record_precondition_failure();
        metrics.record_ttl_expired(2);
        metrics.set_term(4);
        metrics.set_time_table_size(1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_export_contains_meters() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_transaction(true);
        metrics.record_election();
        let out = metrics.export().unwrap();
        assert!(out.contains("curia_transactions_total"));
        assert!(out.contains("curia_elections_total"));
        assert!(out.contains("curia_term"));
    }
}
