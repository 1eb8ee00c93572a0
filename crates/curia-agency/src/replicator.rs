//! Replicator capability handle.
//!
//! The constituent and the store never talk to the replication machinery
//! directly; they hold an `Arc<dyn Replicator>`. The contract covers durable
//! election state (`persist` / `last_election`), log freshness (`last_log`),
//! and the leader write path (`write` / `wait_for`).
//!
//! [`LocalReplicator`] is the single-process implementation: writes apply
//! straight to the local store, and election records are made durable in an
//! [`ElectionLedger`] file of length-prefixed bincode records.

use crate::constituent::Constituent;
use crate::store::Store;
use async_trait::async_trait;
use curia_core::{AgentId, LogIndex, LogInfo, Term};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::{debug, info};

/// Errors related to replication and durable election state.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("failed to access election ledger: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize election record: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("not the leader")]
    NotLeader,
    #[error("election ledger record is truncated")]
    Truncated,
}

/// One durable `(term, voted_for)` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub term: Term,
    pub voted_for: Option<AgentId>,
}

impl ElectionRecord {
    /// Ledger key: the term left-padded to width 20 with zeros, so the
    /// highest key is the latest record.
    pub fn key(&self) -> String {
        format!("{:020}", self.term)
    }
}

/// Persists election state and accepts committed transactions.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Durably records `(term, voted_for)`.
    async fn persist(&self, term: Term, voted_for: Option<AgentId>) -> Result<(), ReplicatorError>;

    /// The highest-keyed election record, used to resume after restart.
    async fn last_election(&self) -> Result<Option<ElectionRecord>, ReplicatorError>;

    /// Position and term of the last log entry.
    async fn last_log(&self) -> LogInfo;

    /// Submits a transaction envelope through the leader path.
    async fn write(&self, envelope: &Value) -> Result<Vec<bool>, ReplicatorError>;

    /// Waits until the entry at `index` has been applied.
    async fn wait_for(&self, index: LogIndex) -> Result<(), ReplicatorError>;

    /// Leadership initialisation hook: rebuild in-memory derived state.
    async fn on_lead(&self) {}
}

// =============================================================================
// Election ledger
// =============================================================================

/// Append-only file of election records.
///
/// Each record is a u64 little-endian length prefix followed by the bincode
/// serialisation of `(key, ElectionRecord)`. Every write is flushed so the
/// record survives the process.
pub struct ElectionLedger {
    _path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    records: Mutex<BTreeMap<String, ElectionRecord>>,
}

impl ElectionLedger {
    /// Opens or creates the ledger at `path`, loading any existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplicatorError> {
        let path = path.as_ref();
        let mut records = BTreeMap::new();
        if path.exists() {
            let mut buf = Vec::new();
            File::open(path)?.read_to_end(&mut buf)?;
            let mut at = 0;
            while at + 8 <= buf.len() {
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&buf[at..at + 8]);
                let len = u64::from_le_bytes(len_bytes) as usize;
                at += 8;
                if at + len > buf.len() {
                    return Err(ReplicatorError::Truncated);
                }
                let (key, record): (String, ElectionRecord) =
                    bincode::deserialize(&buf[at..at + len])?;
                records.insert(key, record);
                at += len;
            }
        }
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            _path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            records: Mutex::new(records),
        })
    }

    /// Appends one record and flushes it to disk.
    pub fn append(&self, record: ElectionRecord) -> Result<(), ReplicatorError> {
        let key = record.key();
        let encoded = bincode::serialize(&(key.clone(), record))?;
        {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&(encoded.len() as u64).to_le_bytes())?;
            writer.write_all(&encoded)?;
            writer.flush()?;
        }
        self.records.lock().unwrap_or_else(PoisonError::into_inner).insert(key, record);
        Ok(())
    }

    /// The record with the highest key, if any.
    pub fn latest(&self) -> Option<ElectionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .next_back()
            .copied()
    }
}

// =============================================================================
// Local replicator
// =============================================================================

/// Replicator for a single-process agency (and the sweeper pipe).
///
/// Writes are gated on the bound constituent's leadership and applied
/// synchronously to the local store, so `wait_for` is immediate.
pub struct LocalReplicator {
    store: Arc<Store>,
    ledger: Option<ElectionLedger>,
    index: AtomicU64,
    log_term: AtomicU64,
    constituent: Mutex<Weak<Constituent>>,
}

impl LocalReplicator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            ledger: None,
            index: AtomicU64::new(0),
            log_term: AtomicU64::new(0),
            constituent: Mutex::new(Weak::new()),
        }
    }

    /// Attaches a durable election ledger.
    pub fn with_ledger(mut self, ledger: ElectionLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Binds the constituent whose leadership gates the write path. Until
    /// bound, writes are accepted unconditionally (single-node bootstrap).
    pub fn bind_constituent(&self, constituent: &Arc<Constituent>) {
        *self.constituent.lock().unwrap_or_else(PoisonError::into_inner) =
            Arc::downgrade(constituent);
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn persist(&self, term: Term, voted_for: Option<AgentId>) -> Result<(), ReplicatorError> {
        self.log_term.store(term, Ordering::SeqCst);
        if let Some(ledger) = &self.ledger {
            ledger.append(ElectionRecord { term, voted_for })?;
        }
        Ok(())
    }

    async fn last_election(&self) -> Result<Option<ElectionRecord>, ReplicatorError> {
        Ok(self.ledger.as_ref().and_then(ElectionLedger::latest))
    }

    async fn last_log(&self) -> LogInfo {
        LogInfo::new(self.index.load(Ordering::SeqCst), self.log_term.load(Ordering::SeqCst))
    }

    async fn write(&self, envelope: &Value) -> Result<Vec<bool>, ReplicatorError> {
        let bound = self.constituent.lock().unwrap_or_else(PoisonError::into_inner).upgrade();
        if let Some(constituent) = bound {
            if !constituent.is_leader() {
                return Err(ReplicatorError::NotLeader);
            }
        }
        let results = self.store.apply(envelope);
        self.index.fetch_add(results.len() as u64, Ordering::SeqCst);
        Ok(results)
    }

    async fn wait_for(&self, index: LogIndex) -> Result<(), ReplicatorError> {
        // Local writes apply synchronously.
        debug!(index, "wait_for on local replicator");
        Ok(())
    }

    async fn on_lead(&self) {
        info!("assumed leadership, local state is authoritative");
    }
}
