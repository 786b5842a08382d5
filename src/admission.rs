//! Admission control: replay and duplication guard for transaction ids, an
//! adaptive lateness threshold, and per-node fault tracking.
//!
//! Every operation takes the same lock, so concurrent handlers racing on an
//! id observe a single linear history.

use crate::blockchain::BlockRef;
use crate::config::AdmissionConfig;
use crate::error::{ChainError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Source of unix time in fractional seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// Query-time classification of a transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    Valid,
    Invalid,
    Duplicate,
    Late,
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Valid => "valid",
            Admission::Invalid => "invalid",
            Admission::Duplicate => "duplicate",
            Admission::Late => "late",
        }
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub status: EntryStatus,
    /// When the id was first logged.
    pub timestamp: f64,
    pub block: BlockRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub failures: u32,
    pub last_failure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCondition {
    Congested,
    Smooth,
}

/// Persisted form of the admission state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub global_transaction_log: BTreeMap<String, LedgerEntry>,
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, FaultRecord>,
    #[serde(default = "default_timeout")]
    pub timeout_threshold: f64,
}

fn default_timeout() -> f64 {
    AdmissionConfig::default().timeout_threshold
}

#[derive(Debug)]
struct AdmissionState {
    log: BTreeMap<String, LedgerEntry>,
    failed_nodes: BTreeMap<String, FaultRecord>,
    timeout_threshold: f64,
}

pub struct AdmissionControl {
    state: Mutex<AdmissionState>,
    learning_rate: f64,
    min_timeout: f64,
    failure_threshold: u32,
    recovery_secs: f64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionControl")
            .field("entries", &state.log.len())
            .field("failed_nodes", &state.failed_nodes.len())
            .field("timeout_threshold", &state.timeout_threshold)
            .finish()
    }
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(&AdmissionConfig::default())
    }
}

impl AdmissionControl {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(AdmissionState {
                log: BTreeMap::new(),
                failed_nodes: BTreeMap::new(),
                timeout_threshold: config.timeout_threshold,
            }),
            learning_rate: config.learning_rate,
            min_timeout: config.min_timeout,
            failure_threshold: config.failure_threshold,
            recovery_secs: config.recovery_secs,
            clock,
        }
    }

    /// Record a newly seen id as pending. Returns false if the id is already
    /// known, whatever its status.
    pub fn log(&self, id: &str, block: BlockRef) -> bool {
        let mut state = self.state.lock();
        if state.log.contains_key(id) {
            debug!("Transaction {} already logged", id);
            return false;
        }
        let block_index = block.index;
        state.log.insert(
            id.to_string(),
            LedgerEntry {
                status: EntryStatus::Pending,
                timestamp: self.clock.now(),
                block,
            },
        );
        debug!("Transaction {} logged at block {}", id, block_index);
        true
    }

    pub fn validate(&self, id: &str) -> Admission {
        let state = self.state.lock();
        let Some(entry) = state.log.get(id) else {
            warn!("Transaction {} is invalid (unknown id)", id);
            return Admission::Invalid;
        };

        if entry.status == EntryStatus::Completed {
            warn!("Transaction {} is a duplicate", id);
            return Admission::Duplicate;
        }

        let elapsed = self.clock.now() - entry.timestamp;
        if elapsed > state.timeout_threshold {
            warn!(
                "Transaction {} is late ({:.1}s > {:.1}s)",
                id, elapsed, state.timeout_threshold
            );
            return Admission::Late;
        }
        Admission::Valid
    }

    /// Move a pending id to completed. `Ok(false)` if it already was.
    pub fn mark_completed(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.log.get_mut(id) {
            Some(entry) if entry.status == EntryStatus::Pending => {
                entry.status = EntryStatus::Completed;
                debug!("Transaction {} marked completed", id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                error!("Transaction {} not found in admission log", id);
                Err(ChainError::InvalidTransaction(format!(
                    "Transaction {} was never logged",
                    id
                )))
            }
        }
    }

    pub fn status_of(&self, id: &str) -> Option<EntryStatus> {
        self.state.lock().log.get(id).map(|entry| entry.status)
    }

    pub fn adapt_timeout(&self, condition: NetworkCondition) {
        let mut state = self.state.lock();
        let previous = state.timeout_threshold;
        state.timeout_threshold = match condition {
            NetworkCondition::Congested => previous * (1.0 + self.learning_rate),
            NetworkCondition::Smooth => {
                (previous * (1.0 - self.learning_rate)).max(self.min_timeout)
            }
        };
        if state.timeout_threshold != previous {
            info!(
                "Timeout threshold adapted from {:.2}s to {:.2}s",
                previous, state.timeout_threshold
            );
        }
    }

    pub fn timeout_threshold(&self) -> f64 {
        self.state.lock().timeout_threshold
    }

    /// Count a failure against `node`. Returns true once the count exceeds
    /// the failure threshold.
    pub fn monitor_node(&self, node: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .failed_nodes
            .entry(node.to_string())
            .and_modify(|record| {
                record.failures += 1;
                record.last_failure = now;
            })
            .or_insert(FaultRecord {
                failures: 1,
                last_failure: now,
            });

        if record.failures > self.failure_threshold {
            warn!(
                "Node {} flagged after {} failures",
                node, record.failures
            );
            return true;
        }
        false
    }

    pub fn is_flagged(&self, node: &str) -> bool {
        self.state
            .lock()
            .failed_nodes
            .get(node)
            .is_some_and(|record| record.failures > self.failure_threshold)
    }

    pub fn fault_record(&self, node: &str) -> Option<FaultRecord> {
        self.state.lock().failed_nodes.get(node).cloned()
    }

    /// Forget nodes whose last failure is at least the recovery period ago.
    /// Returns the recovered node ids.
    pub fn recover_failed_nodes(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let recovered: Vec<String> = state
            .failed_nodes
            .iter()
            .filter(|(_, record)| now - record.last_failure >= self.recovery_secs)
            .map(|(node, _)| node.clone())
            .collect();
        for node in &recovered {
            state.failed_nodes.remove(node);
            info!("Node {} stable for {:.0}s, cleared", node, self.recovery_secs);
        }
        recovered
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            global_transaction_log: state.log.clone(),
            failed_nodes: state.failed_nodes.clone(),
            timeout_threshold: state.timeout_threshold,
        }
    }

    /// Replace the in-memory state with a snapshot.
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        let mut state = self.state.lock();
        info!(
            "Restored admission log with {} entries and {} failed nodes",
            snapshot.global_transaction_log.len(),
            snapshot.failed_nodes.len()
        );
        state.log = snapshot.global_transaction_log;
        state.failed_nodes = snapshot.failed_nodes;
        state.timeout_threshold = snapshot.timeout_threshold;
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().log.is_empty()
    }

    pub fn log_activity(&self) {
        let state = self.state.lock();
        let completed = state
            .log
            .values()
            .filter(|entry| entry.status == EntryStatus::Completed)
            .count();
        info!(
            "Admission log: {} entries ({} completed, {} pending), {} failed nodes, timeout {:.2}s",
            state.log.len(),
            completed,
            state.log.len() - completed,
            state.failed_nodes.len(),
            state.timeout_threshold
        );
        for (id, entry) in &state.log {
            debug!(
                "  {}: {:?}, block {} ({})",
                id,
                entry.status,
                entry.block.index,
                entry.block.hash.get(..10).unwrap_or(&entry.block.hash)
            );
        }
        for (node, record) in &state.failed_nodes {
            debug!(
                "  node {}: {} failures, last at {:.0}",
                node, record.failures, record.last_failure
            );
        }
    }
}
