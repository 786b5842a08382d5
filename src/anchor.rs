//! Anchor records: references to data settled on an external chain, flooded
//! between peers with a hop limit and de-duplicated by id.

use crate::error::{ChainError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub id: String,
    /// Identifier returned by the settlement chain, e.g. its transaction id.
    pub reference: String,
    /// The anchored data, usually a block hash.
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u64>,
    pub created_at: i64,
    /// Remaining rebroadcast hops. Not part of the id.
    #[serde(default)]
    pub ttl: u32,
}

impl AnchorRecord {
    pub fn new(
        reference: impl Into<String>,
        payload: impl Into<String>,
        block_index: Option<u64>,
        ttl: u32,
    ) -> Self {
        let reference = reference.into();
        let payload = payload.into();
        let created_at = chrono::Utc::now().timestamp();
        let id = Self::compute_id(&reference, &payload, created_at);
        Self {
            id,
            reference,
            payload,
            block_index,
            created_at,
            ttl,
        }
    }

    pub fn compute_id(reference: &str, payload: &str, created_at: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}|{}", reference, payload, created_at).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn validate(&self) -> Result<()> {
        if self.reference.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Anchor reference is empty".to_string(),
            ));
        }
        let expected = Self::compute_id(&self.reference, &self.payload, self.created_at);
        if expected != self.id {
            return Err(ChainError::InvalidTransaction(format!(
                "Anchor id mismatch. Expected {}, got {}",
                expected, self.id
            )));
        }
        Ok(())
    }

    /// Copy for the next hop, or `None` once the hop budget is spent.
    pub fn next_hop(&self) -> Option<AnchorRecord> {
        (self.ttl > 0).then(|| AnchorRecord {
            ttl: self.ttl - 1,
            ..self.clone()
        })
    }
}

#[derive(Debug, Default)]
struct AnchorHistory {
    records: Vec<AnchorRecord>,
    seen: HashSet<String>,
}

/// Ordered anchor history with a seen-set.
#[derive(Debug, Default)]
pub struct AnchorStore {
    inner: RwLock<AnchorHistory>,
}

impl AnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an anchor with the same id was stored before.
    pub fn insert(&self, record: AnchorRecord) -> bool {
        let mut inner = self.inner.write();
        if !inner.seen.insert(record.id.clone()) {
            debug!("Anchor {} already seen", record.id);
            return false;
        }
        inner.records.push(record);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().seen.contains(id)
    }

    pub fn history(&self) -> Vec<AnchorRecord> {
        self.inner.read().records.clone()
    }

    /// Insert every unseen, well-formed record; returns how many were new.
    pub fn merge(&self, records: Vec<AnchorRecord>) -> usize {
        records
            .into_iter()
            .filter(|record| record.validate().is_ok())
            .filter(|record| self.insert(record.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}
