//! Pending transaction pool feeding the miner.

use crate::blockchain::Block;
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use std::collections::HashMap;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct PoolEntry {
    seq: u64,
    tx: Transaction,
}

#[derive(Debug, Clone)]
pub struct Mempool {
    transactions: HashMap<String, PoolEntry>,
    capacity: usize,
    next_seq: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            transactions: HashMap::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> Result<()> {
        if self.transactions.contains_key(&tx.transaction_id) {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} is already pending",
                tx.transaction_id
            )));
        }
        if self.transactions.len() >= self.capacity {
            return Err(ChainError::MempoolFull);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.transactions
            .insert(tx.transaction_id.clone(), PoolEntry { seq, tx });
        Ok(())
    }

    pub fn remove_transaction(&mut self, id: &str) -> Option<Transaction> {
        self.transactions.remove(id).map(|entry| entry.tx)
    }

    /// Drop every transaction the block consumed; returns how many were pending.
    pub fn remove_included(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .filter(|tx| self.transactions.remove(&tx.transaction_id).is_some())
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.contains_key(id)
    }

    /// Highest fee first, oldest first among equal fees.
    pub fn get_transactions_by_fee(&self, limit: usize) -> Vec<Transaction> {
        let mut entries: Vec<&PoolEntry> = self.transactions.values().collect();
        entries.sort_by(|a, b| b.tx.fee.cmp(&a.tx.fee).then(a.seq.cmp(&b.seq)));
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.tx.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of capacity in use, 0.0 to 1.0.
    pub fn load(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.transactions.len() as f64 / self.capacity as f64
    }
}
