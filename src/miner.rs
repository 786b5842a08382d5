//! Proof-of-work search over the nonce triple.

use crate::blockchain::{Block, ContentHasher, NonceTriple, meets_difficulty};
use crate::error::{ChainError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::debug;

pub const DEFAULT_MAX_ITERATIONS: u64 = 100_000_000;

/// How many trials run between checks of the cancellation flag.
const CANCEL_CHECK_INTERVAL: u64 = 1024;
const PROGRESS_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Clone, Copy)]
pub struct Miner {
    pub max_iterations: u64,
}

impl Default for Miner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl Miner {
    pub fn new(max_iterations: u64) -> Self {
        Self { max_iterations }
    }

    /// Search from nonces (0, 0, 0) until the hash has `block.difficulty`
    /// leading zero hex digits. Fails with `MiningCancelled` once `cancel` is
    /// raised and with `MiningExhausted` when the iteration cap is reached.
    pub fn mine(&self, mut block: Block, cancel: &AtomicBool) -> Result<Block> {
        let hasher = ContentHasher::new(&block)?;
        let started = Instant::now();
        let mut nonces = NonceTriple::default();
        let mut hash = hasher.hash(nonces);
        let mut iterations: u64 = 0;

        while !meets_difficulty(&hash, block.difficulty) {
            if iterations >= self.max_iterations {
                return Err(ChainError::MiningExhausted { iterations });
            }
            if iterations % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                debug!("Mining block {} cancelled after {} trials", block.index, iterations);
                return Err(ChainError::MiningCancelled);
            }

            nonces.increment();
            hash = hasher.hash(nonces);
            iterations += 1;

            if iterations % PROGRESS_INTERVAL == 0 {
                let rate = iterations as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
                debug!(
                    "Mining block {}: {} trials, {:.0} H/s",
                    block.index, iterations, rate
                );
            }
        }

        block.set_nonces(nonces);
        block.hash = hash;
        debug!(
            "Mined block {} in {} trials ({:?})",
            block.index,
            iterations,
            started.elapsed()
        );
        Ok(block)
    }
}

/// Mine with the default iteration cap and no cancellation.
pub fn mine_block(block: Block) -> Result<Block> {
    Miner::default().mine(block, &AtomicBool::new(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn candidate(difficulty: u32) -> Block {
        let tx = Transaction::new("alice", "bob", 42, 1, b"sig".to_vec()).unwrap();
        Block::new(1, "0".repeat(64), 1_700_000_100, vec![tx], 0, difficulty, "4.0").unwrap()
    }

    #[test]
    fn test_mined_hash_meets_difficulty() {
        for difficulty in 0..=3 {
            let block = mine_block(candidate(difficulty)).unwrap();
            assert!(block.hash.starts_with(&"0".repeat(difficulty as usize)));
            assert!(block.has_valid_hash().unwrap());
        }
    }

    #[test]
    fn test_difficulty_zero_keeps_initial_nonces() {
        let block = mine_block(candidate(0)).unwrap();
        assert_eq!(block.nonces(), NonceTriple::default());
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        let result = Miner::new(10).mine(candidate(64), &AtomicBool::new(false));
        assert!(matches!(
            result,
            Err(ChainError::MiningExhausted { iterations: 10 })
        ));
    }

    #[test]
    fn test_cancellation() {
        let cancel = AtomicBool::new(true);
        let result = Miner::default().mine(candidate(64), &cancel);
        assert!(matches!(result, Err(ChainError::MiningCancelled)));
    }
}
