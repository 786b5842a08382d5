use crate::blockchain::core::block::Block;
use crate::error::{ChainError, RejectReason};
use std::collections::HashMap;

/// The consensus rules, checked in this order and stopping at the first
/// failure: linkage, difficulty, proof of work, hash integrity.
pub fn validate_consensus(
    tip: &Block,
    expected_difficulty: u32,
    block: &Block,
) -> Result<(), ChainError> {
    if block.previous_hash != tip.hash {
        return Err(RejectReason::PreviousHashMismatch {
            expected: tip.hash.clone(),
            found: block.previous_hash.clone(),
        }
        .into());
    }

    if block.difficulty != expected_difficulty {
        return Err(RejectReason::DifficultyMismatch {
            expected: expected_difficulty,
            found: block.difficulty,
        }
        .into());
    }

    if !block.meets_difficulty() {
        return Err(RejectReason::ProofOfWorkUnmet {
            hash: block.hash.clone(),
            difficulty: block.difficulty,
        }
        .into());
    }

    let recalculated = block.calculate_hash()?;
    if recalculated != block.hash {
        return Err(RejectReason::HashMismatch {
            expected: recalculated,
            found: block.hash.clone(),
        }
        .into());
    }

    if block.index != tip.index + 1 {
        return Err(RejectReason::IndexMismatch {
            expected: tip.index + 1,
            found: block.index,
        }
        .into());
    }

    Ok(())
}

/// Per-transaction checks for a block that already passed consensus.
pub fn validate_block_transactions(block: &Block) -> Result<(), ChainError> {
    let mut seen_ids = HashMap::new();
    let mut rewards = 0usize;

    for (position, tx) in block.transactions.iter().enumerate() {
        tx.validate()?;

        if let Some(first) = seen_ids.insert(tx.transaction_id.as_str(), position) {
            return Err(ChainError::InvalidBlock(format!(
                "Transaction {} appears twice in block {} (positions {} and {})",
                tx.transaction_id, block.index, first, position
            )));
        }

        if tx.is_reward() {
            rewards += 1;
            if tx.amount > block.kemites_reward {
                return Err(ChainError::InvalidBlock(format!(
                    "Reward transaction pays {} but block {} declares {}",
                    tx.amount, block.index, block.kemites_reward
                )));
            }
        }
    }

    if rewards > 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} carries {} reward transactions",
            block.index, rewards
        )));
    }

    Ok(())
}
