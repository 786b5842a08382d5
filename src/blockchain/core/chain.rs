use crate::blockchain::core::block::{Block, BlockRef};
use crate::blockchain::core::state::{BalanceLedger, NoopLedger};
use crate::blockchain::core::validation::{validate_block_transactions, validate_consensus};
use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use crate::miner::Miner;
use crate::persistence::{InMemoryPersistence, Persistence};
use crate::transaction::Transaction;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

/// Linear, single-writer chain. There is no fork choice: a block either
/// extends the tip or is rejected.
pub struct Blockchain {
    /// Never empty; the genesis block is pushed at construction.
    pub blocks: Vec<Block>,
    pub difficulty: u32,
    pub version: String,
    pub block_reward: u64,
    pub current_supply: u64,
    pub max_supply: u64,
    random_intervals: Vec<u64>,
    next_bonus_block: u64,
    /// Ids of every transaction in the chain.
    included: HashSet<String>,
    balances: Box<dyn BalanceLedger>,
    persistence: Arc<dyn Persistence>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("height", &self.height())
            .field("tip", &self.tip().hash)
            .field("difficulty", &self.difficulty)
            .field("current_supply", &self.current_supply)
            .field("next_bonus_block", &self.next_bonus_block)
            .finish()
    }
}

impl Blockchain {
    /// In-memory chain with no balance accounting.
    pub fn new(config: &ChainConfig) -> Result<Self> {
        Self::with_backends(
            config,
            Box::new(NoopLedger),
            Arc::new(InMemoryPersistence::new()),
        )
    }

    /// Fresh chain holding only the genesis block, which is persisted.
    pub fn with_backends(
        config: &ChainConfig,
        balances: Box<dyn BalanceLedger>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        let genesis = Self::create_genesis_block(config)?;
        if let Err(e) = persistence.save_block(&genesis) {
            warn!("Failed to persist genesis block: {}", e);
        }
        Ok(Self::from_genesis(config, genesis, balances, persistence))
    }

    /// Rebuild the chain from persisted blocks, re-running every acceptance
    /// rule. Stored blocks after the first invalid one are ignored.
    pub fn restore(
        config: &ChainConfig,
        balances: Box<dyn BalanceLedger>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        let stored = persistence.load_blocks()?;
        let Some(stored_genesis) = stored.first() else {
            info!("No stored blocks, starting a new chain");
            return Self::with_backends(config, balances, persistence);
        };

        let genesis = Self::create_genesis_block(config)?;
        if stored_genesis.hash != genesis.hash {
            return Err(ChainError::InvalidBlock(format!(
                "Stored genesis {} does not match configured genesis {}",
                stored_genesis.hash, genesis.hash
            )));
        }

        let mut chain = Self::from_genesis(config, genesis, balances, persistence);
        for block in stored.into_iter().skip(1) {
            let index = block.index;
            if let Err(e) = chain.accept(block, false) {
                warn!("Stored block {} failed re-validation, truncating: {}", index, e);
                break;
            }
        }
        info!(
            "Restored chain at height {} (tip {})",
            chain.height(),
            chain.tip().hash
        );
        Ok(chain)
    }

    fn from_genesis(
        config: &ChainConfig,
        genesis: Block,
        balances: Box<dyn BalanceLedger>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let mut chain = Blockchain {
            blocks: vec![genesis],
            difficulty: config.difficulty,
            version: config.version.clone(),
            block_reward: config.block_reward,
            current_supply: 0,
            max_supply: config.max_supply_kemites(),
            random_intervals: config.random_intervals.clone(),
            next_bonus_block: 0,
            included: HashSet::new(),
            balances,
            persistence,
        };
        chain.next_bonus_block = chain.sample_bonus_block();
        chain
    }

    /// Deterministic for a given difficulty and version, so every node with
    /// the same configuration shares a genesis hash.
    pub fn create_genesis_block(config: &ChainConfig) -> Result<Block> {
        let genesis = Block::new(
            0,
            GENESIS_PREVIOUS_HASH,
            GENESIS_TIMESTAMP,
            Vec::new(),
            0,
            config.difficulty,
            config.version.clone(),
        )?;
        let never = AtomicBool::new(false);
        Miner::new(config.max_mining_iterations).mine(genesis, &never)
    }

    pub fn tip(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn tip_ref(&self) -> BlockRef {
        self.tip().to_ref()
    }

    pub fn height(&self) -> u64 {
        self.tip().index
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains_transaction(&self, transaction_id: &str) -> bool {
        self.included.contains(transaction_id)
    }

    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    /// Validate and append a block. Nothing changes unless every check passes.
    pub fn append(&mut self, block: Block) -> Result<()> {
        self.accept(block, true)
    }

    fn accept(&mut self, block: Block, persist: bool) -> Result<()> {
        if let Err(e) = validate_consensus(self.tip(), self.difficulty, &block) {
            warn!("Rejected block {} ({}): {}", block.index, block.hash, e);
            return Err(e);
        }
        validate_block_transactions(&block)?;
        if let Some(tx) = block
            .transactions
            .iter()
            .find(|tx| self.included.contains(&tx.transaction_id))
        {
            warn!(
                "Rejected block {}: transaction {} is already in the chain",
                block.index, tx.transaction_id
            );
            return Err(ChainError::InvalidBlock(format!(
                "Transaction {} in block {} was already included",
                tx.transaction_id, block.index
            )));
        }

        let minted = block.reward_transaction().map_or(0, |tx| tx.amount);
        if minted > self.remaining_supply() {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} mints {} kemites but only {} remain",
                block.index,
                minted,
                self.remaining_supply()
            )));
        }

        self.apply_transactions(&block)?;
        self.current_supply += minted;

        if persist {
            if let Err(e) = self.persistence.save_block(&block) {
                warn!("Failed to persist block {}: {}", block.index, e);
            }
        }

        info!(
            "Appended block {} ({} transactions, hash {})",
            block.index,
            block.transactions.len(),
            block.hash
        );
        let index = block.index;
        self.included
            .extend(block.transactions.iter().map(|tx| tx.transaction_id.clone()));
        self.blocks.push(block);

        if index >= self.next_bonus_block {
            self.next_bonus_block = self.sample_bonus_block();
            debug!("Next bonus block at {}", self.next_bonus_block);
        }
        Ok(())
    }

    fn apply_transactions(&mut self, block: &Block) -> Result<()> {
        let mut applied: Vec<&Transaction> = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if let Err(e) = self.balances.apply(tx) {
                for done in applied.iter().rev() {
                    self.balances.revert(done);
                }
                warn!(
                    "Block {} transaction {} failed to apply: {}",
                    block.index, tx.transaction_id, e
                );
                return Err(e);
            }
            applied.push(tx);
        }
        Ok(())
    }

    fn sample_bonus_block(&self) -> u64 {
        let interval = self
            .random_intervals
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(0);
        self.blocks.len() as u64 + interval
    }

    pub fn remaining_supply(&self) -> u64 {
        self.max_supply.saturating_sub(self.current_supply)
    }

    /// The configured reward, clamped so the supply cap is never exceeded.
    pub fn next_block_reward(&self) -> u64 {
        self.block_reward.min(self.remaining_supply())
    }

    pub fn next_bonus_block(&self) -> u64 {
        self.next_bonus_block
    }

    pub fn is_bonus_block(&self, index: u64) -> bool {
        index == self.next_bonus_block
    }

    /// Bonus blocks pay a random active miner; all others pay the first.
    pub fn select_beneficiary(&self, index: u64, active_miners: &[String]) -> Option<String> {
        if self.is_bonus_block(index) {
            active_miners.choose(&mut rand::thread_rng()).cloned()
        } else {
            active_miners.first().cloned()
        }
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.balances.balance_of(address)
    }

    /// Unmined candidate on top of the tip. A reward transaction is prepended
    /// when a beneficiary is given and supply remains.
    pub fn next_block_template(
        &self,
        mut transactions: Vec<Transaction>,
        beneficiary: Option<&str>,
        timestamp: i64,
    ) -> Result<Block> {
        let index = self.height() + 1;
        let mut reward = 0;
        if let Some(beneficiary) = beneficiary {
            reward = self.next_block_reward();
            if reward > 0 {
                transactions.insert(0, Transaction::reward(beneficiary, reward, index));
            }
        }
        Block::new(
            index,
            self.tip().hash.clone(),
            timestamp,
            transactions,
            reward,
            self.difficulty,
            self.version.clone(),
        )
    }
}
