use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use sha2::{Digest, Sha256};

/// Each nonce rolls into the next one when it reaches this value.
pub const NONCE_ROLLOVER: u64 = 1_000_000;

pub const DEFAULT_VERSION: &str = "4.0";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Three chained counters; together they extend the search space far beyond
/// a single counter's rollover point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceTriple {
    pub nonce1: u64,
    pub nonce2: u64,
    pub nonce3: u64,
}

impl NonceTriple {
    pub fn new(nonce1: u64, nonce2: u64, nonce3: u64) -> Self {
        Self {
            nonce1,
            nonce2,
            nonce3,
        }
    }

    pub fn increment(&mut self) {
        self.nonce1 += 1;
        if self.nonce1 >= NONCE_ROLLOVER {
            self.nonce1 = 0;
            self.nonce2 += 1;
            if self.nonce2 >= NONCE_ROLLOVER {
                self.nonce2 = 0;
                self.nonce3 += 1;
            }
        }
    }
}

/// Wire and storage form of a block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Order is significant for hashing.
    pub transactions: Vec<Transaction>,
    pub kemites_reward: u64,
    pub nonce1: u64,
    pub nonce2: u64,
    pub nonce3: u64,
    pub difficulty: u32,
    #[serde(default = "default_version")]
    pub version: String,
    pub hash: String,
}

/// Hashing state for one block's static content, built once per mining
/// attempt and cloned for every nonce trial.
#[derive(Clone)]
pub struct ContentHasher {
    base: Sha256,
}

impl ContentHasher {
    pub fn new(block: &Block) -> Result<Self> {
        let mut base = Sha256::new();
        base.update(block.static_content()?.as_bytes());
        Ok(Self { base })
    }

    pub fn hash(&self, nonces: NonceTriple) -> String {
        let mut hasher = self.base.clone();
        hasher.update(
            format!(
                "|{}|{}|{}",
                nonces.nonce1, nonces.nonce2, nonces.nonce3
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

impl Block {
    /// An unmined block: nonces start at zero and `hash` matches them.
    pub fn new(
        index: u64,
        previous_hash: impl Into<String>,
        timestamp: i64,
        transactions: Vec<Transaction>,
        kemites_reward: u64,
        difficulty: u32,
        version: impl Into<String>,
    ) -> Result<Self> {
        let mut block = Block {
            index,
            previous_hash: previous_hash.into(),
            timestamp,
            transactions,
            kemites_reward,
            nonce1: 0,
            nonce2: 0,
            nonce3: 0,
            difficulty,
            version: version.into(),
            hash: String::new(),
        };
        block.hash = block.calculate_hash()?;
        Ok(block)
    }

    pub fn nonces(&self) -> NonceTriple {
        NonceTriple::new(self.nonce1, self.nonce2, self.nonce3)
    }

    pub fn set_nonces(&mut self, nonces: NonceTriple) {
        self.nonce1 = nonces.nonce1;
        self.nonce2 = nonces.nonce2;
        self.nonce3 = nonces.nonce3;
    }

    /// Every hashed field except the nonces, in canonical order. Transactions
    /// are serialized as JSON with sorted object keys.
    pub fn static_content(&self) -> Result<String> {
        let transactions = serde_json::to_value(&self.transactions)
            .map_err(|e| ChainError::Serialization(format!("transactions: {}", e)))?;
        Ok(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.index,
            self.previous_hash,
            self.timestamp,
            transactions,
            self.kemites_reward,
            self.difficulty,
            self.version
        ))
    }

    pub fn calculate_hash(&self) -> Result<String> {
        Ok(ContentHasher::new(self)?.hash(self.nonces()))
    }

    /// Recompute the hash and compare it with the stored one.
    pub fn has_valid_hash(&self) -> Result<bool> {
        Ok(self.calculate_hash()? == self.hash)
    }

    pub fn meets_difficulty(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    pub fn reward_transaction(&self) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.is_reward())
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }

    pub fn to_ref(&self) -> BlockRef {
        BlockRef {
            index: self.index,
            hash: self.hash.clone(),
        }
    }
}

/// A lightweight pointer to a block, kept alongside admission entries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockRef {
    pub index: u64,
    pub hash: String,
}

/// True when the hex digest starts with `difficulty` zero characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let tx = Transaction::new("alice", "bob", 250, 5, b"sig".to_vec()).unwrap();
        Block::new(3, "ab".repeat(32), 1_700_000_123, vec![tx], 7_700_000_000, 1, "4.0").unwrap()
    }

    #[test]
    fn test_nonce_rollover() {
        let mut nonces = NonceTriple::new(NONCE_ROLLOVER - 1, 0, 0);
        nonces.increment();
        assert_eq!(nonces, NonceTriple::new(0, 1, 0));

        let mut nonces = NonceTriple::new(NONCE_ROLLOVER - 1, NONCE_ROLLOVER - 1, 4);
        nonces.increment();
        assert_eq!(nonces, NonceTriple::new(0, 0, 5));
    }

    #[test]
    fn test_hash_is_reproducible() {
        let block = sample_block();
        assert_eq!(block.hash.len(), 64);
        assert!(block.has_valid_hash().unwrap());

        let json = serde_json::to_string(&block).unwrap();
        let rebuilt: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(rebuilt.calculate_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_every_field_is_hashed() {
        let block = sample_block();

        let mut changed = block.clone();
        changed.nonce2 = 1;
        assert_ne!(changed.calculate_hash().unwrap(), block.hash);

        let mut changed = block.clone();
        changed.version = "5.0".to_string();
        assert_ne!(changed.calculate_hash().unwrap(), block.hash);

        let mut changed = block.clone();
        changed.kemites_reward += 1;
        assert_ne!(changed.calculate_hash().unwrap(), block.hash);

        let mut changed = block.clone();
        changed.transactions[0].fee = 6;
        assert_ne!(changed.calculate_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_transaction_order_matters() {
        let a = Transaction::new("alice", "bob", 1, 0, b"a".to_vec()).unwrap();
        let b = Transaction::new("carol", "dave", 2, 0, b"b".to_vec()).unwrap();
        let first = Block::new(1, "0", 10, vec![a.clone(), b.clone()], 0, 0, "4.0").unwrap();
        let second = Block::new(1, "0", 10, vec![b, a], 0, 0, "4.0").unwrap();
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn test_content_hasher_matches_full_hash() {
        let mut block = sample_block();
        let hasher = ContentHasher::new(&block).unwrap();
        let nonces = NonceTriple::new(41, 2, 0);
        block.set_nonces(nonces);
        assert_eq!(hasher.hash(nonces), block.calculate_hash().unwrap());
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(meets_difficulty("00ab", 0));
        assert!(!meets_difficulty("0a0b", 2));
        assert!(!meets_difficulty("00", 3));
    }

    #[test]
    fn test_missing_version_defaults() {
        let block = sample_block();
        let mut value = serde_json::to_value(&block).unwrap();
        value.as_object_mut().unwrap().remove("version");
        let parsed: Block = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.version, DEFAULT_VERSION);
    }
}
