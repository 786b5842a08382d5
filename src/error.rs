//! Error types for the ledger

use std::fmt;
use thiserror::Error;

/// Why a block failed the consensus checks in [`crate::blockchain::Blockchain::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    PreviousHashMismatch { expected: String, found: String },
    DifficultyMismatch { expected: u32, found: u32 },
    ProofOfWorkUnmet { hash: String, difficulty: u32 },
    HashMismatch { expected: String, found: String },
    IndexMismatch { expected: u64, found: u64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RejectReason::PreviousHashMismatch { expected, found } => write!(
                f,
                "previous hash mismatch (expected {}, found {})",
                expected, found
            ),
            RejectReason::DifficultyMismatch { expected, found } => write!(
                f,
                "difficulty mismatch (expected {}, found {})",
                expected, found
            ),
            RejectReason::ProofOfWorkUnmet { hash, difficulty } => write!(
                f,
                "proof of work unmet (hash {}, difficulty {})",
                hash, difficulty
            ),
            RejectReason::HashMismatch { expected, found } => {
                write!(f, "hash mismatch (expected {}, found {})", expected, found)
            }
            RejectReason::IndexMismatch { expected, found } => {
                write!(f, "index mismatch (expected {}, found {})", expected, found)
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Block rejected: {0}")]
    Rejected(RejectReason),
    #[error("Mining gave up after {iterations} iterations")]
    MiningExhausted { iterations: u64 },
    #[error("Mining cancelled")]
    MiningCancelled,
    #[error("Mempool is full")]
    MempoolFull,
    #[error("Insufficient funds: {address} holds {balance}, needs {required}")]
    InsufficientFunds {
        address: String,
        balance: u64,
        required: u64,
    },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl ChainError {
    /// Consensus rejections and malformed input, as opposed to local faults.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChainError::Rejected(_) | ChainError::InvalidBlock(_) | ChainError::InvalidTransaction(_)
        )
    }
}

impl From<RejectReason> for ChainError {
    fn from(reason: RejectReason) -> Self {
        ChainError::Rejected(reason)
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
