/// Transaction types for the ledger
use crate::error::{ChainError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// 1 KEM = 10^8 kemites
pub const KEMITES_PER_KEM: u64 = 100_000_000;

/// Sender of the per-block reward transaction.
pub const REWARD_SENDER: &str = "BLOCKCHAIN_REWARD";

/// A value transfer between two addresses, amounts in kemites.
///
/// `signature` is opaque: it is produced by the wallet collaborator and only
/// ever checked through a [`crate::capabilities::SignatureVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    #[serde(default)]
    pub fee: u64,
    #[serde(with = "hex_bytes", default)]
    pub signature: Vec<u8>,
    pub transaction_id: String,
    /// Enrichment from the categorization collaborator. Not part of the id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Transaction {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: u64,
        fee: u64,
        signature: Vec<u8>,
    ) -> Result<Self> {
        let mut tx = Transaction {
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
            fee,
            signature,
            transaction_id: String::new(),
            metadata: BTreeMap::new(),
        };
        tx.transaction_id = tx.compute_id();
        tx.validate()?;
        Ok(tx)
    }

    /// The reward paid to `recipient` by the block at `index`.
    pub fn reward(recipient: impl Into<String>, amount: u64, index: u64) -> Self {
        let mut tx = Transaction {
            sender: REWARD_SENDER.to_string(),
            recipient: recipient.into(),
            amount,
            fee: 0,
            signature: format!("reward_{}", index).into_bytes(),
            transaction_id: String::new(),
            metadata: BTreeMap::new(),
        };
        tx.transaction_id = tx.compute_id();
        tx
    }

    pub fn is_reward(&self) -> bool {
        self.sender == REWARD_SENDER
    }

    /// SHA-256 over sender, recipient, amount, fee and signature.
    pub fn compute_id(&self) -> String {
        let mut hasher = Sha256::new();
        update_with_len(&mut hasher, self.sender.as_bytes());
        update_with_len(&mut hasher, self.recipient.as_bytes());
        hasher.update(self.amount.to_le_bytes());
        hasher.update(self.fee.to_le_bytes());
        update_with_len(&mut hasher, &self.signature);
        hex::encode(hasher.finalize())
    }

    /// Bytes the wallet signs: everything that moves value, nothing else.
    pub fn signable_message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice("TRANSFER:".as_bytes());
        message.extend_from_slice(self.sender.as_bytes());
        message.extend_from_slice(b"->");
        message.extend_from_slice(self.recipient.as_bytes());
        message.extend_from_slice(&self.amount.to_le_bytes());
        message.extend_from_slice(&self.fee.to_le_bytes());
        message
    }

    /// Amount debited from the sender.
    pub fn total_cost(&self) -> u64 {
        self.amount.saturating_add(self.fee)
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<()> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }
}

fn update_with_len(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Hex encoding for opaque byte fields on the wire.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
