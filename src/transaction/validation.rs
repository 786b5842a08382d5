/// Validation logic for transactions separated from type definitions
use crate::capabilities::SignatureVerifier;
use crate::error::{ChainError, Result};
use crate::transaction::types::Transaction;

impl Transaction {
    /// Stateless validation: addresses, amount, id integrity and size.
    /// Does NOT check the signature; see [`Transaction::verify_signature`].
    pub fn validate(&self) -> Result<()> {
        if self.sender.trim().is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Sender address cannot be empty".to_string(),
            ));
        }
        if self.recipient.trim().is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Recipient address cannot be empty".to_string(),
            ));
        }
        // Prevent self-sends
        if self.sender == self.recipient {
            return Err(ChainError::InvalidTransaction(
                "Sender and recipient cannot be the same".to_string(),
            ));
        }
        if self.amount == 0 {
            return Err(ChainError::InvalidTransaction(
                "Transaction amount must be greater than zero".to_string(),
            ));
        }
        if self.is_reward() && self.fee != 0 {
            return Err(ChainError::InvalidTransaction(
                "Reward transactions carry no fee".to_string(),
            ));
        }

        let expected = self.compute_id();
        if self.transaction_id != expected {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction id mismatch. Expected {}, but got {}.",
                expected, self.transaction_id
            )));
        }

        self.validate_size()
    }

    /// Ask the signing collaborator whether `signature` covers this transfer.
    /// Reward transactions are minted by the chain and carry no signature.
    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> Result<()> {
        if self.is_reward() {
            return Ok(());
        }
        if self.signature.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Transaction not signed".to_string(),
            ));
        }
        if !verifier.verify(&self.sender, &self.signable_message(), &self.signature) {
            return Err(ChainError::InvalidTransaction(format!(
                "Signature verification failed for {}",
                self.transaction_id
            )));
        }
        Ok(())
    }
}
