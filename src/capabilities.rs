//! Contracts for the upstream collaborators the ledger consumes but does not
//! implement: signing, content categorization and external anchoring.
//!
//! The balance ledger contract lives with the chain state in
//! [`crate::blockchain::BalanceLedger`].

use crate::error::Result;
use std::collections::BTreeMap;

/// Signature checking supplied by the wallet layer. Signature bytes are
/// opaque to the ledger.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signer: &str, message: &[u8], signature: &[u8]) -> bool;
}

/// Accepts any non-empty signature. For nodes that receive transactions only
/// from a gateway which has already verified them.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnverifiedSignatures;

impl SignatureVerifier for UnverifiedSignatures {
    fn verify(&self, _signer: &str, _message: &[u8], signature: &[u8]) -> bool {
        !signature.is_empty()
    }
}

/// Enriches transaction metadata (e.g. a content category) before admission.
pub trait ContentCategorizer: Send + Sync {
    fn categorize(
        &self,
        content: &str,
        metadata: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String>;
}

/// Submits data to an external settlement chain and returns its reference
/// (for example a transaction id on that chain).
pub trait AnchorSubmitter: Send + Sync {
    fn submit(&self, data: &[u8]) -> Result<String>;
}
