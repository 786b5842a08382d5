use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::HashMap;

/// Balance bookkeeping applied by the chain for every accepted block.
///
/// `apply` must leave the ledger untouched when it fails; `revert` undoes a
/// previously successful `apply` and is used to unwind a partially applied
/// block.
pub trait BalanceLedger: Send + Sync {
    fn apply(&mut self, tx: &Transaction) -> Result<(), ChainError>;
    fn revert(&mut self, tx: &Transaction);
    fn balance_of(&self, address: &str) -> u64;
}

/// Accounting is handled outside the node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLedger;

impl BalanceLedger for NoopLedger {
    fn apply(&mut self, _tx: &Transaction) -> Result<(), ChainError> {
        Ok(())
    }

    fn revert(&mut self, _tx: &Transaction) {}

    fn balance_of(&self, _address: &str) -> u64 {
        0
    }
}

/// Account balances held in memory. Rewards mint to the recipient; transfers
/// debit amount plus fee from the sender.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBalances {
    pub address_balances: HashMap<String, u64>,
}

impl InMemoryBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&mut self, address: &str, amount: u64) {
        let balance = self.address_balances.entry(address.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    fn debit(&mut self, address: &str, amount: u64) {
        if let Some(balance) = self.address_balances.get_mut(address) {
            *balance = balance.saturating_sub(amount);
        }
    }
}

impl BalanceLedger for InMemoryBalances {
    fn apply(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        if !tx.is_reward() {
            let required = tx.total_cost();
            let balance = self.balance_of(&tx.sender);
            if balance < required {
                return Err(ChainError::InsufficientFunds {
                    address: tx.sender.clone(),
                    balance,
                    required,
                });
            }
            self.debit(&tx.sender, required);
        }
        self.credit(&tx.recipient, tx.amount);
        Ok(())
    }

    fn revert(&mut self, tx: &Transaction) {
        self.debit(&tx.recipient, tx.amount);
        if !tx.is_reward() {
            self.credit(&tx.sender, tx.total_cost());
        }
    }

    fn balance_of(&self, address: &str) -> u64 {
        self.address_balances.get(address).copied().unwrap_or(0)
    }
}
