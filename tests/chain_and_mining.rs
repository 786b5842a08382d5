//! Integration tests for block mining, chain acceptance and restart recovery

use kemchain::blockchain::{
    Block, Blockchain, InMemoryBalances, NonceTriple, NoopLedger, GENESIS_PREVIOUS_HASH,
    NONCE_ROLLOVER,
};
use kemchain::config::ChainConfig;
use kemchain::error::{ChainError, RejectReason};
use kemchain::miner::{mine_block, Miner};
use kemchain::persistence::{Database, Persistence};
use kemchain::transaction::{Transaction, KEMITES_PER_KEM};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

fn config(difficulty: u32) -> ChainConfig {
    ChainConfig {
        difficulty,
        ..ChainConfig::default()
    }
}

fn extend(chain: &mut Blockchain, transactions: Vec<Transaction>, miner: &str) -> Block {
    let template = chain
        .next_block_template(transactions, Some(miner), chain.tip().timestamp + 420)
        .unwrap();
    let block = mine_block(template).unwrap();
    chain.append(block.clone()).unwrap();
    block
}

#[test]
fn test_genesis_at_difficulty_two() {
    let chain = Blockchain::new(&config(2)).unwrap();
    let genesis = chain.tip();
    assert_eq!(genesis.index, 0);
    assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
    assert_eq!(genesis.difficulty, 2);
    assert!(genesis.hash.starts_with("00"));
    assert_eq!(genesis.calculate_hash().unwrap(), genesis.hash);
}

#[test]
fn test_nonce_rollover_scenario() {
    let mut nonces = NonceTriple::new(NONCE_ROLLOVER - 1, 0, 0);
    nonces.increment();
    assert_eq!((nonces.nonce1, nonces.nonce2, nonces.nonce3), (0, 1, 0));
}

#[test]
fn test_mined_block_survives_wire_round_trip() {
    let mut chain = Blockchain::new(&config(2)).unwrap();
    let tx = Transaction::new("alice", "bob", 5 * KEMITES_PER_KEM, 1_000, vec![7; 64]).unwrap();
    let block = extend(&mut chain, vec![tx], "miner");

    let json = serde_json::to_string(&block).unwrap();
    let rebuilt: Block = serde_json::from_str(&json).unwrap();
    assert_eq!(rebuilt.calculate_hash().unwrap(), block.hash);
    assert!(rebuilt.hash.starts_with("00"));
}

#[test]
fn test_rejections_leave_chain_untouched() {
    let mut chain = Blockchain::new(&config(1)).unwrap();
    extend(&mut chain, Vec::new(), "miner");
    let before = chain.tip().hash.clone();

    let stale = mine_block(
        Block::new(2, "ab".repeat(32), 1_700_000_900, Vec::new(), 0, 1, "4.0").unwrap(),
    )
    .unwrap();
    assert!(matches!(
        chain.append(stale),
        Err(ChainError::Rejected(RejectReason::PreviousHashMismatch { .. }))
    ));

    let mut tampered = chain
        .next_block_template(Vec::new(), Some("miner"), 1_700_001_000)
        .unwrap();
    tampered = mine_block(tampered).unwrap();
    tampered.kemites_reward += 1;
    assert!(matches!(
        chain.append(tampered),
        Err(ChainError::Rejected(RejectReason::HashMismatch { .. }))
    ));

    assert_eq!(chain.len(), 2);
    assert_eq!(chain.tip().hash, before);
}

#[test]
fn test_duplicate_transaction_in_block_is_rejected() {
    let mut chain = Blockchain::new(&config(1)).unwrap();
    let tx = Transaction::new("alice", "bob", 1, 0, b"sig".to_vec()).unwrap();
    let template = chain
        .next_block_template(vec![tx.clone(), tx], None, 1_700_000_500)
        .unwrap();
    let block = mine_block(template).unwrap();
    assert!(matches!(chain.append(block), Err(ChainError::InvalidBlock(_))));
    assert_eq!(chain.len(), 1);
}

#[test]
fn test_balances_follow_appended_blocks() {
    let mut chain = Blockchain::with_backends(
        &config(1),
        Box::new(InMemoryBalances::new()),
        Arc::new(kemchain::persistence::InMemoryPersistence::new()),
    )
    .unwrap();

    extend(&mut chain, Vec::new(), "alice");
    let reward = ChainConfig::default().block_reward;
    assert_eq!(chain.balance_of("alice"), reward);

    let pay = Transaction::new("alice", "bob", KEMITES_PER_KEM, 500, b"sig".to_vec()).unwrap();
    extend(&mut chain, vec![pay], "carol");
    assert_eq!(chain.balance_of("alice"), reward - KEMITES_PER_KEM - 500);
    assert_eq!(chain.balance_of("bob"), KEMITES_PER_KEM);
    assert_eq!(chain.balance_of("carol"), reward);
    assert_eq!(chain.current_supply, 2 * reward);
}

#[test]
fn test_chain_restores_from_sqlite() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("kemchain.db");
    let tip = {
        let db: Arc<dyn Persistence> = Arc::new(Database::open(&path)?);
        let mut chain = Blockchain::restore(&config(1), Box::new(NoopLedger), db)?;
        for _ in 0..3 {
            extend(&mut chain, Vec::new(), "miner");
        }
        chain.tip().hash.clone()
    };

    let db: Arc<dyn Persistence> = Arc::new(Database::open(&path)?);
    let mut chain = Blockchain::restore(&config(1), Box::new(NoopLedger), db)?;
    assert_eq!(chain.len(), 4);
    assert_eq!(chain.tip().hash, tip);
    assert_eq!(chain.current_supply, 3 * ChainConfig::default().block_reward);

    extend(&mut chain, Vec::new(), "miner");
    assert_eq!(chain.height(), 4);
    Ok(())
}

#[test]
fn test_mining_respects_iteration_cap() {
    let block = Block::new(1, "0", 1_700_000_000, Vec::new(), 0, 64, "4.0").unwrap();
    let result = Miner::new(5_000).mine(block, &AtomicBool::new(false));
    assert!(matches!(
        result,
        Err(ChainError::MiningExhausted { iterations: 5_000 })
    ));
}
