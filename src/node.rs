//! Node orchestration: the shared context every handler receives, plus the
//! long-running server, maintenance and miner tasks.

use crate::admission::{Admission, AdmissionControl, NetworkCondition};
use crate::anchor::{AnchorRecord, AnchorStore};
use crate::blockchain::{Block, Blockchain, NoopLedger};
use crate::capabilities::{AnchorSubmitter, ContentCategorizer, SignatureVerifier, UnverifiedSignatures};
use crate::config::Config;
use crate::error::{ChainError, Result};
use crate::mempool::Mempool;
use crate::miner::Miner;
use crate::network::{NetworkNode, PeerAddr, Status, MAX_FRAME_LEN};
use crate::persistence::{Database, InMemoryPersistence, Persistence};
use crate::transaction::Transaction;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Pool load at or above which the network counts as congested.
const CONGESTED_LOAD: f64 = 0.75;
/// Pool load at or below which the network counts as smooth.
const SMOOTH_LOAD: f64 = 0.25;
const MINER_POLL: Duration = Duration::from_secs(1);
/// Frame space kept free for the block header fields and the reward.
const BLOCK_HEADROOM: usize = 64 * 1024;

/// Metadata key whose value is handed to the categorizer as content.
const CONTENT_KEY: &str = "content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Ready,
}

struct MiningJob {
    height: u64,
    cancel: Arc<AtomicBool>,
}

/// Upstream capabilities the node consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn SignatureVerifier>,
    pub categorizer: Option<Arc<dyn ContentCategorizer>>,
    pub anchor_submitter: Option<Arc<dyn AnchorSubmitter>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            verifier: Arc::new(UnverifiedSignatures),
            categorizer: None,
            anchor_submitter: None,
        }
    }
}

/// Everything a request handler may touch. Built once and passed explicitly.
pub struct NodeContext {
    pub chain: RwLock<Blockchain>,
    pub mempool: RwLock<Mempool>,
    pub admission: AdmissionControl,
    pub anchors: AnchorStore,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub categorizer: Option<Arc<dyn ContentCategorizer>>,
    pub miners: Vec<String>,
    pub max_block_transactions: usize,
    pub max_mining_iterations: u64,
    mining_job: parking_lot::Mutex<Option<MiningJob>>,
}

impl NodeContext {
    pub fn new(
        chain: Blockchain,
        admission: AdmissionControl,
        config: &Config,
        collaborators: &Collaborators,
    ) -> Self {
        Self {
            chain: RwLock::new(chain),
            mempool: RwLock::new(Mempool::new(config.admission.mempool_capacity)),
            admission,
            anchors: AnchorStore::new(),
            verifier: collaborators.verifier.clone(),
            categorizer: collaborators.categorizer.clone(),
            miners: config.miner.beneficiaries.clone(),
            max_block_transactions: config.chain.max_block_transactions,
            max_mining_iterations: config.chain.max_mining_iterations,
            mining_job: parking_lot::Mutex::new(None),
        }
    }

    /// Admission flow shared by local submission and the wire handler.
    pub async fn admit_transaction(&self, mut tx: Transaction) -> Status {
        if tx.is_reward() {
            warn!("Refusing reward transaction {} outside a block", tx.transaction_id);
            return Status::Invalid;
        }
        if let Err(e) = tx.validate().and_then(|_| tx.verify_signature(self.verifier.as_ref())) {
            warn!("Transaction {} is invalid: {}", tx.transaction_id, e);
            return Status::Invalid;
        }

        if let Some(categorizer) = &self.categorizer {
            let content = tx.metadata.get(CONTENT_KEY).cloned().unwrap_or_default();
            tx.metadata = categorizer.categorize(&content, &tx.metadata);
        }

        let tip = self.chain.read().await.tip_ref();
        let id = tx.transaction_id.clone();
        self.admission.log(&id, tip);

        let mut mempool = self.mempool.write().await;
        let admission = self.admission.validate(&id);
        if admission != Admission::Valid {
            return admission.into();
        }

        match mempool.add_transaction(tx) {
            Ok(()) => {
                if let Err(e) = self.admission.mark_completed(&id) {
                    error!("Admitted transaction {} lost its log entry: {}", id, e);
                }
                info!("Transaction {} admitted", id);
                Status::Success
            }
            Err(e) => {
                warn!("Transaction {} not pooled: {}", id, e);
                Status::Failed
            }
        }
    }

    /// Append a block and do the bookkeeping that follows acceptance.
    pub async fn receive_block(&self, block: Block) -> Result<()> {
        self.chain.write().await.append(block.clone())?;

        let removed = self.mempool.write().await.remove_included(&block);
        record_included(&self.admission, &block);
        debug!(
            "Block {} cleared {} pooled transactions",
            block.index, removed
        );
        self.cancel_stale_mining(block.index);
        Ok(())
    }

    fn cancel_stale_mining(&self, appended_height: u64) {
        if let Some(job) = self.mining_job.lock().as_ref() {
            if job.height <= appended_height && !job.cancel.swap(true, Ordering::Relaxed) {
                info!(
                    "Block {} accepted, cancelling mining at height {}",
                    appended_height, job.height
                );
            }
        }
    }

    /// Fee-ordered candidate on top of the tip, or `None` with an empty pool.
    pub async fn assemble_candidate(&self) -> Result<Option<Block>> {
        let pooled = self
            .mempool
            .read()
            .await
            .get_transactions_by_fee(self.max_block_transactions);
        let transactions = fit_within_frame(pooled)?;
        if transactions.is_empty() {
            return Ok(None);
        }

        let chain = self.chain.read().await;
        let index = chain.height() + 1;
        let beneficiary = chain.select_beneficiary(index, &self.miners);
        if chain.is_bonus_block(index) {
            info!("Block {} is a bonus block, paying {:?}", index, beneficiary);
        }
        let timestamp = chrono::Utc::now().timestamp();
        chain
            .next_block_template(transactions, beneficiary.as_deref(), timestamp)
            .map(Some)
    }

    /// Mine on a blocking worker. Cancelled when a block at this height or
    /// above is appended meanwhile.
    pub async fn mine(&self, candidate: Block) -> Result<Block> {
        let cancel = Arc::new(AtomicBool::new(false));
        *self.mining_job.lock() = Some(MiningJob {
            height: candidate.index,
            cancel: cancel.clone(),
        });

        let miner = Miner::new(self.max_mining_iterations);
        let result = tokio::task::spawn_blocking(move || miner.mine(candidate, &cancel)).await;
        *self.mining_job.lock() = None;

        result.map_err(|e| ChainError::IoError(format!("Mining worker failed: {}", e)))?
    }
}

/// Keep fee order but drop transactions that would push the encoded block
/// past one peer frame.
fn fit_within_frame(candidates: Vec<Transaction>) -> Result<Vec<Transaction>> {
    let budget = MAX_FRAME_LEN - BLOCK_HEADROOM;
    let mut used = 0;
    let mut selected = Vec::with_capacity(candidates.len());
    for tx in candidates {
        let size = serde_json::to_vec(&tx)?.len() + 1;
        if used + size > budget {
            debug!(
                "Transaction {} ({} bytes) left for a later block",
                tx.transaction_id, size
            );
            continue;
        }
        used += size;
        selected.push(tx);
    }
    Ok(selected)
}

/// Log and complete every transaction of an accepted block, so replays of it
/// classify as duplicates.
fn record_included(admission: &AdmissionControl, block: &Block) {
    let block_ref = block.to_ref();
    for tx in &block.transactions {
        admission.log(&tx.transaction_id, block_ref.clone());
        if let Err(e) = admission.mark_completed(&tx.transaction_id) {
            error!(
                "Transaction {} of block {} lost its log entry: {}",
                tx.transaction_id, block.index, e
            );
        }
    }
}

pub struct Node {
    pub config: Config,
    pub ctx: Arc<NodeContext>,
    pub network: Arc<NetworkNode>,
    pub persistence: Arc<dyn Persistence>,
    pub state: RwLock<NodeState>,
    anchor_submitter: Option<Arc<dyn AnchorSubmitter>>,
}

impl Node {
    pub fn init(config: Config) -> Result<Self> {
        Self::init_with(config, Collaborators::default())
    }

    pub fn init_with(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let persistence: Arc<dyn Persistence> = match Database::open(&config.database.path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(
                    "Failed to open DB at {}: {}. Falling back to in-memory persistence.",
                    config.database.path, e
                );
                Arc::new(InMemoryPersistence::new())
            }
        };
        Self::with_persistence(config, collaborators, persistence)
    }

    pub fn with_persistence(
        config: Config,
        collaborators: Collaborators,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        let mut persistence = persistence;
        let chain =
            match Blockchain::restore(&config.chain, Box::new(NoopLedger), persistence.clone()) {
                Ok(chain) => chain,
                Err(e) => {
                    warn!(
                        "Failed to restore chain from storage: {}. Falling back to in-memory persistence.",
                        e
                    );
                    persistence = Arc::new(InMemoryPersistence::new());
                    Blockchain::with_backends(
                        &config.chain,
                        Box::new(NoopLedger),
                        persistence.clone(),
                    )?
                }
            };

        let admission = AdmissionControl::new(&config.admission);
        match persistence.load_ledger_snapshot() {
            Ok(Some(snapshot)) => admission.restore(snapshot),
            Ok(None) => debug!("No admission snapshot stored"),
            Err(e) => warn!("Failed to load admission snapshot: {}", e),
        }
        // The snapshot may predate the newest stored blocks.
        for block in &chain.blocks {
            record_included(&admission, block);
        }

        let ctx = Arc::new(NodeContext::new(chain, admission, &config, &collaborators));
        let network = Arc::new(NetworkNode::new(ctx.clone(), &config.network));

        Ok(Self {
            config,
            ctx,
            network,
            persistence,
            state: RwLock::new(NodeState::Booting),
            anchor_submitter: collaborators.anchor_submitter,
        })
    }

    /// Bind the listener and spawn the server, maintenance and miner tasks.
    /// Returns the bound address.
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.network.listen_addr)
            .await
            .map_err(|e| {
                ChainError::NetworkError(format!(
                    "P2P address {} unavailable: {}",
                    self.config.network.listen_addr, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let network = self.network.clone();
        tokio::spawn(async move {
            if let Err(e) = network.start_server(listener).await {
                error!("P2P server failed: {}", e);
            }
        });

        for peer in &self.config.network.bootstrap_peers {
            match peer.parse::<PeerAddr>() {
                Ok(peer) => {
                    self.network.add_peer(peer.clone()).await;
                    let network = self.network.clone();
                    tokio::spawn(async move {
                        let _ = network.request_anchor_sync(&peer).await;
                    });
                }
                Err(e) => warn!("Ignoring bootstrap peer {}: {}", peer, e),
            }
        }

        let node = self.clone();
        tokio::spawn(async move { node.maintenance_loop().await });

        if self.config.miner.enabled {
            let node = self.clone();
            tokio::spawn(async move { node.miner_loop().await });
        }

        *self.state.write().await = NodeState::Ready;
        info!(
            "Node ready on {} at height {}",
            local_addr,
            self.ctx.chain.read().await.height()
        );
        Ok(local_addr)
    }

    /// Local submission: admit, then gossip on success.
    pub async fn submit_transaction(&self, tx: Transaction) -> Status {
        let status = self.ctx.admit_transaction(tx.clone()).await;
        if status == Status::Success {
            let report = self.network.broadcast_transaction(&tx).await;
            debug!("Transaction {} broadcast: {:?}", tx.transaction_id, report);
        }
        status
    }

    /// Mine one block from the pool, append it and broadcast it.
    pub async fn mine_pending(&self) -> Result<Option<Block>> {
        let Some(candidate) = self.ctx.assemble_candidate().await? else {
            return Ok(None);
        };
        let block = self.ctx.mine(candidate).await?;
        self.ctx.receive_block(block.clone()).await?;
        info!("Mined block {} ({})", block.index, block.hash);

        let report = self.network.broadcast_block(&block).await;
        debug!("Block {} broadcast: {:?}", block.index, report);

        let anchor = &self.config.anchor;
        if anchor.enabled
            && self.anchor_submitter.is_some()
            && anchor.interval_blocks > 0
            && block.index % anchor.interval_blocks == 0
        {
            if let Err(e) = self.anchor_tip().await {
                warn!("Anchoring block {} failed: {}", block.index, e);
            }
        }
        Ok(Some(block))
    }

    /// Submit the tip hash to the settlement collaborator and announce the
    /// resulting anchor.
    pub async fn anchor_tip(&self) -> Result<AnchorRecord> {
        let submitter = self
            .anchor_submitter
            .clone()
            .ok_or_else(|| ChainError::ConfigError("No anchor submitter installed".to_string()))?;
        let tip = self.ctx.chain.read().await.tip().clone();

        let data = tip.hash.clone();
        let reference = tokio::task::spawn_blocking(move || submitter.submit(data.as_bytes()))
            .await
            .map_err(|e| ChainError::IoError(format!("Anchor worker failed: {}", e)))?
            .map_err(|e| {
                error!("Failed to anchor block {}: {}", tip.index, e);
                e
            })?;

        let record = AnchorRecord::new(
            reference,
            tip.hash.clone(),
            Some(tip.index),
            u32::from(self.config.network.anchor_ttl),
        );
        self.ctx.anchors.insert(record.clone());
        info!("Anchored block {} as {}", tip.index, record.reference);
        self.network.announce_anchor(&record).await;
        Ok(record)
    }

    /// One maintenance pass: recover quiet peers, adapt the timeout to pool
    /// load, persist the admission snapshot.
    pub async fn run_maintenance(&self) {
        let recovered = self.ctx.admission.recover_failed_nodes();
        if !recovered.is_empty() {
            debug!("Recovered peers: {:?}", recovered);
        }

        let load = self.ctx.mempool.read().await.load();
        if load >= CONGESTED_LOAD {
            self.ctx.admission.adapt_timeout(NetworkCondition::Congested);
        } else if load <= SMOOTH_LOAD {
            self.ctx.admission.adapt_timeout(NetworkCondition::Smooth);
        }

        if let Err(e) = self
            .persistence
            .save_ledger_snapshot(&self.ctx.admission.snapshot())
        {
            warn!("Failed to persist admission snapshot: {}", e);
        }
        self.ctx.admission.log_activity();
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.admission.maintenance_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.run_maintenance().await;
        }
    }

    /// Mines whenever the pool is non-empty and either `block_time` has passed
    /// since the last block or a full block's worth of transactions waits.
    async fn miner_loop(self: Arc<Self>) {
        let block_time = Duration::from_secs(self.config.chain.block_time);
        let mut last_block: Option<Instant> = None;
        loop {
            tokio::time::sleep(MINER_POLL).await;
            let pending = self.ctx.mempool.read().await.len();
            if pending == 0 {
                continue;
            }
            let waiting = last_block.is_some_and(|at| at.elapsed() < block_time);
            if waiting && pending < self.ctx.max_block_transactions {
                continue;
            }
            match self.mine_pending().await {
                Ok(Some(_)) => last_block = Some(Instant::now()),
                Ok(None) => {}
                Err(ChainError::MiningCancelled) => debug!("Mining round superseded"),
                Err(e) => warn!("Mining failed: {}", e),
            }
        }
    }
}
