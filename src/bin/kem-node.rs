#![forbid(unsafe_code)]
//! Kembacoin node

use clap::{Parser, Subcommand};
use kemchain::admission::LedgerSnapshot;
use kemchain::blockchain::{Blockchain, NoopLedger};
use kemchain::config::{load_config_with_source, Config, ConfigSource};
use kemchain::network::PeerAddr;
use kemchain::node::Node;
use kemchain::persistence::{Database, Persistence};
use kemchain::transaction::KEMITES_PER_KEM;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "kemchain.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the node until interrupted
    Run,
    /// Prints the stored chain and admission state
    Info,
    /// Pulls anchor history from a peer
    SyncAnchors {
        /// Peer address as host:port
        peer: String,
    },
}

fn init_logging(config: &Config) {
    tracing_subscriber::fmt()
        .with_max_level(config.logging.max_level())
        .init();
}

fn print_info(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let db: Arc<dyn Persistence> = Arc::new(Database::open(&config.database.path)?);
    let chain = Blockchain::restore(&config.chain, Box::new(NoopLedger), db.clone())?;
    let snapshot = db
        .load_ledger_snapshot()?
        .unwrap_or_else(|| LedgerSnapshot {
            timeout_threshold: config.admission.timeout_threshold,
            ..LedgerSnapshot::default()
        });

    println!("Chain height:     {}", chain.height());
    println!("Tip hash:         {}", chain.tip().hash);
    println!("Difficulty:       {}", chain.difficulty);
    println!(
        "Supply:           {:.8} / {} KEM",
        chain.current_supply as f64 / KEMITES_PER_KEM as f64,
        config.chain.max_supply_kem
    );
    println!("Next bonus block: {}", chain.next_bonus_block());
    println!(
        "Admission log:    {} entries, {} failed nodes, timeout {:.2}s",
        snapshot.global_transaction_log.len(),
        snapshot.failed_nodes.len(),
        snapshot.timeout_threshold
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (config, source) = load_config_with_source(&cli.config)?;
    init_logging(&config);
    if source == ConfigSource::Defaults {
        info!("No config at {}, using defaults", cli.config);
    }

    match cli.command {
        Commands::Run => {
            let node = Arc::new(Node::init(config)?);
            let addr = node.clone().start().await?;
            info!("Kembacoin node listening on {}", addr);
            tokio::signal::ctrl_c().await?;
            node.run_maintenance().await;
            info!("Shutting down");
        }
        Commands::Info => print_info(&config)?,
        Commands::SyncAnchors { peer } => {
            let peer: PeerAddr = peer.parse()?;
            let node = Node::init(config)?;
            let added = node.network.request_anchor_sync(&peer).await?;
            println!("Received {} new anchors from {}", added, peer);
            for anchor in node.ctx.anchors.history() {
                println!(
                    "  {} block {:?} -> {}",
                    anchor.payload, anchor.block_index, anchor.reference
                );
            }
        }
    }
    Ok(())
}
