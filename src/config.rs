//! Configuration management for the node

use crate::error::{ChainError, Result};
use crate::transaction::KEMITES_PER_KEM;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, Level};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub chain: ChainConfig,
    pub admission: AdmissionConfig,
    pub anchor: AnchorConfig,
    pub database: DatabaseConfig,
    pub miner: MinerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
    /// Passphrase shared by every node of one network; peers without it
    /// cannot complete the encrypted exchange.
    pub network_key: String,
    pub max_connections: usize,
    pub request_timeout_secs: u64,
    pub anchor_ttl: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            bootstrap_peers: Vec::new(),
            network_key: "kembacoin-mainnet".to_string(),
            max_connections: 256,
            request_timeout_secs: 10,
            anchor_ttl: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub difficulty: u32,
    /// Target seconds between blocks; paces the miner loop.
    pub block_time: u64,
    /// Parsed for compatibility; difficulty is never retargeted.
    pub adjustment_interval: u64,
    pub random_intervals: Vec<u64>,
    pub max_supply_kem: u64,
    /// Reward per block in kemites.
    pub block_reward: u64,
    pub version: String,
    pub max_mining_iterations: u64,
    pub max_block_transactions: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            block_time: 7 * 60,
            adjustment_interval: 5,
            random_intervals: vec![7, 70, 700, 777, 7000],
            max_supply_kem: 77_700_000,
            block_reward: 77 * KEMITES_PER_KEM,
            version: "4.0".to_string(),
            max_mining_iterations: 100_000_000,
            max_block_transactions: 500,
        }
    }
}

impl ChainConfig {
    pub fn max_supply_kemites(&self) -> u64 {
        self.max_supply_kem.saturating_mul(KEMITES_PER_KEM)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Seconds a pending transaction id stays fresh before it is `late`.
    pub timeout_threshold: f64,
    pub learning_rate: f64,
    pub min_timeout: f64,
    pub failure_threshold: u32,
    pub recovery_secs: f64,
    pub maintenance_interval_secs: u64,
    pub mempool_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            timeout_threshold: 30.0,
            learning_rate: 0.1,
            min_timeout: 5.0,
            failure_threshold: 3,
            recovery_secs: 300.0,
            maintenance_interval_secs: 60,
            mempool_capacity: 10_000,
        }
    }
}

/// Settings handed to the external anchor-submission collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub enabled: bool,
    pub interval_blocks: u64,
    pub rpc_user: String,
    pub rpc_password: String,
    pub rpc_host: String,
    pub rpc_port: u16,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_blocks: 10,
            rpc_user: "user".to_string(),
            rpc_password: "password".to_string(),
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 8332,
        }
    }
}

impl AnchorConfig {
    pub fn rpc_url(&self) -> String {
        format!(
            "http://{}:{}@{}:{}",
            self.rpc_user, self.rpc_password, self.rpc_host, self.rpc_port
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/kemchain.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub enabled: bool,
    /// Active miners. The first one is the default beneficiary; bonus blocks
    /// draw from the whole list.
    pub beneficiaries: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chain.random_intervals.is_empty() {
            return Err(ChainError::ConfigError(
                "chain.random_intervals must not be empty".to_string(),
            ));
        }
        if self.chain.random_intervals.contains(&0) {
            return Err(ChainError::ConfigError(
                "chain.random_intervals must be positive".to_string(),
            ));
        }
        if self.chain.difficulty > 64 {
            return Err(ChainError::ConfigError(format!(
                "chain.difficulty {} exceeds the 64 hex digits of a SHA-256 hash",
                self.chain.difficulty
            )));
        }
        if self.chain.max_mining_iterations == 0 {
            return Err(ChainError::ConfigError(
                "chain.max_mining_iterations must be positive".to_string(),
            ));
        }
        if !(self.admission.learning_rate > 0.0 && self.admission.learning_rate < 1.0) {
            return Err(ChainError::ConfigError(format!(
                "admission.learning_rate must be in (0, 1), got {}",
                self.admission.learning_rate
            )));
        }
        if self.network.max_connections == 0 {
            return Err(ChainError::ConfigError(
                "network.max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
/// Where a loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Defaults,
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    load_config_with_source(path).map(|(config, _)| config)
}

/// Like [`load_config`], also reporting whether the file existed. Callers that
/// load before logging is installed use this to report the fallback later.
pub fn load_config_with_source(path: impl AsRef<Path>) -> Result<(Config, ConfigSource)> {
    let path = path.as_ref();
    let (config, source) = match fs::read_to_string(path) {
        Ok(contents) => {
            let config = toml::from_str::<Config>(&contents)
                .map_err(|e| ChainError::ConfigError(format!("{}: {}", path.display(), e)))?;
            (config, ConfigSource::File)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config at {}, using defaults", path.display());
            (Config::default(), ConfigSource::Defaults)
        }
        Err(e) => return Err(e.into()),
    };

    config.validate()?;
    Ok((config, source))
}
