//! Database persistence layer: accepted blocks and the admission snapshot.

use crate::admission::LedgerSnapshot;
use crate::blockchain::Block;
use crate::error::ChainError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SNAPSHOT_KEY: &str = "admission_snapshot";

/// Abstraction for persistence backends. Saving a block at an index that is
/// already stored replaces it.
pub trait Persistence: Send + Sync {
    fn save_block(&self, block: &Block) -> Result<(), ChainError>;
    /// All stored blocks in index order.
    fn load_blocks(&self) -> Result<Vec<Block>, ChainError>;
    fn save_ledger_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ChainError>;
    fn load_ledger_snapshot(&self) -> Result<Option<LedgerSnapshot>, ChainError>;
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::DatabaseError("Mutex poisoned".to_string())
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ChainError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_index INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create metadata table: {}", e))
        })?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn save_metadata(&self, key: &str, value: &str) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save {}: {}", key, e)))?;
        Ok(())
    }

    fn load_metadata(&self, key: &str) -> Result<Option<String>, ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to load {}: {}", key, e)))
    }
}

impl Persistence for Database {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let data = serde_json::to_string(block)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to serialize block: {}", e)))?;
        let index = i64::try_from(block.index)
            .map_err(|_| ChainError::DatabaseError(format!("Block index {} too large", block.index)))?;

        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO blocks (block_index, hash, data) VALUES (?1, ?2, ?3)",
            params![index, block.hash, data],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn
            .prepare("SELECT data FROM blocks ORDER BY block_index ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let data = row?;
            let block: Block = serde_json::from_str(&data).map_err(|e| {
                ChainError::DatabaseError(format!("Failed to deserialize block: {}", e))
            })?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn save_ledger_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ChainError> {
        let value = serde_json::to_string(snapshot).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to serialize admission snapshot: {}", e))
        })?;
        self.save_metadata(SNAPSHOT_KEY, &value)
    }

    fn load_ledger_snapshot(&self) -> Result<Option<LedgerSnapshot>, ChainError> {
        self.load_metadata(SNAPSHOT_KEY)?
            .map(|value| {
                serde_json::from_str(&value).map_err(|e| {
                    ChainError::DatabaseError(format!(
                        "Failed to deserialize admission snapshot: {}",
                        e
                    ))
                })
            })
            .transpose()
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub blocks: Arc<Mutex<Vec<Block>>>,
    pub snapshot: Arc<Mutex<Option<LedgerSnapshot>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(poisoned)?;
        blocks.retain(|b| b.index != block.index);
        blocks.push(block.clone());
        blocks.sort_by_key(|b| b.index);
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        Ok(self.blocks.lock().map_err(poisoned)?.clone())
    }

    fn save_ledger_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<(), ChainError> {
        *self.snapshot.lock().map_err(poisoned)? = Some(snapshot.clone());
        Ok(())
    }

    fn load_ledger_snapshot(&self) -> Result<Option<LedgerSnapshot>, ChainError> {
        Ok(self.snapshot.lock().map_err(poisoned)?.clone())
    }
}
