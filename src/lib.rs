//! Kemchain - a minimal proof-of-work ledger for Kembacoin (KEM)
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Block hashing, chain acceptance rules and balance state
//! - [`transaction`] - Transaction types and stateless validation
//! - [`mempool`] - Pending transaction pool
//!
//! ## Consensus & Mining
//! - [`miner`] - Cancellable proof-of-work over the nonce triple
//!
//! ## Admission
//! - [`admission`] - Replay guard, adaptive timeout and peer fault tracking
//! - [`anchor`] - Anchor records and their de-duplicated history
//!
//! ## Cryptography
//! - [`crypto`] - ECDSA signatures and the encrypted peer link (secp256k1, AES-GCM)
//!
//! ## Networking
//! - [`network`] - Wire protocol, encrypted transport and peer broadcast
//! - [`node`] - Shared node context and orchestration
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`capabilities`] - Contracts for upstream collaborators
//! - [`persistence`] - Database layer (SQLite)
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Admission
// ============================================================================
pub mod admission;
pub mod anchor;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod capabilities;
pub mod config;
pub mod error;
pub mod persistence;
