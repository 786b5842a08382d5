// Thin re-export module: implementation lives in `blockchain/core.rs` and its
// submodules (block codec, chain management, balance state, validation).

pub mod core;
pub use core::*;
