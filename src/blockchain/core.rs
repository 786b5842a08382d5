// Block codec and hashing, chain acceptance, balance state and consensus
// checks, split into submodules.
pub mod block;
pub mod chain;
pub mod state;
pub mod validation;

pub use block::*;
pub use chain::*;
pub use state::*;
pub use validation::*;
