//! Chain metadata lookup.
//!
//! A static table of the networks the client knows about, keyed by chain id. Used to label the
//! active network and to build block-explorer links for submitted transactions.

/// Static table and lookup
mod directory;
/// Network and asset descriptions
mod types;

pub use directory::ChainDirectory;
pub use types::*;
