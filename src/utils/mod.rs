//!
//! Utility module for the library client.
//!
//! Re-exports listener bookkeeping and formatting helpers for use throughout the codebase.
/// Formatting helpers for notification text
pub mod index;
/// Listener registration shared by provider and ledger backends
pub mod listeners;

pub use index::ellipse_address;
pub use listeners::{ListenerId, ListenerRegistry};
