//! Ledger synchronization
//!
//! This module keeps the local book list consistent with the remote ledger. It reacts to the
//! wallet session's lifecycle events, to domain events pushed by the ledger and to the outcome of
//! writes submitted from this client, re-reading the full book list after each.

/// The sync engine state machine
pub mod engine;
/// Session event types and dispatcher
pub mod events;
/// Outstanding write tracking
pub mod pending;
/// Engine phases, configuration and errors
mod types;

pub use engine::LedgerSyncEngine;
pub use events::{EventDispatcher, SessionEvent, SessionEventHandler};
pub use pending::{
	ConflictPolicy, OperationCategory, OperationKind, PendingOperation, PendingOperations,
};
pub use types::*;
