use super::pending::{ConflictPolicy, OperationKind, PendingOperations};
use crate::ledger::{Book, LedgerError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnginePhase {
	/// No session bound
	Idle,
	/// A full read is in progress
	Loading,
	/// The book list reflects a complete read
	Ready,
	/// The initial read failed; the book list is empty
	Faulted,
}

impl fmt::Display for EnginePhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			EnginePhase::Idle => "idle",
			EnginePhase::Loading => "loading",
			EnginePhase::Ready => "ready",
			EnginePhase::Faulted => "faulted",
		};
		f.write_str(name)
	}
}

/// Configuration for the sync engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
	pub conflict_policy: ConflictPolicy,
	/// Re-read the book list when the provider switches networks.
	pub refresh_on_network_change: bool,
}

/// Which controls a front-end should offer in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlState {
	pub table_enabled: bool,
	pub add_enabled: bool,
	/// Borrow and return buttons.
	pub circulation_enabled: bool,
	pub refresh_enabled: bool,
}

impl ControlState {
	pub fn derive(phase: EnginePhase, pending: &PendingOperations) -> Self {
		let ready = phase == EnginePhase::Ready;
		let circulation_free = !pending.is_blocked(OperationKind::Borrow);
		Self {
			table_enabled: ready,
			add_enabled: ready && !pending.is_blocked(OperationKind::Add),
			circulation_enabled: ready && circulation_free,
			refresh_enabled: matches!(phase, EnginePhase::Ready | EnginePhase::Faulted)
				&& circulation_free,
		}
	}

	pub fn can_borrow(&self, book: &Book) -> bool {
		self.circulation_enabled && book.number_of_copies > 0
	}

	pub fn can_return(&self, _book: &Book) -> bool {
		self.circulation_enabled
	}
}

/// Error types for sync engine operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
	#[error("No contract gateway is bound")]
	NotConnected,

	#[error("Engine is {0}, not ready")]
	NotReady(EnginePhase),

	#[error("Cannot start {requested} while a {outstanding} operation is outstanding")]
	Busy {
		requested: OperationKind,
		outstanding: OperationKind,
	},

	#[error("Cannot refresh while a {0} operation is outstanding")]
	RefreshBlocked(OperationKind),

	#[error("Session was reset")]
	SessionReset,

	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),
}

impl EngineError {
	/// Text shown to the user for this failure.
	pub fn user_message(&self) -> String {
		match self {
			EngineError::Ledger(error) => error.user_message(),
			other => other.to_string(),
		}
	}
}
