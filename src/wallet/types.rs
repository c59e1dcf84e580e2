use crate::ledger::{AddressError, LedgerError};
use crate::rpc::{RemoteFailure, RpcError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain id of an empty session.
pub const DEFAULT_CHAIN_ID: u64 = 1;

/// The wallet connection as seen by the rest of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
	pub connected: bool,
	/// Active account, empty when disconnected.
	pub address: String,
	pub chain_id: u64,
	/// Id of the provider the session was established with.
	pub provider: Option<String>,
}

impl Default for Session {
	fn default() -> Self {
		Self {
			connected: false,
			address: String::new(),
			chain_id: DEFAULT_CHAIN_ID,
			provider: None,
		}
	}
}

impl Session {
	pub fn is_empty(&self) -> bool {
		*self == Session::default()
	}
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetReason {
	/// Explicit disconnect.
	Requested,
	/// The provider reported an empty account list.
	AccountsLost,
	/// The provider closed the connection.
	ProviderClosed,
}

impl fmt::Display for ResetReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let reason = match self {
			ResetReason::Requested => "disconnect requested",
			ResetReason::AccountsLost => "accounts lost",
			ResetReason::ProviderClosed => "provider closed",
		};
		f.write_str(reason)
	}
}

/// Error types reported by wallet providers
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
	#[error("Wallet selection was cancelled")]
	Cancelled,

	#[error("No wallet provider available")]
	NoProvider,

	#[error("Operation not supported by the provider")]
	Unsupported,

	#[error("Provider error: {0}")]
	Remote(RemoteFailure),
}

impl From<RpcError> for ProviderError {
	fn from(error: RpcError) -> Self {
		ProviderError::Remote(error.into())
	}
}

/// Error types for establishing and maintaining a wallet session
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
	#[error("Invalid address: {0}")]
	InvalidAddress(#[from] AddressError),

	#[error("Provider has no connected account")]
	ProviderDisconnect,

	#[error("Provider error: {0}")]
	Provider(#[from] ProviderError),

	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),

	#[error("Persistence error: {0}")]
	Persistence(String),
}

impl SessionError {
	/// Text shown to the user for this failure.
	pub fn user_message(&self) -> String {
		match self {
			SessionError::InvalidAddress(_) => "Provided contract address is not valid!".to_string(),
			SessionError::ProviderDisconnect => "Wallet has no connected account.".to_string(),
			SessionError::Provider(ProviderError::Cancelled) => {
				"Wallet connection was cancelled.".to_string()
			}
			SessionError::Provider(ProviderError::Remote(failure)) => failure.describe(),
			SessionError::Provider(other) => format!("Error: {}", other),
			SessionError::Ledger(error) => error.user_message(),
			SessionError::Persistence(reason) => format!("Error: {}", reason),
		}
	}
}
