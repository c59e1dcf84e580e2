//! Client configuration.
//!
//! `ClientConfig::default()` targets a local development node. Every field can be overridden
//! through a `BOOK_LIBRARY_*` environment variable.

use crate::chain::{ChainDirectory, ChainError};
use crate::sync::{ConflictPolicy, EngineConfig};

use std::path::PathBuf;
use std::time::Duration;

pub const ENV_CONTRACT_ADDRESS: &str = "BOOK_LIBRARY_CONTRACT_ADDRESS";
pub const ENV_RPC_URL: &str = "BOOK_LIBRARY_RPC_URL";
pub const ENV_WS_URL: &str = "BOOK_LIBRARY_WS_URL";
pub const ENV_CHAIN_ID: &str = "BOOK_LIBRARY_CHAIN_ID";
pub const ENV_DATA_DIR: &str = "BOOK_LIBRARY_DATA_DIR";
pub const ENV_INFURA_ID: &str = "BOOK_LIBRARY_INFURA_ID";
pub const ENV_EXCLUSIVE_WRITES: &str = "BOOK_LIBRARY_EXCLUSIVE_WRITES";
pub const ENV_RECEIPT_POLL_MS: &str = "BOOK_LIBRARY_RECEIPT_POLL_MS";
pub const ENV_REFRESH_ON_NETWORK_CHANGE: &str = "BOOK_LIBRARY_REFRESH_ON_NETWORK_CHANGE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Invalid value {value:?} for {key}: {reason}")]
	Invalid {
		key: &'static str,
		value: String,
		reason: String,
	},

	#[error("Chain error: {0}")]
	Chain(#[from] ChainError),
}

/// Configuration of the library client
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Address of the book-ledger contract; validated when a session connects
	pub contract_address: String,
	/// JSON-RPC endpoint; when unset, the chain directory's endpoint for `chain_id` is used
	pub rpc_url: Option<String>,
	/// WebSocket endpoint for provider and ledger events
	pub ws_url: Option<String>,
	pub chain_id: u64,
	/// Directory holding the remembered provider
	pub data_dir: PathBuf,
	/// Substituted into chain directory RPC endpoints
	pub infura_id: Option<String>,
	pub conflict_policy: ConflictPolicy,
	/// Initial interval between receipt polls
	pub receipt_poll_interval: Duration,
	pub refresh_on_network_change: bool,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			contract_address: String::new(),
			rpc_url: Some("http://127.0.0.1:8545".to_string()),
			ws_url: Some("ws://127.0.0.1:8546".to_string()),
			chain_id: 31337,
			data_dir: PathBuf::from(".book-library"),
			infura_id: None,
			conflict_policy: ConflictPolicy::PerCategory,
			receipt_poll_interval: Duration::from_millis(1000),
			refresh_on_network_change: false,
		}
	}
}

impl ClientConfig {
	/// Defaults overridden by the process environment.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Defaults overridden by whatever `lookup` returns for each variable.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
		let mut config = Self::default();
		let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

		if let Some(address) = get(ENV_CONTRACT_ADDRESS) {
			config.contract_address = address.trim().to_string();
		}
		if let Some(url) = get(ENV_RPC_URL) {
			config.rpc_url = Some(url);
		}
		if let Some(url) = get(ENV_WS_URL) {
			config.ws_url = Some(url);
		}
		if let Some(value) = get(ENV_CHAIN_ID) {
			config.chain_id = parse_number(ENV_CHAIN_ID, &value)?;
		}
		if let Some(dir) = get(ENV_DATA_DIR) {
			config.data_dir = PathBuf::from(dir);
		}
		if let Some(id) = get(ENV_INFURA_ID) {
			config.infura_id = Some(id);
		}
		if let Some(value) = get(ENV_EXCLUSIVE_WRITES) {
			config.conflict_policy = if parse_flag(ENV_EXCLUSIVE_WRITES, &value)? {
				ConflictPolicy::Exclusive
			} else {
				ConflictPolicy::PerCategory
			};
		}
		if let Some(value) = get(ENV_RECEIPT_POLL_MS) {
			let millis = parse_number(ENV_RECEIPT_POLL_MS, &value)?;
			if millis == 0 {
				return Err(ConfigError::Invalid {
					key: ENV_RECEIPT_POLL_MS,
					value,
					reason: "must be positive".to_string(),
				});
			}
			config.receipt_poll_interval = Duration::from_millis(millis);
		}
		if let Some(value) = get(ENV_REFRESH_ON_NETWORK_CHANGE) {
			config.refresh_on_network_change = parse_flag(ENV_REFRESH_ON_NETWORK_CHANGE, &value)?;
		}

		Ok(config)
	}

	pub fn chain_directory(&self) -> ChainDirectory {
		ChainDirectory::new(self.infura_id.clone())
	}

	/// The configured RPC endpoint, or the directory's endpoint for `chain_id`.
	pub fn resolved_rpc_url(&self) -> Result<String, ConfigError> {
		match &self.rpc_url {
			Some(url) => Ok(url.clone()),
			None => Ok(self.chain_directory().get(self.chain_id)?.rpc_url),
		}
	}

	pub fn engine_config(&self) -> EngineConfig {
		EngineConfig {
			conflict_policy: self.conflict_policy,
			refresh_on_network_change: self.refresh_on_network_change,
		}
	}
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
	value.trim().parse().map_err(|e| ConfigError::Invalid {
		key,
		value: value.to_string(),
		reason: format!("{}", e),
	})
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(ConfigError::Invalid {
			key,
			value: value.to_string(),
			reason: "expected a boolean".to_string(),
		}),
	}
}
