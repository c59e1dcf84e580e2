use serde::{Deserialize, Serialize};

/// Native asset of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetData {
	pub symbol: String,
	pub name: String,
	pub decimals: u8,
	#[serde(rename = "contractAddress")]
	pub contract_address: String,
}

/// Metadata describing a supported network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainData {
	pub name: String,
	pub short_name: String,
	pub chain: String,
	pub network: String,
	pub chain_id: u64,
	pub network_id: u64,
	pub rpc_url: String,
	pub native_currency: AssetData,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub explorer: Option<String>,
}

impl ChainData {
	/// Block-explorer page for a transaction, if the network has an explorer.
	pub fn transaction_url(&self, tx_hash: &str) -> Option<String> {
		self.explorer
			.as_ref()
			.map(|explorer| format!("{}/tx/{}", explorer.trim_end_matches('/'), tx_hash))
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
	#[error("ChainId missing or not supported: {0}")]
	Unsupported(u64),
}
