use super::types::{AssetData, ChainData, ChainError};

/// Placeholder substituted with the configured API key in RPC endpoints.
const API_KEY_PLACEHOLDER: &str = "%API_KEY%";

struct ChainEntry {
	name: &'static str,
	short_name: &'static str,
	chain: &'static str,
	network: &'static str,
	chain_id: u64,
	network_id: u64,
	rpc_url: &'static str,
	explorer: Option<&'static str>,
	currency: (&'static str, &'static str),
}

const SUPPORTED_CHAINS: &[ChainEntry] = &[
	ChainEntry {
		name: "Ethereum Mainnet",
		short_name: "eth",
		chain: "ETH",
		network: "mainnet",
		chain_id: 1,
		network_id: 1,
		rpc_url: "https://mainnet.infura.io/v3/%API_KEY%",
		explorer: Some("https://etherscan.io"),
		currency: ("ETH", "Ether"),
	},
	ChainEntry {
		name: "Ethereum Ropsten",
		short_name: "rop",
		chain: "ETH",
		network: "ropsten",
		chain_id: 3,
		network_id: 3,
		rpc_url: "https://ropsten.infura.io/v3/%API_KEY%",
		explorer: Some("https://ropsten.etherscan.io"),
		currency: ("ETH", "Ether"),
	},
	ChainEntry {
		name: "Ethereum Rinkeby",
		short_name: "rin",
		chain: "ETH",
		network: "rinkeby",
		chain_id: 4,
		network_id: 4,
		rpc_url: "https://rinkeby.infura.io/v3/%API_KEY%",
		explorer: Some("https://rinkeby.etherscan.io"),
		currency: ("ETH", "Ether"),
	},
	ChainEntry {
		name: "Ethereum Görli",
		short_name: "gor",
		chain: "ETH",
		network: "goerli",
		chain_id: 5,
		network_id: 5,
		rpc_url: "https://goerli.infura.io/v3/%API_KEY%",
		explorer: Some("https://goerli.etherscan.io"),
		currency: ("ETH", "Ether"),
	},
	ChainEntry {
		name: "Ethereum Kovan",
		short_name: "kov",
		chain: "ETH",
		network: "kovan",
		chain_id: 42,
		network_id: 42,
		rpc_url: "https://kovan.infura.io/v3/%API_KEY%",
		explorer: Some("https://kovan.etherscan.io"),
		currency: ("ETH", "Ether"),
	},
	ChainEntry {
		name: "xDAI Chain",
		short_name: "xdai",
		chain: "xDAI",
		network: "xdai",
		chain_id: 100,
		network_id: 100,
		rpc_url: "https://dai.poa.network",
		explorer: Some("https://blockscout.com/xdai/mainnet"),
		currency: ("xDAI", "xDAI"),
	},
	ChainEntry {
		name: "Ethereum Sepolia",
		short_name: "sep",
		chain: "ETH",
		network: "sepolia",
		chain_id: 11155111,
		network_id: 11155111,
		rpc_url: "https://sepolia.infura.io/v3/%API_KEY%",
		explorer: Some("https://sepolia.etherscan.io"),
		currency: ("ETH", "Ether"),
	},
	ChainEntry {
		name: "Local Development Chain",
		short_name: "local",
		chain: "ETH",
		network: "localhost",
		chain_id: 31337,
		network_id: 31337,
		rpc_url: "http://127.0.0.1:8545",
		explorer: None,
		currency: ("ETH", "Ether"),
	},
];

/// Read-only lookup from chain id to network metadata.
#[derive(Debug, Clone, Default)]
pub struct ChainDirectory {
	api_key: Option<String>,
}

impl ChainDirectory {
	/// Create a directory. `api_key` replaces the `%API_KEY%` placeholder in RPC endpoints.
	pub fn new(api_key: Option<String>) -> Self {
		Self { api_key }
	}

	/// Look up the metadata for `chain_id`.
	pub fn get(&self, chain_id: u64) -> Result<ChainData, ChainError> {
		SUPPORTED_CHAINS
			.iter()
			.find(|entry| entry.chain_id == chain_id)
			.map(|entry| self.materialize(entry))
			.ok_or(ChainError::Unsupported(chain_id))
	}

	pub fn is_supported(&self, chain_id: u64) -> bool {
		SUPPORTED_CHAINS.iter().any(|entry| entry.chain_id == chain_id)
	}

	/// All known chain ids, in table order.
	pub fn chain_ids(&self) -> Vec<u64> {
		SUPPORTED_CHAINS.iter().map(|entry| entry.chain_id).collect()
	}

	/// Explorer link for a transaction on `chain_id`, if one can be built.
	pub fn transaction_url(&self, chain_id: u64, tx_hash: &str) -> Option<String> {
		self.get(chain_id).ok()?.transaction_url(tx_hash)
	}

	fn materialize(&self, entry: &ChainEntry) -> ChainData {
		let rpc_url = match &self.api_key {
			Some(key) => entry.rpc_url.replace(API_KEY_PLACEHOLDER, key),
			None => entry.rpc_url.to_string(),
		};

		ChainData {
			name: entry.name.to_string(),
			short_name: entry.short_name.to_string(),
			chain: entry.chain.to_string(),
			network: entry.network.to_string(),
			chain_id: entry.chain_id,
			network_id: entry.network_id,
			rpc_url,
			native_currency: AssetData {
				symbol: entry.currency.0.to_string(),
				name: entry.currency.1.to_string(),
				decimals: 18,
				contract_address: String::new(),
			},
			explorer: entry.explorer.map(str::to_string),
		}
	}
}
