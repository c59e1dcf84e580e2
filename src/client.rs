//! Library client: the wallet session and the sync engine wired together.

use crate::config::{ClientConfig, ConfigError};
use crate::ledger::{LedgerConnector, RpcLedgerConnector};
use crate::notification::NotificationSink;
use crate::rpc::{JsonRpcClient, RpcError};
use crate::sync::{EngineError, LedgerSyncEngine};
use crate::wallet::{
	FileProviderCache, ProviderCacheRepository, ProviderConnector, RpcWalletProvider,
	SessionError, StaticConnector, WalletSession,
};

use std::sync::Arc;
use tracing::info;

/// Provider id of the node-backed wallet.
pub const RPC_PROVIDER_ID: &str = "rpc";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("Config error: {0}")]
	Config(#[from] ConfigError),

	#[error("RPC error: {0}")]
	Rpc(#[from] RpcError),

	#[error("Session error: {0}")]
	Session(#[from] SessionError),

	#[error("Engine error: {0}")]
	Engine(#[from] EngineError),
}

pub struct LibraryClient {
	session: WalletSession,
	engine: LedgerSyncEngine,
	cache: Arc<dyn ProviderCacheRepository>,
}

impl LibraryClient {
	pub fn new(
		config: &ClientConfig,
		connector: Arc<dyn ProviderConnector>,
		ledger_connector: Arc<dyn LedgerConnector>,
		cache: Arc<dyn ProviderCacheRepository>,
		notifier: Arc<dyn NotificationSink>,
	) -> Self {
		let engine = LedgerSyncEngine::new(
			config.engine_config(),
			config.chain_directory(),
			notifier.clone(),
		);
		let session = WalletSession::new(
			config.contract_address.clone(),
			connector,
			ledger_connector,
			cache.clone(),
			notifier,
		);
		session.register_handler(Arc::new(engine.clone()));

		Self {
			session,
			engine,
			cache,
		}
	}

	/// Build a client talking JSON-RPC to the configured node.
	pub fn from_config(
		config: &ClientConfig,
		notifier: Arc<dyn NotificationSink>,
	) -> Result<Self, ClientError> {
		let rpc_url = config.resolved_rpc_url()?;
		let rpc = JsonRpcClient::new(rpc_url, config.ws_url.clone())?;
		info!("Using JSON-RPC endpoint {}", rpc.rpc_url());

		let provider = Arc::new(RpcWalletProvider::new(RPC_PROVIDER_ID, rpc.clone()));
		let connector = Arc::new(StaticConnector::new(provider));
		let ledger_connector = Arc::new(RpcLedgerConnector::new(
			rpc,
			config.receipt_poll_interval,
		));
		let cache = Arc::new(FileProviderCache::new(config.data_dir.clone()));

		Ok(Self::new(config, connector, ledger_connector, cache, notifier))
	}

	pub fn session(&self) -> &WalletSession {
		&self.session
	}

	pub fn engine(&self) -> &LedgerSyncEngine {
		&self.engine
	}

	/// Connect the wallet and load the book list.
	pub async fn connect(&self) -> Result<(), ClientError> {
		let gateway = self.session.connect().await?;
		self.engine.initialize(gateway).await?;
		Ok(())
	}

	/// Reconnect if a provider was remembered by an earlier session.
	///
	/// Returns whether a connection was attempted and succeeded.
	pub async fn restore(&self) -> Result<bool, ClientError> {
		let cached = self.cache.load().await?;
		match cached {
			Some(cached) => {
				info!("Restoring session with provider {}", cached.provider_id);
				self.connect().await?;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	/// Tear the session down; the engine follows through the session's reset event.
	pub async fn disconnect(&self) {
		self.session.reset().await;
	}
}
