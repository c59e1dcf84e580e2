//! Wallet provider capability interface.
//!
//! A provider is anything that can report the user's accounts and the current chain. Event
//! subscription through `on`/`off` is optional: the defaults report `ProviderError::Unsupported`
//! and callers are expected to cope with that.

use super::types::ProviderError;
use crate::rpc::{JsonRpcClient, parse_quantity};
use crate::utils::{ListenerId, ListenerRegistry};

use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The three provider-level notifications a session listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
	AccountsChanged,
	NetworkChanged,
	Close,
}

impl ProviderEventKind {
	pub const ALL: [ProviderEventKind; 3] = [
		ProviderEventKind::AccountsChanged,
		ProviderEventKind::NetworkChanged,
		ProviderEventKind::Close,
	];

	/// Wire name of the event.
	pub fn name(&self) -> &'static str {
		match self {
			ProviderEventKind::AccountsChanged => "accountsChanged",
			ProviderEventKind::NetworkChanged => "networkChanged",
			ProviderEventKind::Close => "close",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
	AccountsChanged(Vec<String>),
	NetworkChanged(u64),
	Close,
}

impl ProviderEvent {
	pub fn kind(&self) -> ProviderEventKind {
		match self {
			ProviderEvent::AccountsChanged(_) => ProviderEventKind::AccountsChanged,
			ProviderEvent::NetworkChanged(_) => ProviderEventKind::NetworkChanged,
			ProviderEvent::Close => ProviderEventKind::Close,
		}
	}

	/// Parse a pushed `{"event": ..., ...}` payload.
	pub fn from_json(payload: &Value) -> Option<Self> {
		match payload.get("event").and_then(Value::as_str)? {
			"accountsChanged" => {
				let accounts = payload
					.get("accounts")
					.and_then(Value::as_array)?
					.iter()
					.filter_map(Value::as_str)
					.map(str::to_string)
					.collect();
				Some(ProviderEvent::AccountsChanged(accounts))
			}
			"networkChanged" => payload
				.get("chainId")
				.and_then(parse_quantity)
				.map(ProviderEvent::NetworkChanged),
			"close" => Some(ProviderEvent::Close),
			_ => None,
		}
	}
}

pub type ProviderEventSink = UnboundedSender<ProviderEvent>;

/// Connected wallet provider.
#[async_trait::async_trait]
pub trait WalletProvider: Send + Sync {
	/// Identifier remembered as the "last provider".
	fn id(&self) -> &str;

	async fn accounts(&self) -> Result<Vec<String>, ProviderError>;

	async fn chain_id(&self) -> Result<u64, ProviderError>;

	async fn on(
		&self,
		_kind: ProviderEventKind,
		_sink: ProviderEventSink,
	) -> Result<ListenerId, ProviderError> {
		Err(ProviderError::Unsupported)
	}

	async fn off(&self, _id: ListenerId) -> Result<(), ProviderError> {
		Err(ProviderError::Unsupported)
	}
}

/// The provider selection flow.
#[async_trait::async_trait]
pub trait ProviderConnector: Send + Sync {
	/// Pick a provider, honouring `preferred` (the remembered provider id) when possible.
	async fn connect(
		&self,
		preferred: Option<&str>,
	) -> Result<Arc<dyn WalletProvider>, ProviderError>;
}

/// Connector that always hands out the same provider.
pub struct StaticConnector {
	provider: Arc<dyn WalletProvider>,
}

impl StaticConnector {
	pub fn new(provider: Arc<dyn WalletProvider>) -> Self {
		Self { provider }
	}
}

#[async_trait::async_trait]
impl ProviderConnector for StaticConnector {
	async fn connect(
		&self,
		preferred: Option<&str>,
	) -> Result<Arc<dyn WalletProvider>, ProviderError> {
		if let Some(preferred) = preferred {
			if preferred != self.provider.id() {
				warn!(
					"Remembered provider {} is not available, using {}",
					preferred,
					self.provider.id()
				);
			}
		}
		Ok(self.provider.clone())
	}
}

/// Provider backed by a node's JSON-RPC interface.
///
/// Events are pushed over a `wallet_subscribe` WebSocket subscription, opened with the first
/// listener and closed with the last one. A subscription that ends is reported as `Close`.
pub struct RpcWalletProvider {
	id: String,
	client: JsonRpcClient,
	listeners: Arc<ListenerRegistry<ProviderEventKind, ProviderEvent>>,
	pump: Mutex<Option<JoinHandle<()>>>,
}

impl RpcWalletProvider {
	pub fn new(id: impl Into<String>, client: JsonRpcClient) -> Self {
		Self {
			id: id.into(),
			client,
			listeners: Arc::new(ListenerRegistry::new()),
			pump: Mutex::new(None),
		}
	}

	fn pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
		self.pump.lock().unwrap_or_else(PoisonError::into_inner)
	}

	async fn ensure_subscribed(&self) -> Result<(), ProviderError> {
		if self.pump().is_some() {
			return Ok(());
		}

		let mut stream = self.client.subscribe("wallet_subscribe", json!([])).await?;
		let listeners = self.listeners.clone();
		let provider_id = self.id.clone();

		let handle = tokio::spawn(async move {
			while let Some(item) = stream.next().await {
				match item {
					Ok(payload) => match ProviderEvent::from_json(&payload) {
						Some(event) => {
							let delivered = listeners.emit(event.kind(), event);
							debug!("Provider event delivered to {} listeners", delivered);
						}
						None => warn!("Ignoring unknown provider event: {}", payload),
					},
					Err(e) => warn!("Error in provider subscription: {}", e),
				}
			}
			info!("Provider {} subscription ended", provider_id);
			listeners.emit(ProviderEventKind::Close, ProviderEvent::Close);
		});

		let mut pump = self.pump();
		if pump.is_some() {
			handle.abort();
		} else {
			*pump = Some(handle);
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl WalletProvider for RpcWalletProvider {
	fn id(&self) -> &str {
		&self.id
	}

	async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
		let result = self.client.call("eth_accounts", json!([])).await?;
		serde_json::from_value(result).map_err(|e| {
			ProviderError::Remote(crate::rpc::RemoteFailure::message(format!(
				"Invalid eth_accounts response: {}",
				e
			)))
		})
	}

	async fn chain_id(&self) -> Result<u64, ProviderError> {
		let result = self.client.call("eth_chainId", json!([])).await?;
		parse_quantity(&result).ok_or_else(|| {
			ProviderError::Remote(crate::rpc::RemoteFailure::message(format!(
				"Invalid eth_chainId response: {}",
				result
			)))
		})
	}

	async fn on(
		&self,
		kind: ProviderEventKind,
		sink: ProviderEventSink,
	) -> Result<ListenerId, ProviderError> {
		if self.client.ws_url().is_none() {
			debug!("No event endpoint configured for provider {}", self.id);
			return Err(ProviderError::Unsupported);
		}
		self.ensure_subscribed().await?;
		Ok(self.listeners.add(kind, sink))
	}

	async fn off(&self, id: ListenerId) -> Result<(), ProviderError> {
		self.listeners.remove(id);
		if self.listeners.is_empty() {
			if let Some(handle) = self.pump().take() {
				handle.abort();
			}
		}
		Ok(())
	}
}

impl Drop for RpcWalletProvider {
	fn drop(&mut self) {
		if let Some(handle) = self.pump().take() {
			handle.abort();
		}
	}
}
