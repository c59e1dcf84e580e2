//! Wallet session lifecycle.
//!
//! `WalletSession` owns the single `Session` of the client. It runs the provider selection flow,
//! builds the contract gateway for the connected account, listens to the provider's account,
//! network and close notifications, and tears everything down again on `reset`.
//!
//! Provider notifications are delivered through a channel into a pump task. Every established
//! session gets a new epoch; notifications and late results carrying an older epoch are dropped.

use super::cache::ProviderCacheRepository;
use super::provider::{
	ProviderConnector, ProviderEvent, ProviderEventKind, ProviderEventSink, WalletProvider,
};
use super::types::*;
use crate::ledger::{ContractAddress, ContractGateway, LedgerConnector};
use crate::notification::{Notification, NotificationSink};
use crate::sync::{EventDispatcher, SessionEvent, SessionEventHandler};
use crate::utils::ListenerId;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Handle to the client's wallet session. Cheap to clone.
#[derive(Clone)]
pub struct WalletSession {
	inner: Arc<SessionInner>,
}

struct SessionInner {
	/// Configured contract address, validated on every connect.
	contract_address: String,
	connector: Arc<dyn ProviderConnector>,
	ledger_connector: Arc<dyn LedgerConnector>,
	cache: Arc<dyn ProviderCacheRepository>,
	notifier: Arc<dyn NotificationSink>,
	dispatcher: EventDispatcher,
	state: Mutex<SessionState>,
	/// Serializes connect attempts.
	connecting: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct SessionState {
	session: Session,
	epoch: u64,
	live: Option<LiveSession>,
}

/// Resources held while connected.
struct LiveSession {
	provider: Arc<dyn WalletProvider>,
	gateway: Arc<ContractGateway>,
	listeners: Vec<ListenerId>,
}

impl SessionInner {
	fn state(&self) -> MutexGuard<'_, SessionState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl WalletSession {
	pub fn new(
		contract_address: impl Into<String>,
		connector: Arc<dyn ProviderConnector>,
		ledger_connector: Arc<dyn LedgerConnector>,
		cache: Arc<dyn ProviderCacheRepository>,
		notifier: Arc<dyn NotificationSink>,
	) -> Self {
		Self {
			inner: Arc::new(SessionInner {
				contract_address: contract_address.into(),
				connector,
				ledger_connector,
				cache,
				notifier,
				dispatcher: EventDispatcher::new(),
				state: Mutex::new(SessionState::default()),
				connecting: tokio::sync::Mutex::new(()),
			}),
		}
	}

	/// Register a handler for session events.
	pub fn register_handler(&self, handler: Arc<dyn SessionEventHandler>) {
		self.inner.dispatcher.register_handler(handler);
	}

	/// Snapshot of the current session.
	pub fn session(&self) -> Session {
		self.inner.state().session.clone()
	}

	pub fn is_connected(&self) -> bool {
		self.inner.state().session.connected
	}

	/// Gateway of the live session, if connected.
	pub fn gateway(&self) -> Option<Arc<ContractGateway>> {
		self.inner
			.state()
			.live
			.as_ref()
			.map(|live| live.gateway.clone())
	}

	/// Establish a session and return the contract gateway bound to it.
	///
	/// Returns the live gateway if already connected. A failure is reported to the notification
	/// sink exactly once and leaves the session empty.
	pub async fn connect(&self) -> Result<Arc<ContractGateway>, SessionError> {
		let _connecting = self.inner.connecting.lock().await;

		if let Some(gateway) = self.gateway() {
			debug!("Session already connected, reusing gateway");
			return Ok(gateway);
		}

		match self.establish().await {
			Ok(gateway) => Ok(gateway),
			Err(e) => {
				error!("Failed to connect wallet session: {}", e);
				self.inner.notifier.notify(Notification::error(e.user_message()));
				Err(e)
			}
		}
	}

	async fn establish(&self) -> Result<Arc<ContractGateway>, SessionError> {
		let inner = &self.inner;

		let preferred = match inner.cache.load().await {
			Ok(cached) => cached.map(|cached| cached.provider_id),
			Err(e) => {
				warn!("Ignoring cached provider: {}", e);
				None
			}
		};

		let provider = inner.connector.connect(preferred.as_deref()).await?;
		if let Err(e) = inner.cache.remember(provider.id()).await {
			warn!("Failed to remember provider {}: {}", provider.id(), e);
		}

		let chain_id = provider.chain_id().await?;
		let address = provider
			.accounts()
			.await?
			.into_iter()
			.next()
			.ok_or(SessionError::ProviderDisconnect)?;

		let contract = ContractAddress::parse(&inner.contract_address)?;
		let ledger = inner.ledger_connector.connect(&contract, &address).await?;
		let gateway = Arc::new(ContractGateway::new(contract, ledger));

		let (sink, events) = mpsc::unbounded_channel();
		let listeners = subscribe_provider_events(provider.as_ref(), &sink).await;
		drop(sink);

		let provider_id = provider.id().to_string();
		let epoch = {
			let mut state = inner.state();
			state.epoch += 1;
			state.session = Session {
				connected: true,
				address: address.clone(),
				chain_id,
				provider: Some(provider_id.clone()),
			};
			state.live = Some(LiveSession {
				provider,
				gateway: gateway.clone(),
				listeners,
			});
			state.epoch
		};
		self.spawn_event_pump(epoch, events);

		info!(
			"Connected {} on chain {} via {}",
			address, chain_id, provider_id
		);
		inner
			.dispatcher
			.dispatch(&SessionEvent::Connected { address, chain_id })
			.await;

		Ok(gateway)
	}

	fn spawn_event_pump(&self, epoch: u64, mut events: mpsc::UnboundedReceiver<ProviderEvent>) {
		let session = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				let Some(inner) = session.upgrade() else {
					break;
				};
				WalletSession { inner }.apply_provider_event(epoch, event).await;
			}
			debug!("Provider event pump for session epoch {} stopped", epoch);
		});
	}

	/// Route a provider notification to its handler.
	///
	/// Ignored when no session is live.
	pub async fn handle_provider_event(&self, event: ProviderEvent) {
		let epoch = {
			let state = self.inner.state();
			if state.live.is_none() {
				debug!("Ignoring {:?}, no live session", event.kind());
				return;
			}
			state.epoch
		};
		self.apply_provider_event(epoch, event).await;
	}

	async fn apply_provider_event(&self, epoch: u64, event: ProviderEvent) {
		if !self.is_current(epoch) {
			debug!("Ignoring {:?} from a torn-down session", event.kind());
			return;
		}

		match event {
			ProviderEvent::AccountsChanged(accounts) => self.on_accounts_changed(accounts).await,
			ProviderEvent::NetworkChanged(chain_id) => self.on_network_changed(chain_id).await,
			ProviderEvent::Close => self.on_close().await,
		}
	}

	fn is_current(&self, epoch: u64) -> bool {
		let state = self.inner.state();
		state.epoch == epoch && state.live.is_some()
	}

	/// An empty account list resets the session; otherwise only the address changes.
	pub async fn on_accounts_changed(&self, accounts: Vec<String>) {
		let Some(address) = accounts.into_iter().next() else {
			info!("Provider reported no accounts, resetting session");
			self.teardown(ResetReason::AccountsLost).await;
			return;
		};

		{
			let mut state = self.inner.state();
			if !state.session.connected {
				debug!("Ignoring account change to {} while disconnected", address);
				return;
			}
			state.session.address = address.clone();
		}

		info!("Active account changed to {}", address);
		self.inner
			.dispatcher
			.dispatch(&SessionEvent::AccountChanged { address })
			.await;
	}

	/// Re-derive the chain id from the provider, falling back to the notified one.
	pub async fn on_network_changed(&self, chain_id: u64) {
		let (epoch, provider) = {
			let state = self.inner.state();
			match &state.live {
				Some(live) => (state.epoch, live.provider.clone()),
				None => {
					debug!("Ignoring network change to {} while disconnected", chain_id);
					return;
				}
			}
		};

		let derived = match provider.chain_id().await {
			Ok(derived) => derived,
			Err(e) => {
				warn!("Failed to re-derive chain id, using {}: {}", chain_id, e);
				chain_id
			}
		};

		{
			let mut state = self.inner.state();
			if state.epoch != epoch || state.live.is_none() {
				debug!("Session was reset while re-deriving the network");
				return;
			}
			state.session.chain_id = derived;
		}

		info!("Network changed to chain {}", derived);
		self.inner
			.dispatcher
			.dispatch(&SessionEvent::NetworkChanged { chain_id: derived })
			.await;
	}

	pub async fn on_close(&self) {
		info!("Provider closed the connection");
		self.teardown(ResetReason::ProviderClosed).await;
	}

	/// Tear the session down. Safe to call at any time; a second call is a no-op.
	pub async fn reset(&self) {
		self.teardown(ResetReason::Requested).await;
	}

	async fn teardown(&self, reason: ResetReason) {
		let live = {
			let mut state = self.inner.state();
			state.session = Session::default();
			let live = state.live.take();
			if live.is_some() {
				state.epoch += 1;
			}
			live
		};

		if let Err(e) = self.inner.cache.clear().await {
			warn!("Failed to clear cached provider: {}", e);
		}

		let Some(live) = live else {
			debug!("Session already reset");
			return;
		};

		info!("Resetting wallet session: {}", reason);
		for id in live.listeners {
			match live.provider.off(id).await {
				Ok(()) => {}
				Err(ProviderError::Unsupported) => {
					debug!("Provider {} does not support unsubscribing", live.provider.id());
					break;
				}
				Err(e) => warn!("Failed to remove provider {}: {}", id, e),
			}
		}

		// Handlers reset before the contract listeners are released; a ledger event stream that
		// closes in a live session counts as a lost subscription.
		self.inner
			.dispatcher
			.dispatch(&SessionEvent::Reset { reason })
			.await;

		let removed = live.gateway.remove_all_listeners().await;
		debug!("Released {} contract listeners", removed);
	}
}

async fn subscribe_provider_events(
	provider: &dyn WalletProvider,
	sink: &ProviderEventSink,
) -> Vec<ListenerId> {
	let mut listeners = Vec::with_capacity(ProviderEventKind::ALL.len());
	for kind in ProviderEventKind::ALL {
		match provider.on(kind, sink.clone()).await {
			Ok(id) => listeners.push(id),
			Err(ProviderError::Unsupported) => {
				debug!("Provider {} does not support event subscriptions", provider.id());
				break;
			}
			Err(e) => warn!("Failed to subscribe to {}: {}", kind.name(), e),
		}
	}
	listeners
}
