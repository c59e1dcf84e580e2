//! In-memory doubles shared by the unit tests.

use crate::ledger::*;
use crate::notification::{Notification, NotificationSink, Severity};
use crate::sync::{EngineError, SessionEvent, SessionEventHandler};
use crate::utils::{ListenerId, ListenerRegistry};
use crate::wallet::{
	ProviderConnector, ProviderError, ProviderEvent, ProviderEventKind, ProviderEventSink,
	WalletProvider,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

pub const CONTRACT: &str = "0x52908400098527886E0F7030069857D2E4169EE7";
pub const ACCOUNT: &str = "0xAAA";

/// Wait until `condition` holds, yielding to spawned tasks in between.
pub async fn eventually(condition: impl Fn() -> bool) {
	let wait = async {
		while !condition() {
			tokio::task::yield_now().await;
		}
	};
	tokio::time::timeout(Duration::from_secs(1), wait)
		.await
		.expect("condition not reached in time");
}

type Settlement = Option<Result<Receipt, LedgerError>>;

struct MockPendingTransaction {
	hash: TxHash,
	outcome: watch::Receiver<Settlement>,
}

#[async_trait::async_trait]
impl PendingTransaction for MockPendingTransaction {
	fn hash(&self) -> &TxHash {
		&self.hash
	}

	async fn wait(&self) -> Result<Receipt, LedgerError> {
		let mut outcome = self.outcome.clone();
		let settled = outcome
			.wait_for(Option::is_some)
			.await
			.map_err(|_| LedgerError::MalformedResponse("settlement dropped".to_string()))?;
		settled
			.clone()
			.unwrap_or_else(|| Err(LedgerError::MalformedResponse("unsettled".to_string())))
	}
}

#[derive(Default)]
struct MockLedgerState {
	books: Vec<RawBook>,
	read_results: VecDeque<Result<Vec<RawBook>, LedgerError>>,
	read_count: usize,
	hold_reads: bool,
	held: HashMap<usize, oneshot::Sender<()>>,
	writes: Vec<String>,
	fail_next_submission: Option<LedgerError>,
	tx_counter: u64,
	auto_settle: Option<TransactionStatus>,
	presettled: VecDeque<Result<TransactionStatus, LedgerError>>,
	unsettled: VecDeque<(TxHash, watch::Sender<Settlement>)>,
	subscribe_count: usize,
}

/// Scriptable in-memory ledger.
///
/// Reads return the current book list (or a queued one-off result); each read snapshots its
/// result when it starts and can be held until released. Writes stay unsettled until
/// `settle_next`/`reject_next`, unless `auto_settle` is set.
pub struct MockLedger {
	state: Mutex<MockLedgerState>,
	listeners: ListenerRegistry<(), LedgerEvent>,
}

impl MockLedger {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(MockLedgerState::default()),
			listeners: ListenerRegistry::new(),
		}
	}

	fn state(&self) -> MutexGuard<'_, MockLedgerState> {
		self.state.lock().unwrap()
	}

	pub fn set_books(&self, books: Vec<RawBook>) {
		self.state().books = books;
	}

	pub fn push_read_result(&self, result: Result<Vec<RawBook>, LedgerError>) {
		self.state().read_results.push_back(result);
	}

	pub fn hold_reads(&self, hold: bool) {
		self.state().hold_reads = hold;
	}

	/// Let the `n`th read (1-based) complete.
	pub fn release_read(&self, n: usize) -> bool {
		match self.state().held.remove(&n) {
			Some(gate) => gate.send(()).is_ok(),
			None => false,
		}
	}

	pub fn held_reads(&self) -> usize {
		self.state().held.len()
	}

	pub fn read_count(&self) -> usize {
		self.state().read_count
	}

	pub fn writes(&self) -> Vec<String> {
		self.state().writes.clone()
	}

	pub fn write_count(&self) -> usize {
		self.state().writes.len()
	}

	pub fn fail_next_submission(&self, error: LedgerError) {
		self.state().fail_next_submission = Some(error);
	}

	pub fn auto_settle(&self, status: Option<TransactionStatus>) {
		self.state().auto_settle = status;
	}

	/// Settle the oldest unsettled write, or the next one submitted.
	pub fn settle_next(&self, status: TransactionStatus) {
		self.resolve_next(Ok(status));
	}

	/// Reject the oldest unsettled write, or the next one submitted.
	pub fn reject_next(&self, error: LedgerError) {
		self.resolve_next(Err(error));
	}

	fn resolve_next(&self, outcome: Result<TransactionStatus, LedgerError>) {
		let mut state = self.state();
		match state.unsettled.pop_front() {
			Some((hash, sender)) => {
				sender.send_replace(Some(outcome.map(|status| Receipt::new(hash, status))));
			}
			None => state.presettled.push_back(outcome),
		}
	}

	pub fn pending_settlements(&self) -> usize {
		self.state().unsettled.len()
	}

	/// Push a domain event to every subscriber.
	pub fn emit(&self, event: LedgerEvent) -> usize {
		self.listeners.emit((), event)
	}

	pub fn listener_count(&self) -> usize {
		self.listeners.len()
	}

	pub fn subscribe_count(&self) -> usize {
		self.state().subscribe_count
	}

	fn submit(&self, label: String) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		let mut state = self.state();
		state.writes.push(label);
		if let Some(error) = state.fail_next_submission.take() {
			return Err(error);
		}

		state.tx_counter += 1;
		let hash = TxHash::new(format!("0x{:064x}", state.tx_counter));
		let (sender, outcome) = watch::channel(None);

		let settled = state
			.presettled
			.pop_front()
			.or_else(|| state.auto_settle.map(Ok));
		match settled {
			Some(result) => {
				sender.send_replace(Some(result.map(|status| Receipt::new(hash.clone(), status))));
			}
			None => state.unsettled.push_back((hash.clone(), sender)),
		}

		Ok(Box::new(MockPendingTransaction { hash, outcome }))
	}
}

#[async_trait::async_trait]
impl BookLedger for MockLedger {
	async fn get_available_books(&self) -> Result<Vec<RawBook>, LedgerError> {
		let (result, gate) = {
			let mut state = self.state();
			state.read_count += 1;
			let read = state.read_count;
			let result = match state.read_results.pop_front() {
				Some(result) => result,
				None => Ok(state.books.clone()),
			};
			let gate = if state.hold_reads {
				let (release, gate) = oneshot::channel();
				state.held.insert(read, release);
				Some(gate)
			} else {
				None
			};
			(result, gate)
		};

		if let Some(gate) = gate {
			let _ = gate.await;
		}
		result
	}

	async fn add_book(
		&self,
		title: &str,
		copies: u64,
	) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		self.submit(format!("add:{}:{}", title, copies))
	}

	async fn borrow_book(&self, id: &BookId) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		self.submit(format!("borrow:{}", id))
	}

	async fn return_book(&self, id: &BookId) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		self.submit(format!("return:{}", id))
	}

	async fn subscribe(&self, sink: LedgerEventSink) -> Result<ListenerId, LedgerError> {
		self.state().subscribe_count += 1;
		Ok(self.listeners.add((), sink))
	}

	async fn remove_all_listeners(&self) -> usize {
		self.listeners.clear()
	}
}

/// Ledger connector handing out one shared `MockLedger`.
pub struct MockLedgerConnector {
	ledger: Arc<MockLedger>,
	accounts: Mutex<Vec<String>>,
}

impl MockLedgerConnector {
	pub fn new(ledger: Arc<MockLedger>) -> Self {
		Self {
			ledger,
			accounts: Mutex::new(Vec::new()),
		}
	}

	/// Accounts the ledger was bound for, one per connect.
	pub fn accounts(&self) -> Vec<String> {
		self.accounts.lock().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl LedgerConnector for MockLedgerConnector {
	async fn connect(
		&self,
		_contract: &ContractAddress,
		account: &str,
	) -> Result<Arc<dyn BookLedger>, LedgerError> {
		self.accounts.lock().unwrap().push(account.to_string());
		Ok(self.ledger.clone())
	}
}

/// Scriptable wallet provider.
pub struct MockProvider {
	id: String,
	accounts: Mutex<Vec<String>>,
	chain_id: AtomicU64,
	fail_chain_id: AtomicBool,
	supports_off: bool,
	listeners: ListenerRegistry<ProviderEventKind, ProviderEvent>,
}

impl MockProvider {
	pub fn new(id: &str, accounts: &[&str], chain_id: u64) -> Self {
		Self {
			id: id.to_string(),
			accounts: Mutex::new(accounts.iter().map(|a| a.to_string()).collect()),
			chain_id: AtomicU64::new(chain_id),
			fail_chain_id: AtomicBool::new(false),
			supports_off: true,
			listeners: ListenerRegistry::new(),
		}
	}

	/// A provider whose `off` is unsupported.
	pub fn without_off(mut self) -> Self {
		self.supports_off = false;
		self
	}

	pub fn set_accounts(&self, accounts: &[&str]) {
		*self.accounts.lock().unwrap() = accounts.iter().map(|a| a.to_string()).collect();
	}

	pub fn set_chain_id(&self, chain_id: u64) {
		self.chain_id.store(chain_id, Ordering::SeqCst);
	}

	pub fn fail_chain_id(&self, fail: bool) {
		self.fail_chain_id.store(fail, Ordering::SeqCst);
	}

	pub fn emit(&self, event: ProviderEvent) -> usize {
		self.listeners.emit(event.kind(), event)
	}

	pub fn listener_count(&self) -> usize {
		self.listeners.len()
	}
}

#[async_trait::async_trait]
impl WalletProvider for MockProvider {
	fn id(&self) -> &str {
		&self.id
	}

	async fn accounts(&self) -> Result<Vec<String>, ProviderError> {
		Ok(self.accounts.lock().unwrap().clone())
	}

	async fn chain_id(&self) -> Result<u64, ProviderError> {
		if self.fail_chain_id.load(Ordering::SeqCst) {
			return Err(ProviderError::Remote(crate::rpc::RemoteFailure::message(
				"network unavailable",
			)));
		}
		Ok(self.chain_id.load(Ordering::SeqCst))
	}

	async fn on(
		&self,
		kind: ProviderEventKind,
		sink: ProviderEventSink,
	) -> Result<ListenerId, ProviderError> {
		Ok(self.listeners.add(kind, sink))
	}

	async fn off(&self, id: ListenerId) -> Result<(), ProviderError> {
		if !self.supports_off {
			return Err(ProviderError::Unsupported);
		}
		self.listeners.remove(id);
		Ok(())
	}
}

/// Provider selection flow returning a `MockProvider`.
pub struct MockConnector {
	provider: Arc<MockProvider>,
	cancel_next: AtomicBool,
	connects: AtomicUsize,
	preferences: Mutex<Vec<Option<String>>>,
}

impl MockConnector {
	pub fn new(provider: Arc<MockProvider>) -> Self {
		Self {
			provider,
			cancel_next: AtomicBool::new(false),
			connects: AtomicUsize::new(0),
			preferences: Mutex::new(Vec::new()),
		}
	}

	/// Make the next selection end as if the user closed the picker.
	pub fn cancel_next(&self) {
		self.cancel_next.store(true, Ordering::SeqCst);
	}

	pub fn connect_count(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn preferences(&self) -> Vec<Option<String>> {
		self.preferences.lock().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl ProviderConnector for MockConnector {
	async fn connect(
		&self,
		preferred: Option<&str>,
	) -> Result<Arc<dyn WalletProvider>, ProviderError> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		self.preferences
			.lock()
			.unwrap()
			.push(preferred.map(str::to_string));
		if self.cancel_next.swap(false, Ordering::SeqCst) {
			return Err(ProviderError::Cancelled);
		}
		Ok(self.provider.clone())
	}
}

/// Notification sink that records everything.
#[derive(Default)]
pub struct RecordingSink {
	notifications: Mutex<Vec<Notification>>,
}

impl RecordingSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn all(&self) -> Vec<Notification> {
		self.notifications.lock().unwrap().clone()
	}

	pub fn messages(&self) -> Vec<String> {
		self.all().into_iter().map(|n| n.message).collect()
	}

	pub fn count(&self, severity: Severity) -> usize {
		self.all()
			.iter()
			.filter(|n| n.severity == severity)
			.count()
	}

	pub fn clear(&self) {
		self.notifications.lock().unwrap().clear();
	}
}

impl NotificationSink for RecordingSink {
	fn notify(&self, notification: Notification) {
		self.notifications.lock().unwrap().push(notification);
	}
}

/// Session event handler that records everything.
#[derive(Default)]
pub struct RecordingHandler {
	events: Mutex<Vec<SessionEvent>>,
}

impl RecordingHandler {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn events(&self) -> Vec<SessionEvent> {
		self.events.lock().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl SessionEventHandler for RecordingHandler {
	async fn handle(&self, event: &SessionEvent) -> Result<(), EngineError> {
		self.events.lock().unwrap().push(event.clone());
		Ok(())
	}

	fn name(&self) -> &'static str {
		"recorder"
	}
}
