//!
//! JSON-RPC backed book ledger.
//!
//! Reads and writes go through HTTP calls against the ledger service; domain events arrive over a
//! WebSocket subscription. Settlement is observed by polling for the transaction receipt.

use super::types::*;
use crate::rpc::{JsonRpcClient, NotificationStream, RpcError};
use crate::utils::ListenerId;

use backoff::{ExponentialBackoffBuilder, future::retry};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound between two receipt polls.
const MAX_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Ledger backend talking JSON-RPC to the book-ledger service
pub struct RpcBookLedger {
	client: JsonRpcClient,
	contract: ContractAddress,
	/// Account the writes are sent from.
	account: String,
	receipt_poll_interval: Duration,
	next_listener: AtomicU64,
	subscriptions: Mutex<HashMap<ListenerId, JoinHandle<()>>>,
}

impl RpcBookLedger {
	pub fn new(
		client: JsonRpcClient,
		contract: ContractAddress,
		account: String,
		receipt_poll_interval: Duration,
	) -> Self {
		Self {
			client,
			contract,
			account,
			receipt_poll_interval,
			next_listener: AtomicU64::new(1),
			subscriptions: Mutex::new(HashMap::new()),
		}
	}

	fn subscriptions(&self) -> MutexGuard<'_, HashMap<ListenerId, JoinHandle<()>>> {
		self.subscriptions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	/// Send a mutating call and wrap the returned transaction hash.
	async fn submit(
		&self,
		method: &str,
		params: Value,
	) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		let result = self.client.call(method, params).await?;
		let hash = result.as_str().map(TxHash::new).ok_or_else(|| {
			LedgerError::MalformedResponse(format!("{} did not return a transaction hash", method))
		})?;

		debug!("{} accepted as transaction {}", method, hash);
		Ok(Box::new(RpcPendingTransaction {
			client: self.client.clone(),
			hash,
			poll_interval: self.receipt_poll_interval,
		}))
	}
}

#[async_trait::async_trait]
impl BookLedger for RpcBookLedger {
	async fn get_available_books(&self) -> Result<Vec<RawBook>, LedgerError> {
		let result = self
			.client
			.call("library_getAvailableBooks", json!([self.contract.as_str()]))
			.await?;

		decode_book_list(result)
	}

	async fn add_book(
		&self,
		title: &str,
		copies: u64,
	) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		self.submit(
			"library_addBook",
			json!([self.contract.as_str(), self.account, title, copies]),
		)
		.await
	}

	async fn borrow_book(&self, id: &BookId) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		self.submit(
			"library_borrowBook",
			json!([self.contract.as_str(), self.account, id]),
		)
		.await
	}

	async fn return_book(&self, id: &BookId) -> Result<Box<dyn PendingTransaction>, LedgerError> {
		self.submit(
			"library_returnBook",
			json!([self.contract.as_str(), self.account, id]),
		)
		.await
	}

	async fn subscribe(&self, sink: LedgerEventSink) -> Result<ListenerId, LedgerError> {
		let stream = self
			.client
			.subscribe("library_subscribe", json!([self.contract.as_str()]))
			.await?;

		let id = ListenerId::from_raw(self.next_listener.fetch_add(1, Ordering::Relaxed));
		let handle = tokio::spawn(forward_events(stream, sink, self.contract.clone()));

		self.subscriptions().insert(id, handle);
		info!("Subscribed {} to ledger events of {}", id, self.contract);
		Ok(id)
	}

	async fn remove_all_listeners(&self) -> usize {
		let handles: Vec<_> = self.subscriptions().drain().collect();
		for (id, handle) in &handles {
			debug!("Stopping ledger {}", id);
			handle.abort();
		}
		handles.len()
	}
}

impl Drop for RpcBookLedger {
	fn drop(&mut self) {
		for (_, handle) in self.subscriptions().drain() {
			handle.abort();
		}
	}
}

/// A submitted transaction whose receipt is polled over JSON-RPC.
struct RpcPendingTransaction {
	client: JsonRpcClient,
	hash: TxHash,
	poll_interval: Duration,
}

#[async_trait::async_trait]
impl PendingTransaction for RpcPendingTransaction {
	fn hash(&self) -> &TxHash {
		&self.hash
	}

	async fn wait(&self) -> Result<Receipt, LedgerError> {
		// Only a not-yet-mined receipt is polled again; any call failure rejects
		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.poll_interval)
			.with_max_interval(MAX_RECEIPT_POLL_INTERVAL.max(self.poll_interval))
			.with_max_elapsed_time(None)
			.build();

		let receipt = retry(policy, || async {
			let response = self
				.client
				.call("eth_getTransactionReceipt", json!([self.hash.as_str()]))
				.await;
			receipt_poll_outcome(&self.hash, response)
		})
		.await?;

		info!(
			"Transaction {} settled in block {:?} with status {:?}",
			self.hash, receipt.block_number, receipt.status
		);
		Ok(receipt)
	}
}

/// Interpret one receipt poll. Only a `null` receipt is polled again.
fn receipt_poll_outcome(
	hash: &TxHash,
	response: Result<Value, RpcError>,
) -> Result<Receipt, backoff::Error<LedgerError>> {
	let value = response.map_err(|e| backoff::Error::permanent(LedgerError::from(e)))?;
	if value.is_null() {
		debug!("Receipt for {} not available yet", hash);
		return Err(backoff::Error::transient(LedgerError::MalformedResponse(
			format!("Receipt for {} not available yet", hash),
		)));
	}
	Receipt::from_json(&value).map_err(backoff::Error::permanent)
}

/// A `null` book list is an empty library.
fn decode_book_list(result: Value) -> Result<Vec<RawBook>, LedgerError> {
	if result.is_null() {
		return Ok(Vec::new());
	}
	serde_json::from_value(result)
		.map_err(|e| LedgerError::MalformedResponse(format!("Failed to parse book list: {}", e)))
}

/// Decode subscription payloads into ledger events until the stream or the receiver ends.
async fn forward_events(
	mut stream: NotificationStream,
	sink: LedgerEventSink,
	contract: ContractAddress,
) {
	while let Some(item) = stream.next().await {
		match item {
			Ok(payload) => match serde_json::from_value::<LedgerEvent>(payload) {
				Ok(event) => {
					if sink.send(event).is_err() {
						debug!("Ledger event receiver for {} closed", contract);
						break;
					}
				}
				Err(e) => warn!("Ignoring undecodable ledger event: {}", e),
			},
			Err(e) => error!("Error in ledger subscription for {}: {}", contract, e),
		}
	}
	debug!("Ledger subscription for {} ended", contract);
}

/// Connector producing `RpcBookLedger`s that share one JSON-RPC client.
#[derive(Clone)]
pub struct RpcLedgerConnector {
	client: JsonRpcClient,
	receipt_poll_interval: Duration,
}

impl RpcLedgerConnector {
	pub fn new(client: JsonRpcClient, receipt_poll_interval: Duration) -> Self {
		Self {
			client,
			receipt_poll_interval,
		}
	}
}

#[async_trait::async_trait]
impl LedgerConnector for RpcLedgerConnector {
	async fn connect(
		&self,
		contract: &ContractAddress,
		account: &str,
	) -> Result<Arc<dyn BookLedger>, LedgerError> {
		info!(
			"Binding book ledger {} for account {} via {}",
			contract,
			account,
			self.client.rpc_url()
		);
		Ok(Arc::new(RpcBookLedger::new(
			self.client.clone(),
			contract.clone(),
			account.to_string(),
			self.receipt_poll_interval,
		)))
	}
}
