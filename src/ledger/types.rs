use crate::rpc::{RemoteFailure, RpcError, parse_quantity};
use crate::utils::ListenerId;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// Opaque book identifier as assigned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for BookId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<u64> for BookId {
	fn from(id: u64) -> Self {
		Self(id.to_string())
	}
}

impl From<&str> for BookId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for BookId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl<'de> Deserialize<'de> for BookId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum RawId {
			Text(String),
			Number(u64),
		}

		Ok(match RawId::deserialize(deserializer)? {
			RawId::Text(id) => BookId(id),
			RawId::Number(id) => BookId::from(id),
		})
	}
}

/// A book as held in the local book list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
	pub id: BookId,
	pub title: String,
	#[serde(rename = "numberOfCopies")]
	pub number_of_copies: u64,
}

impl Book {
	pub fn new(id: impl Into<BookId>, title: impl Into<String>, number_of_copies: u64) -> Self {
		Self {
			id: id.into(),
			title: title.into(),
			number_of_copies,
		}
	}
}

/// A book record as returned by the ledger, before its copy count is normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBook {
	pub id: BookId,
	pub title: String,
	#[serde(rename = "numberOfCopies", alias = "copies")]
	pub number_of_copies: Value,
}

impl RawBook {
	pub fn new(id: impl Into<BookId>, title: impl Into<String>, copies: impl Into<Value>) -> Self {
		Self {
			id: id.into(),
			title: title.into(),
			number_of_copies: copies.into(),
		}
	}
}

/// Hash of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
	pub fn new(hash: impl Into<String>) -> Self {
		Self(hash.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TxHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Receipt status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
	Unsuccessful = 0,
	Successful = 1,
}

impl TransactionStatus {
	pub fn from_code(code: u64) -> Option<Self> {
		match code {
			0 => Some(TransactionStatus::Unsuccessful),
			1 => Some(TransactionStatus::Successful),
			_ => None,
		}
	}
}

/// Confirmation of a settled transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
	pub transaction_hash: TxHash,
	/// `None` on chains that do not report a status; treated as success.
	pub status: Option<TransactionStatus>,
	pub block_number: Option<u64>,
}

impl Receipt {
	pub fn new(transaction_hash: TxHash, status: TransactionStatus) -> Self {
		Self {
			transaction_hash,
			status: Some(status),
			block_number: None,
		}
	}

	pub fn succeeded(&self) -> bool {
		self.status != Some(TransactionStatus::Unsuccessful)
	}

	/// Parse an `eth_getTransactionReceipt` style object.
	pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
		let transaction_hash = value
			.get("transactionHash")
			.and_then(Value::as_str)
			.map(TxHash::new)
			.ok_or_else(|| {
				LedgerError::MalformedResponse("Receipt without transactionHash".to_string())
			})?;

		let status = match value.get("status") {
			None | Some(Value::Null) => None,
			Some(raw) => {
				let code = parse_quantity(raw).ok_or_else(|| {
					LedgerError::MalformedResponse(format!("Invalid receipt status: {}", raw))
				})?;
				Some(TransactionStatus::from_code(code).ok_or_else(|| {
					LedgerError::MalformedResponse(format!("Unknown receipt status: {}", code))
				})?)
			}
		};

		let block_number = value.get("blockNumber").and_then(parse_quantity);

		Ok(Self {
			transaction_hash,
			status,
			block_number,
		})
	}
}

/// Kinds of domain events emitted by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerEventKind {
	BookAdded,
	BookBorrowed,
	BookReturned,
}

impl LedgerEventKind {
	pub const ALL: [LedgerEventKind; 3] = [
		LedgerEventKind::BookAdded,
		LedgerEventKind::BookBorrowed,
		LedgerEventKind::BookReturned,
	];
}

/// Domain events emitted by the ledger. Fields beyond `id` are only used for message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LedgerEvent {
	BookAdded {
		id: BookId,
		#[serde(default)]
		title: String,
		#[serde(rename = "numberOfCopies", alias = "copies", default)]
		number_of_copies: Value,
	},
	BookBorrowed {
		id: BookId,
		#[serde(alias = "user", default)]
		borrower: String,
	},
	BookReturned {
		id: BookId,
		#[serde(alias = "user", default)]
		borrower: String,
	},
}

impl LedgerEvent {
	pub fn kind(&self) -> LedgerEventKind {
		match self {
			LedgerEvent::BookAdded { .. } => LedgerEventKind::BookAdded,
			LedgerEvent::BookBorrowed { .. } => LedgerEventKind::BookBorrowed,
			LedgerEvent::BookReturned { .. } => LedgerEventKind::BookReturned,
		}
	}

	pub fn book_id(&self) -> &BookId {
		match self {
			LedgerEvent::BookAdded { id, .. }
			| LedgerEvent::BookBorrowed { id, .. }
			| LedgerEvent::BookReturned { id, .. } => id,
		}
	}
}

/// Channel a ledger backend delivers domain events into.
pub type LedgerEventSink = UnboundedSender<LedgerEvent>;

/// Error types for ledger reads and writes
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
	#[error("Invalid input: {0}")]
	InvalidInput(String),

	#[error("Remote call failed: {0}")]
	RemoteCallFailure(RemoteFailure),

	#[error("Transaction {tx_hash} was not successful")]
	OnChainFailure { tx_hash: TxHash },

	#[error("Malformed ledger response: {0}")]
	MalformedResponse(String),
}

impl LedgerError {
	/// Text shown to the user for this failure.
	pub fn user_message(&self) -> String {
		match self {
			LedgerError::InvalidInput(reason) => format!("Invalid input: {}", reason),
			LedgerError::RemoteCallFailure(failure) => failure.describe(),
			LedgerError::OnChainFailure { .. } => "Operation is not successful!".to_string(),
			LedgerError::MalformedResponse(reason) => format!("Error: {}", reason),
		}
	}
}

impl From<RpcError> for LedgerError {
	fn from(error: RpcError) -> Self {
		LedgerError::RemoteCallFailure(error.into())
	}
}

impl From<RemoteFailure> for LedgerError {
	fn from(failure: RemoteFailure) -> Self {
		LedgerError::RemoteCallFailure(failure)
	}
}

/// Error returned when a contract address is not well-formed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Provided contract address is not valid: {0:?}")]
pub struct AddressError(pub String);

/// A well-formed 20-byte hex contract address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContractAddress(String);

impl ContractAddress {
	pub fn parse(address: &str) -> Result<Self, AddressError> {
		let trimmed = address.trim();
		let digits = trimmed
			.strip_prefix("0x")
			.or_else(|| trimmed.strip_prefix("0X"))
			.ok_or_else(|| AddressError(address.to_string()))?;

		if digits.len() != 40 {
			return Err(AddressError(address.to_string()));
		}
		hex::decode(digits).map_err(|_| AddressError(address.to_string()))?;

		Ok(Self(format!("0x{}", digits)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ContractAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Handle to a submitted, not yet settled, transaction.
#[async_trait::async_trait]
pub trait PendingTransaction: Send + Sync {
	fn hash(&self) -> &TxHash;

	/// Wait for settlement. Resolves with the receipt whatever its status, or rejects.
	async fn wait(&self) -> Result<Receipt, LedgerError>;
}

/// Backend for the remote book-ledger contract.
#[async_trait::async_trait]
pub trait BookLedger: Send + Sync {
	/// Enumerate the books currently on the ledger, in ledger order.
	async fn get_available_books(&self) -> Result<Vec<RawBook>, LedgerError>;

	async fn add_book(
		&self,
		title: &str,
		copies: u64,
	) -> Result<Box<dyn PendingTransaction>, LedgerError>;

	async fn borrow_book(&self, id: &BookId) -> Result<Box<dyn PendingTransaction>, LedgerError>;

	async fn return_book(&self, id: &BookId) -> Result<Box<dyn PendingTransaction>, LedgerError>;

	/// Deliver every domain event into `sink` until the listener is removed.
	async fn subscribe(&self, sink: LedgerEventSink) -> Result<ListenerId, LedgerError>;

	/// Drop every listener registered through `subscribe`, returning how many there were.
	async fn remove_all_listeners(&self) -> usize;
}

/// Builds a ledger backend bound to a contract address and the connected account.
#[async_trait::async_trait]
pub trait LedgerConnector: Send + Sync {
	async fn connect(
		&self,
		contract: &ContractAddress,
		account: &str,
	) -> Result<std::sync::Arc<dyn BookLedger>, LedgerError>;
}
