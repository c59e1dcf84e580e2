//! Typed façade over the remote book-ledger contract.
//!
//! The gateway validates write parameters before anything reaches the network and normalizes
//! the ledger's enumeration into plain `Book` values. Writes return as soon as the transaction
//! is submitted; settlement is awaited separately through `SubmittedTransaction`.

use super::types::*;
use crate::utils::ListenerId;

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Gateway bound to one contract address and one ledger backend.
pub struct ContractGateway {
	address: ContractAddress,
	ledger: Arc<dyn BookLedger>,
}

impl ContractGateway {
	pub fn new(address: ContractAddress, ledger: Arc<dyn BookLedger>) -> Self {
		Self { address, ledger }
	}

	pub fn address(&self) -> &ContractAddress {
		&self.address
	}

	/// Read the full book list from the ledger.
	///
	/// Copy counts are normalized to `u64`. An empty ledger yields an empty list.
	pub async fn list_available_books(&self) -> Result<Vec<Book>, LedgerError> {
		let raw_books = self.ledger.get_available_books().await?;
		let books = normalize_books(raw_books)?;
		debug!("Fetched {} books from {}", books.len(), self.address);
		Ok(books)
	}

	/// Check the parameters of `add_book` without contacting the ledger.
	pub fn validate_new_book(title: &str, copies: u64) -> Result<(), LedgerError> {
		if title.trim().is_empty() {
			return Err(LedgerError::InvalidInput("title must not be empty".to_string()));
		}
		if copies == 0 {
			return Err(LedgerError::InvalidInput(
				"number of copies must be positive".to_string(),
			));
		}
		Ok(())
	}

	/// Check a book id without contacting the ledger.
	pub fn validate_book_id(id: &BookId) -> Result<(), LedgerError> {
		if id.as_str().trim().is_empty() {
			return Err(LedgerError::InvalidInput("book id must not be empty".to_string()));
		}
		Ok(())
	}

	pub async fn add_book(
		&self,
		title: &str,
		copies: u64,
	) -> Result<SubmittedTransaction, LedgerError> {
		Self::validate_new_book(title, copies)?;
		let handle = self.ledger.add_book(title.trim(), copies).await?;
		info!("Submitted addBook({:?}, {}) as {}", title.trim(), copies, handle.hash());
		Ok(SubmittedTransaction::new(handle))
	}

	pub async fn borrow_book(&self, id: &BookId) -> Result<SubmittedTransaction, LedgerError> {
		Self::validate_book_id(id)?;
		let handle = self.ledger.borrow_book(id).await?;
		info!("Submitted borrowBook({}) as {}", id, handle.hash());
		Ok(SubmittedTransaction::new(handle))
	}

	pub async fn return_book(&self, id: &BookId) -> Result<SubmittedTransaction, LedgerError> {
		Self::validate_book_id(id)?;
		let handle = self.ledger.return_book(id).await?;
		info!("Submitted returnBook({}) as {}", id, handle.hash());
		Ok(SubmittedTransaction::new(handle))
	}

	/// Subscribe `sink` to the ledger's domain events.
	pub async fn subscribe(&self, sink: LedgerEventSink) -> Result<ListenerId, LedgerError> {
		self.ledger.subscribe(sink).await
	}

	/// Release every domain-event listener held on this contract.
	pub async fn remove_all_listeners(&self) -> usize {
		let removed = self.ledger.remove_all_listeners().await;
		debug!("Removed {} contract listeners from {}", removed, self.address);
		removed
	}
}

/// Normalize raw ledger records, rejecting bad copy counts and duplicate ids.
fn normalize_books(raw_books: Vec<RawBook>) -> Result<Vec<Book>, LedgerError> {
	let mut seen = HashSet::with_capacity(raw_books.len());
	raw_books
		.into_iter()
		.map(|raw| {
			let number_of_copies =
				crate::rpc::parse_quantity(&raw.number_of_copies).ok_or_else(|| {
					LedgerError::MalformedResponse(format!(
						"Invalid number of copies for book {}: {}",
						raw.id, raw.number_of_copies
					))
				})?;
			if !seen.insert(raw.id.clone()) {
				return Err(LedgerError::MalformedResponse(format!(
					"Duplicate book id {}",
					raw.id
				)));
			}
			Ok(Book {
				id: raw.id,
				title: raw.title,
				number_of_copies,
			})
		})
		.collect()
}

/// A submitted write together with the means to await its settlement.
pub struct SubmittedTransaction {
	handle: Box<dyn PendingTransaction>,
}

impl SubmittedTransaction {
	pub fn new(handle: Box<dyn PendingTransaction>) -> Self {
		Self { handle }
	}

	pub fn hash(&self) -> &TxHash {
		self.handle.hash()
	}

	/// Wait for the receipt, whatever its status.
	pub async fn wait(&self) -> Result<Receipt, LedgerError> {
		self.handle.wait().await
	}

	/// Wait for settlement, treating a failed receipt as `LedgerError::OnChainFailure`.
	pub async fn settle(&self) -> Result<Receipt, LedgerError> {
		let receipt = self.wait().await?;
		if receipt.succeeded() {
			Ok(receipt)
		} else {
			Err(LedgerError::OnChainFailure {
				tx_hash: receipt.transaction_hash,
			})
		}
	}
}
