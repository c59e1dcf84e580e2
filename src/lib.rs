//! Session and transaction synchronization core of the book-library client.
//!
//! A `WalletSession` owns the connection to a wallet provider and the contract gateway bound to
//! it. A `LedgerSyncEngine` keeps the local book list consistent with the ledger, tracks writes in
//! flight and reports outcomes through a `NotificationSink`. `LibraryClient` wires the two.

pub mod chain;
pub mod client;
pub mod config;
pub mod ledger;
pub mod notification;
pub mod rpc;
pub mod sync;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod testing;

pub use client::{ClientError, LibraryClient};
pub use config::ClientConfig;
