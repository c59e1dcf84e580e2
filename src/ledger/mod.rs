//! Book-ledger contract integration.
//!
//! The remote contract is an opaque service with a fixed method and event contract. `BookLedger`
//! is the seam to that service; `ContractGateway` is the typed façade the rest of the crate uses,
//! adding input validation and response normalization on top of any backend.

/// Typed façade over a ledger backend
pub mod gateway;
/// JSON-RPC backed ledger
pub mod rpc;
/// Ledger data types, errors and backend traits
mod types;

pub use gateway::{ContractGateway, SubmittedTransaction};
pub use rpc::{RpcBookLedger, RpcLedgerConnector};
pub use types::*;
