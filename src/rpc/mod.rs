//! JSON-RPC integration for the wallet node and the book-ledger service
//!
//! This module provides the client and types for talking to a JSON-RPC 2.0 endpoint over HTTP,
//! plus WebSocket subscriptions for pushed notifications. Both the RPC-backed wallet provider and
//! the RPC-backed ledger are built on top of it.

/// HTTP and WebSocket JSON-RPC client
mod client;
/// Wire types, errors and quantity parsing
mod types;

pub use client::{JsonRpcClient, NotificationStream};
pub use types::*;
