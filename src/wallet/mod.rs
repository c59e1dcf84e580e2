//! Wallet connection management
//!
//! This module owns the wallet side of the client: the provider capability interface, the
//! remembered-provider cache and the `WalletSession` lifecycle built on top of them.

/// Remembered provider persistence
pub mod cache;
/// Provider capability trait and implementations
pub mod provider;
/// Session lifecycle
pub mod session;
/// Session data and error types
mod types;

pub use cache::{FileProviderCache, MemoryProviderCache, ProviderCacheRepository};
pub use provider::{
	ProviderConnector, ProviderEvent, ProviderEventKind, ProviderEventSink, RpcWalletProvider,
	StaticConnector, WalletProvider,
};
pub use session::WalletSession;
pub use types::*;
