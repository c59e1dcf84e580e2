//! Session event system.
//!
//! The wallet session announces lifecycle changes (connect, account switch, network switch,
//! teardown) as `SessionEvent`s. Interested components register a `SessionEventHandler` with the
//! session's `EventDispatcher`; the sync engine is the main one, returning to `Idle` on reset and
//! tracking the chain id for explorer links.

use crate::sync::EngineError;
use crate::wallet::ResetReason;

use std::sync::{Arc, PoisonError, RwLock};

/// Events emitted by the wallet session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was established
    Connected { address: String, chain_id: u64 },
    /// The active account changed within the session
    AccountChanged { address: String },
    /// The provider switched networks
    NetworkChanged { chain_id: u64 },
    /// The session was torn down
    Reset { reason: ResetReason },
}

/// Trait for handling session events.
#[async_trait::async_trait]
pub trait SessionEventHandler: Send + Sync {
    /// Handle a session event.
    async fn handle(&self, event: &SessionEvent) -> Result<(), EngineError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in the order they are registered. Registration may happen while the
/// session is live, so the handler list sits behind a lock that is released before dispatching.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn SessionEventHandler>>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    pub fn register_handler(&self, handler: Arc<dyn SessionEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&self, event: &SessionEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
                // Continue processing with other handlers
            }
        }
    }
}
