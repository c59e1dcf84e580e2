//! Listener bookkeeping for event sources.
//!
//! Wallet providers and ledger backends both expose an `on`/`off` style API. The registry keeps
//! one unbounded channel per registered listener, tagged with the event kind it asked for, and
//! prunes listeners whose receiving side has gone away.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Handle returned when a listener is registered, used to unregister it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
	pub fn from_raw(value: u64) -> Self {
		Self(value)
	}
}

impl fmt::Display for ListenerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "listener#{}", self.0)
	}
}

/// Registry of channel-backed listeners keyed by event kind.
pub struct ListenerRegistry<K, E> {
	next_id: AtomicU64,
	listeners: Mutex<Vec<(ListenerId, K, UnboundedSender<E>)>>,
}

impl<K: Copy + PartialEq + fmt::Debug, E: Clone> ListenerRegistry<K, E> {
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			listeners: Mutex::new(Vec::new()),
		}
	}

	fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, K, UnboundedSender<E>)>> {
		self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Register a listener for `kind`.
	pub fn add(&self, kind: K, sink: UnboundedSender<E>) -> ListenerId {
		let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.listeners().push((id, kind, sink));
		debug!("Registered {} for {:?}", id, kind);
		id
	}

	/// Remove a listener. Returns false if it was not registered.
	pub fn remove(&self, id: ListenerId) -> bool {
		let mut listeners = self.listeners();
		let before = listeners.len();
		listeners.retain(|(listener_id, _, _)| *listener_id != id);
		before != listeners.len()
	}

	/// Deliver `event` to every listener of `kind`, returning how many received it.
	pub fn emit(&self, kind: K, event: E) -> usize {
		let mut listeners = self.listeners();
		let mut delivered = 0;
		listeners.retain(|(id, listener_kind, sink)| {
			if *listener_kind != kind {
				return true;
			}
			match sink.send(event.clone()) {
				Ok(()) => {
					delivered += 1;
					true
				}
				Err(_) => {
					debug!("Dropping closed {}", id);
					false
				}
			}
		});
		delivered
	}

	/// Remove every listener, returning how many were registered.
	pub fn clear(&self) -> usize {
		let mut listeners = self.listeners();
		let count = listeners.len();
		listeners.clear();
		count
	}

	pub fn len(&self) -> usize {
		self.listeners().len()
	}

	pub fn is_empty(&self) -> bool {
		self.listeners().is_empty()
	}
}

impl<K: Copy + PartialEq + fmt::Debug, E: Clone> Default for ListenerRegistry<K, E> {
	fn default() -> Self {
		Self::new()
	}
}
