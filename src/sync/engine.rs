//! Ledger sync engine, the core state machine of the client.
//!
//! This module defines `LedgerSyncEngine`, which owns the local book list and the set of pending
//! writes. It is bound to a contract gateway by `initialize`, and from then on:
//! - performs a full read of the ledger and moves through `Loading` to `Ready` (or `Faulted`)
//! - listens to the ledger's domain events and re-reads the full list after each one
//! - admits writes only when no conflicting write is outstanding, reports their submission and
//!   settlement, and re-reads the list after a successful settlement
//! - returns to `Idle` when the wallet session is reset
//!
//! Every reconciliation is a complete read that replaces the list wholesale. Reads take a ticket
//! when they start and a finished read is applied only if no later-started read has already been
//! applied, so the list always equals one authoritative read. Results arriving after a reset
//! belong to an older epoch and are discarded without notifications.

use crate::chain::ChainDirectory;
use crate::ledger::{
    Book, BookId, ContractGateway, LedgerError, LedgerEvent, Receipt, SubmittedTransaction,
};
use crate::notification::{Notification, NotificationSink};
use crate::rpc::parse_quantity;
use crate::sync::events::{SessionEvent, SessionEventHandler};
use crate::sync::pending::{OperationKind, PendingOperation, PendingOperations};
use crate::sync::types::*;
use crate::utils::ellipse_address;
use crate::wallet::DEFAULT_CHAIN_ID;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BOOKS_LOADED_MESSAGE: &str = "Books loaded.";
const BOOKS_REFRESHED_MESSAGE: &str = "Books info refreshed.";
const TRANSACTION_STARTED_MESSAGE: &str = "Transaction started. Check status from the link.";
const OPERATION_SUCCESSFUL_MESSAGE: &str = "Operation is successful.";
const EVENTS_INTERRUPTED_MESSAGE: &str =
    "Live book updates were interrupted. Refresh to resume them.";

/// The ledger sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LedgerSyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    directory: ChainDirectory,
    notifier: Arc<dyn NotificationSink>,
    state: Mutex<EngineState>,
    phase: watch::Sender<EnginePhase>,
    books: watch::Sender<Vec<Book>>,
}

struct EngineState {
    epoch: u64,
    phase: EnginePhase,
    books: Vec<Book>,
    /// Chain of the session, used for explorer links
    chain_id: u64,
    gateway: Option<Arc<ContractGateway>>,
    /// Whether domain events of `gateway` are subscribed (or being subscribed)
    subscribed: bool,
    event_pump: Option<JoinHandle<()>>,
    pending: PendingOperations,
    /// Last ticket handed out to a read
    next_ticket: u64,
    /// Ticket of the read currently reflected in `books`
    applied_ticket: u64,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, state: &mut EngineState, phase: EnginePhase) {
        if state.phase != phase {
            debug!("Sync engine phase {} -> {}", state.phase, phase);
        }
        state.phase = phase;
        self.phase.send_replace(phase);
    }

    /// Set the phase if `epoch` is still current. Returns false for a stale epoch.
    fn finish(&self, epoch: u64, phase: EnginePhase) -> bool {
        let mut state = self.state();
        if state.epoch != epoch {
            return false;
        }
        self.set_phase(&mut state, phase);
        true
    }

    fn set_books(&self, state: &mut EngineState, books: Vec<Book>) {
        state.books = books;
        self.books.send_replace(state.books.clone());
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state().epoch == epoch
    }

    fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }
}

/// Releases a pending operation when dropped, including when the submitting future is dropped.
struct PendingGuard {
    inner: Arc<EngineInner>,
    epoch: u64,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if state.epoch == self.epoch {
            state.pending.release(self.id);
        }
    }
}

impl LedgerSyncEngine {
    pub fn new(
        config: EngineConfig,
        directory: ChainDirectory,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let (phase, _) = watch::channel(EnginePhase::Idle);
        let (books, _) = watch::channel(Vec::new());
        let state = EngineState {
            epoch: 0,
            phase: EnginePhase::Idle,
            books: Vec::new(),
            chain_id: DEFAULT_CHAIN_ID,
            gateway: None,
            subscribed: false,
            event_pump: None,
            pending: PendingOperations::new(config.conflict_policy),
            next_ticket: 0,
            applied_ticket: 0,
        };

        Self {
            inner: Arc::new(EngineInner {
                config,
                directory,
                notifier,
                state: Mutex::new(state),
                phase,
                books,
            }),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.inner.state().phase
    }

    /// Watch phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<EnginePhase> {
        self.inner.phase.subscribe()
    }

    /// Snapshot of the book list.
    pub fn books(&self) -> Vec<Book> {
        self.inner.state().books.clone()
    }

    /// Watch the book list. Every applied read publishes a new list, even when it is unchanged.
    pub fn subscribe_books(&self) -> watch::Receiver<Vec<Book>> {
        self.inner.books.subscribe()
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.state().pending.outstanding().to_vec()
    }

    pub fn chain_id(&self) -> u64 {
        self.inner.state().chain_id
    }

    pub fn controls(&self) -> ControlState {
        let state = self.inner.state();
        ControlState::derive(state.phase, &state.pending)
    }

    /// Bind the engine to `gateway` and load the book list.
    ///
    /// Domain events are subscribed once per gateway, however often this is called. On failure
    /// the engine is `Faulted` with an empty list and a single error notification is emitted.
    pub async fn initialize(&self, gateway: Arc<ContractGateway>) -> Result<(), EngineError> {
        let (epoch, subscribe) = {
            let mut state = self.inner.state();
            let bound = state
                .gateway
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &gateway));
            if !bound {
                if state.gateway.is_some() {
                    // Results of the previous gateway must not leak into this one
                    state.epoch += 1;
                    state.pending.clear();
                    self.inner.set_books(&mut state, Vec::new());
                }
                if let Some(pump) = state.event_pump.take() {
                    pump.abort();
                }
                state.gateway = Some(gateway.clone());
                state.subscribed = false;
            }

            let subscribe = !state.subscribed;
            state.subscribed = true;
            self.inner.set_phase(&mut state, EnginePhase::Loading);
            (state.epoch, subscribe)
        };

        info!("Initializing book list from {}", gateway.address());

        if subscribe {
            if let Err(e) = self.subscribe_events(&gateway, epoch).await {
                return Err(self.fail_initialize(epoch, e.into()));
            }
        }

        match self.reconcile(epoch).await {
            Ok(_) => {
                if !self.inner.finish(epoch, EnginePhase::Ready) {
                    return Err(EngineError::SessionReset);
                }
                info!("Loaded {} books", self.books().len());
                self.inner.notify(Notification::info(BOOKS_LOADED_MESSAGE));
                Ok(())
            }
            Err(e) => Err(self.fail_initialize(epoch, e)),
        }
    }

    fn fail_initialize(&self, epoch: u64, error: EngineError) -> EngineError {
        {
            let mut state = self.inner.state();
            if state.epoch != epoch {
                return EngineError::SessionReset;
            }
            self.inner.set_books(&mut state, Vec::new());
            self.inner.set_phase(&mut state, EnginePhase::Faulted);
        }
        if matches!(error, EngineError::SessionReset) {
            return error;
        }
        warn!("Failed to load books: {}", error);
        self.inner.notify(Notification::error(error.user_message()));
        error
    }

    /// Subscribe to the domain events of `gateway`.
    ///
    /// The caller marks the engine subscribed beforehand; a failure clears the mark again.
    async fn subscribe_events(
        &self,
        gateway: &ContractGateway,
        epoch: u64,
    ) -> Result<(), LedgerError> {
        let (sink, mut events) = mpsc::unbounded_channel::<LedgerEvent>();
        let listener = match gateway.subscribe(sink).await {
            Ok(listener) => listener,
            Err(e) => {
                let mut state = self.inner.state();
                if state.epoch == epoch {
                    state.subscribed = false;
                }
                return Err(e);
            }
        };

        let engine = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                let engine = LedgerSyncEngine { inner };
                tokio::spawn(async move { engine.on_ledger_event(epoch, event).await });
            }
            debug!("Ledger event pump for epoch {} stopped", epoch);
            if let Some(inner) = engine.upgrade() {
                LedgerSyncEngine { inner }.on_event_stream_closed(epoch);
            }
        });

        let mut state = self.inner.state();
        if state.epoch == epoch {
            debug!("Ledger events delivered to {}", listener);
            state.event_pump = Some(pump);
        } else {
            pump.abort();
        }
        Ok(())
    }

    /// The ledger stopped delivering events while the session is still live.
    ///
    /// The next `initialize` or `refresh` subscribes again.
    fn on_event_stream_closed(&self, epoch: u64) {
        {
            let mut state = self.inner.state();
            if state.epoch != epoch || !state.subscribed {
                return;
            }
            state.subscribed = false;
            state.event_pump = None;
        }
        warn!("Ledger event stream closed, live updates paused");
        self.inner
            .notify(Notification::error(EVENTS_INTERRUPTED_MESSAGE));
    }

    async fn on_ledger_event(&self, epoch: u64, event: LedgerEvent) {
        let message = {
            let state = self.inner.state();
            if state.epoch != epoch {
                debug!("Ignoring {:?} from a previous session", event.kind());
                return;
            }
            describe_event(&event, &state.books)
        };

        info!("Ledger event {:?} for book {}", event.kind(), event.book_id());
        self.inner.notify(Notification::info(message));
        self.reconcile_in_background(epoch).await;
    }

    /// Read the full list and apply it unless a later-started read was applied first.
    ///
    /// Returns whether this read was applied.
    async fn reconcile(&self, epoch: u64) -> Result<bool, EngineError> {
        let (gateway, ticket) = {
            let mut state = self.inner.state();
            if state.epoch != epoch {
                return Err(EngineError::SessionReset);
            }
            let gateway = state.gateway.clone().ok_or(EngineError::NotConnected)?;
            state.next_ticket += 1;
            (gateway, state.next_ticket)
        };

        let result = gateway.list_available_books().await;

        let mut state = self.inner.state();
        if state.epoch != epoch {
            debug!("Discarding read #{} from a previous session", ticket);
            return Err(EngineError::SessionReset);
        }
        let books = result?;

        if ticket < state.applied_ticket {
            debug!(
                "Discarding read #{}, read #{} was already applied",
                ticket, state.applied_ticket
            );
            return Ok(false);
        }
        state.applied_ticket = ticket;
        self.inner.set_books(&mut state, books);
        Ok(true)
    }

    async fn reconcile_in_background(&self, epoch: u64) {
        match self.reconcile(epoch).await {
            Ok(_) | Err(EngineError::SessionReset) => {}
            Err(e) => {
                warn!("Failed to reconcile books: {}", e);
                self.inner.notify(Notification::error(e.user_message()));
            }
        }
    }

    /// Re-read the book list. Allowed when `Ready` or `Faulted` and no circulation write is
    /// outstanding. Resubscribes to domain events if the event stream was lost.
    ///
    /// On failure the previous list and phase are kept.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let (epoch, previous, gateway, subscribe) = {
            let mut state = self.inner.state();
            if !matches!(state.phase, EnginePhase::Ready | EnginePhase::Faulted) {
                return Err(EngineError::NotReady(state.phase));
            }
            let gateway = state.gateway.clone().ok_or(EngineError::NotConnected)?;
            let blocking = state
                .pending
                .conflicting(OperationKind::Borrow)
                .map(|op| op.kind);
            if let Some(outstanding) = blocking {
                drop(state);
                warn!("Rejected refresh, {} operation is outstanding", outstanding);
                self.inner.notify(Notification::alert(format!(
                    "Another {} operation is still in progress.",
                    outstanding
                )));
                return Err(EngineError::RefreshBlocked(outstanding));
            }
            let subscribe = !state.subscribed;
            state.subscribed = true;
            let previous = state.phase;
            self.inner.set_phase(&mut state, EnginePhase::Loading);
            (state.epoch, previous, gateway, subscribe)
        };

        if subscribe {
            info!("Resubscribing to ledger events of {}", gateway.address());
            if let Err(e) = self.subscribe_events(&gateway, epoch).await {
                let error = EngineError::from(e);
                if self.inner.finish(epoch, previous) {
                    warn!("Failed to resubscribe to ledger events: {}", error);
                    self.inner.notify(Notification::error(error.user_message()));
                    return Err(error);
                }
                return Err(EngineError::SessionReset);
            }
        }

        match self.reconcile(epoch).await {
            Ok(_) => {
                if !self.inner.finish(epoch, EnginePhase::Ready) {
                    return Err(EngineError::SessionReset);
                }
                self.inner.notify(Notification::info(BOOKS_REFRESHED_MESSAGE));
                Ok(())
            }
            Err(EngineError::SessionReset) => Err(EngineError::SessionReset),
            Err(e) => {
                if self.inner.finish(epoch, previous) {
                    warn!("Failed to refresh books: {}", e);
                    self.inner.notify(Notification::error(e.user_message()));
                }
                Err(e)
            }
        }
    }

    pub async fn submit_add(&self, title: &str, copies: u64) -> Result<Receipt, EngineError> {
        let title = title.trim().to_string();
        let validation = ContractGateway::validate_new_book(&title, copies);
        self.submit(OperationKind::Add, None, validation, move |gateway| async move {
            gateway.add_book(&title, copies).await
        })
        .await
    }

    pub async fn submit_borrow(&self, id: impl Into<BookId>) -> Result<Receipt, EngineError> {
        let id = id.into();
        let validation = ContractGateway::validate_book_id(&id);
        let target = id.clone();
        self.submit(
            OperationKind::Borrow,
            Some(target),
            validation,
            move |gateway| async move { gateway.borrow_book(&id).await },
        )
        .await
    }

    pub async fn submit_return(&self, id: impl Into<BookId>) -> Result<Receipt, EngineError> {
        let id = id.into();
        let validation = ContractGateway::validate_book_id(&id);
        let target = id.clone();
        self.submit(
            OperationKind::Return,
            Some(target),
            validation,
            move |gateway| async move { gateway.return_book(&id).await },
        )
        .await
    }

    /// Admission, submission and settlement of a write.
    ///
    /// The pending operation is released on every outcome, before the outcome is notified.
    async fn submit<F, Fut>(
        &self,
        kind: OperationKind,
        target: Option<BookId>,
        validation: Result<(), LedgerError>,
        write: F,
    ) -> Result<Receipt, EngineError>
    where
        F: FnOnce(Arc<ContractGateway>) -> Fut + Send,
        Fut: Future<Output = Result<SubmittedTransaction, LedgerError>> + Send,
    {
        // Phase, epoch and admission under one lock: an admitted operation belongs to the epoch
        // its guard carries.
        let admission = {
            let mut state = self.inner.state();
            if state.phase != EnginePhase::Ready {
                return Err(EngineError::NotReady(state.phase));
            }
            let gateway = state.gateway.clone().ok_or(EngineError::NotConnected)?;
            match validation {
                Ok(()) => Ok((
                    state.epoch,
                    gateway,
                    state.pending.try_begin(kind, target),
                )),
                Err(e) => Err(e),
            }
        };

        let (epoch, gateway, admission) = match admission {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!("Rejected {} operation: {}", kind, e);
                self.inner.notify(Notification::error(e.user_message()));
                return Err(e.into());
            }
        };
        let guard = match admission {
            Ok(id) => PendingGuard {
                inner: self.inner.clone(),
                epoch,
                id,
            },
            Err(blocking) => {
                warn!(
                    "Rejected {} operation, {} operation #{} is outstanding",
                    kind, blocking.kind, blocking.id
                );
                self.inner.notify(Notification::alert(format!(
                    "Another {} operation is still in progress.",
                    blocking.kind
                )));
                return Err(EngineError::Busy {
                    requested: kind,
                    outstanding: blocking.kind,
                });
            }
        };

        let submitted = match write(gateway).await {
            Ok(submitted) => submitted,
            Err(e) => {
                drop(guard);
                return Err(self.report_failure(epoch, kind, e));
            }
        };

        let link = {
            let mut state = self.inner.state();
            if state.epoch != epoch {
                debug!("Session was reset while submitting {}", submitted.hash());
                return Err(EngineError::SessionReset);
            }
            state.pending.attach_hash(guard.id, submitted.hash().clone());
            self.inner
                .directory
                .transaction_url(state.chain_id, submitted.hash().as_str())
        };

        info!("Submitted {} transaction {}", kind, submitted.hash());
        self.inner
            .notify(Notification::info(TRANSACTION_STARTED_MESSAGE).with_link(link));

        let outcome = submitted.settle().await;
        drop(guard);

        match outcome {
            Ok(receipt) => {
                if !self.inner.is_current(epoch) {
                    debug!("Ignoring late settlement of {}", submitted.hash());
                    return Err(EngineError::SessionReset);
                }
                info!("{} transaction {} succeeded", kind, submitted.hash());
                self.inner.notify(Notification::info(OPERATION_SUCCESSFUL_MESSAGE));
                self.reconcile_in_background(epoch).await;
                Ok(receipt)
            }
            Err(e) => Err(self.report_failure(epoch, kind, e)),
        }
    }

    fn report_failure(&self, epoch: u64, kind: OperationKind, error: LedgerError) -> EngineError {
        if !self.inner.is_current(epoch) {
            debug!("Ignoring {} failure from a previous session: {}", kind, error);
            return EngineError::SessionReset;
        }
        warn!("{} operation failed: {}", kind, error);
        self.inner.notify(Notification::error(error.user_message()));
        error.into()
    }

    /// Drop the bound gateway, the book list and every pending operation, and return to `Idle`.
    ///
    /// In-flight reads and settlements are not cancelled; their results are ignored.
    pub fn reset(&self) {
        let mut state = self.inner.state();
        state.epoch += 1;
        if let Some(pump) = state.event_pump.take() {
            pump.abort();
        }
        state.gateway = None;
        state.subscribed = false;
        self.inner.set_books(&mut state, Vec::new());
        state.chain_id = DEFAULT_CHAIN_ID;
        state.applied_ticket = state.next_ticket;
        let dropped = state.pending.clear();
        self.inner.set_phase(&mut state, EnginePhase::Idle);
        info!("Sync engine reset, {} pending operations dropped", dropped);
    }
}

#[async_trait::async_trait]
impl SessionEventHandler for LedgerSyncEngine {
    async fn handle(&self, event: &SessionEvent) -> Result<(), EngineError> {
        match event {
            SessionEvent::Connected { chain_id, .. } => {
                self.inner.state().chain_id = *chain_id;
                Ok(())
            }
            SessionEvent::AccountChanged { address } => {
                debug!("Account changed to {}, book list kept", address);
                Ok(())
            }
            SessionEvent::NetworkChanged { chain_id } => {
                let refresh = {
                    let mut state = self.inner.state();
                    state.chain_id = *chain_id;
                    self.inner.config.refresh_on_network_change
                        && state.phase == EnginePhase::Ready
                };
                if refresh {
                    self.refresh().await
                } else {
                    Ok(())
                }
            }
            SessionEvent::Reset { reason } => {
                debug!("Session reset: {}", reason);
                self.reset();
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "ledger-sync-engine"
    }
}

fn describe_event(event: &LedgerEvent, books: &[Book]) -> String {
    let title_of = |id: &BookId| {
        books
            .iter()
            .find(|book| &book.id == id)
            .map(|book| book.title.clone())
            .unwrap_or_else(|| format!("Book {}", id))
    };

    match event {
        LedgerEvent::BookAdded {
            id,
            title,
            number_of_copies,
        } => {
            let title = if title.is_empty() {
                title_of(id)
            } else {
                title.clone()
            };
            let copies = parse_quantity(number_of_copies)
                .map(|copies| copies.to_string())
                .unwrap_or_else(|| "New".to_string());
            format!(
                "{} copies of \"{}\" have been added to the library.",
                copies, title
            )
        }
        LedgerEvent::BookBorrowed { id, borrower } => format!(
            "{} has been borrowed by {}",
            title_of(id),
            ellipse_address(borrower, 4)
        ),
        LedgerEvent::BookReturned { id, borrower } => format!(
            "{} has been returned by {}",
            title_of(id),
            ellipse_address(borrower, 4)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ContractAddress, RawBook, TransactionStatus};
    use crate::notification::Severity;
    use crate::rpc::RemoteFailure;
    use crate::sync::ConflictPolicy;
    use crate::testing::*;
    use crate::wallet::ResetReason;
    use serde_json::json;

    const BORROWER: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

    struct Fixture {
        engine: LedgerSyncEngine,
        ledger: Arc<MockLedger>,
        gateway: Arc<ContractGateway>,
        sink: Arc<RecordingSink>,
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let ledger = Arc::new(MockLedger::new());
        let gateway = Arc::new(ContractGateway::new(
            ContractAddress::parse(CONTRACT).unwrap(),
            ledger.clone(),
        ));
        let sink = Arc::new(RecordingSink::new());
        let engine = LedgerSyncEngine::new(config, ChainDirectory::default(), sink.clone());
        Fixture {
            engine,
            ledger,
            gateway,
            sink,
        }
    }

    async fn ready_with(config: EngineConfig, books: Vec<RawBook>) -> Fixture {
        let f = fixture_with(config);
        f.ledger.set_books(books);
        f.engine.initialize(f.gateway.clone()).await.unwrap();
        f.sink.clear();
        f
    }

    async fn ready(books: Vec<RawBook>) -> Fixture {
        ready_with(EngineConfig::default(), books).await
    }

    fn dune(copies: u64) -> RawBook {
        RawBook::new(1, "Dune", json!(copies))
    }

    #[tokio::test]
    async fn test_initialize_loads_books() {
        let f = fixture_with(EngineConfig::default());
        f.ledger.set_books(vec![dune(3)]);
        let phases = f.engine.subscribe_phase();

        f.engine.initialize(f.gateway.clone()).await.unwrap();

        assert_eq!(f.engine.phase(), EnginePhase::Ready);
        assert_eq!(*phases.borrow(), EnginePhase::Ready);
        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 3)]);
        assert_eq!(f.sink.all(), vec![Notification::info("Books loaded.")]);
        assert_eq!(f.ledger.listener_count(), 1);
        assert!(f.engine.controls().circulation_enabled);
    }

    #[tokio::test]
    async fn test_initialize_failure_faults_with_empty_list() {
        let f = fixture_with(EngineConfig::default());
        f.ledger.set_books(vec![dune(3)]);
        f.ledger
            .push_read_result(Err(RemoteFailure::message("header not found").into()));

        let result = f.engine.initialize(f.gateway.clone()).await;
        assert!(matches!(result, Err(EngineError::Ledger(_))));
        assert_eq!(f.engine.phase(), EnginePhase::Faulted);
        assert!(f.engine.books().is_empty());
        assert_eq!(
            f.sink.all(),
            vec![Notification::error("Error: header not found")]
        );

        // Refresh recovers
        f.engine.refresh().await.unwrap();
        assert_eq!(f.engine.phase(), EnginePhase::Ready);
        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 3)]);
    }

    #[tokio::test]
    async fn test_duplicate_initialize_subscribes_once() {
        let f = fixture_with(EngineConfig::default());
        f.ledger.set_books(vec![dune(3)]);

        let (first, second) = tokio::join!(
            f.engine.initialize(f.gateway.clone()),
            f.engine.initialize(f.gateway.clone())
        );
        first.unwrap();
        second.unwrap();
        f.engine.initialize(f.gateway.clone()).await.unwrap();

        assert_eq!(f.ledger.subscribe_count(), 1);
        assert_eq!(f.ledger.listener_count(), 1);
        assert_eq!(f.engine.phase(), EnginePhase::Ready);
    }

    #[tokio::test]
    async fn test_borrow_success_reconciles() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;

        assert_eq!(f.engine.pending_operations().len(), 1);
        assert!(!f.engine.controls().circulation_enabled);
        assert!(f.engine.controls().add_enabled);

        f.ledger.set_books(vec![dune(2)]);
        f.ledger.settle_next(TransactionStatus::Successful);
        let receipt = borrow.await.unwrap().unwrap();
        assert!(receipt.succeeded());

        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 2)]);
        assert!(f.engine.pending_operations().is_empty());
        assert_eq!(f.ledger.writes(), vec!["borrow:1".to_string()]);
        assert_eq!(f.ledger.read_count(), 2);

        let notifications = f.sink.all();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].message, TRANSACTION_STARTED_MESSAGE);
        assert_eq!(
            notifications[0].link,
            Some(format!("https://etherscan.io/tx/{}", receipt.transaction_hash))
        );
        assert_eq!(notifications[1], Notification::info("Operation is successful."));
    }

    #[tokio::test]
    async fn test_borrow_failure_status_skips_reconciliation() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;
        f.ledger.set_books(vec![dune(2)]);
        f.ledger.settle_next(TransactionStatus::Unsuccessful);

        let result = borrow.await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::Ledger(LedgerError::OnChainFailure { .. }))
        ));
        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 3)]);
        assert_eq!(f.ledger.read_count(), 1);
        assert!(f.engine.pending_operations().is_empty());
        assert_eq!(f.sink.count(Severity::Error), 1);
        assert_eq!(
            f.sink.all().last(),
            Some(&Notification::error("Operation is not successful!"))
        );
    }

    #[tokio::test]
    async fn test_rejected_settlement_reports_most_specific_detail() {
        let f = ready(vec![dune(3)]).await;
        f.ledger.reject_next(
            RemoteFailure::from_raw(json!({
                "message": "Internal JSON-RPC error.",
                "error": { "message": "execution reverted: no copies left" }
            }))
            .into(),
        );

        let result = f.engine.submit_borrow(1).await;
        assert!(matches!(
            result,
            Err(EngineError::Ledger(LedgerError::RemoteCallFailure(_)))
        ));
        assert_eq!(
            f.sink.all().last(),
            Some(&Notification::error("Error: execution reverted: no copies left"))
        );
        assert_eq!(f.sink.count(Severity::Error), 1);
        assert_eq!(f.ledger.read_count(), 1);
        assert!(f.engine.pending_operations().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_submission_notifies_once() {
        let f = ready(vec![dune(3)]).await;
        f.ledger
            .fail_next_submission(RemoteFailure::message("User denied transaction signature.").into());

        let result = f.engine.submit_return(1).await;
        assert!(matches!(result, Err(EngineError::Ledger(_))));
        assert_eq!(
            f.sink.all(),
            vec![Notification::error("Error: User denied transaction signature.")]
        );
        assert!(f.engine.pending_operations().is_empty());
        assert!(f.engine.controls().circulation_enabled);
    }

    #[tokio::test]
    async fn test_conflicting_write_is_rejected_without_remote_call() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;

        let result = f.engine.submit_return(1).await;
        assert!(matches!(
            result,
            Err(EngineError::Busy {
                requested: OperationKind::Return,
                outstanding: OperationKind::Borrow,
            })
        ));
        assert_eq!(f.ledger.write_count(), 1);
        assert_eq!(f.sink.count(Severity::Alert), 1);

        // Adding is another category
        let engine = f.engine.clone();
        let add = tokio::spawn(async move { engine.submit_add("Emma", 2).await });
        eventually(|| f.ledger.pending_settlements() == 2).await;
        assert_eq!(f.ledger.write_count(), 2);

        f.ledger.settle_next(TransactionStatus::Successful);
        f.ledger.settle_next(TransactionStatus::Successful);
        borrow.await.unwrap().unwrap();
        add.await.unwrap().unwrap();
        assert!(f.engine.pending_operations().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_policy_blocks_all_writes() {
        let config = EngineConfig {
            conflict_policy: ConflictPolicy::Exclusive,
            ..EngineConfig::default()
        };
        let f = ready_with(config, vec![dune(3)]).await;

        let engine = f.engine.clone();
        let add = tokio::spawn(async move { engine.submit_add("Emma", 2).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;

        assert!(matches!(
            f.engine.submit_borrow(1).await,
            Err(EngineError::Busy { .. })
        ));
        assert_eq!(f.ledger.write_count(), 1);

        f.ledger.settle_next(TransactionStatus::Successful);
        add.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_ledger() {
        let f = ready(vec![dune(3)]).await;

        assert!(matches!(
            f.engine.submit_add("Dune", 0).await,
            Err(EngineError::Ledger(LedgerError::InvalidInput(_)))
        ));
        assert!(matches!(
            f.engine.submit_add("  ", 2).await,
            Err(EngineError::Ledger(LedgerError::InvalidInput(_)))
        ));
        assert_eq!(f.ledger.write_count(), 0);
        assert_eq!(f.sink.count(Severity::Error), 2);
        assert!(f.engine.pending_operations().is_empty());
    }

    #[tokio::test]
    async fn test_writes_require_ready() {
        let f = fixture_with(EngineConfig::default());
        assert!(matches!(
            f.engine.submit_add("Dune", 3).await,
            Err(EngineError::NotReady(EnginePhase::Idle))
        ));
        assert!(matches!(
            f.engine.refresh().await,
            Err(EngineError::NotReady(EnginePhase::Idle))
        ));
        assert_eq!(f.ledger.write_count(), 0);
        assert_eq!(f.ledger.read_count(), 0);
    }

    #[tokio::test]
    async fn test_domain_event_triggers_full_read() {
        let f = ready(vec![dune(3)]).await;

        f.ledger
            .set_books(vec![dune(3), RawBook::new(2, "Emma", json!("0x1"))]);
        f.ledger.emit(LedgerEvent::BookAdded {
            id: BookId::from(2),
            title: "Emma".to_string(),
            number_of_copies: json!(1),
        });
        eventually(|| f.engine.books().len() == 2).await;

        assert_eq!(
            f.engine.books(),
            vec![Book::new(1, "Dune", 3), Book::new(2, "Emma", 1)]
        );
        assert_eq!(
            f.sink.all(),
            vec![Notification::info(
                "1 copies of \"Emma\" have been added to the library."
            )]
        );
    }

    #[tokio::test]
    async fn test_borrow_event_message_uses_local_title() {
        let f = ready(vec![dune(3)]).await;

        f.ledger.set_books(vec![dune(2)]);
        f.ledger.emit(LedgerEvent::BookBorrowed {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        eventually(|| f.engine.books() == vec![Book::new(1, "Dune", 2)]).await;

        assert_eq!(
            f.sink.all(),
            vec![Notification::info("Dune has been borrowed by 0x5290...9ee7")]
        );
    }

    #[tokio::test]
    async fn test_stale_read_does_not_overwrite_newer_one() {
        let f = ready(vec![dune(3)]).await;
        f.ledger.hold_reads(true);

        // Read #2 observes the ledger with two copies left
        f.ledger.set_books(vec![dune(2)]);
        f.ledger.emit(LedgerEvent::BookBorrowed {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        eventually(|| f.ledger.held_reads() == 1).await;

        // Read #3 observes one copy left
        f.ledger.set_books(vec![dune(1)]);
        f.ledger.emit(LedgerEvent::BookBorrowed {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        eventually(|| f.ledger.held_reads() == 2).await;

        assert!(f.ledger.release_read(3));
        eventually(|| f.engine.books() == vec![Book::new(1, "Dune", 1)]).await;

        assert!(f.ledger.release_read(2));
        eventually(|| f.ledger.held_reads() == 0).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 1)]);
    }

    #[tokio::test]
    async fn test_write_and_event_reconciliations_race() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;

        f.ledger.hold_reads(true);
        f.ledger.set_books(vec![dune(2)]);
        f.ledger.settle_next(TransactionStatus::Successful);
        eventually(|| f.ledger.held_reads() == 1).await;

        f.ledger.emit(LedgerEvent::BookBorrowed {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        eventually(|| f.ledger.held_reads() == 2).await;

        // The event's read finishes first, then the write's older read
        assert!(f.ledger.release_read(3));
        eventually(|| f.engine.books() == vec![Book::new(1, "Dune", 2)]).await;
        assert!(f.ledger.release_read(2));
        borrow.await.unwrap().unwrap();

        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 2)]);
        let messages = f.sink.messages();
        let success = messages
            .iter()
            .position(|m| m == OPERATION_SUCCESSFUL_MESSAGE)
            .unwrap();
        assert_eq!(messages[0], TRANSACTION_STARTED_MESSAGE);
        assert!(success > 0);
    }

    #[tokio::test]
    async fn test_settlement_after_reset_is_ignored() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;

        f.engine.reset();
        f.ledger.settle_next(TransactionStatus::Successful);

        assert!(matches!(
            borrow.await.unwrap(),
            Err(EngineError::SessionReset)
        ));
        assert_eq!(f.engine.phase(), EnginePhase::Idle);
        assert!(f.engine.books().is_empty());
        assert_eq!(f.ledger.read_count(), 1);
        assert_eq!(f.sink.messages(), vec![TRANSACTION_STARTED_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_settlement_after_reset_is_silent() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let add = tokio::spawn(async move { engine.submit_add("Emma", 1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;

        f.engine.reset();
        f.ledger.settle_next(TransactionStatus::Unsuccessful);
        assert!(matches!(add.await.unwrap(), Err(EngineError::SessionReset)));
        assert_eq!(f.sink.count(Severity::Error), 0);
    }

    #[tokio::test]
    async fn test_dropped_submission_releases_pending_operation() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;
        assert_eq!(f.engine.pending_operations().len(), 1);
        assert!(f.engine.pending_operations()[0].tx_hash.is_some());

        borrow.abort();
        eventually(|| f.engine.pending_operations().is_empty()).await;
        assert!(f.engine.controls().circulation_enabled);
    }

    #[tokio::test]
    async fn test_refresh_replaces_list() {
        let f = ready(vec![dune(3)]).await;
        f.ledger.set_books(vec![dune(0)]);

        f.engine.refresh().await.unwrap();
        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 0)]);
        assert_eq!(f.engine.phase(), EnginePhase::Ready);
        assert_eq!(f.sink.all(), vec![Notification::info("Books info refreshed.")]);
        assert!(!f.engine.controls().can_borrow(&f.engine.books()[0]));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
        let f = ready(vec![dune(3)]).await;
        f.ledger
            .push_read_result(Err(RemoteFailure::message("timeout").into()));

        assert!(f.engine.refresh().await.is_err());
        assert_eq!(f.engine.books(), vec![Book::new(1, "Dune", 3)]);
        assert_eq!(f.engine.phase(), EnginePhase::Ready);
        assert_eq!(f.sink.all(), vec![Notification::error("Error: timeout")]);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let f = ready(vec![dune(3)]).await;

        f.engine
            .handle(&SessionEvent::Reset {
                reason: ResetReason::AccountsLost,
            })
            .await
            .unwrap();
        assert_eq!(f.engine.phase(), EnginePhase::Idle);
        assert!(f.engine.books().is_empty());

        f.engine.reset();
        assert_eq!(f.engine.phase(), EnginePhase::Idle);

        // Events pushed to the old subscription are dropped
        f.ledger.emit(LedgerEvent::BookReturned {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(f.sink.all().is_empty());
        assert_eq!(f.ledger.read_count(), 1);

        // A fresh initialize subscribes again
        f.engine.initialize(f.gateway.clone()).await.unwrap();
        assert_eq!(f.ledger.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn test_lost_event_stream_is_reported_and_resubscribed_on_initialize() {
        let f = ready(vec![dune(3)]).await;

        f.gateway.remove_all_listeners().await;
        eventually(|| f.sink.count(Severity::Error) == 1).await;
        assert_eq!(
            f.sink.all(),
            vec![Notification::error(EVENTS_INTERRUPTED_MESSAGE)]
        );
        assert_eq!(f.engine.phase(), EnginePhase::Ready);

        f.engine.initialize(f.gateway.clone()).await.unwrap();
        assert_eq!(f.ledger.subscribe_count(), 2);
        assert_eq!(f.ledger.listener_count(), 1);

        f.ledger.set_books(vec![dune(2)]);
        f.ledger.emit(LedgerEvent::BookBorrowed {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        eventually(|| f.engine.books() == vec![Book::new(1, "Dune", 2)]).await;
    }

    #[tokio::test]
    async fn test_refresh_resubscribes_after_lost_event_stream() {
        let f = ready(vec![dune(3)]).await;
        f.gateway.remove_all_listeners().await;
        eventually(|| f.sink.count(Severity::Error) == 1).await;

        f.engine.refresh().await.unwrap();
        assert_eq!(f.ledger.subscribe_count(), 2);
        assert_eq!(f.ledger.listener_count(), 1);

        // An intact subscription is left alone
        f.engine.refresh().await.unwrap();
        assert_eq!(f.ledger.subscribe_count(), 2);

        f.ledger.set_books(vec![dune(3), RawBook::new(2, "Emma", json!(1))]);
        f.ledger.emit(LedgerEvent::BookAdded {
            id: BookId::from(2),
            title: "Emma".to_string(),
            number_of_copies: json!(1),
        });
        eventually(|| f.engine.books().len() == 2).await;
    }

    #[tokio::test]
    async fn test_refresh_waits_for_circulation_write() {
        let f = ready(vec![dune(3)]).await;

        let engine = f.engine.clone();
        let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
        eventually(|| f.ledger.pending_settlements() == 1).await;
        assert!(!f.engine.controls().refresh_enabled);

        assert!(matches!(
            f.engine.refresh().await,
            Err(EngineError::RefreshBlocked(OperationKind::Borrow))
        ));
        assert_eq!(f.ledger.read_count(), 1);
        assert_eq!(f.sink.count(Severity::Alert), 1);
        assert_eq!(f.engine.phase(), EnginePhase::Ready);

        f.ledger.settle_next(TransactionStatus::Successful);
        borrow.await.unwrap().unwrap();
        assert!(f.engine.controls().refresh_enabled);
        f.engine.refresh().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_racing_admission_leaves_next_session_unblocked() {
        for _ in 0..25 {
            let f = ready(vec![dune(3)]).await;
            f.ledger.auto_settle(Some(TransactionStatus::Successful));

            let engine = f.engine.clone();
            let borrow = tokio::spawn(async move { engine.submit_borrow(1).await });
            f.engine.reset();
            f.engine.initialize(f.gateway.clone()).await.unwrap();
            let _ = borrow.await.unwrap();

            eventually(|| f.engine.pending_operations().is_empty()).await;
            assert!(f.engine.controls().circulation_enabled);
        }
    }

    #[tokio::test]
    async fn test_book_list_changes_are_published() {
        let f = ready(vec![dune(3)]).await;
        let mut books = f.engine.subscribe_books();
        assert_eq!(*books.borrow_and_update(), vec![Book::new(1, "Dune", 3)]);

        f.ledger.set_books(vec![dune(2)]);
        f.ledger.emit(LedgerEvent::BookBorrowed {
            id: BookId::from(1),
            borrower: BORROWER.to_string(),
        });
        books.changed().await.unwrap();
        assert_eq!(*books.borrow_and_update(), vec![Book::new(1, "Dune", 2)]);
        assert_eq!(f.engine.phase(), EnginePhase::Ready);

        f.engine.reset();
        books.changed().await.unwrap();
        assert!(books.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn test_network_change_refresh_is_configurable() {
        let f = ready(vec![dune(3)]).await;
        f.engine
            .handle(&SessionEvent::NetworkChanged { chain_id: 5 })
            .await
            .unwrap();
        assert_eq!(f.engine.chain_id(), 5);
        assert_eq!(f.ledger.read_count(), 1);

        let config = EngineConfig {
            refresh_on_network_change: true,
            ..EngineConfig::default()
        };
        let f = ready_with(config, vec![dune(3)]).await;
        f.engine
            .handle(&SessionEvent::NetworkChanged { chain_id: 5 })
            .await
            .unwrap();
        assert_eq!(f.ledger.read_count(), 2);
        assert_eq!(f.sink.all(), vec![Notification::info("Books info refreshed.")]);
    }

    #[tokio::test]
    async fn test_transaction_link_follows_session_chain() {
        let f = ready(vec![dune(3)]).await;
        f.ledger.auto_settle(Some(TransactionStatus::Successful));
        f.engine
            .handle(&SessionEvent::Connected {
                address: ACCOUNT.to_string(),
                chain_id: 31337,
            })
            .await
            .unwrap();

        f.engine.submit_return(1).await.unwrap();
        assert_eq!(f.sink.all()[0].link, None);

        f.engine
            .handle(&SessionEvent::NetworkChanged { chain_id: 5 })
            .await
            .unwrap();
        let receipt = f.engine.submit_return(1).await.unwrap();
        let link = f.sink.all()[2].link.clone();
        assert_eq!(
            link,
            Some(format!(
                "https://goerli.etherscan.io/tx/{}",
                receipt.transaction_hash
            ))
        );
    }
}
