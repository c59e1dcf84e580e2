//! Pending write tracking.
//!
//! This module provides `PendingOperations`, the set of writes submitted from this client that
//! have not settled yet. It is the only mutual-exclusion mechanism of the sync engine: a write is
//! refused while an operation it conflicts with is outstanding. The guard is cooperative and only
//! prevents overlapping submissions from this client.

use crate::ledger::{BookId, TxHash};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Kind of write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Borrow,
    Return,
}

impl OperationKind {
    pub fn category(&self) -> OperationCategory {
        match self {
            OperationKind::Add => OperationCategory::Catalog,
            OperationKind::Borrow | OperationKind::Return => OperationCategory::Circulation,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Add => "add",
            OperationKind::Borrow => "borrow",
            OperationKind::Return => "return",
        };
        f.write_str(name)
    }
}

/// Conflict category of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCategory {
    /// Adding books
    Catalog,
    /// Borrowing and returning books
    Circulation,
}

/// Which outstanding operations block a new submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Operations of the same category conflict
    #[default]
    PerCategory,
    /// Every write conflicts with every other write
    Exclusive,
}

impl ConflictPolicy {
    pub fn conflicts(&self, outstanding: OperationKind, requested: OperationKind) -> bool {
        match self {
            ConflictPolicy::PerCategory => outstanding.category() == requested.category(),
            ConflictPolicy::Exclusive => true,
        }
    }
}

/// A locally tracked in-flight write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: u64,
    pub kind: OperationKind,
    pub target_book_id: Option<BookId>,
    pub submitted_at: DateTime<Utc>,
    /// Set once the write has been accepted by the ledger
    pub tx_hash: Option<TxHash>,
}

/// Set of outstanding writes
#[derive(Debug, Clone)]
pub struct PendingOperations {
    policy: ConflictPolicy,
    next_id: u64,
    operations: Vec<PendingOperation>,
}

impl PendingOperations {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            next_id: 1,
            operations: Vec::new(),
        }
    }

    /// The outstanding operation that blocks `kind`, if any
    pub fn conflicting(&self, kind: OperationKind) -> Option<&PendingOperation> {
        self.operations
            .iter()
            .find(|op| self.policy.conflicts(op.kind, kind))
    }

    pub fn is_blocked(&self, kind: OperationKind) -> bool {
        self.conflicting(kind).is_some()
    }

    /// Record a new operation unless a conflicting one is outstanding.
    ///
    /// On conflict, returns the blocking operation.
    pub fn try_begin(
        &mut self,
        kind: OperationKind,
        target_book_id: Option<BookId>,
    ) -> Result<u64, PendingOperation> {
        if let Some(blocking) = self.conflicting(kind) {
            return Err(blocking.clone());
        }

        let id = self.next_id;
        self.next_id += 1;
        self.operations.push(PendingOperation {
            id,
            kind,
            target_book_id,
            submitted_at: Utc::now(),
            tx_hash: None,
        });
        debug!("Pending {} operation #{} recorded", kind, id);
        Ok(id)
    }

    pub fn attach_hash(&mut self, id: u64, tx_hash: TxHash) {
        if let Some(op) = self.operations.iter_mut().find(|op| op.id == id) {
            op.tx_hash = Some(tx_hash);
        }
    }

    pub fn release(&mut self, id: u64) -> Option<PendingOperation> {
        let position = self.operations.iter().position(|op| op.id == id)?;
        let op = self.operations.remove(position);
        debug!("Pending {} operation #{} released", op.kind, op.id);
        Some(op)
    }

    /// Forget every outstanding operation, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.operations.len();
        self.operations.clear();
        count
    }

    pub fn outstanding(&self) -> &[PendingOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for PendingOperations {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}
