//! Multi-version concurrency control primitives.
//!
//! This module centralizes the transaction-identifier allocator, commit
//! bookkeeping, and the row visibility rules used by the table core. Rows
//! carry `created_by` / `deleted_by` stamps; a snapshot decides visibility
//! from those stamps plus the commit status of the stamping transaction.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Transaction identifier type. Also used for commit identifiers; the two
/// ranges never overlap.
pub type TxnId = u64;

/// First identifier in the transaction-id range. Everything below is a
/// commit identifier.
pub const TRANSACTION_ID_START: TxnId = 1 << 62;

/// Stamp stored in `deleted_by` for rows that have not been deleted.
pub const NOT_DELETED_ID: TxnId = TxnId::MAX;

/// True if `id` is in the transaction-id range (as opposed to a commit id).
#[inline]
pub fn is_transaction_id(id: TxnId) -> bool {
    id >= TRANSACTION_ID_START
}

/// Status of a transaction tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    /// Committed with the recorded commit identifier.
    Committed(TxnId),
    Aborted,
}

#[derive(Debug)]
struct TransactionManagerInner {
    /// Next transaction identifier to hand out.
    next_txn_id: AtomicU64,
    /// Next commit identifier to hand out.
    next_commit_id: AtomicU64,
    /// Highest finished commit identifier (the snapshot watermark).
    last_commit: AtomicU64,
    /// Outcome of every transaction this manager has seen.
    statuses: Mutex<FxHashMap<TxnId, TxnStatus>>,
}

impl TransactionManagerInner {
    fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(TRANSACTION_ID_START),
            next_commit_id: AtomicU64::new(1),
            last_commit: AtomicU64::new(0),
            statuses: Mutex::new(FxHashMap::default()),
        }
    }
}

/// Hands out transaction and commit identifiers and tracks outcomes.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Debug)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner::new()),
        }
    }

    /// Begin a new transaction and return its snapshot.
    ///
    /// The snapshot captures the allocated transaction id and the commit
    /// watermark at the moment the transaction starts; both are needed to
    /// evaluate row visibility.
    pub fn begin_snapshot(&self) -> TransactionSnapshot {
        let start_id = self.inner.last_commit.load(Ordering::SeqCst);
        let txn_id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut guard = self
                .inner
                .statuses
                .lock()
                .expect("txn status lock poisoned");
            guard.insert(txn_id, TxnStatus::Active);
        }
        tracing::trace!(txn_id, start_id, "begin transaction");

        TransactionSnapshot { txn_id, start_id }
    }

    /// Allocate the commit identifier for a committing transaction.
    ///
    /// The transaction stays `Active` until [`finish_commit`] runs, so
    /// concurrent snapshots keep ignoring its writes while they are being
    /// stamped.
    ///
    /// [`finish_commit`]: TransactionManager::finish_commit
    pub fn begin_commit(&self, txn_id: TxnId) -> TxnId {
        debug_assert!(is_transaction_id(txn_id));
        let commit_id = self.inner.next_commit_id.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(txn_id, commit_id, "begin commit");
        commit_id
    }

    /// Record the commit outcome and advance the snapshot watermark.
    pub fn finish_commit(&self, txn_id: TxnId, commit_id: TxnId) {
        {
            let mut guard = self
                .inner
                .statuses
                .lock()
                .expect("txn status lock poisoned");
            guard.insert(txn_id, TxnStatus::Committed(commit_id));
        }

        // Best-effort monotonic progression of the watermark; exact ordering
        // between racing committers is not required.
        let mut current = self.inner.last_commit.load(Ordering::SeqCst);
        loop {
            if commit_id <= current {
                break;
            }
            match self.inner.last_commit.compare_exchange(
                current,
                commit_id,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        tracing::trace!(txn_id, commit_id, "finish commit");
    }

    /// Mark a transaction as aborted.
    pub fn abort(&self, txn_id: TxnId) {
        let mut guard = self
            .inner
            .statuses
            .lock()
            .expect("txn status lock poisoned");
        guard.insert(txn_id, TxnStatus::Aborted);
        tracing::trace!(txn_id, "abort transaction");
    }

    /// The commit identifier of `txn_id`, if it committed.
    pub fn commit_id_of(&self, txn_id: TxnId) -> Option<TxnId> {
        let guard = self
            .inner
            .statuses
            .lock()
            .expect("txn status lock poisoned");
        match guard.get(&txn_id) {
            Some(TxnStatus::Committed(commit_id)) => Some(*commit_id),
            _ => None,
        }
    }

    /// True if `txn_id` is known to have aborted.
    pub fn is_aborted(&self, txn_id: TxnId) -> bool {
        let guard = self
            .inner
            .statuses
            .lock()
            .expect("txn status lock poisoned");
        matches!(guard.get(&txn_id), Some(TxnStatus::Aborted))
    }

    /// Current snapshot watermark (highest finished commit identifier).
    pub fn last_commit(&self) -> TxnId {
        self.inner.last_commit.load(Ordering::SeqCst)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata captured when a transaction begins.
#[derive(Debug, Clone, Copy)]
pub struct TransactionSnapshot {
    /// The unique identifier assigned to this transaction.
    pub txn_id: TxnId,
    /// The highest finished commit identifier when this transaction began.
    pub start_id: TxnId,
}

impl TransactionSnapshot {
    /// Whether a `created_by` stamp is visible to this snapshot.
    fn created_visible(&self, manager: &TransactionManager, created_by: TxnId) -> bool {
        if created_by == self.txn_id {
            return true;
        }
        if !is_transaction_id(created_by) {
            // Commit-id stamped at append commit time.
            return created_by <= self.start_id;
        }
        // Another transaction's stamp: only visible once that transaction
        // committed inside our snapshot horizon.
        match manager.commit_id_of(created_by) {
            Some(commit_id) => commit_id <= self.start_id,
            None => false,
        }
    }

    /// Whether a `deleted_by` stamp hides the row from this snapshot.
    fn delete_applies(&self, manager: &TransactionManager, deleted_by: TxnId) -> bool {
        if deleted_by == NOT_DELETED_ID {
            return false;
        }
        if deleted_by == self.txn_id {
            return true;
        }
        if !is_transaction_id(deleted_by) {
            return deleted_by <= self.start_id;
        }
        match manager.commit_id_of(deleted_by) {
            Some(commit_id) => commit_id <= self.start_id,
            None => false,
        }
    }

    /// Full visibility rule: the row was created inside the snapshot horizon
    /// (or by this transaction) and not deleted inside it.
    pub fn row_is_visible(
        &self,
        manager: &TransactionManager,
        created_by: TxnId,
        deleted_by: TxnId,
    ) -> bool {
        let visible = self.created_visible(manager, created_by)
            && !self.delete_applies(manager, deleted_by);
        tracing::trace!(
            created_by,
            deleted_by,
            txn_id = self.txn_id,
            start_id = self.start_id,
            visible,
            "visibility check"
        );
        visible
    }

    /// Visibility rule for foreign-key verification.
    ///
    /// Rows deleted by the *current* transaction remain visible here:
    /// foreign keys are checked against committed state plus this
    /// transaction's inserts, ignoring its uncommitted deletes.
    pub fn row_is_visible_for_fk_check(
        &self,
        manager: &TransactionManager,
        created_by: TxnId,
        deleted_by: TxnId,
    ) -> bool {
        if !self.created_visible(manager, created_by) {
            return false;
        }
        if deleted_by == self.txn_id {
            tracing::trace!(
                created_by,
                deleted_by,
                "row deleted by current txn still visible for FK check"
            );
            return true;
        }
        !self.delete_applies(manager, deleted_by)
    }
}
