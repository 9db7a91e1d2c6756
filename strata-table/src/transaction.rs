//! Transaction object: snapshot plus per-transaction local storage, and the
//! commit path that flushes local rows through the table append contract.

use strata_result::{Error, Result};
use strata_storage::WalSink;
use strata_transaction::{TransactionManager, TransactionSnapshot, TxnId};

use crate::local_storage::{LocalStorage, LocalTableStorage};
use crate::scan::{CollectionScanState, TableScanType};
use crate::table::TableAppendState;

/// One snapshot-isolated transaction.
///
/// Reads observe the union of committed state at the snapshot boundary and
/// this transaction's own local writes. Commit flushes the local rows into
/// each table under its append lock, maintains the committed indexes, emits
/// the WAL, and stamps the rows with a fresh commit identifier.
pub struct Transaction {
    manager: TransactionManager,
    snapshot: TransactionSnapshot,
    local_storage: LocalStorage,
}

impl Transaction {
    pub fn begin(manager: &TransactionManager) -> Self {
        Self {
            manager: manager.clone(),
            snapshot: manager.begin_snapshot(),
            local_storage: LocalStorage::new(),
        }
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        self.snapshot
    }

    pub fn txn_id(&self) -> TxnId {
        self.snapshot.txn_id
    }

    pub fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    /// Commit: flush every table's local rows, then publish the commit.
    ///
    /// Any failure (a demoted table, an index conflict against rows
    /// committed since the snapshot) reverts the partial flush of the
    /// failing table and aborts the whole transaction.
    pub fn commit(self, wal: Option<&dyn WalSink>) -> Result<()> {
        let txn_id = self.snapshot.txn_id;
        let commit_id = self.manager.begin_commit(txn_id);

        for storage in self.local_storage.storages() {
            if let Err(err) = self.flush_table(&storage, commit_id, wal) {
                self.manager.abort(txn_id);
                return Err(err);
            }
        }

        self.manager.finish_commit(txn_id, commit_id);
        tracing::debug!(txn_id, commit_id, "transaction committed");
        Ok(())
    }

    /// Abort: local rows are discarded, and delete stamps left in persistent
    /// storage are neutralized by the aborted status.
    pub fn rollback(self) {
        self.manager.abort(self.snapshot.txn_id);
        tracing::debug!(txn_id = self.snapshot.txn_id, "transaction rolled back");
    }

    fn flush_table(
        &self,
        storage: &LocalTableStorage,
        commit_id: TxnId,
        wal: Option<&dyn WalSink>,
    ) -> Result<()> {
        let table = storage.table();
        let collection = storage.collection();
        let count = collection.count_visible(&self.manager, &self.snapshot);
        if count == 0 {
            return Ok(());
        }

        let mut state = TableAppendState::new();
        table.append_lock(&mut state)?;
        table.initialize_append(self, &mut state, count)?;
        let row_start = state.row_start;

        let schema = table.physical_schema();
        let column_ids: Vec<usize> = (0..schema.fields().len()).collect();
        let mut scan_state = CollectionScanState::default();
        collection.initialize_scan(&mut scan_state);

        let mut appended: u64 = 0;
        let mut failure: Option<Error> = None;
        loop {
            let batch = match collection.scan(
                &self.manager,
                Some(&self.snapshot),
                &mut scan_state,
                &column_ids,
                None,
                &schema,
                TableScanType::Regular,
            ) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };

            let base_row = state.current_row;
            if let Err(err) = table.append(&batch, &mut state) {
                failure = Some(err);
                break;
            }
            appended += batch.num_rows() as u64;
            if let Err(err) = table.append_to_indexes(&batch, base_row) {
                failure = Some(err);
                break;
            }
        }
        // Release the append lock; revert and commit re-acquire it.
        drop(state);

        if let Some(err) = failure {
            table.revert_append(&self.manager, row_start, appended)?;
            return Err(err);
        }
        debug_assert_eq!(appended, count);

        if let Some(wal) = wal {
            table.write_to_log(&self.manager, wal, row_start, count)?;
        }
        table.commit_append(commit_id, row_start, count);
        tracing::debug!(
            table = table.info().table(),
            row_start,
            count,
            "flushed local rows"
        );
        Ok(())
    }
}
