//! The table façade: dispatches scans, appends, deletes, updates, constraint
//! verification, and schema change over the storage collaborators.
//!
//! A `DataTable` is one immutable *version* of a table. Schema changes build
//! a successor sharing the same [`TableInfo`] (indexes and cardinality stay
//! single-sourced) and demote the predecessor by clearing its root flag;
//! non-root tables reject all mutation with a transaction conflict, while
//! readers holding the old version continue undisturbed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use arrow::array::{Array, ArrayRef, RecordBatchOptions};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;

use strata_expr::BoundExpression;
use strata_result::{Error, Result};
use strata_storage::{BlockId, IndexData, TableDataWriter, WalSink};
use strata_transaction::{TransactionManager, TxnId};

use crate::column::{ColumnDefinition, compact_ordinals, name_of_storage_column};
use crate::conflict::{ConflictInfo, ConflictManager, ConflictManagerMode, VerifyExistenceType};
use crate::constraints::{
    Constraint, ForeignKeyInfo, ForeignKeyType, is_foreign_key_constraint_error,
    locate_error_index,
};
use crate::index::{
    Index, IndexKind, IndexSet, append_to_index_set, remove_from_index_set,
};
use crate::local_storage::{LocalAppendState, OptimisticDataWriter};
use crate::row_group::{RowGroupCollection, RowGroupStorageInfo};
use crate::scan::{
    CollectionScanState, ParallelTableScanState, TableFilterSet, TableScanState, TableScanType,
};
use crate::stats::ColumnStatistics;
use crate::transaction::Transaction;
use crate::types::{
    COLUMN_IDENTIFIER_ROW_ID, ROW_GROUP_VECTOR_COUNT, RowId, TableId, VECTOR_SIZE,
    is_local_row_id,
};

/// Shared bundle owned jointly by a table and its schema-change successors.
#[derive(Debug)]
pub struct TableInfo {
    db: Weak<Database>,
    table_id: TableId,
    schema: String,
    table: String,
    cardinality: AtomicU64,
    indexes: IndexSet,
}

impl TableInfo {
    fn new(db: Weak<Database>, table_id: TableId, schema: String, table: String) -> Self {
        Self {
            db,
            table_id,
            schema,
            table,
            cardinality: AtomicU64::new(0),
            indexes: IndexSet::new(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn indexes(&self) -> &IndexSet {
        &self.indexes
    }

    /// Count of committed, non-reverted rows. Mutated only under the append
    /// lock of the current root table.
    pub fn cardinality(&self) -> u64 {
        self.cardinality.load(Ordering::Acquire)
    }

    fn set_cardinality(&self, value: u64) {
        self.cardinality.store(value, Ordering::Release);
    }

    fn add_cardinality(&self, count: u64) {
        self.cardinality.fetch_add(count, Ordering::AcqRel);
    }
}

/// The table-entry-handle registry: resolves (schema, table) names to the
/// current root version, as foreign-key verification requires.
pub struct Database {
    name: String,
    transaction_manager: TransactionManager,
    tables: RwLock<FxHashMap<(String, String), Arc<DataTable>>>,
    next_table_id: AtomicU64,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            transaction_manager: TransactionManager::new(),
            tables: RwLock::new(FxHashMap::default()),
            next_table_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.transaction_manager
    }

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::begin(&self.transaction_manager)
    }

    /// Create an empty table and install it.
    pub fn create_table(
        self: &Arc<Self>,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<ColumnDefinition>,
        constraints: Vec<Constraint>,
    ) -> Result<Arc<DataTable>> {
        let table = DataTable::new(self, schema.into(), table.into(), columns, constraints, None)?;
        self.install_table(&table);
        Ok(table)
    }

    /// Restore a table from checkpointed data and install it.
    pub fn restore_table(
        self: &Arc<Self>,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<ColumnDefinition>,
        constraints: Vec<Constraint>,
        data: &strata_storage::PersistentTableData,
    ) -> Result<Arc<DataTable>> {
        let table = DataTable::new(
            self,
            schema.into(),
            table.into(),
            columns,
            constraints,
            Some(data),
        )?;
        self.install_table(&table);
        Ok(table)
    }

    pub fn get_table(&self, schema: &str, table: &str) -> Option<Arc<DataTable>> {
        self.tables
            .read()
            .expect("table registry lock poisoned")
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
    }

    pub(crate) fn install_table(&self, table: &Arc<DataTable>) {
        let key = (
            table.info.schema().to_string(),
            table.info.table().to_string(),
        );
        self.tables
            .write()
            .expect("table registry lock poisoned")
            .insert(key, table.clone());
    }

    /// Drop a table: remove its handle and mark its storage reclaimable.
    pub fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let removed = self
            .tables
            .write()
            .expect("table registry lock poisoned")
            .remove(&(schema.to_string(), table.to_string()));
        match removed {
            Some(table) => {
                table.commit_drop_table();
                Ok(())
            }
            None => Err(Error::CatalogError(format!(
                "table {}.{} does not exist",
                schema, table
            ))),
        }
    }

    fn allocate_table_id(&self) -> TableId {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// State threaded through a table append: holds the append lock and tracks
/// the row range being written.
pub struct TableAppendState<'a> {
    append_lock: Option<MutexGuard<'a, ()>>,
    pub row_start: RowId,
    pub current_row: RowId,
    pub total_append_count: u64,
    txn_id: TxnId,
}

impl TableAppendState<'_> {
    pub fn new() -> Self {
        Self {
            append_lock: None,
            row_start: 0,
            current_row: 0,
            total_append_count: 0,
            txn_id: 0,
        }
    }
}

impl Default for TableAppendState<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Committed-rows scan that holds the append lock until dropped, so an
/// index build observes a stable row range.
pub struct CreateIndexScanState<'a> {
    _append_lock: MutexGuard<'a, ()>,
    pub scan: TableScanState,
}

/// One version of a table: column definitions, constraints, and storage.
#[derive(Debug)]
pub struct DataTable {
    info: Arc<TableInfo>,
    column_definitions: Vec<ColumnDefinition>,
    constraints: Vec<Constraint>,
    row_groups: Arc<RowGroupCollection>,
    append_lock: Mutex<()>,
    is_root: AtomicBool,
}

impl DataTable {
    fn new(
        db: &Arc<Database>,
        schema: String,
        table: String,
        mut columns: Vec<ColumnDefinition>,
        constraints: Vec<Constraint>,
        data: Option<&strata_storage::PersistentTableData>,
    ) -> Result<Arc<Self>> {
        compact_ordinals(&mut columns);
        let info = Arc::new(TableInfo::new(
            Arc::downgrade(db),
            db.allocate_table_id(),
            schema,
            table,
        ));

        for constraint in &constraints {
            match constraint {
                Constraint::Unique(unique) => {
                    info.indexes.add_index(Arc::new(Index::new(
                        IndexKind::Art,
                        true,
                        false,
                        unique.columns.clone(),
                    )));
                }
                Constraint::ForeignKey(fk) if fk.verified_on_append() => {
                    info.indexes.add_index(Arc::new(Index::new(
                        IndexKind::Art,
                        false,
                        true,
                        fk.fk_keys.clone(),
                    )));
                }
                _ => {}
            }
        }

        let types: Vec<DataType> = columns
            .iter()
            .filter(|col| !col.is_generated())
            .map(|col| col.logical_type().clone())
            .collect();

        // Initialize the table with the existing data from disk, if any.
        let row_groups = match data {
            Some(data) => {
                let collection = RowGroupCollection::restore(types, 0, data)?;
                info.set_cardinality(collection.get_total_rows());
                collection
            }
            None => RowGroupCollection::new(types, 0),
        };
        row_groups.verify();

        let table = Arc::new(Self {
            info,
            column_definitions: columns,
            constraints,
            row_groups: Arc::new(row_groups),
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        });

        if data.is_some() && !table.info.indexes.is_empty() && table.get_total_rows() > 0 {
            table.rebuild_indexes(db.transaction_manager())?;
        }
        Ok(table)
    }

    /// Re-derive index entries from restored row data.
    fn rebuild_indexes(&self, manager: &TransactionManager) -> Result<()> {
        let total = self.get_total_rows();
        let mut current_row: RowId = 0;
        self.scan_table_segment(manager, 0, total, |chunk| {
            append_to_index_set(&self.info.indexes, chunk, current_row)?;
            current_row += chunk.num_rows() as u64;
            Ok(())
        })
    }

    pub fn info(&self) -> &Arc<TableInfo> {
        &self.info
    }

    pub fn column_definitions(&self) -> &[ColumnDefinition] {
        &self.column_definitions
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// True iff this is the currently installed version of the table.
    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::Acquire)
    }

    /// Logical types of every column, generated columns included.
    pub fn types(&self) -> Vec<DataType> {
        self.column_definitions
            .iter()
            .map(|col| col.logical_type().clone())
            .collect()
    }

    /// Types of the stored (non-generated) columns, in storage order.
    pub fn physical_types(&self) -> Vec<DataType> {
        self.row_groups.types().to_vec()
    }

    fn physical_column_count(&self) -> usize {
        self.row_groups.types().len()
    }

    /// Schema of the stored columns, in storage order.
    pub fn physical_schema(&self) -> SchemaRef {
        let mut fields = Vec::with_capacity(self.physical_column_count());
        for col in &self.column_definitions {
            if col.is_generated() {
                continue;
            }
            fields.push(Field::new(col.name(), col.logical_type().clone(), true));
        }
        Arc::new(Schema::new(fields))
    }

    /// Schema of a projection over storage ordinals; the row-identifier
    /// sentinel becomes a non-null `row_id` column.
    pub fn projection_schema(&self, column_ids: &[usize]) -> Result<SchemaRef> {
        let mut fields = Vec::with_capacity(column_ids.len());
        for &column_id in column_ids {
            if column_id == COLUMN_IDENTIFIER_ROW_ID {
                fields.push(Field::new("row_id", DataType::UInt64, false));
                continue;
            }
            let name = name_of_storage_column(&self.column_definitions, column_id)?;
            let data_type = self.row_groups.types()[column_id].clone();
            fields.push(Field::new(name, data_type, true));
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.info
            .db
            .upgrade()
            .ok_or_else(|| Error::Internal("database handle dropped".into()))
    }

    fn check_physical_chunk(&self, chunk: &RecordBatch) -> Result<()> {
        if chunk.num_columns() != self.physical_column_count() {
            return Err(Error::Internal(format!(
                "unexpected column shape: chunk has {} columns, table stores {}",
                chunk.num_columns(),
                self.physical_column_count()
            )));
        }
        Ok(())
    }

    // =======================================================================
    // Scan
    // =======================================================================

    /// Bind a scan of the persistent store.
    pub fn initialize_scan(
        &self,
        state: &mut TableScanState,
        column_ids: Vec<usize>,
        filters: Option<TableFilterSet>,
    ) -> Result<()> {
        let schema = self.projection_schema(&column_ids)?;
        state.initialize(column_ids, filters, schema);
        self.row_groups.initialize_scan(&mut state.table_state);
        Ok(())
    }

    /// Bind a scan of the persistent store plus the transaction's local rows.
    pub fn initialize_scan_txn(
        &self,
        txn: &Transaction,
        state: &mut TableScanState,
        column_ids: Vec<usize>,
        filters: Option<TableFilterSet>,
    ) -> Result<()> {
        self.initialize_scan(state, column_ids, filters)?;
        txn.local_storage().initialize_scan(self, &mut state.local_state);
        Ok(())
    }

    /// Bind a committed-rows scan over `[start_row, end_row)`.
    pub fn initialize_scan_with_offset(
        &self,
        state: &mut TableScanState,
        column_ids: Vec<usize>,
        start_row: RowId,
        end_row: RowId,
    ) -> Result<()> {
        let schema = self.projection_schema(&column_ids)?;
        state.initialize(column_ids, None, schema);
        self.row_groups
            .initialize_scan_with_offset(&mut state.table_state, start_row, end_row);
        Ok(())
    }

    /// Produce the next vector of visible rows: persistent rows first, then
    /// the transaction's local rows. `None` once both are exhausted.
    pub fn scan(&self, txn: &Transaction, state: &mut TableScanState) -> Result<Option<RecordBatch>> {
        let schema = state
            .projection_schema
            .clone()
            .ok_or_else(|| Error::Internal("scan before initialize_scan".into()))?;

        // Scan the persistent segments.
        if let Some(batch) = self.row_groups.scan(
            txn.manager(),
            Some(&txn.snapshot()),
            &mut state.table_state,
            &state.column_ids,
            state.filters.as_ref(),
            &schema,
            TableScanType::Regular,
        )? {
            debug_assert!(batch.num_rows() > 0);
            return Ok(Some(batch));
        }

        // Scan the transaction-local segments.
        txn.local_storage().scan(
            self,
            txn.manager(),
            &txn.snapshot(),
            &mut state.local_state,
            &state.column_ids,
            state.filters.as_ref(),
            &schema,
        )
    }

    /// Number of scan tasks worth scheduling: one per partition of the
    /// persistent store, plus one. Local tasks come on top through the
    /// local storage.
    pub fn max_threads(&self, verify_parallelism: bool) -> u64 {
        let parallel_scan_vector_count = if verify_parallelism {
            1
        } else {
            ROW_GROUP_VECTOR_COUNT
        };
        let parallel_scan_tuple_count = (VECTOR_SIZE * parallel_scan_vector_count) as u64;
        self.get_total_rows() / parallel_scan_tuple_count + 1
    }

    pub fn initialize_parallel_scan(
        &self,
        txn: &Transaction,
        state: &mut ParallelTableScanState,
        verify_parallelism: bool,
    ) {
        self.row_groups
            .initialize_parallel_scan(&mut state.scan_state, verify_parallelism);
        txn.local_storage()
            .initialize_parallel_scan(self, &mut state.local_state, verify_parallelism);
    }

    /// Claim the next scan partition into `scan_state`; false when all
    /// persistent and local partitions are handed out.
    pub fn next_parallel_scan(
        &self,
        txn: &Transaction,
        state: &ParallelTableScanState,
        scan_state: &mut TableScanState,
    ) -> bool {
        if self
            .row_groups
            .next_parallel_scan(&state.scan_state, &mut scan_state.table_state)
        {
            return true;
        }
        // Persistent partitions are exhausted; this task reads local rows only.
        scan_state.table_state.initialized = false;
        txn.local_storage()
            .next_parallel_scan(self, &state.local_state, &mut scan_state.local_state)
    }

    /// Committed-rows scan used for index builds; the append lock is held by
    /// the state.
    pub fn initialize_create_index_scan(
        &self,
        column_ids: Vec<usize>,
    ) -> Result<CreateIndexScanState<'_>> {
        // Grab the append lock so nothing is appended until the scan is done.
        let guard = self.append_lock.lock().expect("append lock poisoned");
        let mut scan = TableScanState::new();
        let schema = self.projection_schema(&column_ids)?;
        scan.initialize(column_ids, None, schema);
        self.row_groups.initialize_scan(&mut scan.table_state);
        Ok(CreateIndexScanState {
            _append_lock: guard,
            scan,
        })
    }

    pub fn create_index_scan(
        &self,
        manager: &TransactionManager,
        state: &mut CreateIndexScanState<'_>,
    ) -> Result<Option<RecordBatch>> {
        let schema = state
            .scan
            .projection_schema
            .clone()
            .ok_or_else(|| Error::Internal("index scan before initialization".into()))?;
        self.row_groups.scan(
            manager,
            None,
            &mut state.scan.table_state,
            &state.scan.column_ids,
            None,
            &schema,
            TableScanType::Committed,
        )
    }

    // =======================================================================
    // Fetch
    // =======================================================================

    /// Fetch persistent rows by identifier; invisible rows are dropped.
    pub fn fetch(
        &self,
        txn: &Transaction,
        column_ids: &[usize],
        row_ids: &[RowId],
    ) -> Result<RecordBatch> {
        let schema = self.projection_schema(column_ids)?;
        self.row_groups
            .fetch(txn.manager(), &txn.snapshot(), column_ids, row_ids, &schema)
    }

    // =======================================================================
    // Local append
    // =======================================================================

    pub fn initialize_local_append(
        self: &Arc<Self>,
        state: &mut LocalAppendState,
        txn: &Transaction,
    ) -> Result<()> {
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "adding entries to a table that has been altered".into(),
            ));
        }
        txn.local_storage().initialize_append(state, self)
    }

    /// Verify constraints on `chunk` (unless `unverified`) and push it into
    /// the transaction's local storage.
    pub fn local_append(
        self: &Arc<Self>,
        state: &mut LocalAppendState,
        txn: &Transaction,
        chunk: &RecordBatch,
        unverified: bool,
    ) -> Result<()> {
        if chunk.num_rows() == 0 {
            return Ok(());
        }
        self.check_physical_chunk(chunk)?;
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "adding entries to a table that has been altered".into(),
            ));
        }

        if !unverified {
            self.verify_append_constraints(txn, chunk, None)?;
        }
        tracing::debug!(
            table = self.info.table(),
            rows = chunk.num_rows(),
            "local append"
        );
        txn.local_storage().append(state, chunk, txn.txn_id())
    }

    pub fn finalize_local_append(&self, txn: &Transaction, state: &mut LocalAppendState) {
        txn.local_storage().finalize_append(state);
    }

    /// Convenience one-shot local append.
    pub fn local_append_chunk(self: &Arc<Self>, txn: &Transaction, chunk: &RecordBatch) -> Result<()> {
        let mut state = LocalAppendState::default();
        self.initialize_local_append(&mut state, txn)?;
        self.local_append(&mut state, txn, chunk, false)?;
        self.finalize_local_append(txn, &mut state);
        Ok(())
    }

    pub fn create_optimistic_writer(self: &Arc<Self>, txn: &Transaction) -> OptimisticDataWriter {
        txn.local_storage().create_optimistic_writer(self)
    }

    /// Merge an optimistically written collection into local storage.
    pub fn local_merge(
        self: &Arc<Self>,
        txn: &Transaction,
        collection: RowGroupCollection,
    ) -> Result<()> {
        txn.local_storage()
            .local_merge(self, collection, txn.manager())
    }

    // =======================================================================
    // Append (commit path)
    // =======================================================================

    /// Take the append serialization lock and record the append base row.
    pub fn append_lock<'a>(&'a self, state: &mut TableAppendState<'a>) -> Result<()> {
        let guard = self.append_lock.lock().expect("append lock poisoned");
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "adding entries to a table that has been altered".into(),
            ));
        }
        state.row_start = self.row_groups.get_total_rows();
        state.current_row = state.row_start;
        state.append_lock = Some(guard);
        Ok(())
    }

    /// Reserve space for `append_count` rows. The append lock must be held
    /// through `state`.
    pub fn initialize_append(
        &self,
        txn: &Transaction,
        state: &mut TableAppendState<'_>,
        append_count: u64,
    ) -> Result<()> {
        if state.append_lock.is_none() {
            return Err(Error::Internal(
                "DataTable::append_lock should be called before DataTable::initialize_append"
                    .into(),
            ));
        }
        state.txn_id = txn.txn_id();
        state.total_append_count = append_count;
        Ok(())
    }

    /// Stream one chunk into the reserved append range.
    pub fn append(&self, chunk: &RecordBatch, state: &mut TableAppendState<'_>) -> Result<()> {
        debug_assert!(self.is_root());
        let start = self.row_groups.append(chunk, state.txn_id)?;
        debug_assert_eq!(start, state.current_row);
        state.current_row += chunk.num_rows() as u64;
        Ok(())
    }

    /// Stamp commit identifiers onto the appended range and advance the
    /// cardinality, atomically under the append lock.
    pub fn commit_append(&self, commit_id: TxnId, row_start: RowId, count: u64) {
        let _lock = self.append_lock.lock().expect("append lock poisoned");
        self.row_groups.commit_append(commit_id, row_start, count);
        self.info.add_cardinality(count);
    }

    /// Truncate the row groups back to `start_row` and restore cardinality.
    pub fn revert_append_internal(&self, start_row: RowId, count: u64) {
        if count == 0 {
            // Nothing to revert.
            return;
        }
        self.info.set_cardinality(start_row);
        debug_assert!(self.is_root());
        self.row_groups.revert_append_internal(start_row, count);
    }

    /// Undo an uncommitted append: delete the rows' index entries, then
    /// truncate the row groups.
    pub fn revert_append(
        &self,
        manager: &TransactionManager,
        start_row: RowId,
        count: u64,
    ) -> Result<()> {
        let _lock = self.append_lock.lock().expect("append lock poisoned");
        if !self.info.indexes.is_empty() {
            let mut current_row_base = start_row;
            self.scan_table_segment(manager, start_row, count, |chunk| {
                let row_ids: Vec<RowId> = (0..chunk.num_rows() as u64)
                    .map(|i| current_row_base + i)
                    .collect();
                remove_from_index_set(&self.info.indexes, chunk, &row_ids)?;
                current_row_base += chunk.num_rows() as u64;
                Ok(())
            })?;
        }
        self.revert_append_internal(start_row, count);
        Ok(())
    }

    /// Read committed rows in `[row_start, row_start + count)` and hand each
    /// vector to `f`, slicing the first and last vector when the range is
    /// not vector-aligned.
    pub fn scan_table_segment(
        &self,
        manager: &TransactionManager,
        row_start: RowId,
        count: u64,
        mut f: impl FnMut(&RecordBatch) -> Result<()>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = row_start + count;
        let column_ids: Vec<usize> = (0..self.physical_column_count()).collect();
        let schema = self.physical_schema();

        let mut state = CollectionScanState::default();
        self.row_groups
            .initialize_scan_with_offset(&mut state, row_start, end);
        let row_start_aligned = row_start / VECTOR_SIZE as u64 * VECTOR_SIZE as u64;

        let mut current_row = row_start_aligned;
        while current_row < end {
            let Some(chunk) = self.row_groups.scan(
                manager,
                None,
                &mut state,
                &column_ids,
                None,
                &schema,
                TableScanType::Committed,
            )?
            else {
                break;
            };
            if chunk.num_rows() == 0 {
                break;
            }
            let end_row = current_row + chunk.num_rows() as u64;
            // Figure out whether the whole chunk or only part of it lies in
            // the requested range.
            let chunk_start = current_row.max(row_start);
            let chunk_end = end_row.min(end);
            debug_assert!(chunk_start < chunk_end);
            let chunk_count = (chunk_end - chunk_start) as usize;
            if chunk_count != chunk.num_rows() {
                debug_assert!(chunk_count <= chunk.num_rows());
                let start_in_chunk = if current_row >= row_start {
                    0
                } else {
                    (row_start - current_row) as usize
                };
                let sliced = chunk.slice(start_in_chunk, chunk_count);
                f(&sliced)?;
            } else {
                f(&chunk)?;
            }
            current_row = end_row;
        }
        Ok(())
    }

    /// Move the rows of `data` into this table's row groups. The index list
    /// argument is accepted for future use and currently unused.
    pub fn merge_storage(&self, data: RowGroupCollection, _indexes: &IndexSet) -> Result<()> {
        self.row_groups.merge_storage(&data)?;
        self.row_groups.verify();
        Ok(())
    }

    /// Emit the committed range into the write-ahead log.
    pub fn write_to_log(
        &self,
        manager: &TransactionManager,
        log: &dyn WalSink,
        row_start: RowId,
        count: u64,
    ) -> Result<()> {
        if log.skip_writing() {
            return Ok(());
        }
        log.write_set_table(self.info.schema(), self.info.table())?;
        self.scan_table_segment(manager, row_start, count, |chunk| log.write_insert(chunk))
    }

    // =======================================================================
    // Indexes
    // =======================================================================

    /// Append `chunk` (rows `row_start + i`) to all committed indexes; on a
    /// uniqueness failure entries already inserted are removed again.
    pub fn append_to_indexes(&self, chunk: &RecordBatch, row_start: RowId) -> Result<()> {
        debug_assert!(self.is_root());
        append_to_index_set(&self.info.indexes, chunk, row_start)
    }

    /// Remove `chunk` (rows `row_start + i`) from all committed indexes.
    pub fn remove_from_indexes(&self, chunk: &RecordBatch, row_start: RowId) -> Result<()> {
        debug_assert!(self.is_root());
        if self.info.indexes.is_empty() {
            return Ok(());
        }
        let row_ids: Vec<RowId> = (0..chunk.num_rows() as u64).map(|i| row_start + i).collect();
        remove_from_index_set(&self.info.indexes, chunk, &row_ids)
    }

    /// Remove explicitly identified rows from all committed indexes.
    pub fn remove_from_indexes_with_ids(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()> {
        debug_assert!(self.is_root());
        remove_from_index_set(&self.info.indexes, chunk, row_ids)
    }

    // =======================================================================
    // Constraint verification
    // =======================================================================

    fn verify_not_null_constraint(&self, column: &ArrayRef, storage_ordinal: usize) -> Result<()> {
        if column.null_count() == 0 {
            return Ok(());
        }
        let column_name = name_of_storage_column(&self.column_definitions, storage_ordinal)?;
        Err(Error::ConstraintViolation(format!(
            "NOT NULL constraint failed: {}.{}",
            self.info.table(),
            column_name
        )))
    }

    /// Execute a CHECK expression over `chunk` into a 32-bit result column;
    /// any non-null zero row fails. Expression failures are wrapped as
    /// constraint violations, internal errors propagate unchanged.
    fn verify_check_constraint(&self, expression: &BoundExpression, chunk: &RecordBatch) -> Result<()> {
        let result = expression
            .execute(chunk)
            .and_then(|values| Ok(cast(values.as_ref(), &DataType::Int32)?));
        let values = match result {
            Ok(values) => values,
            Err(err) if err.is_internal() => return Err(err),
            Err(err) => {
                return Err(Error::ConstraintViolation(format!(
                    "CHECK constraint failed: {} (Error: {})",
                    self.info.table(),
                    err
                )));
            }
        };
        let values = values
            .as_any()
            .downcast_ref::<arrow::array::Int32Array>()
            .ok_or_else(|| Error::Internal("CHECK result did not cast to Int32".into()))?;
        for i in 0..chunk.num_rows() {
            if values.is_valid(i) && values.value(i) == 0 {
                return Err(Error::ConstraintViolation(format!(
                    "CHECK constraint failed: {}",
                    self.info.table()
                )));
            }
        }
        Ok(())
    }

    /// Execute each generated column's expression over the chunk so errors
    /// surface at insert time rather than at read time.
    fn verify_generated_expressions(&self, chunk: &RecordBatch) -> Result<()> {
        for col in &self.column_definitions {
            let Some(expression) = col.generation_expression() else {
                continue;
            };
            if let Err(err) = expression.execute(chunk) {
                if err.is_internal() {
                    return Err(err);
                }
                return Err(Error::ConstraintViolation(format!(
                    "Incorrect value for generated column \"{} {:?}\": {}",
                    col.name(),
                    col.logical_type(),
                    err
                )));
            }
        }
        Ok(())
    }

    fn verify_unique_indexes(&self, chunk: &RecordBatch) -> Result<()> {
        // Only need to verify that no unique constraints are violated.
        let mut first_err = None;
        self.info.indexes.scan(|index| {
            if !index.is_unique() {
                return false;
            }
            if let Err(err) = index.verify_append(chunk, None) {
                first_err = Some(err);
                return true;
            }
            false
        });
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Two-phase unique verification for the ON CONFLICT path: scan the
    /// indexes matching the conflict target first, then verify the rest in
    /// throw mode so only tuples not already recorded fail.
    fn verify_unique_indexes_with_conflicts(
        &self,
        chunk: &RecordBatch,
        conflict_manager: &mut ConflictManager<'_>,
    ) -> Result<()> {
        let conflict_info = conflict_manager
            .conflict_info()
            .ok_or_else(|| Error::Internal("conflict manager without a conflict target".into()))?;

        // Figure out how many indexes match the conflict target first.
        let mut matching_indexes = 0;
        self.info.indexes.scan(|index| {
            matching_indexes += usize::from(conflict_info.conflict_target_matches(index));
            false
        });
        conflict_manager.set_mode(ConflictManagerMode::Scan);
        conflict_manager.set_index_count(matching_indexes);

        let mut first_err = None;
        self.info.indexes.scan(|index| {
            if !index.is_unique() {
                return false;
            }
            if conflict_info.conflict_target_matches(index) {
                if let Err(err) = index.verify_append(chunk, Some(&mut *conflict_manager)) {
                    first_err = Some(err);
                    return true;
                }
            }
            false
        });
        if let Some(err) = first_err {
            return Err(err);
        }

        conflict_manager.set_mode(ConflictManagerMode::Throw);
        self.info.indexes.scan(|index| {
            if !index.is_unique() {
                return false;
            }
            if let Err(err) = index.verify_append(chunk, Some(&mut *conflict_manager)) {
                first_err = Some(err);
                return true;
            }
            false
        });
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Validate NOT NULL, CHECK, UNIQUE, and child-side FOREIGN KEY rules for
    /// an append of `chunk`.
    pub fn verify_append_constraints(
        &self,
        txn: &Transaction,
        chunk: &RecordBatch,
        mut conflict_manager: Option<&mut ConflictManager<'_>>,
    ) -> Result<()> {
        self.verify_generated_expressions(chunk)?;

        for constraint in &self.constraints {
            match constraint {
                Constraint::NotNull(not_null) => {
                    self.verify_not_null_constraint(chunk.column(not_null.column), not_null.column)?;
                }
                Constraint::Check(check) => {
                    self.verify_check_constraint(&check.expression, chunk)?;
                }
                Constraint::Unique(_) => match conflict_manager.as_deref_mut() {
                    // Only provided when an ON CONFLICT clause was given.
                    Some(cm) => self.verify_unique_indexes_with_conflicts(chunk, cm)?,
                    None => self.verify_unique_indexes(chunk)?,
                },
                Constraint::ForeignKey(fk) => {
                    if fk.verified_on_append() {
                        self.verify_foreign_key_constraint(
                            txn,
                            fk,
                            chunk,
                            VerifyExistenceType::AppendFk,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate parent-side FOREIGN KEY rules for a delete of `chunk`.
    pub fn verify_delete_constraints(&self, txn: &Transaction, chunk: &RecordBatch) -> Result<()> {
        for constraint in &self.constraints {
            match constraint {
                Constraint::NotNull(_) | Constraint::Check(_) | Constraint::Unique(_) => {}
                Constraint::ForeignKey(fk) => {
                    if fk.verified_on_delete() {
                        self.verify_foreign_key_constraint(
                            txn,
                            fk,
                            chunk,
                            VerifyExistenceType::DeleteFk,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Construct a full-width chunk in this table's layout where the updated
    /// columns reference `chunk` and the rest are null, provided the desired
    /// columns are all present among `column_ids`.
    fn create_mock_chunk(
        &self,
        column_ids: &[usize],
        desired_column_ids: &[usize],
        chunk: &RecordBatch,
    ) -> Result<Option<RecordBatch>> {
        let mut found_columns = 0;
        // Check whether the desired columns are present in the UPDATE chunk.
        for column_id in column_ids {
            if desired_column_ids.contains(column_id) {
                found_columns += 1;
            }
        }
        if found_columns == 0 {
            // No columns were found: no need to check the constraint again.
            return Ok(None);
        }
        if found_columns != desired_column_ids.len() {
            // This should not be triggered at all as the binder should add
            // these columns.
            return Err(Error::Internal(
                "not all columns required for the CHECK constraint are present in the updated chunk"
                    .into(),
            ));
        }

        let types = self.physical_types();
        let count = chunk.num_rows();
        let mut columns: Vec<ArrayRef> = types
            .iter()
            .map(|ty| arrow::array::new_null_array(ty, count))
            .collect();
        for (i, &column_id) in column_ids.iter().enumerate() {
            columns[column_id] = chunk.column(i).clone();
        }
        let batch = RecordBatch::try_new_with_options(
            self.physical_schema(),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(count)),
        )?;
        Ok(Some(batch))
    }

    /// Validate NOT NULL and CHECK for an update of `column_ids`. UNIQUE and
    /// FOREIGN KEY are assumed to have been rewritten to delete + insert by
    /// a higher layer; a debug pass asserts no indexed column is updated.
    pub fn verify_update_constraints(
        &self,
        chunk: &RecordBatch,
        column_ids: &[usize],
    ) -> Result<()> {
        for i in 0..self.constraints.len() {
            match &self.constraints[i] {
                Constraint::NotNull(not_null) => {
                    // Check whether the constrained column is in the update.
                    for i in 0..column_ids.len() {
                        if column_ids[i] == not_null.column {
                            self.verify_not_null_constraint(chunk.column(i), not_null.column)?;
                            break;
                        }
                    }
                }
                Constraint::Check(check) => {
                    if let Some(mock_chunk) =
                        self.create_mock_chunk(column_ids, &check.bound_columns, chunk)?
                    {
                        self.verify_check_constraint(&check.expression, &mock_chunk)?;
                    }
                }
                Constraint::Unique(_) | Constraint::ForeignKey(_) => {}
            }
        }
        // Update should not be called for indexed columns; those updates are
        // rewritten to delete + insert on a higher layer.
        #[cfg(debug_assertions)]
        self.info.indexes.scan(|index| {
            debug_assert!(!index.index_is_updated(column_ids));
            false
        });
        Ok(())
    }

    /// Two-sided foreign-key existence check.
    ///
    /// Projects the key columns into a chunk laid out for the referenced
    /// table, runs a scan-mode existence check against both the referenced
    /// table's committed indexes and its transaction-local indexes, and
    /// interprets the match sets per direction: append requires every row to
    /// match on at least one side, delete requires no match on either side.
    fn verify_foreign_key_constraint(
        &self,
        txn: &Transaction,
        fk: &ForeignKeyInfo,
        chunk: &RecordBatch,
        verify_type: VerifyExistenceType,
    ) -> Result<()> {
        let is_append = verify_type == VerifyExistenceType::AppendFk;
        let (src_keys, dst_keys): (&[usize], &[usize]) = if is_append {
            (&fk.fk_keys, &fk.pk_keys)
        } else {
            (&fk.pk_keys, &fk.fk_keys)
        };

        let db = self.db()?;
        let dst_table = db.get_table(&fk.schema, &fk.table).ok_or_else(|| {
            Error::Internal(format!(
                "can't find table \"{}\" in foreign key constraint",
                fk.table
            ))
        })?;

        let count = chunk.num_rows();
        if count == 0 {
            return Ok(());
        }

        // Build the chunk to check, laid out for the referenced table.
        let types = dst_table.physical_types();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(types.len());
        for (i, ty) in types.iter().enumerate() {
            match dst_keys.iter().position(|key| *key == i) {
                Some(pos) => columns.push(chunk.column(src_keys[pos]).clone()),
                None => columns.push(arrow::array::new_null_array(ty, count)),
            }
        }
        let dst_chunk = RecordBatch::try_new_with_options(
            dst_table.physical_schema(),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(count)),
        )?;

        // Record conflicts on both sides rather than throwing directly.
        let empty_conflict_info = ConflictInfo::default();
        let mut regular_conflicts =
            ConflictManager::new(verify_type, count, Some(&empty_conflict_info));
        let mut transaction_conflicts =
            ConflictManager::new(verify_type, count, Some(&empty_conflict_info));
        regular_conflicts.set_mode(ConflictManagerMode::Scan);
        transaction_conflicts.set_mode(ConflictManagerMode::Scan);

        dst_table
            .info
            .indexes
            .verify_foreign_key(dst_keys, &dst_chunk, &mut regular_conflicts)?;
        regular_conflicts.finalize();
        let regular_matches = regular_conflicts.conflicts();

        // Check the referenced table's transaction-local storage as well.
        let local = txn.local_storage().get(&dst_table);
        let transaction_check = local.is_some();
        let error = is_foreign_key_constraint_error(is_append, count, &regular_matches);
        let mut transaction_error = false;
        let transaction_matches = match &local {
            Some(local) => {
                local
                    .indexes()
                    .verify_foreign_key(dst_keys, &dst_chunk, &mut transaction_conflicts)?;
                transaction_conflicts.finalize();
                let matches = transaction_conflicts.conflicts();
                transaction_error = is_foreign_key_constraint_error(is_append, count, &matches);
                Some(matches)
            }
            None => None,
        };

        if !transaction_error && !error {
            // No error occurred.
            return Ok(());
        }

        let fk_index_type = if is_append {
            ForeignKeyType::PrimaryKeyTable
        } else {
            ForeignKeyType::ForeignKeyTable
        };
        let index = dst_table
            .info
            .indexes
            .find_foreign_key_index(dst_keys, fk_index_type);
        let transaction_index = local
            .as_ref()
            .and_then(|l| l.indexes().find_foreign_key_index(dst_keys, fk_index_type));

        if !transaction_check {
            // Only committed state was checked; the error must come from it.
            debug_assert!(error);
            let failed_index = locate_error_index(is_append, &regular_matches, count)
                .ok_or_else(|| Error::Internal("failed to locate foreign key error row".into()))?;
            return Err(foreign_key_error(
                failed_index,
                verify_type,
                index.as_deref(),
                &dst_chunk,
            ));
        }

        if transaction_error && error && is_append {
            // An append only fails when the key exists in neither committed
            // nor transaction-local storage.
            let transaction_matches = transaction_matches
                .as_ref()
                .expect("transaction side was checked");
            let mut failed_index = None;
            let mut regular_idx = 0;
            let mut transaction_idx = 0;
            for i in 0..count {
                let in_regular = regular_matches.index_maps_to_location(regular_idx, i);
                regular_idx += usize::from(in_regular);
                let in_transaction = transaction_matches.index_maps_to_location(transaction_idx, i);
                transaction_idx += usize::from(in_transaction);
                if !in_regular && !in_transaction {
                    failed_index = Some(i);
                    break;
                }
            }
            let Some(failed_index) = failed_index else {
                // Every value was present in either committed or local state.
                return Ok(());
            };
            return Err(foreign_key_error(
                failed_index,
                verify_type,
                index.as_deref(),
                &dst_chunk,
            ));
        }

        if !is_append {
            let transaction_matches = transaction_matches
                .as_ref()
                .expect("transaction side was checked");
            if error {
                let failed_index = locate_error_index(false, &regular_matches, count)
                    .ok_or_else(|| Error::Internal("failed to locate foreign key error row".into()))?;
                return Err(foreign_key_error(
                    failed_index,
                    verify_type,
                    index.as_deref(),
                    &dst_chunk,
                ));
            }
            debug_assert!(transaction_error);
            let failed_index = locate_error_index(false, transaction_matches, count)
                .ok_or_else(|| Error::Internal("failed to locate foreign key error row".into()))?;
            return Err(foreign_key_error(
                failed_index,
                verify_type,
                transaction_index.as_deref(),
                &dst_chunk,
            ));
        }

        Ok(())
    }

    /// Check a constraint being added by ALTER against all existing
    /// persistent and transaction-local rows. Only NOT NULL is supported.
    pub fn verify_new_constraint(&self, txn: &Transaction, constraint: &Constraint) -> Result<()> {
        let Constraint::NotNull(not_null) = constraint else {
            return Err(Error::NotImplemented(
                "ALTER TABLE with such a constraint is not supported yet".into(),
            ));
        };
        let column_name =
            name_of_storage_column(&self.column_definitions, not_null.column)?.to_string();
        self.row_groups.verify_new_constraint(
            txn.manager(),
            self.info.table(),
            &column_name,
            not_null.column,
        )?;
        txn.local_storage().verify_new_constraint(
            self,
            txn.manager(),
            self.info.table(),
            &column_name,
            not_null.column,
        )
    }

    // =======================================================================
    // Delete
    // =======================================================================

    /// Delete rows by identifier, routing to local or persistent storage by
    /// the identifier bucket. Returns the count of rows actually removed.
    pub fn delete(self: &Arc<Self>, txn: &Transaction, row_ids: &[RowId]) -> Result<u64> {
        if row_ids.is_empty() {
            return Ok(0);
        }
        let first_id = row_ids[0];

        // Fetch the rows for delete-side constraint verification.
        // TODO: only fetch when a parent-side foreign key exists, and only
        // the columns that participate in it.
        let verify_chunk = if is_local_row_id(first_id) {
            txn.local_storage()
                .fetch_chunk(self, txn.manager(), &txn.snapshot(), row_ids)?
        } else {
            let column_ids: Vec<usize> = (0..self.physical_column_count()).collect();
            self.fetch(txn, &column_ids, row_ids)?
        };
        self.verify_delete_constraints(txn, &verify_chunk)?;

        tracing::debug!(
            table = self.info.table(),
            rows = row_ids.len(),
            local = is_local_row_id(first_id),
            "delete"
        );
        if is_local_row_id(first_id) {
            // Deletion is in transaction-local storage.
            txn.local_storage()
                .delete(self, txn.manager(), &txn.snapshot(), row_ids)
        } else {
            self.row_groups.delete(txn.manager(), txn.txn_id(), row_ids)
        }
    }

    // =======================================================================
    // Update
    // =======================================================================

    /// Update `column_ids` of the given rows with the columns of `updates`,
    /// routing by the identifier bucket of the first row.
    pub fn update(
        &self,
        txn: &Transaction,
        row_ids: &[RowId],
        column_ids: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        debug_assert_eq!(column_ids.len(), updates.num_columns());
        if updates.num_rows() == 0 {
            return Ok(());
        }
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "cannot update a table that has been altered".into(),
            ));
        }

        // First verify that no constraints are violated.
        self.verify_update_constraints(updates, column_ids)?;

        let first_id = row_ids[0];
        if is_local_row_id(first_id) {
            // Update is in transaction-local storage.
            return txn.local_storage().update(self, row_ids, column_ids, updates);
        }
        self.row_groups.update(row_ids, column_ids, updates)
    }

    /// Update a single column (addressed by `column_path`) of persistent
    /// rows with the one-column `updates` chunk.
    pub fn update_column(
        &self,
        _txn: &Transaction,
        row_ids: &[RowId],
        column_path: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        debug_assert_eq!(updates.num_columns(), 1);
        if updates.num_rows() == 0 {
            return Ok(());
        }
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "cannot update a table that has been altered".into(),
            ));
        }
        self.row_groups.update_column(row_ids, column_path, updates)
    }

    // =======================================================================
    // Statistics
    // =======================================================================

    pub fn get_statistics(&self, column_id: usize) -> Option<ColumnStatistics> {
        if column_id == COLUMN_IDENTIFIER_ROW_ID {
            return None;
        }
        self.row_groups.copy_stats(column_id)
    }

    pub fn set_statistics(&self, column_id: usize, set_fn: impl FnOnce(&mut ColumnStatistics)) {
        debug_assert!(column_id != COLUMN_IDENTIFIER_ROW_ID);
        self.row_groups.set_statistics(column_id, set_fn);
    }

    // =======================================================================
    // Checkpoint
    // =======================================================================

    /// Serialize the table: row-group payloads, then column statistics,
    /// row-group pointers, the table pointer, and index data, in that order.
    /// Returns the table-pointer block.
    pub fn checkpoint(
        &self,
        manager: &TransactionManager,
        mut writer: TableDataWriter<'_>,
    ) -> Result<BlockId> {
        let mut global_stats = Vec::with_capacity(self.physical_column_count());
        for i in 0..self.physical_column_count() {
            let stats = self.row_groups.copy_stats(i).unwrap_or_default();
            global_stats.push(stats.data().clone());
        }

        self.row_groups
            .checkpoint(manager, &self.physical_schema(), &mut writer)?;

        let mut index_data = Vec::new();
        self.info.indexes.scan(|index| {
            index_data.push(IndexData {
                kind: strata_storage::IndexKindData::Art,
                is_unique: index.is_unique(),
                is_foreign: index.is_foreign(),
                column_ids: index.column_ids().iter().map(|&id| id as u64).collect(),
            });
            false
        });

        tracing::debug!(table = self.info.table(), "checkpoint");
        writer.finalize_table(
            global_stats,
            self.info.schema(),
            self.info.table(),
            self.info.cardinality(),
            index_data,
        )
    }

    pub fn commit_drop_column(&self, storage_idx: usize) {
        self.row_groups.commit_drop_column(storage_idx);
    }

    /// Commit a drop of this table: its storage becomes reclaimable.
    pub fn commit_drop_table(&self) {
        self.row_groups.commit_drop_table();
    }

    pub fn get_total_rows(&self) -> u64 {
        self.row_groups.get_total_rows()
    }

    pub fn get_storage_info(&self) -> Vec<RowGroupStorageInfo> {
        self.row_groups.get_storage_info()
    }

    // =======================================================================
    // Schema change
    // =======================================================================

    fn publish_successor(&self, successor: &Arc<DataTable>) {
        if let Some(db) = self.info.db.upgrade() {
            db.install_table(successor);
        }
        // This table is replaced; it is no longer the root version.
        self.is_root.store(false, Ordering::Release);
    }

    /// ALTER TABLE ADD COLUMN: build a successor with `new_column` appended,
    /// filled from the default expression.
    pub fn from_add_column(
        parent: &Arc<DataTable>,
        txn: &Transaction,
        new_column: ColumnDefinition,
        default: Option<&BoundExpression>,
    ) -> Result<Arc<DataTable>> {
        let mut column_definitions = parent.column_definitions.clone();
        let mut new_column = new_column;
        new_column.set_ordinal(column_definitions.len());
        if !new_column.is_generated() {
            new_column.set_storage_ordinal(parent.physical_column_count());
        }
        column_definitions.push(new_column.clone());

        // Prevent any new tuples from being added to the parent.
        let _parent_lock = parent.append_lock.lock().expect("append lock poisoned");

        let row_groups = if new_column.is_generated() {
            parent.row_groups.clone()
        } else {
            Arc::new(parent.row_groups.add_column(&new_column, default)?)
        };

        let table = Arc::new(DataTable {
            info: parent.info.clone(),
            column_definitions,
            constraints: parent.constraints.clone(),
            row_groups,
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        });

        // Also add the column to any outstanding transaction-local data.
        if new_column.is_generated() {
            txn.local_storage().move_storage(parent, &table);
        } else {
            txn.local_storage()
                .add_column(parent, &table, &new_column, default)?;
        }

        tracing::debug!(
            table = parent.info.table(),
            column = new_column.name(),
            "add column"
        );
        parent.publish_successor(&table);
        Ok(table)
    }

    /// ALTER TABLE DROP COLUMN: build a successor without `removed_column`
    /// (a declared ordinal).
    pub fn from_drop_column(
        parent: &Arc<DataTable>,
        txn: &Transaction,
        removed_column: usize,
    ) -> Result<Arc<DataTable>> {
        // Prevent any new tuples from being added to the parent.
        let _parent_lock = parent.append_lock.lock().expect("append lock poisoned");

        let removed_def = parent
            .column_definitions
            .get(removed_column)
            .ok_or_else(|| {
                Error::Internal(format!("no column at ordinal {}", removed_column))
            })?;
        let removed_storage = removed_def.storage_ordinal();
        // Storage position at (or just past) the removed column, for the
        // ordering rule below.
        let storage_boundary = parent.column_definitions[..removed_column]
            .iter()
            .filter(|col| !col.is_generated())
            .count();

        // First check whether any index depends on the removed column, or on
        // any column stored after it.
        let mut index_err = None;
        parent.info.indexes.scan(|index| {
            for &column_id in index.column_ids() {
                if removed_storage == Some(column_id) {
                    index_err = Some(Error::CatalogError(
                        "cannot drop this column: an index depends on it".into(),
                    ));
                    return true;
                } else if column_id > storage_boundary
                    || (removed_storage.is_none() && column_id >= storage_boundary)
                {
                    index_err = Some(Error::CatalogError(
                        "cannot drop this column: an index depends on a column after it".into(),
                    ));
                    return true;
                }
            }
            false
        });
        if let Some(err) = index_err {
            return Err(err);
        }

        let mut column_definitions = parent.column_definitions.clone();
        column_definitions.remove(removed_column);
        compact_ordinals(&mut column_definitions);

        let row_groups = match removed_storage {
            Some(storage_idx) => Arc::new(parent.row_groups.remove_column(storage_idx)?),
            // Dropping a generated column leaves the stored layout untouched.
            None => parent.row_groups.clone(),
        };

        let table = Arc::new(DataTable {
            info: parent.info.clone(),
            column_definitions,
            constraints: parent.constraints.clone(),
            row_groups,
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        });

        txn.local_storage().drop_column(parent, &table, removed_storage)?;

        tracing::debug!(
            table = parent.info.table(),
            ordinal = removed_column,
            "drop column"
        );
        parent.publish_successor(&table);
        Ok(table)
    }

    /// ALTER TABLE ADD CONSTRAINT: verify the constraint against existing
    /// rows, then build a successor sharing the parent's row groups (no
    /// layout change is involved).
    pub fn from_add_constraint(
        parent: &Arc<DataTable>,
        txn: &Transaction,
        constraint: Constraint,
    ) -> Result<Arc<DataTable>> {
        let _parent_lock = parent.append_lock.lock().expect("append lock poisoned");

        // Verify the new constraint against current persistent and local data.
        parent.verify_new_constraint(txn, &constraint)?;

        let mut constraints = parent.constraints.clone();
        constraints.push(constraint);

        let table = Arc::new(DataTable {
            info: parent.info.clone(),
            column_definitions: parent.column_definitions.clone(),
            constraints,
            row_groups: parent.row_groups.clone(),
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        });

        // Hand the local data ownership to the successor.
        txn.local_storage().move_storage(parent, &table);

        parent.publish_successor(&table);
        Ok(table)
    }

    /// ALTER TABLE ALTER TYPE: build a successor with `changed_idx` (a
    /// declared ordinal) converted to `target_type` through `cast_expr`,
    /// which reads `bound_columns` (storage ordinals).
    pub fn from_change_type(
        parent: &Arc<DataTable>,
        txn: &Transaction,
        changed_idx: usize,
        target_type: DataType,
        bound_columns: &[usize],
        cast_expr: &BoundExpression,
    ) -> Result<Arc<DataTable>> {
        // Prevent any tuples from being added to the parent.
        let _parent_lock = parent.append_lock.lock().expect("append lock poisoned");

        let changed_def = parent.column_definitions.get(changed_idx).ok_or_else(|| {
            Error::Internal(format!("no column at ordinal {}", changed_idx))
        })?;
        let Some(changed_storage) = changed_def.storage_ordinal() else {
            return Err(Error::NotImplemented(
                "changing the type of a generated column is not supported".into(),
            ));
        };

        // First check whether any index depends on the changed column.
        let mut index_err = None;
        parent.info.indexes.scan(|index| {
            for &column_id in index.column_ids() {
                if column_id == changed_storage {
                    index_err = Some(Error::CatalogError(
                        "cannot change the type of this column: an index depends on it".into(),
                    ));
                    return true;
                }
            }
            false
        });
        if let Some(err) = index_err {
            return Err(err);
        }

        let mut column_definitions = parent.column_definitions.clone();
        column_definitions[changed_idx].set_type(target_type.clone());

        // The converted column has its statistics recomputed during the
        // conversion.
        let row_groups = Arc::new(parent.row_groups.alter_type(
            changed_storage,
            &target_type,
            bound_columns,
            cast_expr,
        )?);

        let table = Arc::new(DataTable {
            info: parent.info.clone(),
            column_definitions,
            constraints: parent.constraints.clone(),
            row_groups,
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        });

        txn.local_storage().change_type(
            parent,
            &table,
            changed_storage,
            &target_type,
            bound_columns,
            cast_expr,
        )?;

        tracing::debug!(
            table = parent.info.table(),
            ordinal = changed_idx,
            "change column type"
        );
        parent.publish_successor(&table);
        Ok(table)
    }
}

/// Build the constraint-violation error for a failed foreign-key check.
fn foreign_key_error(
    failed_index: usize,
    verify_type: VerifyExistenceType,
    index: Option<&Index>,
    chunk: &RecordBatch,
) -> Error {
    let Some(index) = index else {
        return Error::Internal("missing foreign key index for error reporting".into());
    };
    debug_assert_eq!(index.kind(), IndexKind::Art);
    match index.generate_error_key_name(chunk, failed_index) {
        Ok(key_name) => Error::ConstraintViolation(
            index.generate_constraint_error_message(verify_type, &key_name),
        ),
        Err(err) => err,
    }
}
