//! Per-transaction local storage.
//!
//! Uncommitted rows live in a private row-group collection whose row
//! identifiers start at [`MAX_ROW_ID`], alongside a transaction-local index
//! set mirroring the table's indexes. Both are keyed by table identity so
//! schema-change successors (which share `TableInfo`) keep addressing the
//! same local state.

use std::sync::{Arc, Mutex, RwLock};

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;

use strata_expr::BoundExpression;
use strata_result::{Error, Result};
use strata_transaction::{TransactionManager, TransactionSnapshot, TxnId};

use crate::column::ColumnDefinition;
use crate::index::{Index, IndexSet, append_to_index_set, remove_from_index_set};
use crate::row_group::RowGroupCollection;
use crate::scan::{
    CollectionScanState, ParallelCollectionScanState, TableFilterSet, TableScanType,
};
use crate::table::DataTable;
use crate::types::{COLUMN_IDENTIFIER_ROW_ID, MAX_ROW_ID, RowId, TableId};

/// Handle for an in-progress local append.
#[derive(Debug, Default)]
pub struct LocalAppendState {
    table_id: Option<TableId>,
}

/// Writer that accumulates rows outside the transaction's local collection,
/// merged in at completion via `local_merge`.
pub struct OptimisticDataWriter {
    collection: RowGroupCollection,
}

impl OptimisticDataWriter {
    pub(crate) fn new(types: Vec<arrow::datatypes::DataType>) -> Self {
        Self {
            collection: RowGroupCollection::new(types, MAX_ROW_ID),
        }
    }

    pub fn append(&self, chunk: &RecordBatch, txn_id: TxnId) -> Result<()> {
        self.collection.append(chunk, txn_id)?;
        Ok(())
    }

    pub fn into_collection(self) -> RowGroupCollection {
        self.collection
    }
}

/// Uncommitted state for one table within one transaction.
pub struct LocalTableStorage {
    table: RwLock<Arc<DataTable>>,
    row_groups: RwLock<Arc<RowGroupCollection>>,
    indexes: IndexSet,
}

impl LocalTableStorage {
    fn new(table: Arc<DataTable>) -> Self {
        let collection = RowGroupCollection::new(table.physical_types(), MAX_ROW_ID);
        let indexes = IndexSet::new();
        // Mirror the table's index definitions so uniqueness and foreign
        // keys can be checked against uncommitted rows.
        table.info().indexes().scan(|index| {
            indexes.add_index(Arc::new(Index::new(
                index.kind(),
                index.is_unique(),
                index.is_foreign(),
                index.column_ids().to_vec(),
            )));
            false
        });
        Self {
            table: RwLock::new(table),
            row_groups: RwLock::new(Arc::new(collection)),
            indexes,
        }
    }

    pub fn table(&self) -> Arc<DataTable> {
        self.table.read().expect("local table lock poisoned").clone()
    }

    fn set_table(&self, table: Arc<DataTable>) {
        *self.table.write().expect("local table lock poisoned") = table;
    }

    pub fn collection(&self) -> Arc<RowGroupCollection> {
        self.row_groups
            .read()
            .expect("local collection lock poisoned")
            .clone()
    }

    fn set_collection(&self, collection: Arc<RowGroupCollection>) {
        *self
            .row_groups
            .write()
            .expect("local collection lock poisoned") = collection;
    }

    pub fn indexes(&self) -> &IndexSet {
        &self.indexes
    }

    /// Append a chunk and maintain the local indexes; rolls the row-group
    /// append back if an index rejects the rows.
    fn append(&self, chunk: &RecordBatch, txn_id: TxnId) -> Result<()> {
        let collection = self.collection();
        let row_start = collection.append(chunk, txn_id)?;
        if let Err(err) = append_to_index_set(&self.indexes, chunk, row_start) {
            collection.revert_append_internal(row_start, chunk.num_rows() as u64);
            return Err(err);
        }
        Ok(())
    }
}

/// All transaction-local table state of one transaction, keyed by table
/// identity. Single-threaded per transaction by contract; the interior
/// locks only make sharing with scans safe.
pub struct LocalStorage {
    tables: Mutex<FxHashMap<TableId, Arc<LocalTableStorage>>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(FxHashMap::default()),
        }
    }

    /// The local state for `table`, if this transaction has written to it.
    pub fn get(&self, table: &DataTable) -> Option<Arc<LocalTableStorage>> {
        self.tables
            .lock()
            .expect("local storage lock poisoned")
            .get(&table.info().table_id())
            .cloned()
    }

    /// Whether this transaction holds local state for `table`.
    pub fn find(&self, table: &DataTable) -> bool {
        self.get(table).is_some()
    }

    /// The transaction-local index set for `table`, if any.
    pub fn get_indexes(&self, table: &DataTable) -> Option<Arc<LocalTableStorage>> {
        self.get(table)
    }

    fn get_or_create(&self, table: &Arc<DataTable>) -> Arc<LocalTableStorage> {
        self.tables
            .lock()
            .expect("local storage lock poisoned")
            .entry(table.info().table_id())
            .or_insert_with(|| Arc::new(LocalTableStorage::new(table.clone())))
            .clone()
    }

    /// Every table with local state, for commit-time flushing.
    pub fn storages(&self) -> Vec<Arc<LocalTableStorage>> {
        self.tables
            .lock()
            .expect("local storage lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn initialize_append(
        &self,
        state: &mut LocalAppendState,
        table: &Arc<DataTable>,
    ) -> Result<()> {
        self.get_or_create(table);
        state.table_id = Some(table.info().table_id());
        Ok(())
    }

    pub fn append(&self, state: &LocalAppendState, chunk: &RecordBatch, txn_id: TxnId) -> Result<()> {
        let table_id = state.table_id.ok_or_else(|| {
            Error::Internal("local append without initialized append state".into())
        })?;
        let storage = self
            .tables
            .lock()
            .expect("local storage lock poisoned")
            .get(&table_id)
            .cloned()
            .ok_or_else(|| Error::Internal("local append against missing storage".into()))?;
        storage.append(chunk, txn_id)
    }

    pub fn finalize_append(&self, state: &mut LocalAppendState) {
        state.table_id = None;
    }

    pub fn create_optimistic_writer(&self, table: &Arc<DataTable>) -> OptimisticDataWriter {
        self.get_or_create(table);
        OptimisticDataWriter::new(table.physical_types())
    }

    /// Merge an optimistically written collection into the local state,
    /// maintaining the local indexes.
    pub fn local_merge(
        &self,
        table: &Arc<DataTable>,
        collection: RowGroupCollection,
        manager: &TransactionManager,
    ) -> Result<()> {
        let storage = self.get_or_create(table);
        let target = storage.collection();
        let merge_start = MAX_ROW_ID + target.get_total_rows();
        target.merge_storage(&collection)?;
        target.verify();

        // Index the merged range.
        let schema = table.physical_schema();
        let column_ids: Vec<usize> = (0..schema.fields().len()).collect();
        let mut state = CollectionScanState::default();
        target.initialize_scan_with_offset(&mut state, merge_start, MAX_ROW_ID + target.get_total_rows());
        let mut current_row = merge_start;
        while let Some(batch) = target.scan(
            manager,
            None,
            &mut state,
            &column_ids,
            None,
            &schema,
            TableScanType::Committed,
        )? {
            if let Err(err) = append_to_index_set(&storage.indexes, &batch, current_row) {
                return Err(err);
            }
            current_row += batch.num_rows() as u64;
        }
        Ok(())
    }

    pub fn initialize_scan(&self, table: &DataTable, state: &mut CollectionScanState) {
        if let Some(storage) = self.get(table) {
            storage.collection().initialize_scan(state);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &self,
        table: &DataTable,
        manager: &TransactionManager,
        snapshot: &TransactionSnapshot,
        state: &mut CollectionScanState,
        column_ids: &[usize],
        filters: Option<&TableFilterSet>,
        schema: &arrow::datatypes::SchemaRef,
    ) -> Result<Option<RecordBatch>> {
        let Some(storage) = self.get(table) else {
            return Ok(None);
        };
        storage.collection().scan(
            manager,
            Some(snapshot),
            state,
            column_ids,
            filters,
            schema,
            TableScanType::Regular,
        )
    }

    pub fn initialize_parallel_scan(
        &self,
        table: &DataTable,
        state: &mut ParallelCollectionScanState,
        verify_parallelism: bool,
    ) {
        if let Some(storage) = self.get(table) {
            storage
                .collection()
                .initialize_parallel_scan(state, verify_parallelism);
        }
    }

    pub fn next_parallel_scan(
        &self,
        table: &DataTable,
        state: &ParallelCollectionScanState,
        out: &mut CollectionScanState,
    ) -> bool {
        match self.get(table) {
            Some(storage) => storage.collection().next_parallel_scan(state, out),
            None => false,
        }
    }

    /// Delete local rows: removes their index entries, then tombstones them.
    /// Returns the count actually deleted.
    pub fn delete(
        &self,
        table: &DataTable,
        manager: &TransactionManager,
        snapshot: &TransactionSnapshot,
        row_ids: &[RowId],
    ) -> Result<u64> {
        let Some(storage) = self.get(table) else {
            return Ok(0);
        };
        let collection = storage.collection();

        if !storage.indexes.is_empty() {
            // Fetch the victim rows (with identifiers) to strip index entries.
            let schema = table.physical_schema();
            let mut column_ids: Vec<usize> = (0..schema.fields().len()).collect();
            column_ids.push(COLUMN_IDENTIFIER_ROW_ID);
            let schema_with_ids = table.projection_schema(&column_ids)?;
            let chunk = collection.fetch(manager, snapshot, &column_ids, row_ids, &schema_with_ids)?;
            let id_column = chunk
                .column(chunk.num_columns() - 1)
                .as_any()
                .downcast_ref::<arrow::array::UInt64Array>()
                .ok_or_else(|| Error::Internal("row identifier column has wrong type".into()))?;
            let fetched_ids: Vec<RowId> = id_column.values().to_vec();
            let value_chunk = chunk.project(&(0..chunk.num_columns() - 1).collect::<Vec<_>>())?;
            remove_from_index_set(&storage.indexes, &value_chunk, &fetched_ids)?;
        }

        collection.delete(manager, snapshot.txn_id, row_ids)
    }

    pub fn update(
        &self,
        table: &DataTable,
        row_ids: &[RowId],
        column_ids: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        let storage = self.get(table).ok_or_else(|| {
            Error::Internal("update against a table without local storage".into())
        })?;
        storage.collection().update(row_ids, column_ids, updates)
    }

    /// Fetch local rows as a full-width chunk, for delete-side constraint
    /// verification.
    pub fn fetch_chunk(
        &self,
        table: &DataTable,
        manager: &TransactionManager,
        snapshot: &TransactionSnapshot,
        row_ids: &[RowId],
    ) -> Result<RecordBatch> {
        let schema = table.physical_schema();
        let column_ids: Vec<usize> = (0..schema.fields().len()).collect();
        match self.get(table) {
            Some(storage) => storage
                .collection()
                .fetch(manager, snapshot, &column_ids, row_ids, &schema),
            None => Err(Error::Internal(
                "fetch of local rows without local storage".into(),
            )),
        }
    }

    /// Mirror an add-column schema change onto outstanding local data.
    pub fn add_column(
        &self,
        old_table: &DataTable,
        new_table: &Arc<DataTable>,
        new_column: &ColumnDefinition,
        default: Option<&BoundExpression>,
    ) -> Result<()> {
        if let Some(storage) = self.get(old_table) {
            let extended = storage.collection().add_column(new_column, default)?;
            storage.set_collection(Arc::new(extended));
            storage.set_table(new_table.clone());
        }
        Ok(())
    }

    /// Mirror a drop-column schema change onto outstanding local data.
    pub fn drop_column(
        &self,
        old_table: &DataTable,
        new_table: &Arc<DataTable>,
        storage_idx: Option<usize>,
    ) -> Result<()> {
        if let Some(storage) = self.get(old_table) {
            if let Some(idx) = storage_idx {
                let projected = storage.collection().remove_column(idx)?;
                storage.set_collection(Arc::new(projected));
            }
            storage.set_table(new_table.clone());
        }
        Ok(())
    }

    /// Mirror a change-type schema change onto outstanding local data.
    pub fn change_type(
        &self,
        old_table: &DataTable,
        new_table: &Arc<DataTable>,
        storage_idx: usize,
        target_type: &arrow::datatypes::DataType,
        bound_columns: &[usize],
        cast_expr: &BoundExpression,
    ) -> Result<()> {
        if let Some(storage) = self.get(old_table) {
            let altered =
                storage
                    .collection()
                    .alter_type(storage_idx, target_type, bound_columns, cast_expr)?;
            storage.set_collection(Arc::new(altered));
            storage.set_table(new_table.clone());
        }
        Ok(())
    }

    /// Hand ownership of the local data to a schema-change successor that
    /// did not change the layout.
    pub fn move_storage(&self, old_table: &DataTable, new_table: &Arc<DataTable>) {
        if let Some(storage) = self.get(old_table) {
            storage.set_table(new_table.clone());
        }
    }

    /// Check outstanding local rows against a new NOT NULL constraint.
    pub fn verify_new_constraint(
        &self,
        table: &DataTable,
        manager: &TransactionManager,
        table_name: &str,
        column_name: &str,
        storage_idx: usize,
    ) -> Result<()> {
        if let Some(storage) = self.get(table) {
            storage.collection().verify_new_constraint(
                manager,
                table_name,
                column_name,
                storage_idx,
            )?;
        }
        Ok(())
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}
