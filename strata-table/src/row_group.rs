//! Row-group columnar storage for committed and transaction-local rows.
//!
//! A collection is an ordered list of fixed-capacity row groups. Every row
//! carries `created_by` / `deleted_by` stamps; appends land with the writing
//! transaction's id and are rewritten to the commit id by `commit_append`,
//! while deletes keep the deleter's id and resolve through the transaction
//! manager. Column data is stored as piece lists of immutable Arrow arrays.

use std::sync::{Arc, RwLock};

use arrow::array::{
    Array, ArrayRef, BooleanArray, RecordBatchOptions, UInt64Array, new_empty_array,
    new_null_array,
};
use arrow::compute::{cast, concat, filter, interleave};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use strata_expr::BoundExpression;
use strata_result::{Error, Result};
use strata_storage::TableDataWriter;
use strata_storage::ipc;
use strata_transaction::{
    NOT_DELETED_ID, TransactionManager, TransactionSnapshot, TxnId, mvcc::is_transaction_id,
};

use crate::column::ColumnDefinition;
use crate::scan::{
    CollectionScanState, ParallelCollectionScanState, TableFilterSet, TableScanType, merge_mask,
};
use crate::stats::ColumnStatistics;
use crate::types::{COLUMN_IDENTIFIER_ROW_ID, ROW_GROUP_SIZE, RowId, VECTOR_SIZE};

/// Description of one row group for `get_storage_info`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowGroupStorageInfo {
    pub row_group_index: usize,
    pub row_start: RowId,
    pub count: u64,
}

/// Growable column storage inside one row group: an append-ordered list of
/// immutable array pieces.
#[derive(Clone, Debug)]
struct ColumnSegment {
    data_type: DataType,
    pieces: Vec<ArrayRef>,
    len: usize,
}

impl ColumnSegment {
    fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            pieces: Vec::new(),
            len: 0,
        }
    }

    fn append(&mut self, array: ArrayRef) {
        self.len += array.len();
        self.pieces.push(array);
    }

    fn truncate(&mut self, new_len: usize) {
        while self.len > new_len {
            let piece = self.pieces.last_mut().expect("piece list out of sync");
            let piece_len = piece.len();
            if self.len - piece_len >= new_len {
                self.pieces.pop();
                self.len -= piece_len;
            } else {
                let keep = new_len - (self.len - piece_len);
                *piece = piece.slice(0, keep);
                self.len = new_len;
            }
        }
    }

    /// Materialize `[offset, offset + len)` as one array.
    fn read(&self, offset: usize, len: usize) -> Result<ArrayRef> {
        if len == 0 {
            return Ok(new_empty_array(&self.data_type));
        }
        debug_assert!(offset + len <= self.len);

        let mut parts: Vec<ArrayRef> = Vec::new();
        let mut base = 0usize;
        for piece in &self.pieces {
            let piece_end = base + piece.len();
            if piece_end > offset && base < offset + len {
                let slice_start = offset.max(base) - base;
                let slice_end = (offset + len).min(piece_end) - base;
                parts.push(piece.slice(slice_start, slice_end - slice_start));
            }
            base = piece_end;
            if base >= offset + len {
                break;
            }
        }

        if parts.len() == 1 {
            return Ok(parts.pop().expect("non-empty"));
        }
        let refs: Vec<&dyn Array> = parts.iter().map(|p| p.as_ref()).collect();
        Ok(concat(&refs)?)
    }

    /// Replace the values at `rows` with rows of `updates`, in place.
    /// `rows` pairs a segment row offset with an index into `updates`.
    fn rewrite(&mut self, rows: &[(usize, usize)], updates: &ArrayRef) -> Result<()> {
        if updates.data_type() != &self.data_type {
            return Err(Error::Internal(format!(
                "unexpected column shape: update of type {:?} against column of type {:?}",
                updates.data_type(),
                self.data_type
            )));
        }
        let base = self.read(0, self.len)?;
        let mut indices: Vec<(usize, usize)> = (0..self.len).map(|i| (0, i)).collect();
        for &(row, update_idx) in rows {
            indices[row] = (1, update_idx);
        }
        let merged = interleave(&[base.as_ref(), updates.as_ref()], &indices)?;
        self.pieces = vec![merged];
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct RowGroup {
    /// Absolute identifier of the first row in this group.
    start: RowId,
    count: usize,
    columns: Vec<ColumnSegment>,
    created_by: Vec<TxnId>,
    deleted_by: Vec<TxnId>,
}

impl RowGroup {
    fn new(start: RowId, types: &[DataType]) -> Self {
        Self {
            start,
            count: 0,
            columns: types.iter().cloned().map(ColumnSegment::new).collect(),
            created_by: Vec::new(),
            deleted_by: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct CollectionData {
    row_groups: Vec<RowGroup>,
    total_rows: usize,
    stats: Vec<ColumnStatistics>,
}

/// Stamp source for a batch of pushed rows.
enum Stamp<'a> {
    Uniform(TxnId),
    Values(&'a [TxnId]),
}

impl Stamp<'_> {
    fn get(&self, i: usize) -> TxnId {
        match self {
            Stamp::Uniform(id) => *id,
            Stamp::Values(values) => values[i],
        }
    }
}

/// Columnar storage for one table version (or one transaction's local rows).
#[derive(Debug)]
pub struct RowGroupCollection {
    row_start: RowId,
    types: Vec<DataType>,
    inner: RwLock<CollectionData>,
}

impl RowGroupCollection {
    /// Create an empty collection whose rows begin at `row_start`.
    pub fn new(types: Vec<DataType>, row_start: RowId) -> Self {
        let stats = types.iter().map(|_| ColumnStatistics::new()).collect();
        Self {
            row_start,
            types,
            inner: RwLock::new(CollectionData {
                row_groups: Vec::new(),
                total_rows: 0,
                stats,
            }),
        }
    }

    /// Restore a collection from checkpointed data. Restored rows are
    /// commit-id-0 stamped (visible to every snapshot).
    pub fn restore(
        types: Vec<DataType>,
        row_start: RowId,
        data: &strata_storage::PersistentTableData,
    ) -> Result<Self> {
        let collection = Self::new(types, row_start);
        for payload in &data.row_group_payloads {
            for batch in ipc::decode_batches(payload)? {
                let columns: Vec<ArrayRef> = batch.columns().to_vec();
                collection.push_rows(&columns, Stamp::Uniform(0), Stamp::Uniform(NOT_DELETED_ID))?;
            }
        }
        Ok(collection)
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn row_start(&self) -> RowId {
        self.row_start
    }

    pub fn get_total_rows(&self) -> u64 {
        self.inner.read().expect("collection lock poisoned").total_rows as u64
    }

    /// Count rows visible to `snapshot`.
    pub fn count_visible(
        &self,
        manager: &TransactionManager,
        snapshot: &TransactionSnapshot,
    ) -> u64 {
        let data = self.inner.read().expect("collection lock poisoned");
        let mut count = 0u64;
        for rg in &data.row_groups {
            for i in 0..rg.count {
                if snapshot.row_is_visible(manager, rg.created_by[i], rg.deleted_by[i]) {
                    count += 1;
                }
            }
        }
        count
    }

    fn check_chunk_shape(&self, columns: &[ArrayRef]) -> Result<()> {
        if columns.len() != self.types.len() {
            return Err(Error::Internal(format!(
                "unexpected column shape: chunk has {} columns, collection stores {}",
                columns.len(),
                self.types.len()
            )));
        }
        for (column, expected) in columns.iter().zip(&self.types) {
            if column.data_type() != expected {
                return Err(Error::Internal(format!(
                    "unexpected column shape: chunk column of type {:?} where {:?} is stored",
                    column.data_type(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Push rows across row-group boundaries; returns the absolute row id
    /// the batch starts at.
    fn push_rows(
        &self,
        columns: &[ArrayRef],
        created: Stamp<'_>,
        deleted: Stamp<'_>,
    ) -> Result<RowId> {
        self.check_chunk_shape(columns)?;
        let row_count = columns.first().map(|c| c.len()).unwrap_or(0);

        let mut data = self.inner.write().expect("collection lock poisoned");
        let start = self.row_start + data.total_rows as u64;

        for (i, column) in columns.iter().enumerate() {
            data.stats[i].merge_array(column)?;
        }

        let mut written = 0usize;
        while written < row_count {
            let needs_new_group = match data.row_groups.last() {
                None => true,
                Some(rg) => rg.count == ROW_GROUP_SIZE,
            };
            if needs_new_group {
                let rg_start = self.row_start + data.total_rows as u64;
                let rg = RowGroup::new(rg_start, &self.types);
                data.row_groups.push(rg);
            }

            let rg = data.row_groups.last_mut().expect("just ensured");
            let space = ROW_GROUP_SIZE - rg.count;
            let n = space.min(row_count - written);
            for (c, column) in columns.iter().enumerate() {
                rg.columns[c].append(column.slice(written, n));
            }
            for i in 0..n {
                rg.created_by.push(created.get(written + i));
                rg.deleted_by.push(deleted.get(written + i));
            }
            rg.count += n;
            data.total_rows += n;
            written += n;
        }

        Ok(start)
    }

    /// Append a chunk stamped with the writing transaction's id; returns the
    /// absolute row id of the chunk's first row.
    pub fn append(&self, chunk: &RecordBatch, txn_id: TxnId) -> Result<RowId> {
        let columns: Vec<ArrayRef> = chunk.columns().to_vec();
        self.push_rows(&columns, Stamp::Uniform(txn_id), Stamp::Uniform(NOT_DELETED_ID))
    }

    /// Stamp commit identifiers onto the rows in `[row_start, row_start + count)`.
    pub fn commit_append(&self, commit_id: TxnId, row_start: RowId, count: u64) {
        let mut data = self.inner.write().expect("collection lock poisoned");
        let end = row_start + count;
        for rg in data.row_groups.iter_mut() {
            let rg_end = rg.start + rg.count as u64;
            if rg_end <= row_start || rg.start >= end {
                continue;
            }
            let from = row_start.max(rg.start) - rg.start;
            let to = end.min(rg_end) - rg.start;
            for i in from..to {
                rg.created_by[i as usize] = commit_id;
            }
        }
    }

    /// Truncate the collection back to `start_row`, dropping `count`
    /// appended rows. Statistics are approximate and are not rolled back.
    pub fn revert_append_internal(&self, start_row: RowId, count: u64) {
        let mut data = self.inner.write().expect("collection lock poisoned");
        debug_assert_eq!(
            start_row + count,
            self.row_start + data.total_rows as u64,
            "revert must cover the tail of the collection"
        );
        let keep_total = (start_row - self.row_start) as usize;

        while let Some(rg) = data.row_groups.last_mut() {
            let rg_offset = (rg.start - self.row_start) as usize;
            if rg_offset >= keep_total {
                data.row_groups.pop();
                continue;
            }
            let keep_in_group = keep_total - rg_offset;
            if keep_in_group >= rg.count {
                break;
            }
            for segment in rg.columns.iter_mut() {
                segment.truncate(keep_in_group);
            }
            rg.created_by.truncate(keep_in_group);
            rg.deleted_by.truncate(keep_in_group);
            rg.count = keep_in_group;
            break;
        }
        data.total_rows = keep_total;
    }

    /// Stamp `deleted_by` for the given rows. Returns the count of rows
    /// actually deleted; rows already deleted are skipped.
    pub fn delete(
        &self,
        manager: &TransactionManager,
        txn_id: TxnId,
        row_ids: &[RowId],
    ) -> Result<u64> {
        let mut data = self.inner.write().expect("collection lock poisoned");
        let mut deleted = 0u64;
        for &row_id in row_ids {
            let offset = self.offset_of(&data, row_id)?;
            let (rg_idx, local) = (offset / ROW_GROUP_SIZE, offset % ROW_GROUP_SIZE);
            let rg = &mut data.row_groups[rg_idx];
            let current = rg.deleted_by[local];
            if current != NOT_DELETED_ID {
                if current == txn_id {
                    continue;
                }
                if is_transaction_id(current) {
                    match manager.commit_id_of(current) {
                        // A committed delete: the row is already gone.
                        Some(_) => continue,
                        None => {
                            if manager.is_aborted(current) {
                                // Stamp left behind by an aborted deleter.
                                rg.deleted_by[local] = txn_id;
                                deleted += 1;
                                continue;
                            }
                            return Err(Error::TransactionConflict(
                                "conflict on tuple deletion: another active transaction deleted this row"
                                    .to_string(),
                            ));
                        }
                    }
                }
                // Commit-id stamped delete.
                continue;
            }
            rg.deleted_by[local] = txn_id;
            deleted += 1;
        }
        Ok(deleted)
    }

    fn offset_of(&self, data: &CollectionData, row_id: RowId) -> Result<usize> {
        if row_id < self.row_start {
            return Err(Error::Internal(format!(
                "row identifier {} below collection start {}",
                row_id, self.row_start
            )));
        }
        let offset = (row_id - self.row_start) as usize;
        if offset >= data.total_rows {
            return Err(Error::Internal(format!(
                "row identifier {} out of range ({} rows)",
                row_id, data.total_rows
            )));
        }
        Ok(offset)
    }

    /// Rewrite `column_ids` of the given rows with the columns of `updates`.
    pub fn update(
        &self,
        row_ids: &[RowId],
        column_ids: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        if updates.num_columns() != column_ids.len() {
            return Err(Error::Internal(format!(
                "unexpected column shape: {} update columns for {} column ids",
                updates.num_columns(),
                column_ids.len()
            )));
        }
        debug_assert_eq!(row_ids.len(), updates.num_rows());

        let mut data = self.inner.write().expect("collection lock poisoned");

        // Group target rows per row group; ids usually cluster.
        let mut per_group: Vec<(usize, Vec<(usize, usize)>)> = Vec::new();
        for (update_idx, &row_id) in row_ids.iter().enumerate() {
            let offset = self.offset_of(&data, row_id)?;
            let (rg_idx, local) = (offset / ROW_GROUP_SIZE, offset % ROW_GROUP_SIZE);
            match per_group.iter_mut().find(|(idx, _)| *idx == rg_idx) {
                Some((_, rows)) => rows.push((local, update_idx)),
                None => per_group.push((rg_idx, vec![(local, update_idx)])),
            }
        }

        for (rg_idx, rows) in per_group {
            for (i, &column_id) in column_ids.iter().enumerate() {
                let column = updates.column(i);
                let rg = &mut data.row_groups[rg_idx];
                let segment = rg.columns.get_mut(column_id).ok_or_else(|| {
                    Error::Internal(format!("update column {} out of range", column_id))
                })?;
                segment.rewrite(&rows, column)?;
            }
        }

        for (i, &column_id) in column_ids.iter().enumerate() {
            let column = updates.column(i).clone();
            data.stats[column_id].merge_array(&column)?;
        }
        Ok(())
    }

    /// Rewrite the single column addressed by `column_path` (its first
    /// element) for the given rows. `updates` carries exactly one column.
    pub fn update_column(
        &self,
        row_ids: &[RowId],
        column_path: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        let Some(&column_id) = column_path.first() else {
            return Err(Error::Internal("empty column path in update".to_string()));
        };
        if updates.num_columns() != 1 {
            return Err(Error::Internal(format!(
                "unexpected column shape: column update carries {} columns",
                updates.num_columns()
            )));
        }
        self.update(row_ids, &[column_id], updates)
    }

    /// Fetch the given rows (visible to `snapshot` only) as one chunk.
    pub fn fetch(
        &self,
        manager: &TransactionManager,
        snapshot: &TransactionSnapshot,
        column_ids: &[usize],
        row_ids: &[RowId],
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        let data = self.inner.read().expect("collection lock poisoned");

        let mut kept: Vec<(usize, usize, RowId)> = Vec::with_capacity(row_ids.len());
        for &row_id in row_ids {
            let offset = self.offset_of(&data, row_id)?;
            let (rg_idx, local) = (offset / ROW_GROUP_SIZE, offset % ROW_GROUP_SIZE);
            let rg = &data.row_groups[rg_idx];
            if snapshot.row_is_visible(manager, rg.created_by[local], rg.deleted_by[local]) {
                kept.push((rg_idx, local, row_id));
            }
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(column_ids.len());
        for &column_id in column_ids {
            if column_id == COLUMN_IDENTIFIER_ROW_ID {
                let ids: Vec<u64> = kept.iter().map(|&(_, _, id)| id).collect();
                columns.push(Arc::new(UInt64Array::from(ids)));
                continue;
            }
            let mut rows: Vec<ArrayRef> = Vec::with_capacity(kept.len());
            for &(rg_idx, local, _) in &kept {
                rows.push(data.row_groups[rg_idx].columns[column_id].read(local, 1)?);
            }
            let array = if rows.is_empty() {
                new_empty_array(&self.types[column_id])
            } else {
                let refs: Vec<&dyn Array> = rows.iter().map(|r| r.as_ref()).collect();
                concat(&refs)?
            };
            columns.push(array);
        }

        Ok(RecordBatch::try_new_with_options(
            schema.clone(),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(kept.len())),
        )?)
    }

    /// Bind a scan over the whole collection as it currently stands.
    pub fn initialize_scan(&self, state: &mut CollectionScanState) {
        let total = self.get_total_rows();
        state.initialize_range(self.row_start, self.row_start, self.row_start + total);
    }

    /// Bind a scan over `[start_row, end_row)` (absolute row identifiers).
    /// Emission starts at the enclosing vector boundary; callers slice.
    pub fn initialize_scan_with_offset(
        &self,
        state: &mut CollectionScanState,
        start_row: RowId,
        end_row: RowId,
    ) {
        state.initialize_range(self.row_start, start_row, end_row);
    }

    pub fn initialize_parallel_scan(
        &self,
        state: &mut ParallelCollectionScanState,
        verify_parallelism: bool,
    ) {
        state.total_rows = self.get_total_rows();
        state.tuples_per_task = if verify_parallelism {
            VECTOR_SIZE as u64
        } else {
            ROW_GROUP_SIZE as u64
        };
    }

    /// Claim the next parallel partition into `out`; false when exhausted.
    pub fn next_parallel_scan(
        &self,
        state: &ParallelCollectionScanState,
        out: &mut CollectionScanState,
    ) -> bool {
        match state.claim() {
            Some((start, end, batch_index)) => {
                out.initialize_range(self.row_start, self.row_start + start, self.row_start + end);
                out.batch_index = batch_index;
                true
            }
            None => false,
        }
    }

    /// Produce the next vector of rows, or `None` when the scan is done.
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &self,
        manager: &TransactionManager,
        snapshot: Option<&TransactionSnapshot>,
        state: &mut CollectionScanState,
        column_ids: &[usize],
        filters: Option<&TableFilterSet>,
        schema: &SchemaRef,
        scan_type: TableScanType,
    ) -> Result<Option<RecordBatch>> {
        if !state.initialized {
            return Ok(None);
        }
        let data = self.inner.read().expect("collection lock poisoned");

        loop {
            let Some(rg) = data.row_groups.get(state.row_group_index) else {
                return Ok(None);
            };
            let offset = state.vector_index * VECTOR_SIZE;
            if offset >= rg.count {
                state.row_group_index += 1;
                state.vector_index = 0;
                continue;
            }
            let vec_start = rg.start + offset as u64;
            if vec_start >= state.max_row {
                return Ok(None);
            }
            let len = (rg.count - offset)
                .min(VECTOR_SIZE)
                .min((state.max_row - vec_start) as usize);
            state.vector_index += 1;

            let mut keep = vec![false; len];
            let mut any_visible = false;
            for (i, slot) in keep.iter_mut().enumerate() {
                let row = offset + i;
                let visible = match scan_type {
                    TableScanType::Regular => {
                        let snap = snapshot.ok_or_else(|| {
                            Error::Internal("regular scan requires a transaction snapshot".into())
                        })?;
                        snap.row_is_visible(manager, rg.created_by[row], rg.deleted_by[row])
                    }
                    // Committed scans are position-stable: every physically
                    // present row is emitted, so segment consumers can slice
                    // by arithmetic on vector boundaries.
                    TableScanType::Committed => true,
                };
                *slot = visible;
                any_visible |= visible;
            }
            if !any_visible {
                continue;
            }

            let mut projected: Vec<ArrayRef> = Vec::with_capacity(column_ids.len());
            for &column_id in column_ids {
                if column_id == COLUMN_IDENTIFIER_ROW_ID {
                    let ids: Vec<u64> = (0..len).map(|i| vec_start + i as u64).collect();
                    projected.push(Arc::new(UInt64Array::from(ids)));
                } else {
                    let segment = rg.columns.get(column_id).ok_or_else(|| {
                        Error::Internal(format!("scan column {} out of range", column_id))
                    })?;
                    projected.push(segment.read(offset, len)?);
                }
            }

            if let Some(filters) = filters {
                for (&projection_index, table_filter) in &filters.filters {
                    let column = projected.get(projection_index).ok_or_else(|| {
                        Error::Internal(format!(
                            "filter column {} out of projection range",
                            projection_index
                        ))
                    })?;
                    let mask = table_filter.evaluate(column)?;
                    merge_mask(&mut keep, &mask);
                }
            }

            if keep.iter().all(|k| !*k) {
                continue;
            }
            let columns = if keep.iter().all(|k| *k) {
                projected
            } else {
                let mask = BooleanArray::from(keep);
                let mut filtered = Vec::with_capacity(projected.len());
                for column in &projected {
                    filtered.push(filter(column.as_ref(), &mask)?);
                }
                filtered
            };

            let row_count = columns.first().map(|c| c.len());
            let batch = RecordBatch::try_new_with_options(
                schema.clone(),
                columns,
                &RecordBatchOptions::new().with_row_count(row_count),
            )?;
            return Ok(Some(batch));
        }
    }

    /// Build a new collection with `new_column` appended, filled from the
    /// default expression (or null).
    pub fn add_column(
        &self,
        new_column: &ColumnDefinition,
        default: Option<&BoundExpression>,
    ) -> Result<RowGroupCollection> {
        let data = self.inner.read().expect("collection lock poisoned");
        let mut types = self.types.clone();
        types.push(new_column.logical_type().clone());

        let mut new_stats_column = ColumnStatistics::new();
        let mut row_groups = Vec::with_capacity(data.row_groups.len());
        for rg in &data.row_groups {
            let values = match default {
                Some(expr) => {
                    let input = RecordBatch::try_new_with_options(
                        Arc::new(Schema::empty()),
                        vec![],
                        &RecordBatchOptions::new().with_row_count(Some(rg.count)),
                    )?;
                    let result = expr.execute(&input)?;
                    if result.data_type() == new_column.logical_type() {
                        result
                    } else {
                        cast(result.as_ref(), new_column.logical_type())?
                    }
                }
                None => new_null_array(new_column.logical_type(), rg.count),
            };
            new_stats_column.merge_array(&values)?;

            let mut rg = rg.clone();
            let mut segment = ColumnSegment::new(new_column.logical_type().clone());
            if rg.count > 0 {
                segment.append(values);
            }
            rg.columns.push(segment);
            row_groups.push(rg);
        }

        let mut stats = data.stats.clone();
        stats.push(new_stats_column);
        Ok(RowGroupCollection {
            row_start: self.row_start,
            types,
            inner: RwLock::new(CollectionData {
                row_groups,
                total_rows: data.total_rows,
                stats,
            }),
        })
    }

    /// Build a new collection with the column at `storage_idx` projected out.
    pub fn remove_column(&self, storage_idx: usize) -> Result<RowGroupCollection> {
        if storage_idx >= self.types.len() {
            return Err(Error::Internal(format!(
                "cannot remove column {}: collection stores {} columns",
                storage_idx,
                self.types.len()
            )));
        }
        let data = self.inner.read().expect("collection lock poisoned");
        let mut types = self.types.clone();
        types.remove(storage_idx);

        let mut row_groups = Vec::with_capacity(data.row_groups.len());
        for rg in &data.row_groups {
            let mut rg = rg.clone();
            rg.columns.remove(storage_idx);
            row_groups.push(rg);
        }
        let mut stats = data.stats.clone();
        stats.remove(storage_idx);

        Ok(RowGroupCollection {
            row_start: self.row_start,
            types,
            inner: RwLock::new(CollectionData {
                row_groups,
                total_rows: data.total_rows,
                stats,
            }),
        })
    }

    /// Build a new collection with the column at `storage_idx` recomputed as
    /// `target_type` through `cast_expr`, which reads `bound_columns` (in
    /// that order) from the existing data. Statistics for the column are
    /// recomputed during conversion.
    pub fn alter_type(
        &self,
        storage_idx: usize,
        target_type: &DataType,
        bound_columns: &[usize],
        cast_expr: &BoundExpression,
    ) -> Result<RowGroupCollection> {
        let data = self.inner.read().expect("collection lock poisoned");
        let mut types = self.types.clone();
        types[storage_idx] = target_type.clone();

        let input_fields: Vec<arrow::datatypes::Field> = bound_columns
            .iter()
            .map(|&b| arrow::datatypes::Field::new(format!("c{b}"), self.types[b].clone(), true))
            .collect();
        let input_schema = Arc::new(Schema::new(input_fields));

        let mut new_stats_column = ColumnStatistics::new();
        let mut row_groups = Vec::with_capacity(data.row_groups.len());
        for rg in &data.row_groups {
            let mut inputs: Vec<ArrayRef> = Vec::with_capacity(bound_columns.len());
            for &b in bound_columns {
                inputs.push(rg.columns[b].read(0, rg.count)?);
            }
            let input = RecordBatch::try_new_with_options(
                input_schema.clone(),
                inputs,
                &RecordBatchOptions::new().with_row_count(Some(rg.count)),
            )?;
            let result = cast_expr.execute(&input)?;
            let converted = if result.data_type() == target_type {
                result
            } else {
                cast(result.as_ref(), target_type)?
            };
            new_stats_column.merge_array(&converted)?;

            let mut rg = rg.clone();
            let mut segment = ColumnSegment::new(target_type.clone());
            if rg.count > 0 {
                segment.append(converted);
            }
            rg.columns[storage_idx] = segment;
            row_groups.push(rg);
        }

        let mut stats = data.stats.clone();
        stats[storage_idx] = new_stats_column;

        Ok(RowGroupCollection {
            row_start: self.row_start,
            types,
            inner: RwLock::new(CollectionData {
                row_groups,
                total_rows: data.total_rows,
                stats,
            }),
        })
    }

    /// Scan the stored column for nulls; any null in a present row fails.
    pub fn verify_new_constraint(
        &self,
        manager: &TransactionManager,
        table_name: &str,
        column_name: &str,
        storage_idx: usize,
    ) -> Result<()> {
        let data = self.inner.read().expect("collection lock poisoned");
        for rg in &data.row_groups {
            let values = rg.columns[storage_idx].read(0, rg.count)?;
            if values.null_count() == 0 {
                continue;
            }
            for row in 0..rg.count {
                if values.is_null(row) && committed_row_present(manager, rg.deleted_by[row]) {
                    return Err(Error::ConstraintViolation(format!(
                        "NOT NULL constraint failed: {}.{}",
                        table_name, column_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Move the rows of `other` into this collection, preserving their
    /// version stamps.
    pub fn merge_storage(&self, other: &RowGroupCollection) -> Result<()> {
        let batches: Vec<(Vec<ArrayRef>, Vec<TxnId>, Vec<TxnId>)> = {
            let other_data = other.inner.read().expect("collection lock poisoned");
            other_data
                .row_groups
                .iter()
                .map(|rg| {
                    let columns = rg
                        .columns
                        .iter()
                        .map(|segment| segment.read(0, rg.count))
                        .collect::<Result<Vec<_>>>()?;
                    Ok((columns, rg.created_by.clone(), rg.deleted_by.clone()))
                })
                .collect::<Result<Vec<_>>>()?
        };
        for (columns, created, deleted) in batches {
            self.push_rows(&columns, Stamp::Values(&created), Stamp::Values(&deleted))?;
        }
        Ok(())
    }

    /// Serialize each row group's committed rows through `writer`.
    /// Tombstoned rows are reclaimed here: they are not written out.
    pub fn checkpoint(
        &self,
        manager: &TransactionManager,
        schema: &SchemaRef,
        writer: &mut TableDataWriter<'_>,
    ) -> Result<()> {
        let data = self.inner.read().expect("collection lock poisoned");
        for rg in &data.row_groups {
            let mut keep = vec![false; rg.count];
            let mut kept = 0usize;
            for (i, slot) in keep.iter_mut().enumerate() {
                let created_committed = !is_transaction_id(rg.created_by[i])
                    || manager.commit_id_of(rg.created_by[i]).is_some();
                let present = created_committed && committed_row_present(manager, rg.deleted_by[i]);
                *slot = present;
                kept += usize::from(present);
            }
            if kept == 0 {
                continue;
            }

            let mask = BooleanArray::from(keep);
            let mut columns = Vec::with_capacity(rg.columns.len());
            for segment in &rg.columns {
                let full = segment.read(0, rg.count)?;
                columns.push(filter(full.as_ref(), &mask)?);
            }
            let batch = RecordBatch::try_new_with_options(
                schema.clone(),
                columns,
                &RecordBatchOptions::new().with_row_count(Some(kept)),
            )?;
            let payload = ipc::encode_batch(&batch)?;
            writer.write_row_group(rg.start, kept as u64, &payload)?;
        }
        Ok(())
    }

    pub fn copy_stats(&self, column_id: usize) -> Option<ColumnStatistics> {
        let data = self.inner.read().expect("collection lock poisoned");
        data.stats.get(column_id).cloned()
    }

    pub fn set_statistics(&self, column_id: usize, set_fn: impl FnOnce(&mut ColumnStatistics)) {
        let mut data = self.inner.write().expect("collection lock poisoned");
        if let Some(stats) = data.stats.get_mut(column_id) {
            set_fn(stats);
        }
    }

    /// Release the storage of a dropped column; the column keeps its shape
    /// so late readers of this version do not break.
    pub fn commit_drop_column(&self, storage_idx: usize) {
        let mut data = self.inner.write().expect("collection lock poisoned");
        for rg in data.row_groups.iter_mut() {
            if let Some(segment) = rg.columns.get_mut(storage_idx) {
                let len = segment.len;
                let data_type = segment.data_type.clone();
                segment.pieces = vec![new_null_array(&data_type, len)];
            }
        }
    }

    /// Release all storage on a committed table drop.
    pub fn commit_drop_table(&self) {
        let mut data = self.inner.write().expect("collection lock poisoned");
        data.row_groups.clear();
        data.total_rows = 0;
    }

    pub fn get_storage_info(&self) -> Vec<RowGroupStorageInfo> {
        let data = self.inner.read().expect("collection lock poisoned");
        data.row_groups
            .iter()
            .enumerate()
            .map(|(i, rg)| RowGroupStorageInfo {
                row_group_index: i,
                row_start: rg.start,
                count: rg.count as u64,
            })
            .collect()
    }

    /// Debug invariant walk.
    pub fn verify(&self) {
        #[cfg(debug_assertions)]
        {
            let data = self.inner.read().expect("collection lock poisoned");
            let mut total = 0usize;
            for rg in &data.row_groups {
                assert_eq!(rg.created_by.len(), rg.count);
                assert_eq!(rg.deleted_by.len(), rg.count);
                for segment in &rg.columns {
                    assert_eq!(segment.len, rg.count);
                }
                assert_eq!(rg.start, self.row_start + total as u64);
                total += rg.count;
            }
            assert_eq!(total, data.total_rows);
        }
    }
}

/// Presence rule for committed-rows scans: every physically present row,
/// minus rows whose delete has committed.
fn committed_row_present(manager: &TransactionManager, deleted_by: TxnId) -> bool {
    if deleted_by == NOT_DELETED_ID {
        return true;
    }
    if !is_transaction_id(deleted_by) {
        return false;
    }
    manager.commit_id_of(deleted_by).is_none()
}
