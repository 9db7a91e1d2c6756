//! Scan state machinery and pushed-down table filters.

use std::sync::atomic::{AtomicU64, Ordering};

use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::kernels::cmp;
use arrow::compute::{is_not_null, is_null};
use arrow::datatypes::SchemaRef;
use rustc_hash::FxHashMap;

use strata_expr::{CompareOperator, ScalarLiteral};
use strata_result::Result;

use crate::types::{ROW_GROUP_SIZE, RowId, VECTOR_SIZE};

/// What a committed-rows scan should observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableScanType {
    /// Snapshot-isolated scan: the union of committed state at the snapshot
    /// boundary and the scanning transaction's own writes.
    Regular,
    /// Physical scan of all present rows whose deletion has not committed.
    /// Used for WAL emission, revert, and index builds.
    Committed,
}

/// Scan position inside one row-group collection.
#[derive(Clone, Debug, Default)]
pub struct CollectionScanState {
    pub(crate) row_group_index: usize,
    pub(crate) vector_index: usize,
    /// Absolute row id the scan starts at (vector-aligned positioning is
    /// derived from this).
    pub(crate) min_row: RowId,
    /// Exclusive absolute row id bound.
    pub(crate) max_row: RowId,
    pub(crate) initialized: bool,
    /// Task ordinal for parallel scans.
    pub batch_index: usize,
}

impl CollectionScanState {
    /// Position the state over `[start, end)` within a collection whose
    /// rows begin at `collection_row_start`.
    pub(crate) fn initialize_range(
        &mut self,
        collection_row_start: RowId,
        start: RowId,
        end: RowId,
    ) {
        let offset = (start - collection_row_start) as usize;
        self.row_group_index = offset / ROW_GROUP_SIZE;
        self.vector_index = (offset % ROW_GROUP_SIZE) / VECTOR_SIZE;
        self.min_row = start;
        self.max_row = end;
        self.initialized = true;
    }
}

/// Scan state over a table: persistent rows first, then the scanning
/// transaction's local rows.
#[derive(Clone, Debug, Default)]
pub struct TableScanState {
    pub table_state: CollectionScanState,
    pub local_state: CollectionScanState,
    pub(crate) column_ids: Vec<usize>,
    pub(crate) filters: Option<TableFilterSet>,
    pub(crate) projection_schema: Option<SchemaRef>,
}

impl TableScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn initialize(
        &mut self,
        column_ids: Vec<usize>,
        filters: Option<TableFilterSet>,
        projection_schema: SchemaRef,
    ) {
        self.table_state = CollectionScanState::default();
        self.local_state = CollectionScanState::default();
        self.column_ids = column_ids;
        self.filters = filters;
        self.projection_schema = Some(projection_schema);
    }

    pub fn column_ids(&self) -> &[usize] {
        &self.column_ids
    }
}

/// Shared cursor for parallel scan task hand-out over one collection.
#[derive(Debug)]
pub struct ParallelCollectionScanState {
    pub(crate) next_offset: AtomicU64,
    pub(crate) total_rows: u64,
    pub(crate) tuples_per_task: u64,
}

impl Default for ParallelCollectionScanState {
    fn default() -> Self {
        Self {
            next_offset: AtomicU64::new(0),
            total_rows: 0,
            tuples_per_task: ROW_GROUP_SIZE as u64,
        }
    }
}

impl ParallelCollectionScanState {
    /// Claim the next `[start, end)` offset range, or `None` when the
    /// collection is fully handed out.
    pub(crate) fn claim(&self) -> Option<(u64, u64, usize)> {
        loop {
            let start = self.next_offset.load(Ordering::SeqCst);
            if start >= self.total_rows {
                return None;
            }
            let end = (start + self.tuples_per_task).min(self.total_rows);
            if self
                .next_offset
                .compare_exchange(start, end, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let batch_index = (start / self.tuples_per_task) as usize;
                return Some((start, end, batch_index));
            }
        }
    }
}

/// Parallel scan state over a table: persistent partitions, then local.
#[derive(Debug, Default)]
pub struct ParallelTableScanState {
    pub scan_state: ParallelCollectionScanState,
    pub local_state: ParallelCollectionScanState,
}

/// Pushed-down filter against one scanned column.
#[derive(Clone, Debug)]
pub enum TableFilter {
    Comparison {
        op: CompareOperator,
        value: ScalarLiteral,
    },
    IsNull,
    IsNotNull,
}

impl TableFilter {
    /// Evaluate against a projected column, yielding a keep-mask. Null
    /// comparison results are resolved to "drop" by the caller.
    pub(crate) fn evaluate(&self, column: &ArrayRef) -> Result<BooleanArray> {
        match self {
            TableFilter::Comparison { op, value } => {
                let rhs = value.to_array(column.len());
                let rhs = if rhs.data_type() == column.data_type() {
                    rhs
                } else {
                    arrow::compute::cast(rhs.as_ref(), column.data_type())?
                };
                let mask = match op {
                    CompareOperator::Eq => cmp::eq(column, &rhs),
                    CompareOperator::NotEq => cmp::neq(column, &rhs),
                    CompareOperator::Lt => cmp::lt(column, &rhs),
                    CompareOperator::LtEq => cmp::lt_eq(column, &rhs),
                    CompareOperator::Gt => cmp::gt(column, &rhs),
                    CompareOperator::GtEq => cmp::gt_eq(column, &rhs),
                }?;
                Ok(mask)
            }
            TableFilter::IsNull => Ok(is_null(column.as_ref())?),
            TableFilter::IsNotNull => Ok(is_not_null(column.as_ref())?),
        }
    }
}

/// Filters keyed by position in the scan's projection list.
#[derive(Clone, Debug, Default)]
pub struct TableFilterSet {
    pub(crate) filters: FxHashMap<usize, TableFilter>,
}

impl TableFilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_filter(&mut self, projection_index: usize, filter: TableFilter) {
        self.filters.insert(projection_index, filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Combine an optional filter mask into the running keep-mask, mapping
/// filter nulls to false.
pub(crate) fn merge_mask(keep: &mut [bool], mask: &BooleanArray) {
    for (i, slot) in keep.iter_mut().enumerate() {
        *slot = *slot && mask.is_valid(i) && mask.value(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use std::sync::Arc;

    #[test]
    fn parallel_state_hands_out_disjoint_ranges() {
        let state = ParallelCollectionScanState {
            next_offset: AtomicU64::new(0),
            total_rows: 5000,
            tuples_per_task: 2048,
        };
        assert_eq!(state.claim(), Some((0, 2048, 0)));
        assert_eq!(state.claim(), Some((2048, 4096, 1)));
        assert_eq!(state.claim(), Some((4096, 5000, 2)));
        assert_eq!(state.claim(), None);
    }

    #[test]
    fn comparison_filter_drops_nulls() {
        let column: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        let filter = TableFilter::Comparison {
            op: CompareOperator::Gt,
            value: ScalarLiteral::Int64(0),
        };
        let mask = filter.evaluate(&column).expect("evaluate");
        let mut keep = vec![true; 3];
        merge_mask(&mut keep, &mask);
        assert_eq!(keep, vec![true, false, true]);
    }
}
