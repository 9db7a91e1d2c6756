//! Common types and sizing constants for the table core.

#![forbid(unsafe_code)]

/// Table identifier, shared by every version of a table across schema
/// changes (it lives in the shared `TableInfo`).
pub type TableId = u64;

/// Row identifier type.
///
/// The identifier space is partitioned: `[0, MAX_ROW_ID)` addresses
/// persistent rows, `[MAX_ROW_ID, 2 * MAX_ROW_ID)` addresses
/// transaction-local rows. Routing inside delete and update depends on this
/// split.
pub type RowId = u64;

/// First transaction-local row identifier.
pub const MAX_ROW_ID: RowId = 1 << 62;

/// Rows per scan vector.
pub const VECTOR_SIZE: usize = 2048;

/// Vectors per row group.
pub const ROW_GROUP_VECTOR_COUNT: usize = 64;

/// Rows per row group; the unit of parallel scan and checkpoint.
pub const ROW_GROUP_SIZE: usize = VECTOR_SIZE * ROW_GROUP_VECTOR_COUNT;

/// Sentinel column identifier requesting the row-identifier column in a
/// scan projection.
pub const COLUMN_IDENTIFIER_ROW_ID: usize = usize::MAX;

/// True if `row_id` addresses transaction-local storage.
#[inline]
pub fn is_local_row_id(row_id: RowId) -> bool {
    row_id >= MAX_ROW_ID
}
