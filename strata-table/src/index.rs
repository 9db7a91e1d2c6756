//! In-memory secondary indexes and the per-table index set.
//!
//! Keys are composite scalar tuples extracted from the indexed columns of a
//! chunk; rows with a null in any key column are not indexed. Uniqueness is
//! enforced on append, and existence checks feed the conflict manager for
//! foreign-key verification.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array, LargeStringArray, StringArray, UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use rustc_hash::FxHashSet;

use strata_result::{Error, Result};

use crate::conflict::{ConflictManager, VerifyExistenceType};
use crate::constraints::ForeignKeyType;
use crate::types::RowId;

/// Index implementation tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    /// Adaptive-radix-tree index (the only kind currently).
    Art,
}

/// One component of a composite index key.
///
/// Floats are stored as raw bits: only equality matters for uniqueness, and
/// bits keep the ordering total for NaN.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKeyPart {
    Boolean(bool),
    Int(i64),
    UInt(u64),
    Float(u64),
    Str(String),
}

pub type IndexKey = Vec<IndexKeyPart>;

/// Extract the key component for `row` from one column.
#[allow(clippy::redundant_closure_call)]
fn key_part(array: &dyn Array, row: usize) -> Result<Option<IndexKeyPart>> {
    if array.is_null(row) {
        return Ok(None);
    }
    macro_rules! part {
        ($ty:ty, $variant:ident, $conv:expr) => {{
            let values = array
                .as_any()
                .downcast_ref::<$ty>()
                .ok_or_else(|| Error::Internal("index key column downcast failed".into()))?;
            Ok(Some(IndexKeyPart::$variant(($conv)(values.value(row)))))
        }};
    }
    match array.data_type() {
        DataType::Boolean => part!(BooleanArray, Boolean, |v| v),
        DataType::Int8 => part!(Int8Array, Int, |v| v as i64),
        DataType::Int16 => part!(Int16Array, Int, |v| v as i64),
        DataType::Int32 => part!(Int32Array, Int, |v| v as i64),
        DataType::Int64 => part!(Int64Array, Int, |v| v),
        DataType::UInt8 => part!(UInt8Array, UInt, |v| v as u64),
        DataType::UInt16 => part!(UInt16Array, UInt, |v| v as u64),
        DataType::UInt32 => part!(UInt32Array, UInt, |v| v as u64),
        DataType::UInt64 => part!(UInt64Array, UInt, |v| v),
        DataType::Float32 => part!(Float32Array, Float, |v: f32| (v as f64).to_bits()),
        DataType::Float64 => part!(Float64Array, Float, |v: f64| v.to_bits()),
        DataType::Utf8 => part!(StringArray, Str, |v: &str| v.to_string()),
        DataType::LargeUtf8 => part!(LargeStringArray, Str, |v: &str| v.to_string()),
        other => Err(Error::InvalidArgument(format!(
            "type {:?} is not supported as an index key",
            other
        ))),
    }
}

/// Build the composite key for `row`, or `None` when any component is null.
fn build_key(chunk: &RecordBatch, column_ids: &[usize], row: usize) -> Result<Option<IndexKey>> {
    let mut key = Vec::with_capacity(column_ids.len());
    for &column_id in column_ids {
        if column_id >= chunk.num_columns() {
            return Err(Error::Internal(format!(
                "index key column {} out of range for chunk with {} columns",
                column_id,
                chunk.num_columns()
            )));
        }
        match key_part(chunk.column(column_id).as_ref(), row)? {
            Some(part) => key.push(part),
            None => return Ok(None),
        }
    }
    Ok(Some(key))
}

/// A single secondary index over a set of table columns.
#[derive(Debug)]
pub struct Index {
    kind: IndexKind,
    is_unique: bool,
    is_foreign: bool,
    column_ids: Vec<usize>,
    entries: RwLock<BTreeMap<IndexKey, Vec<RowId>>>,
}

impl Index {
    pub fn new(kind: IndexKind, is_unique: bool, is_foreign: bool, column_ids: Vec<usize>) -> Self {
        Self {
            kind,
            is_unique,
            is_foreign,
            column_ids,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn is_unique(&self) -> bool {
        self.is_unique
    }

    pub fn is_foreign(&self) -> bool {
        self.is_foreign
    }

    /// Storage ordinals of the indexed columns, in key order.
    pub fn column_ids(&self) -> &[usize] {
        &self.column_ids
    }

    /// Whether any indexed column appears in `column_ids`.
    pub fn index_is_updated(&self, column_ids: &[usize]) -> bool {
        self.column_ids.iter().any(|id| column_ids.contains(id))
    }

    /// Insert entries for `chunk`; `row_ids[i]` is the identifier of row `i`.
    ///
    /// For unique indexes the whole call fails without inserting anything if
    /// any key already exists or repeats within the chunk.
    pub fn append(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()> {
        debug_assert_eq!(chunk.num_rows(), row_ids.len());
        let mut entries = self.entries.write().expect("index lock poisoned");

        if self.is_unique {
            let mut incoming: FxHashSet<&IndexKey> = FxHashSet::default();
            let mut keys = Vec::with_capacity(chunk.num_rows());
            for row in 0..chunk.num_rows() {
                keys.push(build_key(chunk, &self.column_ids, row)?);
            }
            for (row, key) in keys.iter().enumerate() {
                if let Some(key) = key
                    && (entries.contains_key(key) || !incoming.insert(key))
                {
                    let key_name = self.generate_error_key_name(chunk, row)?;
                    return Err(Error::ConstraintViolation(
                        self.generate_constraint_error_message(
                            VerifyExistenceType::Append,
                            &key_name,
                        ),
                    ));
                }
            }
            drop(incoming);
            for (row, key) in keys.into_iter().enumerate() {
                if let Some(key) = key {
                    entries.entry(key).or_default().push(row_ids[row]);
                }
            }
            return Ok(());
        }

        for row in 0..chunk.num_rows() {
            if let Some(key) = build_key(chunk, &self.column_ids, row)? {
                entries.entry(key).or_default().push(row_ids[row]);
            }
        }
        Ok(())
    }

    /// Remove the entries for `chunk`; `row_ids[i]` identifies row `i`.
    /// Missing entries are ignored.
    pub fn delete(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()> {
        debug_assert_eq!(chunk.num_rows(), row_ids.len());
        let mut entries = self.entries.write().expect("index lock poisoned");
        for row in 0..chunk.num_rows() {
            if let Some(key) = build_key(chunk, &self.column_ids, row)? {
                if let Some(ids) = entries.get_mut(&key) {
                    ids.retain(|id| *id != row_ids[row]);
                    if ids.is_empty() {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Uniqueness pre-check for an append of `chunk`.
    ///
    /// Without a conflict manager any duplicate fails immediately. With one,
    /// behavior follows the manager's mode: scan-and-record, or throw for
    /// rows not recorded earlier.
    pub fn verify_append(
        &self,
        chunk: &RecordBatch,
        mut conflict_manager: Option<&mut ConflictManager<'_>>,
    ) -> Result<()> {
        let entries = self.entries.read().expect("index lock poisoned");
        let mut seen_in_chunk: FxHashSet<IndexKey> = FxHashSet::default();

        for row in 0..chunk.num_rows() {
            let Some(key) = build_key(chunk, &self.column_ids, row)? else {
                continue;
            };
            let existing = entries.get(&key).and_then(|ids| ids.first().copied());
            let conflict = existing.is_some() || seen_in_chunk.contains(&key);
            if conflict {
                let should_throw = match conflict_manager.as_deref_mut() {
                    None => true,
                    Some(cm) => cm.add_conflict(row, existing),
                };
                if should_throw {
                    let key_name = self.generate_error_key_name(chunk, row)?;
                    return Err(Error::ConstraintViolation(
                        self.generate_constraint_error_message(
                            VerifyExistenceType::Append,
                            &key_name,
                        ),
                    ));
                }
            } else {
                seen_in_chunk.insert(key);
            }
        }
        Ok(())
    }

    /// Record which chunk rows have a matching key in this index. Used by
    /// foreign-key verification; never fails on a match.
    pub fn check_existence(
        &self,
        chunk: &RecordBatch,
        conflict_manager: &mut ConflictManager<'_>,
    ) -> Result<()> {
        let entries = self.entries.read().expect("index lock poisoned");
        for row in 0..chunk.num_rows() {
            let Some(key) = build_key(chunk, &self.column_ids, row)? else {
                continue;
            };
            if let Some(ids) = entries.get(&key) {
                conflict_manager.add_conflict(row, ids.first().copied());
            }
        }
        Ok(())
    }

    /// Render the key of `row` for a constraint error message.
    pub fn generate_error_key_name(&self, chunk: &RecordBatch, row: usize) -> Result<String> {
        let options = FormatOptions::default();
        let mut parts = Vec::with_capacity(self.column_ids.len());
        for &column_id in &self.column_ids {
            let formatter = ArrayFormatter::try_new(chunk.column(column_id).as_ref(), &options)?;
            parts.push(formatter.value(row).to_string());
        }
        Ok(parts.join(", "))
    }

    /// The error text for a failed existence check of `verify_type`.
    pub fn generate_constraint_error_message(
        &self,
        verify_type: VerifyExistenceType,
        key_name: &str,
    ) -> String {
        match verify_type {
            VerifyExistenceType::Append => format!(
                "Duplicate key \"{}\" violates primary key or unique constraint",
                key_name
            ),
            VerifyExistenceType::AppendFk => format!(
                "Violates foreign key constraint because key \"{}\" does not exist in the referenced table",
                key_name
            ),
            VerifyExistenceType::DeleteFk => format!(
                "Violates foreign key constraint because key \"{}\" is still referenced by a foreign key in a different table",
                key_name
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.entries
            .read()
            .expect("index lock poisoned")
            .values()
            .map(|ids| ids.len())
            .sum()
    }
}

/// Whether `index` serves the given foreign-key column set and direction.
///
/// The match is order-insensitive: the key column set must equal the
/// index's column set, and the index flag must fit the direction (unique
/// for the primary-key side, foreign for the referencing side).
pub fn is_foreign_key_index(fk_keys: &[usize], index: &Index, fk_type: ForeignKeyType) -> bool {
    let flag_matches = match fk_type {
        ForeignKeyType::PrimaryKeyTable => index.is_unique(),
        _ => index.is_foreign(),
    };
    if !flag_matches {
        return false;
    }
    if fk_keys.len() != index.column_ids().len() {
        return false;
    }
    fk_keys
        .iter()
        .all(|fk_key| index.column_ids().contains(fk_key))
}

/// The ordered set of indexes attached to one table.
#[derive(Default, Debug)]
pub struct IndexSet {
    indexes: RwLock<Vec<Arc<Index>>>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_index(&self, index: Arc<Index>) {
        self.indexes
            .write()
            .expect("index set lock poisoned")
            .push(index);
    }

    pub fn is_empty(&self) -> bool {
        self.indexes
            .read()
            .expect("index set lock poisoned")
            .is_empty()
    }

    /// Visit each index until the visitor returns true.
    pub fn scan<F>(&self, mut f: F)
    where
        F: FnMut(&Index) -> bool,
    {
        for index in self.snapshot() {
            if f(&index) {
                break;
            }
        }
    }

    /// Clone the current index list out of the lock so visitors can take
    /// other locks safely.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Index>> {
        self.indexes
            .read()
            .expect("index set lock poisoned")
            .clone()
    }

    /// Find the index backing a foreign-key constraint for the given key
    /// columns and direction.
    pub fn find_foreign_key_index(
        &self,
        fk_keys: &[usize],
        fk_type: ForeignKeyType,
    ) -> Option<Arc<Index>> {
        self.snapshot()
            .into_iter()
            .find(|index| is_foreign_key_index(fk_keys, index, fk_type))
    }

    /// Run the existence scan of a foreign-key check against the index
    /// serving `fk_keys`, recording matches into `conflict_manager`.
    pub fn verify_foreign_key(
        &self,
        fk_keys: &[usize],
        chunk: &RecordBatch,
        conflict_manager: &mut ConflictManager<'_>,
    ) -> Result<()> {
        let fk_type = match conflict_manager.verify_type() {
            VerifyExistenceType::AppendFk => ForeignKeyType::PrimaryKeyTable,
            VerifyExistenceType::DeleteFk => ForeignKeyType::ForeignKeyTable,
            VerifyExistenceType::Append => {
                return Err(Error::Internal(
                    "foreign key verification requires a foreign-key conflict manager".into(),
                ));
            }
        };
        let index = self.find_foreign_key_index(fk_keys, fk_type).ok_or_else(|| {
            Error::Internal("could not find index to verify foreign key constraint".into())
        })?;
        index.check_existence(chunk, conflict_manager)
    }
}

/// Append `chunk` to every index in the set, rows identified as
/// `row_start + i`. On any failure the entries already inserted into
/// earlier indexes are removed again and the error is returned.
pub fn append_to_index_set(
    indexes: &IndexSet,
    chunk: &RecordBatch,
    row_start: RowId,
) -> Result<()> {
    if indexes.is_empty() {
        return Ok(());
    }
    let row_ids: Vec<RowId> = (0..chunk.num_rows() as u64).map(|i| row_start + i).collect();

    let snapshot = indexes.snapshot();
    let mut already_appended: Vec<&Arc<Index>> = Vec::new();
    let mut failure = None;
    for index in &snapshot {
        match index.append(chunk, &row_ids) {
            Ok(()) => already_appended.push(index),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    if let Some(err) = failure {
        // Constraint violation: remove any appended entries from previous
        // indexes before surfacing it.
        for index in already_appended {
            index.delete(chunk, &row_ids)?;
        }
        return Err(err);
    }
    Ok(())
}

/// Remove `chunk`'s entries (identified by `row_ids`) from every index.
pub fn remove_from_index_set(
    indexes: &IndexSet,
    chunk: &RecordBatch,
    row_ids: &[RowId],
) -> Result<()> {
    let mut first_err = None;
    indexes.scan(|index| {
        if let Err(err) = index.delete(chunk, row_ids) {
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
