use arrow::datatypes::DataType;

use strata_expr::BoundExpression;
use strata_result::{Error, Result};

/// Definition of one table column.
///
/// Columns carry two ordinals: the declared (logical) ordinal, and the
/// storage ordinal addressing the column inside row groups. Generated
/// columns have no storage ordinal; storage ordinals are compacted across
/// the non-generated columns.
#[derive(Clone, Debug)]
pub struct ColumnDefinition {
    name: String,
    logical_type: DataType,
    ordinal: usize,
    storage_ordinal: Option<usize>,
    generated: Option<BoundExpression>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, logical_type: DataType, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            logical_type,
            // Compacted later when the full definition list is assembled.
            storage_ordinal: Some(ordinal),
            ordinal,
            generated: None,
        }
    }

    /// A generated column: computed from `expression`, never stored.
    pub fn new_generated(
        name: impl Into<String>,
        logical_type: DataType,
        ordinal: usize,
        expression: BoundExpression,
    ) -> Self {
        Self {
            name: name.into(),
            logical_type,
            ordinal,
            storage_ordinal: None,
            generated: Some(expression),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logical_type(&self) -> &DataType {
        &self.logical_type
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn storage_ordinal(&self) -> Option<usize> {
        self.storage_ordinal
    }

    pub fn is_generated(&self) -> bool {
        self.generated.is_some()
    }

    pub fn generation_expression(&self) -> Option<&BoundExpression> {
        self.generated.as_ref()
    }

    pub(crate) fn set_ordinal(&mut self, ordinal: usize) {
        self.ordinal = ordinal;
    }

    pub(crate) fn set_storage_ordinal(&mut self, storage_ordinal: usize) {
        self.storage_ordinal = Some(storage_ordinal);
    }

    pub(crate) fn set_type(&mut self, logical_type: DataType) {
        self.logical_type = logical_type;
    }
}

/// Recompact declared and storage ordinals after a definition-list edit.
/// Generated columns keep no storage ordinal.
pub(crate) fn compact_ordinals(columns: &mut [ColumnDefinition]) {
    let mut storage_idx = 0;
    for (i, col) in columns.iter_mut().enumerate() {
        col.set_ordinal(i);
        if col.is_generated() {
            continue;
        }
        col.set_storage_ordinal(storage_idx);
        storage_idx += 1;
    }
}

/// Resolve the name of the column stored at `storage_ordinal`.
pub(crate) fn name_of_storage_column(
    columns: &[ColumnDefinition],
    storage_ordinal: usize,
) -> Result<&str> {
    columns
        .iter()
        .find(|col| col.storage_ordinal() == Some(storage_ordinal))
        .map(|col| col.name())
        .ok_or_else(|| {
            Error::Internal(format!(
                "no column with storage ordinal {}",
                storage_ordinal
            ))
        })
}
