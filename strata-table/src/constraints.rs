//! Constraint definitions and the helpers shared by the table verifiers.

use strata_expr::BoundExpression;

use crate::conflict::ManagedSelection;

/// Role a foreign-key constraint plays on the table that carries it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForeignKeyType {
    /// This table references another table (child side).
    ForeignKeyTable,
    /// This table is referenced by another table (parent side).
    PrimaryKeyTable,
    /// The table references itself; both sides apply.
    SelfReferenceTable,
}

/// Bound foreign-key metadata.
///
/// `fk_keys` are storage ordinals of the referencing columns in the child
/// table's layout; `pk_keys` are storage ordinals of the referenced columns
/// in the parent table's layout. `schema`/`table` name the *other* table of
/// the relationship, resolved through the database handle at verification
/// time.
#[derive(Clone, Debug)]
pub struct ForeignKeyInfo {
    pub fk_type: ForeignKeyType,
    pub schema: String,
    pub table: String,
    pub fk_keys: Vec<usize>,
    pub pk_keys: Vec<usize>,
}

impl ForeignKeyInfo {
    /// Append paths verify the child side and self references.
    pub fn verified_on_append(&self) -> bool {
        matches!(
            self.fk_type,
            ForeignKeyType::ForeignKeyTable | ForeignKeyType::SelfReferenceTable
        )
    }

    /// Delete paths verify the parent side and self references.
    pub fn verified_on_delete(&self) -> bool {
        matches!(
            self.fk_type,
            ForeignKeyType::PrimaryKeyTable | ForeignKeyType::SelfReferenceTable
        )
    }
}

/// NOT NULL on one stored column.
#[derive(Clone, Debug)]
pub struct NotNullConstraint {
    /// Storage ordinal of the constrained column.
    pub column: usize,
}

/// CHECK with a bound expression over the table's stored columns.
#[derive(Clone, Debug)]
pub struct CheckConstraint {
    pub expression: BoundExpression,
    /// Storage ordinals the expression reads.
    pub bound_columns: Vec<usize>,
}

/// UNIQUE / PRIMARY KEY over a set of stored columns. Enforcement lives in
/// the unique index created alongside the constraint.
#[derive(Clone, Debug)]
pub struct UniqueConstraint {
    pub columns: Vec<usize>,
    pub is_primary_key: bool,
}

/// The constraint sum type dispatched by the verifiers.
#[derive(Clone, Debug)]
pub enum Constraint {
    NotNull(NotNullConstraint),
    Check(CheckConstraint),
    Unique(UniqueConstraint),
    ForeignKey(ForeignKeyInfo),
}

/// First input row with no recorded match, walking the selection in
/// lockstep with the input.
pub(crate) fn first_missing_match(
    matches: &ManagedSelection,
    input_count: usize,
) -> Option<usize> {
    let mut match_idx = 0;
    for i in 0..input_count {
        let matched = matches.index_maps_to_location(match_idx, i);
        match_idx += usize::from(matched);
        if !matched {
            return Some(i);
        }
    }
    None
}

/// The input row to report a foreign-key failure against.
///
/// On append every row must match, so the first *missing* match failed; on
/// delete no row may match, so the first match failed.
pub(crate) fn locate_error_index(
    is_append: bool,
    matches: &ManagedSelection,
    input_count: usize,
) -> Option<usize> {
    if !is_append {
        return matches.first();
    }
    first_missing_match(matches, input_count)
}

/// Whether the recorded matches constitute a foreign-key violation.
pub(crate) fn is_foreign_key_constraint_error(
    is_append: bool,
    input_count: usize,
    matches: &ManagedSelection,
) -> bool {
    if is_append {
        // We need to find a match for all of the values.
        matches.count() != input_count
    } else {
        // We should not find any matches.
        matches.count() != 0
    }
}
