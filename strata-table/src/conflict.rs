//! Conflict management for uniqueness and foreign-key verification.
//!
//! A [`ConflictManager`] is a two-mode state machine. In `Scan` mode it
//! records which chunk rows matched existing index entries without failing;
//! in `Throw` mode a match is an error unless the same row was already
//! recorded during an earlier scan pass. Foreign-key verification always
//! runs in `Scan` mode and interprets the recorded matches afterwards.

use rustc_hash::FxHashSet;

use crate::index::Index;
use crate::types::RowId;

/// Mode of a [`ConflictManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictManagerMode {
    /// Record conflicts without failing.
    Scan,
    /// Fail on conflicts for rows not recorded during a prior scan pass.
    Throw,
}

/// What kind of existence check the manager is collecting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyExistenceType {
    /// Uniqueness check on append: a match is a duplicate key.
    Append,
    /// Append-side foreign-key check: every row must match somewhere.
    AppendFk,
    /// Delete-side foreign-key check: no row may match anywhere.
    DeleteFk,
}

/// The ON CONFLICT target: the column set the caller wants conflicts
/// reported against. An empty target matches every unique index.
#[derive(Clone, Debug, Default)]
pub struct ConflictInfo {
    column_ids: FxHashSet<usize>,
}

impl ConflictInfo {
    pub fn new(column_ids: FxHashSet<usize>) -> Self {
        Self { column_ids }
    }

    /// Whether `index` is covered by this conflict target.
    pub fn conflict_target_matches(&self, index: &Index) -> bool {
        if self.column_ids.is_empty() {
            return true;
        }
        if self.column_ids.len() != index.column_ids().len() {
            return false;
        }
        index.column_ids().iter().all(|id| self.column_ids.contains(id))
    }
}

/// Ordered selection of chunk rows that matched during verification.
#[derive(Clone, Debug, Default)]
pub struct ManagedSelection {
    sel: Vec<usize>,
}

impl ManagedSelection {
    pub(crate) fn new(sel: Vec<usize>) -> Self {
        Self { sel }
    }

    pub fn count(&self) -> usize {
        self.sel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sel.is_empty()
    }

    /// The chunk row recorded at position `i` of the selection.
    pub fn get(&self, i: usize) -> usize {
        self.sel[i]
    }

    pub fn first(&self) -> Option<usize> {
        self.sel.first().copied()
    }

    /// True when the selection entry at `match_idx` records chunk row
    /// `location`. Used to walk the selection in lockstep with the input.
    pub fn index_maps_to_location(&self, match_idx: usize, location: usize) -> bool {
        match_idx < self.sel.len() && self.sel[match_idx] == location
    }
}

/// Collects or raises uniqueness/foreign-key matches, depending on mode.
pub struct ConflictManager<'a> {
    verify_type: VerifyExistenceType,
    input_count: usize,
    mode: ConflictManagerMode,
    conflict_info: Option<&'a ConflictInfo>,
    index_count: usize,
    conflict_rows: Vec<usize>,
    conflict_set: FxHashSet<usize>,
    row_ids: Vec<Option<RowId>>,
    finalized: bool,
}

impl<'a> ConflictManager<'a> {
    pub fn new(
        verify_type: VerifyExistenceType,
        input_count: usize,
        conflict_info: Option<&'a ConflictInfo>,
    ) -> Self {
        Self {
            verify_type,
            input_count,
            mode: ConflictManagerMode::Throw,
            conflict_info,
            index_count: 0,
            conflict_rows: Vec::new(),
            conflict_set: FxHashSet::default(),
            row_ids: Vec::new(),
            finalized: false,
        }
    }

    pub fn verify_type(&self) -> VerifyExistenceType {
        self.verify_type
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn set_mode(&mut self, mode: ConflictManagerMode) {
        self.mode = mode;
    }

    pub fn set_index_count(&mut self, count: usize) {
        self.index_count = count;
    }

    pub fn index_count(&self) -> usize {
        self.index_count
    }

    /// The conflict target, detached from the manager borrow so callers can
    /// consult it while continuing to record conflicts.
    pub fn conflict_info(&self) -> Option<&'a ConflictInfo> {
        self.conflict_info
    }

    /// Record a match for `chunk_index`. Returns true when the caller must
    /// fail the verification (Throw mode, row not previously recorded).
    pub fn add_conflict(&mut self, chunk_index: usize, row_id: Option<RowId>) -> bool {
        debug_assert!(chunk_index < self.input_count);
        match self.mode {
            ConflictManagerMode::Scan => {
                if self.conflict_set.insert(chunk_index) {
                    self.conflict_rows.push(chunk_index);
                    self.row_ids.push(row_id);
                }
                false
            }
            ConflictManagerMode::Throw => !self.conflict_set.contains(&chunk_index),
        }
    }

    /// Sort the recorded selection; must run before [`conflicts`].
    ///
    /// [`conflicts`]: ConflictManager::conflicts
    pub fn finalize(&mut self) {
        self.conflict_rows.sort_unstable();
        self.finalized = true;
    }

    pub fn conflicts(&self) -> ManagedSelection {
        debug_assert!(self.finalized, "conflicts read before finalize");
        ManagedSelection::new(self.conflict_rows.clone())
    }

    /// Matched existing row identifiers, in recording order.
    pub fn row_ids(&self) -> &[Option<RowId>] {
        &self.row_ids
    }
}
