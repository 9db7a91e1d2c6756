//! Checkpoint metadata layout and the writer/reader pair.
//!
//! A checkpointed table is laid out as: row-group payload blocks (Arrow IPC
//! streams), then a single bitcode-encoded [`TablePointer`] block carrying,
//! in this order, column statistics, row-group pointers, the table
//! identity/cardinality, and index data. The pointer block's id is the
//! handle a catalog stores to find the table again.

use bitcode::{Decode, Encode};

use strata_result::Result;

use crate::block::{BlockId, BlockStore};

/// Scalar boundary value recorded in column statistics.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum StatsValue {
    Boolean(bool),
    Int64(i64),
    /// Stored as raw bits so the encoding stays total for NaN.
    Float64Bits(u64),
    Utf8(String),
}

/// Persisted per-column statistics.
#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct ColumnStatsData {
    pub has_null: bool,
    pub count: u64,
    pub min: Option<StatsValue>,
    pub max: Option<StatsValue>,
}

/// Location of one serialized row group.
#[derive(Clone, Debug, Encode, Decode)]
pub struct RowGroupPointer {
    pub row_start: u64,
    pub count: u64,
    pub block: BlockId,
}

/// Persisted index kind tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum IndexKindData {
    Art,
}

/// Persisted index definition. Entries are rebuilt from row data on restore.
#[derive(Clone, Debug, Encode, Decode)]
pub struct IndexData {
    pub kind: IndexKindData,
    pub is_unique: bool,
    pub is_foreign: bool,
    pub column_ids: Vec<u64>,
}

/// Root metadata block of a checkpointed table.
#[derive(Clone, Debug, Encode, Decode)]
pub struct TablePointer {
    pub schema: String,
    pub table: String,
    pub cardinality: u64,
    pub column_stats: Vec<ColumnStatsData>,
    pub row_groups: Vec<RowGroupPointer>,
    pub indexes: Vec<IndexData>,
}

/// Writer handed to a table checkpoint.
///
/// Collects row-group payloads as they are serialized, then finalizes the
/// table metadata in one pointer block.
pub struct TableDataWriter<'a> {
    store: &'a dyn BlockStore,
    row_groups: Vec<RowGroupPointer>,
}

impl<'a> TableDataWriter<'a> {
    pub fn new(store: &'a dyn BlockStore) -> Self {
        Self {
            store,
            row_groups: Vec::new(),
        }
    }

    /// Persist one serialized row group and record its pointer.
    pub fn write_row_group(&mut self, row_start: u64, count: u64, payload: &[u8]) -> Result<()> {
        let block = self.store.allocate()?;
        self.store.write_block(block, payload)?;
        self.row_groups.push(RowGroupPointer {
            row_start,
            count,
            block,
        });
        Ok(())
    }

    /// Write the table pointer block and return its id.
    pub fn finalize_table(
        self,
        column_stats: Vec<ColumnStatsData>,
        schema: &str,
        table: &str,
        cardinality: u64,
        indexes: Vec<IndexData>,
    ) -> Result<BlockId> {
        let pointer = TablePointer {
            schema: schema.to_string(),
            table: table.to_string(),
            cardinality,
            column_stats,
            row_groups: self.row_groups,
            indexes,
        };
        let block = self.store.allocate()?;
        self.store.write_block(block, &bitcode::encode(&pointer))?;
        Ok(block)
    }
}

/// A restored table checkpoint: pointer metadata plus row-group payloads.
pub struct PersistentTableData {
    pub pointer: TablePointer,
    pub row_group_payloads: Vec<Vec<u8>>,
}

impl PersistentTableData {
    /// Load a checkpoint from its table-pointer block.
    pub fn load(store: &dyn BlockStore, root: BlockId) -> Result<Self> {
        let pointer_bytes = store.read_block(root)?;
        let pointer: TablePointer = bitcode::decode(&pointer_bytes)
            .map_err(|e| strata_result::Error::Internal(format!("corrupt table pointer: {e}")))?;

        let mut row_group_payloads = Vec::with_capacity(pointer.row_groups.len());
        for row_group in &pointer.row_groups {
            row_group_payloads.push(store.read_block(row_group.block)?);
        }

        Ok(Self {
            pointer,
            row_group_payloads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;

    #[test]
    fn checkpoint_metadata_round_trip() {
        let store = MemBlockStore::new();
        let mut writer = TableDataWriter::new(&store);
        writer.write_row_group(0, 3, b"rg0").expect("row group");
        writer.write_row_group(3, 2, b"rg1").expect("row group");

        let stats = vec![ColumnStatsData {
            has_null: false,
            count: 5,
            min: Some(StatsValue::Int64(1)),
            max: Some(StatsValue::Int64(5)),
        }];
        let indexes = vec![IndexData {
            kind: IndexKindData::Art,
            is_unique: true,
            is_foreign: false,
            column_ids: vec![0],
        }];
        let root = writer
            .finalize_table(stats.clone(), "main", "items", 5, indexes)
            .expect("finalize");

        let data = PersistentTableData::load(&store, root).expect("load");
        assert_eq!(data.pointer.table, "items");
        assert_eq!(data.pointer.cardinality, 5);
        assert_eq!(data.pointer.column_stats, stats);
        assert_eq!(data.pointer.row_groups.len(), 2);
        assert_eq!(data.row_group_payloads[0], b"rg0");
        assert_eq!(data.row_group_payloads[1], b"rg1");
        assert!(data.pointer.indexes[0].is_unique);
    }
}
