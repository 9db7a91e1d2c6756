//! Persistence seam for the strata table core.
//!
//! The table core serializes through three narrow surfaces:
//!
//! - [`block::BlockStore`]: an allocate/read/write/free blob store, with
//!   in-memory and directory-backed implementations.
//! - [`checkpoint`]: the checkpoint metadata layout (column statistics,
//!   row-group pointers, table pointer, index data) and the
//!   [`checkpoint::TableDataWriter`] / [`checkpoint::PersistentTableData`]
//!   writer/reader pair. Row-group payloads are Arrow IPC streams; metadata
//!   is bitcode-encoded.
//! - [`wal::WalSink`]: the write-ahead-log surface the table emits commit
//!   ranges into. Log framing and replay live elsewhere.

#![forbid(unsafe_code)]

pub mod block;
pub mod checkpoint;
pub mod ipc;
pub mod wal;

pub use block::{BlockId, BlockStore, FileBlockStore, MemBlockStore};
pub use checkpoint::{
    ColumnStatsData, IndexData, IndexKindData, PersistentTableData, RowGroupPointer, StatsValue,
    TableDataWriter, TablePointer,
};
pub use wal::{MemoryWal, WalEntry, WalSink};
