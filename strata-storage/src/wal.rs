//! Write-ahead-log sink surface.
//!
//! The table core emits committed append ranges through [`WalSink`]; how the
//! entries are framed and replayed is a concern of the log implementation.

use std::sync::Mutex;

use arrow::record_batch::RecordBatch;

use strata_result::Result;

/// Sink for commit-time log emission.
pub trait WalSink: Send + Sync {
    /// When true the table skips log emission entirely.
    fn skip_writing(&self) -> bool {
        false
    }

    /// Mark the table subsequent inserts belong to.
    fn write_set_table(&self, schema: &str, table: &str) -> Result<()>;

    /// Log one chunk of inserted rows.
    fn write_insert(&self, chunk: &RecordBatch) -> Result<()>;
}

/// One recorded log entry.
#[derive(Clone, Debug)]
pub enum WalEntry {
    SetTable { schema: String, table: String },
    Insert(RecordBatch),
}

/// In-memory log used in tests to observe what a commit emitted.
pub struct MemoryWal {
    skip: bool,
    entries: Mutex<Vec<WalEntry>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self {
            skip: false,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn skipping() -> Self {
        Self {
            skip: true,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<WalEntry> {
        self.entries.lock().expect("wal lock poisoned").clone()
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl WalSink for MemoryWal {
    fn skip_writing(&self) -> bool {
        self.skip
    }

    fn write_set_table(&self, schema: &str, table: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("wal lock poisoned")
            .push(WalEntry::SetTable {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        Ok(())
    }

    fn write_insert(&self, chunk: &RecordBatch) -> Result<()> {
        self.entries
            .lock()
            .expect("wal lock poisoned")
            .push(WalEntry::Insert(chunk.clone()));
        Ok(())
    }
}
