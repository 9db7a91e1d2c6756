use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::{
    RwLock,
    atomic::{AtomicU64, Ordering},
};

use strata_result::{Error, Result};

/// Identifier of one stored blob.
pub type BlockId = u64;

/// Allocate/read/write/free surface the checkpoint layer serializes through.
pub trait BlockStore: Send + Sync {
    /// Allocate a fresh block identifier.
    fn allocate(&self) -> Result<BlockId>;

    /// Store `bytes` at `id`, replacing any previous content.
    fn write_block(&self, id: BlockId, bytes: &[u8]) -> Result<()>;

    /// Read the content stored at `id`.
    fn read_block(&self, id: BlockId) -> Result<Vec<u8>>;

    /// Release `id`. Unknown identifiers are ignored.
    fn free_block(&self, id: BlockId) -> Result<()>;
}

/// In-memory block store used for tests and temporary databases.
pub struct MemBlockStore {
    next_id: AtomicU64,
    blobs: RwLock<FxHashMap<BlockId, Vec<u8>>>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            blobs: RwLock::new(FxHashMap::default()),
        }
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemBlockStore {
    fn allocate(&self) -> Result<BlockId> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn write_block(&self, id: BlockId, bytes: &[u8]) -> Result<()> {
        let mut map = self.blobs.write().expect("block map lock poisoned");
        map.insert(id, bytes.to_vec());
        Ok(())
    }

    fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        let map = self.blobs.read().expect("block map lock poisoned");
        map.get(&id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("block {} not found", id)))
    }

    fn free_block(&self, id: BlockId) -> Result<()> {
        let mut map = self.blobs.write().expect("block map lock poisoned");
        map.remove(&id);
        Ok(())
    }
}

/// Directory-backed block store: one file per block.
///
/// Re-opening an existing directory resumes identifier allocation after the
/// highest block present.
pub struct FileBlockStore {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl FileBlockStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut max_id = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && let Some(id) = name
                    .strip_prefix("block-")
                    .and_then(|rest| rest.strip_suffix(".bin"))
                    .and_then(|digits| digits.parse::<u64>().ok())
            {
                max_id = max_id.max(id);
            }
        }

        Ok(Self {
            dir,
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    fn block_path(&self, id: BlockId) -> PathBuf {
        self.dir.join(format!("block-{id}.bin"))
    }
}

impl BlockStore for FileBlockStore {
    fn allocate(&self) -> Result<BlockId> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn write_block(&self, id: BlockId, bytes: &[u8]) -> Result<()> {
        std::fs::write(self.block_path(id), bytes)?;
        Ok(())
    }

    fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.block_path(id))?)
    }

    fn free_block(&self, id: BlockId) -> Result<()> {
        match std::fs::remove_file(self.block_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
