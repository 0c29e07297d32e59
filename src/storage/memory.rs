//! In-memory storage backend
//!
//! Keeps blocks and bincode-encoded inode records in hash maps. Used by
//! tests and for throwaway volumes.

use super::{BlockId, StorageBackend};
use crate::error::{Error, Result};
use crate::metadata::Inode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Volatile backend
pub struct MemoryBackend {
    /// Block size in bytes
    block_size: usize,
    /// Block limit (0 = unlimited)
    max_blocks: u64,
    /// Next block id
    next_block: AtomicU64,
    /// Allocated blocks
    blocks: RwLock<HashMap<BlockId, Vec<u8>>>,
    /// Encoded inode records
    inodes: RwLock<HashMap<u64, Vec<u8>>>,
    /// Number of flush calls
    flushes: AtomicU64,
}

impl MemoryBackend {
    /// Create a new backend
    pub fn new(block_size: usize, max_blocks: u64) -> Self {
        MemoryBackend {
            block_size,
            max_blocks,
            next_block: AtomicU64::new(1),
            blocks: RwLock::new(HashMap::new()),
            inodes: RwLock::new(HashMap::new()),
            flushes: AtomicU64::new(0),
        }
    }

    /// Number of flushes performed
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Raw contents of a block
    pub fn block(&self, block: BlockId) -> Option<Vec<u8>> {
        self.blocks.read().get(&block).cloned()
    }

    /// Whether an inode record has been persisted
    pub fn has_inode(&self, ino: u64) -> bool {
        self.inodes.read().contains_key(&ino)
    }
}

impl StorageBackend for MemoryBackend {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self, ino: u64) -> Result<BlockId> {
        let mut blocks = self.blocks.write();
        if self.max_blocks > 0 && blocks.len() as u64 >= self.max_blocks {
            return Err(Error::AllocationFailed(format!(
                "no free blocks for ino {} ({} in use)",
                ino,
                blocks.len()
            )));
        }
        let id = self.next_block.fetch_add(1, Ordering::SeqCst);
        blocks.insert(id, vec![0u8; self.block_size]);
        Ok(id)
    }

    fn free_block(&self, block: BlockId) -> Result<()> {
        self.blocks
            .write()
            .remove(&block)
            .map(|_| ())
            .ok_or_else(|| Error::Storage(format!("Freeing unallocated block {}", block)))
    }

    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.read();
        let data = blocks
            .get(&block)
            .ok_or_else(|| Error::Storage(format!("Reading unallocated block {}", block)))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.write();
        let slot = blocks
            .get_mut(&block)
            .ok_or_else(|| Error::Storage(format!("Writing unallocated block {}", block)))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn allocated_blocks(&self) -> u64 {
        self.blocks.read().len() as u64
    }

    fn max_blocks(&self) -> u64 {
        self.max_blocks
    }

    fn load_inodes(&self) -> Result<Vec<Inode>> {
        self.inodes
            .read()
            .values()
            .map(|raw| {
                bincode::deserialize(raw).map_err(|e| Error::Deserialization(e.to_string()))
            })
            .collect()
    }

    fn store_inode(&self, inode: &Inode) -> Result<()> {
        let raw = bincode::serialize(inode).map_err(|e| Error::Serialization(e.to_string()))?;
        self.inodes.write().insert(inode.ino, raw);
        Ok(())
    }

    fn remove_inode(&self, ino: u64) -> Result<()> {
        self.inodes.write().remove(&ino);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
