//! Persistent sled-backed storage
//!
//! Layout:
//! - `blocks` tree: big-endian block id -> block bytes
//! - `inodes` tree: big-endian inode number -> bincode inode record
//! - `meta` tree: volume geometry, checked on reopen

use super::{BlockId, StorageBackend};
use crate::error::{Error, Result};
use crate::metadata::Inode;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

const META_BLOCK_SIZE: &[u8] = b"block_size";
const META_IMMEDIATE_SIZE: &[u8] = b"immediate_file_size";

/// sled database backend
pub struct SledBackend {
    db: sled::Db,
    blocks: sled::Tree,
    inodes: sled::Tree,
    block_size: usize,
    max_blocks: u64,
    /// Serializes the limit check with the insert
    alloc_lock: Mutex<()>,
}

impl SledBackend {
    /// Open (or create) a store under `path`
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        immediate_file_size: usize,
        max_blocks: u64,
    ) -> Result<Self> {
        info!("Opening block store at {:?}", path.as_ref());
        let db = sled::open(path.as_ref())?;
        Self::from_db(db, block_size, immediate_file_size, max_blocks)
    }

    /// Open a store that is deleted when dropped
    pub fn temporary(block_size: usize, immediate_file_size: usize, max_blocks: u64) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, block_size, immediate_file_size, max_blocks)
    }

    fn from_db(
        db: sled::Db,
        block_size: usize,
        immediate_file_size: usize,
        max_blocks: u64,
    ) -> Result<Self> {
        let meta = db.open_tree("meta")?;
        check_geometry(&meta, META_BLOCK_SIZE, block_size as u64)?;
        check_geometry(&meta, META_IMMEDIATE_SIZE, immediate_file_size as u64)?;

        let blocks = db.open_tree("blocks")?;
        let inodes = db.open_tree("inodes")?;
        debug!(
            "Block store ready: {} blocks, {} inodes",
            blocks.len(),
            inodes.len()
        );

        Ok(SledBackend {
            db,
            blocks,
            inodes,
            block_size,
            max_blocks,
            alloc_lock: Mutex::new(()),
        })
    }
}

/// Record a geometry value on first open; refuse a mismatch afterwards
fn check_geometry(meta: &sled::Tree, key: &[u8], value: u64) -> Result<()> {
    match meta.get(key)? {
        Some(stored) => {
            let raw: [u8; 8] = stored
                .as_ref()
                .try_into()
                .map_err(|_| Error::Deserialization(format!("Bad meta entry {:?}", key)))?;
            let stored = u64::from_be_bytes(raw);
            if stored != value {
                return Err(Error::InvalidConfig(format!(
                    "Store was created with {} = {}, configured {}",
                    String::from_utf8_lossy(key),
                    stored,
                    value
                )));
            }
        }
        None => {
            meta.insert(key, value.to_be_bytes().to_vec())?;
        }
    }
    Ok(())
}

impl StorageBackend for SledBackend {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self, ino: u64) -> Result<BlockId> {
        let _guard = self.alloc_lock.lock();
        if self.max_blocks > 0 && self.blocks.len() as u64 >= self.max_blocks {
            return Err(Error::AllocationFailed(format!(
                "no free blocks for ino {} (limit {})",
                ino, self.max_blocks
            )));
        }
        let id = self.db.generate_id()? + 1;
        self.blocks.insert(id.to_be_bytes(), vec![0u8; self.block_size])?;
        Ok(id)
    }

    fn free_block(&self, block: BlockId) -> Result<()> {
        match self.blocks.remove(block.to_be_bytes())? {
            Some(_) => Ok(()),
            None => Err(Error::Storage(format!("Freeing unallocated block {}", block))),
        }
    }

    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()> {
        let data = self
            .blocks
            .get(block.to_be_bytes())?
            .ok_or_else(|| Error::Storage(format!("Reading unallocated block {}", block)))?;
        if data.len() != buf.len() {
            return Err(Error::Storage(format!(
                "Block {} has {} bytes, expected {}",
                block,
                data.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if !self.blocks.contains_key(block.to_be_bytes())? {
            return Err(Error::Storage(format!("Writing unallocated block {}", block)));
        }
        self.blocks.insert(block.to_be_bytes(), data)?;
        Ok(())
    }

    fn allocated_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn max_blocks(&self) -> u64 {
        self.max_blocks
    }

    fn load_inodes(&self) -> Result<Vec<Inode>> {
        let mut inodes = Vec::with_capacity(self.inodes.len());
        for entry in self.inodes.iter() {
            let (_, raw) = entry?;
            let inode: Inode =
                bincode::deserialize(&raw).map_err(|e| Error::Deserialization(e.to_string()))?;
            inodes.push(inode);
        }
        Ok(inodes)
    }

    fn store_inode(&self, inode: &Inode) -> Result<()> {
        let raw = bincode::serialize(inode).map_err(|e| Error::Serialization(e.to_string()))?;
        self.inodes.insert(inode.ino.to_be_bytes(), raw)?;
        Ok(())
    }

    fn remove_inode(&self, ino: u64) -> Result<()> {
        self.inodes.remove(ino.to_be_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
