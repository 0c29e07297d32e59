//! Block-mapped file content
//!
//! A file's logical block `i` is backed by `blocks[&i]`; a missing entry is
//! a hole and reads back as zeros. The map is sparse, so a write far past
//! the end costs one entry, not one per skipped block.

use super::{BlockId, StorageBackend};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Logical block index -> allocated block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    blocks: BTreeMap<u64, BlockId>,
}

impl BlockMap {
    /// Create an empty map
    pub fn new() -> Self {
        BlockMap {
            blocks: BTreeMap::new(),
        }
    }

    /// Create a map whose logical block 0 is `first`
    pub fn with_first(first: BlockId) -> Self {
        let mut map = BlockMap::new();
        map.set(0, first);
        map
    }

    /// Block backing logical block `index`
    pub fn get(&self, index: u64) -> Option<BlockId> {
        self.blocks.get(&index).copied()
    }

    fn set(&mut self, index: u64, block: BlockId) {
        self.blocks.insert(index, block);
    }

    /// Number of allocated blocks
    pub fn allocated(&self) -> usize {
        self.blocks.len()
    }

    /// Allocated blocks in logical order
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.values().copied()
    }

    /// Drop logical blocks from `keep` onwards, returning the freed ids
    fn split_off(&mut self, keep: u64) -> Vec<BlockId> {
        self.blocks.split_off(&keep).into_values().collect()
    }
}

/// Read up to `buf.len()` bytes at `offset`, clamped to `size`
pub fn read(
    backend: &dyn StorageBackend,
    map: &BlockMap,
    size: u64,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    if offset >= size {
        return Ok(0);
    }
    let len = (buf.len() as u64).min(size - offset) as usize;
    let bs = backend.block_size();
    let mut block = vec![0u8; bs];
    let mut done = 0;

    while done < len {
        let pos = offset + done as u64;
        let index = pos / bs as u64;
        let within = (pos % bs as u64) as usize;
        let chunk = (bs - within).min(len - done);

        match map.get(index) {
            Some(id) => {
                backend.read_block(id, &mut block)?;
                buf[done..done + chunk].copy_from_slice(&block[within..within + chunk]);
            }
            None => buf[done..done + chunk].fill(0),
        }
        done += chunk;
    }

    Ok(len)
}

/// Write `data` at `offset`, allocating blocks as needed.
///
/// Returns the number of bytes written. If allocation runs out part-way the
/// write is short; if nothing could be written the allocation error is
/// returned.
pub fn write(
    backend: &dyn StorageBackend,
    ino: u64,
    map: &mut BlockMap,
    data: &[u8],
    offset: u64,
) -> Result<usize> {
    let bs = backend.block_size();
    let mut block = vec![0u8; bs];
    let mut done = 0;

    while done < data.len() {
        let pos = offset + done as u64;
        let index = pos / bs as u64;
        let within = (pos % bs as u64) as usize;
        let chunk = (bs - within).min(data.len() - done);

        let id = match map.get(index) {
            Some(id) => {
                if chunk < bs {
                    backend.read_block(id, &mut block)?;
                }
                id
            }
            None => {
                let id = match backend.allocate_block(ino) {
                    Ok(id) => id,
                    Err(e @ Error::AllocationFailed(_)) if done > 0 => {
                        debug!("short write on ino={} after {} bytes: {}", ino, done, e);
                        return Ok(done);
                    }
                    Err(e) => return Err(e),
                };
                map.set(index, id);
                block.fill(0);
                id
            }
        };

        block[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
        backend.write_block(id, &block)?;
        done += chunk;
    }

    Ok(done)
}

/// Cut block-mapped content down to `new_size` bytes.
///
/// Blocks wholly past the end are freed and the tail of the last kept block
/// is zeroed so a later extension reads zeros.
pub fn truncate(backend: &dyn StorageBackend, map: &mut BlockMap, new_size: u64) -> Result<()> {
    let bs = backend.block_size() as u64;
    let keep = new_size.div_ceil(bs);
    for id in map.split_off(keep) {
        backend.free_block(id)?;
    }

    let within = (new_size % bs) as usize;
    if within != 0 {
        if let Some(id) = map.get(keep - 1) {
            let mut block = vec![0u8; bs as usize];
            backend.read_block(id, &mut block)?;
            block[within..].fill(0);
            backend.write_block(id, &block)?;
        }
    }
    Ok(())
}

/// Free every block of a map
pub fn release_all(backend: &dyn StorageBackend, map: &mut BlockMap) -> Result<()> {
    for id in map.split_off(0) {
        backend.free_block(id)?;
    }
    Ok(())
}
