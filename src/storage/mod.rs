//! Storage module
//!
//! Block-mapped file content, the inline (immediate) storage engine, and
//! the backends that hold blocks and inode records.

mod blockmap;
mod immediate;
mod memory;
mod sled_store;

pub use blockmap::BlockMap;
pub use immediate::{ImmediateEngine, InlineWrite};
pub use memory::MemoryBackend;
pub use sled_store::SledBackend;

pub(crate) use blockmap::{read as block_read, release_all, truncate as block_truncate, write as block_write};

use crate::error::Result;
use crate::metadata::Inode;

/// Identifier of an allocated data block
pub type BlockId = u64;

/// Block device and inode record store the volume runs on
pub trait StorageBackend: Send + Sync {
    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Allocate a zeroed block on behalf of inode `ino`
    fn allocate_block(&self, ino: u64) -> Result<BlockId>;

    /// Return a block to the free pool
    fn free_block(&self, block: BlockId) -> Result<()>;

    /// Read a whole block into `buf` (`buf.len() == block_size()`)
    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Overwrite a whole block (`data.len() == block_size()`)
    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()>;

    /// Number of blocks currently allocated
    fn allocated_blocks(&self) -> u64;

    /// Block limit (0 = unlimited)
    fn max_blocks(&self) -> u64;

    /// Load every persisted inode record
    fn load_inodes(&self) -> Result<Vec<Inode>>;

    /// Persist one inode record
    fn store_inode(&self, inode: &Inode) -> Result<()>;

    /// Delete a persisted inode record
    fn remove_inode(&self, ino: u64) -> Result<()>;

    /// Make all stored records durable
    fn flush(&self) -> Result<()>;
}
