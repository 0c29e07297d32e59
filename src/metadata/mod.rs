//! Metadata module
//!
//! Inode records and the in-memory inode table. Records are persisted by
//! the storage backend when the table reports them dirty.

mod inode;
mod table;

pub use inode::{
    FileData, FileType, InlineData, Inode, InodeAttributes, InodeData, StorageMode, ROOT_INO,
};
pub use table::{InodeRef, InodeTable};
