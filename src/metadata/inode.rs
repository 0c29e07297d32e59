//! Inode representation for the filesystem
//!
//! A regular file's content lives either inline in the inode (immediate
//! mode) or in separately allocated blocks. The two layouts are distinct
//! variants of [`FileData`], so inline bytes cannot be reached once a file
//! has been converted.

use crate::storage::BlockMap;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Inode number of the filesystem root
pub const ROOT_INO: u64 = 1;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    RegularFile,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

impl FileType {
    /// Convert to fuser file type
    pub fn to_fuser(&self) -> fuser::FileType {
        match self {
            FileType::RegularFile => fuser::FileType::RegularFile,
            FileType::Directory => fuser::FileType::Directory,
            FileType::Symlink => fuser::FileType::Symlink,
        }
    }
}

/// Storage mode tag of an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Regular file with block-mapped content
    Regular,
    /// Regular file with content stored inline
    Immediate,
    /// Directory
    Directory,
    /// Anything else (symlinks)
    Other,
}

/// Fixed-capacity inline content buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    bytes: Vec<u8>,
}

impl InlineData {
    /// Create a zeroed buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        InlineData {
            bytes: vec![0u8; capacity],
        }
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Content layout of a regular file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileData {
    /// Content stored inside the inode
    Immediate(InlineData),
    /// Content stored in allocated blocks
    Regular(BlockMap),
}

/// Type-specific inode payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InodeData {
    /// Regular file
    File(FileData),
    /// Directory with child inode numbers
    Directory { children: Vec<u64> },
    /// Symbolic link
    Symlink { target: String },
}

/// Inode attributes (POSIX-like)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeAttributes {
    /// Logical size in bytes, valid in both storage modes
    pub size: u64,
    /// Number of 512-byte sectors in use
    pub blocks: u64,
    /// Access time
    pub atime: SystemTime,
    /// Modification time
    pub mtime: SystemTime,
    /// Change time
    pub ctime: SystemTime,
    /// Creation time
    pub crtime: SystemTime,
    /// Permission mode
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User ID
    pub uid: u32,
    /// Group ID
    pub gid: u32,
    /// Block size
    pub blksize: u32,
}

impl InodeAttributes {
    fn new(uid: u32, gid: u32, perm: u16, nlink: u32, blksize: u32) -> Self {
        let now = SystemTime::now();
        InodeAttributes {
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            perm,
            nlink,
            uid,
            gid,
            blksize,
        }
    }

    /// Update modification time
    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// Inode representing a file or directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    /// Inode number
    pub ino: u64,
    /// Parent directory inode (the root is its own parent)
    pub parent: u64,
    /// Name within the parent directory
    pub name: String,
    /// Inode attributes
    pub attrs: InodeAttributes,
    /// Type-specific payload
    pub data: InodeData,
}

impl Inode {
    /// Create a new root inode
    pub fn root(uid: u32, gid: u32, perm: u16, blksize: u32) -> Self {
        Inode {
            ino: ROOT_INO,
            parent: ROOT_INO,
            name: String::new(),
            attrs: InodeAttributes::new(uid, gid, perm, 2, blksize),
            data: InodeData::Directory {
                children: Vec::new(),
            },
        }
    }

    /// Create a new, empty file in immediate mode
    #[allow(clippy::too_many_arguments)]
    pub fn new_file(
        ino: u64,
        parent: u64,
        name: String,
        uid: u32,
        gid: u32,
        perm: u16,
        blksize: u32,
        inline_capacity: usize,
    ) -> Self {
        Inode {
            ino,
            parent,
            name,
            attrs: InodeAttributes::new(uid, gid, perm, 1, blksize),
            data: InodeData::File(FileData::Immediate(InlineData::new(inline_capacity))),
        }
    }

    /// Create a new directory inode
    pub fn new_directory(
        ino: u64,
        parent: u64,
        name: String,
        uid: u32,
        gid: u32,
        perm: u16,
        blksize: u32,
    ) -> Self {
        Inode {
            ino,
            parent,
            name,
            attrs: InodeAttributes::new(uid, gid, perm, 2, blksize),
            data: InodeData::Directory {
                children: Vec::new(),
            },
        }
    }

    /// Create a new symlink inode
    pub fn new_symlink(
        ino: u64,
        parent: u64,
        name: String,
        target: String,
        uid: u32,
        gid: u32,
        blksize: u32,
    ) -> Self {
        let mut attrs = InodeAttributes::new(uid, gid, 0o777, 1, blksize);
        attrs.size = target.len() as u64;
        Inode {
            ino,
            parent,
            name,
            attrs,
            data: InodeData::Symlink { target },
        }
    }

    /// File type
    pub fn kind(&self) -> FileType {
        match self.data {
            InodeData::File(_) => FileType::RegularFile,
            InodeData::Directory { .. } => FileType::Directory,
            InodeData::Symlink { .. } => FileType::Symlink,
        }
    }

    /// Storage mode tag
    pub fn mode(&self) -> StorageMode {
        match self.data {
            InodeData::File(FileData::Immediate(_)) => StorageMode::Immediate,
            InodeData::File(FileData::Regular(_)) => StorageMode::Regular,
            InodeData::Directory { .. } => StorageMode::Directory,
            InodeData::Symlink { .. } => StorageMode::Other,
        }
    }

    /// Check if this is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self.data, InodeData::Directory { .. })
    }

    /// Check if this is a regular file
    pub fn is_file(&self) -> bool {
        matches!(self.data, InodeData::File(_))
    }

    /// Child inode numbers, if this is a directory
    pub fn children(&self) -> Option<&[u64]> {
        match &self.data {
            InodeData::Directory { children } => Some(children),
            _ => None,
        }
    }

    /// Add a child to a directory
    pub fn add_child(&mut self, child_ino: u64) {
        if let InodeData::Directory { children } = &mut self.data {
            if !children.contains(&child_ino) {
                children.push(child_ino);
                self.attrs.touch();
            }
        }
    }

    /// Remove a child from a directory
    pub fn remove_child(&mut self, child_ino: u64) {
        if let InodeData::Directory { children } = &mut self.data {
            children.retain(|&c| c != child_ino);
            self.attrs.touch();
        }
    }

    /// Update file size
    pub fn set_size(&mut self, size: u64) {
        self.attrs.size = size;
        self.attrs.touch();
    }

    /// Recompute the sector count from the storage layout
    pub fn update_block_count(&mut self) {
        let blksize = self.attrs.blksize as u64;
        self.attrs.blocks = match &self.data {
            InodeData::File(FileData::Regular(map)) => map.allocated() as u64 * blksize / 512,
            _ => 0,
        };
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser(&self) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: self.attrs.size,
            blocks: self.attrs.blocks,
            atime: self.attrs.atime,
            mtime: self.attrs.mtime,
            ctime: self.attrs.ctime,
            crtime: self.attrs.crtime,
            kind: self.kind().to_fuser(),
            perm: self.attrs.perm,
            nlink: self.attrs.nlink,
            uid: self.attrs.uid,
            gid: self.attrs.gid,
            rdev: 0,
            blksize: self.attrs.blksize,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode() {
        let root = Inode::root(1000, 1000, 0o755, 1024);
        assert_eq!(root.ino, ROOT_INO);
        assert_eq!(root.parent, ROOT_INO);
        assert!(root.is_dir());
        assert_eq!(root.mode(), StorageMode::Directory);
        assert_eq!(root.children(), Some(&[][..]));
    }

    #[test]
    fn test_new_file_is_immediate() {
        let file = Inode::new_file(2, 1, "x".to_string(), 1000, 1000, 0o644, 1024, 60);
        assert!(file.is_file());
        assert_eq!(file.mode(), StorageMode::Immediate);
        assert_eq!(file.attrs.size, 0);
        match &file.data {
            InodeData::File(FileData::Immediate(inline)) => {
                assert_eq!(inline.capacity(), 60);
                assert!(inline.as_slice().iter().all(|&b| b == 0));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_directory_children() {
        let mut dir = Inode::new_directory(2, 1, "subdir".to_string(), 1000, 1000, 0o755, 1024);
        dir.add_child(3);
        dir.add_child(4);
        dir.add_child(3);
        assert_eq!(dir.children().unwrap().len(), 2);

        dir.remove_child(3);
        assert_eq!(dir.children().unwrap(), &[4]);
    }

    #[test]
    fn test_symlink_is_other() {
        let link = Inode::new_symlink(5, 1, "l".to_string(), "/t".to_string(), 0, 0, 1024);
        assert_eq!(link.mode(), StorageMode::Other);
        assert_eq!(link.attrs.size, 2);
    }

    #[test]
    fn test_bincode_round_trip_keeps_mode() {
        let file = Inode::new_file(7, 1, "f".to_string(), 0, 0, 0o600, 1024, 60);
        let bytes = bincode::serialize(&file).unwrap();
        let back: Inode = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.ino, 7);
        assert_eq!(back.mode(), StorageMode::Immediate);
    }
}
