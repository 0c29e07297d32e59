//! File handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Represents an open file
#[derive(Debug)]
pub struct FileHandle {
    /// Handle ID
    pub fh: u64,
    /// Inode number
    pub ino: u64,
    /// Directory the file was opened through
    pub parent: u64,
    /// Open flags
    pub flags: i32,
}

impl FileHandle {
    /// Create a new file handle
    pub fn new(fh: u64, ino: u64, parent: u64, flags: i32) -> Self {
        FileHandle {
            fh,
            ino,
            parent,
            flags,
        }
    }

    /// Check if opened for reading
    pub fn is_readable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        (self.flags & libc::O_APPEND) != 0
    }
}

/// Manages open file handles
pub struct HandleManager {
    /// Next handle ID
    next_id: AtomicU64,
    /// Open handles
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
}

impl HandleManager {
    /// Create a new handle manager
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Open a file and return its handle
    pub fn open(&self, ino: u64, parent: u64, flags: i32) -> Arc<FileHandle> {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FileHandle::new(fh, ino, parent, flags));
        self.handles.write().insert(fh, Arc::clone(&handle));
        handle
    }

    /// Get a handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close a handle
    pub fn close(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.write().remove(&fh)
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// Check if no handles are open
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Get all handles for an inode
    pub fn handles_for_ino(&self, ino: u64) -> Vec<u64> {
        self.handles
            .read()
            .iter()
            .filter(|(_, h)| h.ino == ino)
            .map(|(&fh, _)| fh)
            .collect()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
