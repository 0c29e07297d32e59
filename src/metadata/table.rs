//! In-memory inode table
//!
//! Every inode sits behind its own mutex. Holding that mutex is the
//! serialization region for size checks, conversions, and block allocation
//! on the inode.

use super::inode::{Inode, ROOT_INO};
use crate::error::{Error, Result};
use crate::fs::scope::{Dentry, DentryTree};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared, lockable inode
pub type InodeRef = Arc<Mutex<Inode>>;

/// Inode number -> inode, plus the set of records awaiting persistence
pub struct InodeTable {
    /// Next inode number to hand out
    next_ino: AtomicU64,
    /// Live inodes
    inodes: RwLock<HashMap<u64, InodeRef>>,
    /// Inodes modified since the last flush
    dirty: Mutex<HashSet<u64>>,
}

impl InodeTable {
    /// Create an empty table
    pub fn new() -> Self {
        InodeTable {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            inodes: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Build a table from persisted records
    pub fn from_inodes(inodes: Vec<Inode>) -> Self {
        let table = InodeTable::new();
        let mut max_ino = ROOT_INO;
        {
            let mut map = table.inodes.write();
            for inode in inodes {
                max_ino = max_ino.max(inode.ino);
                map.insert(inode.ino, Arc::new(Mutex::new(inode)));
            }
        }
        table.next_ino.store(max_ino + 1, Ordering::SeqCst);
        table
    }

    /// Allocate a new inode number
    pub fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an inode and mark it dirty
    pub fn insert(&self, inode: Inode) -> InodeRef {
        let ino = inode.ino;
        let entry = Arc::new(Mutex::new(inode));
        self.inodes.write().insert(ino, Arc::clone(&entry));
        self.mark_dirty(ino);
        entry
    }

    /// Get an inode by number
    pub fn get(&self, ino: u64) -> Result<InodeRef> {
        self.inodes
            .read()
            .get(&ino)
            .cloned()
            .ok_or(Error::InodeNotFound(ino))
    }

    /// Clone an inode's current state
    pub fn snapshot(&self, ino: u64) -> Result<Inode> {
        Ok(self.get(ino)?.lock().clone())
    }

    /// Drop an inode from the table
    pub fn remove(&self, ino: u64) -> Option<InodeRef> {
        self.dirty.lock().remove(&ino);
        self.inodes.write().remove(&ino)
    }

    /// Check if inode exists
    pub fn exists(&self, ino: u64) -> bool {
        self.inodes.read().contains_key(&ino)
    }

    /// Schedule an inode for persistence
    pub fn mark_dirty(&self, ino: u64) {
        self.dirty.lock().insert(ino);
    }

    /// Check if an inode is awaiting persistence
    pub fn is_dirty(&self, ino: u64) -> bool {
        self.dirty.lock().contains(&ino)
    }

    /// Take the dirty set, leaving it empty
    pub fn take_dirty(&self) -> Vec<u64> {
        let mut dirty = self.dirty.lock();
        let mut inos: Vec<u64> = dirty.drain().collect();
        inos.sort_unstable();
        inos
    }

    /// All inode numbers
    pub fn inos(&self) -> Vec<u64> {
        let mut inos: Vec<u64> = self.inodes.read().keys().copied().collect();
        inos.sort_unstable();
        inos
    }

    /// Number of live inodes
    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.inodes.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DentryTree for InodeTable {
    fn root(&self) -> u64 {
        ROOT_INO
    }

    fn dentry(&self, ino: u64) -> Option<Dentry> {
        let entry = self.get(ino).ok()?;
        let inode = entry.lock();
        Some(Dentry {
            name: inode.name.clone(),
            parent: inode.parent,
        })
    }
}
