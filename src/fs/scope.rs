//! Directory scope resolution
//!
//! Decides whether a file is subject to obfuscation: it must sit directly
//! inside the designated directory, and that directory must sit directly
//! under the root. Files in subdirectories of it, or in a like-named
//! directory elsewhere, are out of scope.

use super::handle::FileHandle;
use tracing::warn;

/// Upper bound on parent hops before a chain is treated as broken
const MAX_DEPTH: usize = 4096;

/// Name and parent link of a directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    pub name: String,
    pub parent: u64,
}

/// Read-only view of the directory tree's parent links
pub trait DentryTree {
    /// Inode number of the root
    fn root(&self) -> u64;

    /// Entry for `ino`, if it exists
    fn dentry(&self, ino: u64) -> Option<Dentry>;
}

/// Walks parent links from a starting inode up to (excluding) the root.
///
/// Yields `(ino, dentry)` pairs. Stops early, yielding `None` as the last
/// item, if the chain is broken or does not reach the root.
pub struct Ancestors<'a, T: DentryTree + ?Sized> {
    tree: &'a T,
    next: Option<u64>,
    hops: usize,
}

impl<'a, T: DentryTree + ?Sized> Ancestors<'a, T> {
    pub fn new(tree: &'a T, start: u64) -> Self {
        Ancestors {
            tree,
            next: Some(start),
            hops: 0,
        }
    }
}

impl<'a, T: DentryTree + ?Sized> Iterator for Ancestors<'a, T> {
    type Item = Option<(u64, Dentry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let ino = self.next?;
        if ino == self.tree.root() {
            self.next = None;
            return None;
        }

        self.hops += 1;
        let dentry = match self.tree.dentry(ino) {
            Some(d) if d.parent != ino && self.hops <= MAX_DEPTH => d,
            _ => {
                self.next = None;
                return Some(None);
            }
        };
        self.next = Some(dentry.parent);
        Some(Some((ino, dentry)))
    }
}

/// Absolute path of `ino`, or `None` if its chain does not reach the root
pub fn path_of<T: DentryTree + ?Sized>(tree: &T, ino: u64) -> Option<String> {
    let mut names = Vec::new();
    for step in Ancestors::new(tree, ino) {
        let (_, dentry) = step?;
        names.push(dentry.name);
    }
    names.reverse();
    Some(format!("/{}", names.join("/")))
}

/// Decides which files are obfuscated
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    dir_name: String,
}

impl ScopeResolver {
    pub fn new(dir_name: impl Into<String>) -> Self {
        ScopeResolver {
            dir_name: dir_name.into(),
        }
    }

    /// Name of the designated directory
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// Whether the file behind `handle` is in scope. A missing handle or a
    /// broken parent chain is out of scope.
    pub fn is_in_scope<T: DentryTree + ?Sized>(
        &self,
        tree: &T,
        handle: Option<&FileHandle>,
    ) -> bool {
        match handle {
            Some(handle) => self.covers_dir(tree, handle.parent),
            None => false,
        }
    }

    /// Whether files directly inside directory `dir` are in scope
    pub fn covers_dir<T: DentryTree + ?Sized>(&self, tree: &T, dir: u64) -> bool {
        let mut depth = 0;
        let mut direct_parent_matches = false;

        for step in Ancestors::new(tree, dir) {
            let Some((_, dentry)) = step else {
                warn!("Parent chain of directory {} does not reach the root", dir);
                return false;
            };
            if depth == 0 {
                direct_parent_matches = dentry.name == self.dir_name;
            }
            depth += 1;
        }

        depth == 1 && direct_parent_matches
    }
}
