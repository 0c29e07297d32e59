//! Volume: namespace operations and the read/write dispatch path
//!
//! Every read and write is routed along two independent axes: whether the
//! file is in the obfuscated directory scope, and whether its content is
//! stored inline or in blocks.

use super::boundary::{StagingBuffer, UserSink, UserSource};
use super::handle::{FileHandle, HandleManager};
use super::scope::{path_of, ScopeResolver};
use crate::config::Config;
use crate::crypto::XorCipher;
use crate::error::{Error, Result};
use crate::metadata::{FileData, FileType, Inode, InodeData, InodeTable, StorageMode, ROOT_INO};
use crate::storage::{
    block_read, block_truncate, block_write, release_all, ImmediateEngine, InlineWrite,
    MemoryBackend, SledBackend, StorageBackend,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest accepted entry name
const MAX_NAME_LEN: usize = 255;

/// Largest file size; FUSE offsets are signed 64-bit
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Counts reported by [`Volume::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeStats {
    pub inodes: usize,
    pub directories: usize,
    pub immediate_files: usize,
    pub regular_files: usize,
    pub symlinks: usize,
    pub blocks_used: u64,
    pub max_blocks: u64,
    pub open_handles: usize,
}

/// Directory entry returned by [`Volume::readdir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: FileType,
}

/// A mounted volume
pub struct Volume {
    backend: Box<dyn StorageBackend>,
    inodes: InodeTable,
    handles: HandleManager,
    cipher: XorCipher,
    scope: ScopeResolver,
    immediate_file_size: usize,
    uid: u32,
    gid: u32,
    file_mode: u16,
    dir_mode: u16,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || name.len() > MAX_NAME_LEN
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

fn block_map_mut(inode: &mut Inode) -> Result<&mut crate::storage::BlockMap> {
    match &mut inode.data {
        InodeData::File(FileData::Regular(map)) => Ok(map),
        _ => Err(Error::Internal(format!(
            "ino {} is not block-mapped",
            inode.ino
        ))),
    }
}

impl Volume {
    /// Open a volume on `backend`, creating the root directory if the
    /// backend holds no inodes yet
    pub fn open(config: &Config, backend: Box<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        if backend.block_size() != config.storage.block_size {
            return Err(Error::InvalidConfig(format!(
                "Backend block size {} does not match configured {}",
                backend.block_size(),
                config.storage.block_size
            )));
        }

        let existing = backend.load_inodes()?;
        let fresh = existing.is_empty();
        let inodes = InodeTable::from_inodes(existing);
        if fresh {
            info!("Formatting new volume");
            inodes.insert(Inode::root(
                config.mount.uid,
                config.mount.gid,
                config.mount.default_dir_mode as u16,
                config.storage.block_size as u32,
            ));
        } else if !inodes.exists(ROOT_INO) {
            return Err(Error::InodeNotFound(ROOT_INO));
        }

        let volume = Volume {
            backend,
            inodes,
            handles: HandleManager::new(),
            cipher: XorCipher::new(config.crypt.key.clone())?,
            scope: ScopeResolver::new(config.crypt.encrypted_dir.clone()),
            immediate_file_size: config.storage.immediate_file_size,
            uid: config.mount.uid,
            gid: config.mount.gid,
            file_mode: config.mount.default_file_mode as u16,
            dir_mode: config.mount.default_dir_mode as u16,
        };
        if fresh {
            volume.sync()?;
        }

        info!(
            "Volume open: {} inodes, scope /{}, immediate capacity {} bytes",
            volume.inodes.len(),
            volume.scope.dir_name(),
            volume.immediate_file_size
        );
        Ok(volume)
    }

    /// Open a volume held entirely in memory
    pub fn open_in_memory(config: &Config) -> Result<Self> {
        let backend = MemoryBackend::new(config.storage.block_size, config.storage.max_blocks);
        Self::open(config, Box::new(backend))
    }

    /// Open the persistent volume under `config.storage.data_dir`
    pub fn open_persistent(config: &Config) -> Result<Self> {
        config.ensure_directories()?;
        let backend = SledBackend::open(
            config.storage.data_dir.join("store"),
            config.storage.block_size,
            config.storage.immediate_file_size,
            config.storage.max_blocks,
        )?;
        Self::open(config, Box::new(backend))
    }

    fn engine(&self) -> ImmediateEngine<'_> {
        ImmediateEngine::new(self.backend.as_ref(), &self.inodes)
    }

    /// The storage backend
    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Inline capacity given to new files
    pub fn immediate_file_size(&self) -> usize {
        self.immediate_file_size
    }

    // ---------------------------------------------------------------------
    // Namespace
    // ---------------------------------------------------------------------

    /// Current state of an inode
    pub fn getattr(&self, ino: u64) -> Result<Inode> {
        self.inodes.snapshot(ino)
    }

    fn find_child(&self, dir: &Inode, name: &str) -> Result<Option<u64>> {
        let children = dir.children().ok_or(Error::NotADirectory(dir.ino))?;
        for &child in children {
            let entry = self.inodes.get(child)?;
            if entry.lock().name == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Look up `name` in directory `parent`
    pub fn lookup(&self, parent: u64, name: &str) -> Result<Inode> {
        let dir_entry = self.inodes.get(parent)?;
        let child = {
            let dir = dir_entry.lock();
            self.find_child(&dir, name)?
        };
        match child {
            Some(ino) => self.inodes.snapshot(ino),
            None => Err(Error::PathNotFound(name.to_string())),
        }
    }

    /// Resolve an absolute path such as `/encrypt/x`
    pub fn lookup_path(&self, path: &str) -> Result<Inode> {
        let mut current = self.inodes.snapshot(ROOT_INO)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_dir() {
                return Err(Error::NotADirectory(current.ino));
            }
            current = self.lookup(current.ino, component).map_err(|e| match e {
                Error::PathNotFound(_) => Error::PathNotFound(path.to_string()),
                other => other,
            })?;
        }
        Ok(current)
    }

    /// Absolute path of an inode, if its parent chain is intact
    pub fn path_of(&self, ino: u64) -> Option<String> {
        path_of(&self.inodes, ino)
    }

    /// List a directory
    pub fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let dir_entry = self.inodes.get(ino)?;
        let dir = dir_entry.lock();
        let children = dir.children().ok_or(Error::NotADirectory(ino))?;

        let mut entries = Vec::with_capacity(children.len());
        for &child in children {
            let entry = self.inodes.get(child)?;
            let child = entry.lock();
            entries.push(DirEntry {
                ino: child.ino,
                name: child.name.clone(),
                kind: child.kind(),
            });
        }
        Ok(entries)
    }

    /// Insert a new child built by `make` under `parent`
    fn add_entry<F>(&self, parent: u64, name: &str, make: F) -> Result<Inode>
    where
        F: FnOnce(u64) -> Inode,
    {
        validate_name(name)?;
        let dir_entry = self.inodes.get(parent)?;
        let mut dir = dir_entry.lock();
        if self.find_child(&dir, name)?.is_some() {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let ino = self.inodes.alloc_ino();
        let inode = make(ino);
        let snapshot = inode.clone();
        self.inodes.insert(inode);
        dir.add_child(ino);
        if snapshot.is_dir() {
            dir.attrs.nlink += 1;
        }
        self.inodes.mark_dirty(parent);
        Ok(snapshot)
    }

    /// Create an empty regular file (immediate mode)
    pub fn create(&self, parent: u64, name: &str, perm: Option<u16>) -> Result<Inode> {
        let perm = perm.unwrap_or(self.file_mode);
        let inode = self.add_entry(parent, name, |ino| {
            Inode::new_file(
                ino,
                parent,
                name.to_string(),
                self.uid,
                self.gid,
                perm,
                self.backend.block_size() as u32,
                self.immediate_file_size,
            )
        })?;
        debug!("create(parent={}, name={:?}) -> ino {}", parent, name, inode.ino);
        Ok(inode)
    }

    /// Create a directory
    pub fn mkdir(&self, parent: u64, name: &str, perm: Option<u16>) -> Result<Inode> {
        let perm = perm.unwrap_or(self.dir_mode);
        let inode = self.add_entry(parent, name, |ino| {
            Inode::new_directory(
                ino,
                parent,
                name.to_string(),
                self.uid,
                self.gid,
                perm,
                self.backend.block_size() as u32,
            )
        })?;
        debug!("mkdir(parent={}, name={:?}) -> ino {}", parent, name, inode.ino);
        Ok(inode)
    }

    /// Create a symbolic link
    pub fn symlink(&self, parent: u64, name: &str, target: &str) -> Result<Inode> {
        self.add_entry(parent, name, |ino| {
            Inode::new_symlink(
                ino,
                parent,
                name.to_string(),
                target.to_string(),
                self.uid,
                self.gid,
                self.backend.block_size() as u32,
            )
        })
    }

    /// Target of a symbolic link
    pub fn readlink(&self, ino: u64) -> Result<String> {
        match &self.inodes.snapshot(ino)?.data {
            InodeData::Symlink { target } => Ok(target.clone()),
            _ => Err(Error::NotAFile(ino)),
        }
    }

    /// Detach `name` from `parent`, checking the child with `check`
    fn remove_entry<F>(&self, parent: u64, name: &str, check: F) -> Result<u64>
    where
        F: FnOnce(&Inode) -> Result<()>,
    {
        let dir_entry = self.inodes.get(parent)?;
        let mut dir = dir_entry.lock();
        let ino = self
            .find_child(&dir, name)?
            .ok_or_else(|| Error::PathNotFound(name.to_string()))?;

        let child_entry = self.inodes.get(ino)?;
        let mut child = child_entry.lock();
        check(&*child)?;

        if let InodeData::File(FileData::Regular(map)) = &mut child.data {
            release_all(self.backend.as_ref(), map)?;
        }
        if child.is_dir() {
            dir.attrs.nlink = dir.attrs.nlink.saturating_sub(1);
        }
        dir.remove_child(ino);
        self.inodes.mark_dirty(parent);
        drop(child);

        self.inodes.remove(ino);
        self.backend.remove_inode(ino)?;

        let open = self.handles.handles_for_ino(ino);
        if !open.is_empty() {
            warn!("ino {} removed with {} open handle(s)", ino, open.len());
        }
        Ok(ino)
    }

    /// Remove a file or symlink
    pub fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let ino = self.remove_entry(parent, name, |child| {
            if child.is_dir() {
                Err(Error::IsADirectory(child.ino))
            } else {
                Ok(())
            }
        })?;
        debug!("unlink(parent={}, name={:?}) ino {}", parent, name, ino);
        Ok(())
    }

    /// Remove an empty directory
    pub fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        let ino = self.remove_entry(parent, name, |child| match child.children() {
            None => Err(Error::NotADirectory(child.ino)),
            Some(children) if !children.is_empty() => Err(Error::NotEmpty(child.name.clone())),
            Some(_) => Ok(()),
        })?;
        debug!("rmdir(parent={}, name={:?}) ino {}", parent, name, ino);
        Ok(())
    }

    /// Open a regular file
    pub fn open_file(&self, ino: u64, flags: i32) -> Result<Arc<FileHandle>> {
        let inode = self.inodes.snapshot(ino)?;
        match inode.mode() {
            StorageMode::Directory => return Err(Error::IsADirectory(ino)),
            StorageMode::Other => return Err(Error::NotAFile(ino)),
            StorageMode::Immediate | StorageMode::Regular => {}
        }

        let handle = self.handles.open(ino, inode.parent, flags);
        if handle.is_writable() && (flags & libc::O_TRUNC) != 0 {
            self.truncate(ino, 0)?;
        }
        debug!("open(ino={}, flags={:#x}) -> fh {}", ino, flags, handle.fh);
        Ok(handle)
    }

    /// Look up an open handle
    pub fn handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles.get(fh).ok_or(Error::HandleNotFound(fh))
    }

    /// Close a handle
    pub fn release(&self, fh: u64) -> Result<()> {
        self.handles
            .close(fh)
            .map(|_| ())
            .ok_or(Error::HandleNotFound(fh))
    }

    /// Set a file's size, zero-filling on growth
    pub fn truncate(&self, ino: u64, size: u64) -> Result<Inode> {
        if size > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge(size));
        }
        let entry = self.inodes.get(ino)?;
        let mut inode = entry.lock();
        match inode.mode() {
            StorageMode::Immediate => {
                let engine = self.engine();
                if !engine.resize(&mut inode, size)? {
                    engine.convert(&mut inode)?;
                    self.truncate_blocks(&mut inode, size)?;
                }
            }
            StorageMode::Regular => self.truncate_blocks(&mut inode, size)?,
            StorageMode::Directory => return Err(Error::IsADirectory(ino)),
            StorageMode::Other => return Err(Error::NotAFile(ino)),
        }
        debug!("truncate(ino={}, size={})", ino, size);
        Ok(inode.clone())
    }

    fn truncate_blocks(&self, inode: &mut Inode, size: u64) -> Result<()> {
        if size < inode.attrs.size {
            block_truncate(self.backend.as_ref(), block_map_mut(inode)?, size)?;
        }
        inode.set_size(size);
        inode.update_block_count();
        self.inodes.mark_dirty(inode.ino);
        Ok(())
    }

    /// Persist dirty inodes and flush the backend
    pub fn sync(&self) -> Result<()> {
        let dirty = self.inodes.take_dirty();
        for (i, &ino) in dirty.iter().enumerate() {
            let Ok(entry) = self.inodes.get(ino) else {
                continue;
            };
            let inode = entry.lock().clone();
            if let Err(e) = self.backend.store_inode(&inode) {
                for &pending in &dirty[i..] {
                    self.inodes.mark_dirty(pending);
                }
                return Err(e);
            }
        }
        self.backend.flush()?;
        debug!("sync: stored {} inode(s)", dirty.len());
        Ok(())
    }

    /// Inode and block usage
    pub fn stats(&self) -> VolumeStats {
        let mut stats = VolumeStats {
            blocks_used: self.backend.allocated_blocks(),
            max_blocks: self.backend.max_blocks(),
            open_handles: self.handles.len(),
            ..VolumeStats::default()
        };
        for ino in self.inodes.inos() {
            let Ok(entry) = self.inodes.get(ino) else {
                continue;
            };
            stats.inodes += 1;
            let mode = entry.lock().mode();
            match mode {
                StorageMode::Directory => stats.directories += 1,
                StorageMode::Immediate => stats.immediate_files += 1,
                StorageMode::Regular => stats.regular_files += 1,
                StorageMode::Other => stats.symlinks += 1,
            }
        }
        stats
    }

    // ---------------------------------------------------------------------
    // Read/write dispatch
    // ---------------------------------------------------------------------

    /// Whether the file behind `handle` is obfuscated
    pub fn is_in_scope(&self, handle: Option<&FileHandle>) -> bool {
        self.scope.is_in_scope(&self.inodes, handle)
    }

    /// Write the caller's bytes at `*pos`, advancing `*pos`.
    ///
    /// Handles opened with `O_APPEND` write at the end of the file.
    pub fn write<S: UserSource + ?Sized>(
        &self,
        handle: &FileHandle,
        src: &S,
        pos: &mut u64,
    ) -> Result<usize> {
        let mut staged = StagingBuffer::stage(src)?;
        let in_scope = self.is_in_scope(Some(handle));

        let entry = self.inodes.get(handle.ino)?;
        let mut inode = entry.lock();
        if handle.is_append() {
            *pos = inode.attrs.size;
        }
        if staged.is_empty() {
            return Ok(0);
        }
        match pos.checked_add(staged.len() as u64) {
            Some(end) if end <= MAX_FILE_SIZE => {}
            _ => return Err(Error::FileTooLarge(*pos)),
        }

        let cipher = in_scope.then_some(&self.cipher);
        debug!(
            "write(ino={}, fh={}, pos={}, len={}, scoped={}, mode={:?})",
            handle.ino,
            handle.fh,
            *pos,
            staged.len(),
            in_scope,
            inode.mode()
        );

        match inode.mode() {
            StorageMode::Immediate => {
                match self.engine().write(&mut inode, staged.payload_mut(), pos, cipher)? {
                    InlineWrite::Stored(n) => Ok(n),
                    InlineWrite::Converted => {
                        self.write_blocks(&mut inode, staged.payload_mut(), pos, cipher)
                    }
                }
            }
            StorageMode::Regular => self.write_blocks(&mut inode, staged.payload_mut(), pos, cipher),
            StorageMode::Directory => Err(Error::IsADirectory(handle.ino)),
            StorageMode::Other => Err(Error::NotAFile(handle.ino)),
        }
    }

    fn write_blocks(
        &self,
        inode: &mut Inode,
        buf: &mut [u8],
        pos: &mut u64,
        cipher: Option<&XorCipher>,
    ) -> Result<usize> {
        if let Some(cipher) = cipher {
            cipher.encrypt(buf, *pos);
        }
        let ino = inode.ino;
        let written = block_write(self.backend.as_ref(), ino, block_map_mut(inode)?, buf, *pos)?;

        *pos += written as u64;
        if *pos > inode.attrs.size {
            inode.set_size(*pos);
        } else {
            inode.attrs.touch();
        }
        inode.update_block_count();
        self.inodes.mark_dirty(ino);
        Ok(written)
    }

    /// Read up to `len` bytes at `*pos` into the caller's memory, advancing
    /// `*pos`. Returns fewer bytes than requested at end of file.
    pub fn read<D: UserSink + ?Sized>(
        &self,
        handle: &FileHandle,
        dest: &mut D,
        len: usize,
        pos: &mut u64,
    ) -> Result<usize> {
        let in_scope = self.is_in_scope(Some(handle));
        let mut staged = StagingBuffer::for_read(len, in_scope);
        let start = *pos;

        let n = {
            let entry = self.inodes.get(handle.ino)?;
            let inode = entry.lock();
            debug!(
                "read(ino={}, fh={}, pos={}, len={}, scoped={}, mode={:?})",
                handle.ino,
                handle.fh,
                start,
                len,
                in_scope,
                inode.mode()
            );
            match &inode.data {
                InodeData::File(FileData::Immediate(_)) => {
                    self.engine().read(&inode, staged.payload_mut(), pos)?
                }
                InodeData::File(FileData::Regular(map)) => {
                    let n = block_read(
                        self.backend.as_ref(),
                        map,
                        inode.attrs.size,
                        staged.payload_mut(),
                        start,
                    )?;
                    *pos += n as u64;
                    n
                }
                InodeData::Directory { .. } => return Err(Error::IsADirectory(handle.ino)),
                InodeData::Symlink { .. } => return Err(Error::NotAFile(handle.ino)),
            }
        };

        staged.truncate(n);
        if in_scope {
            self.cipher.decrypt(staged.raw_mut(), n, start);
        }
        if let Err(e) = dest.copy_out(staged.payload()) {
            *pos = start;
            return Err(e);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as FsResult;

    fn config() -> Config {
        let mut config = Config::default();
        config.crypt.key = vec![0x5A];
        config.crypt.encrypted_dir = "encrypt".to_string();
        config.storage.immediate_file_size = 60;
        config.storage.block_size = 1024;
        config
    }

    fn volume() -> Volume {
        Volume::open_in_memory(&config()).unwrap()
    }

    /// Raw stored bytes of a file, bypassing the cipher
    fn stored(volume: &Volume, ino: u64) -> Vec<u8> {
        let inode = volume.getattr(ino).unwrap();
        let size = inode.attrs.size as usize;
        match &inode.data {
            InodeData::File(FileData::Immediate(inline)) => inline.as_slice()[..size].to_vec(),
            InodeData::File(FileData::Regular(map)) => {
                let mut out = vec![0u8; size];
                block_read(volume.backend(), map, size as u64, &mut out, 0).unwrap();
                out
            }
            _ => panic!("not a file"),
        }
    }

    fn read_all(volume: &Volume, handle: &FileHandle, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut pos = 0;
        let n = volume.read(handle, &mut out[..], len, &mut pos).unwrap();
        out.truncate(n);
        out
    }

    struct FaultySource(usize);

    impl UserSource for FaultySource {
        fn len(&self) -> usize {
            self.0
        }

        fn copy_in(&self, _dest: &mut [u8]) -> FsResult<()> {
            Err(Error::BoundaryCopy("page fault".to_string()))
        }
    }

    struct FaultySink;

    impl UserSink for FaultySink {
        fn capacity(&self) -> usize {
            usize::MAX
        }

        fn copy_out(&mut self, _src: &[u8]) -> FsResult<()> {
            Err(Error::BoundaryCopy("page fault".to_string()))
        }
    }

    #[test]
    fn test_fresh_volume_has_root() {
        let volume = volume();
        let root = volume.getattr(ROOT_INO).unwrap();
        assert!(root.is_dir());
        assert!(volume.readdir(ROOT_INO).unwrap().is_empty());
    }

    #[test]
    fn test_scenario_encrypted_immediate_then_converted() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "encrypt", None).unwrap();
        let file = volume.create(dir.ino, "x", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        assert!(volume.is_in_scope(Some(&handle)));

        let mut pos = 0;
        assert_eq!(volume.write(&handle, &b"HELLOWORLD"[..], &mut pos).unwrap(), 10);
        assert_eq!(pos, 10);

        let expected: Vec<u8> = b"HELLOWORLD".iter().map(|b| b ^ 0x5A).collect();
        assert_eq!(stored(&volume, file.ino), expected);
        assert_eq!(volume.getattr(file.ino).unwrap().mode(), StorageMode::Immediate);
        assert_eq!(read_all(&volume, &handle, 10), b"HELLOWORLD");

        let tail: Vec<u8> = (0..55u8).map(|i| b'a' + (i % 26)).collect();
        assert_eq!(volume.write(&handle, &tail[..], &mut pos).unwrap(), 55);
        assert_eq!(pos, 65);

        let inode = volume.getattr(file.ino).unwrap();
        assert_eq!(inode.mode(), StorageMode::Regular);
        assert_eq!(inode.attrs.size, 65);

        let mut full = b"HELLOWORLD".to_vec();
        full.extend_from_slice(&tail);
        assert_eq!(read_all(&volume, &handle, 65), full);

        let expected: Vec<u8> = full.iter().map(|b| b ^ 0x5A).collect();
        assert_eq!(stored(&volume, file.ino), expected);
    }

    #[test]
    fn test_plain_file_is_stored_verbatim() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "notes", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        assert!(!volume.is_in_scope(Some(&handle)));

        let mut pos = 0;
        volume.write(&handle, &b"plain text"[..], &mut pos).unwrap();
        assert_eq!(stored(&volume, file.ino), b"plain text");
        assert_eq!(read_all(&volume, &handle, 10), b"plain text");
    }

    #[test]
    fn test_nested_dir_under_encrypt_is_plain() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "encrypt", None).unwrap();
        let sub = volume.mkdir(dir.ino, "sub", None).unwrap();
        let file = volume.create(sub.ino, "y", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();

        let mut pos = 0;
        volume.write(&handle, &b"abc"[..], &mut pos).unwrap();
        assert_eq!(stored(&volume, file.ino), b"abc");
    }

    #[test]
    fn test_boundary_exactly_once() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "f", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();

        let mut pos = 0;
        volume.write(&handle, &vec![b'q'; 59][..], &mut pos).unwrap();
        assert_eq!(volume.getattr(file.ino).unwrap().mode(), StorageMode::Immediate);
        assert_eq!(volume.backend().allocated_blocks(), 0);

        volume.write(&handle, &b"!"[..], &mut pos).unwrap();
        let inode = volume.getattr(file.ino).unwrap();
        assert_eq!(inode.mode(), StorageMode::Regular);
        assert_eq!(inode.attrs.size, 60);
        assert_eq!(volume.backend().allocated_blocks(), 1);

        let mut expected = vec![b'q'; 59];
        expected.push(b'!');
        assert_eq!(read_all(&volume, &handle, 100), expected);

        // Further writes stay on the block path
        volume.write(&handle, &b"??"[..], &mut pos).unwrap();
        assert_eq!(volume.backend().allocated_blocks(), 1);
        assert_eq!(volume.getattr(file.ino).unwrap().attrs.size, 62);
    }

    #[test]
    fn test_write_at_far_offset_is_sparse() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "encrypt", None).unwrap();
        let file = volume.create(dir.ino, "sparse", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();

        let offset = 1u64 << 50;
        let mut pos = offset;
        assert_eq!(volume.write(&handle, &b"x"[..], &mut pos).unwrap(), 1);
        assert_eq!(pos, offset + 1);

        let inode = volume.getattr(file.ino).unwrap();
        assert_eq!(inode.mode(), StorageMode::Regular);
        assert_eq!(inode.attrs.size, offset + 1);
        assert_eq!(volume.backend().allocated_blocks(), 1);

        let mut out = [0xEEu8; 16];
        let mut pos = offset - 15;
        assert_eq!(volume.read(&handle, &mut out[..], 16, &mut pos).unwrap(), 16);
        assert!(out[..15].iter().all(|&b| b == 0));
        assert_eq!(out[15], b'x');

        let mut out = [0xEEu8; 8];
        let mut pos = 0;
        assert_eq!(volume.read(&handle, &mut out[..], 8, &mut pos).unwrap(), 8);
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn test_write_past_max_file_size_rejected() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "edge", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();

        let mut pos = MAX_FILE_SIZE;
        let err = volume.write(&handle, &b"x"[..], &mut pos).unwrap_err();
        assert!(matches!(err, Error::FileTooLarge(_)));
        assert_eq!(err.to_errno(), libc::EFBIG);
        assert_eq!(pos, MAX_FILE_SIZE);

        let mut pos = u64::MAX;
        assert!(matches!(
            volume.write(&handle, &b"x"[..], &mut pos),
            Err(Error::FileTooLarge(_))
        ));

        // Nothing was converted or allocated
        let inode = volume.getattr(file.ino).unwrap();
        assert_eq!(inode.mode(), StorageMode::Immediate);
        assert_eq!(inode.attrs.size, 0);
        assert_eq!(volume.backend().allocated_blocks(), 0);

        assert!(matches!(
            volume.truncate(file.ino, MAX_FILE_SIZE + 1),
            Err(Error::FileTooLarge(_))
        ));
    }

    #[test]
    fn test_short_read_clamp() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "encrypt", None).unwrap();
        let file = volume.create(dir.ino, "x", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();

        let mut pos = 0;
        volume.write(&handle, &b"0123456789"[..], &mut pos).unwrap();

        let mut out = [0xEEu8; 8];
        let mut pos = 6;
        let n = volume.read(&handle, &mut out[..], 8, &mut pos).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&out[..4], b"6789");
        assert_eq!(pos, 10);
        // Bytes past the delivered count are not touched
        assert_eq!(&out[4..], &[0xEE; 4]);
    }

    #[test]
    fn test_copy_in_failure_mutates_nothing() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "f", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        volume.sync().unwrap();

        let mut pos = 0;
        let err = volume.write(&handle, &FaultySource(5), &mut pos).unwrap_err();
        assert!(matches!(err, Error::BoundaryCopy(_)));
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!(pos, 0);
        assert_eq!(volume.getattr(file.ino).unwrap().attrs.size, 0);
    }

    #[test]
    fn test_copy_out_failure_restores_position() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "f", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&handle, &b"data"[..], &mut pos).unwrap();

        let mut pos = 0;
        let err = volume.read(&handle, &mut FaultySink, 4, &mut pos).unwrap_err();
        assert!(matches!(err, Error::BoundaryCopy(_)));
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_conversion_allocation_failure() {
        let mut config = config();
        config.storage.max_blocks = 1;
        let volume = Volume::open_in_memory(&config).unwrap();

        let hog = volume.create(ROOT_INO, "hog", None).unwrap();
        let hog_handle = volume.open_file(hog.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&hog_handle, &vec![1u8; 100][..], &mut pos).unwrap();
        assert_eq!(volume.backend().allocated_blocks(), 1);

        let file = volume.create(ROOT_INO, "small", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&handle, &b"keep"[..], &mut pos).unwrap();

        let err = volume.write(&handle, &vec![2u8; 70][..], &mut pos).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert_eq!(err.to_errno(), libc::ENOSPC);
        assert_eq!(pos, 4);

        let inode = volume.getattr(file.ino).unwrap();
        assert_eq!(inode.mode(), StorageMode::Immediate);
        assert_eq!(inode.attrs.size, 4);
        assert_eq!(read_all(&volume, &handle, 4), b"keep");
    }

    #[test]
    fn test_append_mode() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "log", None).unwrap();
        let writer = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&writer, &b"one,"[..], &mut pos).unwrap();

        let appender = volume
            .open_file(file.ino, libc::O_WRONLY | libc::O_APPEND)
            .unwrap();
        let mut pos = 0;
        volume.write(&appender, &b"two"[..], &mut pos).unwrap();
        assert_eq!(pos, 7);
        assert_eq!(read_all(&volume, &writer, 16), b"one,two");
    }

    #[test]
    fn test_truncate_immediate_and_regular() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "encrypt", None).unwrap();
        let file = volume.create(dir.ino, "t", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&handle, &b"abcdef"[..], &mut pos).unwrap();

        volume.truncate(file.ino, 3).unwrap();
        assert_eq!(read_all(&volume, &handle, 10), b"abc");

        // Growing past the inline capacity converts
        let inode = volume.truncate(file.ino, 100).unwrap();
        assert_eq!(inode.mode(), StorageMode::Regular);
        let mut expected = b"abc".to_vec();
        expected.resize(100, 0);
        assert_eq!(read_all(&volume, &handle, 200), expected);

        volume.truncate(file.ino, 2).unwrap();
        assert_eq!(read_all(&volume, &handle, 10), b"ab");
    }

    #[test]
    fn test_open_with_trunc() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "f", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&handle, &b"old contents"[..], &mut pos).unwrap();

        volume
            .open_file(file.ino, libc::O_WRONLY | libc::O_TRUNC)
            .unwrap();
        assert_eq!(volume.getattr(file.ino).unwrap().attrs.size, 0);
    }

    #[test]
    fn test_namespace_operations() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "docs", None).unwrap();
        volume.create(dir.ino, "a", None).unwrap();
        volume.symlink(dir.ino, "link", "/docs/a").unwrap();

        assert!(matches!(
            volume.create(dir.ino, "a", None),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            volume.create(dir.ino, "bad/name", None),
            Err(Error::InvalidName(_))
        ));

        let found = volume.lookup_path("/docs/a").unwrap();
        assert_eq!(volume.path_of(found.ino).as_deref(), Some("/docs/a"));
        let link = volume.lookup(dir.ino, "link").unwrap();
        assert_eq!(volume.readlink(link.ino).unwrap(), "/docs/a");

        let names: Vec<String> = volume
            .readdir(dir.ino)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "link".to_string()]);

        assert!(matches!(
            volume.rmdir(ROOT_INO, "docs"),
            Err(Error::NotEmpty(_))
        ));
        volume.unlink(dir.ino, "a").unwrap();
        volume.unlink(dir.ino, "link").unwrap();
        volume.rmdir(ROOT_INO, "docs").unwrap();
        assert!(matches!(
            volume.lookup_path("/docs"),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn test_unlink_frees_blocks() {
        let volume = volume();
        let file = volume.create(ROOT_INO, "big", None).unwrap();
        let handle = volume.open_file(file.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&handle, &vec![3u8; 3000][..], &mut pos).unwrap();
        assert_eq!(volume.backend().allocated_blocks(), 3);

        volume.release(handle.fh).unwrap();
        volume.unlink(ROOT_INO, "big").unwrap();
        assert_eq!(volume.backend().allocated_blocks(), 0);
        assert!(matches!(
            volume.getattr(file.ino),
            Err(Error::InodeNotFound(_))
        ));
    }

    #[test]
    fn test_directory_io_rejected() {
        let volume = volume();
        let dir = volume.mkdir(ROOT_INO, "d", None).unwrap();
        assert!(matches!(
            volume.open_file(dir.ino, libc::O_RDONLY),
            Err(Error::IsADirectory(_))
        ));
    }

    #[test]
    fn test_release_unknown_handle() {
        let volume = volume();
        assert!(matches!(volume.release(77), Err(Error::HandleNotFound(77))));
    }

    #[test]
    fn test_stats() {
        let volume = volume();
        volume.mkdir(ROOT_INO, "d", None).unwrap();
        let small = volume.create(ROOT_INO, "small", None).unwrap();
        let big = volume.create(ROOT_INO, "big", None).unwrap();
        let handle = volume.open_file(big.ino, libc::O_RDWR).unwrap();
        let mut pos = 0;
        volume.write(&handle, &vec![1u8; 200][..], &mut pos).unwrap();

        let stats = volume.stats();
        assert_eq!(stats.inodes, 4);
        assert_eq!(stats.directories, 2);
        assert_eq!(stats.regular_files, 1);
        assert_eq!(stats.immediate_files, 1);
        assert_eq!(stats.blocks_used, 1);
        assert_eq!(stats.open_handles, 1);
        assert!(volume.getattr(small.ino).is_ok());
    }

    #[test]
    fn test_persistent_volume_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.storage.data_dir = dir.path().to_path_buf();

        {
            let volume = Volume::open_persistent(&config).unwrap();
            let enc = volume.mkdir(ROOT_INO, "encrypt", None).unwrap();
            let small = volume.create(enc.ino, "small", None).unwrap();
            let big = volume.create(enc.ino, "big", None).unwrap();

            let h = volume.open_file(small.ino, libc::O_RDWR).unwrap();
            let mut pos = 0;
            volume.write(&h, &b"tiny"[..], &mut pos).unwrap();

            let h = volume.open_file(big.ino, libc::O_RDWR).unwrap();
            let mut pos = 0;
            volume.write(&h, &vec![b'B'; 500][..], &mut pos).unwrap();
            volume.sync().unwrap();
        }

        let volume = Volume::open_persistent(&config).unwrap();
        let small = volume.lookup_path("/encrypt/small").unwrap();
        let big = volume.lookup_path("/encrypt/big").unwrap();
        assert_eq!(small.mode(), StorageMode::Immediate);
        assert_eq!(big.mode(), StorageMode::Regular);

        let h = volume.open_file(small.ino, libc::O_RDONLY).unwrap();
        assert_eq!(read_all(&volume, &h, 10), b"tiny");
        let h = volume.open_file(big.ino, libc::O_RDONLY).unwrap();
        assert_eq!(read_all(&volume, &h, 600), vec![b'B'; 500]);
    }

    #[test]
    fn test_concurrent_writers_convert_once() {
        let volume = Arc::new(volume());
        let ino = volume.create(ROOT_INO, "shared", None).unwrap().ino;

        let threads: Vec<_> = (0..8u64)
            .map(|i| {
                let volume = Arc::clone(&volume);
                std::thread::spawn(move || {
                    let handle = volume.open_file(ino, libc::O_RDWR).unwrap();
                    let mut pos = i * 10;
                    volume.write(&handle, &[b'0' + i as u8; 10][..], &mut pos).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let inode = volume.getattr(ino).unwrap();
        assert_eq!(inode.mode(), StorageMode::Regular);
        assert_eq!(inode.attrs.size, 80);
        assert_eq!(volume.backend().allocated_blocks(), 1);

        let handle = volume.open_file(ino, libc::O_RDONLY).unwrap();
        let content = read_all(&volume, &handle, 80);
        for i in 0..8usize {
            assert!(content[i * 10..(i + 1) * 10].iter().all(|&b| b == b'0' + i as u8));
        }
    }
}
