//! FUSE filesystem implementation
//!
//! Thin adapter from kernel requests to [`Volume`] operations. Errors are
//! reported to the kernel as errno values.

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, EINVAL};
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::volume::Volume;
use crate::error::Error;
use crate::metadata::{FileType, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);

/// Longest name reported through statfs
const NAME_MAX: u32 = 255;

/// FUSE filesystem over a [`Volume`]
pub struct ImmCryptFs {
    volume: Volume,
}

fn name_str(name: &OsStr) -> Result<&str, c_int> {
    name.to_str().ok_or(EINVAL)
}

impl ImmCryptFs {
    pub fn new(volume: Volume) -> Self {
        ImmCryptFs { volume }
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    fn attr(&self, ino: u64) -> Result<FileAttr, Error> {
        Ok(self.volume.getattr(ino)?.to_fuser())
    }

    fn reply_err(op: &str, e: &Error) -> c_int {
        let errno = e.to_errno();
        match e {
            Error::PathNotFound(_) | Error::InodeNotFound(_) => {
                debug!("{}: {}", op, e)
            }
            _ => error!("{} failed: {}", op, e),
        }
        errno
    }
}

impl Filesystem for ImmCryptFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("Filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("Filesystem shutting down, flushing metadata");
        if let Err(e) = self.volume.sync() {
            error!("Final sync failed: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.volume.lookup(parent, name) {
            Ok(inode) => reply.entry(&TTL, &inode.to_fuser(), 0),
            Err(e) => reply.error(Self::reply_err("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(Self::reply_err("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?})", ino, size);

        let result = match size {
            Some(size) => self.volume.truncate(ino, size).map(|inode| inode.to_fuser()),
            None => self.attr(ino),
        };
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(Self::reply_err("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.volume.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(Self::reply_err("readlink", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        let perm = (mode & !umask & 0o7777) as u16;

        match self.volume.mkdir(parent, name, Some(perm)) {
            Ok(inode) => reply.entry(&TTL, &inode.to_fuser(), 0),
            Err(e) => reply.error(Self::reply_err("mkdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (name, target) = match (name_str(link_name), target.to_str()) {
            (Ok(n), Some(t)) => (n, t),
            _ => return reply.error(EINVAL),
        };

        match self.volume.symlink(parent, name, target) {
            Ok(inode) => reply.entry(&TTL, &inode.to_fuser(), 0),
            Err(e) => reply.error(Self::reply_err("symlink", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self.volume.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::reply_err("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self.volume.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::reply_err("rmdir", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.volume.open_file(ino, flags) {
            Ok(handle) => reply.opened(handle.fh, 0),
            Err(e) => reply.error(Self::reply_err("open", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        let perm = (mode & !umask & 0o7777) as u16;

        let result = self.volume.create(parent, name, Some(perm)).and_then(|inode| {
            let handle = self.volume.open_file(inode.ino, flags)?;
            Ok((inode, handle))
        });
        match result {
            Ok((inode, handle)) => reply.created(&TTL, &inode.to_fuser(), 0, handle.fh, 0),
            Err(e) => reply.error(Self::reply_err("create", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let result = self.volume.handle(fh).and_then(|handle| {
            let mut buf = vec![0u8; size as usize];
            let mut pos = offset as u64;
            let n = self.volume.read(&handle, &mut buf[..], size as usize, &mut pos)?;
            buf.truncate(n);
            Ok(buf)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(Self::reply_err("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let result = self.volume.handle(fh).and_then(|handle| {
            let mut pos = offset as u64;
            self.volume.write(&handle, data, &mut pos)
        });
        match result {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(Self::reply_err("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        match self.volume.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::reply_err("flush", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={})", ino, fh);
        match self.volume.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::reply_err("fsync", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        match self.volume.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::reply_err("release", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let (parent, entries) = match self
            .volume
            .getattr(ino)
            .and_then(|dir| Ok((dir.parent, self.volume.readdir(ino)?)))
        {
            Ok(v) => v,
            Err(e) => return reply.error(Self::reply_err("readdir", &e)),
        };

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (
                if ino == ROOT_INO { ROOT_INO } else { parent },
                FileType::Directory,
                "..".to_string(),
            ),
        ];
        listing.extend(entries.into_iter().map(|e| (e.ino, e.kind, e.name)));

        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(offset as usize) {
            // Offset of the next entry
            if reply.add(entry_ino, (i + 1) as i64, kind.to_fuser(), &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.volume.stats();
        let bsize = self.volume.backend().block_size() as u32;
        let (blocks, bfree) = if stats.max_blocks == 0 {
            (u64::MAX / 2, u64::MAX / 2 - stats.blocks_used)
        } else {
            (
                stats.max_blocks,
                stats.max_blocks.saturating_sub(stats.blocks_used),
            )
        };

        reply.statfs(
            blocks,
            bfree,
            bfree,
            stats.inodes as u64 + 1_000_000,
            1_000_000,
            bsize,
            NAME_MAX,
            bsize,
        );
    }
}
