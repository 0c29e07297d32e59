//! Immediate (inline) file storage
//!
//! Small files keep their bytes inside the inode. A write that would reach
//! the inline capacity converts the file to block-mapped storage first; the
//! caller then finishes the write on the block path. Conversion is one-way.

use super::{BlockMap, StorageBackend};
use crate::crypto::XorCipher;
use crate::error::{Error, Result};
use crate::metadata::{FileData, InlineData, Inode, InodeData, InodeTable};
use tracing::{debug, info};

/// Outcome of an inline write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineWrite {
    /// Bytes stored inline
    Stored(usize),
    /// The file was converted; nothing was written and the caller must
    /// retry on the block-mapped path
    Converted,
}

/// Inline read, inline write, and conversion for immediate files
pub struct ImmediateEngine<'a> {
    backend: &'a dyn StorageBackend,
    inodes: &'a InodeTable,
}

fn inline_mut(inode: &mut Inode) -> Result<&mut InlineData> {
    match &mut inode.data {
        InodeData::File(FileData::Immediate(inline)) => Ok(inline),
        _ => Err(Error::Internal(format!(
            "ino {} is not an immediate file",
            inode.ino
        ))),
    }
}

fn inline_ref(inode: &Inode) -> Result<&InlineData> {
    match &inode.data {
        InodeData::File(FileData::Immediate(inline)) => Ok(inline),
        _ => Err(Error::Internal(format!(
            "ino {} is not an immediate file",
            inode.ino
        ))),
    }
}

impl<'a> ImmediateEngine<'a> {
    pub fn new(backend: &'a dyn StorageBackend, inodes: &'a InodeTable) -> Self {
        ImmediateEngine { backend, inodes }
    }

    /// Copy up to `buf.len()` bytes from `*pos`, clamped to the file size.
    /// Advances `*pos` by the number of bytes delivered.
    pub fn read(&self, inode: &Inode, buf: &mut [u8], pos: &mut u64) -> Result<usize> {
        let inline = inline_ref(inode)?;
        let size = inode.attrs.size;
        if *pos >= size {
            return Ok(0);
        }
        let start = *pos as usize;
        let n = buf.len().min((size - *pos) as usize);
        buf[..n].copy_from_slice(&inline.as_slice()[start..start + n]);
        *pos += n as u64;
        Ok(n)
    }

    /// Store `buf` at `*pos` inline, obfuscating it first when `cipher` is
    /// given. Converts the file instead when the write would end at or past
    /// the inline capacity.
    ///
    /// The size grows to `max(size, pos + len)`.
    pub fn write(
        &self,
        inode: &mut Inode,
        buf: &mut [u8],
        pos: &mut u64,
        cipher: Option<&XorCipher>,
    ) -> Result<InlineWrite> {
        let capacity = inline_ref(inode)?.capacity() as u64;
        let end = pos.saturating_add(buf.len() as u64);
        if end >= capacity {
            self.convert(inode)?;
            return Ok(InlineWrite::Converted);
        }

        if let Some(cipher) = cipher {
            cipher.encrypt(buf, *pos);
        }
        let start = *pos as usize;
        let inline = inline_mut(inode)?;
        inline.as_mut_slice()[start..start + buf.len()].copy_from_slice(buf);

        *pos = end;
        if end > inode.attrs.size {
            inode.set_size(end);
        } else {
            inode.attrs.touch();
        }
        self.inodes.mark_dirty(inode.ino);
        debug!("inline write ino={} len={} size={}", inode.ino, buf.len(), inode.attrs.size);
        Ok(InlineWrite::Stored(buf.len()))
    }

    /// Move an immediate file's content into a freshly allocated block.
    ///
    /// Stored bytes are copied verbatim: they are already in their on-disk
    /// (possibly obfuscated) form. An empty file gets an empty block map.
    /// If allocation or the block write fails the inode is left untouched
    /// in immediate mode.
    pub fn convert(&self, inode: &mut Inode) -> Result<()> {
        let size = inode.attrs.size as usize;
        let snapshot = inline_ref(inode)?.as_slice()[..size].to_vec();

        let map = if size == 0 {
            BlockMap::new()
        } else {
            let first = self.backend.allocate_block(inode.ino)?;
            let mut block = vec![0u8; self.backend.block_size()];
            block[..size].copy_from_slice(&snapshot);
            if let Err(e) = self.backend.write_block(first, &block) {
                let _ = self.backend.free_block(first);
                return Err(e);
            }
            BlockMap::with_first(first)
        };

        inode.data = InodeData::File(FileData::Regular(map));
        inode.update_block_count();
        inode.attrs.touch();
        self.inodes.mark_dirty(inode.ino);

        info!(
            "Converted ino {} from immediate to block storage ({} bytes)",
            inode.ino, size
        );
        Ok(())
    }

    /// Set the size of an immediate file. Returns `false` without changing
    /// anything when `new_size` does not fit inline.
    pub fn resize(&self, inode: &mut Inode, new_size: u64) -> Result<bool> {
        let size = inode.attrs.size;
        let inline = inline_mut(inode)?;
        if new_size >= inline.capacity() as u64 {
            return Ok(false);
        }
        if new_size < size {
            inline.as_mut_slice()[new_size as usize..size as usize].fill(0);
        }
        inode.set_size(new_size);
        self.inodes.mark_dirty(inode.ino);
        Ok(true)
    }
}
