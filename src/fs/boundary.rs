//! Caller memory boundary
//!
//! Reads and writes never transform caller memory in place. Bytes are
//! copied into a private [`StagingBuffer`], transformed there, and copied
//! back out. Either copy may fail.

use crate::error::{Error, Result};

/// Caller-owned bytes to be written
pub trait UserSource {
    /// Number of bytes offered
    fn len(&self) -> usize;

    /// Copy all offered bytes into `dest` (`dest.len() == self.len()`)
    fn copy_in(&self, dest: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-owned memory that receives read bytes
pub trait UserSink {
    /// Bytes the caller can accept
    fn capacity(&self) -> usize;

    /// Copy `src` into the start of the caller's memory
    fn copy_out(&mut self, src: &[u8]) -> Result<()>;
}

impl UserSource for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_in(&self, dest: &mut [u8]) -> Result<()> {
        if dest.len() != <[u8]>::len(self) {
            return Err(Error::BoundaryCopy(format!(
                "source has {} bytes, staging buffer {}",
                <[u8]>::len(self),
                dest.len()
            )));
        }
        dest.copy_from_slice(self);
        Ok(())
    }
}

impl UserSink for [u8] {
    fn capacity(&self) -> usize {
        self.len()
    }

    fn copy_out(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.len() {
            return Err(Error::BoundaryCopy(format!(
                "{} bytes do not fit in a {}-byte destination",
                src.len(),
                self.len()
            )));
        }
        self[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Private working buffer for one read or write.
///
/// Buffers for obfuscated reads carry one extra byte past the payload so
/// the decrypt terminator always has a slot.
#[derive(Debug)]
pub struct StagingBuffer {
    bytes: Vec<u8>,
    len: usize,
}

impl StagingBuffer {
    /// Buffer of exactly `len` bytes
    pub fn for_write(len: usize) -> Self {
        StagingBuffer {
            bytes: vec![0u8; len],
            len,
        }
    }

    /// Buffer of `len` bytes, plus a terminator slot when `terminated`
    pub fn for_read(len: usize, terminated: bool) -> Self {
        StagingBuffer {
            bytes: vec![0u8; len + usize::from(terminated)],
            len,
        }
    }

    /// Stage caller bytes for a write
    pub fn stage<S: UserSource + ?Sized>(src: &S) -> Result<Self> {
        let mut staged = StagingBuffer::for_write(src.len());
        src.copy_in(staged.payload_mut())?;
        Ok(staged)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    /// The whole allocation, including any terminator slot
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Shorten the payload (after a short read)
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}
