//! Error types for immcryptfs

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the volume and its backends
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Copy between caller memory and a staging buffer failed
    #[error("Boundary copy failed: {0}")]
    BoundaryCopy(String),

    /// No free block could be allocated
    #[error("Block allocation failed: {0}")]
    AllocationFailed(String),

    /// Write or truncate would put data past the largest supported offset
    #[error("File too large: offset {0}")]
    FileTooLarge(u64),

    /// Inode does not exist
    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    /// File handle is not open
    #[error("File handle not found: {0}")]
    HandleNotFound(u64),

    /// Path could not be resolved
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Operation needs a directory
    #[error("Not a directory: {0}")]
    NotADirectory(u64),

    /// Operation needs a regular file
    #[error("Is a directory: {0}")]
    IsADirectory(u64),

    /// Operation needs a regular file but got something else
    #[error("Not a regular file: {0}")]
    NotAFile(u64),

    /// Name already taken in the parent directory
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has entries
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Name is empty, too long, or contains a separator
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Configuration could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Encoding a record failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Decoding a record failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map onto the errno the FUSE host replies with
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::AllocationFailed(_) => libc::ENOSPC,
            Error::FileTooLarge(_) => libc::EFBIG,
            Error::InodeNotFound(_) | Error::PathNotFound(_) => libc::ENOENT,
            Error::HandleNotFound(_) => libc::EBADF,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidName(_) | Error::NotAFile(_) => libc::EINVAL,
            Error::InvalidConfig(_) | Error::Config(_) => libc::EINVAL,
            Error::BoundaryCopy(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Storage(_)
            | Error::Internal(_) => libc::EIO,
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Io(io) => Error::Io(io),
            other => Error::Storage(other.to_string()),
        }
    }
}
