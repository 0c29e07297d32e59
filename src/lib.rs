//! ImmCryptFS - FUSE filesystem with inline small files and
//! directory-scoped obfuscation
//!
//! Files directly inside one designated directory under the root are
//! stored XOR-obfuscated. Small files keep their bytes inside the inode
//! until a write reaches the inline capacity, at which point they are
//! converted to block storage.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod metadata;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{ImmCryptFs, Volume};
    pub use crate::metadata::Inode;
}
