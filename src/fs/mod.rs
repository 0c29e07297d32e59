//! FUSE filesystem implementation
//!
//! [`Volume`] holds the namespace and routes every read and write through
//! directory-scoped obfuscation and the inline/block storage split.
//! [`ImmCryptFs`] exposes a volume to the kernel.

pub mod boundary;
pub mod scope;

mod filesystem;
mod handle;
mod volume;

pub use boundary::{StagingBuffer, UserSink, UserSource};
pub use filesystem::ImmCryptFs;
pub use handle::{FileHandle, HandleManager};
pub use scope::ScopeResolver;
pub use volume::{DirEntry, Volume, VolumeStats};
