//! Configuration management for immcryptfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the top-level directory whose files are obfuscated
pub const DEFAULT_ENCRYPTED_DIR: &str = "encrypt";

/// Default obfuscation key
pub const DEFAULT_KEY: u8 = 0x5A;

/// Inline capacity of an immediate file: the 15 x 4-byte block pointer area
pub const DEFAULT_IMMEDIATE_FILE_SIZE: usize = 60;

/// Default block size: 1KB
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Longest key pattern accepted
pub const MAX_KEY_LEN: usize = 32;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Obfuscation configuration
    pub crypt: CryptConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Directory-scoped obfuscation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptConfig {
    /// Directory directly under the root whose files are obfuscated
    pub encrypted_dir: String,

    /// Key byte pattern
    #[serde(with = "hex_serde")]
    pub key: Vec<u8>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bytes a file may hold inline before it is converted to block storage
    pub immediate_file_size: usize,

    /// Block size in bytes
    pub block_size: usize,

    /// Maximum number of data blocks (0 = unlimited)
    pub max_blocks: u64,

    /// Directory holding the sled database
    pub data_dir: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Default file permissions
    pub default_file_mode: u32,

    /// Default directory permissions
    pub default_dir_mode: u32,

    /// UID for files
    pub uid: u32,

    /// GID for files
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            crypt: CryptConfig::default(),
            storage: StorageConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Default for CryptConfig {
    fn default() -> Self {
        CryptConfig {
            encrypted_dir: DEFAULT_ENCRYPTED_DIR.to_string(),
            key: vec![DEFAULT_KEY],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("immcryptfs");

        StorageConfig {
            immediate_file_size: DEFAULT_IMMEDIATE_FILE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: 0,
            data_dir,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/immcryptfs"),
            allow_other: false,
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("IMMCRYPTFS_ENCRYPTED_DIR") {
            let dir = dir.trim().to_string();
            if !dir.is_empty() {
                self.crypt.encrypted_dir = dir;
            }
        }

        if let Ok(key) = std::env::var("IMMCRYPTFS_KEY") {
            if let Ok(bytes) = hex::decode(key.trim()) {
                if !bytes.is_empty() {
                    self.crypt.key = bytes;
                }
            }
        }

        if let Ok(data_dir) = std::env::var("IMMCRYPTFS_DATA_DIR") {
            let data_dir = data_dir.trim();
            if !data_dir.is_empty() {
                self.storage.data_dir = PathBuf::from(data_dir);
            }
        }

        if let Ok(size) = std::env::var("IMMCRYPTFS_IMMEDIATE_SIZE") {
            if let Ok(size) = size.trim().parse::<usize>() {
                self.storage.immediate_file_size = size;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let dir = &self.crypt.encrypted_dir;
        if dir.is_empty() || dir.contains('/') || dir == "." || dir == ".." {
            return Err(Error::InvalidConfig(format!(
                "Encrypted directory name is not a single path component: {:?}",
                dir
            )));
        }

        if self.crypt.key.is_empty() {
            return Err(Error::InvalidConfig("Key must not be empty".to_string()));
        }

        if self.crypt.key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidConfig(format!(
                "Key is {} bytes, at most {} allowed",
                self.crypt.key.len(),
                MAX_KEY_LEN
            )));
        }

        let block_size = self.storage.block_size;
        if !block_size.is_power_of_two() || !(512..=65536).contains(&block_size) {
            return Err(Error::InvalidConfig(format!(
                "Block size must be a power of two between 512 and 65536, got {}",
                block_size
            )));
        }

        // A conversion snapshot has to fit in the first allocated block
        let immediate = self.storage.immediate_file_size;
        if immediate == 0 || immediate > block_size {
            return Err(Error::InvalidConfig(format!(
                "Immediate file size must be in 1..={}, got {}",
                block_size, immediate
            )));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage.data_dir)?;
        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}
