//! ImmCryptFS - inline small files with directory-scoped obfuscation
//!
//! Usage:
//!   immcryptfs init                  - Write a default configuration
//!   immcryptfs mount <mount_point>   - Mount the filesystem
//!   immcryptfs status                - Show volume status
//!   immcryptfs put <path> <source>   - Copy a host file into the volume
//!   immcryptfs cat <path>            - Print a file from the volume
//!   immcryptfs mkdir <path>          - Create a directory in the volume
//!   immcryptfs ls <path>             - List a directory in the volume

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use immcryptfs::{
    config::Config,
    fs::{ImmCryptFs, Volume},
    metadata::{FileType, ROOT_INO},
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Chunk size for CLI copies
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "immcryptfs")]
#[command(version = "0.1.0")]
#[command(about = "FUSE filesystem with inline small files and directory-scoped obfuscation")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/immcryptfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Name of the obfuscated directory under the root
        #[arg(long)]
        encrypted_dir: Option<String>,

        /// Key as a hex string
        #[arg(long)]
        key: Option<String>,

        /// Inline capacity of new files in bytes
        #[arg(long)]
        immediate_size: Option<usize>,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point
        mount_point: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Show volume status
    Status,

    /// Copy a host file into the volume
    Put {
        /// Destination path inside the volume
        path: String,

        /// Source file on the host
        source: PathBuf,
    },

    /// Print a file from the volume to stdout
    Cat {
        /// Path inside the volume
        path: String,
    },

    /// Create a directory in the volume
    Mkdir {
        /// Path inside the volume
        path: String,
    },

    /// List a directory in the volume
    Ls {
        /// Path inside the volume
        #[arg(default_value = "/")]
        path: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init {
            encrypted_dir,
            key,
            immediate_size,
        } => cmd_init(config_path, encrypted_dir, key, immediate_size),

        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(config_path, mount_point, allow_other),

        Commands::Status => cmd_status(config_path),

        Commands::Put { path, source } => cmd_put(config_path, &path, &source),

        Commands::Cat { path } => cmd_cat(config_path, &path),

        Commands::Mkdir { path } => cmd_mkdir(config_path, &path),

        Commands::Ls { path } => cmd_ls(config_path, &path),
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load(config_path)
        .with_context(|| format!("Loading {:?} (run 'immcryptfs init' first)", config_path))
}

fn open_volume(config_path: &Path) -> anyhow::Result<Volume> {
    let config = load_config(config_path)?;
    Volume::open_persistent(&config)
        .with_context(|| format!("Opening volume in {:?}", config.storage.data_dir))
}

/// Split `/a/b/c` into (`/a/b`, `c`)
fn split_path(path: &str) -> anyhow::Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        None if !trimmed.is_empty() => Ok(("", trimmed)),
        _ => bail!("Not a file path: {:?}", path),
    }
}

fn cmd_init(
    config_path: &Path,
    encrypted_dir: Option<String>,
    key: Option<String>,
    immediate_size: Option<usize>,
) -> anyhow::Result<()> {
    info!("Initializing ImmCryptFS...");

    let mut config = Config::default();
    if let Some(dir) = encrypted_dir {
        config.crypt.encrypted_dir = dir;
    }
    if let Some(key) = key {
        config.crypt.key = hex::decode(key.trim()).context("Key must be a hex string")?;
    }
    if let Some(size) = immediate_size {
        config.storage.immediate_file_size = size;
    }
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration written to {:?}", config_path);
    info!(
        "Files directly inside /{} will be obfuscated",
        config.crypt.encrypted_dir
    );
    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    allow_other: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let mount_point = mount_point.unwrap_or_else(|| config.mount.mount_point.clone());

    let volume = Volume::open_persistent(&config)?;
    let fs = ImmCryptFs::new(volume);

    std::fs::create_dir_all(&mount_point)?;

    info!("Mounting at {:?}", mount_point);

    let mut options = vec![
        fuser::MountOption::FSName("immcryptfs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if allow_other || config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    fuser::mount2(fs, &mount_point, &options)
        .with_context(|| format!("Mounting at {:?}", mount_point))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let volume = Volume::open_persistent(&config)?;
    let stats = volume.stats();

    println!("ImmCryptFS Status");
    println!("=================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.storage.data_dir);
    println!("Obfuscated directory: /{}", config.crypt.encrypted_dir);
    println!("Key length: {} byte(s)", config.crypt.key.len());
    println!("Immediate file size: {} bytes", config.storage.immediate_file_size);
    println!("Block size: {} bytes", config.storage.block_size);
    println!();
    println!("Inodes: {}", stats.inodes);
    println!("  Directories: {}", stats.directories);
    println!("  Immediate files: {}", stats.immediate_files);
    println!("  Regular files: {}", stats.regular_files);
    println!("  Symlinks: {}", stats.symlinks);
    if stats.max_blocks == 0 {
        println!("Blocks used: {}", stats.blocks_used);
    } else {
        println!("Blocks used: {} / {}", stats.blocks_used, stats.max_blocks);
    }

    Ok(())
}

fn cmd_put(config_path: &Path, path: &str, source: &Path) -> anyhow::Result<()> {
    let volume = open_volume(config_path)?;
    let (parent_path, name) = split_path(path)?;
    let parent = volume.lookup_path(parent_path)?;

    let ino = match volume.lookup(parent.ino, name) {
        Ok(existing) => existing.ino,
        Err(immcryptfs::Error::PathNotFound(_)) => volume.create(parent.ino, name, None)?.ino,
        Err(e) => return Err(e.into()),
    };
    let handle = volume.open_file(ino, libc::O_WRONLY | libc::O_TRUNC)?;

    let mut input =
        std::fs::File::open(source).with_context(|| format!("Opening {:?}", source))?;
    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut pos = 0u64;
    loop {
        let n = input.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let mut done = 0;
        while done < n {
            let written = volume.write(&handle, &chunk[done..n], &mut pos)?;
            if written == 0 {
                bail!("Volume accepted no bytes at offset {}", pos);
            }
            done += written;
        }
    }

    volume.release(handle.fh)?;
    volume.sync()?;
    info!("Wrote {} bytes to {}", pos, path);
    Ok(())
}

fn cmd_cat(config_path: &Path, path: &str) -> anyhow::Result<()> {
    let volume = open_volume(config_path)?;
    let inode = volume.lookup_path(path)?;
    let handle = volume.open_file(inode.ino, libc::O_RDONLY)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut pos = 0u64;
    loop {
        let n = volume.read(&handle, &mut chunk[..], COPY_CHUNK, &mut pos)?;
        if n == 0 {
            break;
        }
        out.write_all(&chunk[..n])?;
    }
    out.flush()?;

    volume.release(handle.fh)?;
    Ok(())
}

fn cmd_mkdir(config_path: &Path, path: &str) -> anyhow::Result<()> {
    let volume = open_volume(config_path)?;
    let (parent_path, name) = split_path(path)?;
    let parent = volume.lookup_path(parent_path)?;
    let dir = volume.mkdir(parent.ino, name, None)?;
    volume.sync()?;
    info!("Created directory {} (ino {})", path, dir.ino);
    Ok(())
}

fn cmd_ls(config_path: &Path, path: &str) -> anyhow::Result<()> {
    let volume = open_volume(config_path)?;
    let dir = volume.lookup_path(path)?;

    for entry in volume.readdir(dir.ino)? {
        let inode = volume.getattr(entry.ino)?;
        let kind = match entry.kind {
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::RegularFile => '-',
        };
        println!(
            "{}{:o} {:>10} {:<9} {}",
            kind,
            inode.attrs.perm,
            inode.attrs.size,
            format!("{:?}", inode.mode()).to_lowercase(),
            entry.name
        );
    }
    if dir.ino == ROOT_INO && volume.readdir(ROOT_INO)?.is_empty() {
        info!("Volume is empty");
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
