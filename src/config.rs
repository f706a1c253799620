use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PanError, Result};
use crate::state::dir_cache::Ttl;

/// Default size of one fetch window. Must stay a multiple of 512.
pub const DEFAULT_BLOCK_SIZE: u64 = 5 * 1024 * 1024;

/// Bytes streamed into a shadow file between cancellation checks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "panfs", about = "Mount a cloud-storage account as a filesystem")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount the remote account
    Mount {
        /// Path to the mount point
        mountpoint: PathBuf,

        /// Remote directory under which new objects may be created
        #[arg(long, default_value = "/apps/panfs")]
        app_root: String,

        /// Local directory holding shadow copies of remote files
        #[arg(long, default_value = "/tmp/.panfs/data")]
        shadow_dir: PathBuf,

        /// Seconds before a cached directory listing is re-fetched (-1 = never)
        #[arg(long, default_value_t = 3600, allow_negative_numbers = true)]
        dir_ttl_secs: i64,

        /// Bytes requested per fetch window
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,

        /// Seconds before a stalled fetch window is abandoned
        #[arg(long, default_value_t = 60)]
        read_timeout_secs: u64,

        /// Maximum number of reads served concurrently
        #[arg(long, default_value_t = 20)]
        workers: usize,

        /// Seconds between sweeps of expired cache entries
        #[arg(long, default_value_t = 60)]
        sweep_interval_secs: u64,

        /// Log file path
        #[arg(long, default_value = "/tmp/panfs.log")]
        log_file: PathBuf,

        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Authorize this machine and store the access token
    Login {
        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Unmount a panfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// Token file path (defaults to ~/.panfs/.access_token)
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// OAuth client id of the registered application
    #[arg(long, env = "PANFS_CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// OAuth client secret of the registered application
    #[arg(long, env = "PANFS_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    pub client_secret: String,
}

impl AuthArgs {
    pub fn token_path(&self) -> PathBuf {
        self.token_file.clone().unwrap_or_else(default_token_path)
    }
}

pub fn default_token_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    home.join(".panfs").join(".access_token")
}

#[derive(Debug, Clone)]
pub struct PanConfig {
    pub mountpoint: PathBuf,
    pub app_root: String,
    pub shadow_dir: PathBuf,
    pub dir_ttl: Ttl,
    pub block_size: u64,
    pub chunk_size: usize,
    pub read_timeout: Duration,
    pub workers: usize,
    pub sweep_interval: Duration,
    pub log_file: PathBuf,
}

impl PanConfig {
    /// Configuration with the CLI defaults, rooted at the given shadow directory.
    pub fn with_shadow_dir(shadow_dir: PathBuf) -> Self {
        Self {
            mountpoint: PathBuf::new(),
            app_root: "/apps/panfs".to_string(),
            shadow_dir,
            dir_ttl: Ttl::For(Duration::from_secs(3600)),
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: Duration::from_secs(60),
            workers: 20,
            sweep_interval: Duration::from_secs(60),
            log_file: PathBuf::from("/tmp/panfs.log"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 512 != 0 {
            return Err(PanError::Config(format!(
                "block size {} is not a positive multiple of 512",
                self.block_size
            )));
        }
        if !self.app_root.starts_with('/') {
            return Err(PanError::Config(format!(
                "app root {:?} must be an absolute remote path",
                self.app_root
            )));
        }
        if self.chunk_size == 0 {
            return Err(PanError::Config("chunk size must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(PanError::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Convert the CLI ttl convention (-1 = never) into a [`Ttl`].
pub fn ttl_from_secs(secs: i64) -> Ttl {
    if secs < 0 {
        Ttl::Never
    } else {
        Ttl::For(Duration::from_secs(secs as u64))
    }
}
