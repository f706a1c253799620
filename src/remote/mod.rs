//! Boundary to the remote storage account.
//!
//! The filesystem core only talks to [`RemoteClient`]; the HTTP implementation
//! lives in [`xpan`] and tests substitute an in-memory one.

pub mod token;
pub mod xpan;

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteEntry {
    pub fs_id: u64,
    pub path: String,
    #[serde(rename = "server_filename")]
    pub filename: String,
    #[serde(default, deserialize_with = "flag")]
    pub isdir: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub server_ctime: i64,
    #[serde(default)]
    pub server_mtime: i64,
    #[serde(default)]
    pub local_ctime: i64,
    #[serde(default)]
    pub local_mtime: i64,
    #[serde(default)]
    pub md5: Option<String>,
}

/// Metadata for a single file, including the short-lived download link.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteMeta {
    pub fs_id: u64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub dlink: String,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub server_mtime: i64,
    #[serde(default, deserialize_with = "flag")]
    pub isdir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
}

impl Quota {
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// Payload uploaded in place of an empty file; the remote refuses zero-byte objects.
pub const PLACEHOLDER_PAYLOAD: &[u8] = b"panfs-placeholder\n";

/// Operations the filesystem needs from the remote store.
///
/// Every call may block on network I/O. Implementations own authentication
/// and retries; callers see only the outcome.
pub trait RemoteClient: Send + Sync {
    /// List the direct children of a remote directory, in server order.
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Fetch metadata (including the download link) for one file.
    fn meta(&self, path: &str, fs_id: u64) -> Result<RemoteMeta>;

    /// Open a ranged download. `end == None` requests everything from `start`.
    fn fetch_range(&self, url: &str, start: u64, end: Option<u64>) -> Result<Box<dyn Read + Send>>;

    /// Create a non-empty stand-in object at `path` and return its id.
    fn create_placeholder(&self, path: &str) -> Result<u64>;

    /// Upload a local file to `path`, replacing any existing object, and return the new id.
    fn upload(&self, path: &str, local: &Path) -> Result<u64>;

    /// Create a remote directory and return its id.
    fn mkdir(&self, path: &str) -> Result<u64>;

    fn delete(&self, paths: &[String]) -> Result<()>;

    /// Rename in place, keeping the parent directory. An object already at
    /// the destination is replaced.
    fn rename(&self, path: &str, new_name: &str) -> Result<()>;

    /// Move into another directory, possibly under a new name, replacing any
    /// object already at the destination.
    fn move_to(&self, path: &str, dest_dir: &str, new_name: &str) -> Result<()>;

    fn quota(&self) -> Result<Quota>;
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Int(i64),
        Bool(bool),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Int(v) => v != 0,
        Flag::Bool(b) => b,
    })
}

/// Join a remote directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent directory of a remote path (`/` for top-level entries).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

