/// Attribute helpers for FUSE replies.
/// These convert entity records into `fuser` types.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, INodeNo};

use crate::state::entities::{FileRecord, ROOT_INO};

pub const BLOCK_SIZE: u32 = 512;

/// Filesystem-neutral view of an entry's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub is_dir: bool,
    pub ctime: i64,
    pub mtime: i64,
}

impl Attr {
    pub fn root() -> Self {
        Self {
            ino: ROOT_INO,
            size: 0,
            is_dir: true,
            ctime: 0,
            mtime: 0,
        }
    }

    pub fn of(record: &FileRecord) -> Self {
        Self {
            ino: record.ino(),
            size: record.size,
            is_dir: record.is_dir,
            ctime: record.server_ctime,
            mtime: record.mtime(),
        }
    }

    pub fn kind(&self) -> FileType {
        if self.is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        }
    }

    pub fn to_file_attr(&self) -> FileAttr {
        let mtime = system_time_from_secs(self.mtime);
        let ctime = system_time_from_secs(self.ctime);
        FileAttr {
            ino: INodeNo(self.ino),
            size: self.size,
            blocks: self.size.div_ceil(BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime,
            crtime: ctime,
            kind: self.kind(),
            perm: 0o755,
            nlink: if self.is_dir { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn system_time_from_secs(sec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::from_secs(sec as u64)
    } else {
        UNIX_EPOCH
    }
}

/// Seconds since the epoch for a `SystemTime`, clamped at zero.
pub fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
