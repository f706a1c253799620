use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    AccessFlags, BsdFileFlags, Errno, FileHandle, Filesystem, FopenFlags, Generation, INodeNo,
    KernelConfig, LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, RenameFlags, Request, TimeOrNow,
    WriteFlags,
};
use tracing::info;

use super::attr::unix_secs;
use super::workers::WorkerPool;
use super::{Closed, PanFs};

const TTL: Duration = Duration::from_secs(1);

/// Names arrive as raw bytes; remote paths are UTF-8.
fn utf8_name(name: &OsStr) -> Result<&str, Errno> {
    name.to_str().ok_or(Errno::EINVAL)
}

/// Kernel-facing adapter. Calls that may wait on the network run on the
/// worker pool; the rest answer inline.
pub struct PanFuse {
    fs: Arc<PanFs>,
    workers: WorkerPool,
}

impl PanFuse {
    pub fn new(fs: Arc<PanFs>, workers: WorkerPool) -> Self {
        Self { fs, workers }
    }
}

impl Filesystem for PanFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        info!(
            "panfs filesystem initialized, app_root={}, workers={}",
            self.fs.config.app_root,
            self.workers.size()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("panfs filesystem shutting down");
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let name = match utf8_name(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match self.fs.lookup(u64::from(parent), name) {
            Ok(attr) => reply.entry(&TTL, &attr.to_file_attr(), Generation(0)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.fs.getattr(u64::from(ino)) {
            Ok(attr) => reply.attr(&TTL, &attr.to_file_attr()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let mtime = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(st) => unix_secs(st),
            TimeOrNow::Now => unix_secs(SystemTime::now()),
        });
        match self.fs.setattr(u64::from(ino), size, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr.to_file_attr()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8_name(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match self.fs.mknod(u64::from(parent), name) {
            Ok(attr) => reply.entry(&TTL, &attr.to_file_attr(), Generation(0)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match utf8_name(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let attr = match self.fs.mknod(u64::from(parent), name) {
            Ok(attr) => attr,
            Err(e) => return reply.error(e.errno()),
        };
        match self.fs.open(attr.ino, flags) {
            Ok(fh) => reply.created(
                &TTL,
                &attr.to_file_attr(),
                Generation(0),
                FileHandle(fh),
                FopenFlags::empty(),
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8_name(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match self.fs.mkdir(u64::from(parent), name) {
            Ok(attr) => reply.entry(&TTL, &attr.to_file_attr(), Generation(0)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8_name(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match self.fs.unlink(u64::from(parent), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8_name(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match self.fs.rmdir(u64::from(parent), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (utf8_name(name), utf8_name(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(Errno::EINVAL),
        };
        match self
            .fs
            .rename(u64::from(parent), name, u64::from(newparent), newname)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        let ino = u64::from(ino);
        let raw_flags = flags.0;
        // Opening for write may download the whole object first.
        self.workers.execute(move || match fs.open(ino, raw_flags) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        let ino = u64::from(ino);
        self.workers.execute(move || match fs.read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(u64::from(fh), offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        match self.fs.flush(u64::from(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Cancellation runs here so it never queues behind the reads it stops.
        let ino = match self.fs.close(u64::from(fh)) {
            Closed::Done => return reply.ok(),
            Closed::UploadPending(ino) => ino,
        };
        let fs = Arc::clone(&self.fs);
        self.workers.execute(move || match fs.upload_pending(ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn fsync(&self, _req: &Request, ino: INodeNo, _fh: FileHandle, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(u64::from(ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        match self.fs.opendir(u64::from(ino)) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.fs.readdir(u64::from(fh), offset) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.errno()),
        };
        for (i, entry) in entries.iter().enumerate() {
            let kind = if entry.is_dir {
                fuser::FileType::Directory
            } else {
                fuser::FileType::RegularFile
            };
            if reply.add(INodeNo(entry.ino), offset + (i + 1) as u64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        match self.fs.releasedir(u64::from(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let st = self.fs.statfs();
        reply.statfs(
            st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
        );
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        match self.fs.access(u64::from(ino), mask.bits()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}
