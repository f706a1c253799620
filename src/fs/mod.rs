pub mod attr;
pub mod fuse;
pub mod handles;
pub mod temp_files;
pub mod workers;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use self::attr::{unix_secs, Attr};
use self::handles::{DirEntry, DirHandleTable, HandleTable};
use self::temp_files::is_editor_temp;
use crate::config::PanConfig;
use crate::error::{PanError, Result};
use crate::remote::{join_path, RemoteClient};
use crate::state::dir_cache::DirectoryCache;
use crate::state::download::{file_len, read_range, DownloadConfig, DownloadCoordinator};
use crate::state::entities::{EntityDirectory, FileRecord, Identity, ROOT_INO};

fn os_error(code: i32) -> PanError {
    PanError::Io(std::io::Error::from_raw_os_error(code))
}

/// Filesystem statistics derived from the account quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// What is left to do after a handle is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Done,
    /// The last handle on a buffered file closed; its content must be uploaded.
    UploadPending(u64),
}

/// The operation layer: every filesystem call as a method returning `Result`.
pub struct PanFs {
    pub config: PanConfig,
    pub remote: Arc<dyn RemoteClient>,
    pub entities: Arc<EntityDirectory>,
    pub dir_cache: Arc<DirectoryCache>,
    pub downloads: Arc<DownloadCoordinator>,
    /// File handle table.
    pub file_handles: Arc<HandleTable>,
    /// Directory handle table.
    pub dir_handles: DirHandleTable,
    /// Remote files whose content lives in the shadow file until the last
    /// handle is released and it is uploaded.
    pending: DashSet<u64>,
}

impl PanFs {
    pub fn new(config: PanConfig, remote: Arc<dyn RemoteClient>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.shadow_dir)?;
        let entities = Arc::new(EntityDirectory::new());
        let dir_cache = Arc::new(DirectoryCache::new(Arc::clone(&remote), Arc::clone(&entities)));
        let downloads = Arc::new(DownloadCoordinator::new(
            config.shadow_dir.clone(),
            Arc::clone(&remote),
            DownloadConfig {
                block_size: config.block_size,
                chunk_size: config.chunk_size,
                wait_timeout: config.read_timeout,
                ..DownloadConfig::default()
            },
        ));
        info!(
            "panfs core ready: app_root={}, shadow_dir={}",
            config.app_root,
            config.shadow_dir.display()
        );
        Ok(Self {
            config,
            remote,
            entities,
            dir_cache,
            downloads,
            file_handles: Arc::new(HandleTable::new()),
            dir_handles: DirHandleTable::new(),
            pending: DashSet::new(),
        })
    }

    fn record(&self, ino: u64) -> Result<Arc<FileRecord>> {
        self.entities
            .get_by_id(ino)
            .ok_or_else(|| PanError::NotFound(format!("inode {}", ino)))
    }

    /// Remote path of a directory inode.
    fn dir_path(&self, ino: u64) -> Result<String> {
        if ino == ROOT_INO {
            return Ok("/".to_string());
        }
        let record = self.record(ino)?;
        if !record.is_dir {
            return Err(os_error(libc::ENOTDIR));
        }
        Ok(record.path.clone())
    }

    fn listing(&self, parent: u64) -> Result<Vec<Arc<FileRecord>>> {
        let path = self.dir_path(parent)?;
        self.dir_cache.list(&path, parent, self.config.dir_ttl, false)
    }

    /// Re-list a directory so the next readdir sees this filesystem's own changes.
    fn refresh(&self, parent: u64) {
        let path = match self.dir_path(parent) {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Err(e) = self.dir_cache.list(&path, parent, self.config.dir_ttl, true) {
            warn!("refresh of {} failed: {}", path, e);
        }
    }

    /// Resolve `name` under `parent`, listing the parent once on a miss.
    fn child(&self, parent: u64, name: &str) -> Result<Arc<FileRecord>> {
        if let Some(record) = self.entities.get_by_parent_name(parent, name) {
            return Ok(record);
        }
        self.listing(parent)?;
        self.entities
            .get_by_parent_name(parent, name)
            .ok_or_else(|| PanError::NotFound(name.to_string()))
    }

    /// New remote objects may only appear under the application root.
    fn check_confined(&self, path: &str) -> Result<()> {
        let root = self.config.app_root.trim_end_matches('/');
        if root.is_empty() || path == root || path.starts_with(&format!("{}/", root)) {
            Ok(())
        } else {
            Err(PanError::PermissionDenied(format!("{} is outside {}", path, self.config.app_root)))
        }
    }

    pub fn is_pending(&self, ino: u64) -> bool {
        self.pending.contains(&ino)
    }

    fn served_locally(&self, record: &FileRecord) -> bool {
        record.identity.is_local() || self.pending.contains(&record.ino())
    }

    fn shadow_path(&self, record: &FileRecord) -> PathBuf {
        self.downloads.shadow_path(&record.path)
    }

    fn attr_of(&self, record: &FileRecord) -> Attr {
        let mut attr = Attr::of(record);
        if !record.is_dir && self.served_locally(record) {
            if let Ok(meta) = std::fs::metadata(self.shadow_path(record)) {
                attr.size = meta.len();
                if let Ok(modified) = meta.modified() {
                    attr.mtime = attr.mtime.max(unix_secs(modified));
                }
            }
        }
        attr
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Result<Attr> {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let record = self.child(parent, name)?;
        Ok(self.attr_of(&record))
    }

    pub fn getattr(&self, ino: u64) -> Result<Attr> {
        debug!("getattr(ino={})", ino);
        if ino == ROOT_INO {
            return Ok(Attr::root());
        }
        let record = self.record(ino)?;
        Ok(self.attr_of(&record))
    }

    /// Apply a size and/or modification time change.
    pub fn setattr(&self, ino: u64, size: Option<u64>, mtime: Option<i64>) -> Result<Attr> {
        debug!("setattr(ino={}, size={:?}, mtime={:?})", ino, size, mtime);
        if ino == ROOT_INO {
            if size.is_some() {
                return Err(PanError::NotPermitted("cannot truncate the root".to_string()));
            }
            return Ok(Attr::root());
        }
        let record = self.record(ino)?;
        if let Some(new_size) = size {
            if record.is_dir {
                return Err(os_error(libc::EISDIR));
            }
            if !self.served_locally(&record) {
                self.check_confined(&record.path)?;
                self.begin_pending(&record, new_size == 0)?;
            }
            let shadow = self.shadow_path(&record);
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&shadow)?
                .set_len(new_size)?;
            self.entities.modify(ino, |r| r.size = new_size);
        }
        if let Some(t) = mtime {
            self.entities.modify(ino, |r| r.local_mtime = t);
        }
        self.getattr(ino)
    }

    /// Create a regular file.
    ///
    /// Editor temp files exist only in the shadow directory under a local
    /// identity. Anything else is created remotely right away with a
    /// placeholder payload; its content is uploaded on release.
    pub fn mknod(&self, parent: u64, name: &str) -> Result<Attr> {
        debug!("mknod(parent={}, name={:?})", parent, name);
        let dir = self.dir_path(parent)?;
        let path = join_path(&dir, name);
        self.check_confined(&path)?;
        if self.entities.get_by_parent_name(parent, name).is_some() {
            return Err(PanError::AlreadyExists(path));
        }

        let shadow = self.downloads.shadow_path(&path);
        if let Some(shadow_dir) = shadow.parent() {
            std::fs::create_dir_all(shadow_dir)?;
        }

        if is_editor_temp(name) {
            std::fs::File::create(&shadow)?;
            let identity = self.entities.alloc_local();
            let record = self.entities.upsert(FileRecord::local(
                identity.ino(),
                parent,
                path.clone(),
                name.to_string(),
            ));
            self.dir_cache.insert_local(&dir, Arc::clone(&record));
            debug!("created local temp file {} as inode {}", path, identity.ino());
            return Ok(self.attr_of(&record));
        }

        let fs_id = self.remote.create_placeholder(&path).map_err(|e| {
            warn!("placeholder upload for {} failed: {}", path, e);
            PanError::Unavailable(format!("cannot create {}", path))
        })?;
        std::fs::File::create(&shadow)?;
        self.pending.insert(fs_id);
        self.refresh(parent);

        let mut record = FileRecord::local(fs_id, parent, path, name.to_string());
        record.identity = Identity::Remote(fs_id);
        let record = self.entities.upsert(record);
        Ok(self.attr_of(&record))
    }

    pub fn mkdir(&self, parent: u64, name: &str) -> Result<Attr> {
        debug!("mkdir(parent={}, name={:?})", parent, name);
        let dir = self.dir_path(parent)?;
        let path = join_path(&dir, name);
        self.check_confined(&path)?;
        if self.entities.get_by_parent_name(parent, name).is_some() {
            return Err(PanError::AlreadyExists(path));
        }
        let fs_id = self.remote.mkdir(&path)?;
        self.refresh(parent);
        let record = match self.entities.get_by_id(fs_id) {
            Some(record) => record,
            None => {
                let mut record = FileRecord::local(fs_id, parent, path, name.to_string());
                record.identity = Identity::Remote(fs_id);
                record.is_dir = true;
                self.entities.upsert(record)
            }
        };
        Ok(self.attr_of(&record))
    }

    pub fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let record = self.child(parent, name)?;
        if record.is_dir {
            return Err(os_error(libc::EISDIR));
        }
        self.remove_record(&record)
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let record = self.child(parent, name)?;
        if !record.is_dir {
            return Err(os_error(libc::ENOTDIR));
        }
        let children = self
            .dir_cache
            .list(&record.path, record.ino(), self.config.dir_ttl, false)?;
        if !children.is_empty() {
            return Err(os_error(libc::ENOTEMPTY));
        }
        self.remove_record(&record)?;
        self.dir_cache.invalidate(&record.path);
        Ok(())
    }

    fn remove_record(&self, record: &FileRecord) -> Result<()> {
        let ino = record.ino();
        let dir = self.dir_path(record.parent)?;
        if record.identity.is_local() {
            self.downloads.discard_shadow(&record.path)?;
            self.entities.remove(ino);
            self.dir_cache.remove_entry(&dir, ino);
            return Ok(());
        }

        self.remote.delete(&[record.path.clone()])?;
        self.forget(record, true);
        self.refresh(record.parent);
        Ok(())
    }

    /// Drop every local trace of `record` and of anything indexed below it.
    /// With `discard` their shadow copies are deleted too.
    fn forget(&self, record: &FileRecord, discard: bool) {
        for gone in self.entities.remove_tree(record.ino()) {
            let ino = gone.ino();
            self.downloads.cancel(ino);
            self.downloads.invalidate_link(ino);
            self.pending.remove(&ino);
            if discard && !gone.is_dir {
                if let Err(e) = self.downloads.discard_shadow(&gone.path) {
                    warn!("cannot remove shadow of {}: {}", gone.path, e);
                }
            }
        }
        if record.is_dir {
            self.dir_cache.invalidate_tree(&record.path);
        }
    }

    pub fn rename(&self, parent: u64, name: &str, newparent: u64, newname: &str) -> Result<()> {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let record = self.child(parent, name)?;
        let old_dir = self.dir_path(parent)?;
        let new_dir = self.dir_path(newparent)?;
        let new_path = join_path(&new_dir, newname);
        if record.path == new_path {
            return Ok(());
        }

        let replaced = match self.child(newparent, newname) {
            Ok(target) if target.ino() != record.ino() => {
                if target.is_dir != record.is_dir {
                    return Err(os_error(if target.is_dir { libc::EISDIR } else { libc::ENOTDIR }));
                }
                if target.is_dir
                    && !self
                        .dir_cache
                        .list(&target.path, target.ino(), self.config.dir_ttl, false)?
                        .is_empty()
                {
                    return Err(os_error(libc::ENOTEMPTY));
                }
                Some(target)
            }
            _ => None,
        };

        if record.identity.is_local() {
            return self.rename_local(&record, replaced.as_deref(), &old_dir, &new_dir, newparent, newname, new_path);
        }

        // The remote replaces an existing destination in the same call.
        if parent == newparent {
            self.remote.rename(&record.path, newname)?;
        } else {
            self.remote.move_to(&record.path, &new_dir, newname)?;
        }
        if let Some(target) = &replaced {
            self.forget(target, true);
        }

        let ino = record.ino();
        self.downloads.cancel(ino);
        self.downloads.invalidate_link(ino);
        if let Err(e) = self.downloads.rename_shadow(&record.path, &new_path) {
            warn!("cannot move shadow of {}: {}", record.path, e);
        }
        for moved in self.entities.relocate(ino, newparent, newname, &new_path) {
            if moved.ino() != ino {
                self.downloads.cancel(moved.ino());
                self.downloads.invalidate_link(moved.ino());
            }
            self.file_handles.retarget(moved.ino(), moved.ino(), &moved.path);
        }
        self.dir_cache.remove_entry(&old_dir, ino);
        if record.is_dir {
            self.dir_cache.invalidate_tree(&record.path);
        }
        self.refresh(parent);
        if newparent != parent {
            self.refresh(newparent);
        }
        if self.entities.get_by_id(ino).is_none() {
            let mut moved = (*record).clone();
            moved.parent = newparent;
            moved.name = newname.to_string();
            moved.path = new_path;
            self.entities.upsert(moved);
        }
        Ok(())
    }

    /// Rename a local-only file. Leaving the temp-name space uploads it.
    #[allow(clippy::too_many_arguments)]
    fn rename_local(
        &self,
        record: &FileRecord,
        replaced: Option<&FileRecord>,
        old_dir: &str,
        new_dir: &str,
        newparent: u64,
        newname: &str,
        new_path: String,
    ) -> Result<()> {
        let ino = record.ino();
        self.check_confined(&new_path)?;

        if is_editor_temp(newname) {
            self.downloads.rename_shadow(&record.path, &new_path)?;
            if let Some(target) = replaced {
                if !target.identity.is_local() {
                    if let Err(e) = self.remote.delete(&[target.path.clone()]) {
                        self.downloads.rename_shadow(&new_path, &record.path)?;
                        return Err(e);
                    }
                }
                self.forget(target, false);
            }
            let moved = self.entities.modify(ino, |r| {
                r.parent = newparent;
                r.name = newname.to_string();
                r.path = new_path.clone();
            });
            self.dir_cache.remove_entry(old_dir, ino);
            if let Some(moved) = moved {
                self.dir_cache.insert_local(new_dir, moved);
            }
            self.file_handles.retarget(ino, ino, &new_path);
            return Ok(());
        }

        // The upload replaces any remote object at the destination.
        let shadow = self.downloads.shadow_path(&record.path);
        let fs_id = self.remote.upload(&new_path, &shadow).map_err(|e| {
            warn!("upload of {} failed: {}", new_path, e);
            PanError::Unavailable(format!("cannot upload {}", new_path))
        })?;
        info!("uploaded {} as {}", new_path, fs_id);
        if let Some(target) = replaced {
            self.forget(target, true);
        }
        if let Err(e) = self.downloads.rename_shadow(&record.path, &new_path) {
            warn!("cannot move shadow of {}: {}", record.path, e);
        }
        self.entities.modify(ino, |r| {
            r.parent = newparent;
            r.name = newname.to_string();
            r.path = new_path.clone();
        });
        self.dir_cache.remove_entry(old_dir, ino);
        self.entities.rekey(ino, Identity::Remote(fs_id));
        self.file_handles.retarget(ino, fs_id, &new_path);
        if self.file_handles.open_count(fs_id) > 0 {
            self.pending.insert(fs_id);
        } else if let Err(e) = self.downloads.discard_shadow(&new_path) {
            warn!("cannot remove shadow of {}: {}", new_path, e);
        }
        self.refresh(newparent);
        if record.parent != newparent {
            self.refresh(record.parent);
        }
        Ok(())
    }

    /// Switch a remote file to shadow-buffered writes.
    fn begin_pending(&self, record: &FileRecord, truncate: bool) -> Result<()> {
        let ino = record.ino();
        self.downloads.cancel(ino);
        if truncate {
            let shadow = self.shadow_path(record);
            if let Some(dir) = shadow.parent() {
                std::fs::create_dir_all(dir)?;
            }
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&shadow)?;
        } else if !self.downloads.fetch_all(record) {
            return Err(PanError::Unavailable(format!("cannot fetch {}", record.path)));
        }
        debug!("{} now buffered locally", record.path);
        self.pending.insert(ino);
        Ok(())
    }

    pub fn open(&self, ino: u64, flags: i32) -> Result<u64> {
        debug!("open(ino={}, flags={})", ino, flags);
        if ino == ROOT_INO {
            return Err(os_error(libc::EISDIR));
        }
        let record = self.record(ino)?;
        if record.is_dir {
            return Err(os_error(libc::EISDIR));
        }
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let truncate = flags & libc::O_TRUNC != 0;
        if writable {
            if self.served_locally(&record) {
                if truncate {
                    OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(self.shadow_path(&record))?;
                }
            } else {
                self.check_confined(&record.path)?;
                self.begin_pending(&record, truncate)?;
            }
        }
        Ok(self.file_handles.alloc(ino, record.path.clone(), flags))
    }

    pub fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        debug!("read(ino={}, offset={}, size={})", ino, offset, size);
        let record = self.record(ino)?;
        if record.is_dir {
            return Err(os_error(libc::EISDIR));
        }
        if self.served_locally(&record) {
            let end = offset.saturating_add(size as u64);
            return Ok(read_range(&self.shadow_path(&record), offset, end)?);
        }
        Ok(self.downloads.read(&record, offset, Some(size as u64)))
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let (ino, flags) = match self.file_handles.get(fh) {
            Some(h) => (h.ino, h.flags),
            None => return Err(os_error(libc::EBADF)),
        };
        debug!("write(ino={}, fh={}, offset={}, size={})", ino, fh, offset, data.len());
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            return Err(os_error(libc::EBADF));
        }
        let record = self.record(ino)?;
        if !self.served_locally(&record) {
            return Err(os_error(libc::EBADF));
        }

        let shadow = self.shadow_path(&record);
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(&shadow)?;
        file.write_all_at(data, offset)?;
        let new_size = file_len(&shadow);
        let now = chrono::Utc::now().timestamp();
        self.entities.modify(ino, |r| {
            r.size = new_size;
            r.local_mtime = now;
        });
        Ok(data.len() as u32)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        debug!("flush(fh={})", fh);
        if self.file_handles.get(fh).is_none() {
            return Err(os_error(libc::EBADF));
        }
        Ok(())
    }

    /// Close a handle. The last close of a file uploads buffered content or
    /// cancels a download still in flight.
    pub fn release(&self, fh: u64) -> Result<()> {
        match self.close(fh) {
            Closed::Done => Ok(()),
            Closed::UploadPending(ino) => self.upload_pending(ino),
        }
    }

    /// The non-blocking half of [`release`](Self::release): drop the handle
    /// and cancel any download the last close leaves without a reader. An
    /// upload still owed is returned for the caller to run.
    pub fn close(&self, fh: u64) -> Closed {
        debug!("release(fh={})", fh);
        let handle = match self.file_handles.remove(fh) {
            Some(h) => h,
            None => return Closed::Done,
        };
        let ino = handle.ino;
        if self.file_handles.open_count(ino) > 0 {
            return Closed::Done;
        }
        if self.pending.contains(&ino) {
            return Closed::UploadPending(ino);
        }
        self.downloads.cancel(ino);
        Closed::Done
    }

    /// Upload the shadow copy of a buffered file once no handle is open on it.
    pub fn upload_pending(&self, ino: u64) -> Result<()> {
        if !self.pending.contains(&ino) || self.file_handles.open_count(ino) > 0 {
            return Ok(());
        }
        let record = match self.entities.get_by_id(ino) {
            Some(r) => r,
            None => {
                self.pending.remove(&ino);
                return Ok(());
            }
        };
        let shadow = self.shadow_path(&record);
        let fs_id = self.remote.upload(&record.path, &shadow).map_err(|e| {
            warn!("upload of {} failed, keeping local copy: {}", record.path, e);
            PanError::Unavailable(format!("cannot upload {}", record.path))
        })?;
        info!("uploaded {} ({} bytes)", record.path, file_len(&shadow));
        self.pending.remove(&ino);
        self.downloads.invalidate_link(ino);
        if fs_id != ino {
            self.entities.rekey(ino, Identity::Remote(fs_id));
        }
        if let Err(e) = self.downloads.discard_shadow(&record.path) {
            warn!("cannot remove shadow of {}: {}", record.path, e);
        }
        self.refresh(record.parent);
        Ok(())
    }

    /// Drop cached link metadata and re-list the parent directory.
    pub fn fsync(&self, ino: u64) -> Result<()> {
        debug!("fsync(ino={})", ino);
        let record = self.record(ino)?;
        self.downloads.invalidate_link(ino);
        self.refresh(record.parent);
        Ok(())
    }

    /// Open a directory, capturing its listing for paginated reads.
    pub fn opendir(&self, ino: u64) -> Result<u64> {
        debug!("opendir(ino={})", ino);
        let path = self.dir_path(ino)?;
        let parent = match self.entities.get_by_id(ino) {
            Some(r) => r.parent,
            None => ROOT_INO,
        };
        let children = match self.dir_cache.list(&path, ino, self.config.dir_ttl, false) {
            Ok(children) => children,
            Err(e) => {
                warn!("listing {} failed, serving known entries: {}", path, e);
                self.entities.children_of(ino)
            }
        };
        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirEntry {
            ino,
            is_dir: true,
            name: ".".to_string(),
        });
        entries.push(DirEntry {
            ino: parent,
            is_dir: true,
            name: "..".to_string(),
        });
        entries.extend(children.iter().map(|r| DirEntry {
            ino: r.ino(),
            is_dir: r.is_dir,
            name: r.name.clone(),
        }));
        Ok(self.dir_handles.alloc(entries))
    }

    /// Entries of an open directory starting at `offset`.
    pub fn readdir(&self, fh: u64, offset: u64) -> Result<Vec<DirEntry>> {
        debug!("readdir(fh={}, offset={})", fh, offset);
        let handle = self.dir_handles.get(fh).ok_or_else(|| os_error(libc::EBADF))?;
        Ok(handle.entries.iter().skip(offset as usize).cloned().collect())
    }

    pub fn releasedir(&self, fh: u64) -> Result<()> {
        debug!("releasedir(fh={})", fh);
        self.dir_handles.remove(fh);
        Ok(())
    }

    /// Quota as 512-byte blocks. An unreachable quota reports an empty filesystem.
    pub fn statfs(&self) -> FsStats {
        let bsize = attr::BLOCK_SIZE;
        let (total, free) = match self.remote.quota() {
            Ok(q) => (q.total, q.free()),
            Err(e) => {
                warn!("quota query failed: {}", e);
                (0, 0)
            }
        };
        let bfree = free / bsize as u64;
        FsStats {
            blocks: total / bsize as u64,
            bfree,
            bavail: bfree,
            files: bfree,
            ffree: bfree.max(100),
            bsize,
            namelen: 255,
            frsize: bsize,
        }
    }

    pub fn access(&self, ino: u64, mask: i32) -> Result<()> {
        debug!("access(ino={}, mask={})", ino, mask);
        if ino == ROOT_INO || self.entities.get_by_id(ino).is_some() {
            Ok(())
        } else {
            Err(PanError::NotFound(format!("inode {}", ino)))
        }
    }
}
