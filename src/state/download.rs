//! On-demand block downloads into shadow files.
//!
//! Each remote file is mirrored by a shadow file under the shadow root that
//! only ever grows contiguously from its start. A read that needs bytes past
//! the shadow's end claims the file's single [`DownloadTask`], fetches one
//! window from the current end, and streams it in fixed-size chunks. Other
//! readers of the same file wait on the task's progress instead of fetching.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::entities::FileRecord;
use crate::error::Result;
use crate::remote::{RemoteClient, RemoteMeta};

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Minimum bytes requested per fetch window.
    pub block_size: u64,
    /// Bytes written per cancellation check.
    pub chunk_size: usize,
    /// How long a reader waits on another reader's task without progress.
    pub wait_timeout: Duration,
    /// How long a download link is reused before fetching fresh metadata.
    pub link_ttl: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: crate::config::DEFAULT_BLOCK_SIZE,
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            wait_timeout: Duration::from_secs(60),
            link_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Cancelled,
    Finished,
}

struct Progress {
    state: TaskState,
    /// Shadow file length after the last flushed chunk.
    shadow_len: u64,
}

/// One in-flight fetch window for a file.
pub struct DownloadTask {
    pub ino: u64,
    pub start: u64,
    /// Exclusive end of the window, clamped to the object size.
    pub end: u64,
    /// Whether the range request was sent open-ended.
    pub open_ended: bool,
    progress: Mutex<Progress>,
    changed: Condvar,
}

enum Wait {
    Covered,
    Ended,
    TimedOut,
}

impl DownloadTask {
    fn new(ino: u64, start: u64, end: u64, open_ended: bool) -> Self {
        Self {
            ino,
            start,
            end,
            open_ended,
            progress: Mutex::new(Progress {
                state: TaskState::Running,
                shadow_len: start,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.progress.lock().state
    }

    pub fn shadow_len(&self) -> u64 {
        self.progress.lock().shadow_len
    }

    /// Stop the fetch loop at its next chunk boundary.
    pub fn cancel(&self) {
        let mut p = self.progress.lock();
        if p.state == TaskState::Running {
            p.state = TaskState::Cancelled;
        }
        self.changed.notify_all();
    }

    fn advance(&self, shadow_len: u64) {
        self.progress.lock().shadow_len = shadow_len;
        self.changed.notify_all();
    }

    fn finish(&self) {
        let mut p = self.progress.lock();
        if p.state == TaskState::Running {
            p.state = TaskState::Finished;
        }
        self.changed.notify_all();
    }

    /// Block until the shadow reaches `want_end`, the task stops, or no
    /// progress arrives within `timeout`.
    fn wait_for(&self, want_end: u64, timeout: Duration) -> Wait {
        let mut p = self.progress.lock();
        loop {
            if p.shadow_len >= want_end {
                return Wait::Covered;
            }
            if p.state != TaskState::Running {
                return Wait::Ended;
            }
            if self.changed.wait_for(&mut p, timeout).timed_out() {
                return Wait::TimedOut;
            }
        }
    }
}

enum Claim {
    Covered,
    Owner(Arc<DownloadTask>),
    Waiter(Arc<DownloadTask>),
}

enum Outcome {
    Progressed,
    Stalled,
    Cancelled,
}

pub struct DownloadCoordinator {
    shadow_root: PathBuf,
    remote: Arc<dyn RemoteClient>,
    config: DownloadConfig,
    tasks: Mutex<HashMap<u64, Arc<DownloadTask>>>,
    links: DashMap<u64, (RemoteMeta, Instant)>,
}

impl DownloadCoordinator {
    pub fn new(shadow_root: PathBuf, remote: Arc<dyn RemoteClient>, config: DownloadConfig) -> Self {
        Self {
            shadow_root,
            remote,
            config,
            tasks: Mutex::new(HashMap::new()),
            links: DashMap::new(),
        }
    }

    /// Local mirror path of a remote path.
    pub fn shadow_path(&self, remote_path: &str) -> PathBuf {
        self.shadow_root.join(remote_path.trim_start_matches('/'))
    }

    /// Read `[offset, offset + length)` of a remote file, fetching missing
    /// bytes first. `length == None` reads to the end of the object.
    ///
    /// Fetch failures are logged and whatever the shadow already holds is
    /// returned, so the result may be short or empty.
    pub fn read(&self, record: &FileRecord, offset: u64, length: Option<u64>) -> Vec<u8> {
        let want_end = match length {
            Some(len) => offset.saturating_add(len).min(record.size),
            None => record.size,
        };
        if offset >= want_end {
            return Vec::new();
        }
        let shadow = self.shadow_path(&record.path);
        if let Err(e) = self.prepare_shadow(&shadow, record) {
            warn!("cannot prepare shadow for {}: {}", record.path, e);
            return Vec::new();
        }
        self.fill(record, &shadow, offset, want_end, length.is_none());
        match read_range(&shadow, offset, want_end) {
            Ok(data) => data,
            Err(e) => {
                warn!("reading shadow of {} failed: {}", record.path, e);
                Vec::new()
            }
        }
    }

    /// Download the whole object into its shadow file. Returns whether it is complete.
    pub fn fetch_all(&self, record: &FileRecord) -> bool {
        let shadow = self.shadow_path(&record.path);
        if let Err(e) = self.prepare_shadow(&shadow, record) {
            warn!("cannot prepare shadow for {}: {}", record.path, e);
            return false;
        }
        if record.size > 0 {
            self.fill(record, &shadow, 0, record.size, true);
        }
        file_len(&shadow) >= record.size
    }

    /// Drive fetches until `[.., want_end)` is in the shadow file or no more progress is possible.
    fn fill(&self, record: &FileRecord, shadow: &Path, offset: u64, want_end: u64, open_ended: bool) {
        loop {
            match self.claim(record, shadow, offset, want_end, open_ended) {
                Claim::Covered => return,
                Claim::Waiter(task) => {
                    debug!("read of {} waits on running task", record.path);
                    match task.wait_for(want_end, self.config.wait_timeout) {
                        Wait::Covered | Wait::Ended => continue,
                        Wait::TimedOut => {
                            warn!("timed out waiting for {} to download", record.path);
                            return;
                        }
                    }
                }
                Claim::Owner(task) => {
                    let outcome = self.run(&task, record, shadow);
                    self.retire(&task);
                    match outcome {
                        Outcome::Progressed => continue,
                        Outcome::Stalled | Outcome::Cancelled => return,
                    }
                }
            }
        }
    }

    /// Atomically decide whether this reader fetches, waits, or is already covered.
    fn claim(&self, record: &FileRecord, shadow: &Path, offset: u64, want_end: u64, open_ended: bool) -> Claim {
        let ino = record.ino();
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(&ino) {
            if task.state() == TaskState::Running {
                return Claim::Waiter(Arc::clone(task));
            }
        }
        let have = file_len(shadow);
        if have >= record.size || have >= want_end {
            return Claim::Covered;
        }
        // The shadow only grows from its end, so a gap before `offset` is filled first.
        let start = have;
        let requested = want_end - offset;
        let end = start
            .saturating_add(self.config.block_size.max(requested))
            .min(record.size);
        let task = Arc::new(DownloadTask::new(ino, start, end, open_ended));
        tasks.insert(ino, Arc::clone(&task));
        Claim::Owner(task)
    }

    /// The fetch loop for one window.
    fn run(&self, task: &Arc<DownloadTask>, record: &FileRecord, shadow: &Path) -> Outcome {
        let link = match self.link(record) {
            Ok(meta) => meta.dlink,
            Err(e) => {
                warn!("no download link for {}: {}", record.path, e);
                return Outcome::Stalled;
            }
        };
        let range_end = if task.open_ended { None } else { Some(task.end) };
        debug!(
            "fetching {} bytes {}..{} (open_ended={})",
            record.path, task.start, task.end, task.open_ended
        );
        let mut body = match self.remote.fetch_range(&link, task.start, range_end) {
            Ok(body) => body,
            Err(e) => {
                warn!("range fetch for {} failed: {}", record.path, e);
                self.links.remove(&task.ino);
                return Outcome::Stalled;
            }
        };
        let mut file = match OpenOptions::new().create(true).append(true).open(shadow) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot open shadow {}: {}", shadow.display(), e);
                return Outcome::Stalled;
            }
        };
        if file_len(shadow) != task.start {
            warn!("shadow of {} changed under a running fetch", record.path);
            return Outcome::Stalled;
        }

        let mut buf = vec![0u8; self.config.chunk_size];
        let mut pos = task.start;
        while pos < task.end {
            let n = match read_full(&mut body, &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("transfer of {} broke at {}: {}", record.path, pos, e);
                    break;
                }
            };
            if n == 0 {
                break;
            }
            if !self.is_current(task) {
                debug!("fetch of {} cancelled at {}", record.path, pos);
                return Outcome::Cancelled;
            }
            let take = n.min((task.end - pos) as usize);
            if let Err(e) = file.write_all(&buf[..take]) {
                warn!("writing shadow of {} failed: {}", record.path, e);
                break;
            }
            pos += take as u64;
            task.advance(pos);
        }
        if pos > task.start {
            Outcome::Progressed
        } else {
            Outcome::Stalled
        }
    }

    fn is_current(&self, task: &Arc<DownloadTask>) -> bool {
        task.state() == TaskState::Running
            && self
                .tasks
                .lock()
                .get(&task.ino)
                .is_some_and(|t| Arc::ptr_eq(t, task))
    }

    fn retire(&self, task: &Arc<DownloadTask>) {
        {
            let mut tasks = self.tasks.lock();
            if tasks.get(&task.ino).is_some_and(|t| Arc::ptr_eq(t, task)) {
                tasks.remove(&task.ino);
            }
        }
        task.finish();
    }

    /// Cancel the running task for `ino`, if any. Returns whether one was running.
    pub fn cancel(&self, ino: u64) -> bool {
        let task = self.tasks.lock().remove(&ino);
        match task {
            Some(task) => {
                debug!("cancelling download of inode {}", ino);
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn task(&self, ino: u64) -> Option<Arc<DownloadTask>> {
        self.tasks.lock().get(&ino).cloned()
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Download metadata for a record, reusing a fresh cached link.
    fn link(&self, record: &FileRecord) -> Result<RemoteMeta> {
        let ino = record.ino();
        if let Some(entry) = self.links.get(&ino) {
            let (meta, fetched) = entry.value();
            if fetched.elapsed() < self.config.link_ttl {
                return Ok(meta.clone());
            }
        }
        let meta = self.remote.meta(&record.path, ino)?;
        self.links.insert(ino, (meta.clone(), Instant::now()));
        Ok(meta)
    }

    pub fn invalidate_link(&self, ino: u64) {
        self.links.remove(&ino);
    }

    /// Drop cached links older than the link ttl. Returns how many were evicted.
    pub fn evict_stale_links(&self) -> usize {
        let before = self.links.len();
        let ttl = self.config.link_ttl;
        self.links.retain(|_, (_, fetched)| fetched.elapsed() < ttl);
        before - self.links.len()
    }

    /// Discard a shadow copy that no longer mirrors the remote object.
    ///
    /// A shadow longer than the object, or older than its last server-side
    /// modification, is truncated. Nothing is touched while a task runs.
    fn prepare_shadow(&self, shadow: &Path, record: &FileRecord) -> std::io::Result<()> {
        if let Some(dir) = shadow.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if self.task(record.ino()).is_some() {
            return Ok(());
        }
        let meta = match std::fs::metadata(shadow) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let shadow_mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let outdated = record.server_mtime > 0 && meta.len() > 0 && shadow_mtime < record.server_mtime;
        if meta.len() > record.size || outdated {
            debug!("discarding stale shadow of {}", record.path);
            OpenOptions::new().write(true).open(shadow)?.set_len(0)?;
        }
        Ok(())
    }

    /// Remove the shadow copy of a remote path, if present.
    pub fn discard_shadow(&self, remote_path: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.shadow_path(remote_path)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Move a shadow copy along with a renamed remote entry.
    pub fn rename_shadow(&self, from: &str, to: &str) -> std::io::Result<()> {
        let src = self.shadow_path(from);
        if !src.exists() {
            return Ok(());
        }
        let dst = self.shadow_path(to);
        if let Some(dir) = dst.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::rename(src, dst)
    }
}

/// Length of a file, or 0 if it does not exist.
pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Read `[offset, end)` from a file; short if the file is shorter.
pub fn read_range(path: &Path, offset: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; end.saturating_sub(offset) as usize];
    let n = read_full(&mut file, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Fill `buf` as far as the source allows; returns the byte count.
pub fn read_full<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
