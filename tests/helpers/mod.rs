#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use panfs::config::PanConfig;
use panfs::error::{PanError, Result};
use panfs::fs::PanFs;
use panfs::remote::{parent_path, Quota, RemoteClient, RemoteEntry, RemoteMeta, PLACEHOLDER_PAYLOAD};
use panfs::state::entities::FileRecord;
use rand::RngCore;

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Meta(u64),
    Fetch { fs_id: u64, start: u64, end: Option<u64> },
    CreatePlaceholder(String),
    Upload(String),
    Mkdir(String),
    Delete(Vec<String>),
    Rename(String, String),
    Move(String, String, String),
    Quota,
}

#[derive(Debug, Clone)]
struct Object {
    fs_id: u64,
    is_dir: bool,
    data: Vec<u8>,
    mtime: i64,
}

/// Pauses a transfer when it reaches a byte offset until the test opens it.
pub struct Gate {
    at: u64,
    reached: (Mutex<bool>, Condvar),
    open: (Mutex<bool>, Condvar),
}

impl Gate {
    fn new(at: u64) -> Self {
        Self {
            at,
            reached: (Mutex::new(false), Condvar::new()),
            open: (Mutex::new(false), Condvar::new()),
        }
    }

    /// Wait until a transfer is parked at the gate.
    pub fn wait_reached(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &self.reached;
        let mut reached = lock.lock();
        cvar.wait_while_for(&mut reached, |r| !*r, timeout);
        *reached
    }

    pub fn release(&self) {
        let (lock, cvar) = &self.open;
        *lock.lock() = true;
        cvar.notify_all();
    }

    fn park(&self) {
        {
            let (lock, cvar) = &self.reached;
            *lock.lock() = true;
            cvar.notify_all();
        }
        let (lock, cvar) = &self.open;
        let mut open = lock.lock();
        cvar.wait_while_for(&mut open, |o| !*o, Duration::from_secs(10));
    }
}

struct MockBody {
    data: Vec<u8>,
    pos: usize,
    /// Absolute offset of `data[0]` in the object.
    base: u64,
    gate: Option<Arc<Gate>>,
}

impl Read for MockBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut limit = self.data.len();
        if let Some(gate) = &self.gate {
            let gate_pos = gate.at.saturating_sub(self.base) as usize;
            if self.pos == gate_pos {
                gate.park();
                self.gate = None;
            } else if self.pos < gate_pos {
                limit = limit.min(gate_pos);
            }
        }
        let n = buf.len().min(limit - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// In-memory remote store that records every call.
pub struct MockRemote {
    objects: Mutex<BTreeMap<String, Object>>,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU64,
    gate: Mutex<Option<Arc<Gate>>>,
    pub fail_fetch: AtomicBool,
    pub fail_list: AtomicBool,
    pub fail_upload: AtomicBool,
    pub fail_rename: AtomicBool,
    pub fail_quota: AtomicBool,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1000),
            gate: Mutex::new(None),
            fail_fetch: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            fail_upload: AtomicBool::new(false),
            fail_rename: AtomicBool::new(false),
            fail_quota: AtomicBool::new(false),
        })
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_file_with_id(&self, path: &str, fs_id: u64, data: &[u8]) -> u64 {
        self.objects.lock().insert(
            path.to_string(),
            Object {
                fs_id,
                is_dir: false,
                data: data.to_vec(),
                mtime: 1_600_000_000,
            },
        );
        fs_id
    }

    pub fn add_file(&self, path: &str, data: &[u8]) -> u64 {
        let id = self.alloc_id();
        self.add_file_with_id(path, id, data)
    }

    pub fn add_dir(&self, path: &str) -> u64 {
        let id = self.alloc_id();
        self.objects.lock().insert(
            path.to_string(),
            Object {
                fs_id: id,
                is_dir: true,
                data: Vec::new(),
                mtime: 1_600_000_000,
            },
        );
        id
    }

    pub fn set_mtime(&self, path: &str, mtime: i64) {
        if let Some(obj) = self.objects.lock().get_mut(path) {
            obj.mtime = mtime;
        }
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(path).map(|o| o.data.clone())
    }

    pub fn id_of(&self, path: &str) -> Option<u64> {
        self.objects.lock().get(path).map(|o| o.fs_id)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn fetches(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Fetch { .. }))
            .collect()
    }

    pub fn lists_of(&self, dir: &str) -> usize {
        self.count(|c| matches!(c, Call::List(d) if d == dir))
    }

    /// Park the next transfer when it reaches `offset`.
    pub fn gate_fetch_at(&self, offset: u64) -> Arc<Gate> {
        let gate = Arc::new(Gate::new(offset));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn entry(path: &str, obj: &Object) -> RemoteEntry {
        RemoteEntry {
            fs_id: obj.fs_id,
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or_default().to_string(),
            isdir: obj.is_dir,
            size: obj.data.len() as u64,
            server_ctime: obj.mtime,
            server_mtime: obj.mtime,
            local_ctime: obj.mtime,
            local_mtime: obj.mtime,
            md5: None,
        }
    }

    /// Move `from` and everything below it to `to`, replacing whatever
    /// was at `to`.
    fn relocate(&self, from: &str, to: &str) -> Result<()> {
        if self.fail_rename.load(Ordering::Relaxed) {
            return Err(PanError::Http("filemanager unavailable".to_string()));
        }
        let mut objects = self.objects.lock();
        if !objects.contains_key(from) {
            return Err(PanError::NotFound(from.to_string()));
        }
        let replaced = format!("{}/", to);
        objects.retain(|k, _| k != to && !k.starts_with(&replaced));
        let prefix = format!("{}/", from);
        let keys: Vec<String> = objects
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(obj) = objects.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                objects.insert(new_key, obj);
            }
        }
        Ok(())
    }
}

impl RemoteClient for MockRemote {
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        self.record(Call::List(dir.to_string()));
        if self.fail_list.load(Ordering::Relaxed) {
            return Err(PanError::Http("list unavailable".to_string()));
        }
        let objects = self.objects.lock();
        Ok(objects
            .iter()
            .filter(|(path, _)| parent_path(path) == dir)
            .map(|(path, obj)| Self::entry(path, obj))
            .collect())
    }

    fn meta(&self, path: &str, fs_id: u64) -> Result<RemoteMeta> {
        self.record(Call::Meta(fs_id));
        let objects = self.objects.lock();
        let obj = objects
            .get(path)
            .ok_or_else(|| PanError::NotFound(path.to_string()))?;
        Ok(RemoteMeta {
            fs_id: obj.fs_id,
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or_default().to_string(),
            dlink: format!("mock://{}", obj.fs_id),
            md5: None,
            size: obj.data.len() as u64,
            server_mtime: obj.mtime,
            isdir: obj.is_dir,
        })
    }

    fn fetch_range(&self, url: &str, start: u64, end: Option<u64>) -> Result<Box<dyn Read + Send>> {
        let fs_id: u64 = url
            .trim_start_matches("mock://")
            .parse()
            .map_err(|_| PanError::Http(format!("bad url {}", url)))?;
        self.record(Call::Fetch { fs_id, start, end });
        if self.fail_fetch.load(Ordering::Relaxed) {
            return Err(PanError::Http("403 Forbidden".to_string()));
        }
        let objects = self.objects.lock();
        let obj = objects
            .values()
            .find(|o| o.fs_id == fs_id)
            .ok_or_else(|| PanError::Http("404 Not Found".to_string()))?;
        let len = obj.data.len() as u64;
        // Range ends are inclusive on the wire.
        let stop = end.map(|e| (e + 1).min(len)).unwrap_or(len);
        let start_at = start.min(len);
        let data = obj.data[start_at as usize..stop as usize].to_vec();
        Ok(Box::new(MockBody {
            data,
            pos: 0,
            base: start,
            gate: self.gate.lock().take(),
        }))
    }

    fn create_placeholder(&self, path: &str) -> Result<u64> {
        self.record(Call::CreatePlaceholder(path.to_string()));
        if self.fail_upload.load(Ordering::Relaxed) {
            return Err(PanError::Remote {
                code: 31299,
                message: "upload refused".to_string(),
            });
        }
        let id = self.alloc_id();
        Ok(self.add_file_with_id(path, id, PLACEHOLDER_PAYLOAD))
    }

    fn upload(&self, path: &str, local: &Path) -> Result<u64> {
        self.record(Call::Upload(path.to_string()));
        if self.fail_upload.load(Ordering::Relaxed) {
            return Err(PanError::Remote {
                code: 31299,
                message: "upload refused".to_string(),
            });
        }
        let data = std::fs::read(local)?;
        let data = if data.is_empty() { PLACEHOLDER_PAYLOAD.to_vec() } else { data };
        let id = self.alloc_id();
        Ok(self.add_file_with_id(path, id, &data))
    }

    fn mkdir(&self, path: &str) -> Result<u64> {
        self.record(Call::Mkdir(path.to_string()));
        if self.exists(path) {
            return Err(PanError::AlreadyExists(path.to_string()));
        }
        Ok(self.add_dir(path))
    }

    fn delete(&self, paths: &[String]) -> Result<()> {
        self.record(Call::Delete(paths.to_vec()));
        let mut objects = self.objects.lock();
        for path in paths {
            if objects.remove(path).is_none() {
                return Err(PanError::NotFound(path.clone()));
            }
            let prefix = format!("{}/", path);
            objects.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }

    fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        self.record(Call::Rename(path.to_string(), new_name.to_string()));
        let to = panfs::remote::join_path(parent_path(path), new_name);
        self.relocate(path, &to)
    }

    fn move_to(&self, path: &str, dest_dir: &str, new_name: &str) -> Result<()> {
        self.record(Call::Move(
            path.to_string(),
            dest_dir.to_string(),
            new_name.to_string(),
        ));
        let to = panfs::remote::join_path(dest_dir, new_name);
        self.relocate(path, &to)
    }

    fn quota(&self) -> Result<Quota> {
        self.record(Call::Quota);
        if self.fail_quota.load(Ordering::Relaxed) {
            return Err(PanError::Http("quota unavailable".to_string()));
        }
        Ok(Quota {
            total: 2 * 1024 * 1024 * 1024,
            used: 512 * 1024 * 1024,
        })
    }
}

/// A `PanFs` over a fresh mock and shadow directory.
pub struct TestFs {
    pub remote: Arc<MockRemote>,
    pub fs: PanFs,
    pub shadow: tempfile::TempDir,
}

impl TestFs {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut PanConfig)) -> Self {
        let shadow = tempfile::tempdir().expect("failed to create shadow dir");
        let remote = MockRemote::new();
        let mut config = PanConfig::with_shadow_dir(shadow.path().to_path_buf());
        config.app_root = "/apps/panfs".to_string();
        config.read_timeout = Duration::from_secs(5);
        tweak(&mut config);
        let fs = PanFs::new(config, remote.clone() as Arc<dyn RemoteClient>).expect("failed to build fs");
        TestFs { remote, fs, shadow }
    }

    pub fn shadow_file(&self, remote_path: &str) -> std::path::PathBuf {
        self.shadow.path().join(remote_path.trim_start_matches('/'))
    }
}

/// A remote file record for coordinator-level tests.
pub fn remote_record(remote: &MockRemote, path: &str, parent: u64) -> FileRecord {
    let objects = remote.list(parent_path(path)).expect("list failed");
    let entry = objects
        .iter()
        .find(|e| e.path == path)
        .expect("no such remote file");
    FileRecord::from_remote(parent, entry)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}
