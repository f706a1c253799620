use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct HandleState {
    /// The file handle ID assigned by panfs.
    pub fh: u64,
    pub ino: u64,
    /// Remote path at open time.
    pub path: String,
    /// Open flags.
    pub flags: i32,
}

/// An open file, as reported when the mount is busy at shutdown.
#[derive(Debug, Clone)]
pub struct OpenFileInfo {
    pub path: String,
    pub writable: bool,
}

pub struct HandleTable {
    handles: DashMap<u64, HandleState>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, ino: u64, path: String, flags: i32) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let state = HandleState {
            fh,
            ino,
            path,
            flags,
        };
        self.handles.insert(fh, state);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, HandleState>> {
        self.handles.get(&fh)
    }

    pub fn get_mut(&self, fh: u64) -> Option<dashmap::mapref::one::RefMut<'_, u64, HandleState>> {
        self.handles.get_mut(&fh)
    }

    pub fn remove(&self, fh: u64) -> Option<HandleState> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }

    /// Number of handles still open on `ino`.
    pub fn open_count(&self, ino: u64) -> usize {
        self.handles.iter().filter(|h| h.ino == ino).count()
    }

    /// Point every handle on `old_ino` at `new_ino` after an identity change.
    pub fn retarget(&self, old_ino: u64, new_ino: u64, new_path: &str) {
        for mut h in self.handles.iter_mut() {
            if h.ino == old_ino {
                h.ino = new_ino;
                h.path = new_path.to_string();
            }
        }
    }

    pub fn list_open(&self) -> Vec<OpenFileInfo> {
        let mut open: Vec<OpenFileInfo> = self
            .handles
            .iter()
            .map(|h| OpenFileInfo {
                path: h.path.clone(),
                writable: h.flags & libc::O_ACCMODE != libc::O_RDONLY,
            })
            .collect();
        open.sort_by(|a, b| a.path.cmp(&b.path));
        open
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of a directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub is_dir: bool,
    pub name: String,
}

/// State for directory handles.
#[derive(Debug)]
pub struct DirHandleState {
    /// Listing captured at opendir, including `.` and `..`.
    pub entries: Vec<DirEntry>,
}

pub struct DirHandleTable {
    handles: DashMap<u64, DirHandleState>,
    next_fh: AtomicU64,
}

impl DirHandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, entries: Vec<DirEntry>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, DirHandleState { entries });
        fh
    }

    pub fn get(&self, fh: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, DirHandleState>> {
        self.handles.get(&fh)
    }

    pub fn remove(&self, fh: u64) -> Option<DirHandleState> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for DirHandleTable {
    fn default() -> Self {
        Self::new()
    }
}
