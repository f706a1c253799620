use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::remote::RemoteEntry;

/// Inode of the mount root. It has no remote record.
pub const ROOT_INO: u64 = 1;

/// Start of the inode range handed to entries that exist only locally.
/// Remote ids stay far below this.
pub const LOCAL_INODE_BASE: u64 = 1 << 62;

/// Identity of an entry: a server-assigned id, or a synthetic one for
/// entries not (yet) uploaded. Either value doubles as the inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    Local(u64),
    Remote(u64),
}

impl Identity {
    pub fn ino(&self) -> u64 {
        match *self {
            Identity::Local(id) | Identity::Remote(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Identity::Local(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub identity: Identity,
    pub parent: u64,
    /// Absolute remote path.
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub server_ctime: i64,
    pub server_mtime: i64,
    pub local_ctime: i64,
    pub local_mtime: i64,
}

impl FileRecord {
    pub fn from_remote(parent: u64, entry: &RemoteEntry) -> Self {
        Self {
            identity: Identity::Remote(entry.fs_id),
            parent,
            path: entry.path.clone(),
            name: entry.filename.clone(),
            is_dir: entry.isdir,
            size: entry.size,
            server_ctime: entry.server_ctime,
            server_mtime: entry.server_mtime,
            local_ctime: entry.local_ctime,
            local_mtime: entry.local_mtime,
        }
    }

    /// A record for a file that exists only in the shadow directory.
    pub fn local(ino: u64, parent: u64, path: String, name: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            identity: Identity::Local(ino),
            parent,
            path,
            name,
            is_dir: false,
            size: 0,
            server_ctime: now,
            server_mtime: now,
            local_ctime: now,
            local_mtime: now,
        }
    }

    pub fn ino(&self) -> u64 {
        self.identity.ino()
    }

    /// Modification time preferring local edits over the server's value.
    pub fn mtime(&self) -> i64 {
        self.server_mtime.max(self.local_mtime)
    }
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<u64, Arc<FileRecord>>,
    by_name: HashMap<(u64, String), Arc<FileRecord>>,
    children: HashMap<u64, Vec<Arc<FileRecord>>>,
}

impl Indices {
    fn unlink(&mut self, ino: u64) -> Option<Arc<FileRecord>> {
        let old = self.by_id.remove(&ino)?;
        let key = (old.parent, old.name.clone());
        if self.by_name.get(&key).is_some_and(|r| r.ino() == ino) {
            self.by_name.remove(&key);
        }
        if let Some(list) = self.children.get_mut(&old.parent) {
            list.retain(|r| r.ino() != ino);
        }
        Some(old)
    }

    fn link(&mut self, record: Arc<FileRecord>) {
        let ino = record.ino();
        let key = (record.parent, record.name.clone());
        // A different entry under the same name is superseded.
        if let Some(prev) = self.by_name.get(&key).map(|r| r.ino()) {
            if prev != ino {
                self.unlink(prev);
            }
        }
        let list = self.children.entry(record.parent).or_default();
        match list.iter_mut().find(|r| r.ino() == ino) {
            Some(slot) => *slot = Arc::clone(&record),
            None => list.push(Arc::clone(&record)),
        }
        self.by_name.insert(key, Arc::clone(&record));
        self.by_id.insert(ino, record);
    }

    /// Drop every record below directory `ino`, returning them.
    fn unlink_descendants(&mut self, ino: u64) -> Vec<Arc<FileRecord>> {
        let mut removed = Vec::new();
        let mut pending = vec![ino];
        while let Some(dir) = pending.pop() {
            for child in self.children.remove(&dir).unwrap_or_default() {
                if self.unlink(child.ino()).is_some() {
                    if child.is_dir {
                        pending.push(child.ino());
                    }
                    removed.push(child);
                }
            }
        }
        removed
    }

    /// Rewrite the paths of everything below directory `ino` from
    /// `old_prefix` to `new_prefix`. Returns the rewritten records.
    fn rebase_descendants(&mut self, ino: u64, old_prefix: &str, new_prefix: &str) -> Vec<Arc<FileRecord>> {
        let mut moved = Vec::new();
        let mut pending = vec![ino];
        while let Some(dir) = pending.pop() {
            let children = self.children.get(&dir).cloned().unwrap_or_default();
            for child in children {
                let suffix = match child.path.strip_prefix(old_prefix) {
                    Some(s) if s.starts_with('/') => s,
                    _ => continue,
                };
                let mut record = (*child).clone();
                record.path = format!("{}{}", new_prefix, suffix);
                let record = Arc::new(record);
                self.link(Arc::clone(&record));
                if record.is_dir {
                    pending.push(record.ino());
                }
                moved.push(record);
            }
        }
        moved
    }
}

/// Process-wide index of known entries: by inode, by `(parent, name)`, and
/// by parent as an ordered child list. All three indices change under one
/// lock, so readers never see a record in one index but not another.
pub struct EntityDirectory {
    indices: RwLock<Indices>,
    next_local: AtomicU64,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            next_local: AtomicU64::new(LOCAL_INODE_BASE),
        }
    }

    /// Allocate a fresh identity for a local-only entry.
    pub fn alloc_local(&self) -> Identity {
        Identity::Local(self.next_local.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert or replace a record. A record that moved to a new parent or
    /// name is unlinked from its old position first.
    pub fn upsert(&self, record: FileRecord) -> Arc<FileRecord> {
        let record = Arc::new(record);
        let mut idx = self.indices.write();
        let moved = idx
            .by_id
            .get(&record.ino())
            .is_some_and(|old| old.parent != record.parent || old.name != record.name);
        if moved {
            idx.unlink(record.ino());
        }
        idx.link(Arc::clone(&record));
        record
    }

    pub fn get_by_id(&self, ino: u64) -> Option<Arc<FileRecord>> {
        self.indices.read().by_id.get(&ino).cloned()
    }

    pub fn get_by_parent_name(&self, parent: u64, name: &str) -> Option<Arc<FileRecord>> {
        self.indices
            .read()
            .by_name
            .get(&(parent, name.to_string()))
            .cloned()
    }

    /// Snapshot of a directory's children. Empty if the directory was never listed.
    pub fn children_of(&self, ino: u64) -> Vec<Arc<FileRecord>> {
        self.indices
            .read()
            .children
            .get(&ino)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a child list has been materialized for `ino`.
    pub fn is_listed(&self, ino: u64) -> bool {
        self.indices.read().children.contains_key(&ino)
    }

    /// Replace the children of `parent` with a fresh listing.
    ///
    /// Remote children missing from the listing are dropped from every index.
    /// Local-only children are kept and follow the listed ones.
    pub fn replace_children(&self, parent: u64, records: Vec<FileRecord>) -> Vec<Arc<FileRecord>> {
        let mut idx = self.indices.write();
        let previous = idx.children.remove(&parent).unwrap_or_default();
        let mut locals = Vec::new();
        for old in &previous {
            if old.identity.is_local() {
                locals.push(Arc::clone(old));
            } else {
                let key = (old.parent, old.name.clone());
                if idx.by_name.get(&key).is_some_and(|r| r.ino() == old.ino()) {
                    idx.by_name.remove(&key);
                }
                if idx.by_id.get(&old.ino()).is_some_and(|r| r.parent == parent) {
                    idx.by_id.remove(&old.ino());
                }
            }
        }
        idx.children.insert(parent, Vec::new());
        for record in records {
            let ino = record.ino();
            // The same id listed elsewhere means the entry moved here.
            if idx.by_id.get(&ino).is_some_and(|r| r.parent != parent) {
                idx.unlink(ino);
            }
            idx.link(Arc::new(record));
        }
        for local in locals {
            let taken = idx
                .by_name
                .get(&(parent, local.name.clone()))
                .is_some_and(|r| r.ino() != local.ino());
            if !taken {
                idx.link(local);
            } else {
                idx.by_id.remove(&local.ino());
            }
        }
        idx.children.get(&parent).cloned().unwrap_or_default()
    }

    /// Remove a record from all indices at once. A directory takes every
    /// record below it along.
    pub fn remove(&self, ino: u64) -> Option<Arc<FileRecord>> {
        self.remove_tree(ino).into_iter().next()
    }

    /// Remove a record and, for a directory, all of its descendants under
    /// one lock. The record itself comes first in the result.
    pub fn remove_tree(&self, ino: u64) -> Vec<Arc<FileRecord>> {
        let mut idx = self.indices.write();
        let removed = match idx.unlink(ino) {
            Some(r) => r,
            None => return Vec::new(),
        };
        let mut all = vec![Arc::clone(&removed)];
        if removed.is_dir {
            all.extend(idx.unlink_descendants(ino));
        }
        all
    }

    /// Move a record to `(parent, name)` at `path`, keeping its identity.
    /// Records below a moved directory follow with rewritten paths, all under
    /// one lock. Returns the moved record followed by its descendants.
    pub fn relocate(&self, ino: u64, parent: u64, name: &str, path: &str) -> Vec<Arc<FileRecord>> {
        let mut idx = self.indices.write();
        let old = match idx.by_id.get(&ino) {
            Some(r) => Arc::clone(r),
            None => return Vec::new(),
        };
        let mut record = (*old).clone();
        record.parent = parent;
        record.name = name.to_string();
        record.path = path.to_string();
        let record = Arc::new(record);
        idx.unlink(ino);
        idx.link(Arc::clone(&record));
        let mut all = vec![record];
        if old.is_dir {
            all.extend(idx.rebase_descendants(ino, &old.path, path));
        }
        all
    }

    /// Replace `old_ino` with a record under a new identity in one step,
    /// keeping every other field. Returns the new record.
    pub fn rekey(&self, old_ino: u64, identity: Identity) -> Option<Arc<FileRecord>> {
        let mut idx = self.indices.write();
        let old = idx.by_id.remove(&old_ino)?;
        let mut record = (*old).clone();
        record.identity = identity;
        let record = Arc::new(record);
        if let Some(list) = idx.children.get_mut(&old.parent) {
            if let Some(slot) = list.iter_mut().find(|r| r.ino() == old_ino) {
                *slot = Arc::clone(&record);
            }
        }
        idx.by_name.insert((old.parent, old.name.clone()), Arc::clone(&record));
        idx.by_id.insert(identity.ino(), Arc::clone(&record));
        Some(record)
    }

    /// Update a record in place through `f`; no-op for unknown inodes.
    pub fn modify(&self, ino: u64, f: impl FnOnce(&mut FileRecord)) -> Option<Arc<FileRecord>> {
        let mut idx = self.indices.write();
        let mut record = (**idx.by_id.get(&ino)?).clone();
        f(&mut record);
        let record = Arc::new(record);
        idx.unlink(ino);
        idx.link(Arc::clone(&record));
        Some(record)
    }

    /// Wipe every index. Snapshots already returned by [`children_of`](Self::children_of) are unaffected.
    pub fn clear(&self) {
        let mut idx = self.indices.write();
        idx.by_id.clear();
        idx.by_name.clear();
        idx.children.clear();
    }

    pub fn len(&self) -> usize {
        self.indices.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntityDirectory {
    fn default() -> Self {
        Self::new()
    }
}
