use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::entities::{EntityDirectory, FileRecord};
use crate::error::Result;
use crate::remote::RemoteClient;

/// How long a listing stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    For(Duration),
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    At(Instant),
    Never,
}

struct CacheSlot {
    items: Vec<Arc<FileRecord>>,
    expires: Expiry,
}

impl CacheSlot {
    fn is_stale(&self, now: Instant) -> bool {
        match self.expires {
            Expiry::At(at) => now > at,
            Expiry::Never => false,
        }
    }
}

/// Per-path cache of remote listings feeding the [`EntityDirectory`].
pub struct DirectoryCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
    remote: Arc<dyn RemoteClient>,
    entities: Arc<EntityDirectory>,
}

impl DirectoryCache {
    pub fn new(remote: Arc<dyn RemoteClient>, entities: Arc<EntityDirectory>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            remote,
            entities,
        }
    }

    /// Listing of `path` (whose inode is `ino`), served from cache unless
    /// forced, missing, or expired.
    ///
    /// A refresh replaces the slot wholesale; stale and fresh items never mix.
    /// On a failed refresh the existing slot is left untouched.
    pub fn list(&self, path: &str, ino: u64, ttl: Ttl, force: bool) -> Result<Vec<Arc<FileRecord>>> {
        if !force {
            let slots = self.slots.lock();
            if let Some(slot) = slots.get(path) {
                if !slot.is_stale(Instant::now()) {
                    return Ok(slot.items.clone());
                }
            }
        }

        debug!("listing {} (inode {}, force={})", path, ino, force);
        let entries = self.remote.list(path)?;
        let records = entries
            .iter()
            .map(|e| FileRecord::from_remote(ino, e))
            .collect();
        let items = self.entities.replace_children(ino, records);

        let expires = match ttl {
            Ttl::For(d) => Expiry::At(Instant::now() + d),
            Ttl::Never => Expiry::Never,
        };
        self.slots.lock().insert(
            path.to_string(),
            CacheSlot {
                items: items.clone(),
                expires,
            },
        );
        Ok(items)
    }

    /// Add a local-only entry to an existing slot without re-listing.
    pub fn insert_local(&self, path: &str, record: Arc<FileRecord>) {
        if let Some(slot) = self.slots.lock().get_mut(path) {
            slot.items.retain(|r| r.name != record.name);
            slot.items.push(record);
        }
    }

    /// Remove one entry from an existing slot without re-listing.
    pub fn remove_entry(&self, path: &str, ino: u64) {
        if let Some(slot) = self.slots.lock().get_mut(path) {
            slot.items.retain(|r| r.ino() != ino);
        }
    }

    /// Drop the cached listing of `path`; the next `list` goes to the remote.
    pub fn invalidate(&self, path: &str) {
        self.slots.lock().remove(path);
    }

    /// Drop the listings of `path` and of every directory below it.
    pub fn invalidate_tree(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.slots
            .lock()
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }

    /// Drop every expired slot. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|path, slot| {
            let keep = !slot.is_stale(now);
            if !keep {
                debug!("evicted listing of {}", path);
            }
            keep
        });
        before - slots.len()
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.slots.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
