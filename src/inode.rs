//! Stable inode numbers for paths, plus the attribute and directory caches.
//!
//! The path/inode table and the two caches sit behind three separate locks so a burst of
//! cache traffic never stalls inode allocation, and the other way around.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{FileAttr, FileType};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use crate::cache::{CacheStats, LruCache};

/// Inode handed to the kernel for the mount root. Never issued by the allocator.
pub const ROOT_INODE: u64 = fuser::FUSE_ROOT_ID;

/// What a path looked like when its inode was issued.
///
/// Two versions of a file with the same size and modification time are
/// indistinguishable; that is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileState {
    pub mtime: SystemTime,
    pub size: u64,
}

impl FileState {
    pub fn new(mtime: SystemTime, size: u64) -> Self {
        Self { mtime, size }
    }
}

/// One row of a cached directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct InodeStats {
    /// Paths that currently own an inode.
    pub identities: usize,
    /// Inodes issued since the manager was created, retired ones included.
    pub allocated: u64,
    pub attr_cache: CacheStats,
    pub dir_cache: CacheStats,
}

struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    states: HashMap<u64, FileState>,
    last_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        Self {
            path_to_ino: HashMap::new(),
            ino_to_path: HashMap::new(),
            states: HashMap::new(),
            last_ino: ROOT_INODE,
        }
    }

    fn current(&self, path: &str, state: FileState) -> Option<u64> {
        let ino = *self.path_to_ino.get(path)?;
        (self.states.get(&ino) == Some(&state)).then_some(ino)
    }

    fn retire(&mut self, ino: u64) {
        self.ino_to_path.remove(&ino);
        self.states.remove(&ino);
    }
}

pub struct InodeManager {
    table: RwLock<InodeTable>,
    attrs: LruCache<String, FileAttr>,
    dirs: LruCache<String, Arc<[DirEntry]>>,
}

impl InodeManager {
    pub fn new(
        max_cached_inodes: usize,
        max_cached_dirs: usize,
        attr_ttl: Duration,
        dir_ttl: Duration,
    ) -> Self {
        Self {
            table: RwLock::new(InodeTable::new()),
            attrs: LruCache::new(max_cached_inodes, attr_ttl),
            dirs: LruCache::new(max_cached_dirs, dir_ttl),
        }
    }

    /// Return the inode for `path`, issuing a fresh one when the path is new or no
    /// longer matches `state`. A replaced inode is retired, never handed out again.
    pub fn get_identity(&self, path: &str, state: FileState) -> u64 {
        if let Some(ino) = self.table.read().current(path, state) {
            return ino;
        }

        let mut table = self.table.write();

        // Another caller may have won the race for the write lock.
        if let Some(ino) = table.current(path, state) {
            return ino;
        }

        if let Some(old) = table.path_to_ino.get(path).copied() {
            trace!(path, old, "file changed, retiring inode");
            table.retire(old);
        }

        table.last_ino += 1;
        let ino = table.last_ino;
        table.path_to_ino.insert(path.to_string(), ino);
        table.ino_to_path.insert(ino, path.to_string());
        table.states.insert(ino, state);
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.table.read().ino_to_path.get(&ino).cloned()
    }

    /// Forget the inode of a deleted or renamed-away path.
    pub fn remove_path(&self, path: &str) {
        let mut table = self.table.write();
        if let Some(ino) = table.path_to_ino.remove(path) {
            table.retire(ino);
        }
        drop(table);
        self.attrs.delete(path);
        self.dirs.delete(path);
    }

    /// Forget `path` and everything below it, for a directory that was renamed or
    /// removed. Returns how many identities were dropped.
    pub fn remove_subtree(&self, path: &str) -> usize {
        if path == "/" {
            let dropped = self.stats().identities;
            self.clear();
            return dropped;
        }

        let prefix = format!("{path}/");
        let within = |p: &String| p == path || p.starts_with(&prefix);

        let mut table = self.table.write();
        let doomed: Vec<(String, u64)> = table
            .path_to_ino
            .iter()
            .filter(|&(p, _)| within(p))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (p, ino) in &doomed {
            table.path_to_ino.remove(p);
            table.retire(*ino);
        }
        drop(table);

        let attrs = self.attrs.delete_matching(within);
        let dirs = self.dirs.delete_matching(within);
        trace!(path, identities = doomed.len(), attrs, dirs, "dropped subtree");
        doomed.len()
    }

    pub fn cache_attribute(&self, path: &str, attr: FileAttr) {
        self.attrs.put(path.to_string(), attr);
    }

    pub fn get_cached_attribute(&self, path: &str) -> Option<FileAttr> {
        self.attrs.get(path)
    }

    pub fn invalidate_attribute(&self, path: &str) {
        self.attrs.delete(path);
    }

    pub fn cache_directory(&self, path: &str, entries: Vec<DirEntry>) {
        self.dirs.put(path.to_string(), entries.into());
    }

    pub fn get_cached_directory(&self, path: &str) -> Option<Arc<[DirEntry]>> {
        self.dirs.get(path)
    }

    pub fn invalidate_directory(&self, path: &str) {
        self.dirs.delete(path);
    }

    /// Drop every inode record and cached entry. Used on unmount.
    ///
    /// The allocator keeps counting upwards so numbers from before the reset are not
    /// reissued.
    pub fn clear(&self) {
        let mut table = self.table.write();
        table.path_to_ino.clear();
        table.ino_to_path.clear();
        table.states.clear();
        drop(table);

        self.attrs.clear();
        self.dirs.clear();
    }

    pub fn stats(&self) -> InodeStats {
        let table = self.table.read();
        InodeStats {
            identities: table.path_to_ino.len(),
            allocated: table.last_ino - ROOT_INODE,
            attr_cache: self.attrs.stats(),
            dir_cache: self.dirs.stats(),
        }
    }
}
