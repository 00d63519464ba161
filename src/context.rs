use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::handles::{HandleTracker, Resource};
use crate::inode::InodeManager;
use crate::locks::LockManager;
use crate::options::CacheOptions;
use crate::pool::BufferPool;
use crate::stats::{Stats, StatsCollector};

/// State shared by every request of one mount.
///
/// The three managers never call each other; the protocol binding is their only caller.
pub struct Context<R: ?Sized> {
    pub inodes: InodeManager,
    pub handles: HandleTracker<R>,
    pub locks: LockManager,
    pub stats: StatsCollector,
    pub buffers: BufferPool,
    mountpoint: PathBuf,
    unmounting: AtomicBool,
}

impl<R: Resource + ?Sized> Context<R> {
    pub fn new(mountpoint: impl Into<PathBuf>, cache: &CacheOptions) -> Self {
        Self {
            inodes: InodeManager::new(
                cache.max_cached_inodes,
                cache.max_cached_dirs,
                cache.attr_cache_ttl(),
                cache.dir_cache_ttl(),
            ),
            handles: HandleTracker::new(),
            locks: LockManager::new(),
            stats: StatsCollector::new(),
            buffers: BufferPool::new(),
            mountpoint: mountpoint.into(),
            unmounting: AtomicBool::new(false),
        }
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    /// Refuse further requests, close every handle and drop all cached state.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.unmounting.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(mountpoint = %self.mountpoint.display(), open_files = self.handles.count(), "shutting down");
        self.handles.close_all();
        self.locks.clear();
        self.inodes.clear();
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            mountpoint: self.mountpoint.clone(),
            open_files: self.handles.count(),
            inodes: self.inodes.stats(),
            locks: self.locks.stats(),
            ..self.stats.snapshot()
        }
    }
}
