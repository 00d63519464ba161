use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::inode::InodeStats;
use crate::locks::LockStats;

/// Process-wide view of a mounted filesystem.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub mountpoint: PathBuf,
    pub operations: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub open_files: usize,
    pub inodes: InodeStats,
    pub locks: LockStats,
}

/// Request counters, safe to bump from any thread.
#[derive(Debug, Default)]
pub struct StatsCollector {
    operations: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values only; the caller fills in the manager-owned fields.
    pub fn snapshot(&self) -> Stats {
        Stats {
            operations: self.operations.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ..Stats::default()
        }
    }
}
