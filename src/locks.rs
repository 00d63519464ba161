//! Advisory locking kept entirely in user space.
//!
//! Two lock families live here: whole-file locks (flock style, shared or exclusive,
//! any number of shared owners) and POSIX byte-range locks (read or write, split on
//! partial unlock). Neither ever blocks the caller. A request that cannot be granted
//! right now fails with [`LockError::WouldBlock`] or [`LockError::TryAgain`] and the
//! kernel decides whether to retry.
//!
//! Both tables share one lock so that [`LockManager::release_owner`] is atomic with
//! respect to concurrent lock attempts.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::error::Errno;

/// End offset meaning "through the end of the file, whatever its size".
pub const WHOLE_FILE_END: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LockError {
    /// Conflict on a request that asked not to wait.
    #[error("lock would block")]
    WouldBlock,

    /// Conflict on a request that may wait; the caller is expected to retry.
    #[error("lock unavailable, try again")]
    TryAgain,
}

impl Errno for LockError {
    fn errno(&self) -> i32 {
        match self {
            LockError::WouldBlock => libc::EWOULDBLOCK,
            LockError::TryAgain => libc::EAGAIN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FlockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RangeKind {
    Read,
    Write,
    Unlock,
}

impl RangeKind {
    /// Convert an `F_RDLCK` / `F_WRLCK` / `F_UNLCK` value.
    pub fn from_fcntl(typ: i32) -> Option<Self> {
        match typ {
            t if t == libc::F_RDLCK as i32 => Some(RangeKind::Read),
            t if t == libc::F_WRLCK as i32 => Some(RangeKind::Write),
            t if t == libc::F_UNLCK as i32 => Some(RangeKind::Unlock),
            _ => None,
        }
    }

    pub fn to_fcntl(self) -> i32 {
        match self {
            RangeKind::Read => libc::F_RDLCK as i32,
            RangeKind::Write => libc::F_WRLCK as i32,
            RangeKind::Unlock => libc::F_UNLCK as i32,
        }
    }
}

/// A byte-range lock request or a held range. `end` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RangeLock {
    pub start: u64,
    pub end: u64,
    pub kind: RangeKind,
    pub pid: u32,
}

impl RangeLock {
    pub fn new(start: u64, end: u64, kind: RangeKind, pid: u32) -> Self {
        Self {
            start,
            end,
            kind,
            pid,
        }
    }

    fn overlaps(&self, other: &RangeLock) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn conflicts_with(&self, other: &RangeLock) -> bool {
        self.overlaps(other) && (self.kind == RangeKind::Write || other.kind == RangeKind::Write)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    /// Paths with at least one whole-file lock holder.
    pub flocked_paths: usize,
    /// Byte ranges held across all paths.
    pub held_ranges: usize,
}

struct FlockState {
    mode: FlockMode,
    owners: HashSet<u64>,
}

struct HeldRange {
    owner: u64,
    range: RangeLock,
}

#[derive(Default)]
struct LockTables {
    flocks: HashMap<String, FlockState>,
    ranges: HashMap<String, Vec<HeldRange>>,
}

impl LockTables {
    fn find_conflict(&self, path: &str, owner: u64, candidate: &RangeLock) -> Option<RangeLock> {
        self.ranges
            .get(path)?
            .iter()
            .filter(|held| held.owner != owner)
            .find(|held| candidate.conflicts_with(&held.range))
            .map(|held| held.range)
    }

    fn unlock_range(&mut self, path: &str, owner: u64, unlock: &RangeLock) {
        let Some(held) = self.ranges.remove(path) else {
            return;
        };

        let mut kept = Vec::with_capacity(held.len() + 1);
        for entry in held {
            if entry.owner != owner || !entry.range.overlaps(unlock) {
                kept.push(entry);
                continue;
            }

            if entry.range.start < unlock.start {
                kept.push(HeldRange {
                    owner,
                    range: RangeLock {
                        end: unlock.start,
                        ..entry.range
                    },
                });
            }
            if entry.range.end > unlock.end {
                kept.push(HeldRange {
                    owner,
                    range: RangeLock {
                        start: unlock.end,
                        ..entry.range
                    },
                });
            }
        }

        if !kept.is_empty() {
            self.ranges.insert(path.to_string(), kept);
        }
    }
}

pub struct LockManager {
    tables: RwLock<LockTables>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(LockTables::default()),
        }
    }

    /// Acquire, upgrade or downgrade a whole-file lock for `owner`.
    ///
    /// A conflict yields `WouldBlock` when `nonblocking` is set, `TryAgain` otherwise.
    pub fn flock(
        &self,
        path: &str,
        owner: u64,
        mode: FlockMode,
        nonblocking: bool,
    ) -> Result<(), LockError> {
        let conflict = if nonblocking {
            LockError::WouldBlock
        } else {
            LockError::TryAgain
        };

        let mut tables = self.tables.write();
        let Some(state) = tables.flocks.get_mut(path) else {
            tables.flocks.insert(
                path.to_string(),
                FlockState {
                    mode,
                    owners: HashSet::from([owner]),
                },
            );
            return Ok(());
        };

        if state.owners.contains(&owner) {
            return match (state.mode, mode) {
                (current, requested) if current == requested => Ok(()),
                (FlockMode::Shared, FlockMode::Exclusive) => {
                    if state.owners.len() == 1 {
                        state.mode = FlockMode::Exclusive;
                        Ok(())
                    } else {
                        Err(conflict)
                    }
                }
                (FlockMode::Exclusive, FlockMode::Shared) => {
                    state.mode = FlockMode::Shared;
                    Ok(())
                }
                _ => Ok(()),
            };
        }

        match (state.mode, mode) {
            (FlockMode::Shared, FlockMode::Shared) => {
                state.owners.insert(owner);
                Ok(())
            }
            _ => {
                trace!(path, owner, ?mode, "whole-file lock conflict");
                Err(conflict)
            }
        }
    }

    /// Drop `owner` from the whole-file lock on `path`. Unlocking something never
    /// locked succeeds.
    pub fn flock_unlock(&self, path: &str, owner: u64) {
        let mut tables = self.tables.write();
        let Some(state) = tables.flocks.get_mut(path) else {
            return;
        };
        state.owners.remove(&owner);
        if state.owners.is_empty() {
            tables.flocks.remove(path);
        }
    }

    /// Report the first range held by another owner that would block `candidate`.
    pub fn test_range(&self, path: &str, owner: u64, candidate: &RangeLock) -> Option<RangeLock> {
        self.tables.read().find_conflict(path, owner, candidate)
    }

    /// Acquire or release a byte range without waiting (F_SETLK).
    ///
    /// An `Unlock` request trims or splits `owner`'s overlapping ranges. Ranges of the
    /// same owner never conflict with each other and are simply appended.
    pub fn set_range(&self, path: &str, owner: u64, lock: RangeLock) -> Result<(), LockError> {
        let mut tables = self.tables.write();

        if lock.kind == RangeKind::Unlock {
            tables.unlock_range(path, owner, &lock);
            return Ok(());
        }

        if let Some(held) = tables.find_conflict(path, owner, &lock) {
            trace!(path, owner, start = lock.start, end = lock.end, held_pid = held.pid, "range lock conflict");
            return Err(LockError::TryAgain);
        }

        tables
            .ranges
            .entry(path.to_string())
            .or_default()
            .push(HeldRange { owner, range: lock });
        Ok(())
    }

    /// The waiting variant (F_SETLKW). The binding cannot park a kernel request, so
    /// this behaves like [`set_range`](Self::set_range) and the kernel retries.
    pub fn set_range_wait(&self, path: &str, owner: u64, lock: RangeLock) -> Result<(), LockError> {
        self.set_range(path, owner, lock)
    }

    /// Release every lock held by `owner` on every path. Called when a handle closes.
    pub fn release_owner(&self, owner: u64) {
        let mut tables = self.tables.write();

        tables.flocks.retain(|_, state| {
            state.owners.remove(&owner);
            !state.owners.is_empty()
        });

        tables.ranges.retain(|_, held| {
            held.retain(|entry| entry.owner != owner);
            !held.is_empty()
        });
    }

    /// Drop every lock of every owner. Used on unmount.
    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.flocks.clear();
        tables.ranges.clear();
    }

    /// Current whole-file lock on `path`: its mode and holders, sorted.
    pub fn flock_holders(&self, path: &str) -> Option<(FlockMode, Vec<u64>)> {
        let tables = self.tables.read();
        let state = tables.flocks.get(path)?;
        let mut owners: Vec<u64> = state.owners.iter().copied().collect();
        owners.sort_unstable();
        Some((state.mode, owners))
    }

    /// Ranges held on `path` by anyone, ordered by start offset.
    pub fn held_ranges(&self, path: &str) -> Vec<(u64, RangeLock)> {
        let tables = self.tables.read();
        let mut ranges: Vec<(u64, RangeLock)> = tables
            .ranges
            .get(path)
            .map(|held| held.iter().map(|h| (h.owner, h.range)).collect())
            .unwrap_or_default();
        ranges.sort_by_key(|(owner, range)| (range.start, range.end, *owner));
        ranges
    }

    pub fn stats(&self) -> LockStats {
        let tables = self.tables.read();
        LockStats {
            flocked_paths: tables.flocks.len(),
            held_ranges: tables.ranges.values().map(Vec::len).sum(),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
