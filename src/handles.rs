//! Open file handles and their reference-counted lifecycle.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Errno, errno_of};

/// Something that was opened and has to be closed exactly once.
pub trait Resource: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("close failed: {0}")]
    Close(#[source] io::Error),
}

impl Errno for HandleError {
    fn errno(&self) -> i32 {
        match self {
            HandleError::BadHandle(_) => libc::EBADF,
            HandleError::Close(e) => errno_of(e),
        }
    }
}

/// A live handle. `ref_count` is at least 1 while the entry is in the table.
pub struct HandleEntry<R: ?Sized> {
    pub resource: Arc<R>,
    pub ref_count: u32,
    pub flags: i32,
    pub path: String,
}

impl<R: ?Sized> Clone for HandleEntry<R> {
    fn clone(&self) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            ref_count: self.ref_count,
            flags: self.flags,
            path: self.path.clone(),
        }
    }
}

/// Issues handle ids for open resources.
///
/// Ids are never reused for the lifetime of the tracker. Mutations serialize on the
/// write lock; lookups only wait for in-flight mutations.
pub struct HandleTracker<R: ?Sized> {
    handles: RwLock<HashMap<u64, HandleEntry<R>>>,
    next_handle: AtomicU64,
}

impl<R: Resource + ?Sized> HandleTracker<R> {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn add(&self, resource: Arc<R>, flags: i32, path: impl Into<String>) -> u64 {
        let mut handles = self.handles.write();
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        handles.insert(
            fh,
            HandleEntry {
                resource,
                ref_count: 1,
                flags,
                path: path.into(),
            },
        );
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<R>> {
        self.handles
            .read()
            .get(&fh)
            .map(|entry| Arc::clone(&entry.resource))
    }

    pub fn get_entry(&self, fh: u64) -> Option<HandleEntry<R>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Take another reference on a live handle. Returns the new count.
    pub fn share(&self, fh: u64) -> Result<u32, HandleError> {
        let mut handles = self.handles.write();
        let entry = handles.get_mut(&fh).ok_or(HandleError::BadHandle(fh))?;
        entry.ref_count += 1;
        Ok(entry.ref_count)
    }

    /// Drop one reference. The last one closes the resource and removes the entry; the
    /// entry is gone even when the close itself fails.
    pub fn release(&self, fh: u64) -> Result<(), HandleError> {
        let mut handles = self.handles.write();
        let entry = handles.get_mut(&fh).ok_or(HandleError::BadHandle(fh))?;

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }

        let Some(entry) = handles.remove(&fh) else {
            return Err(HandleError::BadHandle(fh));
        };
        match entry.resource.close() {
            Ok(()) => Ok(()),
            // End of stream on close is not a failure.
            Err(e) if errno_of(&e) == 0 => Ok(()),
            Err(e) => {
                warn!(fh, path = %entry.path, error = %e, "close failed on release");
                Err(HandleError::Close(e))
            }
        }
    }

    /// Close every open resource, ignoring close errors. Used on unmount.
    pub fn close_all(&self) {
        let mut handles = self.handles.write();
        for (fh, entry) in handles.drain() {
            if let Err(e) = entry.resource.close() {
                debug!(fh, path = %entry.path, error = %e, "ignoring close error during teardown");
            }
        }
    }

    pub fn count(&self) -> usize {
        self.handles.read().len()
    }
}

impl<R: Resource + ?Sized> Default for HandleTracker<R> {
    fn default() -> Self {
        Self::new()
    }
}
