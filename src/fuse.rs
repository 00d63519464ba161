//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto a [`FileSystem`] backend and
//! the shared [`Context`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::consts::FUSE_POSIX_LOCKS;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use tracing::{debug, warn};

use crate::backend::{File as _, FileSystem, Metadata, StatFs};
use crate::context::Context;
use crate::error::{Errno, errno_of};
use crate::handles::Resource as _;
use crate::inode::{DirEntry, ROOT_INODE};
use crate::locks::{RangeKind, RangeLock, WHOLE_FILE_END};
use crate::options::MountOptions;

/// Bypass the page cache for this open file.
const FOPEN_DIRECT_IO: u32 = 1;

/// Largest offset the kernel uses in lock requests, meaning "to end of file".
const OFFSET_MAX: u64 = i64::MAX as u64;

/// Capabilities asked of the kernel at init. Without POSIX locks the kernel handles
/// `fcntl` locking itself and never sends getlk/setlk.
const REQUESTED_CAPABILITIES: u64 = FUSE_POSIX_LOCKS;

/// Kernel-side result of a request: the reply payload or an errno.
type OpResult<T> = Result<T, i32>;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    ReplyEntry,
    ReplyAttr,
    ReplyDirectory,
    ReplyOpen,
    ReplyData,
    ReplyWrite,
    ReplyEmpty,
    ReplyCreate,
    ReplyLock,
    ReplyStatfs,
);

/// Kernel lock ranges are inclusive; the lock manager works with exclusive ends.
fn exclusive_end(end: u64) -> u64 {
    if end >= OFFSET_MAX {
        WHOLE_FILE_END
    } else {
        end + 1
    }
}

fn inclusive_end(end: u64) -> u64 {
    if end == WHOLE_FILE_END {
        OFFSET_MAX
    } else {
        end.saturating_sub(1)
    }
}

fn join_child(parent: &str, name: &OsStr) -> String {
    let name = name.to_string_lossy();
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn is_write_open(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0
}

/// A mounted backend.
pub struct AbsFuse<F: FileSystem> {
    fs: F,
    ctx: Arc<Context<F::File>>,
    options: MountOptions,
    /// Inodes the kernel currently knows about, and the path each one names.
    nodes: HashMap<u64, String>,
}

impl<F: FileSystem> AbsFuse<F> {
    pub fn new(fs: F, options: MountOptions) -> Self {
        let ctx = Arc::new(Context::new(options.mountpoint.clone(), &options.cache));
        Self {
            fs,
            ctx,
            options,
            nodes: HashMap::new(),
        }
    }

    pub fn context(&self) -> Arc<Context<F::File>> {
        Arc::clone(&self.ctx)
    }

    fn node_path(&self, ino: u64) -> Option<String> {
        if ino == ROOT_INODE {
            return Some("/".to_string());
        }
        self.nodes.get(&ino).cloned()
    }

    /// Count the request and refuse it once the mount is going away.
    fn begin(&self) -> Result<(), i32> {
        self.ctx.stats.record_operation();
        if self.ctx.is_unmounting() {
            return Err(libc::ENOTCONN);
        }
        Ok(())
    }

    fn fail<R: FuseReply>(&self, reply: R, errno: i32) {
        self.ctx.stats.record_error();
        reply.error(errno);
    }

    fn finish<T, R: FuseReply>(&self, reply: R, result: OpResult<T>, ok: impl FnOnce(R, T)) {
        match result {
            Ok(value) => ok(reply, value),
            Err(errno) => self.fail(reply, errno),
        }
    }

    /// Log a failed backend call and pick the errno the kernel gets for it.
    fn io_errno(&self, op: &'static str, path: &str, err: &io::Error) -> i32 {
        let errno = match errno_of(err) {
            0 => libc::EIO,
            code => code,
        };
        if errno == libc::ENOENT {
            debug!(op, path, "not found");
        } else {
            warn!(op, path, error = %err, "backend call failed");
        }
        errno
    }

    fn writable(&self) -> OpResult<()> {
        if self.options.read_only {
            return Err(libc::EROFS);
        }
        Ok(())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> OpResult<(String, String)> {
        let parent_path = self.node_path(parent).ok_or(libc::ENOENT)?;
        let path = join_child(&parent_path, name);
        Ok((parent_path, path))
    }

    /// Inode the kernel knows the parent of `path` by. Falls back to the root when the
    /// parent was never looked up.
    fn parent_ino(&self, path: &str) -> u64 {
        let parent = parent_of(path);
        if parent == "/" {
            return ROOT_INODE;
        }
        self.nodes
            .iter()
            .find_map(|(ino, p)| (*p == parent).then_some(*ino))
            .unwrap_or(ROOT_INODE)
    }

    fn to_attr(&self, ino: u64, metadata: &Metadata) -> FileAttr {
        FileAttr {
            ino,
            size: metadata.size,
            blocks: metadata.size.div_ceil(512),
            atime: metadata.atime,
            mtime: metadata.mtime,
            ctime: metadata.ctime,
            crtime: metadata.ctime,
            kind: metadata.kind,
            perm: metadata.perm,
            nlink: metadata.nlink,
            uid: self.options.uid.unwrap_or(metadata.uid),
            gid: self.options.gid.unwrap_or(metadata.gid),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Stat `path`, assign its inode and refresh the attribute cache.
    fn refresh_attr(&self, path: &str) -> io::Result<FileAttr> {
        let metadata = self.fs.stat(path)?;
        Ok(self.remember_attr(path, &metadata))
    }

    fn remember_attr(&self, path: &str, metadata: &Metadata) -> FileAttr {
        let ino = self.ctx.inodes.get_identity(path, metadata.state());
        let attr = self.to_attr(ino, metadata);
        self.ctx.inodes.cache_attribute(path, attr);
        attr
    }

    fn list_dir(&self, path: &str) -> io::Result<Arc<[DirEntry]>> {
        if let Some(entries) = self.ctx.inodes.get_cached_directory(path) {
            return Ok(entries);
        }

        let entries: Vec<DirEntry> = self
            .fs
            .read_dir(path)?
            .into_iter()
            .map(|info| {
                let child = join_child(path, OsStr::new(&info.name));
                DirEntry {
                    ino: self.ctx.inodes.get_identity(&child, info.metadata.state()),
                    kind: info.metadata.kind,
                    name: info.name,
                }
            })
            .collect();

        let listing: Arc<[DirEntry]> = Arc::from(entries.clone());
        self.ctx.inodes.cache_directory(path, entries);
        Ok(listing)
    }

    fn open_flags(&self) -> u32 {
        if self.options.direct_io {
            FOPEN_DIRECT_IO
        } else {
            0
        }
    }

    fn attr_ttl(&self) -> Duration {
        self.options.attr_timeout()
    }

    fn entry_ttl(&self) -> Duration {
        self.options.entry_timeout()
    }

    /// Point every known inode under `from` at the same place under `to`.
    fn rename_nodes(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        for path in self.nodes.values_mut() {
            if path == from {
                *path = to.to_string();
            } else if let Some(rest) = path.strip_prefix(&prefix) {
                *path = format!("{to}/{rest}");
            }
        }
    }

    fn do_lookup(&mut self, parent: u64, name: &OsStr) -> OpResult<FileAttr> {
        self.begin()?;
        let (parent_path, path) = self.child_path(parent, name)?;
        debug!(parent = %parent_path, name = %name.to_string_lossy(), "FUSE lookup");

        let attr = self
            .refresh_attr(&path)
            .map_err(|e| self.io_errno("lookup", &path, &e))?;
        self.nodes.insert(attr.ino, path);
        Ok(attr)
    }

    fn do_getattr(&self, ino: u64) -> OpResult<FileAttr> {
        self.begin()?;
        let path = self.node_path(ino).ok_or(libc::ENOENT)?;
        debug!(path = %path, "FUSE getattr");

        let attr = match self.ctx.inodes.get_cached_attribute(&path) {
            Some(attr) => attr,
            None => self
                .refresh_attr(&path)
                .map_err(|e| self.io_errno("getattr", &path, &e))?,
        };
        // The kernel addresses this node by the inode it was given at lookup time.
        Ok(FileAttr { ino, ..attr })
    }

    fn do_setattr(&self, ino: u64, changes: AttrChanges) -> OpResult<FileAttr> {
        self.begin()?;
        self.writable()?;
        let path = self.node_path(ino).ok_or(libc::ENOENT)?;
        debug!(path = %path, mode = ?changes.mode, size = ?changes.size, "FUSE setattr");

        if let Some(size) = changes.size {
            let open_file = changes.fh.and_then(|fh| self.ctx.handles.get(fh));
            let result = match open_file {
                Some(file) => file.set_len(size),
                None => self.fs.truncate(&path, size),
            };
            result.map_err(|e| self.io_errno("truncate", &path, &e))?;
        }

        if let Some(mode) = changes.mode {
            self.fs
                .chmod(&path, mode)
                .map_err(|e| self.io_errno("chmod", &path, &e))?;
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            debug!(path = %path, uid = ?changes.uid, gid = ?changes.gid, "ownership changes are not passed through");
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            let current = self
                .fs
                .stat(&path)
                .map_err(|e| self.io_errno("chtimes", &path, &e))?;
            let atime = changes.atime.map_or(current.atime, resolve_time);
            let mtime = changes.mtime.map_or(current.mtime, resolve_time);
            self.fs
                .chtimes(&path, atime, mtime)
                .map_err(|e| self.io_errno("chtimes", &path, &e))?;
        }

        self.ctx.inodes.invalidate_attribute(&path);
        let attr = self
            .refresh_attr(&path)
            .map_err(|e| self.io_errno("setattr", &path, &e))?;
        Ok(FileAttr { ino, ..attr })
    }

    fn do_mkdir(&mut self, parent: u64, name: &OsStr, mode: u32) -> OpResult<FileAttr> {
        self.begin()?;
        self.writable()?;
        let (parent_path, path) = self.child_path(parent, name)?;
        debug!(path = %path, mode, "FUSE mkdir");

        self.fs
            .mkdir(&path, mode)
            .map_err(|e| self.io_errno("mkdir", &path, &e))?;
        self.ctx.inodes.invalidate_directory(&parent_path);
        self.new_entry("mkdir", path)
    }

    /// Stat a node that was just created and hand it to the kernel.
    fn new_entry(&mut self, op: &'static str, path: String) -> OpResult<FileAttr> {
        let attr = self
            .refresh_attr(&path)
            .map_err(|e| self.io_errno(op, &path, &e))?;
        self.nodes.insert(attr.ino, path);
        Ok(attr)
    }

    fn do_remove(&self, parent: u64, name: &OsStr, want_dir: bool) -> OpResult<()> {
        let op = if want_dir { "rmdir" } else { "unlink" };
        self.begin()?;
        self.writable()?;
        let (parent_path, path) = self.child_path(parent, name)?;
        debug!(path = %path, "FUSE {op}");

        let metadata = self.fs.stat(&path).map_err(|e| self.io_errno(op, &path, &e))?;
        match (want_dir, metadata.is_dir()) {
            (true, false) => return Err(libc::ENOTDIR),
            (false, true) => return Err(libc::EISDIR),
            _ => {}
        }

        self.fs.remove(&path).map_err(|e| self.io_errno(op, &path, &e))?;
        if want_dir {
            self.ctx.inodes.remove_subtree(&path);
        } else {
            self.ctx.inodes.remove_path(&path);
        }
        self.ctx.inodes.invalidate_directory(&parent_path);
        Ok(())
    }

    fn do_rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> OpResult<()> {
        self.begin()?;
        self.writable()?;
        let (old_parent, old_path) = self.child_path(parent, name)?;
        let (new_parent, new_path) = self.child_path(newparent, newname)?;
        debug!(old = %old_path, new = %new_path, "FUSE rename");

        self.fs
            .rename(&old_path, &new_path)
            .map_err(|e| self.io_errno("rename", &old_path, &e))?;

        // A renamed directory takes its whole subtree along.
        self.ctx.inodes.remove_subtree(&old_path);
        self.ctx.inodes.remove_subtree(&new_path);
        self.ctx.inodes.invalidate_directory(&old_parent);
        self.ctx.inodes.invalidate_directory(&new_parent);
        self.rename_nodes(&old_path, &new_path);
        Ok(())
    }

    fn do_open(&self, ino: u64, flags: i32) -> OpResult<u64> {
        self.begin()?;
        let path = self.node_path(ino).ok_or(libc::ENOENT)?;
        debug!(path = %path, flags, "FUSE open");
        if is_write_open(flags) {
            self.writable()?;
        }

        let file = self
            .fs
            .open(&path, flags, 0)
            .map_err(|e| self.io_errno("open", &path, &e))?;
        if flags & libc::O_TRUNC != 0 {
            self.ctx.inodes.invalidate_attribute(&path);
        }
        Ok(self.ctx.handles.add(Arc::new(file), flags, path))
    }

    /// Read into a pooled buffer. The caller replies with `buf[..n]` and returns the
    /// buffer to the pool.
    fn do_read(&self, fh: u64, offset: i64, size: u32) -> OpResult<(Vec<u8>, usize)> {
        self.begin()?;
        let file = self.ctx.handles.get(fh).ok_or(libc::EBADF)?;
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;

        let mut buf = self.ctx.buffers.get(size as usize);
        match file.read_at(&mut buf, offset) {
            Ok(n) => {
                self.ctx.stats.record_read(n);
                Ok((buf, n))
            }
            Err(e) if errno_of(&e) == 0 => Ok((buf, 0)),
            Err(e) => {
                self.ctx.buffers.put(buf);
                warn!(fh, offset, error = %e, "read failed");
                Err(errno_of(&e))
            }
        }
    }

    fn do_write(&self, fh: u64, offset: i64, data: &[u8]) -> OpResult<u32> {
        self.begin()?;
        self.writable()?;
        let entry = self.ctx.handles.get_entry(fh).ok_or(libc::EBADF)?;
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;

        let n = entry
            .resource
            .write_at(data, offset)
            .map_err(|e| self.io_errno("write", &entry.path, &e))?;
        self.ctx.stats.record_write(n);
        self.ctx.inodes.invalidate_attribute(&entry.path);
        Ok(n as u32)
    }

    fn do_sync(&self, fh: u64, op: &'static str, always: bool) -> OpResult<()> {
        self.begin()?;
        let entry = self.ctx.handles.get_entry(fh).ok_or(libc::EBADF)?;
        if always || is_write_open(entry.flags) {
            entry
                .resource
                .sync()
                .map_err(|e| self.io_errno(op, &entry.path, &e))?;
        }
        Ok(())
    }

    fn do_release(&self, fh: u64) -> OpResult<()> {
        self.ctx.stats.record_operation();
        debug!(fh, "FUSE release");

        // Locks are owned by the handle, so they go away with it.
        self.ctx.locks.release_owner(fh);
        if let Some(entry) = self.ctx.handles.get_entry(fh) {
            self.ctx.inodes.invalidate_attribute(&entry.path);
        }
        self.ctx.handles.release(fh).map_err(|e| e.errno())
    }

    /// Entries from `offset` on, each paired with the offset of the one after it.
    fn do_readdir(&self, ino: u64, offset: i64) -> OpResult<Vec<(u64, i64, FileType, String)>> {
        self.begin()?;
        let path = self.node_path(ino).ok_or(libc::ENOENT)?;
        debug!(path = %path, offset, "FUSE readdir");

        let children = self
            .list_dir(&path)
            .map_err(|e| self.io_errno("readdir", &path, &e))?;

        let dots = [
            (ino, FileType::Directory, "."),
            (self.parent_ino(&path), FileType::Directory, ".."),
        ];
        let skip = usize::try_from(offset).unwrap_or(0);
        Ok(dots
            .into_iter()
            .chain(children.iter().map(|e| (e.ino, e.kind, e.name.as_str())))
            .enumerate()
            .skip(skip)
            .map(|(i, (child_ino, kind, name))| (child_ino, (i + 1) as i64, kind, name.to_string()))
            .collect())
    }

    fn do_statfs(&self) -> OpResult<StatFs> {
        self.begin()?;
        let stat = self
            .fs
            .statfs()
            .map_err(|e| self.io_errno("statfs", "/", &e))?;
        Ok(stat.unwrap_or_default())
    }

    fn do_create(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> OpResult<(FileAttr, u64)> {
        self.begin()?;
        self.writable()?;
        let (parent_path, path) = self.child_path(parent, name)?;
        debug!(path = %path, mode, flags, "FUSE create");

        let file = self
            .fs
            .open(&path, flags | libc::O_CREAT, mode)
            .map_err(|e| self.io_errno("create", &path, &e))?;
        let metadata = match file.stat() {
            Ok(m) => m,
            Err(e) => {
                let _ = file.close();
                return Err(self.io_errno("create", &path, &e));
            }
        };
        self.ctx.inodes.invalidate_directory(&parent_path);

        let attr = self.remember_attr(&path, &metadata);
        let fh = self.ctx.handles.add(Arc::new(file), flags, path.clone());
        self.nodes.insert(attr.ino, path);
        Ok((attr, fh))
    }

    /// Returns the conflicting lock in kernel form, or the request itself with
    /// `F_UNLCK` when nothing conflicts.
    fn do_getlk(
        &self,
        fh: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
    ) -> OpResult<(u64, u64, i32, u32)> {
        self.begin()?;
        let entry = self.ctx.handles.get_entry(fh).ok_or(libc::EBADF)?;
        let kind = RangeKind::from_fcntl(typ).ok_or(libc::EINVAL)?;

        let candidate = RangeLock::new(start, exclusive_end(end), kind, pid);
        Ok(match self.ctx.locks.test_range(&entry.path, fh, &candidate) {
            Some(held) => (
                held.start,
                inclusive_end(held.end),
                held.kind.to_fcntl(),
                held.pid,
            ),
            None => (start, end, RangeKind::Unlock.to_fcntl(), pid),
        })
    }

    fn do_setlk(
        &self,
        fh: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
    ) -> OpResult<()> {
        self.begin()?;
        let entry = self.ctx.handles.get_entry(fh).ok_or(libc::EBADF)?;
        let kind = RangeKind::from_fcntl(typ).ok_or(libc::EINVAL)?;
        debug!(path = %entry.path, fh, start, end, ?kind, sleep, "FUSE setlk");

        let lock = RangeLock::new(start, exclusive_end(end), kind, pid);
        let result = if sleep {
            self.ctx.locks.set_range_wait(&entry.path, fh, lock)
        } else {
            self.ctx.locks.set_range(&entry.path, fh, lock)
        };
        // A conflict is an answer, not a failure.
        result.map_err(|e| e.errno())
    }

    fn do_symlink(&mut self, parent: u64, name: &OsStr, target: &Path) -> OpResult<FileAttr> {
        self.begin()?;
        self.writable()?;
        let (parent_path, path) = self.child_path(parent, name)?;
        debug!(path = %path, target = %target.display(), "FUSE symlink");

        self.fs
            .symlink(target, &path)
            .map_err(|e| self.io_errno("symlink", &path, &e))?;
        self.ctx.inodes.invalidate_directory(&parent_path);
        self.new_entry("symlink", path)
    }

    fn do_readlink(&self, ino: u64) -> OpResult<Vec<u8>> {
        self.begin()?;
        let path = self.node_path(ino).ok_or(libc::ENOENT)?;
        debug!(path = %path, "FUSE readlink");

        let target = self
            .fs
            .readlink(&path)
            .map_err(|e| self.io_errno("readlink", &path, &e))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn do_link(&mut self, ino: u64, newparent: u64, newname: &OsStr) -> OpResult<FileAttr> {
        self.begin()?;
        self.writable()?;
        let source = self.node_path(ino).ok_or(libc::ENOENT)?;
        let (parent_path, path) = self.child_path(newparent, newname)?;
        debug!(source = %source, path = %path, "FUSE link");

        self.fs
            .link(&source, &path)
            .map_err(|e| self.io_errno("link", &path, &e))?;
        // The link count of the source changed.
        self.ctx.inodes.invalidate_attribute(&source);
        self.ctx.inodes.invalidate_directory(&parent_path);
        self.new_entry("link", path)
    }

    /// Reserve space in an open file. A backend without an allocator still gets a plain
    /// allocation by growing the file; other modes stay unsupported.
    fn do_fallocate(&self, fh: u64, offset: i64, length: i64, mode: i32) -> OpResult<()> {
        self.begin()?;
        self.writable()?;
        let entry = self.ctx.handles.get_entry(fh).ok_or(libc::EBADF)?;
        let (Ok(offset), Ok(length)) = (u64::try_from(offset), u64::try_from(length)) else {
            return Err(libc::EINVAL);
        };
        debug!(path = %entry.path, fh, offset, length, mode, "FUSE fallocate");

        match entry.resource.allocate(offset, length, mode) {
            Ok(()) => {}
            Err(e) if mode == 0 && errno_of(&e) == libc::ENOTSUP => {
                let wanted = offset.checked_add(length).ok_or(libc::EFBIG)?;
                let current = entry
                    .resource
                    .stat()
                    .map_err(|e| self.io_errno("fallocate", &entry.path, &e))?;
                if wanted > current.size {
                    entry
                        .resource
                        .set_len(wanted)
                        .map_err(|e| self.io_errno("fallocate", &entry.path, &e))?;
                }
            }
            Err(e) => return Err(self.io_errno("fallocate", &entry.path, &e)),
        }
        self.ctx.inodes.invalidate_attribute(&entry.path);
        Ok(())
    }
}

/// The subset of a setattr request the binding acts on.
struct AttrChanges {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
    fh: Option<u64>,
}

impl<F: FileSystem> Filesystem for AbsFuse<F> {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if let Err(missing) = config.add_capabilities(REQUESTED_CAPABILITIES) {
            debug!(missing, "kernel refused capabilities, locks stay kernel-local");
        }
        if let Err(nearest) = config.set_max_write(self.options.max_write) {
            debug!(requested = self.options.max_write, nearest, "max_write clamped");
            let _ = config.set_max_write(nearest);
        }
        if let Err(nearest) = config.set_max_readahead(self.options.max_readahead) {
            debug!(requested = self.options.max_readahead, nearest, "max_readahead clamped");
            let _ = config.set_max_readahead(nearest);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.ctx.shutdown();
        self.nodes.clear();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.do_lookup(parent, name);
        let ttl = self.entry_ttl();
        self.finish(reply, result, |reply, attr| reply.entry(&ttl, &attr, 0));
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        if ino != ROOT_INODE {
            self.nodes.remove(&ino);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.do_getattr(ino);
        let ttl = self.attr_ttl();
        self.finish(reply, result, |reply, attr| reply.attr(&ttl, &attr));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
        };
        let result = self.do_setattr(ino, changes);
        let ttl = self.attr_ttl();
        self.finish(reply, result, |reply, attr| reply.attr(&ttl, &attr));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.do_mkdir(parent, name, mode & !umask);
        let ttl = self.entry_ttl();
        self.finish(reply, result, |reply, attr| reply.entry(&ttl, &attr, 0));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.do_remove(parent, name, false);
        self.finish(reply, result, |reply, ()| reply.ok());
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.do_remove(parent, name, true);
        self.finish(reply, result, |reply, ()| reply.ok());
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.do_symlink(parent, link_name, target);
        let ttl = self.entry_ttl();
        self.finish(reply, result, |reply, attr| reply.entry(&ttl, &attr, 0));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.do_readlink(ino);
        self.finish(reply, result, |reply, target| reply.data(&target));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.do_link(ino, newparent, newname);
        let ttl = self.entry_ttl();
        self.finish(reply, result, |reply, attr| reply.entry(&ttl, &attr, 0));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.do_rename(parent, name, newparent, newname);
        self.finish(reply, result, |reply, ()| reply.ok());
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.do_open(ino, flags);
        let open_flags = self.open_flags();
        self.finish(reply, result, |reply, fh| reply.opened(fh, open_flags));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(fh, offset, size) {
            Ok((buf, n)) => {
                reply.data(&buf[..n]);
                self.ctx.buffers.put(buf);
            }
            Err(errno) => self.fail(reply, errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.do_write(fh, offset, data);
        self.finish(reply, result, |reply, n| reply.written(n));
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let result = self.do_sync(fh, "flush", false);
        self.finish(reply, result, |reply, ()| reply.ok());
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let result = self.do_sync(fh, "fsync", true);
        self.finish(reply, result, |reply, ()| reply.ok());
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.do_release(fh);
        self.finish(reply, result, |reply, ()| reply.ok());
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.do_readdir(ino, offset) {
            Ok(entries) => entries,
            Err(errno) => return self.fail(reply, errno),
        };
        for (child_ino, next, kind, name) in entries {
            if reply.add(child_ino, next, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let result = self.do_statfs();
        self.finish(reply, result, |reply, stat| {
            reply.statfs(
                stat.blocks,
                stat.blocks_free,
                stat.blocks_available,
                stat.files,
                stat.files_free,
                stat.block_size,
                stat.name_max,
                stat.block_size,
            );
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.do_create(parent, name, mode & !umask, flags);
        let ttl = self.entry_ttl();
        let open_flags = self.open_flags();
        self.finish(reply, result, |reply, (attr, fh)| {
            reply.created(&ttl, &attr, 0, fh, open_flags);
        });
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let result = self.do_getlk(fh, start, end, typ, pid);
        self.finish(reply, result, |reply, (start, end, typ, pid)| {
            reply.locked(start, end, typ, pid);
        });
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_setlk(fh, start, end, typ, pid, sleep) {
            Ok(()) => reply.ok(),
            // Lock conflicts are not counted as errors.
            Err(errno) => reply.error(errno),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let result = self.do_fallocate(fh, offset, length, mode);
        self.finish(reply, result, |reply, ()| reply.ok());
    }
}
