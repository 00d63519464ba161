//! The narrow contract a storage backend has to satisfy to be mounted.
//!
//! Paths are absolute within the backend, `/` being its root.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fuser::FileType;

use crate::handles::Resource;
use crate::inode::FileState;

mod local;

pub use local::{LocalFile, LocalFs};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileType,
    pub size: u64,
    /// Permission bits only, no file type.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Metadata {
    pub fn state(&self) -> FileState {
        FileState::new(self.mtime, self.size)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub metadata: Metadata,
}

/// Filesystem-level usage figures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
}

impl Default for StatFs {
    /// Figures reported for backends with no notion of capacity.
    fn default() -> Self {
        Self {
            blocks: 1 << 30,
            blocks_free: 1 << 30,
            blocks_available: 1 << 30,
            files: 1 << 20,
            files_free: 1 << 20,
            block_size: 4096,
            name_max: 255,
        }
    }
}

/// An open file. Closing goes through [`Resource::close`] and happens once.
pub trait File: Resource {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;
    fn sync(&self) -> io::Result<()>;
    fn set_len(&self, size: u64) -> io::Result<()>;
    fn stat(&self) -> io::Result<Metadata>;

    /// Reserve `len` bytes at `offset`, as `fallocate(2)` with the given `mode`.
    ///
    /// Backends without an allocator leave this alone; the binding then emulates a
    /// plain (mode 0) allocation by growing the file.
    fn allocate(&self, _offset: u64, _len: u64, _mode: i32) -> io::Result<()> {
        Err(unsupported())
    }
}

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTSUP)
}

pub trait FileSystem: Send + Sync + 'static {
    type File: File + 'static;

    /// Open (and with `O_CREAT`, create) a file. `flags` are `open(2)` flags.
    fn open(&self, path: &str, flags: i32, mode: u32) -> io::Result<Self::File>;
    fn stat(&self, path: &str) -> io::Result<Metadata>;
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntryInfo>>;
    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    /// Remove a file or an empty directory.
    fn remove(&self, path: &str) -> io::Result<()>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;
    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;
    fn truncate(&self, path: &str, size: u64) -> io::Result<()>;

    fn statfs(&self) -> io::Result<Option<StatFs>> {
        Ok(None)
    }

    /// Create a symbolic link at `path` pointing to `target`.
    fn symlink(&self, _target: &Path, _path: &str) -> io::Result<()> {
        Err(unsupported())
    }

    fn readlink(&self, _path: &str) -> io::Result<PathBuf> {
        Err(unsupported())
    }

    /// Create a hard link `to` naming the same file as `from`.
    fn link(&self, _from: &str, _to: &str) -> io::Result<()> {
        Err(unsupported())
    }
}
