use std::fs::{self, FileTimes, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::FileType;
use parking_lot::RwLock;

use super::{DirEntryInfo, File, FileSystem, Metadata};
use crate::error::already_closed;
use crate::handles::Resource;

/// Backend serving a directory of the host filesystem.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

fn to_metadata(metadata: &fs::Metadata) -> Metadata {
    let kind = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };

    let ctime = UNIX_EPOCH
        + Duration::new(
            u64::try_from(metadata.ctime()).unwrap_or(0),
            u32::try_from(metadata.ctime_nsec()).unwrap_or(0),
        );

    Metadata {
        kind,
        size: metadata.len(),
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        atime: metadata.accessed().unwrap_or(UNIX_EPOCH),
        mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
        ctime,
    }
}

fn open_options(flags: i32, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };

    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    if flags & libc::O_CREAT != 0 {
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options.mode(mode);
    options
}

impl FileSystem for LocalFs {
    type File = LocalFile;

    fn open(&self, path: &str, flags: i32, mode: u32) -> io::Result<LocalFile> {
        let file = open_options(flags, mode).open(self.resolve(path))?;
        Ok(LocalFile {
            file: RwLock::new(Some(file)),
        })
    }

    fn stat(&self, path: &str) -> io::Result<Metadata> {
        fs::symlink_metadata(self.resolve(path)).map(|m| to_metadata(&m))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                metadata: to_metadata(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let target = self.resolve(path);
        fs::create_dir(&target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let target = self.resolve(path);
        if fs::symlink_metadata(&target)?.is_dir() {
            fs::remove_dir(target)
        } else {
            fs::remove_file(target)
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode & 0o7777))
    }

    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let target = self.resolve(path);
        let file = if fs::metadata(&target)?.is_dir() {
            fs::File::open(&target)?
        } else {
            OpenOptions::new().write(true).open(&target)?
        };
        let times = FileTimes::new().set_accessed(atime).set_modified(mtime);
        file.set_times(times)
    }

    fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.resolve(path))?
            .set_len(size)
    }

    fn symlink(&self, target: &Path, path: &str) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(path))
    }

    fn readlink(&self, path: &str) -> io::Result<PathBuf> {
        fs::read_link(self.resolve(path))
    }

    fn link(&self, from: &str, to: &str) -> io::Result<()> {
        fs::hard_link(self.resolve(from), self.resolve(to))
    }
}

/// An open host file. Dropped from the inner slot on close.
pub struct LocalFile {
    file: RwLock<Option<fs::File>>,
}

impl LocalFile {
    fn with_file<T>(&self, f: impl FnOnce(&fs::File) -> io::Result<T>) -> io::Result<T> {
        let guard = self.file.read();
        let file = guard.as_ref().ok_or_else(already_closed)?;
        f(file)
    }
}

impl Resource for LocalFile {
    fn close(&self) -> io::Result<()> {
        match self.file.write().take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(already_closed()),
        }
    }
}

impl File for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.with_file(|file| file.read_at(buf, offset))
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.with_file(|file| file.write_at(data, offset))
    }

    fn sync(&self) -> io::Result<()> {
        self.with_file(fs::File::sync_all)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        self.with_file(|file| file.set_len(size))
    }

    fn stat(&self) -> io::Result<Metadata> {
        self.with_file(|file| file.metadata().map(|m| to_metadata(&m)))
    }

    fn allocate(&self, offset: u64, len: u64, mode: i32) -> io::Result<()> {
        let (Ok(offset), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len))
        else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        self.with_file(|file| {
            // SAFETY: the descriptor stays open for the duration of the call, the read
            // guard in `with_file` keeps `close` out.
            let ret = unsafe { libc::fallocate(file.as_raw_fd(), mode, offset, len) };
            if ret == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        })
    }
}
