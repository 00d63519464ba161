//! Mounting a backend and tearing the mount down again.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::BackgroundSession;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::FileSystem;
use crate::context::Context;
use crate::fuse::AbsFuse;
use crate::handles::Resource;
use crate::options::MountOptions;
use crate::stats::Stats;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mountpoint is empty")]
    EmptyMountpoint,

    #[error("mountpoint is not an empty directory: {}", .0.display())]
    NotEmpty(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Create the mountpoint if missing and refuse one that already has content.
fn prepare_mountpoint(mountpoint: &Path) -> Result<(), MountError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(MountError::EmptyMountpoint);
    }

    fs::create_dir_all(mountpoint)?;
    if fs::read_dir(mountpoint)?.next().is_some() {
        return Err(MountError::NotEmpty(mountpoint.to_path_buf()));
    }
    Ok(())
}

/// Whether something is mounted at `path`, judged by `path` sitting on a different
/// device than its parent directory. The filesystem root always counts as mounted.
pub fn is_mounted(path: impl AsRef<Path>) -> io::Result<bool> {
    let path = std::path::absolute(path)?;
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let own = fs::metadata(&path)?;
    let above = fs::metadata(parent)?;
    Ok(own.dev() != above.dev())
}

/// A live mount running on fuser's background thread.
pub struct MountHandle<R: Resource + ?Sized> {
    mountpoint: PathBuf,
    ctx: Arc<Context<R>>,
    session: Option<BackgroundSession>,
}

impl<R: Resource + ?Sized> MountHandle<R> {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn stats(&self) -> Stats {
        self.ctx.snapshot()
    }

    /// Stop serving requests, close every open handle and unmount.
    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!(mountpoint = %self.mountpoint.display(), "unmounting");
        self.ctx.shutdown();
        session.join();
    }
}

impl<R: Resource + ?Sized> Drop for MountHandle<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Mount `fs` at `options.mountpoint` and serve it in the background.
pub fn mount<F: FileSystem>(
    fs: F,
    options: MountOptions,
) -> Result<MountHandle<F::File>, MountError> {
    prepare_mountpoint(&options.mountpoint)?;

    let mountpoint = options.mountpoint.clone();
    let fuser_options = options.fuser_options();
    let adapter = AbsFuse::new(fs, options);
    let ctx = adapter.context();

    let session = fuser::spawn_mount2(adapter, &mountpoint, &fuser_options)?;
    info!(mountpoint = %mountpoint.display(), "mounted");

    Ok(MountHandle {
        mountpoint,
        ctx,
        session: Some(session),
    })
}

/// Mount `fs` and serve it on the calling thread until the filesystem is unmounted.
pub fn mount_and_wait<F: FileSystem>(fs: F, options: MountOptions) -> Result<(), MountError> {
    prepare_mountpoint(&options.mountpoint)?;

    let mountpoint = options.mountpoint.clone();
    let fuser_options = options.fuser_options();
    let adapter = AbsFuse::new(fs, options);
    let ctx = adapter.context();

    info!(mountpoint = %mountpoint.display(), "serving");
    let result = fuser::mount2(adapter, &mountpoint, &fuser_options);

    let stats = ctx.snapshot();
    info!(
        operations = stats.operations,
        errors = stats.errors,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "session ended"
    );
    if let Err(e) = &result {
        warn!(mountpoint = %mountpoint.display(), error = %e, "session failed");
    }
    ctx.shutdown();
    result.map_err(MountError::from)
}
