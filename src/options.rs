use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sizing and expiry of the attribute and directory caches. Zero disables the
/// corresponding bound or expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub max_cached_inodes: usize,
    pub max_cached_dirs: usize,
    pub attr_cache_ttl_ms: u64,
    pub dir_cache_ttl_ms: u64,
}

impl CacheOptions {
    pub fn attr_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_cache_ttl_ms)
    }

    pub fn dir_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.dir_cache_ttl_ms)
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_cached_inodes: 10_000,
            max_cached_dirs: 1_000,
            attr_cache_ttl_ms: 5_000,
            dir_cache_ttl_ms: 5_000,
        }
    }
}

/// Everything needed to mount a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub mountpoint: PathBuf,
    /// Name shown in the mount table.
    pub fs_name: String,
    pub read_only: bool,
    /// Needs `user_allow_other` in /etc/fuse.conf.
    pub allow_other: bool,
    pub allow_root: bool,
    /// Let the kernel check permissions against the reported mode bits.
    pub default_permissions: bool,
    pub auto_unmount: bool,
    /// Report every file as owned by this uid / gid instead of the backend's.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Bypass the page cache for reads and writes.
    pub direct_io: bool,
    pub max_readahead: u32,
    pub max_write: u32,
    pub attr_timeout_ms: u64,
    pub entry_timeout_ms: u64,
    /// Raw options passed to the mount as-is.
    pub options: Vec<String>,
    pub cache: CacheOptions,
}

impl MountOptions {
    pub fn new(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            ..Self::default()
        }
    }

    pub fn attr_timeout(&self) -> Duration {
        Duration::from_millis(self.attr_timeout_ms)
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }

    pub(crate) fn fuser_options(&self) -> Vec<fuser::MountOption> {
        let mut options = vec![
            fuser::MountOption::FSName(self.fs_name.clone()),
            if self.read_only {
                fuser::MountOption::RO
            } else {
                fuser::MountOption::RW
            },
        ];

        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        if self.allow_root {
            options.push(fuser::MountOption::AllowRoot);
        }
        if self.default_permissions {
            options.push(fuser::MountOption::DefaultPermissions);
        }
        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }
        options.extend(
            self.options
                .iter()
                .map(|raw| fuser::MountOption::CUSTOM(raw.clone())),
        );
        options
    }
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::new(),
            fs_name: "absfuse".to_string(),
            read_only: false,
            allow_other: false,
            allow_root: false,
            default_permissions: true,
            auto_unmount: false,
            uid: None,
            gid: None,
            direct_io: false,
            max_readahead: 128 * 1024,
            max_write: 128 * 1024,
            attr_timeout_ms: 1_000,
            entry_timeout_ms: 1_000,
            options: Vec::new(),
            cache: CacheOptions::default(),
        }
    }
}
