//! Stateful core for exposing an abstract filesystem through FUSE.
//!
//! The kernel talks to [`fuse::AbsFuse`], which keeps three managers in a shared
//! [`context::Context`]:
//!
//! - [`inode::InodeManager`] hands out stable inode numbers and caches attributes and
//!   directory listings in [`cache::LruCache`]s.
//! - [`handles::HandleTracker`] issues file handles over open backend files.
//! - [`locks::LockManager`] implements flock and POSIX byte-range locks in user space.
//!
//! Data itself lives behind the [`backend::FileSystem`] trait.

pub mod backend;
pub mod cache;
pub mod context;
pub mod error;
pub mod fuse;
pub mod handles;
pub mod inode;
pub mod locks;
pub mod mount;
pub mod options;
pub mod pool;
pub mod stats;

pub use backend::{FileSystem, LocalFs};
pub use context::Context;
pub use fuse::AbsFuse;
pub use mount::{MountError, MountHandle, is_mounted, mount, mount_and_wait};
pub use options::{CacheOptions, MountOptions};
pub use stats::Stats;
