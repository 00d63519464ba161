#![allow(clippy::unwrap_used, missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use absfuse::inode::{DirEntry, FileState, InodeManager, ROOT_INODE};
use fuser::{FileAttr, FileType};

fn manager() -> InodeManager {
    InodeManager::new(16, 16, Duration::ZERO, Duration::ZERO)
}

fn state(secs: u64, size: u64) -> FileState {
    FileState::new(UNIX_EPOCH + Duration::from_secs(secs), size)
}

fn attr(ino: u64, size: u64) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::RegularFile,
        perm: 0o644,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

#[test]
fn unchanged_state_keeps_identity() {
    let inodes = manager();
    let first = inodes.get_identity("/a", state(10, 5));
    for _ in 0..10 {
        assert_eq!(inodes.get_identity("/a", state(10, 5)), first);
    }
    assert!(first > ROOT_INODE, "root inode is never issued");
}

#[test]
fn changed_mtime_or_size_reallocates() {
    let inodes = manager();
    let original = inodes.get_identity("/a", state(10, 5));

    let after_write = inodes.get_identity("/a", state(10, 6));
    assert_ne!(after_write, original);

    let after_touch = inodes.get_identity("/a", state(11, 6));
    assert_ne!(after_touch, after_write);
    assert_ne!(after_touch, original);

    assert_eq!(inodes.path_of(original), None, "stale inode is retired");
    assert_eq!(inodes.path_of(after_touch).as_deref(), Some("/a"));
}

#[test]
fn distinct_paths_get_distinct_identities() {
    let inodes = manager();
    let a = inodes.get_identity("/a", state(1, 1));
    let b = inodes.get_identity("/b", state(1, 1));
    assert_ne!(a, b);
    assert_eq!(inodes.stats().identities, 2);
}

#[test]
fn allocated_counts_retired_inodes_too() {
    let inodes = manager();
    inodes.get_identity("/a", state(1, 1));
    inodes.get_identity("/a", state(2, 1));
    inodes.get_identity("/a", state(3, 1));

    let stats = inodes.stats();
    assert_eq!(stats.identities, 1);
    assert_eq!(stats.allocated, 3);
}

#[test]
fn remove_path_forgets_identity_and_cached_state() {
    let inodes = manager();
    let ino = inodes.get_identity("/a", state(1, 1));
    inodes.cache_attribute("/a", attr(ino, 1));

    inodes.remove_path("/a");

    assert_eq!(inodes.path_of(ino), None);
    assert!(inodes.get_cached_attribute("/a").is_none());
    let again = inodes.get_identity("/a", state(1, 1));
    assert_ne!(again, ino, "a recreated path gets a fresh inode");
}

#[test]
fn remove_subtree_drops_descendants_but_not_siblings() {
    let inodes = manager();
    let dir = inodes.get_identity("/a", state(1, 0));
    let child = inodes.get_identity("/a/sub", state(1, 0));
    let grandchild = inodes.get_identity("/a/sub/f", state(1, 3));
    let sibling = inodes.get_identity("/ab", state(1, 0));
    inodes.cache_attribute("/a/sub/f", attr(grandchild, 3));
    inodes.cache_attribute("/ab", attr(sibling, 0));
    inodes.cache_directory(
        "/a/sub",
        vec![DirEntry {
            name: "f".to_string(),
            ino: grandchild,
            kind: FileType::RegularFile,
        }],
    );

    assert_eq!(inodes.remove_subtree("/a"), 3);

    for ino in [dir, child, grandchild] {
        assert_eq!(inodes.path_of(ino), None);
    }
    assert!(inodes.get_cached_directory("/a/sub").is_none());
    assert!(inodes.get_cached_attribute("/a/sub/f").is_none());
    assert_eq!(inodes.path_of(sibling).as_deref(), Some("/ab"));
    assert!(inodes.get_cached_attribute("/ab").is_some());
    assert_eq!(inodes.stats().identities, 1);
}

#[test]
fn remove_subtree_of_root_forgets_everything() {
    let inodes = manager();
    inodes.get_identity("/a", state(1, 0));
    inodes.get_identity("/b/c", state(1, 0));

    assert_eq!(inodes.remove_subtree("/"), 2);
    assert_eq!(inodes.stats().identities, 0);
}

#[test]
fn attribute_cache_round_trip_and_invalidation() {
    let inodes = manager();
    let ino = inodes.get_identity("/f", state(3, 100));
    inodes.cache_attribute("/f", attr(ino, 100));

    let cached = inodes.get_cached_attribute("/f").unwrap();
    assert_eq!(cached.ino, ino);
    assert_eq!(cached.size, 100);

    inodes.invalidate_attribute("/f");
    assert!(inodes.get_cached_attribute("/f").is_none());
}

#[test]
fn directory_cache_round_trip_and_invalidation() {
    let inodes = manager();
    let entries = vec![
        DirEntry {
            name: "x".to_string(),
            ino: 7,
            kind: FileType::RegularFile,
        },
        DirEntry {
            name: "sub".to_string(),
            ino: 8,
            kind: FileType::Directory,
        },
    ];
    inodes.cache_directory("/d", entries.clone());

    let cached = inodes.get_cached_directory("/d").unwrap();
    assert_eq!(&cached[..], &entries[..]);

    inodes.invalidate_directory("/d");
    assert!(inodes.get_cached_directory("/d").is_none());
}

#[test]
fn attribute_cache_expires() {
    let ttl = Duration::from_millis(150);
    let inodes = InodeManager::new(16, 16, ttl, ttl);
    inodes.cache_attribute("/f", attr(2, 0));
    assert!(inodes.get_cached_attribute("/f").is_some());

    thread::sleep(ttl * 2);
    assert!(inodes.get_cached_attribute("/f").is_none());
}

#[test]
fn attribute_cache_is_bounded() {
    let inodes = InodeManager::new(4, 4, Duration::ZERO, Duration::ZERO);
    for i in 0..20 {
        inodes.cache_attribute(&format!("/f{i}"), attr(i + 2, 0));
    }
    let stats = inodes.stats();
    assert_eq!(stats.attr_cache.size, 4);
    assert_eq!(stats.attr_cache.evictions, 16);
}

#[test]
fn clear_resets_tables_but_not_the_allocator() {
    let inodes = manager();
    let before = inodes.get_identity("/a", state(1, 1));
    inodes.cache_attribute("/a", attr(before, 1));
    inodes.cache_directory("/", Vec::new());

    inodes.clear();

    let stats = inodes.stats();
    assert_eq!(stats.identities, 0);
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.attr_cache.size, 0);
    assert_eq!(stats.dir_cache.size, 0);
    assert_eq!(inodes.path_of(before), None);

    let after = inodes.get_identity("/a", state(1, 1));
    assert!(after > before, "numbers from before the reset are not reissued");
}

#[test]
fn concurrent_callers_agree_on_identity() {
    let inodes = Arc::new(manager());
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let inodes = Arc::clone(&inodes);
            thread::spawn(move || {
                (0..50)
                    .map(|i| inodes.get_identity(&format!("/p{i}"), state(1, i)))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let results: Vec<Vec<u64>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }
    let unique: HashSet<_> = results[0].iter().collect();
    assert_eq!(unique.len(), 50);
}
