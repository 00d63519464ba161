#![allow(clippy::unwrap_used, missing_docs)]

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use absfuse::error::Errno;
use absfuse::handles::{HandleError, HandleTracker, Resource};

#[derive(Default)]
struct MockResource {
    closes: AtomicUsize,
    fail_with: Option<i32>,
}

impl MockResource {
    fn failing(errno: i32) -> Self {
        Self {
            closes: AtomicUsize::new(0),
            fail_with: Some(errno),
        }
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Resource for MockResource {
    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

#[test]
fn add_then_release_closes_once() {
    let tracker = HandleTracker::new();
    let resource = Arc::new(MockResource::default());
    let fh = tracker.add(Arc::clone(&resource), libc::O_RDONLY, "/a");

    assert!(tracker.get(fh).is_some());
    tracker.release(fh).unwrap();

    assert_eq!(resource.closes(), 1);
    assert!(tracker.get(fh).is_none());
    assert!(tracker.get_entry(fh).is_none());
}

#[test]
fn second_release_is_bad_handle() {
    let tracker = HandleTracker::new();
    let resource = Arc::new(MockResource::default());
    let fh = tracker.add(Arc::clone(&resource), 0, "/a");

    tracker.release(fh).unwrap();
    let err = tracker.release(fh).unwrap_err();

    assert!(matches!(err, HandleError::BadHandle(id) if id == fh));
    assert_eq!(err.errno(), libc::EBADF);
    assert_eq!(resource.closes(), 1, "never double-closed");
}

#[test]
fn unknown_handle_is_bad_handle() {
    let tracker: HandleTracker<MockResource> = HandleTracker::new();
    assert!(matches!(tracker.release(42), Err(HandleError::BadHandle(42))));
    assert!(matches!(tracker.share(42), Err(HandleError::BadHandle(42))));
    assert!(tracker.get(42).is_none());
}

#[test]
fn shared_handle_closes_on_last_release() {
    let tracker = HandleTracker::new();
    let resource = Arc::new(MockResource::default());
    let fh = tracker.add(Arc::clone(&resource), 0, "/a");

    assert_eq!(tracker.share(fh).unwrap(), 2);
    assert_eq!(tracker.get_entry(fh).unwrap().ref_count, 2);

    tracker.release(fh).unwrap();
    assert_eq!(resource.closes(), 0);
    assert!(tracker.get(fh).is_some());

    tracker.release(fh).unwrap();
    assert_eq!(resource.closes(), 1);
    assert!(tracker.get(fh).is_none());
}

#[test]
fn entry_keeps_flags_and_path() {
    let tracker = HandleTracker::new();
    let fh = tracker.add(
        Arc::new(MockResource::default()),
        libc::O_RDWR | libc::O_APPEND,
        "/dir/file",
    );
    let entry = tracker.get_entry(fh).unwrap();
    assert_eq!(entry.flags, libc::O_RDWR | libc::O_APPEND);
    assert_eq!(entry.path, "/dir/file");
    assert_eq!(entry.ref_count, 1);
}

#[test]
fn close_failure_still_removes_handle() {
    let tracker = HandleTracker::new();
    let resource = Arc::new(MockResource::failing(libc::EACCES));
    let fh = tracker.add(Arc::clone(&resource), 0, "/a");

    let err = tracker.release(fh).unwrap_err();
    assert!(matches!(err, HandleError::Close(_)));
    assert_eq!(err.errno(), libc::EACCES);

    assert!(tracker.get(fh).is_none());
    assert_eq!(tracker.count(), 0);
    assert!(matches!(tracker.release(fh), Err(HandleError::BadHandle(_))));
}

#[test]
fn identifiers_are_never_reused() {
    let tracker = HandleTracker::new();
    let mut seen = HashSet::new();
    for i in 0..1000 {
        let fh = tracker.add(Arc::new(MockResource::default()), 0, "/a");
        assert!(seen.insert(fh), "identifier {fh} issued twice");
        if i % 3 == 0 {
            tracker.release(fh).unwrap();
        }
    }
    assert_eq!(tracker.count(), 1000 - 334);
}

#[test]
fn concurrent_adds_get_distinct_identifiers() {
    let tracker = Arc::new(HandleTracker::new());
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                (0..200)
                    .map(|_| tracker.add(Arc::new(MockResource::default()), 0, "/a"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: HashSet<u64> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 1600);
    assert_eq!(tracker.count(), 1600);
}

#[test]
fn close_all_closes_everything_and_ignores_errors() {
    let tracker = HandleTracker::new();
    let good = Arc::new(MockResource::default());
    let bad = Arc::new(MockResource::failing(libc::EIO));
    let a = tracker.add(Arc::clone(&good), 0, "/good");
    let b = tracker.add(Arc::clone(&bad), 0, "/bad");
    tracker.share(a).unwrap();

    tracker.close_all();

    assert_eq!(tracker.count(), 0);
    assert_eq!(good.closes(), 1);
    assert_eq!(bad.closes(), 1);
    assert!(tracker.get(a).is_none());
    assert!(tracker.get(b).is_none());
}
