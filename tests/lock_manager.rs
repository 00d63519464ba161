#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use absfuse::error::Errno;
use absfuse::locks::{FlockMode, LockError, LockManager, RangeKind, RangeLock, WHOLE_FILE_END};

fn write(start: u64, end: u64) -> RangeLock {
    RangeLock::new(start, end, RangeKind::Write, 1)
}

fn read(start: u64, end: u64) -> RangeLock {
    RangeLock::new(start, end, RangeKind::Read, 1)
}

fn unlock(start: u64, end: u64) -> RangeLock {
    RangeLock::new(start, end, RangeKind::Unlock, 1)
}

fn spans(locks: &LockManager, path: &str) -> Vec<(u64, u64)> {
    locks
        .held_ranges(path)
        .into_iter()
        .map(|(_, r)| (r.start, r.end))
        .collect()
}

#[test]
fn exclusive_flock_excludes_everyone_else() {
    let locks = LockManager::new();
    locks.flock("/x", 1, FlockMode::Exclusive, true).unwrap();

    assert_eq!(
        locks.flock("/x", 2, FlockMode::Exclusive, true),
        Err(LockError::WouldBlock)
    );
    assert_eq!(
        locks.flock("/x", 2, FlockMode::Shared, true),
        Err(LockError::WouldBlock)
    );

    locks.flock_unlock("/x", 1);
    locks.flock("/x", 2, FlockMode::Exclusive, true).unwrap();
    assert_eq!(
        locks.flock_holders("/x"),
        Some((FlockMode::Exclusive, vec![2]))
    );
}

#[test]
fn blocking_conflict_asks_to_retry() {
    let locks = LockManager::new();
    locks.flock("/x", 1, FlockMode::Exclusive, false).unwrap();

    let err = locks.flock("/x", 2, FlockMode::Shared, false).unwrap_err();
    assert_eq!(err, LockError::TryAgain);
    assert_eq!(err.errno(), libc::EAGAIN);
    assert_eq!(LockError::WouldBlock.errno(), libc::EWOULDBLOCK);
}

#[test]
fn shared_owners_coexist_until_all_unlock() {
    let locks = LockManager::new();
    for owner in 1..=5 {
        locks.flock("/x", owner, FlockMode::Shared, true).unwrap();
    }
    assert_eq!(
        locks.flock_holders("/x"),
        Some((FlockMode::Shared, vec![1, 2, 3, 4, 5]))
    );

    for owner in 1..=5 {
        assert_eq!(
            locks.flock("/x", 100, FlockMode::Exclusive, true),
            Err(LockError::WouldBlock),
            "still held by {owner}..=5"
        );
        locks.flock_unlock("/x", owner);
    }

    locks.flock("/x", 100, FlockMode::Exclusive, true).unwrap();
}

#[test]
fn upgrade_only_for_sole_owner() {
    let locks = LockManager::new();
    locks.flock("/x", 1, FlockMode::Shared, true).unwrap();
    locks.flock("/x", 2, FlockMode::Shared, true).unwrap();

    assert_eq!(
        locks.flock("/x", 1, FlockMode::Exclusive, true),
        Err(LockError::WouldBlock)
    );
    assert_eq!(
        locks.flock("/x", 1, FlockMode::Exclusive, false),
        Err(LockError::TryAgain)
    );

    locks.flock_unlock("/x", 2);
    locks.flock("/x", 1, FlockMode::Exclusive, true).unwrap();
    assert_eq!(
        locks.flock_holders("/x"),
        Some((FlockMode::Exclusive, vec![1]))
    );
}

#[test]
fn downgrade_always_succeeds_and_admits_readers() {
    let locks = LockManager::new();
    locks.flock("/x", 1, FlockMode::Exclusive, true).unwrap();
    locks.flock("/x", 1, FlockMode::Shared, true).unwrap();
    locks.flock("/x", 2, FlockMode::Shared, true).unwrap();
    assert_eq!(
        locks.flock_holders("/x"),
        Some((FlockMode::Shared, vec![1, 2]))
    );
}

#[test]
fn relocking_in_same_mode_is_a_no_op() {
    let locks = LockManager::new();
    locks.flock("/x", 1, FlockMode::Exclusive, true).unwrap();
    locks.flock("/x", 1, FlockMode::Exclusive, true).unwrap();
    assert_eq!(locks.stats().flocked_paths, 1);
}

#[test]
fn unlocking_unheld_flock_is_fine() {
    let locks = LockManager::new();
    locks.flock_unlock("/never", 7);
    locks.flock("/x", 1, FlockMode::Shared, true).unwrap();
    locks.flock_unlock("/x", 9);
    assert_eq!(locks.flock_holders("/x"), Some((FlockMode::Shared, vec![1])));

    locks.flock_unlock("/x", 1);
    assert_eq!(locks.flock_holders("/x"), None, "empty record is deleted");
}

#[test]
fn unlocking_the_middle_splits_a_range() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, write(0, 200)).unwrap();
    locks.set_range("/f", 1, unlock(50, 150)).unwrap();

    assert_eq!(spans(&locks, "/f"), vec![(0, 50), (150, 200)]);

    locks.set_range("/f", 2, write(75, 125)).unwrap();
    assert_eq!(
        locks.set_range("/f", 3, write(10, 60)),
        Err(LockError::TryAgain)
    );
}

#[test]
fn unlock_trims_and_removes() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, write(0, 100)).unwrap();
    locks.set_range("/f", 1, write(200, 300)).unwrap();
    locks.set_range("/f", 1, write(400, 500)).unwrap();

    // Covers the tail of the first, the whole second and the head of the third.
    locks.set_range("/f", 1, unlock(50, 450)).unwrap();
    assert_eq!(spans(&locks, "/f"), vec![(0, 50), (450, 500)]);

    locks.set_range("/f", 1, unlock(0, WHOLE_FILE_END)).unwrap();
    assert!(locks.held_ranges("/f").is_empty());
    assert_eq!(locks.stats().held_ranges, 0);
}

#[test]
fn unlock_leaves_other_owners_alone() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, read(0, 100)).unwrap();
    locks.set_range("/f", 2, read(0, 100)).unwrap();
    locks.set_range("/f", 1, unlock(0, 100)).unwrap();

    let held = locks.held_ranges("/f");
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].0, 2);
}

#[test]
fn readers_share_writers_conflict() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, read(0, 100)).unwrap();
    locks.set_range("/f", 2, read(50, 150)).unwrap();
    assert_eq!(
        locks.set_range("/f", 3, write(90, 95)),
        Err(LockError::TryAgain)
    );
    locks.set_range("/f", 3, write(150, 200)).unwrap();
}

#[test]
fn adjacent_ranges_do_not_overlap() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, write(0, 100)).unwrap();
    locks.set_range("/f", 2, write(100, 200)).unwrap();
}

#[test]
fn same_owner_never_conflicts_with_itself() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, write(0, 100)).unwrap();
    locks.set_range("/f", 1, write(50, 150)).unwrap();
    locks.set_range("/f", 1, read(60, 70)).unwrap();
    assert_eq!(locks.held_ranges("/f").len(), 3);
}

#[test]
fn test_range_reports_the_blocking_lock() {
    let locks = LockManager::new();
    locks
        .set_range("/f", 1, RangeLock::new(10, 20, RangeKind::Write, 4242))
        .unwrap();

    let conflict = locks.test_range("/f", 2, &read(15, 16)).unwrap();
    assert_eq!(conflict.start, 10);
    assert_eq!(conflict.end, 20);
    assert_eq!(conflict.kind, RangeKind::Write);
    assert_eq!(conflict.pid, 4242);

    assert!(locks.test_range("/f", 1, &write(0, 100)).is_none(), "own locks never block");
    assert!(locks.test_range("/f", 2, &read(20, 30)).is_none());
    assert!(locks.test_range("/other", 2, &write(0, 100)).is_none());
}

#[test]
fn whole_file_range_covers_everything() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, write(0, WHOLE_FILE_END)).unwrap();
    assert_eq!(
        locks.set_range("/f", 2, read(u64::MAX - 10, u64::MAX - 1)),
        Err(LockError::TryAgain)
    );
}

#[test]
fn blocking_range_request_returns_immediately() {
    let locks = LockManager::new();
    locks.set_range("/f", 1, write(0, 10)).unwrap();
    assert_eq!(
        locks.set_range_wait("/f", 2, write(5, 6)),
        Err(LockError::TryAgain)
    );
    locks.set_range_wait("/f", 2, write(10, 20)).unwrap();
}

#[test]
fn release_owner_drops_everything_it_holds() {
    let locks = LockManager::new();
    locks.flock("/x", 1, FlockMode::Shared, true).unwrap();
    locks.flock("/x", 2, FlockMode::Shared, true).unwrap();
    locks.set_range("/y", 1, write(0, 10)).unwrap();
    locks.set_range("/y", 2, write(20, 30)).unwrap();
    locks.flock("/z", 1, FlockMode::Exclusive, true).unwrap();

    locks.release_owner(1);

    assert_eq!(locks.flock_holders("/x"), Some((FlockMode::Shared, vec![2])));
    assert_eq!(locks.flock_holders("/z"), None);
    assert_eq!(spans(&locks, "/y"), vec![(20, 30)]);

    locks.flock("/z", 3, FlockMode::Exclusive, true).unwrap();
    locks.set_range("/y", 3, write(0, 10)).unwrap();
}

#[test]
fn racing_writers_cannot_both_win() {
    for _ in 0..50 {
        let locks = Arc::new(LockManager::new());
        let granted = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (1..=8u64)
            .map(|owner| {
                let locks = Arc::clone(&locks);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    if locks.set_range("/f", owner, write(0, 100)).is_ok() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn fcntl_kinds_convert_both_ways() {
    for kind in [RangeKind::Read, RangeKind::Write, RangeKind::Unlock] {
        assert_eq!(RangeKind::from_fcntl(kind.to_fcntl()), Some(kind));
    }
    assert_eq!(RangeKind::from_fcntl(-1), None);
}
