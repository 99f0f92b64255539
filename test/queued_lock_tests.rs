use std::cell::UnsafeCell;
use std::thread;

use procscope_rt::sync::QueuedLock;

struct Guarded {
    lock: QueuedLock,
    value: UnsafeCell<u64>,
}

// The lock serializes all access to `value`.
unsafe impl Sync for Guarded {}

#[test]
fn exclusive_counter_is_exact() {
    let _ = env_logger::try_init();
    let shared = Guarded {
        lock: QueuedLock::new(),
        value: UnsafeCell::new(0),
    };
    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let shared = &shared;
                for _ in 0..100_000 {
                    shared.lock.acquire_exclusive();
                    unsafe { *shared.value.get() += 1 };
                    shared.lock.release_exclusive();
                }
            });
        }
    });
    assert_eq!(unsafe { *shared.value.get() }, 800_000);
}

struct GuardedPair {
    lock: QueuedLock,
    first: UnsafeCell<u64>,
    second: UnsafeCell<u64>,
}

unsafe impl Sync for GuardedPair {}

#[test]
fn readers_never_observe_a_torn_update() {
    let pair = GuardedPair {
        lock: QueuedLock::new(),
        first: UnsafeCell::new(0),
        second: UnsafeCell::new(0),
    };
    thread::scope(|scope| {
        scope.spawn(|| {
            let pair = &pair;
            for _ in 0..10_000 {
                pair.lock.acquire_exclusive();
                unsafe {
                    *pair.first.get() += 1;
                    *pair.second.get() += 1;
                }
                pair.lock.release_exclusive();
            }
        });
        for _ in 0..4 {
            scope.spawn(|| {
                let pair = &pair;
                for _ in 0..10_000 {
                    pair.lock.acquire_shared();
                    let (first, second) = unsafe { (*pair.first.get(), *pair.second.get()) };
                    pair.lock.release_shared();
                    assert_eq!(first, second);
                }
            });
        }
    });
    assert_eq!(unsafe { *pair.first.get() }, 10_000);
}

#[test]
fn try_acquire_respects_owners() {
    let lock = QueuedLock::new();
    assert!(lock.try_acquire_exclusive());
    assert!(!lock.try_acquire_exclusive());
    lock.release_exclusive();

    lock.acquire_shared();
    assert!(!lock.try_acquire_exclusive());
    lock.release_shared();

    assert!(lock.try_acquire_exclusive());
    lock.release_exclusive();
}

#[test]
fn shared_owners_may_join() {
    let lock = QueuedLock::new();
    lock.acquire_shared();
    lock.acquire_shared();
    lock.acquire_shared();
    lock.release_shared();
    lock.release_shared();
    assert!(!lock.try_acquire_exclusive());
    lock.release_shared();
    assert!(lock.try_acquire_exclusive());
    lock.release_exclusive();
}

#[test]
fn guards_release_on_drop() {
    let lock = QueuedLock::new();
    {
        let _guard = lock.lock_exclusive();
        assert!(!lock.try_acquire_exclusive());
    }
    {
        let _first = lock.lock_shared();
        let _second = lock.lock_shared();
        assert!(!lock.try_acquire_exclusive());
    }
    assert!(lock.try_acquire_exclusive());
    lock.release_exclusive();
}

#[test]
fn mixed_shared_exclusive_stress() {
    let _ = env_logger::try_init();
    let shared = Guarded {
        lock: QueuedLock::new(),
        value: UnsafeCell::new(0),
    };
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let shared = &shared;
                for _ in 0..20_000 {
                    shared.lock.acquire_exclusive();
                    unsafe { *shared.value.get() += 1 };
                    shared.lock.release_exclusive();
                }
            });
        }
        for _ in 0..4 {
            scope.spawn(|| {
                let shared = &shared;
                let mut last = 0;
                for _ in 0..20_000 {
                    shared.lock.acquire_shared();
                    let value = unsafe { *shared.value.get() };
                    shared.lock.release_shared();
                    // Writers only ever increment.
                    assert!(value >= last);
                    last = value;
                }
            });
        }
    });
    assert_eq!(unsafe { *shared.value.get() }, 80_000);
}
