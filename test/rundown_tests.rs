use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::thread;
use std::time::Duration;

use procscope_rt::sync::RundownProtect;

#[test]
fn pins_pair_with_releases() {
    let rundown = RundownProtect::new();
    assert!(!rundown.is_active());
    assert!(rundown.acquire());
    assert!(rundown.acquire());
    rundown.release();
    rundown.release();
    rundown.wait();
    assert!(rundown.is_active());
}

#[test]
fn wait_with_no_pins_returns_immediately() {
    let rundown = RundownProtect::new();
    rundown.wait();
    assert!(rundown.is_active());
    assert!(!rundown.acquire());
}

#[test]
fn wait_is_idempotent() {
    let rundown = RundownProtect::new();
    rundown.wait();
    rundown.wait();
    assert!(!rundown.acquire());
}

#[test]
fn wait_blocks_until_last_release() {
    let _ = env_logger::try_init();
    let rundown = RundownProtect::new();
    let released = AtomicBool::new(false);
    assert!(rundown.acquire());
    assert!(rundown.acquire());
    thread::scope(|scope| {
        scope.spawn(|| {
            rundown.release();
            thread::sleep(Duration::from_millis(50));
            released.store(true, Release);
            rundown.release();
        });
        rundown.wait();
        assert!(released.load(Acquire));
    });
}

#[test]
fn pins_stop_once_rundown_begins() {
    let rundown = RundownProtect::new();
    let refused = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while rundown.acquire() {
                    rundown.release();
                }
                refused.fetch_add(1, Relaxed);
            });
        }
        thread::sleep(Duration::from_millis(20));
        rundown.wait();
    });
    assert_eq!(refused.load(Relaxed), 4);
}

#[test]
fn concurrent_waiters_all_observe_the_drain() {
    let rundown = RundownProtect::new();
    let drained = AtomicBool::new(false);
    assert!(rundown.acquire());
    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                rundown.wait();
                assert!(drained.load(Acquire));
            });
        }
        thread::sleep(Duration::from_millis(50));
        drained.store(true, Release);
        rundown.release();
    });
}
