use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::thread::Thread;

/// One-shot wake event for a single waiting thread, embedded in
/// stack-allocated wait blocks.
///
/// A `Parker` must be constructed by the thread that will park on it; the
/// constructor captures the current thread's handle for the waker to unpark.
pub(crate) struct Parker {
    /// Set once by the waker; never cleared.
    signaled: AtomicBool,
    /// Handle of the thread that owns this parker.
    thread: Thread,
}

impl Parker {
    /// Returns a new unsignaled `Parker` owned by the calling thread.
    #[inline]
    pub(crate) fn new() -> Parker {
        Parker {
            signaled: AtomicBool::new(false),
            thread: thread::current(),
        }
    }

    /// Blocks the owning thread until `unpark` is called. Tolerates spurious
    /// wakeups from the platform parker.
    pub(crate) fn park(&self) {
        while !self.signaled.load(Acquire) {
            thread::park();
        }
    }

    /// Signals the parker and wakes its owning thread.
    ///
    /// The owning thread may return from `park` and destroy the parker the
    /// instant the signal is published, so the thread handle is cloned out
    /// before the store; nothing touches `self` afterwards.
    pub(crate) fn unpark(&self) {
        let thread = self.thread.clone();
        self.signaled.store(true, Release);
        thread.unpark();
    }
}

/// Multi-waiter "state may have changed" event.
///
/// Waiters re-test an external atomic condition under the internal mutex;
/// `pulse` wakes them all so they can re-test. Used for handle table entry
/// locks, where any number of threads may wait on the same slot.
pub(crate) struct PulseEvent {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl PulseEvent {
    #[inline]
    pub(crate) fn new() -> PulseEvent {
        PulseEvent {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Blocks while `blocked()` returns `true`.
    ///
    /// The condition is sampled under the internal mutex, so a `pulse` that
    /// follows the state change can never be missed: either the waiter sees
    /// the new state, or it is already waiting when the notification lands.
    pub(crate) fn wait_while<F: FnMut() -> bool>(&self, mut blocked: F) {
        let mut guard = self.mutex.lock().unwrap();
        while blocked() {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Wakes every thread currently waiting on the event.
    ///
    /// Callers must publish the state change before pulsing. Taking the
    /// mutex orders the pulse after any waiter that tested the old state.
    pub(crate) fn pulse(&self) {
        drop(self.mutex.lock().unwrap());
        self.condvar.notify_all();
    }
}
