use core::mem;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use core::sync::atomic::AtomicUsize;
use std::thread;

use log::trace;

use crate::sync::event::Parker;

/// Bit flag indicating rundown has begun; no new pins are granted.
const ACTIVE: usize = 0x1;

/// Number of trailing bits before the pin count bit field. With `ACTIVE`
/// clear, the remaining bits count outstanding pins; with `ACTIVE` set,
/// they hold the address of the drainer's wait block (or zero once all
/// pins have drained).
const REF_SHIFT: u32 = 1;

/// Pin count increment.
const REF_INC: usize = 1 << REF_SHIFT;

/// Stack-allocated record of a drain in progress: the number of pins still
/// outstanding at the moment rundown began, and the drainer's wake event.
struct RundownWaitBlock {
    count: AtomicUsize,
    parker: Parker,
}

/// Single-word pin/drain primitive guarding a resource against teardown
/// while it is in use.
///
/// Any number of threads pin the resource with [`acquire`]; each successful
/// pin must be paired with a [`release`]. One thread eventually calls
/// [`wait`], which turns away all future pins and blocks until every
/// outstanding pin is released. After `wait` returns, the resource can be
/// torn down with no other thread inside it.
///
/// Rundown is one-way: once begun it cannot be cancelled, and the primitive
/// is not reusable afterwards. `wait` may be called from any number of
/// threads; every call returns only once all pins are gone.
///
/// [`acquire`]: RundownProtect::acquire
/// [`release`]: RundownProtect::release
/// [`wait`]: RundownProtect::wait
pub struct RundownProtect {
    value: AtomicUsize,
}

impl RundownProtect {
    /// Returns a new protection with no pins and rundown not begun.
    #[inline]
    pub const fn new() -> RundownProtect {
        RundownProtect {
            value: AtomicUsize::new(0),
        }
    }

    /// Attempts to pin the protected resource. Returns `false` if rundown
    /// has already begun, in which case the resource must not be touched
    /// and `release` must not be called.
    pub fn acquire(&self) -> bool {
        let mut value = self.value.load(Relaxed);
        loop {
            if value & ACTIVE != 0 {
                return false;
            }
            match self
                .value
                .compare_exchange_weak(value, value + REF_INC, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(fresh) => value = fresh,
            }
        }
    }

    /// Releases a pin previously granted by `acquire`.
    pub fn release(&self) {
        // Acquire so a published wait block's count store is visible.
        let mut value = self.value.load(Acquire);
        loop {
            if value & ACTIVE != 0 {
                // Rundown began after this pin was granted; the pin count
                // moved into the drainer's wait block. The last release
                // wakes the drainer.
                let wait_block = (value & !ACTIVE) as *const RundownWaitBlock;
                unsafe {
                    if (*wait_block).count.fetch_sub(1, AcqRel) == 1 {
                        (*wait_block).parker.unpark();
                    }
                }
                return;
            }
            debug_assert!(value >> REF_SHIFT > 0, "release without matching acquire");
            match self
                .value
                .compare_exchange_weak(value, value - REF_INC, Release, Acquire)
            {
                Ok(_) => return,
                Err(fresh) => value = fresh,
            }
        }
    }

    /// Begins rundown and blocks until every outstanding pin is released.
    /// All `acquire` calls from this point on fail.
    pub fn wait(&self) {
        let wait_block = RundownWaitBlock {
            count: AtomicUsize::new(0),
            parker: Parker::new(),
        };
        let block_ptr = &wait_block as *const RundownWaitBlock as usize;
        debug_assert!(block_ptr & ACTIVE == 0);
        let mut value = self.value.load(Acquire);
        loop {
            if value == ACTIVE {
                // Already run down and drained.
                return;
            }
            if value & ACTIVE != 0 {
                // Another thread is draining; its wait block owns the
                // word, so we cannot register ours. The window is brief
                // (the drainer clears the word the moment it wakes).
                thread::yield_now();
                value = self.value.load(Acquire);
                continue;
            }
            let count = value >> REF_SHIFT;
            if count == 0 {
                // No pins outstanding; flip to active and return at once.
                match self
                    .value
                    .compare_exchange_weak(value, ACTIVE, Acquire, Relaxed)
                {
                    Ok(_) => return,
                    Err(fresh) => value = fresh,
                }
            } else {
                // Move the pin count into the wait block and publish its
                // address; the final release wakes us.
                wait_block.count.store(count, Relaxed);
                match self
                    .value
                    .compare_exchange_weak(value, block_ptr | ACTIVE, AcqRel, Relaxed)
                {
                    Ok(_) => {
                        trace!("rundown waiting on {} outstanding pins", count);
                        wait_block.parker.park();
                        // Retire the wait block pointer so later waiters
                        // can observe the drained state.
                        self.value.store(ACTIVE, Release);
                        return;
                    }
                    Err(fresh) => value = fresh,
                }
            }
        }
    }

    /// Returns `true` if rundown has begun.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.value.load(Relaxed) & ACTIVE != 0
    }
}

impl Default for RundownProtect {
    #[inline]
    fn default() -> RundownProtect {
        RundownProtect::new()
    }
}

// A wait block address must have its low bit clear to share a word with the
// active flag.
const _: () = assert!(mem::align_of::<RundownWaitBlock>() >= 2);
