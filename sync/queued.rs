use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize};
use std::hint;
use std::thread;

use crate::sync::event::Parker;

/// Bit flag indicating the lock is held, exclusively or shared.
pub(crate) const OWNED: usize = 0x1;

/// Bit flag indicating at least one wait block is queued.
pub(crate) const WAITERS: usize = 0x2;

/// Bit flag indicating a thread is traversing the wait list; at most one
/// traversal is in progress at any time.
pub(crate) const TRAVERSING: usize = 0x4;

/// Bit flag indicating the lock is held shared by multiple owners whose
/// count has been parked in the oldest wait block.
pub(crate) const MULTIPLE_SHARED: usize = 0x8;

/// Bit mask covering all flag bits of the lock word.
pub(crate) const FLAGS_MASK: usize = 0xf;

/// Number of trailing bits before the shared owner count bit field. With
/// `WAITERS` clear, the remaining bits of the word hold the shared owner
/// count; with `WAITERS` set, they hold the address of the head wait block.
pub(crate) const SHARED_SHIFT: u32 = 4;

/// Shared owner count increment.
pub(crate) const SHARED_INC: usize = 1 << SHARED_SHIFT;

/// Wait block flag indicating the waiter wants exclusive access.
const WAITER_EXCLUSIVE: u32 = 0x1;

/// Wait block flag indicating the waiter is still spinning and has not yet
/// committed to blocking on its parker.
const WAITER_SPINNING: u32 = 0x2;

/// Iterations a contended waiter spins before blocking, on multiprocessor
/// hosts. Sentinel `u32::MAX` means not yet computed.
static SPIN_COUNT: AtomicU32 = AtomicU32::new(u32::MAX);

/// Returns the number of iterations a waiter should spin before blocking.
/// Single-CPU hosts never spin; there is no one to release the lock while
/// the spinner holds the processor.
fn spin_count() -> u32 {
    let mut count = SPIN_COUNT.load(Relaxed);
    if count == u32::MAX {
        let processors = thread::available_parallelism().map_or(1, |n| n.get());
        count = if processors > 1 { 4000 } else { 0 };
        SPIN_COUNT.store(count, Relaxed);
    }
    count
}

/// Stack-allocated record of one blocked waiter, linked into the lock's
/// intrusive wait list.
///
/// Wait blocks form a LIFO push list: `next` points from newer to older
/// blocks, `previous` pointers are patched lazily in the opposite direction,
/// and `last` caches the oldest block so traversals need not rewalk the
/// whole list. A block is touched by other threads only until its parker is
/// signaled; after that the waiter may unwind its stack frame.
#[repr(align(16))]
struct WaitBlock {
    /// Older neighbor in push order; fixed at push time.
    next: AtomicPtr<WaitBlock>,
    /// Newer neighbor in push order; patched during traversal.
    previous: AtomicPtr<WaitBlock>,
    /// Cached oldest block, or null if not yet known at this block.
    last: AtomicPtr<WaitBlock>,
    /// Shared owner count parked here when this block was pushed onto a
    /// shared-held lock; only meaningful in the oldest block.
    shared_owners: AtomicU32,
    /// `WAITER_EXCLUSIVE` and `WAITER_SPINNING`.
    flags: AtomicU32,
    /// Wake event for this waiter.
    parker: Parker,
}

impl WaitBlock {
    #[inline]
    fn new(exclusive: bool) -> WaitBlock {
        WaitBlock {
            next: AtomicPtr::new(ptr::null_mut()),
            previous: AtomicPtr::new(ptr::null_mut()),
            last: AtomicPtr::new(ptr::null_mut()),
            shared_owners: AtomicU32::new(0),
            flags: AtomicU32::new(if exclusive {
                WAITER_EXCLUSIVE | WAITER_SPINNING
            } else {
                WAITER_SPINNING
            }),
            parker: Parker::new(),
        }
    }

    /// Spins briefly, then blocks until woken. Exactly one of the waiter and
    /// the waker clears the spinning flag; whichever does decides whether
    /// the parker is used.
    fn block(&self) {
        let spin = spin_count();
        for _ in 0..spin {
            if self.flags.load(Acquire) & WAITER_SPINNING == 0 {
                return;
            }
            hint::spin_loop();
        }
        // Stop spinning; if the flag was still set, the waker has not run
        // yet and will signal the parker.
        if self.flags.fetch_and(!WAITER_SPINNING, AcqRel) & WAITER_SPINNING != 0 {
            self.parker.park();
        }
    }

    /// Wakes the waiter. Must not be called twice, and nothing may touch the
    /// block after this returns.
    fn wake(&self) {
        // If the spinning flag was already clear, the waiter has committed
        // to blocking and must be unparked; otherwise it will observe the
        // cleared flag and return from its spin loop.
        if self.flags.fetch_and(!WAITER_SPINNING, AcqRel) & WAITER_SPINNING == 0 {
            self.parker.unpark();
        }
    }
}

/// Single-word mutual-exclusion/shared lock with no OS synchronization
/// object on the uncontended path.
///
/// Bit 0 records ownership and bit 1 waiter presence. With no waiters, the
/// upper bits count shared owners; with waiters, they hold the address of
/// the head of an intrusive list of stack-allocated wait blocks, plus a
/// traversal flag and a multiple-shared flag.
///
/// Acquires and releases never fail and never time out. Release wakes the
/// *oldest* waiter (approximate FIFO; a newly arriving thread may still
/// barge past the queue) and adjacent shared waiters wake together.
/// Upgrade and downgrade between shared and exclusive are not supported;
/// release and reacquire instead.
///
/// A `QueuedLock` is embedded by value in its owner structure. It requires
/// no teardown; dropping it while waiters are queued is a caller bug.
pub struct QueuedLock {
    value: AtomicUsize,
}

impl QueuedLock {
    /// Returns a new unowned lock.
    #[inline]
    pub const fn new() -> QueuedLock {
        QueuedLock {
            value: AtomicUsize::new(0),
        }
    }

    /// Acquires the lock exclusively, blocking until it is available.
    #[inline]
    pub fn acquire_exclusive(&self) {
        // Fast path: a single atomic bit set. The owned bit is clear only
        // when no exclusive owner and no shared owners exist.
        let value = self.value.fetch_or(OWNED, Acquire);
        if value & OWNED != 0 {
            self.acquire_exclusive_slow();
        }
    }

    /// Tries to acquire the lock exclusively without blocking.
    #[inline]
    pub fn try_acquire_exclusive(&self) -> bool {
        self.value.fetch_or(OWNED, Acquire) & OWNED == 0
    }

    /// Acquires the lock shared, blocking until it is available.
    #[inline]
    pub fn acquire_shared(&self) {
        // Fast path: take the free lock as its first shared owner.
        let value = self.value.load(Relaxed);
        if value & (OWNED | WAITERS) != 0
            || self
                .value
                .compare_exchange(value, value + OWNED + SHARED_INC, Acquire, Relaxed)
                .is_err()
        {
            self.acquire_shared_slow();
        }
    }

    /// Releases exclusive ownership, waking the oldest waiter if one is
    /// queued and no wake is already in progress.
    pub fn release_exclusive(&self) {
        let mut value = self.value.load(Relaxed);
        loop {
            debug_assert!(value & OWNED != 0, "release of unowned lock");
            if value & WAITERS == 0 || value & TRAVERSING != 0 {
                // No one to wake, or a traversal in progress will notice the
                // release and wake on our behalf.
                match self
                    .value
                    .compare_exchange_weak(value, value - OWNED, Release, Relaxed)
                {
                    Ok(_) => return,
                    Err(fresh) => value = fresh,
                }
            } else {
                // Claim the traversal and wake the oldest waiters. AcqRel
                // so the pushed wait blocks are visible to the walk.
                let new_value = (value - OWNED) | TRAVERSING;
                match self
                    .value
                    .compare_exchange_weak(value, new_value, AcqRel, Relaxed)
                {
                    Ok(_) => {
                        unsafe { self.wake_waiters(new_value) };
                        return;
                    }
                    Err(fresh) => value = fresh,
                }
            }
        }
    }

    /// Releases one shared owner, waking the oldest waiter if this was the
    /// last shared owner and waiters are queued.
    pub fn release_shared(&self) {
        // Acquire so a wait-list head read below sees the pushed blocks.
        let mut value = self.value.load(Acquire);
        // With no waiters the shared owner count lives in the lock word.
        while value & WAITERS == 0 {
            debug_assert!(value & OWNED != 0, "release of unowned lock");
            debug_assert!(value >> SHARED_SHIFT > 0, "shared release underflow");
            let mut new_value = value - SHARED_INC;
            if new_value >> SHARED_SHIFT == 0 {
                new_value &= !OWNED;
            }
            match self
                .value
                .compare_exchange_weak(value, new_value, Release, Acquire)
            {
                Ok(_) => return,
                Err(fresh) => value = fresh,
            }
        }
        // Waiters are queued; the shared owner count was parked in the
        // oldest wait block when the first waiter pushed.
        if value & MULTIPLE_SHARED != 0 {
            let last = unsafe { Self::find_last((value & !FLAGS_MASK) as *mut WaitBlock) };
            if unsafe { (*last).shared_owners.fetch_sub(1, AcqRel) } > 1 {
                return;
            }
        }
        // Last shared owner out: drop ownership and wake, unless a
        // traversal in progress takes over the wake.
        loop {
            if value & TRAVERSING != 0 {
                let new_value = value & !(OWNED | MULTIPLE_SHARED);
                match self
                    .value
                    .compare_exchange_weak(value, new_value, Release, Relaxed)
                {
                    Ok(_) => return,
                    Err(fresh) => value = fresh,
                }
            } else {
                let new_value = (value & !(OWNED | MULTIPLE_SHARED)) | TRAVERSING;
                match self
                    .value
                    .compare_exchange_weak(value, new_value, AcqRel, Relaxed)
                {
                    Ok(_) => {
                        unsafe { self.wake_waiters(new_value) };
                        return;
                    }
                    Err(fresh) => value = fresh,
                }
            }
        }
    }

    /// Acquires exclusively and returns a guard that releases on drop.
    #[inline]
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire_exclusive();
        ExclusiveGuard { lock: self }
    }

    /// Acquires shared and returns a guard that releases on drop.
    #[inline]
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        self.acquire_shared();
        SharedGuard { lock: self }
    }

    /// Slow path for exclusive acquisition: queue a wait block and block.
    fn acquire_exclusive_slow(&self) {
        let mut value = self.value.load(Relaxed);
        loop {
            if value & OWNED == 0 {
                match self
                    .value
                    .compare_exchange_weak(value, value + OWNED, Acquire, Relaxed)
                {
                    Ok(_) => return,
                    Err(fresh) => value = fresh,
                }
            } else {
                let wait_block = WaitBlock::new(true);
                match self.try_push(value, &wait_block) {
                    Ok((new_value, optimize)) => {
                        if optimize {
                            unsafe { self.optimize_list(new_value) };
                        }
                        wait_block.block();
                        value = self.value.load(Relaxed);
                    }
                    Err(fresh) => value = fresh,
                }
            }
        }
    }

    /// Slow path for shared acquisition: join the shared owners when no
    /// waiters are queued, otherwise queue a wait block and block.
    fn acquire_shared_slow(&self) {
        let mut value = self.value.load(Relaxed);
        loop {
            // Shared access may take a free lock or join existing shared
            // owners, but never jumps a queue of waiters.
            if value & WAITERS == 0 && (value & OWNED == 0 || value >> SHARED_SHIFT > 0) {
                let new_value = (value + SHARED_INC) | OWNED;
                match self
                    .value
                    .compare_exchange_weak(value, new_value, Acquire, Relaxed)
                {
                    Ok(_) => return,
                    Err(fresh) => value = fresh,
                }
            } else {
                let wait_block = WaitBlock::new(false);
                match self.try_push(value, &wait_block) {
                    Ok((new_value, optimize)) => {
                        if optimize {
                            unsafe { self.optimize_list(new_value) };
                        }
                        wait_block.block();
                        value = self.value.load(Relaxed);
                    }
                    Err(fresh) => value = fresh,
                }
            }
        }
    }

    /// Attempts to push `wait_block` as the new head of the wait list.
    ///
    /// On success returns the new lock word and whether the caller became
    /// the traverser and must optimize the list; on failure returns the
    /// fresh lock word for the caller to retry with.
    fn try_push(&self, value: usize, wait_block: &WaitBlock) -> Result<(usize, bool), usize> {
        let block_ptr = wait_block as *const WaitBlock as usize;
        debug_assert!(block_ptr & FLAGS_MASK == 0);
        let new_value;
        let optimize;
        if value & WAITERS != 0 {
            // Push onto the existing list; the oldest block is unknown from
            // here, so leave the cache null for a traversal to fill in.
            wait_block.last.store(ptr::null_mut(), Relaxed);
            wait_block
                .next
                .store((value & !FLAGS_MASK) as *mut WaitBlock, Relaxed);
            wait_block.shared_owners.store(0, Relaxed);
            new_value = block_ptr | (value & (OWNED | MULTIPLE_SHARED)) | WAITERS | TRAVERSING;
            optimize = value & TRAVERSING == 0;
        } else {
            // First waiter: this block is both head and oldest, and takes
            // custody of the shared owner count displaced from the word.
            wait_block
                .last
                .store(wait_block as *const WaitBlock as *mut WaitBlock, Relaxed);
            wait_block.next.store(ptr::null_mut(), Relaxed);
            let shared_owners = if value & OWNED != 0 {
                (value >> SHARED_SHIFT) as u32
            } else {
                0
            };
            wait_block.shared_owners.store(shared_owners, Relaxed);
            let mut flags = (value & OWNED) | WAITERS;
            if shared_owners > 1 {
                flags |= MULTIPLE_SHARED;
            }
            new_value = block_ptr | flags;
            optimize = false;
        }
        // AcqRel: publishes this block, and makes the rest of the list
        // visible if the push claimed the traversal.
        match self
            .value
            .compare_exchange(value, new_value, AcqRel, Relaxed)
        {
            Ok(_) => Ok((new_value, optimize)),
            Err(fresh) => Err(fresh),
        }
    }

    /// Walks the push list from `head`, patching `previous` pointers, until
    /// a block with a cached oldest pointer is found; propagates the cache
    /// to `head` and returns the oldest block.
    ///
    /// Concurrent walkers store identical values, since the list topology
    /// is fixed between a push and a detach, so the patching is idempotent.
    unsafe fn find_last(head: *mut WaitBlock) -> *mut WaitBlock {
        let mut block = head;
        loop {
            let last = (*block).last.load(Acquire);
            if !last.is_null() {
                if block != head {
                    (*head).last.store(last, Release);
                }
                return last;
            }
            let next = (*block).next.load(Acquire);
            (*next).previous.store(block, Release);
            block = next;
        }
    }

    /// Completes a traversal begun by a push: patches the wait list, then
    /// clears the traversing flag. If the lock was released mid-traversal,
    /// the releaser deferred its wake to us, so wake instead.
    ///
    /// The caller must have set `TRAVERSING`; `value` is the lock word that
    /// set it.
    unsafe fn optimize_list(&self, mut value: usize) {
        loop {
            if value & OWNED == 0 {
                // Owner released while we held the traversal; the release
                // skipped its wake and it falls to us.
                self.wake_waiters(value);
                return;
            }
            Self::find_last((value & !FLAGS_MASK) as *mut WaitBlock);
            match self
                .value
                .compare_exchange(value, value & !TRAVERSING, Release, Acquire)
            {
                Ok(_) => return,
                Err(fresh) => value = fresh,
            }
        }
    }

    /// Wakes waiters on behalf of a release: the oldest waiter alone when
    /// it wants exclusive access and others are queued behind it, the whole
    /// list otherwise. Shared waiters therefore always wake as one batch
    /// with the waiter bit cleared, so they can join the lock rather than
    /// re-queue. Woken threads re-contend; ownership is not transferred.
    ///
    /// The caller must have set `TRAVERSING`; this clears it before any
    /// block is signaled, so a woken thread's own release can take over
    /// the next wake instead of deferring to a traversal that has ended.
    unsafe fn wake_waiters(&self, mut value: usize) {
        loop {
            let head = (value & !FLAGS_MASK) as *mut WaitBlock;
            let oldest = Self::find_last(head);
            let newer = (*oldest).previous.load(Acquire);
            if (*oldest).flags.load(Relaxed) & WAITER_EXCLUSIVE != 0 && !newer.is_null() {
                // Detach just the oldest block by re-caching the oldest
                // pointer; only the traverser consults it, and the list
                // stays ours until the traversing flag clears.
                (*head).last.store(newer, Release);
                loop {
                    let new_value = value & !(TRAVERSING | MULTIPLE_SHARED);
                    match self
                        .value
                        .compare_exchange(value, new_value, Release, Relaxed)
                    {
                        Ok(_) => break,
                        // Pushes preserve the traversing flag, so the
                        // detachment stands; just retry the clear.
                        Err(fresh) => value = fresh,
                    }
                }
                (*oldest).wake();
                return;
            }
            // The whole list wakes: clear the waiter bits entirely,
            // keeping ownership if a barging thread has claimed it.
            match self
                .value
                .compare_exchange(value, value & OWNED, Release, Acquire)
            {
                Ok(_) => {
                    // Walk from oldest to newest, reading each block's
                    // neighbor before signaling it; a signaled block may
                    // be destroyed at once.
                    let mut block = oldest;
                    while !block.is_null() {
                        let newer = (*block).previous.load(Acquire);
                        (*block).wake();
                        block = newer;
                    }
                    return;
                }
                // A new block was pushed; re-walk and retry. Acquire so
                // the fresh head's contents are visible.
                Err(fresh) => value = fresh,
            }
        }
    }
}

impl Default for QueuedLock {
    #[inline]
    fn default() -> QueuedLock {
        QueuedLock::new()
    }
}

/// Exclusive ownership of a [`QueuedLock`], released on drop.
pub struct ExclusiveGuard<'a> {
    lock: &'a QueuedLock,
}

impl<'a> Drop for ExclusiveGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

/// Shared ownership of a [`QueuedLock`], released on drop.
pub struct SharedGuard<'a> {
    lock: &'a QueuedLock,
}

impl<'a> Drop for SharedGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}
