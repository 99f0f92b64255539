//! Sparse, lock-striped handle table.
//!
//! A [`HandleTable`] maps small opaque [`Handle`] values to object body
//! pointers plus a granted-access word, for code that must hand out
//! references across a trust boundary without exposing raw pointers.
//!
//! Storage is a trie of up to three levels of 256-slot arrays, grown
//! lazily in 256-entry chunks and never shrunk; a single tagged word holds
//! the root pointer and the level count. Free slots chain through their
//! `info` words from an atomic free-list head. Mutation of a live slot is
//! serialized by one of eight striped [`QueuedLock`]s keyed by the slot
//! index, so operations on different slots rarely contend; structural
//! changes (growth, teardown) take a table-wide lock instead.
//!
//! The table stores object pointers but takes no references of its own:
//! callers reference an object before publishing it in a handle and
//! dereference it after destroying the handle (or from a [`sweep`]
//! predicate). Teardown is rundown-protected; once [`close`] begins, every
//! operation fails with [`HandleError::Terminating`].
//!
//! [`sweep`]: HandleTable::sweep
//! [`close`]: HandleTable::close

use core::num::NonZeroU32;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize};
use std::error::Error;
use std::fmt;

use bitflags::bitflags;
use log::debug;

use crate::sync::{PulseEvent, QueuedLock, RundownProtect};

/// Slots per trie level.
const LEVEL_SIZE: usize = 256;

/// Bits of index consumed per trie level.
const LEVEL_SHIFT: u32 = 8;

/// Bit mask extracting the level count from the table code word.
const LEVEL_MASK: usize = 0x3;

/// Hard capacity: three full levels.
const MAX_HANDLES: u32 = (LEVEL_SIZE * LEVEL_SIZE * LEVEL_SIZE) as u32;

/// Number of per-slot stripe locks; must be a power of two.
const STRIPE_COUNT: usize = 8;

/// Entry value bit: the slot holds a live object pointer.
const ENTRY_IN_USE: usize = 0x1;

/// Entry value bit: a lookup guard currently holds the slot.
const ENTRY_LOCKED: usize = 0x2;

/// Bit mask recovering the object pointer from an in-use entry value.
const ENTRY_PTR_MASK: usize = !(ENTRY_IN_USE | ENTRY_LOCKED);

/// An opaque, non-zero reference to one table slot.
///
/// Values are 4-aligned and never zero, so a zeroed or garbage word is
/// recognizably invalid before any table walk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Reconstructs a handle from its raw transport value. Returns `None`
    /// for values no table could ever have produced; a well-formed value
    /// for a slot that is not live is caught later, at lookup.
    pub fn from_raw(raw: u32) -> Option<Handle> {
        if raw == 0 || raw & 0x3 != 0 || (raw >> 2) - 1 >= MAX_HANDLES {
            return None;
        }
        // Non-zero was just checked.
        Some(Handle(unsafe { NonZeroU32::new_unchecked(raw) }))
    }

    /// The raw transport value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0.get()
    }

    #[inline]
    fn encode(index: u32) -> Handle {
        debug_assert!(index < MAX_HANDLES);
        // (index << 2) + 4 cannot be zero for an in-range index.
        Handle(unsafe { NonZeroU32::new_unchecked((index << 2) + 4) })
    }

    #[inline]
    fn index(self) -> u32 {
        (self.0.get() >> 2) - 1
    }
}

/// One table slot: an object pointer with in-use/locked bits, and an info
/// word holding the granted access while live or the free-list link while
/// free.
struct HandleTableEntry {
    value: AtomicUsize,
    info: AtomicUsize,
}

const FREE_ENTRY: HandleTableEntry = HandleTableEntry {
    value: AtomicUsize::new(0),
    info: AtomicUsize::new(0),
};

type Level0 = [HandleTableEntry; LEVEL_SIZE];
type Level1 = [AtomicPtr<Level0>; LEVEL_SIZE];
type Level2 = [AtomicPtr<Level1>; LEVEL_SIZE];

const NULL_L0: AtomicPtr<Level0> = AtomicPtr::new(ptr::null_mut());
const NULL_L1: AtomicPtr<Level1> = AtomicPtr::new(ptr::null_mut());

fn new_level0() -> *mut Level0 {
    Box::into_raw(Box::new([FREE_ENTRY; LEVEL_SIZE]))
}

bitflags! {
    /// Table behavior flags, settable after creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HandleTableFlags: u32 {
        /// Refuse to allocate further trie chunks; creates fail with
        /// `TableFull` once the free list is exhausted.
        const NO_GROW = 0x1;
    }
}

/// Errors from handle table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleError {
    /// The handle does not name a live slot in this table.
    InvalidHandle,
    /// The slot is live but holds a different object than the caller
    /// expected.
    Mismatch,
    /// A trie level could not be allocated.
    OutOfMemory,
    /// The table is at capacity, or growth is disabled.
    TableFull,
    /// The table is being closed; no new operations are admitted.
    Terminating,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::InvalidHandle => write!(f, "invalid handle"),
            HandleError::Mismatch => write!(f, "handle refers to a different object"),
            HandleError::OutOfMemory => write!(f, "out of memory"),
            HandleError::TableFull => write!(f, "handle table is full"),
            HandleError::Terminating => write!(f, "handle table is terminating"),
        }
    }
}

impl Error for HandleError {}

/// Point-in-time snapshot of a table's counters.
#[derive(Clone, Copy, Debug)]
pub struct HandleTableInfo {
    /// Live handles.
    pub handle_count: usize,
    /// Slots carved into trie chunks so far, live or free.
    pub capacity: usize,
    /// Trie levels currently in place (0 before the first create).
    pub levels: u32,
    pub flags: HandleTableFlags,
}

/// See the [module documentation](self).
pub struct HandleTable {
    /// Trie root pointer with the level count in the low two bits; zero
    /// before the first create and after close.
    table_code: AtomicUsize,
    /// Serializes growth and teardown.
    table_lock: QueuedLock,
    /// Raw handle value of the first free slot; zero when empty. Free
    /// slots chain through their `info` words.
    free_list: AtomicUsize,
    /// Next never-carved slot index; always a multiple of `LEVEL_SIZE`.
    next_index: AtomicU32,
    handle_count: AtomicUsize,
    flags: AtomicU32,
    /// Per-slot locks, keyed by `index & (STRIPE_COUNT - 1)`.
    stripes: [QueuedLock; STRIPE_COUNT],
    /// Wakes threads waiting for a slot's locked bit to clear.
    entry_event: PulseEvent,
    /// Holds off teardown while operations are in flight.
    rundown: RundownProtect,
}

impl HandleTable {
    /// Returns a new, empty table. No storage is allocated until the first
    /// create.
    pub fn new() -> HandleTable {
        const STRIPE: QueuedLock = QueuedLock::new();
        HandleTable {
            table_code: AtomicUsize::new(0),
            table_lock: QueuedLock::new(),
            free_list: AtomicUsize::new(0),
            next_index: AtomicU32::new(0),
            handle_count: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            stripes: [STRIPE; STRIPE_COUNT],
            entry_event: PulseEvent::new(),
            rundown: RundownProtect::new(),
        }
    }

    /// Current table flags.
    #[inline]
    pub fn flags(&self) -> HandleTableFlags {
        HandleTableFlags::from_bits_truncate(self.flags.load(Relaxed))
    }

    /// Replaces the table flags.
    #[inline]
    pub fn set_flags(&self, flags: HandleTableFlags) {
        self.flags.store(flags.bits(), Relaxed);
    }

    /// Returns a snapshot of the table's counters. Sampled without locks;
    /// values may be mutually inconsistent under load.
    pub fn query_information(&self) -> HandleTableInfo {
        let code = self.table_code.load(Acquire);
        HandleTableInfo {
            handle_count: self.handle_count.load(Relaxed),
            capacity: self.next_index.load(Relaxed) as usize,
            levels: if code == 0 {
                0
            } else {
                (code & LEVEL_MASK) as u32 + 1
            },
            flags: self.flags(),
        }
    }

    /// Publishes `object` in a fresh slot and returns its handle.
    ///
    /// The table records the pointer verbatim and takes no reference;
    /// callers reference the object before creating the handle.
    pub fn create_handle(&self, object: *mut u8, granted_access: usize) -> Result<Handle, HandleError> {
        debug_assert!(object as usize & !ENTRY_PTR_MASK == 0);
        if !self.rundown.acquire() {
            return Err(HandleError::Terminating);
        }
        let result = self.create_handle_pinned(object, granted_access);
        self.rundown.release();
        result
    }

    fn create_handle_pinned(
        &self,
        object: *mut u8,
        granted_access: usize,
    ) -> Result<Handle, HandleError> {
        loop {
            if let Some(handle) = self.pop_free_slot() {
                let index = handle.index();
                // Slot is ours alone, but claiming under the stripe keeps
                // the locking discipline uniform with destroy and sweep.
                let _guard = self.stripe(index).lock_exclusive();
                let entry = self
                    .entry_for(index)
                    .ok_or(HandleError::InvalidHandle)?;
                entry.info.store(granted_access, Relaxed);
                entry.value.store(object as usize | ENTRY_IN_USE, Release);
                self.handle_count.fetch_add(1, Relaxed);
                return Ok(handle);
            }
            self.grow()?;
        }
    }

    /// Removes the slot named by `handle` and returns the object pointer
    /// it held, without releasing any reference to that object.
    ///
    /// When `expected_object` is given, the slot is only destroyed if it
    /// still holds that pointer.
    pub fn destroy_handle(
        &self,
        handle: Handle,
        expected_object: Option<*mut u8>,
    ) -> Result<*mut u8, HandleError> {
        if !self.rundown.acquire() {
            return Err(HandleError::Terminating);
        }
        let result = self.destroy_handle_pinned(handle, expected_object);
        self.rundown.release();
        result
    }

    fn destroy_handle_pinned(
        &self,
        handle: Handle,
        expected_object: Option<*mut u8>,
    ) -> Result<*mut u8, HandleError> {
        let index = handle.index();
        let _guard = self.stripe(index).lock_exclusive();
        let entry = self.entry_for(index).ok_or(HandleError::InvalidHandle)?;
        // Holding the stripe exclusively excludes lookup guards, so the
        // locked bit cannot be set here.
        let value = entry.value.load(Relaxed);
        if value & ENTRY_IN_USE == 0 {
            return Err(HandleError::InvalidHandle);
        }
        let object = (value & ENTRY_PTR_MASK) as *mut u8;
        if let Some(expected) = expected_object {
            if object != expected {
                return Err(HandleError::Mismatch);
            }
        }
        entry.value.store(0, Release);
        self.handle_count.fetch_sub(1, Relaxed);
        self.push_free_slot(handle, entry);
        Ok(object)
    }

    /// Resolves `handle` to a guard pinning its slot. The guard excludes
    /// destroy and sweep of the slot for as long as it is held; other
    /// lookups of the *same* slot block until it drops.
    pub fn lookup(&self, handle: Handle) -> Result<LockedEntry<'_>, HandleError> {
        if !self.rundown.acquire() {
            return Err(HandleError::Terminating);
        }
        let index = handle.index();
        let stripe = self.stripe(index);
        stripe.acquire_shared();
        let fail = |error| {
            stripe.release_shared();
            self.rundown.release();
            Err(error)
        };
        let entry = match self.entry_for(index) {
            Some(entry) => entry,
            None => return fail(HandleError::InvalidHandle),
        };
        loop {
            let value = entry.value.load(Acquire);
            if value & ENTRY_IN_USE == 0 {
                return fail(HandleError::InvalidHandle);
            }
            if value & ENTRY_LOCKED != 0 {
                // Another guard holds this exact slot; all slot lockers
                // hold the stripe shared, so waiting here cannot deadlock.
                self.entry_event
                    .wait_while(|| entry.value.load(Acquire) & ENTRY_LOCKED != 0);
                continue;
            }
            match entry.value.compare_exchange_weak(
                value,
                value | ENTRY_LOCKED,
                Acquire,
                Relaxed,
            ) {
                Ok(_) => {
                    return Ok(LockedEntry {
                        table: self,
                        entry,
                        object: (value & ENTRY_PTR_MASK) as *mut u8,
                        stripe_index: index as usize & (STRIPE_COUNT - 1),
                    })
                }
                Err(_) => continue,
            }
        }
    }

    /// Calls `visitor` for every live slot, stripe by stripe, with each
    /// stripe held exclusively during its slots. Returns early when the
    /// visitor returns `false`.
    ///
    /// Slots in *other* stripes may be created or destroyed while one
    /// stripe is being walked; the enumeration is a consistent snapshot
    /// per stripe, not per table.
    pub fn enum_entries<F>(&self, mut visitor: F) -> Result<(), HandleError>
    where
        F: FnMut(Handle, *mut u8, usize) -> bool,
    {
        if !self.rundown.acquire() {
            return Err(HandleError::Terminating);
        }
        'stripes: for stripe in 0..STRIPE_COUNT {
            let _guard = self.stripes[stripe].lock_exclusive();
            let limit = self.next_index.load(Acquire);
            let mut index = stripe as u32;
            while index < limit {
                if let Some(entry) = self.entry_for(index) {
                    let value = entry.value.load(Relaxed);
                    if value & ENTRY_IN_USE != 0 {
                        let object = (value & ENTRY_PTR_MASK) as *mut u8;
                        let access = entry.info.load(Relaxed);
                        if !visitor(Handle::encode(index), object, access) {
                            break 'stripes;
                        }
                    }
                }
                index += STRIPE_COUNT as u32;
            }
        }
        self.rundown.release();
        Ok(())
    }

    /// Destroys every live slot for which `predicate` returns `true`,
    /// under the same locking as [`enum_entries`](Self::enum_entries).
    /// Returns the number of slots destroyed.
    ///
    /// The predicate receives the object pointer while the slot is still
    /// live, so it may take over the caller's reference (dereferencing the
    /// object, say) before the slot is recycled.
    pub fn sweep<F>(&self, mut predicate: F) -> Result<usize, HandleError>
    where
        F: FnMut(Handle, *mut u8, usize) -> bool,
    {
        if !self.rundown.acquire() {
            return Err(HandleError::Terminating);
        }
        let mut swept = 0;
        for stripe in 0..STRIPE_COUNT {
            let _guard = self.stripes[stripe].lock_exclusive();
            let limit = self.next_index.load(Acquire);
            let mut index = stripe as u32;
            while index < limit {
                if let Some(entry) = self.entry_for(index) {
                    let value = entry.value.load(Relaxed);
                    if value & ENTRY_IN_USE != 0 {
                        let object = (value & ENTRY_PTR_MASK) as *mut u8;
                        let access = entry.info.load(Relaxed);
                        let handle = Handle::encode(index);
                        if predicate(handle, object, access) {
                            entry.value.store(0, Release);
                            self.handle_count.fetch_sub(1, Relaxed);
                            self.push_free_slot(handle, entry);
                            swept += 1;
                        }
                    }
                }
                index += STRIPE_COUNT as u32;
            }
        }
        self.rundown.release();
        Ok(swept)
    }

    /// Shuts the table down: turns away new operations, waits for those in
    /// flight, then frees all trie levels. Stored object pointers are
    /// discarded, not dereferenced; callers that own references must sweep
    /// first. Idempotent.
    pub fn close(&self) {
        self.rundown.wait();
        let _guard = self.table_lock.lock_exclusive();
        let code = self.table_code.swap(0, Acquire);
        if code == 0 {
            return;
        }
        unsafe { free_levels(code) };
        self.free_list.store(0, Relaxed);
        self.next_index.store(0, Relaxed);
        self.handle_count.store(0, Relaxed);
        debug!("handle table closed");
    }

    #[inline]
    fn stripe(&self, index: u32) -> &QueuedLock {
        &self.stripes[index as usize & (STRIPE_COUNT - 1)]
    }

    /// Walks the trie to the entry for `index`. Returns `None` when the
    /// index lies beyond the carved levels.
    ///
    /// Safe to call while holding the rundown pin: levels are freed only
    /// by `close`, after all pins drain, and are never shrunk before then.
    fn entry_for(&self, index: u32) -> Option<&HandleTableEntry> {
        let code = self.table_code.load(Acquire);
        if code == 0 {
            return None;
        }
        let root = (code & !LEVEL_MASK) as *mut u8;
        let i0 = (index as usize) & (LEVEL_SIZE - 1);
        let i1 = (index as usize >> LEVEL_SHIFT) & (LEVEL_SIZE - 1);
        let i2 = index as usize >> (2 * LEVEL_SHIFT);
        unsafe {
            match code & LEVEL_MASK {
                0 => {
                    if index as usize >= LEVEL_SIZE {
                        return None;
                    }
                    Some(&(*(root as *const Level0))[i0])
                }
                1 => {
                    if index as usize >= LEVEL_SIZE * LEVEL_SIZE {
                        return None;
                    }
                    let level0 = (*(root as *const Level1))[i1].load(Acquire);
                    if level0.is_null() {
                        return None;
                    }
                    Some(&(*level0)[i0])
                }
                _ => {
                    let level1 = (*(root as *const Level2))[i2].load(Acquire);
                    if level1.is_null() {
                        return None;
                    }
                    let level0 = (*level1)[i1].load(Acquire);
                    if level0.is_null() {
                        return None;
                    }
                    Some(&(*level0)[i0])
                }
            }
        }
    }

    /// Pops one free slot off the free list.
    fn pop_free_slot(&self) -> Option<Handle> {
        let mut head = self.free_list.load(Acquire);
        loop {
            if head == 0 {
                return None;
            }
            // The list only ever holds values this table encoded.
            let handle = Handle::from_raw(head as u32)?;
            let entry = self.entry_for(handle.index())?;
            let next = entry.info.load(Relaxed);
            // An index recycled twice between our loads could leave `next`
            // stale (classic ABA); tolerated at this table's scale, where
            // wrapping through 16M slots between two instructions does not
            // arise.
            match self
                .free_list
                .compare_exchange_weak(head, next, Acquire, Acquire)
            {
                Ok(_) => return Some(handle),
                Err(fresh) => head = fresh,
            }
        }
    }

    /// Pushes a destroyed slot back onto the free list.
    fn push_free_slot(&self, handle: Handle, entry: &HandleTableEntry) {
        let mut head = self.free_list.load(Relaxed);
        loop {
            entry.info.store(head, Relaxed);
            match self.free_list.compare_exchange_weak(
                head,
                handle.raw() as usize,
                Release,
                Relaxed,
            ) {
                Ok(_) => return,
                Err(fresh) => head = fresh,
            }
        }
    }

    /// Carves one more 256-slot chunk, growing the trie a level when the
    /// current one is exhausted, and splices the chunk onto the free list.
    fn grow(&self) -> Result<(), HandleError> {
        let _guard = self.table_lock.lock_exclusive();
        if self.free_list.load(Acquire) != 0 {
            // Another thread grew while we waited for the lock.
            return Ok(());
        }
        if self.flags().contains(HandleTableFlags::NO_GROW) {
            return Err(HandleError::TableFull);
        }
        let base = self.next_index.load(Relaxed);
        if base >= MAX_HANDLES {
            return Err(HandleError::TableFull);
        }
        let chunk = new_level0();
        // Pre-chain the chunk's slots; the last links to the (empty) list
        // at splice time.
        unsafe {
            for i in 0..LEVEL_SIZE - 1 {
                (*chunk)[i]
                    .info
                    .store(Handle::encode(base + i as u32 + 1).raw() as usize, Relaxed);
            }
        }
        // The chunk must be reachable through the trie before any of its
        // handles can be popped.
        self.install_chunk(base, chunk);
        self.next_index.store(base + LEVEL_SIZE as u32, Release);
        let first = Handle::encode(base).raw() as usize;
        let last = unsafe { &(*chunk)[LEVEL_SIZE - 1] };
        let mut head = self.free_list.load(Relaxed);
        loop {
            last.info.store(head, Relaxed);
            match self
                .free_list
                .compare_exchange_weak(head, first, Release, Relaxed)
            {
                Ok(_) => break,
                Err(fresh) => head = fresh,
            }
        }
        debug!(
            "handle table grew to {} slots ({} levels)",
            base as usize + LEVEL_SIZE,
            (self.table_code.load(Relaxed) & LEVEL_MASK) + 1
        );
        Ok(())
    }

    /// Links a freshly allocated chunk covering `[base, base + 256)` into
    /// the trie, promoting the root a level at the 256 and 65536
    /// boundaries. Called with the structural lock held and
    /// `base == next_index`.
    fn install_chunk(&self, base: u32, chunk: *mut Level0) {
        let code = self.table_code.load(Relaxed);
        let i1 = (base as usize >> LEVEL_SHIFT) & (LEVEL_SIZE - 1);
        let i2 = base as usize >> (2 * LEVEL_SHIFT);
        if code == 0 {
            debug_assert_eq!(base, 0);
            self.table_code.store(chunk as usize, Release);
            return;
        }
        let root = (code & !LEVEL_MASK) as *mut u8;
        match code & LEVEL_MASK {
            0 => {
                // One full level; lift it under a new middle level.
                debug_assert_eq!(base as usize, LEVEL_SIZE);
                let level1 = Box::into_raw(Box::new([NULL_L0; LEVEL_SIZE]));
                unsafe {
                    (*level1)[0].store(root as *mut Level0, Relaxed);
                    (*level1)[1].store(chunk, Relaxed);
                }
                self.table_code.store(level1 as usize | 1, Release);
            }
            1 => {
                if (base as usize) < LEVEL_SIZE * LEVEL_SIZE {
                    let level1 = root as *mut Level1;
                    unsafe { (*level1)[i1].store(chunk, Release) };
                } else {
                    // Two full levels; lift them under a new top level.
                    debug_assert_eq!(base as usize, LEVEL_SIZE * LEVEL_SIZE);
                    let level2 = Box::into_raw(Box::new([NULL_L1; LEVEL_SIZE]));
                    let new_level1 = Box::into_raw(Box::new([NULL_L0; LEVEL_SIZE]));
                    unsafe {
                        (*new_level1)[0].store(chunk, Relaxed);
                        (*level2)[0].store(root as *mut Level1, Relaxed);
                        (*level2)[1].store(new_level1, Relaxed);
                    }
                    self.table_code.store(level2 as usize | 2, Release);
                }
            }
            _ => {
                let level2 = root as *mut Level2;
                unsafe {
                    let mut level1 = (*level2)[i2].load(Relaxed);
                    if level1.is_null() {
                        level1 = Box::into_raw(Box::new([NULL_L0; LEVEL_SIZE]));
                        (*level2)[i2].store(level1, Release);
                    }
                    (*level1)[i1].store(chunk, Release);
                }
            }
        }
    }
}

impl Default for HandleTable {
    fn default() -> HandleTable {
        HandleTable::new()
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        self.close();
    }
}

/// Frees every level reachable from a retired table code word.
unsafe fn free_levels(code: usize) {
    let root = (code & !LEVEL_MASK) as *mut u8;
    match code & LEVEL_MASK {
        0 => drop(Box::from_raw(root as *mut Level0)),
        1 => free_level1(root as *mut Level1),
        _ => {
            let level2 = Box::from_raw(root as *mut Level2);
            for slot in level2.iter() {
                let level1 = slot.load(Relaxed);
                if !level1.is_null() {
                    free_level1(level1);
                }
            }
        }
    }
}

unsafe fn free_level1(level1: *mut Level1) {
    let level1 = Box::from_raw(level1);
    for slot in level1.iter() {
        let level0 = slot.load(Relaxed);
        if !level0.is_null() {
            drop(Box::from_raw(level0));
        }
    }
}

/// RAII result of a successful [`HandleTable::lookup`]: the slot's stripe
/// is held shared and the slot's locked bit is set, so the slot cannot be
/// destroyed, swept, or concurrently locked until this guard drops.
pub struct LockedEntry<'a> {
    table: &'a HandleTable,
    entry: &'a HandleTableEntry,
    object: *mut u8,
    stripe_index: usize,
}

impl<'a> LockedEntry<'a> {
    /// The object pointer the slot holds. Valid for the caller's use only
    /// while the guard lives, unless the caller takes its own reference.
    #[inline]
    pub fn object(&self) -> *mut u8 {
        self.object
    }

    /// The slot's granted-access word.
    #[inline]
    pub fn granted_access(&self) -> usize {
        self.entry.info.load(Relaxed)
    }

    /// Replaces the slot's granted-access word.
    #[inline]
    pub fn set_granted_access(&self, granted_access: usize) {
        self.entry.info.store(granted_access, Relaxed);
    }
}

impl<'a> Drop for LockedEntry<'a> {
    fn drop(&mut self) {
        self.entry.value.fetch_and(!ENTRY_LOCKED, Release);
        self.table.entry_event.pulse();
        self.table.stripes[self.stripe_index].release_shared();
        self.table.rundown.release();
    }
}
