//! Manual, type-aware reference counting.
//!
//! An object is a single contiguous allocation holding an [`ObjectHeader`]
//! followed by a caller-defined body. The *body* pointer is the object's
//! public identity; the header sits at a fixed negative offset from it and
//! is never exposed. Every object belongs to an [`ObjectType`], registered
//! once through an [`ObjectTypeRegistry`] and alive for the rest of the
//! process, which carries the type's delete procedure and live/total
//! diagnostic counters.
//!
//! The reference count starts at one (plus any extra references requested
//! at creation) and is manipulated with [`reference_object`] and
//! [`dereference_object`]. When the count irrevocably reaches zero the
//! type's delete procedure runs exactly once against the body and the
//! allocation is freed, either inline in the releasing thread or on a
//! shared reaper thread for types and call sites that must not run
//! arbitrary destructor code in place.
//!
//! The raw interface traffics in `*mut u8` body pointers and is `unsafe`
//! at the call sites that trust one. [`TypedObjectType`] and
//! [`TypedObject`] layer a safe, RAII interface over it for bodies that
//! are ordinary Rust values.

mod typed;

pub use self::typed::{TypedObject, TypedObjectType};

use core::cell::UnsafeCell;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{fence, AtomicPtr, AtomicUsize};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::error::Error;
use std::fmt;
use std::thread;

use bitflags::bitflags;
use log::{debug, trace};

use crate::sync::QueuedLock;

/// Alignment of every object allocation, and the maximum body alignment.
pub const OBJECT_ALIGN: usize = 16;

/// Offset from the start of an allocation to its body. `ObjectHeader` is
/// padded to the object alignment, so the body is always `OBJECT_ALIGN`
/// aligned as well.
const HEADER_SIZE: usize = mem::size_of::<ObjectHeader>();

const _: () = assert!(HEADER_SIZE % OBJECT_ALIGN == 0);

bitflags! {
    /// Behavior flags fixed at type registration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectTypeFlags: u32 {
        /// Every release of the last reference is routed through the
        /// reaper thread instead of deleting inline. For types whose
        /// delete procedures acquire locks that release sites may already
        /// hold.
        const DEFER_DELETE = 0x1;
    }
}

bitflags! {
    /// Per-object flags supplied at creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Zero the body before returning it.
        const ZERO_INIT = 0x1;
    }
}

/// Bookkeeping prefix of every object allocation. Lives at a fixed
/// negative offset from the body pointer and is reachable only through
/// this module.
#[repr(C, align(16))]
struct ObjectHeader {
    /// Outstanding references. The object is deleted when this falls to
    /// zero; it never rises from zero.
    ref_count: AtomicUsize,
    /// The object's registered type.
    object_type: &'static ObjectType,
    /// Size of the body in bytes, kept so the allocation can be freed
    /// without consulting the caller.
    body_size: usize,
    /// Link used while the object sits on the reaper's free list.
    next_to_free: AtomicPtr<ObjectHeader>,
}

/// Recovers the header from a body pointer.
#[inline]
unsafe fn header_of(body: *mut u8) -> *mut ObjectHeader {
    body.sub(HEADER_SIZE) as *mut ObjectHeader
}

/// Returns the body of the given header.
#[inline]
unsafe fn body_of(header: *mut ObjectHeader) -> *mut u8 {
    (header as *mut u8).add(HEADER_SIZE)
}

/// A registered kind of object. Types are created once, registered for the
/// life of the process, and shared by reference; they are never torn down.
pub struct ObjectType {
    name: &'static str,
    flags: ObjectTypeFlags,
    /// Runs against the body exactly once, after the reference count has
    /// reached zero and before the allocation is freed.
    delete_procedure: Option<unsafe fn(*mut u8)>,
    /// Objects of this type currently alive.
    live_count: AtomicUsize,
    /// Objects of this type ever created.
    total_count: AtomicUsize,
}

impl ObjectType {
    /// Name given at registration.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Flags given at registration.
    #[inline]
    pub fn flags(&self) -> ObjectTypeFlags {
        self.flags
    }

    /// Number of objects of this type currently alive.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count.load(Relaxed)
    }

    /// Number of objects of this type ever created.
    #[inline]
    pub fn total_count(&self) -> usize {
        self.total_count.load(Relaxed)
    }
}

/// Owner of a set of registered object types, held by the embedding
/// runtime rather than a process global, so diagnostics stay scoped to the
/// runtime that asked for them.
///
/// The registry hands out `&'static ObjectType`; the types outlive the
/// registry (their storage is leaked deliberately), only the enumeration
/// list is owned here.
pub struct ObjectTypeRegistry {
    lock: QueuedLock,
    types: UnsafeCell<Vec<&'static ObjectType>>,
}

// The vector is only touched under the lock.
unsafe impl Sync for ObjectTypeRegistry {}

impl ObjectTypeRegistry {
    /// Returns a new, empty registry.
    pub const fn new() -> ObjectTypeRegistry {
        ObjectTypeRegistry {
            lock: QueuedLock::new(),
            types: UnsafeCell::new(Vec::new()),
        }
    }

    /// Registers a new object type and returns it. Types are never
    /// unregistered.
    pub fn create_object_type(
        &self,
        name: &'static str,
        flags: ObjectTypeFlags,
        delete_procedure: Option<unsafe fn(*mut u8)>,
    ) -> &'static ObjectType {
        let object_type: &'static ObjectType = Box::leak(Box::new(ObjectType {
            name,
            flags,
            delete_procedure,
            live_count: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
        }));
        {
            let _guard = self.lock.lock_exclusive();
            unsafe { (*self.types.get()).push(object_type) };
        }
        debug!("registered object type {:?} ({:?})", name, flags);
        object_type
    }

    /// Returns a snapshot of every registered type. Counters are sampled
    /// individually and may be mutually inconsistent under load.
    pub fn type_information(&self) -> Vec<ObjectTypeInfo> {
        let _guard = self.lock.lock_shared();
        unsafe { (*self.types.get()).iter() }
            .map(|object_type| ObjectTypeInfo {
                name: object_type.name,
                flags: object_type.flags,
                live_count: object_type.live_count(),
                total_count: object_type.total_count(),
            })
            .collect()
    }
}

impl Default for ObjectTypeRegistry {
    fn default() -> ObjectTypeRegistry {
        ObjectTypeRegistry::new()
    }
}

/// Snapshot of one registered type's diagnostic counters.
#[derive(Clone, Debug)]
pub struct ObjectTypeInfo {
    pub name: &'static str,
    pub flags: ObjectTypeFlags,
    pub live_count: usize,
    pub total_count: usize,
}

/// Errors from object creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectError {
    /// The body layout demands stricter alignment than `OBJECT_ALIGN`.
    Misaligned,
    /// The body size plus header overflows an allocation request.
    Oversized,
    /// The allocator returned no memory.
    OutOfMemory,
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectError::Misaligned => write!(f, "body alignment exceeds object alignment"),
            ObjectError::Oversized => write!(f, "body size overflows allocation limits"),
            ObjectError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl Error for ObjectError {}

/// Allocates a new object of `object_type` with an uninitialized (or, with
/// [`ObjectFlags::ZERO_INIT`], zeroed) body of the given layout, and
/// returns its body pointer.
///
/// The reference count starts at `1 + extra_references`; the caller owns
/// all of those references and must eventually release each one.
pub fn create_object(
    object_type: &'static ObjectType,
    body_layout: Layout,
    flags: ObjectFlags,
    extra_references: usize,
) -> Result<NonNull<u8>, ObjectError> {
    if body_layout.align() > OBJECT_ALIGN {
        return Err(ObjectError::Misaligned);
    }
    let body_size = body_layout.size();
    let total_size = HEADER_SIZE
        .checked_add(body_size)
        .ok_or(ObjectError::Oversized)?;
    let layout =
        Layout::from_size_align(total_size, OBJECT_ALIGN).map_err(|_| ObjectError::Oversized)?;
    let raw = unsafe {
        if flags.contains(ObjectFlags::ZERO_INIT) {
            alloc_zeroed(layout)
        } else {
            alloc(layout)
        }
    };
    let header = raw as *mut ObjectHeader;
    if header.is_null() {
        return Err(ObjectError::OutOfMemory);
    }
    unsafe {
        ptr::write(
            header,
            ObjectHeader {
                ref_count: AtomicUsize::new(1 + extra_references),
                object_type,
                body_size,
                next_to_free: AtomicPtr::new(ptr::null_mut()),
            },
        );
        object_type.live_count.fetch_add(1, Relaxed);
        object_type.total_count.fetch_add(1, Relaxed);
        Ok(NonNull::new_unchecked(body_of(header)))
    }
}

/// Adds a reference to a live object.
///
/// # Safety
///
/// `body` must have come from [`create_object`] and the caller must hold a
/// reference, so the count cannot concurrently reach zero.
#[inline]
pub unsafe fn reference_object(body: *mut u8) {
    let old = (*header_of(body)).ref_count.fetch_add(1, Relaxed);
    debug_assert!(old > 0, "reference to a dead object");
}

/// Attempts to add a reference to an object that may be dying. Returns
/// `false` if the count has already reached zero; the count never rises
/// back from zero.
///
/// # Safety
///
/// `body` must have come from [`create_object`], and the allocation must
/// still be alive, which is the caller's to arrange by some external means
/// (a lock covering the last release, typically).
pub unsafe fn reference_object_safe(body: *mut u8) -> bool {
    let header = header_of(body);
    let mut count = (*header).ref_count.load(Relaxed);
    loop {
        if count == 0 {
            return false;
        }
        match (*header)
            .ref_count
            .compare_exchange_weak(count, count + 1, Acquire, Relaxed)
        {
            Ok(_) => return true,
            Err(fresh) => count = fresh,
        }
    }
}

/// Releases a reference. If it was the last one, runs the type's delete
/// procedure against the body and frees the allocation before returning,
/// unless the type requests deferred deletion.
///
/// # Safety
///
/// `body` must have come from [`create_object`] and the caller must hold
/// the reference being released. The pointer must not be used afterwards.
pub unsafe fn dereference_object(body: *mut u8) {
    let header = header_of(body);
    if (*header)
        .object_type
        .flags
        .contains(ObjectTypeFlags::DEFER_DELETE)
    {
        dereference_object_defer_delete(body);
        return;
    }
    if (*header).ref_count.fetch_sub(1, Release) == 1 {
        // All prior accesses to the body by other releasing threads must
        // be visible to the delete procedure.
        fence(Acquire);
        delete_object(header);
    }
}

/// Releases a reference. If it was the last one, queues the object to the
/// reaper thread instead of deleting it inline; for call sites that hold
/// locks the type's delete procedure might take.
///
/// # Safety
///
/// Same contract as [`dereference_object`].
pub unsafe fn dereference_object_defer_delete(body: *mut u8) {
    let header = header_of(body);
    let old = (*header).ref_count.fetch_sub(1, Release);
    debug_assert!(old > 0, "release of a dead object");
    if old == 1 {
        // The count hits zero before the object is queued, so safe
        // references refuse it for the whole time it waits on the reaper.
        fence(Acquire);
        reaper_push(header);
    }
}

/// Returns the type of a live object.
///
/// # Safety
///
/// `body` must be a live object's body pointer.
#[inline]
pub unsafe fn object_type_of(body: *mut u8) -> &'static ObjectType {
    (*header_of(body)).object_type
}

/// Returns the current reference count of a live object. Diagnostic only;
/// the value may be stale by the time it is read.
///
/// # Safety
///
/// `body` must be a live object's body pointer.
#[inline]
pub unsafe fn object_ref_count(body: *mut u8) -> usize {
    (*header_of(body)).ref_count.load(Relaxed)
}

/// Runs the delete procedure and frees the allocation. The caller has
/// established that no references remain.
unsafe fn delete_object(header: *mut ObjectHeader) {
    let object_type = (*header).object_type;
    let body_size = (*header).body_size;
    object_type.live_count.fetch_sub(1, Relaxed);
    if let Some(delete_procedure) = object_type.delete_procedure {
        delete_procedure(body_of(header));
    }
    let layout = Layout::from_size_align_unchecked(HEADER_SIZE + body_size, OBJECT_ALIGN);
    dealloc(header as *mut u8, layout);
}

/// Objects awaiting deletion on the reaper thread, linked through their
/// `next_to_free` fields.
static REAPER_LIST: AtomicPtr<ObjectHeader> = AtomicPtr::new(ptr::null_mut());

/// Queues a dead object (count already zero) for deletion and, when the
/// list transitions from empty, dispatches a reaper to drain it.
unsafe fn reaper_push(header: *mut ObjectHeader) {
    let mut head = REAPER_LIST.load(Relaxed);
    loop {
        (*header).next_to_free.store(head, Relaxed);
        match REAPER_LIST.compare_exchange_weak(head, header, Release, Relaxed) {
            Ok(_) => break,
            Err(fresh) => head = fresh,
        }
    }
    if head.is_null() {
        // Whoever makes the list non-empty owns dispatching the reaper.
        let spawned = thread::Builder::new()
            .name("object-reaper".into())
            .spawn(reaper_drain);
        if spawned.is_err() {
            // No thread to be had; delete inline after all.
            reaper_drain();
        }
    }
}

/// Detaches the pending list and deletes every object on it.
fn reaper_drain() {
    let mut header = REAPER_LIST.swap(ptr::null_mut(), Acquire);
    let mut reaped = 0usize;
    while !header.is_null() {
        unsafe {
            let next = (*header).next_to_free.load(Relaxed);
            // Queued objects already have a zero count; only the delete
            // remains.
            debug_assert_eq!((*header).ref_count.load(Relaxed), 0);
            delete_object(header);
            header = next;
        }
        reaped += 1;
    }
    trace!("reaper deleted {} deferred objects", reaped);
}
