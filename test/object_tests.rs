use std::alloc::Layout;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::thread;
use std::time::{Duration, Instant};

use procscope_rt::object::{
    create_object, dereference_object, object_ref_count, reference_object_safe, ObjectError,
    ObjectFlags, ObjectTypeFlags, ObjectTypeRegistry, TypedObject, TypedObjectType,
};

static CONCURRENT_DELETES: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_concurrent_delete(_body: *mut u8) {
    CONCURRENT_DELETES.fetch_add(1, SeqCst);
}

#[test]
fn delete_procedure_runs_exactly_once() {
    let _ = env_logger::try_init();
    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type(
        "test-once",
        ObjectTypeFlags::empty(),
        Some(count_concurrent_delete),
    );
    // One extra reference, so two threads each release a final candidate.
    let body = create_object(object_type, Layout::new::<u64>(), ObjectFlags::empty(), 1)
        .unwrap()
        .as_ptr() as usize;
    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(move || unsafe { dereference_object(body as *mut u8) });
        }
    });
    assert_eq!(CONCURRENT_DELETES.load(SeqCst), 1);
}

static PROBES_REFUSED: AtomicUsize = AtomicUsize::new(0);

unsafe fn probe_from_delete(body: *mut u8) {
    // The count has irrevocably reached zero by the time the delete
    // procedure runs; no new reference may be taken.
    if !reference_object_safe(body) {
        PROBES_REFUSED.fetch_add(1, SeqCst);
    }
}

#[test]
fn safe_reference_fails_once_dead() {
    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type(
        "test-probe",
        ObjectTypeFlags::empty(),
        Some(probe_from_delete),
    );
    let body = create_object(object_type, Layout::new::<u64>(), ObjectFlags::empty(), 0)
        .unwrap()
        .as_ptr();
    unsafe {
        assert!(reference_object_safe(body));
        assert_eq!(object_ref_count(body), 2);
        dereference_object(body);
        dereference_object(body);
    }
    assert_eq!(PROBES_REFUSED.load(SeqCst), 1);
}

static DEFERRED_DELETES: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_deferred_delete(_body: *mut u8) {
    DEFERRED_DELETES.fetch_add(1, SeqCst);
}

#[test]
fn deferred_delete_runs_on_the_reaper() {
    let _ = env_logger::try_init();
    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type(
        "test-defer",
        ObjectTypeFlags::DEFER_DELETE,
        Some(count_deferred_delete),
    );
    let body = create_object(object_type, Layout::new::<u64>(), ObjectFlags::empty(), 0)
        .unwrap()
        .as_ptr();
    unsafe { dereference_object(body) };
    let deadline = Instant::now() + Duration::from_secs(2);
    while DEFERRED_DELETES.load(SeqCst) == 0 {
        assert!(Instant::now() < deadline, "reaper never deleted the object");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(DEFERRED_DELETES.load(SeqCst), 1);
}

static GATED_ENTERED: AtomicBool = AtomicBool::new(false);
static GATED_RELEASE: AtomicBool = AtomicBool::new(false);
static GATED_DELETES: AtomicUsize = AtomicUsize::new(0);

unsafe fn gated_delete(_body: *mut u8) {
    GATED_ENTERED.store(true, SeqCst);
    while !GATED_RELEASE.load(SeqCst) {
        thread::yield_now();
    }
    GATED_DELETES.fetch_add(1, SeqCst);
}

#[test]
fn deferred_objects_refuse_safe_references() {
    let _ = env_logger::try_init();
    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type(
        "test-defer-dead",
        ObjectTypeFlags::DEFER_DELETE,
        Some(gated_delete),
    );
    let body = create_object(object_type, Layout::new::<u64>(), ObjectFlags::empty(), 0)
        .unwrap()
        .as_ptr();
    unsafe {
        dereference_object(body);
        // Queued for the reaper; the count is already zero and the object
        // must not come back, even though the allocation still exists.
        assert!(!reference_object_safe(body));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !GATED_ENTERED.load(SeqCst) {
            assert!(Instant::now() < deadline, "reaper never picked up the object");
            thread::sleep(Duration::from_millis(5));
        }
        // Mid-delete on the reaper thread; still dead.
        assert!(!reference_object_safe(body));
    }
    GATED_RELEASE.store(true, SeqCst);
    let deadline = Instant::now() + Duration::from_secs(2);
    while GATED_DELETES.load(SeqCst) == 0 {
        assert!(Instant::now() < deadline, "reaper never deleted the object");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(GATED_DELETES.load(SeqCst), 1);
}

#[test]
fn creation_rejects_overaligned_bodies() {
    #[repr(align(64))]
    struct Overaligned(#[allow(dead_code)] u8);

    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type("test-align", ObjectTypeFlags::empty(), None);
    let error = create_object(
        object_type,
        Layout::new::<Overaligned>(),
        ObjectFlags::empty(),
        0,
    )
    .unwrap_err();
    assert_eq!(error, ObjectError::Misaligned);
    assert_eq!(object_type.live_count(), 0);
}

#[test]
fn zero_init_bodies_start_zeroed() {
    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type("test-zero", ObjectTypeFlags::empty(), None);
    let body = create_object(
        object_type,
        Layout::new::<[u8; 64]>(),
        ObjectFlags::ZERO_INIT,
        0,
    )
    .unwrap()
    .as_ptr();
    unsafe {
        assert!(std::slice::from_raw_parts(body, 64).iter().all(|&b| b == 0));
        dereference_object(body);
    }
}

#[test]
fn type_information_reports_counts() {
    let registry = ObjectTypeRegistry::new();
    let object_type = registry.create_object_type("test-info", ObjectTypeFlags::empty(), None);
    let first = create_object(object_type, Layout::new::<u64>(), ObjectFlags::empty(), 0)
        .unwrap()
        .as_ptr();
    let second = create_object(object_type, Layout::new::<u64>(), ObjectFlags::empty(), 0)
        .unwrap()
        .as_ptr();
    unsafe { dereference_object(second) };
    assert_eq!(object_type.live_count(), 1);
    assert_eq!(object_type.total_count(), 2);
    let info = registry
        .type_information()
        .into_iter()
        .find(|info| info.name == "test-info")
        .unwrap();
    assert_eq!(info.live_count, 1);
    assert_eq!(info.total_count, 2);
    unsafe { dereference_object(first) };
}

static TYPED_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Dropper;

impl Drop for Dropper {
    fn drop(&mut self) {
        TYPED_DROPS.fetch_add(1, SeqCst);
    }
}

#[test]
fn typed_objects_drop_with_the_last_reference() {
    let registry = ObjectTypeRegistry::new();
    let object_type =
        TypedObjectType::<Dropper>::new(&registry, "test-typed", ObjectTypeFlags::empty());
    let object = object_type.create(Dropper).unwrap();
    let clone = object.clone();
    assert_eq!(TypedObject::ref_count(&object), 2);
    drop(object);
    assert_eq!(TYPED_DROPS.load(SeqCst), 0);
    drop(clone);
    assert_eq!(TYPED_DROPS.load(SeqCst), 1);
}

#[test]
fn typed_objects_share_across_threads() {
    let registry = ObjectTypeRegistry::new();
    let object_type = TypedObjectType::<AtomicUsize>::new(
        &registry,
        "test-typed-shared",
        ObjectTypeFlags::empty(),
    );
    let object = object_type.create(AtomicUsize::new(0)).unwrap();
    thread::scope(|scope| {
        for _ in 0..4 {
            let object = object.clone();
            scope.spawn(move || {
                for _ in 0..1000 {
                    object.fetch_add(1, Relaxed);
                }
            });
        }
    });
    assert_eq!(object.load(Relaxed), 4000);
    assert_eq!(TypedObject::ref_count(&object), 1);
}

#[test]
fn typed_objects_round_trip_through_raw_pointers() {
    let registry = ObjectTypeRegistry::new();
    let object_type =
        TypedObjectType::<u64>::new(&registry, "test-typed-raw", ObjectTypeFlags::empty());
    let object = object_type.create(7).unwrap();
    let raw = TypedObject::into_body_ptr(object);
    let object = unsafe { TypedObject::<u64>::from_body_ptr(raw) };
    assert_eq!(*object, 7);
    assert_eq!(TypedObject::ref_count(&object), 1);
}
