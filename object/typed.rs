use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use std::alloc::Layout;
use std::fmt;

use super::{
    create_object, dereference_object, object_ref_count, reference_object, ObjectError,
    ObjectFlags, ObjectType, ObjectTypeFlags, ObjectTypeRegistry,
};

/// A registered object type whose bodies are values of `T`, dropped in
/// place by the delete procedure.
///
/// Cheap to copy; the underlying [`ObjectType`] lives for the rest of the
/// process.
pub struct TypedObjectType<T> {
    raw: &'static ObjectType,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedObjectType<T> {
    /// Registers a new type. `T` must not be over-aligned beyond the
    /// object alignment; [`create`](Self::create) fails otherwise.
    pub fn new(
        registry: &ObjectTypeRegistry,
        name: &'static str,
        flags: ObjectTypeFlags,
    ) -> TypedObjectType<T> {
        TypedObjectType {
            raw: registry.create_object_type(name, flags, Some(drop_body::<T>)),
            _marker: PhantomData,
        }
    }

    /// Allocates a new object of this type holding `body`.
    pub fn create(&self, body: T) -> Result<TypedObject<T>, ObjectError> {
        let raw = create_object(self.raw, Layout::new::<T>(), ObjectFlags::empty(), 0)?;
        let body_ptr = raw.cast::<T>();
        unsafe { ptr::write(body_ptr.as_ptr(), body) };
        Ok(TypedObject {
            body: body_ptr,
            _marker: PhantomData,
        })
    }

    /// The underlying raw type, for mixing with the raw interface.
    #[inline]
    pub fn raw(&self) -> &'static ObjectType {
        self.raw
    }
}

impl<T> Clone for TypedObjectType<T> {
    #[inline]
    fn clone(&self) -> TypedObjectType<T> {
        *self
    }
}

impl<T> Copy for TypedObjectType<T> {}

/// Delete procedure glue: drops the body as a `T`.
unsafe fn drop_body<T>(body: *mut u8) {
    ptr::drop_in_place(body as *mut T);
}

/// An owned reference to an object whose body is a `T`.
///
/// Clone adds a reference; drop releases one. The body is deleted when the
/// last `TypedObject` (and any raw references taken out with
/// [`into_body_ptr`](Self::into_body_ptr)) are gone.
pub struct TypedObject<T> {
    body: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T> TypedObject<T> {
    /// Surrenders this reference as a raw body pointer without releasing
    /// it. The pointer carries one reference that must eventually be
    /// released through [`dereference_object`] or
    /// [`from_body_ptr`](Self::from_body_ptr).
    #[inline]
    pub fn into_body_ptr(this: TypedObject<T>) -> *mut u8 {
        let body = this.body.as_ptr() as *mut u8;
        core::mem::forget(this);
        body
    }

    /// Reconstructs an owned reference from a raw body pointer.
    ///
    /// # Safety
    ///
    /// `body` must point at a live object of this `T`'s type, and the
    /// caller must transfer one reference, typically one previously taken
    /// out with [`into_body_ptr`](Self::into_body_ptr).
    #[inline]
    pub unsafe fn from_body_ptr(body: *mut u8) -> TypedObject<T> {
        TypedObject {
            body: NonNull::new_unchecked(body as *mut T),
            _marker: PhantomData,
        }
    }

    /// The raw body pointer, without affecting the reference count.
    #[inline]
    pub fn as_body_ptr(this: &TypedObject<T>) -> *mut u8 {
        this.body.as_ptr() as *mut u8
    }

    /// Current reference count, for diagnostics.
    #[inline]
    pub fn ref_count(this: &TypedObject<T>) -> usize {
        unsafe { object_ref_count(Self::as_body_ptr(this)) }
    }
}

impl<T> Deref for TypedObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.body.as_ref() }
    }
}

impl<T> Clone for TypedObject<T> {
    #[inline]
    fn clone(&self) -> TypedObject<T> {
        unsafe { reference_object(Self::as_body_ptr(self)) };
        TypedObject {
            body: self.body,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for TypedObject<T> {
    #[inline]
    fn drop(&mut self) {
        unsafe { dereference_object(self.body.as_ptr() as *mut u8) };
    }
}

impl<T: fmt::Debug> fmt::Debug for TypedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

unsafe impl<T: Send + Sync> Send for TypedObject<T> {}
unsafe impl<T: Send + Sync> Sync for TypedObject<T> {}
