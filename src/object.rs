//! Object base and handle registry.
//!
//! Every driver-owned object starts with an [`ObjectBase`]: the dispatch
//! table pointer the loader keys on, a family tag, and an atomic reference
//! count. Objects live behind raw pointers handed across the C ABI;
//! [`Ref`] is the in-crate owning pointer that keeps the count honest.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cl::{cl_int, ClResult};
use crate::dispatch::{DispatchTable, DISPATCH};

/// Object family, one per public handle type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandleKind {
    Platform,
    Device,
    Context,
    CommandQueue,
    Memory,
    Program,
    Kernel,
    Event,
    Sampler,
}

/// Common head of every driver object. Must be the first field of the
/// containing struct so the dispatch pointer is the handle's first word.
#[repr(C)]
pub struct ObjectBase {
    dispatch: &'static DispatchTable,
    kind: HandleKind,
    refs: AtomicU64,
}

impl ObjectBase {
    pub fn new(kind: HandleKind) -> Self {
        ObjectBase {
            dispatch: &DISPATCH,
            kind,
            refs: AtomicU64::new(1),
        }
    }

    /// Increment the reference count, returning the new count.
    pub fn retain(&self) -> u64 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the reference count, returning the new count. The caller
    /// owning the last reference destroys the object when this hits zero.
    pub fn release(&self) -> u64 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release past zero");
        prev - 1
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Implemented by every object family.
pub trait ClObject: Sized {
    const KIND: HandleKind;
    /// The family-specific invalid-handle status code.
    const INVALID_HANDLE: cl_int;

    fn base(&self) -> &ObjectBase;
}

/// Typed downcast from an opaque handle.
///
/// Valid iff the pointer is non-null, its first word is this driver's
/// dispatch table, and the family tag matches `T`. Anything else is the
/// family's invalid-handle error.
pub fn downcast<'a, T: ClObject>(ptr: *const T) -> ClResult<&'a T> {
    if ptr.is_null() {
        return Err(T::INVALID_HANDLE);
    }

    // The first word of any driver object is the dispatch-table pointer;
    // read it raw before trusting anything else behind the handle.
    let first_word = unsafe { *(ptr as *const *const DispatchTable) };
    if !std::ptr::eq(first_word, &DISPATCH) {
        return Err(T::INVALID_HANDLE);
    }

    let head = unsafe { &*(ptr as *const ObjectBase) };
    if head.kind != T::KIND {
        return Err(T::INVALID_HANDLE);
    }

    Ok(unsafe { &*ptr })
}

/// Retain an object through its opaque handle.
pub fn retain_handle<T: ClObject>(ptr: *const T) -> ClResult<()> {
    downcast::<T>(ptr)?.base().retain();
    Ok(())
}

/// Release an object through its opaque handle, destroying it when the
/// count reaches zero.
pub fn release_handle<T: ClObject>(ptr: *const T) -> ClResult<()> {
    let obj = downcast::<T>(ptr)?;
    if obj.base().release() == 0 {
        drop(unsafe { Box::from_raw(ptr as *mut T) });
    }
    Ok(())
}

/// Owning pointer to a refcounted driver object.
///
/// Cloning retains; dropping releases and destroys at zero. Used for all
/// strong back-references (kernel→program→context, event→queue, sub-buffer
/// →parent) and for transient ownership inside the command queue.
pub struct Ref<T: ClObject> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

// Driver objects are internally synchronized (atomic counts, mutexed
// state) and the Metal resources they hold are thread-safe.
unsafe impl<T: ClObject> Send for Ref<T> {}
unsafe impl<T: ClObject> Sync for Ref<T> {}

impl<T: ClObject> Ref<T> {
    /// Allocate a fresh object with reference count 1.
    pub fn new(value: T) -> Ref<T> {
        let raw = Box::into_raw(Box::new(value));
        Ref {
            // Box never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            _marker: PhantomData,
        }
    }

    /// Retain an existing object and wrap it.
    pub fn from_ref(obj: &T) -> Ref<T> {
        obj.base().retain();
        Ref {
            ptr: NonNull::from(obj),
            _marker: PhantomData,
        }
    }

    /// Downcast an opaque handle and retain it.
    pub fn from_handle(ptr: *const T) -> ClResult<Ref<T>> {
        Ok(Ref::from_ref(downcast(ptr)?))
    }

    /// Hand one reference to the caller as a raw handle.
    pub fn into_raw(self) -> *mut T {
        let raw = self.ptr.as_ptr();
        std::mem::forget(self);
        raw
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T: ClObject> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ClObject> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref::from_ref(self.deref())
    }
}

impl<T: ClObject> Drop for Ref<T> {
    fn drop(&mut self) {
        if self.deref().base().release() == 0 {
            drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cl::CL_INVALID_SAMPLER;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Probe {
        base: ObjectBase,
    }

    impl Probe {
        fn new() -> Probe {
            Probe {
                base: ObjectBase::new(HandleKind::Sampler),
            }
        }
    }

    impl ClObject for Probe {
        const KIND: HandleKind = HandleKind::Sampler;
        const INVALID_HANDLE: cl_int = CL_INVALID_SAMPLER;

        fn base(&self) -> &ObjectBase {
            &self.base
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            assert_eq!(self.base.ref_count(), 0, "destroyed with live references");
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_object_starts_at_one() {
        let obj = Ref::new(Probe::new());
        assert_eq!(obj.base().ref_count(), 1);
    }

    #[test]
    fn test_clone_retains_and_drop_releases() {
        let obj = Ref::new(Probe::new());
        let other = obj.clone();
        assert_eq!(obj.base().ref_count(), 2);
        drop(other);
        assert_eq!(obj.base().ref_count(), 1);
    }

    #[test]
    fn test_downcast_rejects_null_and_wrong_family() {
        assert_eq!(
            downcast::<Probe>(std::ptr::null()).err(),
            Some(CL_INVALID_SAMPLER)
        );

        // A foreign allocation whose first word is not the dispatch table.
        let bogus = [0u64; 4];
        assert_eq!(
            downcast::<Probe>(bogus.as_ptr() as *const Probe).err(),
            Some(CL_INVALID_SAMPLER)
        );
    }

    #[test]
    fn test_downcast_accepts_live_handle() {
        let obj = Ref::new(Probe::new());
        let raw = obj.as_ptr();
        assert!(downcast::<Probe>(raw).is_ok());
    }

    #[test]
    fn test_release_handle_destroys_exactly_once() {
        let before = DROPS.load(Ordering::SeqCst);
        let raw = Ref::new(Probe::new()).into_raw();
        retain_handle(raw).unwrap();
        release_handle(raw).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), before);
        release_handle(raw).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_concurrent_retain_release_is_balanced() {
        let obj = Arc::new(Ref::new(Probe::new()));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let obj = Arc::clone(&obj);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let r = Ref::from_ref(&**obj);
                    drop(r);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(obj.base().ref_count(), 1);
    }
}
