use std::any::TypeId;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use super::counters::RefCountersImpl;
use super::{Object, RefCntWeakPtr, ReferenceCounters};

/// Strong reference to a reference-counted object. Cloning adds a strong reference, dropping
/// releases it. The object is destroyed when the last strong reference is released.
pub struct RefCntAutoPtr<T: ?Sized> {
    object: NonNull<T>,
    counters: NonNull<RefCountersImpl>,
    phantom_data: PhantomData<T>,
}

// SAFETY: the counters are thread-safe, so sharing a strong reference is as safe as sharing the T
unsafe impl<T: ?Sized + Send + Sync> Send for RefCntAutoPtr<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RefCntAutoPtr<T> {}

impl<T: ?Sized> RefCntAutoPtr<T> {
    /// Wraps a pointer together with a strong reference the caller already owns
    ///
    /// # Safety
    ///
    /// The caller transfers exactly one strong reference on `counters`, and `object` must stay
    /// valid while `counters` has strong references
    pub(crate) unsafe fn from_owned_ref(
        object: NonNull<T>,
        counters: NonNull<RefCountersImpl>,
    ) -> Self {
        RefCntAutoPtr {
            object,
            counters,
            phantom_data: PhantomData,
        }
    }

    /// Adds a strong reference and wraps it
    ///
    /// # Safety
    ///
    /// Same as `from_owned_ref`, and the object must currently be alive
    pub(crate) unsafe fn from_raw_parts(
        object: NonNull<T>,
        counters: NonNull<RefCountersImpl>,
    ) -> Self {
        counters.as_ref().add_strong_ref();
        Self::from_owned_ref(object, counters)
    }

    pub(crate) fn counters_ptr(&self) -> NonNull<RefCountersImpl> {
        self.counters
    }

    pub(crate) fn object_ptr(&self) -> NonNull<T> {
        self.object
    }

    pub fn reference_counters(&self) -> ReferenceCounters<'_> {
        // SAFETY: this strong reference keeps the record allocated while the view is borrowed
        unsafe { ReferenceCounters::new(self.counters) }
    }

    pub fn downgrade(&self) -> RefCntWeakPtr<T> {
        RefCntWeakPtr::new(self)
    }

    /// Releases this reference, calling `pre_object_destroy` first if it was the last one
    pub fn release_with<F: FnOnce()>(
        self,
        pre_object_destroy: F,
    ) {
        let counters = self.counters;
        std::mem::forget(self);
        unsafe {
            RefCountersImpl::release_strong_ref(counters, pre_object_destroy);
        }
    }

    /// Gives up ownership without releasing the reference. The reference must eventually be given
    /// back with `attach`, otherwise the object is leaked.
    pub fn detach(self) -> DetachedRef<T> {
        let detached = DetachedRef {
            object: self.object,
            counters: self.counters,
        };
        std::mem::forget(self);
        detached
    }

    /// Takes over a reference previously given up with `detach`
    pub fn attach(detached: DetachedRef<T>) -> Self {
        // SAFETY: the detached reference still owns its strong reference
        unsafe { Self::from_owned_ref(detached.object, detached.counters) }
    }

    pub fn ptr_eq(
        lhs: &Self,
        rhs: &Self,
    ) -> bool {
        lhs.object.cast::<u8>() == rhs.object.cast::<u8>()
    }
}

/// A strong reference that was detached from its `RefCntAutoPtr`. It keeps the object alive but
/// releases nothing when dropped.
#[must_use = "a detached reference leaks the object unless it is attached again"]
pub struct DetachedRef<T: ?Sized> {
    object: NonNull<T>,
    counters: NonNull<RefCountersImpl>,
}

// SAFETY: same as RefCntAutoPtr
unsafe impl<T: ?Sized + Send + Sync> Send for DetachedRef<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for DetachedRef<T> {}

impl<T: ?Sized> DetachedRef<T> {
    pub fn object_ptr(&self) -> NonNull<T> {
        self.object
    }

    pub fn reference_counters(&self) -> ReferenceCounters<'_> {
        // SAFETY: the detached strong reference keeps the record allocated
        unsafe { ReferenceCounters::new(self.counters) }
    }
}

impl<T: Object> RefCntAutoPtr<T> {
    /// Erases the concrete type
    pub fn into_object(self) -> RefCntAutoPtr<dyn Object> {
        let object: NonNull<dyn Object> = self.object;
        let counters = self.counters;
        std::mem::forget(self);
        unsafe { RefCntAutoPtr::from_owned_ref(object, counters) }
    }
}

impl<T: ?Sized + Object> RefCntAutoPtr<T> {
    /// Asks the object for the interface `U` and returns a new strong reference to it. The new
    /// reference shares this object's counters.
    pub fn query<U: Object>(&self) -> Option<RefCntAutoPtr<U>> {
        let interface = (**self).query_interface(TypeId::of::<U>())?;
        let interface = interface.downcast_ref::<U>()?;
        unsafe { Some(RefCntAutoPtr::from_raw_parts(NonNull::from(interface), self.counters)) }
    }
}

impl<T: ?Sized> Clone for RefCntAutoPtr<T> {
    fn clone(&self) -> Self {
        unsafe { Self::from_raw_parts(self.object, self.counters) }
    }
}

impl<T: ?Sized> Drop for RefCntAutoPtr<T> {
    fn drop(&mut self) {
        unsafe {
            RefCountersImpl::release_strong_ref(self.counters, || {});
        }
    }
}

impl<T: ?Sized> Deref for RefCntAutoPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the strong reference keeps the payload alive
        unsafe { self.object.as_ref() }
    }
}

impl<T: ?Sized> PartialEq for RefCntAutoPtr<T> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Eq for RefCntAutoPtr<T> {}

impl<T: ?Sized> std::hash::Hash for RefCntAutoPtr<T> {
    fn hash<H: std::hash::Hasher>(
        &self,
        state: &mut H,
    ) {
        self.object.cast::<u8>().hash(state);
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for RefCntAutoPtr<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        (**self).fmt(f)
    }
}
