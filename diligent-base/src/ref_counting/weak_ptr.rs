use std::ptr::NonNull;

use super::counters::RefCountersImpl;
use super::RefCntAutoPtr;

/// Weak reference to a reference-counted object. It keeps the counters record alive but not the
/// object, and can be upgraded with `lock` while some strong reference still exists.
pub struct RefCntWeakPtr<T: ?Sized> {
    inner: Option<(NonNull<T>, NonNull<RefCountersImpl>)>,
}

// SAFETY: see RefCntAutoPtr
unsafe impl<T: ?Sized + Send + Sync> Send for RefCntWeakPtr<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RefCntWeakPtr<T> {}

impl<T: ?Sized> Default for RefCntWeakPtr<T> {
    fn default() -> Self {
        RefCntWeakPtr { inner: None }
    }
}

impl<T: ?Sized> RefCntWeakPtr<T> {
    pub fn new(strong: &RefCntAutoPtr<T>) -> Self {
        unsafe { Self::from_raw_parts(strong.object_ptr(), strong.counters_ptr()) }
    }

    /// Adds a weak reference and wraps it. The object may still be under construction.
    ///
    /// # Safety
    ///
    /// `counters` must point to a live record and `object` must be the payload (or a sub-object of
    /// the payload) it governs
    pub(crate) unsafe fn from_raw_parts(
        object: NonNull<T>,
        counters: NonNull<RefCountersImpl>,
    ) -> Self {
        counters.as_ref().add_weak_ref();
        RefCntWeakPtr {
            inner: Some((object, counters)),
        }
    }

    /// Returns a strong reference if the object is still alive
    pub fn lock(&self) -> Option<RefCntAutoPtr<T>> {
        let (object, counters) = self.inner?;
        unsafe {
            // A successful get_object leaves one strong reference on the counters for us
            RefCountersImpl::get_object(counters)?;
            Some(RefCntAutoPtr::from_owned_ref(object, counters))
        }
    }

    /// True if the object this pointer refers to has not been destroyed. The answer may be stale by
    /// the time the caller acts on it, use `lock` to get a usable reference.
    pub fn is_valid(&self) -> bool {
        match self.inner {
            Some((_, counters)) => unsafe { counters.as_ref().num_strong_refs() > 0 },
            None => false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn release(&mut self) {
        if let Some((_, counters)) = self.inner.take() {
            unsafe {
                RefCountersImpl::release_weak_ref(counters);
            }
        }
    }
}

impl<T: ?Sized> Clone for RefCntWeakPtr<T> {
    fn clone(&self) -> Self {
        match self.inner {
            Some((object, counters)) => unsafe { Self::from_raw_parts(object, counters) },
            None => Self::default(),
        }
    }
}

impl<T: ?Sized> Drop for RefCntWeakPtr<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: ?Sized> PartialEq for RefCntWeakPtr<T> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        match (self.inner, other.inner) {
            (Some((lhs, _)), Some((rhs, _))) => lhs.cast::<u8>() == rhs.cast::<u8>(),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for RefCntWeakPtr<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RefCntWeakPtr")
            .field("valid", &self.is_valid())
            .finish()
    }
}
