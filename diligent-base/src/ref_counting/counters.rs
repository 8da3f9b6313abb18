use crate::spin_lock::{LockFlag, LockHelper};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use super::Object;

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::Arc;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectState {
    NotInitialized = 0,
    Alive = 1,
    Destroyed = 2,
}

impl ObjectState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObjectState::NotInitialized,
            1 => ObjectState::Alive,
            _ => ObjectState::Destroyed,
        }
    }
}

/// Type-erased owner of the payload. The wrapper knows how the payload was allocated and
/// how to give the memory back.
pub(crate) trait ObjectWrapper {
    fn object(&self) -> NonNull<dyn Object>;

    /// # Safety
    ///
    /// Must be called at most once, after the last strong reference is gone
    unsafe fn destroy_object(self: Box<Self>);
}

/// The shared counters record. It is heap-allocated on its own and freed by whichever release
/// observes `strong == 0 && weak == 0 && Destroyed` last, so every method that may free it is an
/// associated function taking the record by pointer.
pub(crate) struct RefCountersImpl {
    num_strong_references: AtomicI64,
    num_weak_references: AtomicI64,
    object_state: AtomicU8,
    lock: LockFlag,
    // Written while NotInitialized (attach) and taken under `lock` when destroying
    object_wrapper: UnsafeCell<Option<Box<dyn ObjectWrapper>>>,
    #[cfg(test)]
    pub(crate) destroy_counter: Option<Arc<AtomicUsize>>,
}

impl RefCountersImpl {
    pub(crate) fn new_record() -> NonNull<Self> {
        let record = Box::new(RefCountersImpl {
            num_strong_references: AtomicI64::new(0),
            num_weak_references: AtomicI64::new(0),
            object_state: AtomicU8::new(ObjectState::NotInitialized as u8),
            lock: LockFlag::new(),
            object_wrapper: UnsafeCell::new(None),
            #[cfg(test)]
            destroy_counter: None,
        });
        NonNull::from(Box::leak(record))
    }

    #[inline(always)]
    pub(crate) fn num_strong_refs(&self) -> i64 {
        self.num_strong_references.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn num_weak_refs(&self) -> i64 {
        self.num_weak_references.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn object_state(&self) -> ObjectState {
        ObjectState::from_u8(self.object_state.load(Ordering::Acquire))
    }

    /// Publishes the payload and moves the record from NotInitialized to Alive
    ///
    /// # Safety
    ///
    /// Must be called once, by the thread that created the record, before any strong reference exists
    pub(crate) unsafe fn attach(
        &self,
        wrapper: Box<dyn ObjectWrapper>,
    ) {
        assert_eq!(
            self.object_state(),
            ObjectState::NotInitialized,
            "Object has already been attached"
        );
        *self.object_wrapper.get() = Some(wrapper);
        self.object_state
            .store(ObjectState::Alive as u8, Ordering::Release);
    }

    pub(crate) fn add_strong_ref(&self) -> i64 {
        debug_assert_eq!(
            self.object_state(),
            ObjectState::Alive,
            "Attempting to increment strong reference counter for an object that is not alive"
        );
        self.num_strong_references.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn add_weak_ref(&self) -> i64 {
        self.num_weak_references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// # Safety
    ///
    /// `this` must point to a live record and the caller must own one strong reference, which
    /// this call consumes
    pub(crate) unsafe fn release_strong_ref<F: FnOnce()>(
        this: NonNull<Self>,
        pre_object_destroy: F,
    ) -> i64 {
        let counters = this.as_ref();
        debug_assert_eq!(
            counters.object_state(),
            ObjectState::Alive,
            "Attempting to decrement strong reference counter for a destroyed or not initialized object"
        );

        let ref_count = counters
            .num_strong_references
            .fetch_sub(1, Ordering::AcqRel)
            - 1;
        assert!(
            ref_count >= 0,
            "Inconsistent call to release_strong_ref(), strong reference counter is negative"
        );

        if ref_count == 0 {
            pre_object_destroy();
            Self::try_destroy_object(this);
        }

        ref_count
    }

    /// # Safety
    ///
    /// `this` must point to a live record and the caller must own one weak reference, which this
    /// call consumes. The record may be freed before this returns.
    pub(crate) unsafe fn release_weak_ref(this: NonNull<Self>) -> i64 {
        // The check of the weak counter and of the object state must happen atomically with respect
        // to try_destroy_object. Otherwise a thread releasing the last strong reference and a thread
        // releasing the last weak reference could both decide to free the record, or neither would.
        //
        //   This thread                           |  Another thread
        //   num_weak -= 1 (now 0)                 |
        //                                         |  num_strong -= 1 (now 0)
        //                                         |  state = Destroyed
        //                                         |  sees num_weak == 0, frees the record
        //   reads state == Destroyed              |
        //   frees the record a second time       |
        let counters = this.as_ref();
        let mut lock = LockHelper::lock_flag(&counters.lock);

        let num_weak_refs = counters
            .num_weak_references
            .fetch_sub(1, Ordering::AcqRel)
            - 1;
        assert!(
            num_weak_refs >= 0,
            "Inconsistent call to release_weak_ref(), weak reference counter is negative"
        );

        let destroy_self =
            num_weak_refs == 0 && counters.object_state() == ObjectState::Destroyed;
        lock.unlock();

        if destroy_self {
            Self::self_destroy(this);
        }

        num_weak_refs
    }

    /// Speculatively adds a strong reference on behalf of a weak pointer. Succeeds only if the
    /// object is alive and somebody else already owns a strong reference, in which case the added
    /// reference is kept and the payload is returned.
    ///
    /// # Safety
    ///
    /// `this` must point to a live record and the caller must own a weak reference for the
    /// duration of the call
    pub(crate) unsafe fn get_object(this: NonNull<Self>) -> Option<NonNull<dyn Object>> {
        let counters = this.as_ref();
        if counters.object_state() != ObjectState::Alive {
            return None;
        }

        let mut lock = LockHelper::lock_flag(&counters.lock);

        // Incrementing under the lock stops try_destroy_object from running between the state
        // check and the increment. The count has to be above one after the increment, otherwise the
        // last strong reference is being released right now and the object must not come back.
        //
        //   This thread                           |  Another thread
        //                                         |  num_strong -= 1 (now 0)
        //   lock                                  |
        //   num_strong += 1 (now 1)               |
        //   sees 1, not > 1, gives it back        |
        //   num_strong -= 1 (now 0)               |
        //   unlock                                |
        //                                         |  lock, num_strong == 0, destroy the object
        let strong_refs = counters
            .num_strong_references
            .fetch_add(1, Ordering::AcqRel)
            + 1;

        let mut object = None;
        if counters.object_state() == ObjectState::Alive && strong_refs > 1 {
            if let Some(wrapper) = (*counters.object_wrapper.get()).as_ref() {
                object = Some(wrapper.object());
            }
        }

        if object.is_none() {
            counters
                .num_strong_references
                .fetch_sub(1, Ordering::AcqRel);
        }

        lock.unlock();
        object
    }

    unsafe fn try_destroy_object(this: NonNull<Self>) {
        let counters = this.as_ref();
        let mut lock = LockHelper::lock_flag(&counters.lock);

        // A weak pointer may have taken a strong reference between our decrement and the lock, in
        // which case that pointer now owns the object
        if counters.num_strong_refs() == 0 && counters.object_state() == ObjectState::Alive {
            let wrapper = (*counters.object_wrapper.get()).take();
            counters
                .object_state
                .store(ObjectState::Destroyed as u8, Ordering::Release);

            let destroy_self = counters.num_weak_refs() == 0;

            // The lock must be released before the payload is dropped. The payload may own the last
            // weak reference to itself (or to an owner sharing this record), and releasing it takes
            // the same lock.
            lock.unlock();

            if let Some(wrapper) = wrapper {
                wrapper.destroy_object();
            }

            // If a weak reference released by the payload brought the weak count to zero, that
            // release already freed the record. destroy_self was computed while the payload still
            // held it, so only one path frees the record.
            if destroy_self {
                Self::self_destroy(this);
            }
        } else {
            lock.unlock();
        }
    }

    /// Abandons a record whose payload never got attached (the constructor failed). The record
    /// is freed now if no weak reference escaped construction, otherwise by the last weak release.
    ///
    /// # Safety
    ///
    /// `this` must point to a record that was never attached and has no strong references
    pub(crate) unsafe fn abandon(this: NonNull<Self>) {
        let counters = this.as_ref();
        let mut lock = LockHelper::lock_flag(&counters.lock);
        debug_assert_eq!(counters.object_state(), ObjectState::NotInitialized);
        counters
            .object_state
            .store(ObjectState::Destroyed as u8, Ordering::Release);
        let destroy_self = counters.num_weak_refs() == 0;
        lock.unlock();

        if destroy_self {
            Self::self_destroy(this);
        }
    }

    unsafe fn self_destroy(this: NonNull<Self>) {
        let record = Box::from_raw(this.as_ptr());
        #[cfg(test)]
        if let Some(counter) = &record.destroy_counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        drop(record);
    }
}

/// Non-owning view of an object's counters, handed to constructors so that objects can place
/// sub-objects on them and query their own reference counts. The lifetime ties the view to the
/// reference it was taken from, so it can't outlive the record.
#[derive(Copy, Clone)]
pub struct ReferenceCounters<'a> {
    pub(crate) counters: NonNull<RefCountersImpl>,
    phantom_data: PhantomData<&'a RefCountersImpl>,
}

// SAFETY: the record only contains atomics, the spinlock and a payload pointer that is only touched
// under the lock or before publication
unsafe impl Send for ReferenceCounters<'_> {}
unsafe impl Sync for ReferenceCounters<'_> {}

impl<'a> ReferenceCounters<'a> {
    /// # Safety
    ///
    /// The record must stay allocated for `'a`
    pub(crate) unsafe fn new(counters: NonNull<RefCountersImpl>) -> Self {
        ReferenceCounters {
            counters,
            phantom_data: PhantomData,
        }
    }

    pub fn num_strong_refs(&self) -> i64 {
        unsafe { self.counters.as_ref().num_strong_refs() }
    }

    pub fn num_weak_refs(&self) -> i64 {
        unsafe { self.counters.as_ref().num_weak_refs() }
    }

    pub fn object_state(&self) -> ObjectState {
        unsafe { self.counters.as_ref().object_state() }
    }
}

impl PartialEq for ReferenceCounters<'_> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.counters == other.counters
    }
}

impl Eq for ReferenceCounters<'_> {}

impl std::fmt::Debug for ReferenceCounters<'_> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReferenceCounters")
            .field("strong", &self.num_strong_refs())
            .field("weak", &self.num_weak_refs())
            .field("state", &self.object_state())
            .finish()
    }
}
