use std::alloc::Layout;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use super::counters::{ObjectState, ObjectWrapper, RefCountersImpl};
use super::{Object, RefCntAutoPtr, RefCntWeakPtr, ReferenceCounters};
use crate::memory::{DefaultRawMemoryAllocator, MemoryAllocator};

#[cfg(test)]
use std::sync::atomic::AtomicUsize;

static DEFAULT_RAW_ALLOCATOR: DefaultRawMemoryAllocator = DefaultRawMemoryAllocator;

fn allocator_or_default(allocator: &Option<Arc<dyn MemoryAllocator>>) -> &dyn MemoryAllocator {
    match allocator {
        Some(allocator) => &**allocator,
        None => &DEFAULT_RAW_ALLOCATOR,
    }
}

fn allocate_payload<T>(
    allocator: &Option<Arc<dyn MemoryAllocator>>,
    description: &'static str,
) -> NonNull<T> {
    let layout = Layout::new::<T>();
    match allocator_or_default(allocator).allocate(layout, description) {
        Some(memory) => memory.cast::<T>(),
        None => std::alloc::handle_alloc_error(layout),
    }
}

struct ObjectWrapperImpl<T: Object> {
    object: NonNull<T>,
    allocator: Option<Arc<dyn MemoryAllocator>>,
}

impl<T: Object> ObjectWrapper for ObjectWrapperImpl<T> {
    fn object(&self) -> NonNull<dyn Object> {
        self.object
    }

    unsafe fn destroy_object(self: Box<Self>) {
        std::ptr::drop_in_place(self.object.as_ptr());
        allocator_or_default(&self.allocator).free(self.object.cast(), Layout::new::<T>());
    }
}

// Releases the payload memory, and optionally the fresh counters record, if the constructor
// fails or panics
struct ConstructionGuard<'a> {
    memory: NonNull<u8>,
    layout: Layout,
    allocator: &'a Option<Arc<dyn MemoryAllocator>>,
    new_counters: Option<NonNull<RefCountersImpl>>,
}

impl<'a> Drop for ConstructionGuard<'a> {
    fn drop(&mut self) {
        unsafe {
            allocator_or_default(self.allocator).free(self.memory, self.layout);
            if let Some(counters) = self.new_counters {
                RefCountersImpl::abandon(counters);
            }
        }
    }
}

/// Builder for reference-counted objects. The payload is placed in memory from the given allocator
/// (the global heap by default) and published as alive only after its constructor succeeds.
///
/// The constructor receives the object's counters and a weak pointer to the object itself. The weak
/// pointer cannot be locked until construction finishes, but it can be cloned into the object.
pub struct MakeNewRcObj {
    allocator: Option<Arc<dyn MemoryAllocator>>,
    description: &'static str,
    #[cfg(test)]
    destroy_counter: Option<Arc<AtomicUsize>>,
}

impl Default for MakeNewRcObj {
    fn default() -> Self {
        Self::new()
    }
}

impl MakeNewRcObj {
    pub fn new() -> Self {
        MakeNewRcObj {
            allocator: None,
            description: "Reference-counted object",
            #[cfg(test)]
            destroy_counter: None,
        }
    }

    pub fn with_allocator(
        allocator: Arc<dyn MemoryAllocator>,
        description: &'static str,
    ) -> Self {
        MakeNewRcObj {
            allocator: Some(allocator),
            description,
            #[cfg(test)]
            destroy_counter: None,
        }
    }

    // Counts how many times the counters record of the built object is freed
    #[cfg(test)]
    pub(crate) fn with_destroy_counter(
        mut self,
        counter: Arc<AtomicUsize>,
    ) -> Self {
        self.destroy_counter = Some(counter);
        self
    }

    pub fn create<T: Object>(
        self,
        ctor: impl FnOnce(ReferenceCounters<'_>, &RefCntWeakPtr<T>) -> T,
    ) -> RefCntAutoPtr<T> {
        match self.build::<T, std::convert::Infallible>(|counters, weak_self| {
            Ok(ctor(counters, weak_self))
        }) {
            Ok(object) => object,
            Err(never) => match never {},
        }
    }

    /// Creates a new counters record and constructs the object on it. If `ctor` returns an error
    /// (or panics) the memory and the record are released and the error is returned.
    pub fn build<T: Object, E>(
        self,
        ctor: impl FnOnce(ReferenceCounters<'_>, &RefCntWeakPtr<T>) -> Result<T, E>,
    ) -> Result<RefCntAutoPtr<T>, E> {
        let object = allocate_payload::<T>(&self.allocator, self.description);

        #[allow(unused_mut)]
        let mut counters = RefCountersImpl::new_record();
        #[cfg(test)]
        unsafe {
            counters.as_mut().destroy_counter = self.destroy_counter.clone();
        }

        let guard = ConstructionGuard {
            memory: object.cast(),
            layout: Layout::new::<T>(),
            allocator: &self.allocator,
            new_counters: Some(counters),
        };

        let weak_self = unsafe { RefCntWeakPtr::from_raw_parts(object, counters) };
        let value = ctor(unsafe { ReferenceCounters::new(counters) }, &weak_self);
        drop(weak_self);
        let value = value?;

        std::mem::forget(guard);

        unsafe {
            object.as_ptr().write(value);
            let wrapper = Box::new(ObjectWrapperImpl {
                object,
                allocator: self.allocator,
            });
            counters.as_ref().attach(wrapper);
            counters.as_ref().add_strong_ref();
            Ok(RefCntAutoPtr::from_owned_ref(object, counters))
        }
    }

    /// Constructs a sub-object that shares `owner`'s counters. Strong references to the sub-object
    /// keep the owner alive.
    ///
    /// # Safety
    ///
    /// The returned handle must be stored inside the payload of the object that owns `owner` and
    /// must only be dropped when that payload is destroyed. A handle that outlives the owner's
    /// record reads freed memory when it is dropped.
    pub unsafe fn build_owned<T: Object, E>(
        self,
        owner: ReferenceCounters<'_>,
        ctor: impl FnOnce(ReferenceCounters<'_>, &RefCntWeakPtr<T>) -> Result<T, E>,
    ) -> Result<RcSubObject<T>, E> {
        let object = allocate_payload::<T>(&self.allocator, self.description);
        let guard = ConstructionGuard {
            memory: object.cast(),
            layout: Layout::new::<T>(),
            allocator: &self.allocator,
            new_counters: None,
        };

        let weak_self = RefCntWeakPtr::from_raw_parts(object, owner.counters);
        let value = ctor(owner, &weak_self);
        drop(weak_self);
        let value = value?;

        std::mem::forget(guard);
        object.as_ptr().write(value);

        Ok(RcSubObject {
            object,
            counters: owner.counters,
            allocator: self.allocator,
        })
    }
}

/// A sub-object living on its owner's counters record. Dropping the handle destroys the
/// sub-object, so it must be owned by the object whose counters it shares. A handle dropped while
/// the owner is still alive leaks the sub-object instead.
pub struct RcSubObject<T: Object> {
    object: NonNull<T>,
    counters: NonNull<RefCountersImpl>,
    allocator: Option<Arc<dyn MemoryAllocator>>,
}

// SAFETY: same reasoning as RefCntAutoPtr
unsafe impl<T: Object> Send for RcSubObject<T> {}
unsafe impl<T: Object> Sync for RcSubObject<T> {}

impl<T: Object> RcSubObject<T> {
    /// Returns a strong reference to the sub-object. It adds a reference to the owner's counters.
    pub fn strong_ref(&self) -> RefCntAutoPtr<T> {
        unsafe { RefCntAutoPtr::from_raw_parts(self.object, self.counters) }
    }

    pub fn weak_ref(&self) -> RefCntWeakPtr<T> {
        unsafe { RefCntWeakPtr::from_raw_parts(self.object, self.counters) }
    }

    pub fn reference_counters(&self) -> ReferenceCounters<'_> {
        // SAFETY: the handle lives inside the owner's payload, which keeps the record allocated
        unsafe { ReferenceCounters::new(self.counters) }
    }
}

impl<T: Object> Deref for RcSubObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.object.as_ref() }
    }
}

impl<T: Object> Drop for RcSubObject<T> {
    fn drop(&mut self) {
        // The owner is either being destroyed or was never published. Any other state means strong
        // references to the sub-object may still exist.
        let (state, num_strong_refs) = unsafe {
            let counters = self.counters.as_ref();
            (counters.object_state(), counters.num_strong_refs())
        };
        let can_destroy = match state {
            ObjectState::Destroyed => true,
            ObjectState::NotInitialized => num_strong_refs == 0,
            ObjectState::Alive => false,
        };
        if !can_destroy {
            log::error!(
                "Sub-object dropped while its owner is {:?} with {} strong reference(s), leaking it",
                state,
                num_strong_refs
            );
            return;
        }

        unsafe {
            std::ptr::drop_in_place(self.object.as_ptr());
            allocator_or_default(&self.allocator).free(self.object.cast(), Layout::new::<T>());
        }
    }
}
