use super::*;
use crate::memory::{DefaultRawMemoryAllocator, MemoryAllocator};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

struct DropCounter {
    value: u32,
    drops: Arc<AtomicUsize>,
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Object for DropCounter {}

fn make_counted(
    value: u32,
    drops: &Arc<AtomicUsize>,
    counters_freed: &Arc<AtomicUsize>,
) -> RefCntAutoPtr<DropCounter> {
    MakeNewRcObj::new()
        .with_destroy_counter(counters_freed.clone())
        .create(|_, _| DropCounter {
            value,
            drops: drops.clone(),
        })
}

#[test]
fn test_strong_weak_lifecycle() {
    let drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let object = make_counted(5, &drops, &counters_freed);
    let counters = object.reference_counters();
    assert_eq!(counters.num_strong_refs(), 1);
    assert_eq!(counters.num_weak_refs(), 0);
    assert_eq!(counters.object_state(), ObjectState::Alive);

    let weak = object.downgrade();
    assert_eq!(counters.num_strong_refs(), 1);
    assert_eq!(counters.num_weak_refs(), 1);

    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 0);

    assert!(weak.lock().is_none());
    assert!(!weak.is_valid());

    drop(weak);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_weak_lock_while_alive() {
    let drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let object = make_counted(7, &drops, &counters_freed);
    let weak = object.downgrade();
    {
        let locked = weak.lock().unwrap();
        assert_eq!(locked.value, 7);
        assert_eq!(object.reference_counters().num_strong_refs(), 2);
        assert!(locked == object);
    }
    assert_eq!(object.reference_counters().num_strong_refs(), 1);

    let copy = object.clone();
    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(weak.lock().is_some());
    drop(copy);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(weak.lock().is_none());
    drop(weak);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_counters_freed_with_last_strong_ref() {
    let drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let object = make_counted(1, &drops, &counters_freed);
    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

struct SelfReferencing {
    weak_self: RefCntWeakPtr<SelfReferencing>,
    drops: Arc<AtomicUsize>,
}

impl Drop for SelfReferencing {
    fn drop(&mut self) {
        // The object is being destroyed, so its own weak pointer must not upgrade
        assert!(self.weak_self.lock().is_none());
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Object for SelfReferencing {}

#[test]
fn test_self_reference() {
    let drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let object = MakeNewRcObj::new()
        .with_destroy_counter(counters_freed.clone())
        .create(|_, weak_self| {
            // Not published yet
            assert!(weak_self.lock().is_none());
            SelfReferencing {
                weak_self: weak_self.clone(),
                drops: drops.clone(),
            }
        });

    assert_eq!(object.reference_counters().num_weak_refs(), 1);
    let again = object.weak_self.lock().unwrap();
    assert!(again == object);
    drop(again);

    // Dropping the payload releases the last weak reference, which frees the record
    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_constructor_error_releases_counters() {
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let result = MakeNewRcObj::new()
        .with_destroy_counter(counters_freed.clone())
        .build::<SelfReferencing, String>(|counters, weak_self| {
            let _escaped_during_construction = weak_self.clone();
            assert_eq!(counters.object_state(), ObjectState::NotInitialized);
            assert_eq!(counters.num_weak_refs(), 2);
            Err("construction failed".to_string())
        });

    assert_eq!(result.err().as_deref(), Some("construction failed"));
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_constructor_panic_releases_counters() {
    let counters_freed = Arc::new(AtomicUsize::new(0));
    let counter = counters_freed.clone();

    let result = std::panic::catch_unwind(move || {
        MakeNewRcObj::new()
            .with_destroy_counter(counter)
            .create::<SelfReferencing>(|_, weak_self| {
                let _weak = weak_self.clone();
                panic!("constructor panicked");
            })
    });

    assert!(result.is_err());
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

struct SubObject {
    drops: Arc<AtomicUsize>,
}

impl Drop for SubObject {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Object for SubObject {}

struct OwnerObject {
    sub_object: RcSubObject<SubObject>,
    drops: Arc<AtomicUsize>,
}

impl Drop for OwnerObject {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Object for OwnerObject {}

#[test]
fn test_sub_object_shares_owner_counters() {
    let owner_drops = Arc::new(AtomicUsize::new(0));
    let sub_drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let owner = MakeNewRcObj::new()
        .with_destroy_counter(counters_freed.clone())
        .build::<OwnerObject, String>(|counters, _| {
            // SAFETY: the handle is stored in the owner and dropped with it
            let sub_object = unsafe {
                MakeNewRcObj::new().build_owned(counters, |_, _| {
                    Ok::<_, String>(SubObject {
                        drops: sub_drops.clone(),
                    })
                })?
            };
            Ok(OwnerObject {
                sub_object,
                drops: owner_drops.clone(),
            })
        })
        .unwrap();

    assert_eq!(
        owner.sub_object.reference_counters(),
        owner.reference_counters()
    );

    let sub_ref = owner.sub_object.strong_ref();
    let sub_weak = sub_ref.downgrade();
    assert_eq!(owner.reference_counters().num_strong_refs(), 2);

    drop(owner);
    assert_eq!(owner_drops.load(Ordering::SeqCst), 0);
    assert_eq!(sub_drops.load(Ordering::SeqCst), 0);
    assert!(sub_weak.lock().is_some());

    drop(sub_ref);
    assert_eq!(owner_drops.load(Ordering::SeqCst), 1);
    assert_eq!(sub_drops.load(Ordering::SeqCst), 1);
    assert!(sub_weak.lock().is_none());

    drop(sub_weak);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sub_object_dropped_while_referenced_is_leaked() {
    let _ = env_logger::try_init();
    let owner_drops = Arc::new(AtomicUsize::new(0));
    let sub_drops = Arc::new(AtomicUsize::new(0));

    let owner = make_counted(1, &owner_drops, &Arc::new(AtomicUsize::new(0)));
    // Breaks the contract on purpose: the handle is not stored in the owner
    let sub_object = unsafe {
        MakeNewRcObj::new()
            .build_owned(owner.reference_counters(), |_, _| {
                Ok::<_, String>(SubObject {
                    drops: sub_drops.clone(),
                })
            })
            .unwrap()
    };

    let sub_ref = sub_object.strong_ref();
    assert_eq!(owner.reference_counters().num_strong_refs(), 2);
    drop(sub_object);

    // The strong reference still points at a live payload
    assert_eq!(sub_drops.load(Ordering::SeqCst), 0);
    assert_eq!(Arc::strong_count(&sub_ref.drops), 2);

    drop(sub_ref);
    drop(owner);
    assert_eq!(owner_drops.load(Ordering::SeqCst), 1);
    assert_eq!(sub_drops.load(Ordering::SeqCst), 0);
}

#[test]
fn test_sub_object_dropped_by_failed_owner_constructor() {
    let sub_drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let result = MakeNewRcObj::new()
        .with_destroy_counter(counters_freed.clone())
        .build::<OwnerObject, String>(|counters, _| {
            let _sub_object = unsafe {
                MakeNewRcObj::new().build_owned(counters, |_, _| {
                    Ok::<_, String>(SubObject {
                        drops: sub_drops.clone(),
                    })
                })?
            };
            Err("owner failed".to_string())
        });

    assert!(result.is_err());
    assert_eq!(sub_drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pre_destroy_callback_releases_weak_ref() {
    let drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let object = make_counted(3, &drops, &counters_freed);
    let mut weak = object.downgrade();
    let copy = object.clone();

    let mut callback_calls = 0;
    copy.release_with(|| callback_calls += 1);
    assert_eq!(callback_calls, 0);

    object.release_with(|| {
        callback_calls += 1;
        weak.release();
    });

    assert_eq!(callback_calls, 1);
    assert!(weak.is_null());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

struct Component {
    value: u32,
}

impl Object for Component {}

struct Composite {
    component: Component,
}

impl Object for Composite {
    fn query_interface(
        &self,
        interface: std::any::TypeId,
    ) -> Option<&dyn std::any::Any> {
        if interface == std::any::TypeId::of::<Component>() {
            Some(&self.component)
        } else if interface == std::any::TypeId::of::<Composite>() {
            Some(self)
        } else {
            None
        }
    }
}

#[test]
fn test_query_interface() {
    let composite = MakeNewRcObj::new().create(|_, _| Composite {
        component: Component { value: 42 },
    });

    let component = composite.query::<Component>().unwrap();
    assert_eq!(component.value, 42);
    assert_eq!(composite.reference_counters().num_strong_refs(), 2);
    assert!(composite.query::<DropCounter>().is_none());

    let erased = composite.clone().into_object();
    let back = erased.query::<Composite>().unwrap();
    assert!(back == composite);
    drop(erased);
    drop(back);
    drop(component);
    assert_eq!(composite.reference_counters().num_strong_refs(), 1);
}

#[test]
fn test_detach_attach() {
    let drops = Arc::new(AtomicUsize::new(0));
    let counters_freed = Arc::new(AtomicUsize::new(0));

    let object = make_counted(9, &drops, &counters_freed);
    let detached = object.detach();
    assert_eq!(detached.reference_counters().num_strong_refs(), 1);
    assert_eq!(unsafe { detached.object_ptr().as_ref() }.value, 9);
    let object = RefCntAutoPtr::attach(detached);
    assert_eq!(object.value, 9);
    drop(object);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct CountingAllocator {
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl MemoryAllocator for CountingAllocator {
    fn allocate(
        &self,
        layout: Layout,
        description: &'static str,
    ) -> Option<NonNull<u8>> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        DefaultRawMemoryAllocator.allocate(layout, description)
    }

    unsafe fn free(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
    ) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        DefaultRawMemoryAllocator.free(ptr, layout)
    }
}

#[test]
fn test_custom_allocator() {
    let allocator = Arc::new(CountingAllocator::default());
    let drops = Arc::new(AtomicUsize::new(0));

    let object = MakeNewRcObj::with_allocator(allocator.clone(), "Test object").create(|_, _| {
        DropCounter {
            value: 0,
            drops: drops.clone(),
        }
    });
    assert_eq!(allocator.allocations.load(Ordering::SeqCst), 1);
    assert_eq!(allocator.frees.load(Ordering::SeqCst), 0);

    drop(object);
    assert_eq!(allocator.frees.load(Ordering::SeqCst), 1);

    let failed = MakeNewRcObj::with_allocator(allocator.clone(), "Failing object")
        .build::<DropCounter, ()>(|_, _| Err(()));
    assert!(failed.is_err());
    assert_eq!(allocator.allocations.load(Ordering::SeqCst), 2);
    assert_eq!(allocator.frees.load(Ordering::SeqCst), 2);
}

// Races the release of the last strong reference against weak pointers locking and releasing
#[test]
fn test_concurrent_strong_weak_release() {
    const ITERATIONS: usize = 500;
    const WEAK_THREADS: usize = 3;

    for _ in 0..ITERATIONS {
        let drops = Arc::new(AtomicUsize::new(0));
        let counters_freed = Arc::new(AtomicUsize::new(0));
        let locked_values = Arc::new(AtomicUsize::new(0));

        let object = make_counted(11, &drops, &counters_freed);
        let barrier = Arc::new(Barrier::new(WEAK_THREADS + 1));

        let mut threads = Vec::new();
        for _ in 0..WEAK_THREADS {
            let weak = object.downgrade();
            let barrier = barrier.clone();
            let locked_values = locked_values.clone();
            threads.push(std::thread::spawn(move || {
                barrier.wait();
                if let Some(strong) = weak.lock() {
                    // Whoever gets a strong reference must see a fully alive object
                    assert_eq!(strong.value, 11);
                    locked_values.fetch_add(1, Ordering::SeqCst);
                }
                drop(weak);
            }));
        }

        let strong_barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            strong_barrier.wait();
            drop(object);
        }));

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(counters_freed.load(Ordering::SeqCst), 1);
        assert!(locked_values.load(Ordering::SeqCst) <= WEAK_THREADS);
    }
}
