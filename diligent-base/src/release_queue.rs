use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

struct StalePayload(#[allow(dead_code)] Box<dyn Any + Send>);

// SAFETY: the payload is never accessed through a shared reference, it is only dropped by
// whichever wrapper clone goes away last
unsafe impl Sync for StalePayload {}

/// Type-erased resource waiting for the GPU to finish with it. The resource is dropped when the
/// last clone of the wrapper is dropped, so one wrapper can be queued on several command queues and
/// the resource goes away once every queue has released it.
#[derive(Clone)]
pub struct DynamicStaleResourceWrapper {
    payload: Arc<StalePayload>,
}

impl DynamicStaleResourceWrapper {
    pub fn new<T: Send + 'static>(resource: T) -> Self {
        DynamicStaleResourceWrapper {
            payload: Arc::new(StalePayload(Box::new(resource))),
        }
    }

    /// Wraps `resource` and returns one handle per reference
    pub fn create<T: Send + 'static>(
        resource: T,
        num_references: usize,
    ) -> Vec<Self> {
        assert!(num_references >= 1);
        let wrapper = Self::new(resource);
        let mut wrappers = Vec::with_capacity(num_references);
        for _ in 1..num_references {
            wrappers.push(wrapper.clone());
        }
        wrappers.push(wrapper);
        wrappers
    }

    pub fn num_references(&self) -> usize {
        Arc::strong_count(&self.payload)
    }
}

impl std::fmt::Debug for DynamicStaleResourceWrapper {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DynamicStaleResourceWrapper")
            .field("num_references", &self.num_references())
            .finish()
    }
}

/// Per command queue list of resources that cannot be released until the GPU is done with them.
///
/// Resources enter the *stale* list tagged with the number of the next command list to be
/// submitted: they may still be referenced by commands being recorded. Once that command list is
/// submitted, `discard_stale_resources` moves them to the *release* list tagged with the fence
/// value that submission will signal. `purge` drops everything whose fence has completed.
#[derive(Default)]
pub struct ResourceReleaseQueue {
    stale_resources: Mutex<VecDeque<(u64, DynamicStaleResourceWrapper)>>,
    release_queue: Mutex<VecDeque<(u64, DynamicStaleResourceWrapper)>>,
}

impl ResourceReleaseQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues a resource that may be referenced by command lists up to and including
    /// `next_command_list_number`
    pub fn safe_release_resource(
        &self,
        wrapper: DynamicStaleResourceWrapper,
        next_command_list_number: u64,
    ) {
        self.stale_resources
            .lock()
            .push_back((next_command_list_number, wrapper));
    }

    /// Queues a resource that may be used by the GPU until `fence_value` completes
    pub fn discard_resource(
        &self,
        wrapper: DynamicStaleResourceWrapper,
        fence_value: u64,
    ) {
        self.release_queue.lock().push_back((fence_value, wrapper));
    }

    /// Moves stale resources referenced by command lists up to `submitted_command_list_number` to the
    /// release list. They will be released once `fence_value` completes.
    #[profiling::function]
    pub fn discard_stale_resources(
        &self,
        submitted_command_list_number: u64,
        fence_value: u64,
    ) {
        // Lock order is always stale list, then release list
        let mut stale_resources = self.stale_resources.lock();
        let mut release_queue = self.release_queue.lock();
        while let Some((command_list_number, _)) = stale_resources.front() {
            if *command_list_number > submitted_command_list_number {
                break;
            }

            if let Some((_, wrapper)) = stale_resources.pop_front() {
                release_queue.push_back((fence_value, wrapper));
            }
        }
    }

    /// Releases every resource whose fence value is at most `completed_fence_value`. Returns the
    /// number of entries removed from the release list.
    #[profiling::function]
    pub fn purge(
        &self,
        completed_fence_value: u64,
    ) -> usize {
        let mut released = Vec::new();
        {
            let mut release_queue = self.release_queue.lock();
            while let Some((fence_value, _)) = release_queue.front() {
                if *fence_value > completed_fence_value {
                    break;
                }

                if let Some((_, wrapper)) = release_queue.pop_front() {
                    released.push(wrapper);
                }
            }
        }

        // Dropping a resource may queue other resources on this queue, so drop outside the lock
        let count = released.len();
        drop(released);
        count
    }

    pub fn stale_resource_count(&self) -> usize {
        self.stale_resources.lock().len()
    }

    pub fn pending_release_resource_count(&self) -> usize {
        self.release_queue.lock().len()
    }
}

impl Drop for ResourceReleaseQueue {
    fn drop(&mut self) {
        let stale = self.stale_resources.get_mut().len();
        let pending = self.release_queue.get_mut().len();
        if stale != 0 {
            log::error!("{} stale resources were not destroyed", stale);
        }
        if pending != 0 {
            log::error!("Release queue is not empty ({} resources)", pending);
        }
    }
}
