use std::sync::Arc;

use diligent_base::{DynamicStaleResourceWrapper, ResourceReleaseQueue};
use parking_lot::Mutex;

use crate::native::{NativeCommandList, NativeCommandQueue};
use crate::{CommandQueueMask, DiligentResult};

/// Max number of command queues, one bit each in a `CommandQueueMask`
pub const MAX_COMMAND_QUEUES: usize = 64;

struct CommandQueueState {
    native_queue: Arc<dyn NativeCommandQueue>,
    release_queue: ResourceReleaseQueue,
    // Number of the next command list to submit. The lock also orders submissions.
    next_command_list_number: Mutex<u64>,
}

/// The device's command queues together with their deferred release queues.
///
/// Descriptor heaps, the dynamic memory manager and the device all share this object so they can
/// hand released memory to the queues without holding on to the device itself.
pub struct CommandQueues {
    queues: Vec<CommandQueueState>,
}

impl CommandQueues {
    pub fn new(native_queues: Vec<Arc<dyn NativeCommandQueue>>) -> DiligentResult<Self> {
        if native_queues.is_empty() {
            return Err("At least one command queue is required".into());
        }
        if native_queues.len() > MAX_COMMAND_QUEUES {
            return Err(format!(
                "{} command queues were requested, at most {} are supported",
                native_queues.len(),
                MAX_COMMAND_QUEUES
            )
            .into());
        }

        let queues = native_queues
            .into_iter()
            .map(|native_queue| CommandQueueState {
                native_queue,
                release_queue: ResourceReleaseQueue::new(),
                next_command_list_number: Mutex::new(0),
            })
            .collect();

        Ok(CommandQueues { queues })
    }

    pub fn command_queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Mask with a bit set for every queue of the device
    pub fn command_queue_mask(&self) -> CommandQueueMask {
        if self.queues.len() == MAX_COMMAND_QUEUES {
            !0
        } else {
            (1u64 << self.queues.len()) - 1
        }
    }

    pub fn native_queue(
        &self,
        queue_index: usize,
    ) -> &Arc<dyn NativeCommandQueue> {
        &self.queue(queue_index).native_queue
    }

    pub fn release_queue(
        &self,
        queue_index: usize,
    ) -> &ResourceReleaseQueue {
        &self.queue(queue_index).release_queue
    }

    fn queue(
        &self,
        queue_index: usize,
    ) -> &CommandQueueState {
        assert!(
            queue_index < self.queues.len(),
            "Command queue index ({}) is out of range",
            queue_index
        );
        &self.queues[queue_index]
    }

    /// Releases `object` once every queue in `queue_mask` has finished all command lists that could
    /// reference it
    pub fn safe_release_device_object<T: Send + 'static>(
        &self,
        object: T,
        queue_mask: CommandQueueMask,
    ) {
        let queue_mask = queue_mask & self.command_queue_mask();
        assert!(
            queue_mask != 0,
            "At least one command queue must be selected to release an object"
        );

        let wrappers =
            DynamicStaleResourceWrapper::create(object, queue_mask.count_ones() as usize);
        let mut queue_indices = (0..self.queues.len()).filter(|i| queue_mask & (1u64 << i) != 0);
        for wrapper in wrappers {
            if let Some(queue_index) = queue_indices.next() {
                let queue = &self.queues[queue_index];
                let next_command_list_number = *queue.next_command_list_number.lock();
                queue
                    .release_queue
                    .safe_release_resource(wrapper, next_command_list_number);
            }
        }
    }

    /// Submits a closed command list. Returns the fence value that will be signaled when it
    /// completes.
    #[profiling::function]
    pub fn submit_command_list(
        &self,
        queue_index: usize,
        command_list: Box<dyn NativeCommandList>,
        discard_stale_resources: bool,
    ) -> DiligentResult<u64> {
        let queue = self.queue(queue_index);

        let mut next_command_list_number = queue.next_command_list_number.lock();
        let submitted_command_list_number = *next_command_list_number;
        *next_command_list_number += 1;

        let fence_value = queue.native_queue.submit(command_list)?;
        if discard_stale_resources {
            queue
                .release_queue
                .discard_stale_resources(submitted_command_list_number, fence_value);
        }

        Ok(fence_value)
    }

    /// Releases resources the GPU is done with. `force_release` releases everything, which is only
    /// valid once the GPU is idle.
    #[profiling::function]
    pub fn purge_release_queues(
        &self,
        force_release: bool,
    ) {
        for queue_index in 0..self.queues.len() {
            self.purge_release_queue(queue_index, force_release);
        }
    }

    pub fn purge_release_queue(
        &self,
        queue_index: usize,
        force_release: bool,
    ) -> usize {
        let queue = self.queue(queue_index);
        let completed_fence_value = if force_release {
            u64::MAX
        } else {
            queue.native_queue.completed_fence_value()
        };
        queue.release_queue.purge(completed_fence_value)
    }

    /// Blocks until the GPU has finished all work submitted to the queue. Returns the fence value
    /// that was waited for.
    #[profiling::function]
    pub fn idle_command_queue(
        &self,
        queue_index: usize,
        release_resources: bool,
    ) -> u64 {
        let queue = self.queue(queue_index);
        let fence_value = {
            let mut next_command_list_number = queue.next_command_list_number.lock();
            // Everything in the stale list was referenced by at most the command list about to be
            // recorded, and no more work can be submitted while we hold the lock
            let signaled_value = queue.native_queue.signal();
            queue
                .release_queue
                .discard_stale_resources(*next_command_list_number, signaled_value);
            *next_command_list_number += 1;
            signaled_value
        };

        while queue.native_queue.completed_fence_value() < fence_value {
            std::thread::yield_now();
        }

        if release_resources {
            queue.release_queue.purge(fence_value);
        }

        fence_value
    }

    pub fn idle_gpu(&self) {
        for queue_index in 0..self.queues.len() {
            self.idle_command_queue(queue_index, true);
        }
    }

    pub fn completed_fence_value(
        &self,
        queue_index: usize,
    ) -> u64 {
        self.queue(queue_index).native_queue.completed_fence_value()
    }

    pub fn next_fence_value(
        &self,
        queue_index: usize,
    ) -> u64 {
        self.queue(queue_index).native_queue.next_fence_value()
    }

    pub fn is_fence_signaled(
        &self,
        queue_index: usize,
        fence_value: u64,
    ) -> bool {
        fence_value <= self.completed_fence_value(queue_index)
    }

    pub fn next_command_list_number(
        &self,
        queue_index: usize,
    ) -> u64 {
        *self.queue(queue_index).next_command_list_number.lock()
    }
}

impl Drop for CommandQueues {
    fn drop(&mut self) {
        // The owner idles the GPU before dropping the queues, anything left can go now
        for queue in &self.queues {
            queue.release_queue.purge(u64::MAX);
            let stale_count = queue.release_queue.stale_resource_count();
            if stale_count != 0 {
                log::warn!(
                    "{} stale resources were never submitted, releasing them with the queue",
                    stale_count
                );
            }
        }
    }
}
