//! Descriptor heap management.
//!
//! * `DescriptorHeapAllocationManager` hands out contiguous descriptor ranges from one native heap
//!   (or a sub-range of it) using a free-list allocator.
//! * `CpuDescriptorHeap` is a growable pool of managers over non-shader-visible heaps. Resource
//!   views live here.
//! * `GpuDescriptorHeap` is a single shader-visible heap split into a static/mutable region and a
//!   dynamic region.
//! * `DynamicSuballocationsManager` is a per-context linear allocator over chunks of the dynamic
//!   region. Everything it hands out is discarded at once at the end of the frame.
//!
//! Freeing a `DescriptorHeapAllocation` never returns the range immediately. The range goes to the
//! release queues of the command queues and is reused only once the GPU has moved past it.

use std::collections::BTreeSet;
use std::sync::Arc;

use diligent_base::VariableSizeAllocationsManager;
use parking_lot::Mutex;

use crate::command_queues::CommandQueues;
use crate::native::{NativeDescriptorHeap, NativeDevice};
use crate::{
    CommandQueueMask, CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, DiligentResult,
    GpuDescriptorHandle,
};

/// Something that can take back descriptor heap allocations
pub trait DescriptorAllocator: Send + Sync {
    /// Returns the allocation once every queue in `queue_mask` is done with it
    fn free(
        self: Arc<Self>,
        allocation: DescriptorHeapAllocation,
        queue_mask: CommandQueueMask,
    );

    fn descriptor_size(&self) -> u32;
}

/// A contiguous range of descriptors in one descriptor heap. A default-constructed allocation is
/// null. Dropping a non-null allocation returns it to the allocator that produced it.
#[derive(Default)]
pub struct DescriptorHeapAllocation {
    first_cpu_handle: CpuDescriptorHandle,
    first_gpu_handle: GpuDescriptorHandle,
    // None for null allocations and for dynamic suballocations, which are released in bulk
    allocator: Option<Arc<dyn DescriptorAllocator>>,
    descriptor_heap: Option<Arc<dyn NativeDescriptorHeap>>,
    num_handles: u32,
    allocation_manager_id: u16,
    descriptor_size: u32,
}

impl DescriptorHeapAllocation {
    fn new(
        allocator: Option<Arc<dyn DescriptorAllocator>>,
        descriptor_heap: Arc<dyn NativeDescriptorHeap>,
        first_cpu_handle: CpuDescriptorHandle,
        first_gpu_handle: GpuDescriptorHandle,
        num_handles: u32,
        allocation_manager_id: u16,
        descriptor_size: u32,
    ) -> Self {
        debug_assert!(!first_cpu_handle.is_null() || !first_gpu_handle.is_null());
        DescriptorHeapAllocation {
            first_cpu_handle,
            first_gpu_handle,
            allocator,
            descriptor_heap: Some(descriptor_heap),
            num_handles,
            allocation_manager_id,
            descriptor_size,
        }
    }

    pub fn is_null(&self) -> bool {
        self.first_cpu_handle.is_null()
    }

    pub fn is_shader_visible(&self) -> bool {
        !self.first_gpu_handle.is_null()
    }

    pub fn cpu_handle(
        &self,
        offset: u32,
    ) -> CpuDescriptorHandle {
        debug_assert!(offset < self.num_handles);
        self.first_cpu_handle.offset(offset, self.descriptor_size)
    }

    /// First CPU handle, null for null allocations
    pub fn first_cpu_handle(&self) -> CpuDescriptorHandle {
        self.first_cpu_handle
    }

    pub fn gpu_handle(
        &self,
        offset: u32,
    ) -> GpuDescriptorHandle {
        debug_assert!(offset < self.num_handles);
        if self.first_gpu_handle.is_null() {
            return GpuDescriptorHandle::default();
        }
        self.first_gpu_handle.offset(offset, self.descriptor_size)
    }

    pub fn num_handles(&self) -> u32 {
        self.num_handles
    }

    pub fn allocation_manager_id(&self) -> u16 {
        self.allocation_manager_id
    }

    pub fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }

    pub fn descriptor_heap(&self) -> Option<&Arc<dyn NativeDescriptorHeap>> {
        self.descriptor_heap.as_ref()
    }

    /// Returns the allocation to its allocator once the queues in `queue_mask` are done with it
    pub fn release(
        mut self,
        queue_mask: CommandQueueMask,
    ) {
        if let Some(allocator) = self.allocator.take() {
            let allocation = std::mem::take(&mut self);
            allocator.free(allocation, queue_mask);
        }
    }
}

impl Drop for DescriptorHeapAllocation {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            // Not knowing which queues used the descriptors, wait for all of them
            let allocation = std::mem::take(self);
            allocator.free(allocation, !0);
        }
    }
}

impl std::fmt::Debug for DescriptorHeapAllocation {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DescriptorHeapAllocation")
            .field("first_cpu_handle", &self.first_cpu_handle)
            .field("first_gpu_handle", &self.first_gpu_handle)
            .field("num_handles", &self.num_handles)
            .field("allocation_manager_id", &self.allocation_manager_id)
            .finish()
    }
}

struct AllocationManagerState {
    free_block_manager: VariableSizeAllocationsManager,
    max_allocated_size: usize,
    allocations_counter: usize,
}

/// Allocates descriptor ranges from a native heap, or from a sub-range of one
pub struct DescriptorHeapAllocationManager {
    manager_id: u16,
    heap_desc: DescriptorHeapDesc,
    descriptor_heap: Arc<dyn NativeDescriptorHeap>,
    descriptor_size: u32,
    num_descriptors: u32,
    first_cpu_handle: CpuDescriptorHandle,
    first_gpu_handle: GpuDescriptorHandle,
    state: Mutex<AllocationManagerState>,
}

impl DescriptorHeapAllocationManager {
    /// Creates a new native heap and manages all of it
    pub fn new(
        device: &dyn NativeDevice,
        manager_id: u16,
        heap_desc: &DescriptorHeapDesc,
    ) -> DiligentResult<Self> {
        let descriptor_heap = device.create_descriptor_heap(heap_desc)?;
        let descriptor_size = device.descriptor_handle_increment_size(heap_desc.heap_type);
        Ok(Self::with_heap_range(
            descriptor_heap,
            descriptor_size,
            manager_id,
            0,
            heap_desc.num_descriptors,
        ))
    }

    /// Manages `num_descriptors` descriptors of an existing heap starting at `first_descriptor`
    pub fn with_heap_range(
        descriptor_heap: Arc<dyn NativeDescriptorHeap>,
        descriptor_size: u32,
        manager_id: u16,
        first_descriptor: u32,
        num_descriptors: u32,
    ) -> Self {
        assert!(manager_id < u16::MAX, "Manager id exceeds 16-bit range");
        let heap_desc = *descriptor_heap.desc();
        let first_cpu_handle = descriptor_heap
            .cpu_descriptor_handle_for_heap_start()
            .offset(first_descriptor, descriptor_size);
        let first_gpu_handle = if heap_desc.shader_visible {
            descriptor_heap
                .gpu_descriptor_handle_for_heap_start()
                .offset(first_descriptor, descriptor_size)
        } else {
            GpuDescriptorHandle::default()
        };

        DescriptorHeapAllocationManager {
            manager_id,
            heap_desc,
            descriptor_heap,
            descriptor_size,
            num_descriptors,
            first_cpu_handle,
            first_gpu_handle,
            state: Mutex::new(AllocationManagerState {
                free_block_manager: VariableSizeAllocationsManager::new(num_descriptors as usize),
                max_allocated_size: 0,
                allocations_counter: 0,
            }),
        }
    }

    /// Allocates `count` contiguous descriptors. Returns a null allocation if there is no run of
    /// that length.
    pub fn allocate(
        &self,
        count: u32,
        parent: &Arc<dyn DescriptorAllocator>,
    ) -> DescriptorHeapAllocation {
        assert!(count > 0);
        let mut state = self.state.lock();
        let allocation = state.free_block_manager.allocate(count as usize, 1);
        if !allocation.is_valid() {
            return DescriptorHeapAllocation::default();
        }
        debug_assert_eq!(allocation.size, count as usize);

        let offset = allocation.unaligned_offset as u32;
        let cpu_handle = self.first_cpu_handle.offset(offset, self.descriptor_size);
        let gpu_handle = if self.heap_desc.shader_visible {
            self.first_gpu_handle.offset(offset, self.descriptor_size)
        } else {
            GpuDescriptorHandle::default()
        };

        state.max_allocated_size = state
            .max_allocated_size
            .max(state.free_block_manager.used_size());
        state.allocations_counter += 1;

        DescriptorHeapAllocation::new(
            Some(parent.clone()),
            self.descriptor_heap.clone(),
            cpu_handle,
            gpu_handle,
            count,
            self.manager_id,
            self.descriptor_size,
        )
    }

    /// Returns the range to the free list right away
    pub fn free_allocation(
        &self,
        mut allocation: DescriptorHeapAllocation,
    ) {
        // Whoever calls this owns the allocation, never send it back to the allocator
        allocation.allocator = None;
        assert_eq!(
            allocation.allocation_manager_id, self.manager_id,
            "Invalid descriptor heap manager Id"
        );
        if allocation.is_null() {
            return;
        }

        let descriptor_offset = (allocation.first_cpu_handle.ptr - self.first_cpu_handle.ptr)
            / self.descriptor_size as usize;

        let mut state = self.state.lock();
        state
            .free_block_manager
            .free(descriptor_offset, allocation.num_handles as usize);
        state.allocations_counter -= 1;
    }

    pub fn num_available_descriptors(&self) -> u32 {
        self.state.lock().free_block_manager.free_size() as u32
    }

    pub fn max_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    pub fn max_allocated_size(&self) -> u32 {
        self.state.lock().max_allocated_size as u32
    }

    pub fn allocations_counter(&self) -> usize {
        self.state.lock().allocations_counter
    }
}

impl Drop for DescriptorHeapAllocationManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.allocations_counter != 0 {
            log::error!(
                "{} allocations have not been released from descriptor heap manager {}",
                state.allocations_counter,
                self.manager_id
            );
        }
        if state.free_block_manager.free_size() != self.num_descriptors as usize {
            log::error!("Not all descriptors were released");
        }
    }
}

fn usage_percent(
    used: u32,
    total: u32,
) -> f64 {
    used as f64 * 100.0 / total.max(1) as f64
}

struct CpuDescriptorHeapState {
    heap_pool: Vec<DescriptorHeapAllocationManager>,
    // Indices into heap_pool of managers that have free descriptors
    available_heaps: BTreeSet<usize>,
    heap_desc: DescriptorHeapDesc,
    current_size: u32,
    max_size: u32,
}

struct CpuDescriptorHeapInner {
    device: Arc<dyn NativeDevice>,
    command_queues: Arc<CommandQueues>,
    heap_type: DescriptorHeapType,
    descriptor_size: u32,
    state: Mutex<CpuDescriptorHeapState>,
}

/// Growable pool of non-shader-visible descriptor heaps. Cloning the handle shares the pool.
#[derive(Clone)]
pub struct CpuDescriptorHeap {
    inner: Arc<CpuDescriptorHeapInner>,
}

impl CpuDescriptorHeap {
    pub fn new(
        device: Arc<dyn NativeDevice>,
        command_queues: Arc<CommandQueues>,
        num_descriptors_in_heap: u32,
        heap_type: DescriptorHeapType,
    ) -> DiligentResult<Self> {
        let heap_desc = DescriptorHeapDesc {
            heap_type,
            num_descriptors: num_descriptors_in_heap,
            shader_visible: false,
        };
        let descriptor_size = device.descriptor_handle_increment_size(heap_type);
        let first_manager = DescriptorHeapAllocationManager::new(&*device, 0, &heap_desc)?;

        let mut available_heaps = BTreeSet::default();
        available_heaps.insert(0);

        Ok(CpuDescriptorHeap {
            inner: Arc::new(CpuDescriptorHeapInner {
                device,
                command_queues,
                heap_type,
                descriptor_size,
                state: Mutex::new(CpuDescriptorHeapState {
                    heap_pool: vec![first_manager],
                    available_heaps,
                    heap_desc,
                    current_size: 0,
                    max_size: 0,
                }),
            }),
        })
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.inner.heap_type
    }

    pub fn descriptor_size(&self) -> u32 {
        self.inner.descriptor_size
    }

    /// Allocates `count` contiguous descriptors, adding a new heap to the pool if no existing heap
    /// has room. Returns a null allocation if the native heap cannot be created.
    #[profiling::function]
    pub fn allocate(
        &self,
        count: u32,
    ) -> DescriptorHeapAllocation {
        let parent: Arc<dyn DescriptorAllocator> = self.inner.clone();
        let mut state = self.inner.state.lock();
        let state = &mut *state;

        let mut allocation = DescriptorHeapAllocation::default();
        let candidates: Vec<usize> = state.available_heaps.iter().copied().collect();
        for heap_index in candidates {
            let manager = &state.heap_pool[heap_index];
            allocation = manager.allocate(count, &parent);
            if manager.num_available_descriptors() == 0 {
                state.available_heaps.remove(&heap_index);
            }

            if !allocation.is_null() {
                break;
            }
        }

        if allocation.is_null() {
            if count > state.heap_desc.num_descriptors {
                log::info!(
                    "Number of requested CPU descriptors handles ({}) exceeds the descriptor heap size ({}). Increasing the number of descriptors in the heap",
                    count,
                    state.heap_desc.num_descriptors
                );
            }
            state.heap_desc.num_descriptors = state.heap_desc.num_descriptors.max(count);

            let manager_id = state.heap_pool.len();
            if manager_id >= u16::MAX as usize {
                log::error!(
                    "{} CPU heap cannot grow past {} pools",
                    self.inner.heap_type.literal_name(),
                    manager_id
                );
                return DescriptorHeapAllocation::default();
            }

            let manager = match DescriptorHeapAllocationManager::new(
                &*self.inner.device,
                manager_id as u16,
                &state.heap_desc,
            ) {
                Ok(manager) => manager,
                Err(e) => {
                    log::error!(
                        "Failed to grow {} CPU heap: {}",
                        self.inner.heap_type.literal_name(),
                        e
                    );
                    return DescriptorHeapAllocation::default();
                }
            };

            log::trace!(
                "Created {} CPU descriptor heap #{} with {} descriptors",
                self.inner.heap_type.literal_name(),
                manager_id,
                state.heap_desc.num_descriptors
            );

            allocation = manager.allocate(count, &parent);
            if manager.num_available_descriptors() > 0 {
                state.available_heaps.insert(manager_id);
            }
            state.heap_pool.push(manager);
        }

        state.current_size += allocation.num_handles();
        state.max_size = state.max_size.max(state.current_size);
        allocation
    }

    pub fn pool_count(&self) -> usize {
        self.inner.state.lock().heap_pool.len()
    }

    pub fn current_size(&self) -> u32 {
        self.inner.state.lock().current_size
    }

    pub fn max_size(&self) -> u32 {
        self.inner.state.lock().max_size
    }

    pub fn total_allocation_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .heap_pool
            .iter()
            .map(|manager| manager.allocations_counter())
            .sum()
    }
}

impl CpuDescriptorHeapInner {
    fn free_allocation(
        &self,
        allocation: DescriptorHeapAllocation,
    ) {
        let mut state = self.state.lock();
        let manager_id = allocation.allocation_manager_id() as usize;
        state.current_size -= allocation.num_handles();
        state.heap_pool[manager_id].free_allocation(allocation);
        debug_assert!(state.heap_pool[manager_id].num_available_descriptors() > 0);
        state.available_heaps.insert(manager_id);
    }
}

struct StaleCpuAllocation {
    allocation: DescriptorHeapAllocation,
    heap: Arc<CpuDescriptorHeapInner>,
}

impl Drop for StaleCpuAllocation {
    fn drop(&mut self) {
        self.heap
            .free_allocation(std::mem::take(&mut self.allocation));
    }
}

impl DescriptorAllocator for CpuDescriptorHeapInner {
    fn free(
        self: Arc<Self>,
        allocation: DescriptorHeapAllocation,
        queue_mask: CommandQueueMask,
    ) {
        // The stale entry keeps the pool alive until the GPU is done with the range
        let command_queues = self.command_queues.clone();
        command_queues.safe_release_device_object(
            StaleCpuAllocation {
                allocation,
                heap: self,
            },
            queue_mask,
        );
    }

    fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }
}

impl Drop for CpuDescriptorHeapInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.current_size != 0 {
            log::error!(
                "{} CPU heap is dropped with {} descriptors still allocated",
                self.heap_type.literal_name(),
                state.current_size
            );
        }
        if state.available_heaps.len() != state.heap_pool.len() {
            log::error!("Not all descriptor heap pools are released");
        }

        let total_descriptors: u32 = state
            .heap_pool
            .iter()
            .map(|manager| manager.max_descriptors())
            .sum();
        log::info!(
            "{:<38} CPU heap allocated pool count: {}. Max descriptors: {}/{} ({:.2}%).",
            self.heap_type.literal_name(),
            state.heap_pool.len(),
            state.max_size,
            total_descriptors,
            usage_percent(state.max_size, total_descriptors)
        );
    }
}

const STATIC_MANAGER_ID: u16 = 0;
const DYNAMIC_MANAGER_ID: u16 = 1;

struct GpuDescriptorHeapInner {
    command_queues: Arc<CommandQueues>,
    heap_desc: DescriptorHeapDesc,
    descriptor_heap: Arc<dyn NativeDescriptorHeap>,
    descriptor_size: u32,
    heap_allocation_manager: DescriptorHeapAllocationManager,
    dynamic_allocations_manager: DescriptorHeapAllocationManager,
}

/// One shader-visible heap. The first `num_descriptors_in_heap` descriptors serve static and
/// mutable resources, the remaining `num_dynamic_descriptors` are handed out in chunks to
/// `DynamicSuballocationsManager`s.
#[derive(Clone)]
pub struct GpuDescriptorHeap {
    inner: Arc<GpuDescriptorHeapInner>,
}

impl GpuDescriptorHeap {
    pub fn new(
        device: &dyn NativeDevice,
        command_queues: Arc<CommandQueues>,
        num_descriptors_in_heap: u32,
        num_dynamic_descriptors: u32,
        heap_type: DescriptorHeapType,
    ) -> DiligentResult<Self> {
        let heap_desc = DescriptorHeapDesc {
            heap_type,
            num_descriptors: num_descriptors_in_heap + num_dynamic_descriptors,
            shader_visible: true,
        };
        let descriptor_heap = device.create_descriptor_heap(&heap_desc)?;
        let descriptor_size = device.descriptor_handle_increment_size(heap_type);

        let heap_allocation_manager = DescriptorHeapAllocationManager::with_heap_range(
            descriptor_heap.clone(),
            descriptor_size,
            STATIC_MANAGER_ID,
            0,
            num_descriptors_in_heap,
        );
        let dynamic_allocations_manager = DescriptorHeapAllocationManager::with_heap_range(
            descriptor_heap.clone(),
            descriptor_size,
            DYNAMIC_MANAGER_ID,
            num_descriptors_in_heap,
            num_dynamic_descriptors,
        );

        Ok(GpuDescriptorHeap {
            inner: Arc::new(GpuDescriptorHeapInner {
                command_queues,
                heap_desc,
                descriptor_heap,
                descriptor_size,
                heap_allocation_manager,
                dynamic_allocations_manager,
            }),
        })
    }

    /// Allocates from the static/mutable region
    pub fn allocate(
        &self,
        count: u32,
    ) -> DescriptorHeapAllocation {
        let parent: Arc<dyn DescriptorAllocator> = self.inner.clone();
        self.inner.heap_allocation_manager.allocate(count, &parent)
    }

    /// Allocates a chunk of the dynamic region
    pub fn allocate_dynamic(
        &self,
        count: u32,
    ) -> DescriptorHeapAllocation {
        let parent: Arc<dyn DescriptorAllocator> = self.inner.clone();
        self.inner.dynamic_allocations_manager.allocate(count, &parent)
    }

    pub fn heap_desc(&self) -> &DescriptorHeapDesc {
        &self.inner.heap_desc
    }

    pub fn native_heap(&self) -> &Arc<dyn NativeDescriptorHeap> {
        &self.inner.descriptor_heap
    }

    pub fn descriptor_size(&self) -> u32 {
        self.inner.descriptor_size
    }

    pub fn max_static_descriptors(&self) -> u32 {
        self.inner.heap_allocation_manager.max_descriptors()
    }

    pub fn max_dynamic_descriptors(&self) -> u32 {
        self.inner.dynamic_allocations_manager.max_descriptors()
    }

    pub fn num_available_static_descriptors(&self) -> u32 {
        self.inner
            .heap_allocation_manager
            .num_available_descriptors()
    }

    pub fn num_available_dynamic_descriptors(&self) -> u32 {
        self.inner
            .dynamic_allocations_manager
            .num_available_descriptors()
    }
}

struct StaleGpuAllocation {
    allocation: DescriptorHeapAllocation,
    heap: Arc<GpuDescriptorHeapInner>,
}

impl Drop for StaleGpuAllocation {
    fn drop(&mut self) {
        let allocation = std::mem::take(&mut self.allocation);
        match allocation.allocation_manager_id() {
            STATIC_MANAGER_ID => self.heap.heap_allocation_manager.free_allocation(allocation),
            DYNAMIC_MANAGER_ID => self
                .heap
                .dynamic_allocations_manager
                .free_allocation(allocation),
            id => panic!("Unexpected allocation manager ID {}", id),
        }
    }
}

impl DescriptorAllocator for GpuDescriptorHeapInner {
    fn free(
        self: Arc<Self>,
        allocation: DescriptorHeapAllocation,
        queue_mask: CommandQueueMask,
    ) {
        let command_queues = self.command_queues.clone();
        command_queues.safe_release_device_object(
            StaleGpuAllocation {
                allocation,
                heap: self,
            },
            queue_mask,
        );
    }

    fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }
}

impl Drop for GpuDescriptorHeapInner {
    fn drop(&mut self) {
        let total_static_size = self.heap_allocation_manager.max_descriptors();
        let total_dynamic_size = self.dynamic_allocations_manager.max_descriptors();
        let max_static_size = self.heap_allocation_manager.max_allocated_size();
        let max_dynamic_size = self.dynamic_allocations_manager.max_allocated_size();
        log::info!(
            "{:<38} GPU heap max allocated size (static|dynamic): {}/{} ({:.2}%) | {}/{} ({:.2}%).",
            self.heap_desc.heap_type.literal_name(),
            max_static_size,
            total_static_size,
            usage_percent(max_static_size, total_static_size),
            max_dynamic_size,
            total_dynamic_size,
            usage_percent(max_dynamic_size, total_dynamic_size)
        );
    }
}

/// Per-context linear allocator over chunks of a GPU heap's dynamic region. It is owned by a
/// single recording thread so the hot path takes no locks.
pub struct DynamicSuballocationsManager {
    parent_gpu_heap: GpuDescriptorHeap,
    dynamic_chunk_size: u32,
    suballocations: Vec<DescriptorHeapAllocation>,
    current_suballocation_offset: u32,
    current_descriptor_count: u32,
    peak_descriptor_count: u32,
    current_suballocations_total_size: u32,
    peak_suballocations_total_size: u32,
    manager_name: String,
}

impl DynamicSuballocationsManager {
    pub fn new(
        parent_gpu_heap: GpuDescriptorHeap,
        dynamic_chunk_size: u32,
        manager_name: String,
    ) -> Self {
        DynamicSuballocationsManager {
            parent_gpu_heap,
            dynamic_chunk_size,
            suballocations: Default::default(),
            current_suballocation_offset: 0,
            current_descriptor_count: 0,
            peak_descriptor_count: 0,
            current_suballocations_total_size: 0,
            peak_suballocations_total_size: 0,
            manager_name,
        }
    }

    /// Allocates `count` descriptors. Returns a null allocation when the parent's dynamic region is
    /// exhausted.
    pub fn allocate(
        &mut self,
        count: u32,
    ) -> DescriptorHeapAllocation {
        let needs_new_chunk = match self.suballocations.last() {
            Some(chunk) => self.current_suballocation_offset + count > chunk.num_handles(),
            None => true,
        };

        if needs_new_chunk {
            profiling::scope!("DynamicSuballocationsManager::allocate new chunk");
            let suballocation_size = self.dynamic_chunk_size.max(count);
            let new_chunk = self.parent_gpu_heap.allocate_dynamic(suballocation_size);
            if new_chunk.is_null() {
                log::error!(
                    "Dynamic space in {} GPU descriptor heap is exhausted.",
                    self.parent_gpu_heap.heap_desc().heap_type.literal_name()
                );
                return DescriptorHeapAllocation::default();
            }

            log::trace!(
                "{}: new chunk of {} descriptors",
                self.manager_name,
                suballocation_size
            );
            self.suballocations.push(new_chunk);
            self.current_suballocation_offset = 0;
            self.current_suballocations_total_size += suballocation_size;
            self.peak_suballocations_total_size = self
                .peak_suballocations_total_size
                .max(self.current_suballocations_total_size);
        }

        let allocation = match self.suballocations.last() {
            Some(chunk) => match chunk.descriptor_heap() {
                Some(heap) => DescriptorHeapAllocation::new(
                    None,
                    heap.clone(),
                    chunk.cpu_handle(self.current_suballocation_offset),
                    chunk.gpu_handle(self.current_suballocation_offset),
                    count,
                    chunk.allocation_manager_id(),
                    chunk.descriptor_size(),
                ),
                None => return DescriptorHeapAllocation::default(),
            },
            None => return DescriptorHeapAllocation::default(),
        };

        self.current_suballocation_offset += count;
        self.current_descriptor_count += count;
        self.peak_descriptor_count = self
            .peak_descriptor_count
            .max(self.current_descriptor_count);

        allocation
    }

    /// Discards every suballocation. The chunks go back to the parent heap once the queues in
    /// `queue_mask` are done with them.
    pub fn release_allocations(
        &mut self,
        queue_mask: CommandQueueMask,
    ) {
        for chunk in self.suballocations.drain(..) {
            chunk.release(queue_mask);
        }
        self.current_descriptor_count = 0;
        self.current_suballocations_total_size = 0;
    }

    pub fn parent_gpu_heap(&self) -> &GpuDescriptorHeap {
        &self.parent_gpu_heap
    }

    pub fn chunk_count(&self) -> usize {
        self.suballocations.len()
    }

    pub fn current_descriptor_count(&self) -> u32 {
        self.current_descriptor_count
    }

    pub fn peak_descriptor_count(&self) -> u32 {
        self.peak_descriptor_count
    }
}

impl Drop for DynamicSuballocationsManager {
    fn drop(&mut self) {
        if !self.suballocations.is_empty() || self.current_descriptor_count != 0 {
            log::error!("All dynamic suballocations must be released!");
        }
        log::info!(
            "{} usage stats: peak descriptor count: {}/{}",
            self.manager_name,
            self.peak_descriptor_count,
            self.peak_suballocations_total_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::{NullCommandQueue, NullDevice};
    use crate::native::NativeCommandQueue;

    struct TestContext {
        device: NullDevice,
        native_device: Arc<dyn NativeDevice>,
        queue: Arc<NullCommandQueue>,
        command_queues: Arc<CommandQueues>,
    }

    impl TestContext {
        fn new() -> Self {
            let _ = env_logger::try_init();
            let device = NullDevice::new();
            let queue = device.create_command_queue();
            let command_queues =
                Arc::new(CommandQueues::new(vec![queue.clone() as Arc<dyn NativeCommandQueue>]).unwrap());
            TestContext {
                native_device: Arc::new(device.clone()),
                device,
                queue,
                command_queues,
            }
        }

        fn submit_empty(&self) -> u64 {
            let mut command_list = self.device.create_command_list().unwrap();
            command_list.close().unwrap();
            self.command_queues
                .submit_command_list(0, command_list, true)
                .unwrap()
        }
    }

    struct NeverFree;

    impl DescriptorAllocator for NeverFree {
        fn free(
            self: Arc<Self>,
            _allocation: DescriptorHeapAllocation,
            _queue_mask: CommandQueueMask,
        ) {
            panic!("allocation should have been freed through the manager");
        }

        fn descriptor_size(&self) -> u32 {
            32
        }
    }

    #[test]
    fn test_manager_round_trip() {
        let context = TestContext::new();
        let desc = DescriptorHeapDesc {
            heap_type: DescriptorHeapType::CbvSrvUav,
            num_descriptors: 16,
            shader_visible: false,
        };
        let manager =
            DescriptorHeapAllocationManager::new(&*context.native_device, 0, &desc).unwrap();
        let parent: Arc<dyn DescriptorAllocator> = Arc::new(NeverFree);

        let a = manager.allocate(4, &parent);
        let b = manager.allocate(8, &parent);
        assert_eq!(b.cpu_handle(0), a.cpu_handle(0).offset(4, 32));
        assert_eq!(a.cpu_handle(3), a.cpu_handle(0).offset(3, 32));
        assert!(!a.is_shader_visible());
        assert_eq!(manager.num_available_descriptors(), 4);
        assert!(manager.allocate(5, &parent).is_null());

        manager.free_allocation(a);
        manager.free_allocation(b);
        assert_eq!(manager.num_available_descriptors(), 16);
        assert_eq!(manager.max_allocated_size(), 12);
        assert_eq!(manager.allocations_counter(), 0);

        // The whole range is one block again
        let c = manager.allocate(16, &parent);
        assert!(!c.is_null());
        manager.free_allocation(c);
    }

    #[test]
    #[should_panic(expected = "Invalid descriptor heap manager Id")]
    fn test_manager_id_mismatch() {
        let context = TestContext::new();
        let desc = DescriptorHeapDesc {
            heap_type: DescriptorHeapType::Sampler,
            num_descriptors: 4,
            shader_visible: false,
        };
        let parent: Arc<dyn DescriptorAllocator> = Arc::new(NeverFree);
        let manager_0 =
            DescriptorHeapAllocationManager::new(&*context.native_device, 0, &desc).unwrap();
        let manager_1 =
            DescriptorHeapAllocationManager::new(&*context.native_device, 1, &desc).unwrap();
        let allocation = manager_0.allocate(1, &parent);
        manager_1.free_allocation(allocation);
    }

    #[test]
    fn test_cpu_heap_grows() {
        let context = TestContext::new();
        let heap = CpuDescriptorHeap::new(
            context.native_device.clone(),
            context.command_queues.clone(),
            4,
            DescriptorHeapType::Rtv,
        )
        .unwrap();

        let a = heap.allocate(3);
        let b = heap.allocate(3);
        assert_eq!(heap.pool_count(), 2);
        let c = heap.allocate(10);
        assert!(!c.is_null());
        assert_eq!(heap.pool_count(), 3);
        assert_eq!(heap.current_size(), 16);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(heap.current_size(), 16);
        assert_eq!(
            context.command_queues.release_queue(0).stale_resource_count(),
            3
        );

        context.command_queues.idle_gpu();
        assert_eq!(heap.current_size(), 0);
        assert_eq!(heap.max_size(), 16);
        assert_eq!(heap.total_allocation_count(), 0);

        // Space freed in the first pool is reused before growing again
        let d = heap.allocate(4);
        assert_eq!(heap.pool_count(), 3);
        drop(d);
        context.command_queues.idle_gpu();
    }

    #[test]
    fn test_cpu_allocation_waits_for_gpu() {
        let context = TestContext::new();
        context.queue.set_auto_complete(false);
        let heap = CpuDescriptorHeap::new(
            context.native_device.clone(),
            context.command_queues.clone(),
            8,
            DescriptorHeapType::CbvSrvUav,
        )
        .unwrap();

        drop(heap.allocate(8));
        let fence_value = context.submit_empty();
        context.command_queues.purge_release_queues(false);
        assert_eq!(heap.current_size(), 8);

        context.queue.complete_fence(fence_value);
        context.command_queues.purge_release_queues(false);
        assert_eq!(heap.current_size(), 0);
    }

    #[test]
    fn test_gpu_heap_regions() {
        let context = TestContext::new();
        let heap = GpuDescriptorHeap::new(
            &*context.native_device,
            context.command_queues.clone(),
            8,
            8,
            DescriptorHeapType::CbvSrvUav,
        )
        .unwrap();

        let heap_start = heap.native_heap().gpu_descriptor_handle_for_heap_start();
        let static_allocation = heap.allocate(2);
        let dynamic_allocation = heap.allocate_dynamic(2);
        assert_eq!(static_allocation.gpu_handle(0), heap_start);
        assert_eq!(
            dynamic_allocation.gpu_handle(0),
            heap_start.offset(8, heap.descriptor_size())
        );
        assert_eq!(static_allocation.allocation_manager_id(), 0);
        assert_eq!(dynamic_allocation.allocation_manager_id(), 1);
        assert!(heap.allocate_dynamic(7).is_null());

        drop(static_allocation);
        drop(dynamic_allocation);
        context.command_queues.idle_gpu();
        assert_eq!(heap.num_available_static_descriptors(), 8);
        assert_eq!(heap.num_available_dynamic_descriptors(), 8);
    }

    #[test]
    fn test_dynamic_suballocations() {
        let context = TestContext::new();
        let heap = GpuDescriptorHeap::new(
            &*context.native_device,
            context.command_queues.clone(),
            4,
            16,
            DescriptorHeapType::CbvSrvUav,
        )
        .unwrap();
        let mut manager =
            DynamicSuballocationsManager::new(heap.clone(), 4, "Test dynamic manager".to_string());

        let a = manager.allocate(3);
        let b = manager.allocate(1);
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(b.cpu_handle(0), a.cpu_handle(0).offset(3, heap.descriptor_size()));

        // Does not fit the current chunk
        let c = manager.allocate(2);
        assert_eq!(manager.chunk_count(), 2);
        // Larger than the chunk size
        let d = manager.allocate(6);
        assert!(!d.is_null());
        assert_eq!(manager.chunk_count(), 3);
        assert_eq!(heap.num_available_dynamic_descriptors(), 2);

        // Exhausted
        assert!(manager.allocate(3).is_null());
        assert_eq!(manager.current_descriptor_count(), 12);

        // Suballocations are not returned one by one
        drop(a);
        drop(b);
        drop(c);
        drop(d);
        assert_eq!(heap.num_available_dynamic_descriptors(), 2);

        manager.release_allocations(1);
        assert_eq!(manager.chunk_count(), 0);
        assert_eq!(manager.peak_descriptor_count(), 12);
        context.command_queues.idle_gpu();
        assert_eq!(heap.num_available_dynamic_descriptors(), 16);
    }
}
