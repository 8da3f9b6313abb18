//! Transient upload memory. `DynamicMemoryManager` is a device-wide pool of persistently mapped
//! upload pages. Each device context owns a `DynamicHeap` that carves allocations out of pages
//! linearly and returns all of them at the end of the frame.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use diligent_base::memory::{align_up_pow2_u64, format_memory_size};
use parking_lot::Mutex;

use crate::command_queues::CommandQueues;
use crate::native::{NativeDevice, NativeHeapType, NativeResource, NativeResourceDesc, NativeResourceKind};
use crate::{CommandQueueMask, GpuVirtualAddress, NativeResourceStates};

/// A persistently mapped upload buffer
pub struct DynamicPage {
    buffer: Arc<dyn NativeResource>,
    size: u64,
}

impl DynamicPage {
    fn new(
        device: &dyn NativeDevice,
        size: u64,
    ) -> Option<Self> {
        let desc = NativeResourceDesc {
            name: "Dynamic memory page".to_string(),
            kind: NativeResourceKind::Buffer {
                size_in_bytes: size,
            },
            heap_type: NativeHeapType::Upload,
            initial_state: NativeResourceStates::GENERIC_READ,
        };

        let buffer = match device.create_committed_resource(&desc) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::error!("Failed to create dynamic page: {}", e);
                return None;
            }
        };

        log::info!(
            "Created dynamic memory page. Size: {}; GPU virtual address 0x{:x}",
            format_memory_size(size, 2),
            buffer.gpu_virtual_address()
        );

        Some(DynamicPage { buffer, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> &Arc<dyn NativeResource> {
        &self.buffer
    }

    pub fn gpu_address(
        &self,
        offset: u64,
    ) -> GpuVirtualAddress {
        self.buffer.gpu_virtual_address() + offset
    }
}

/// A range of an upload page. A default-constructed allocation is null.
#[derive(Clone, Default)]
pub struct DynamicAllocation {
    buffer: Option<Arc<dyn NativeResource>>,
    offset: u64,
    size: u64,
    gpu_address: GpuVirtualAddress,
    // Frame number of the context that made the allocation, used to catch stale allocations
    ctx_frame_number: u64,
}

impl DynamicAllocation {
    pub fn is_null(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn buffer(&self) -> Option<&Arc<dyn NativeResource>> {
        self.buffer.as_ref()
    }

    /// Offset from the start of the page buffer
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> GpuVirtualAddress {
        self.gpu_address
    }

    pub fn ctx_frame_number(&self) -> u64 {
        self.ctx_frame_number
    }

    pub fn cpu_address(&self) -> Option<NonNull<u8>> {
        let base = self.buffer.as_ref()?.cpu_address()?;
        // SAFETY: the allocation lies within the page, so the offset stays inside the mapping
        unsafe { NonNull::new(base.as_ptr().add(self.offset as usize)) }
    }

    /// Copies `data` to the start of the allocation
    pub fn write(
        &self,
        data: &[u8],
    ) {
        assert!(
            data.len() as u64 <= self.size,
            "Writing {} bytes into a dynamic allocation of {} bytes",
            data.len(),
            self.size
        );
        if let Some(cpu_address) = self.cpu_address() {
            // SAFETY: the range is inside the mapped page and belongs to this allocation only
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), cpu_address.as_ptr(), data.len());
            }
        }
    }
}

impl std::fmt::Debug for DynamicAllocation {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DynamicAllocation")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("gpu_address", &self.gpu_address)
            .finish()
    }
}

// Returns a page to the manager once the release queue drops it
struct StalePage {
    page: Option<DynamicPage>,
    page_released_tx: Sender<DynamicPage>,
}

impl Drop for StalePage {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            // The manager may already be gone during device teardown, the page is then simply dropped
            let _ = self.page_released_tx.send(page);
        }
    }
}

struct AvailablePages {
    // Multimap keyed by page size
    pages: BTreeMap<u64, Vec<DynamicPage>>,
    allocated_page_counter: usize,
    destroyed: bool,
}

impl AvailablePages {
    fn insert(
        &mut self,
        page: DynamicPage,
    ) {
        self.pages.entry(page.size()).or_default().push(page);
    }

    fn take_at_least(
        &mut self,
        size: u64,
    ) -> Option<DynamicPage> {
        let page_size = *self.pages.range(size..).next()?.0;
        let pages = self.pages.get_mut(&page_size)?;
        let page = pages.pop();
        if pages.is_empty() {
            self.pages.remove(&page_size);
        }
        page
    }

    fn total_size(&self) -> u64 {
        self.pages
            .iter()
            .map(|(size, pages)| size * pages.len() as u64)
            .sum()
    }

    fn page_count(&self) -> usize {
        self.pages.values().map(|pages| pages.len()).sum()
    }
}

/// Device-wide pool of upload pages, shared by all device contexts
pub struct DynamicMemoryManager {
    device: Arc<dyn NativeDevice>,
    command_queues: Arc<CommandQueues>,
    available_pages: Mutex<AvailablePages>,
    page_released_tx: Sender<DynamicPage>,
    page_released_rx: Receiver<DynamicPage>,
}

impl DynamicMemoryManager {
    pub fn new(
        device: Arc<dyn NativeDevice>,
        command_queues: Arc<CommandQueues>,
        num_pages_to_reserve: u32,
        page_size: u64,
    ) -> Self {
        let (page_released_tx, page_released_rx) = crossbeam_channel::unbounded();
        let mut available_pages = AvailablePages {
            pages: Default::default(),
            allocated_page_counter: 0,
            destroyed: false,
        };

        for _ in 0..num_pages_to_reserve {
            if let Some(page) = DynamicPage::new(&*device, page_size) {
                available_pages.insert(page);
            }
        }

        DynamicMemoryManager {
            device,
            command_queues,
            available_pages: Mutex::new(available_pages),
            page_released_tx,
            page_released_rx,
        }
    }

    // Move pages the GPU is done with back into the pool
    fn handle_released_pages(
        &self,
        available_pages: &mut AvailablePages,
    ) {
        for page in self.page_released_rx.try_iter() {
            available_pages.allocated_page_counter -= 1;
            available_pages.insert(page);
        }
    }

    /// Takes the smallest available page of at least `size_in_bytes`, creating a new one if there
    /// is none
    #[profiling::function]
    pub fn allocate_page(
        &self,
        size_in_bytes: u64,
    ) -> Option<DynamicPage> {
        let mut available_pages = self.available_pages.lock();
        self.handle_released_pages(&mut available_pages);

        let page = match available_pages.take_at_least(size_in_bytes) {
            Some(page) => Some(page),
            None => DynamicPage::new(&*self.device, size_in_bytes),
        };

        if page.is_some() {
            available_pages.allocated_page_counter += 1;
        }
        page
    }

    /// Returns pages to the pool once the queues in `queue_mask` are done with them
    pub fn release_pages(
        &self,
        pages: Vec<DynamicPage>,
        queue_mask: CommandQueueMask,
    ) {
        for page in pages {
            self.command_queues.safe_release_device_object(
                StalePage {
                    page: Some(page),
                    page_released_tx: self.page_released_tx.clone(),
                },
                queue_mask,
            );
        }
    }

    pub fn available_page_count(&self) -> usize {
        let mut available_pages = self.available_pages.lock();
        self.handle_released_pages(&mut available_pages);
        available_pages.page_count()
    }

    pub fn allocated_page_count(&self) -> usize {
        let mut available_pages = self.available_pages.lock();
        self.handle_released_pages(&mut available_pages);
        available_pages.allocated_page_counter
    }

    /// Releases every pooled page. All pages must have been returned.
    pub fn destroy(&self) {
        let mut available_pages = self.available_pages.lock();
        if available_pages.destroyed {
            return;
        }
        self.handle_released_pages(&mut available_pages);

        if available_pages.allocated_page_counter != 0 {
            log::error!(
                "{} page(s) have not been returned to the manager.",
                available_pages.allocated_page_counter
            );
        }

        log::info!(
            "Dynamic memory manager usage stats: Total allocated memory: {}",
            format_memory_size(available_pages.total_size(), 2)
        );
        available_pages.pages.clear();
        available_pages.destroyed = true;
    }
}

impl Drop for DynamicMemoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Per-context linear allocator over pages taken from the `DynamicMemoryManager`
pub struct DynamicHeap {
    global_dynamic_mem_mgr: Arc<DynamicMemoryManager>,
    heap_name: String,
    page_size: u64,
    allocated_pages: Vec<DynamicPage>,
    // None until the first page is taken
    curr_offset: Option<u64>,
    available_size: u64,
    curr_allocated_size: u64,
    curr_used_size: u64,
    curr_aligned_size: u64,
    peak_allocated_size: u64,
    peak_used_size: u64,
    peak_aligned_size: u64,
}

impl DynamicHeap {
    pub fn new(
        global_dynamic_mem_mgr: Arc<DynamicMemoryManager>,
        heap_name: String,
        page_size: u64,
    ) -> Self {
        DynamicHeap {
            global_dynamic_mem_mgr,
            heap_name,
            page_size,
            allocated_pages: Default::default(),
            curr_offset: None,
            available_size: 0,
            curr_allocated_size: 0,
            curr_used_size: 0,
            curr_aligned_size: 0,
            peak_allocated_size: 0,
            peak_used_size: 0,
            peak_aligned_size: 0,
        }
    }

    fn fits(
        &self,
        size_in_bytes: u64,
        alignment: u64,
    ) -> Option<(u64, u64)> {
        let curr_offset = self.curr_offset?;
        let aligned_offset = align_up_pow2_u64(curr_offset, alignment);
        let adjusted_size = size_in_bytes + (aligned_offset - curr_offset);
        if adjusted_size <= self.available_size {
            Some((aligned_offset, adjusted_size))
        } else {
            None
        }
    }

    /// Allocates `size_in_bytes` bytes aligned to `alignment` (a power of two). Requests larger than
    /// the page size get a page of the next power-of-two multiple of it. Returns a null allocation
    /// if no page could be obtained.
    pub fn allocate(
        &mut self,
        size_in_bytes: u64,
        alignment: u64,
        ctx_frame_number: u64,
    ) -> DynamicAllocation {
        assert!(
            alignment > 0 && alignment.is_power_of_two(),
            "Alignment ({}) must be power of 2",
            alignment
        );

        if self.fits(size_in_bytes, alignment).is_none() {
            let mut new_page_size = self.page_size;
            while new_page_size < size_in_bytes {
                new_page_size *= 2;
            }

            if let Some(new_page) = self.global_dynamic_mem_mgr.allocate_page(new_page_size) {
                self.curr_offset = Some(0);
                self.available_size = new_page.size();
                self.curr_allocated_size += self.available_size;
                self.peak_allocated_size = self.peak_allocated_size.max(self.curr_allocated_size);
                self.allocated_pages.push(new_page);
            }
        }

        let (aligned_offset, adjusted_size) = match self.fits(size_in_bytes, alignment) {
            Some(placement) => placement,
            None => {
                log::error!(
                    "{}: failed to allocate {} of dynamic memory",
                    self.heap_name,
                    format_memory_size(size_in_bytes, 2)
                );
                return DynamicAllocation::default();
            }
        };

        self.available_size -= adjusted_size;
        self.curr_offset = Some(aligned_offset + size_in_bytes);
        self.curr_used_size += size_in_bytes;
        self.peak_used_size = self.peak_used_size.max(self.curr_used_size);
        self.curr_aligned_size += adjusted_size;
        self.peak_aligned_size = self.peak_aligned_size.max(self.curr_aligned_size);

        match self.allocated_pages.last() {
            Some(page) => DynamicAllocation {
                buffer: Some(page.buffer().clone()),
                offset: aligned_offset,
                size: size_in_bytes,
                gpu_address: page.gpu_address(aligned_offset),
                ctx_frame_number,
            },
            None => DynamicAllocation::default(),
        }
    }

    /// Returns every page to the manager. The pages are reused once the queues in `queue_mask`
    /// are done with them.
    pub fn release_allocated_pages(
        &mut self,
        queue_mask: CommandQueueMask,
    ) {
        let pages = std::mem::take(&mut self.allocated_pages);
        self.global_dynamic_mem_mgr.release_pages(pages, queue_mask);
        self.curr_offset = None;
        self.available_size = 0;
        self.curr_allocated_size = 0;
        self.curr_used_size = 0;
        self.curr_aligned_size = 0;
    }

    pub fn allocated_pages_count(&self) -> usize {
        self.allocated_pages.len()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn peak_used_size(&self) -> u64 {
        self.peak_used_size
    }

    pub fn peak_aligned_size(&self) -> u64 {
        self.peak_aligned_size
    }

    pub fn peak_allocated_size(&self) -> u64 {
        self.peak_allocated_size
    }
}

impl Drop for DynamicHeap {
    fn drop(&mut self) {
        if !self.allocated_pages.is_empty() {
            log::error!(
                "Allocated pages have not been released which indicates finish_frame() has not been called"
            );
        }

        let peak_allocated_pages = self.peak_allocated_size / self.page_size.max(1);
        log::info!(
            "{} usage stats: Peak used/aligned/allocated size: {} / {} / {} ({} {}). Peak efficiency (used/aligned): {:.1}%. Peak utilization (used/allocated): {:.1}%",
            self.heap_name,
            format_memory_size(self.peak_used_size, 2),
            format_memory_size(self.peak_aligned_size, 2),
            format_memory_size(self.peak_allocated_size, 2),
            peak_allocated_pages,
            if peak_allocated_pages == 1 { "page" } else { "pages" },
            self.peak_used_size as f64 / self.peak_aligned_size.max(1) as f64 * 100.0,
            self.peak_used_size as f64 / self.peak_allocated_size.max(1) as f64 * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::{NullCommandQueue, NullDevice, NullResource};
    use crate::native::NativeCommandQueue;

    const PAGE_SIZE: u64 = 1024;

    fn create_manager(
        num_pages_to_reserve: u32
    ) -> (
        Arc<NullCommandQueue>,
        Arc<CommandQueues>,
        Arc<DynamicMemoryManager>,
    ) {
        let _ = env_logger::try_init();
        let device = NullDevice::new();
        let queue = device.create_command_queue();
        let command_queues = Arc::new(
            CommandQueues::new(vec![queue.clone() as Arc<dyn NativeCommandQueue>]).unwrap(),
        );
        let manager = Arc::new(DynamicMemoryManager::new(
            Arc::new(device),
            command_queues.clone(),
            num_pages_to_reserve,
            PAGE_SIZE,
        ));
        (queue, command_queues, manager)
    }

    #[test]
    fn test_linear_allocation() {
        let (_queue, command_queues, manager) = create_manager(1);
        let mut heap = DynamicHeap::new(manager.clone(), "Test heap".to_string(), PAGE_SIZE);

        let a = heap.allocate(10, 1, 0);
        let b = heap.allocate(16, 16, 0);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 16);
        assert_eq!(b.gpu_address(), a.gpu_address() + 16);
        assert_eq!(heap.allocated_pages_count(), 1);
        assert_eq!(heap.peak_used_size(), 26);
        assert_eq!(heap.peak_aligned_size(), 32);
        assert_eq!(manager.available_page_count(), 0);

        heap.release_allocated_pages(1);
        command_queues.idle_gpu();
        assert_eq!(manager.available_page_count(), 1);
        assert_eq!(manager.allocated_page_count(), 0);
    }

    #[test]
    fn test_large_allocation_grows_page() {
        let (_queue, command_queues, manager) = create_manager(0);
        let mut heap = DynamicHeap::new(manager.clone(), "Test heap".to_string(), PAGE_SIZE);

        let big = heap.allocate(3000, 16, 0);
        assert!(!big.is_null());
        assert_eq!(big.buffer().unwrap().size_in_bytes(), 4096);

        // The grown page is used until exhausted
        let small = heap.allocate(512, 16, 0);
        assert_eq!(heap.allocated_pages_count(), 1);
        assert_eq!(small.offset(), 3008);
        let overflow = heap.allocate(1024, 16, 0);
        assert_eq!(heap.allocated_pages_count(), 2);
        assert_eq!(overflow.offset(), 0);

        heap.release_allocated_pages(1);
        command_queues.idle_gpu();
        assert_eq!(manager.available_page_count(), 2);

        // Best fit: the 1 KB page serves a small request, the 4 KB page a large one
        let page = manager.allocate_page(100).unwrap();
        assert_eq!(page.size(), PAGE_SIZE);
        let page_2 = manager.allocate_page(2000).unwrap();
        assert_eq!(page_2.size(), 4096);
        manager.release_pages(vec![page, page_2], 1);
        command_queues.idle_gpu();
    }

    #[test]
    fn test_pages_wait_for_gpu() {
        let (queue, command_queues, manager) = create_manager(1);
        queue.set_auto_complete(false);
        let mut heap = DynamicHeap::new(manager.clone(), "Test heap".to_string(), PAGE_SIZE);
        heap.allocate(64, 4, 0);
        heap.release_allocated_pages(1);

        // Submission moves the page to the release list but the GPU has not finished
        let fence_value = command_queues.native_queue(0).signal();
        command_queues
            .release_queue(0)
            .discard_stale_resources(0, fence_value);
        command_queues.purge_release_queues(false);
        assert_eq!(manager.available_page_count(), 0);

        // A second heap has to create a new page
        let mut heap_2 = DynamicHeap::new(manager.clone(), "Test heap 2".to_string(), PAGE_SIZE);
        heap_2.allocate(64, 4, 0);
        assert_eq!(manager.allocated_page_count(), 2);
        heap_2.release_allocated_pages(1);

        queue.set_auto_complete(true);
        command_queues.idle_gpu();
        assert_eq!(manager.available_page_count(), 2);
    }

    #[test]
    fn test_write_goes_to_page_memory() {
        let (_queue, command_queues, manager) = create_manager(1);
        let mut heap = DynamicHeap::new(manager.clone(), "Test heap".to_string(), PAGE_SIZE);
        heap.allocate(3, 1, 0);
        let allocation = heap.allocate(4, 4, 0);
        allocation.write(&[1, 2, 3, 4]);

        let resource = (**allocation.buffer().unwrap())
            .as_any()
            .downcast_ref::<NullResource>()
            .unwrap();
        assert_eq!(resource.read_bytes(4, 4).unwrap(), vec![1, 2, 3, 4]);

        heap.release_allocated_pages(1);
        command_queues.idle_gpu();
    }
}
