use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use diligent_base::{MakeNewRcObj, RefCntAutoPtr};

use crate::command_queues::{CommandQueues, MAX_COMMAND_QUEUES};
use crate::descriptor_heap::{CpuDescriptorHeap, GpuDescriptorHeap};
use crate::device_context::DeviceContext;
use crate::dynamic_heap::DynamicMemoryManager;
use crate::native::{NativeCommandQueue, NativeDevice};
use crate::pipeline_state::{PipelineState, PipelineStateDesc};
use crate::*;

struct RenderDeviceInner {
    native_device: Arc<dyn NativeDevice>,
    command_queues: Arc<CommandQueues>,
    create_info: EngineD3D12CreateInfo,
    cpu_descriptor_heaps: [CpuDescriptorHeap; DescriptorHeapType::COUNT],
    gpu_descriptor_heaps: [GpuDescriptorHeap; 2],
    dynamic_memory_manager: Arc<DynamicMemoryManager>,
    next_context_id: AtomicUsize,
}

impl Drop for RenderDeviceInner {
    fn drop(&mut self) {
        log::trace!("Destroying render device");
        self.command_queues.idle_gpu();
        self.dynamic_memory_manager.destroy();
    }
}

/// A cloneable, thread-safe handle used to create device objects and device contexts. Owns the
/// device-wide descriptor heaps, the dynamic memory pool and the command queues.
///
/// Device objects and contexts keep the device alive. When the last handle goes away the device
/// waits for the GPU to go idle.
#[derive(Clone)]
pub struct RenderDevice {
    inner: Arc<RenderDeviceInner>,
}

impl std::fmt::Debug for RenderDevice {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RenderDevice")
            .field(
                "command_queue_count",
                &self.inner.command_queues.command_queue_count(),
            )
            .field("create_info", &self.inner.create_info)
            .finish()
    }
}

impl RenderDevice {
    pub fn new(
        native_device: Arc<dyn NativeDevice>,
        native_queues: Vec<Arc<dyn NativeCommandQueue>>,
        create_info: &EngineD3D12CreateInfo,
    ) -> DiligentResult<Self> {
        if native_queues.len() != create_info.num_command_queues as usize {
            return Err(DiligentError::validation(format!(
                "{} native command queues were provided, but num_command_queues is {}",
                native_queues.len(),
                create_info.num_command_queues
            )));
        }
        if native_queues.len() > MAX_COMMAND_QUEUES {
            return Err(DiligentError::validation(format!(
                "At most {} command queues are supported",
                MAX_COMMAND_QUEUES
            )));
        }

        let command_queues = Arc::new(CommandQueues::new(native_queues)?);

        let cpu_heap = |heap_type: DescriptorHeapType| {
            CpuDescriptorHeap::new(
                native_device.clone(),
                command_queues.clone(),
                create_info.cpu_descriptor_heap_allocation_size[heap_type as usize],
                heap_type,
            )
        };
        let cpu_descriptor_heaps = [
            cpu_heap(DescriptorHeapType::CbvSrvUav)?,
            cpu_heap(DescriptorHeapType::Sampler)?,
            cpu_heap(DescriptorHeapType::Rtv)?,
            cpu_heap(DescriptorHeapType::Dsv)?,
        ];

        let gpu_heap = |heap_type: DescriptorHeapType| {
            let index = heap_type as usize;
            GpuDescriptorHeap::new(
                &*native_device,
                command_queues.clone(),
                create_info.gpu_descriptor_heap_size[index],
                create_info.gpu_descriptor_heap_dynamic_size[index],
                heap_type,
            )
        };
        let gpu_descriptor_heaps = [
            gpu_heap(DescriptorHeapType::CbvSrvUav)?,
            gpu_heap(DescriptorHeapType::Sampler)?,
        ];

        let dynamic_memory_manager = Arc::new(DynamicMemoryManager::new(
            native_device.clone(),
            command_queues.clone(),
            create_info.num_dynamic_heap_pages_to_reserve,
            create_info.dynamic_heap_page_size,
        ));

        log::info!(
            "Created render device with {} command queue(s) and {} deferred context(s)",
            command_queues.command_queue_count(),
            create_info.num_deferred_contexts
        );

        Ok(RenderDevice {
            inner: Arc::new(RenderDeviceInner {
                native_device,
                command_queues,
                create_info: create_info.clone(),
                cpu_descriptor_heaps,
                gpu_descriptor_heaps,
                dynamic_memory_manager,
                next_context_id: AtomicUsize::new(0),
            }),
        })
    }

    pub fn native_device(&self) -> &Arc<dyn NativeDevice> {
        &self.inner.native_device
    }

    pub fn command_queues(&self) -> &Arc<CommandQueues> {
        &self.inner.command_queues
    }

    pub fn create_info(&self) -> &EngineD3D12CreateInfo {
        &self.inner.create_info
    }

    /// One immediate context plus the deferred ones
    pub fn num_device_contexts(&self) -> usize {
        1 + self.inner.create_info.num_deferred_contexts as usize
    }

    pub fn cpu_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
    ) -> &CpuDescriptorHeap {
        &self.inner.cpu_descriptor_heaps[heap_type as usize]
    }

    /// Shader-visible heap. Only CBV_SRV_UAV and sampler heaps exist.
    pub fn gpu_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
    ) -> &GpuDescriptorHeap {
        match heap_type {
            DescriptorHeapType::Sampler => &self.inner.gpu_descriptor_heaps[1],
            DescriptorHeapType::CbvSrvUav => &self.inner.gpu_descriptor_heaps[0],
            _ => panic!(
                "{} heaps can't be shader visible",
                heap_type.literal_name()
            ),
        }
    }

    pub fn dynamic_memory_manager(&self) -> &Arc<DynamicMemoryManager> {
        &self.inner.dynamic_memory_manager
    }

    pub fn create_buffer(
        &self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> DiligentResult<RefCntAutoPtr<Buffer>> {
        MakeNewRcObj::new()
            .build(|_counters, _weak_self| Buffer::new(self.clone(), desc, initial_data))
    }

    pub fn create_texture(
        &self,
        desc: &TextureDesc,
    ) -> DiligentResult<RefCntAutoPtr<Texture>> {
        MakeNewRcObj::new()
            .build(|_counters, _weak_self| Texture::new(self.clone(), desc))
    }

    pub fn create_sampler(
        &self,
        desc: &SamplerDesc,
    ) -> DiligentResult<RefCntAutoPtr<Sampler>> {
        MakeNewRcObj::new()
            .build(|_counters, _weak_self| Sampler::new(self, desc))
    }

    pub fn create_pipeline_state(
        &self,
        desc: &PipelineStateDesc,
    ) -> DiligentResult<RefCntAutoPtr<PipelineState>> {
        MakeNewRcObj::new()
            .build(|_counters, weak_self| PipelineState::new(self.clone(), desc, weak_self))
    }

    /// Creates the next device context. The first one is the immediate context, every further one
    /// uses up one of the `num_deferred_contexts` slots. Commands are submitted to the queue with
    /// index `queue_index`.
    pub fn create_device_context(
        &self,
        queue_index: usize,
    ) -> DiligentResult<DeviceContext> {
        if queue_index >= self.inner.command_queues.command_queue_count() {
            return Err(DiligentError::validation(format!(
                "Command queue index {} is out of range",
                queue_index
            )));
        }

        let context_id = self.inner.next_context_id.fetch_add(1, Ordering::Relaxed);
        if context_id >= self.num_device_contexts() {
            self.inner.next_context_id.fetch_sub(1, Ordering::Relaxed);
            return Err(DiligentError::validation(format!(
                "All {} device contexts have already been created",
                self.num_device_contexts()
            )));
        }

        DeviceContext::new(self.clone(), context_id, queue_index)
    }

    /// Releases `object` once every queue in `queue_mask` has finished the work submitted so far
    pub fn safe_release_device_object<T: Send + 'static>(
        &self,
        object: T,
        queue_mask: CommandQueueMask,
    ) {
        self.inner
            .command_queues
            .safe_release_device_object(object, queue_mask);
    }

    pub fn purge_release_queues(
        &self,
        force_release: bool,
    ) {
        self.inner
            .command_queues
            .purge_release_queues(force_release);
    }

    /// Waits until all queues are idle and releases every stale object
    pub fn idle_gpu(&self) {
        self.inner.command_queues.idle_gpu();
    }
}

/// Render device on the null backend, with one native queue per `num_command_queues`
#[cfg(test)]
pub(crate) fn create_null_render_device(
    create_info: &EngineD3D12CreateInfo
) -> (
    crate::backends::null::NullDevice,
    Vec<Arc<crate::backends::null::NullCommandQueue>>,
    RenderDevice,
) {
    let null_device = crate::backends::null::NullDevice::new();
    let null_queues: Vec<_> = (0..create_info.num_command_queues)
        .map(|_| null_device.create_command_queue())
        .collect();
    let native_queues = null_queues
        .iter()
        .map(|queue| queue.clone() as Arc<dyn NativeCommandQueue>)
        .collect();
    let device = RenderDevice::new(Arc::new(null_device.clone()), native_queues, create_info)
        .unwrap();
    (null_device, null_queues, device)
}
