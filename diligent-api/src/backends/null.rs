//! In-process device that never touches a GPU. Descriptor heaps, resources and fences are emulated
//! on the CPU, and every command recorded on any command list is appended to a device-wide log so
//! the command streams produced by the engine can be inspected.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::native::*;
use crate::*;

const NULL_CPU_HANDLE_BASE: usize = 0x1_0000;
const NULL_GPU_HANDLE_BASE: u64 = 0x10_0000_0000;
const NULL_GPU_ADDRESS_BASE: u64 = 0x1_0000_0000;
// Keeps handle ranges of different heaps apart
const NULL_HEAP_GUARD_SIZE: usize = 0x1_0000;

/// Resource alignment of the emulated GPU address space
pub const NULL_RESOURCE_ALIGNMENT: u64 = 0x1_0000;

/// What a descriptor slot holds
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NullDescriptor {
    View {
        resource_id: u64,
        view_kind: ViewKind,
    },
    ConstantBufferAddress {
        gpu_address: GpuVirtualAddress,
        size_in_bytes: u64,
    },
    Sampler {
        sampler_id: u64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum NullBarrier {
    Transition {
        resource_id: u64,
        subresource: u32,
        state_before: NativeResourceStates,
        state_after: NativeResourceStates,
        flags: ResourceBarrierFlags,
    },
    Aliasing {
        resource_before: Option<u64>,
        resource_after: Option<u64>,
    },
    Uav {
        resource_id: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum NullCommand {
    ResourceBarriers(Vec<NullBarrier>),
    SetDescriptorHeaps(Vec<u64>),
    SetPipelineState(u64),
    SetGraphicsRootSignature(u64),
    SetComputeRootSignature(u64),
    SetGraphicsRootDescriptorTable {
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    },
    SetComputeRootDescriptorTable {
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ExecuteIndirect {
        pipeline_type: PipelineType,
        argument_buffer: u64,
        argument_offset: u64,
    },
    CopyBufferRegion {
        dst: u64,
        dst_offset: u64,
        src: u64,
        src_offset: u64,
        num_bytes: u64,
    },
    CopyResource {
        dst: u64,
        src: u64,
    },
    ClearRenderTargetView(CpuDescriptorHandle),
    ClearDepthStencilView(CpuDescriptorHandle),
    ClearUnorderedAccessView(u64),
    ResolveSubresource {
        dst: u64,
        src: u64,
    },
}

struct NullDeviceShared {
    next_object_id: AtomicU64,
    next_cpu_handle: AtomicUsize,
    next_gpu_handle: AtomicU64,
    next_gpu_address: AtomicU64,
    descriptors: Mutex<FnvHashMap<usize, NullDescriptor>>,
    commands: Mutex<Vec<NullCommand>>,
    resource_count: AtomicUsize,
    descriptor_heap_count: AtomicUsize,
}

impl NullDeviceShared {
    fn next_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(
        &self,
        command: NullCommand,
    ) {
        log::trace!("Null command: {:?}", command);
        self.commands.lock().push(command);
    }
}

/// Emulated device. Clones share the same device.
#[derive(Clone)]
pub struct NullDevice {
    shared: Arc<NullDeviceShared>,
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NullDevice {
    pub fn new() -> Self {
        NullDevice {
            shared: Arc::new(NullDeviceShared {
                next_object_id: AtomicU64::new(1),
                next_cpu_handle: AtomicUsize::new(NULL_CPU_HANDLE_BASE),
                next_gpu_handle: AtomicU64::new(NULL_GPU_HANDLE_BASE),
                next_gpu_address: AtomicU64::new(NULL_GPU_ADDRESS_BASE),
                descriptors: Default::default(),
                commands: Default::default(),
                resource_count: AtomicUsize::new(0),
                descriptor_heap_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn create_command_queue(&self) -> Arc<NullCommandQueue> {
        Arc::new(NullCommandQueue {
            next_fence_value: AtomicU64::new(1),
            completed_fence_value: AtomicU64::new(0),
            auto_complete: AtomicBool::new(true),
            submitted_command_lists: AtomicUsize::new(0),
        })
    }

    /// Every command recorded so far, in recording order
    pub fn recorded_commands(&self) -> Vec<NullCommand> {
        self.shared.commands.lock().clone()
    }

    pub fn take_recorded_commands(&self) -> Vec<NullCommand> {
        std::mem::take(&mut *self.shared.commands.lock())
    }

    pub fn descriptor(
        &self,
        handle: CpuDescriptorHandle,
    ) -> Option<NullDescriptor> {
        self.shared.descriptors.lock().get(&handle.ptr).copied()
    }

    /// Number of native resources created so far
    pub fn resource_count(&self) -> usize {
        self.shared.resource_count.load(Ordering::Relaxed)
    }

    pub fn descriptor_heap_count(&self) -> usize {
        self.shared.descriptor_heap_count.load(Ordering::Relaxed)
    }
}

pub fn null_resource_id(resource: &dyn NativeResource) -> u64 {
    match resource.as_any().downcast_ref::<NullResource>() {
        Some(resource) => resource.id,
        None => 0,
    }
}

fn null_heap_id(heap: &dyn NativeDescriptorHeap) -> u64 {
    match heap.as_any().downcast_ref::<NullDescriptorHeap>() {
        Some(heap) => heap.id,
        None => 0,
    }
}

impl NativeDevice for NullDevice {
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> DiligentResult<Arc<dyn NativeDescriptorHeap>> {
        if desc.shader_visible && !desc.heap_type.can_be_shader_visible() {
            return Err(DiligentError::NativeError(format!(
                "{} heaps cannot be shader visible",
                desc.heap_type.literal_name()
            )));
        }

        let increment = self.descriptor_handle_increment_size(desc.heap_type) as usize;
        let heap_size = desc.num_descriptors as usize * increment + NULL_HEAP_GUARD_SIZE;
        let cpu_start = self
            .shared
            .next_cpu_handle
            .fetch_add(heap_size, Ordering::Relaxed);
        let gpu_start = if desc.shader_visible {
            self.shared
                .next_gpu_handle
                .fetch_add(heap_size as u64, Ordering::Relaxed)
        } else {
            0
        };

        self.shared
            .descriptor_heap_count
            .fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new(NullDescriptorHeap {
            id: self.shared.next_id(),
            desc: *desc,
            cpu_start: CpuDescriptorHandle { ptr: cpu_start },
            gpu_start: GpuDescriptorHandle { ptr: gpu_start },
        }))
    }

    fn descriptor_handle_increment_size(
        &self,
        heap_type: DescriptorHeapType,
    ) -> u32 {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => 32,
            DescriptorHeapType::Sampler => 32,
            DescriptorHeapType::Rtv => 32,
            DescriptorHeapType::Dsv => 8,
        }
    }

    fn copy_descriptors_simple(
        &self,
        num_descriptors: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        heap_type: DescriptorHeapType,
    ) {
        let increment = self.descriptor_handle_increment_size(heap_type);
        let mut descriptors = self.shared.descriptors.lock();
        for i in 0..num_descriptors {
            let src = src.offset(i, increment);
            let dst = dst.offset(i, increment);
            match descriptors.get(&src.ptr).copied() {
                Some(descriptor) => {
                    descriptors.insert(dst.ptr, descriptor);
                }
                None => {
                    descriptors.remove(&dst.ptr);
                }
            }
        }
    }

    fn create_committed_resource(
        &self,
        desc: &NativeResourceDesc,
    ) -> DiligentResult<Arc<dyn NativeResource>> {
        let size_in_bytes = match desc.kind {
            NativeResourceKind::Buffer { size_in_bytes } => size_in_bytes,
            NativeResourceKind::Texture2D {
                width,
                height,
                array_size,
                ..
            } => width as u64 * height as u64 * array_size as u64 * 4,
        };

        let memory = if desc.heap_type != NativeHeapType::Default {
            if let NativeResourceKind::Texture2D { .. } = desc.kind {
                return Err(DiligentError::NativeError(
                    "Textures can only be created in the default heap".to_string(),
                ));
            }
            Some(UnsafeCell::new(vec![0u8; size_in_bytes as usize].into_boxed_slice()))
        } else {
            None
        };

        let reserved_size = diligent_base::memory::round_size_up_to_alignment_u64(
            size_in_bytes.max(1),
            NULL_RESOURCE_ALIGNMENT,
        );
        let gpu_virtual_address = self
            .shared
            .next_gpu_address
            .fetch_add(reserved_size, Ordering::Relaxed);

        self.shared.resource_count.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new(NullResource {
            id: self.shared.next_id(),
            desc: desc.clone(),
            gpu_virtual_address,
            memory,
        }))
    }

    fn create_view(
        &self,
        resource: &dyn NativeResource,
        view_kind: ViewKind,
        dest: CpuDescriptorHandle,
    ) {
        self.shared.descriptors.lock().insert(
            dest.ptr,
            NullDescriptor::View {
                resource_id: null_resource_id(resource),
                view_kind,
            },
        );
    }

    fn create_constant_buffer_view(
        &self,
        gpu_address: GpuVirtualAddress,
        size_in_bytes: u64,
        dest: CpuDescriptorHandle,
    ) {
        self.shared.descriptors.lock().insert(
            dest.ptr,
            NullDescriptor::ConstantBufferAddress {
                gpu_address,
                size_in_bytes,
            },
        );
    }

    fn create_sampler(
        &self,
        dest: CpuDescriptorHandle,
    ) {
        let sampler_id = self.shared.next_id();
        self.shared
            .descriptors
            .lock()
            .insert(dest.ptr, NullDescriptor::Sampler { sampler_id });
    }

    fn create_root_signature(
        &self,
        num_root_parameters: u32,
    ) -> DiligentResult<Arc<dyn NativeRootSignature>> {
        Ok(Arc::new(NullRootSignature {
            id: self.shared.next_id(),
            num_root_parameters,
        }))
    }

    fn create_pipeline_state(
        &self,
        name: &str,
        pipeline_type: PipelineType,
        root_signature: &Arc<dyn NativeRootSignature>,
    ) -> DiligentResult<Arc<dyn NativePipelineState>> {
        Ok(Arc::new(NullPipelineState {
            id: self.shared.next_id(),
            name: name.to_string(),
            pipeline_type,
            root_signature: root_signature.clone(),
        }))
    }

    fn create_command_list(&self) -> DiligentResult<Box<dyn NativeCommandList>> {
        Ok(Box::new(NullCommandList {
            shared: self.shared.clone(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct NullDescriptorHeap {
    pub id: u64,
    desc: DescriptorHeapDesc,
    cpu_start: CpuDescriptorHandle,
    gpu_start: GpuDescriptorHandle,
}

impl NativeDescriptorHeap for NullDescriptorHeap {
    fn desc(&self) -> &DescriptorHeapDesc {
        &self.desc
    }

    fn cpu_descriptor_handle_for_heap_start(&self) -> CpuDescriptorHandle {
        self.cpu_start
    }

    fn gpu_descriptor_handle_for_heap_start(&self) -> GpuDescriptorHandle {
        self.gpu_start
    }
}

pub struct NullResource {
    pub id: u64,
    desc: NativeResourceDesc,
    gpu_virtual_address: GpuVirtualAddress,
    memory: Option<UnsafeCell<Box<[u8]>>>,
}

// SAFETY: mapped memory is written through the pointer returned by cpu_address, and the engine
// hands each byte range to a single writer at a time
unsafe impl Sync for NullResource {}

impl NullResource {
    /// Copies bytes out of upload or readback memory
    pub fn read_bytes(
        &self,
        offset: usize,
        len: usize,
    ) -> Option<Vec<u8>> {
        let memory = self.memory.as_ref()?;
        let memory = unsafe { &*memory.get() };
        memory.get(offset..offset + len).map(|bytes| bytes.to_vec())
    }
}

impl std::fmt::Debug for NullResource {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NullResource")
            .field("id", &self.id)
            .field("name", &self.desc.name)
            .field("gpu_virtual_address", &self.gpu_virtual_address)
            .finish()
    }
}

impl NativeResource for NullResource {
    fn desc(&self) -> &NativeResourceDesc {
        &self.desc
    }

    fn gpu_virtual_address(&self) -> GpuVirtualAddress {
        self.gpu_virtual_address
    }

    fn cpu_address(&self) -> Option<NonNull<u8>> {
        let memory = self.memory.as_ref()?;
        // SAFETY: only a pointer is created here, writes go through it
        unsafe { NonNull::new((*memory.get()).as_mut_ptr()) }
    }
}

#[derive(Debug)]
pub struct NullRootSignature {
    pub id: u64,
    pub num_root_parameters: u32,
}

impl NativeRootSignature for NullRootSignature {}

#[derive(Debug)]
pub struct NullPipelineState {
    pub id: u64,
    pub name: String,
    pub pipeline_type: PipelineType,
    pub root_signature: Arc<dyn NativeRootSignature>,
}

impl NativePipelineState for NullPipelineState {}

pub struct NullCommandList {
    shared: Arc<NullDeviceShared>,
    closed: bool,
}

impl NullCommandList {
    fn record(
        &self,
        command: NullCommand,
    ) {
        assert!(!self.closed, "Recording into a closed command list");
        self.shared.record(command);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn null_barrier(barrier: &ResourceBarrier) -> NullBarrier {
    match barrier {
        ResourceBarrier::Transition {
            resource,
            subresource,
            state_before,
            state_after,
            flags,
        } => NullBarrier::Transition {
            resource_id: null_resource_id(&**resource),
            subresource: *subresource,
            state_before: *state_before,
            state_after: *state_after,
            flags: *flags,
        },
        ResourceBarrier::Aliasing {
            resource_before,
            resource_after,
        } => NullBarrier::Aliasing {
            resource_before: resource_before.as_ref().map(|r| null_resource_id(&**r)),
            resource_after: resource_after.as_ref().map(|r| null_resource_id(&**r)),
        },
        ResourceBarrier::Uav { resource } => NullBarrier::Uav {
            resource_id: resource.as_ref().map(|r| null_resource_id(&**r)),
        },
    }
}

impl NativeCommandList for NullCommandList {
    fn resource_barrier(
        &mut self,
        barriers: &[ResourceBarrier],
    ) {
        self.record(NullCommand::ResourceBarriers(
            barriers.iter().map(null_barrier).collect(),
        ));
    }

    fn set_descriptor_heaps(
        &mut self,
        heaps: &[Arc<dyn NativeDescriptorHeap>],
    ) {
        self.record(NullCommand::SetDescriptorHeaps(
            heaps.iter().map(|heap| null_heap_id(&**heap)).collect(),
        ));
    }

    fn set_pipeline_state(
        &mut self,
        pipeline_state: &Arc<dyn NativePipelineState>,
    ) {
        let id = (**pipeline_state)
            .as_any()
            .downcast_ref::<NullPipelineState>()
            .map(|pso| pso.id)
            .unwrap_or(0);
        self.record(NullCommand::SetPipelineState(id));
    }

    fn set_graphics_root_signature(
        &mut self,
        root_signature: &Arc<dyn NativeRootSignature>,
    ) {
        let id = null_root_signature_id(&**root_signature);
        self.record(NullCommand::SetGraphicsRootSignature(id));
    }

    fn set_compute_root_signature(
        &mut self,
        root_signature: &Arc<dyn NativeRootSignature>,
    ) {
        let id = null_root_signature_id(&**root_signature);
        self.record(NullCommand::SetComputeRootSignature(id));
    }

    fn set_graphics_root_descriptor_table(
        &mut self,
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    ) {
        self.record(NullCommand::SetGraphicsRootDescriptorTable {
            root_index,
            base_descriptor,
        });
    }

    fn set_compute_root_descriptor_table(
        &mut self,
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    ) {
        self.record(NullCommand::SetComputeRootDescriptorTable {
            root_index,
            base_descriptor,
        });
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.record(NullCommand::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.record(NullCommand::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    fn dispatch(
        &mut self,
        thread_group_count_x: u32,
        thread_group_count_y: u32,
        thread_group_count_z: u32,
    ) {
        self.record(NullCommand::Dispatch {
            x: thread_group_count_x,
            y: thread_group_count_y,
            z: thread_group_count_z,
        });
    }

    fn execute_indirect(
        &mut self,
        pipeline_type: PipelineType,
        argument_buffer: &Arc<dyn NativeResource>,
        argument_offset: u64,
    ) {
        self.record(NullCommand::ExecuteIndirect {
            pipeline_type,
            argument_buffer: null_resource_id(&**argument_buffer),
            argument_offset,
        });
    }

    fn copy_buffer_region(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        dst_offset: u64,
        src: &Arc<dyn NativeResource>,
        src_offset: u64,
        num_bytes: u64,
    ) {
        self.record(NullCommand::CopyBufferRegion {
            dst: null_resource_id(&**dst),
            dst_offset,
            src: null_resource_id(&**src),
            src_offset,
            num_bytes,
        });
    }

    fn copy_resource(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        src: &Arc<dyn NativeResource>,
    ) {
        self.record(NullCommand::CopyResource {
            dst: null_resource_id(&**dst),
            src: null_resource_id(&**src),
        });
    }

    fn clear_render_target_view(
        &mut self,
        rtv: CpuDescriptorHandle,
        _color: [f32; 4],
    ) {
        self.record(NullCommand::ClearRenderTargetView(rtv));
    }

    fn clear_depth_stencil_view(
        &mut self,
        dsv: CpuDescriptorHandle,
        _depth: f32,
        _stencil: u8,
    ) {
        self.record(NullCommand::ClearDepthStencilView(dsv));
    }

    fn clear_unordered_access_view_float(
        &mut self,
        _gpu_handle: GpuDescriptorHandle,
        _cpu_handle: CpuDescriptorHandle,
        resource: &Arc<dyn NativeResource>,
        _values: [f32; 4],
    ) {
        self.record(NullCommand::ClearUnorderedAccessView(null_resource_id(
            &**resource,
        )));
    }

    fn resolve_subresource(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        _dst_subresource: u32,
        src: &Arc<dyn NativeResource>,
        _src_subresource: u32,
    ) {
        self.record(NullCommand::ResolveSubresource {
            dst: null_resource_id(&**dst),
            src: null_resource_id(&**src),
        });
    }

    fn close(&mut self) -> DiligentResult<()> {
        if self.closed {
            return Err(DiligentError::NativeError(
                "Command list is already closed".to_string(),
            ));
        }
        self.closed = true;
        Ok(())
    }
}

fn null_root_signature_id(root_signature: &dyn NativeRootSignature) -> u64 {
    root_signature
        .as_any()
        .downcast_ref::<NullRootSignature>()
        .map(|root_signature| root_signature.id)
        .unwrap_or(0)
}

/// Emulated queue. By default the "GPU" finishes work as soon as it is submitted. Tests that need
/// work in flight turn that off and complete fences by hand.
pub struct NullCommandQueue {
    next_fence_value: AtomicU64,
    completed_fence_value: AtomicU64,
    auto_complete: AtomicBool,
    submitted_command_lists: AtomicUsize,
}

impl NullCommandQueue {
    pub fn set_auto_complete(
        &self,
        auto_complete: bool,
    ) {
        self.auto_complete.store(auto_complete, Ordering::Release);
        if auto_complete {
            self.complete_fence(self.next_fence_value.load(Ordering::Acquire) - 1);
        }
    }

    /// Marks all work up to `fence_value` as finished
    pub fn complete_fence(
        &self,
        fence_value: u64,
    ) {
        self.completed_fence_value
            .fetch_max(fence_value, Ordering::AcqRel);
    }

    pub fn submitted_command_list_count(&self) -> usize {
        self.submitted_command_lists.load(Ordering::Relaxed)
    }

    fn signal_next(&self) -> u64 {
        let fence_value = self.next_fence_value.fetch_add(1, Ordering::AcqRel);
        if self.auto_complete.load(Ordering::Acquire) {
            self.complete_fence(fence_value);
        }
        fence_value
    }
}

impl NativeCommandQueue for NullCommandQueue {
    fn submit(
        &self,
        command_list: Box<dyn NativeCommandList>,
    ) -> DiligentResult<u64> {
        if let Some(command_list) = (*command_list).as_any().downcast_ref::<NullCommandList>() {
            if !command_list.is_closed() {
                return Err(DiligentError::NativeError(
                    "Command list must be closed before submission".to_string(),
                ));
            }
        }

        self.submitted_command_lists.fetch_add(1, Ordering::Relaxed);
        Ok(self.signal_next())
    }

    fn signal(&self) -> u64 {
        self.signal_next()
    }

    fn next_fence_value(&self) -> u64 {
        self.next_fence_value.load(Ordering::Acquire)
    }

    fn completed_fence_value(&self) -> u64 {
        self.completed_fence_value.load(Ordering::Acquire)
    }
}
