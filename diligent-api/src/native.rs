//! The native graphics device as seen by the engine core. A backend implements these traits. The
//! core only records through them and never inspects native objects beyond what is exposed here.

use std::ptr::NonNull;
use std::sync::Arc;

use diligent_base::ref_counting::AsAny;

use crate::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, DiligentResult,
    GpuDescriptorHandle, GpuVirtualAddress, NativeResourceStates, PipelineType,
};

/// Barrier that applies to every subresource of a resource
pub const ALL_SUBRESOURCES: u32 = 0xffff_ffff;

bitflags::bitflags! {
    /// Split-barrier flags of a transition barrier
    #[derive(Default)]
    pub struct ResourceBarrierFlags: u32 {
        const NONE = 0;
        const BEGIN_ONLY = 0x1;
        const END_ONLY = 0x2;
    }
}

#[derive(Clone, Debug)]
pub enum ResourceBarrier {
    Transition {
        resource: Arc<dyn NativeResource>,
        subresource: u32,
        state_before: NativeResourceStates,
        state_after: NativeResourceStates,
        flags: ResourceBarrierFlags,
    },
    Aliasing {
        resource_before: Option<Arc<dyn NativeResource>>,
        resource_after: Option<Arc<dyn NativeResource>>,
    },
    /// Orders unordered-access reads and writes. `None` stands for every UAV access.
    Uav {
        resource: Option<Arc<dyn NativeResource>>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NativeHeapType {
    /// GPU-local memory
    Default,
    /// CPU-writable, GPU-readable memory. Resources in this heap stay persistently mapped.
    Upload,
    Readback,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NativeResourceKind {
    Buffer {
        size_in_bytes: u64,
    },
    Texture2D {
        width: u32,
        height: u32,
        array_size: u32,
        mip_levels: u32,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct NativeResourceDesc {
    pub name: String,
    pub kind: NativeResourceKind,
    pub heap_type: NativeHeapType,
    pub initial_state: NativeResourceStates,
}

/// What a descriptor created with `NativeDevice::create_view` describes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthStencil,
}

pub trait NativeResource: AsAny + Send + Sync + std::fmt::Debug {
    fn desc(&self) -> &NativeResourceDesc;

    fn gpu_virtual_address(&self) -> GpuVirtualAddress;

    /// Persistently mapped CPU address. Only upload and readback resources have one.
    fn cpu_address(&self) -> Option<NonNull<u8>>;

    fn size_in_bytes(&self) -> u64 {
        match self.desc().kind {
            NativeResourceKind::Buffer { size_in_bytes } => size_in_bytes,
            NativeResourceKind::Texture2D { .. } => 0,
        }
    }
}

pub trait NativeDescriptorHeap: AsAny + Send + Sync + std::fmt::Debug {
    fn desc(&self) -> &DescriptorHeapDesc;

    fn cpu_descriptor_handle_for_heap_start(&self) -> CpuDescriptorHandle;

    /// Null for heaps that are not shader visible
    fn gpu_descriptor_handle_for_heap_start(&self) -> GpuDescriptorHandle;
}

pub trait NativeRootSignature: AsAny + Send + Sync + std::fmt::Debug {}

pub trait NativePipelineState: AsAny + Send + Sync + std::fmt::Debug {}

pub trait NativeCommandList: AsAny + Send {
    fn resource_barrier(
        &mut self,
        barriers: &[ResourceBarrier],
    );

    fn set_descriptor_heaps(
        &mut self,
        heaps: &[Arc<dyn NativeDescriptorHeap>],
    );

    fn set_pipeline_state(
        &mut self,
        pipeline_state: &Arc<dyn NativePipelineState>,
    );

    fn set_graphics_root_signature(
        &mut self,
        root_signature: &Arc<dyn NativeRootSignature>,
    );

    fn set_compute_root_signature(
        &mut self,
        root_signature: &Arc<dyn NativeRootSignature>,
    );

    fn set_graphics_root_descriptor_table(
        &mut self,
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    );

    fn set_compute_root_descriptor_table(
        &mut self,
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    );

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    );

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );

    fn dispatch(
        &mut self,
        thread_group_count_x: u32,
        thread_group_count_y: u32,
        thread_group_count_z: u32,
    );

    fn execute_indirect(
        &mut self,
        pipeline_type: PipelineType,
        argument_buffer: &Arc<dyn NativeResource>,
        argument_offset: u64,
    );

    fn copy_buffer_region(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        dst_offset: u64,
        src: &Arc<dyn NativeResource>,
        src_offset: u64,
        num_bytes: u64,
    );

    fn copy_resource(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        src: &Arc<dyn NativeResource>,
    );

    fn clear_render_target_view(
        &mut self,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    );

    fn clear_depth_stencil_view(
        &mut self,
        dsv: CpuDescriptorHandle,
        depth: f32,
        stencil: u8,
    );

    fn clear_unordered_access_view_float(
        &mut self,
        gpu_handle: GpuDescriptorHandle,
        cpu_handle: CpuDescriptorHandle,
        resource: &Arc<dyn NativeResource>,
        values: [f32; 4],
    );

    fn resolve_subresource(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        dst_subresource: u32,
        src: &Arc<dyn NativeResource>,
        src_subresource: u32,
    );

    fn close(&mut self) -> DiligentResult<()>;
}

pub trait NativeCommandQueue: Send + Sync {
    /// Submits a closed command list. Returns the fence value that completes with it.
    fn submit(
        &self,
        command_list: Box<dyn NativeCommandList>,
    ) -> DiligentResult<u64>;

    /// Signals the fence after all submitted work and returns the signaled value
    fn signal(&self) -> u64;

    fn next_fence_value(&self) -> u64;

    fn completed_fence_value(&self) -> u64;
}

pub trait NativeDevice: Send + Sync {
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> DiligentResult<Arc<dyn NativeDescriptorHeap>>;

    fn descriptor_handle_increment_size(
        &self,
        heap_type: DescriptorHeapType,
    ) -> u32;

    fn copy_descriptors_simple(
        &self,
        num_descriptors: u32,
        dst: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
        heap_type: DescriptorHeapType,
    );

    fn create_committed_resource(
        &self,
        desc: &NativeResourceDesc,
    ) -> DiligentResult<Arc<dyn NativeResource>>;

    fn create_view(
        &self,
        resource: &dyn NativeResource,
        view_kind: ViewKind,
        dest: CpuDescriptorHandle,
    );

    /// Creates a constant buffer view of `size_in_bytes` bytes at `gpu_address`. Used for buffers
    /// that live in upload memory rather than in a resource of their own.
    fn create_constant_buffer_view(
        &self,
        gpu_address: GpuVirtualAddress,
        size_in_bytes: u64,
        dest: CpuDescriptorHandle,
    );

    fn create_sampler(
        &self,
        dest: CpuDescriptorHandle,
    );

    fn create_root_signature(
        &self,
        num_root_parameters: u32,
    ) -> DiligentResult<Arc<dyn NativeRootSignature>>;

    fn create_pipeline_state(
        &self,
        name: &str,
        pipeline_type: PipelineType,
        root_signature: &Arc<dyn NativeRootSignature>,
    ) -> DiligentResult<Arc<dyn NativePipelineState>>;

    fn create_command_list(&self) -> DiligentResult<Box<dyn NativeCommandList>>;
}
