#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

use super::DescriptorHeapType;

/// Expected CPU and GPU access pattern of a resource
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum Usage {
    /// Contents never change after creation
    Immutable,
    /// Read and written by the GPU, occasionally updated from the CPU
    Default,
    /// Rewritten by the CPU every frame. Contents live in the context's dynamic heap.
    Dynamic,
    /// CPU-accessible copy source or destination
    Staging,
}

impl Default for Usage {
    fn default() -> Self {
        Usage::Default
    }
}

bitflags::bitflags! {
    /// How a resource may be bound to the pipeline
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct BindFlags: u32 {
        const NONE = 0;
        const VERTEX_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const UNIFORM_BUFFER = 0x4;
        const SHADER_RESOURCE = 0x8;
        const STREAM_OUTPUT = 0x10;
        const RENDER_TARGET = 0x20;
        const DEPTH_STENCIL = 0x40;
        const UNORDERED_ACCESS = 0x80;
        const INDIRECT_DRAW_ARGS = 0x100;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct BufferDesc {
    pub name: String,
    pub size_in_bytes: u64,
    pub bind_flags: BindFlags,
    pub usage: Usage,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub bind_flags: BindFlags,
    pub usage: Usage,
}

impl Default for TextureDesc {
    fn default() -> Self {
        TextureDesc {
            name: String::default(),
            width: 1,
            height: 1,
            array_size: 1,
            mip_levels: 1,
            bind_flags: BindFlags::SHADER_RESOURCE,
            usage: Usage::Default,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct SamplerDesc {
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum MapType {
    Read,
    Write,
    ReadWrite,
}

bitflags::bitflags! {
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct MapFlags: u32 {
        const NONE = 0;
        const DO_NOT_WAIT = 0x1;
        /// Previous contents are not needed, a new region is provided
        const DISCARD = 0x2;
        /// The application guarantees it does not overwrite data the GPU is still reading
        const NO_OVERWRITE = 0x4;
    }
}

/// How often the resource bound to a shader variable is expected to change
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum ShaderResourceVariableType {
    /// Bound once for the pipeline
    Static,
    /// Bound once per shader resource binding
    Mutable,
    /// May change between every draw call
    Dynamic,
}

/// What `commit_shader_resources` and draw commands do with the states of referenced resources
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum ResourceStateTransitionMode {
    /// The application manages states
    None,
    /// Transition resources to the states the binding requires
    Transition,
    /// Only check that resources are already in the required states
    Verify,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DrawAttribs {
    pub num_vertices: u32,
    pub num_instances: u32,
    pub start_vertex_location: u32,
    pub first_instance_location: u32,
}

impl Default for DrawAttribs {
    fn default() -> Self {
        DrawAttribs {
            num_vertices: 0,
            num_instances: 1,
            start_vertex_location: 0,
            first_instance_location: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DrawIndexedAttribs {
    pub num_indices: u32,
    pub num_instances: u32,
    pub first_index_location: u32,
    pub base_vertex: i32,
    pub first_instance_location: u32,
}

impl Default for DrawIndexedAttribs {
    fn default() -> Self {
        DrawIndexedAttribs {
            num_indices: 0,
            num_instances: 1,
            first_index_location: 0,
            base_vertex: 0,
            first_instance_location: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispatchComputeAttribs {
    pub thread_group_count_x: u32,
    pub thread_group_count_y: u32,
    pub thread_group_count_z: u32,
}

impl Default for DispatchComputeAttribs {
    fn default() -> Self {
        DispatchComputeAttribs {
            thread_group_count_x: 1,
            thread_group_count_y: 1,
            thread_group_count_z: 1,
        }
    }
}

/// Sizes of the device-wide descriptor and memory pools
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct EngineD3D12CreateInfo {
    /// Descriptors per CPU heap page, indexed by `DescriptorHeapType`
    pub cpu_descriptor_heap_allocation_size: [u32; DescriptorHeapType::COUNT],
    /// Static and mutable part of the shader-visible CBV/SRV/UAV and sampler heaps
    pub gpu_descriptor_heap_size: [u32; 2],
    /// Dynamic part of the shader-visible CBV/SRV/UAV and sampler heaps
    pub gpu_descriptor_heap_dynamic_size: [u32; 2],
    /// Descriptors a device context takes from the dynamic part at a time
    pub dynamic_descriptor_allocation_chunk_size: [u32; 2],
    pub dynamic_heap_page_size: u64,
    pub num_dynamic_heap_pages_to_reserve: u32,
    pub num_command_queues: u32,
    pub num_deferred_contexts: u32,
}

impl Default for EngineD3D12CreateInfo {
    fn default() -> Self {
        EngineD3D12CreateInfo {
            cpu_descriptor_heap_allocation_size: [8192, 2048, 1024, 1024],
            gpu_descriptor_heap_size: [16384, 1024],
            gpu_descriptor_heap_dynamic_size: [8192, 1024],
            dynamic_descriptor_allocation_chunk_size: [256, 32],
            dynamic_heap_page_size: 1 << 20,
            num_dynamic_heap_pages_to_reserve: 1,
            num_command_queues: 1,
            num_deferred_contexts: 0,
        }
    }
}
