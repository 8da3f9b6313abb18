#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

/// Native descriptor heap types. The discriminant is the index into per-type arrays such as the
/// heap sizes in `EngineD3D12CreateInfo`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum DescriptorHeapType {
    CbvSrvUav = 0,
    Sampler = 1,
    Rtv = 2,
    Dsv = 3,
}

impl DescriptorHeapType {
    pub const COUNT: usize = 4;

    pub const ALL: [DescriptorHeapType; 4] = [
        DescriptorHeapType::CbvSrvUav,
        DescriptorHeapType::Sampler,
        DescriptorHeapType::Rtv,
        DescriptorHeapType::Dsv,
    ];

    pub fn literal_name(self) -> &'static str {
        match self {
            DescriptorHeapType::CbvSrvUav => "D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV",
            DescriptorHeapType::Sampler => "D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER",
            DescriptorHeapType::Rtv => "D3D12_DESCRIPTOR_HEAP_TYPE_RTV",
            DescriptorHeapType::Dsv => "D3D12_DESCRIPTOR_HEAP_TYPE_DSV",
        }
    }

    /// Only resource-view and sampler heaps can be bound to shaders
    pub fn can_be_shader_visible(self) -> bool {
        matches!(
            self,
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub heap_type: DescriptorHeapType,
    pub num_descriptors: u32,
    pub shader_visible: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle {
    pub ptr: usize,
}

impl CpuDescriptorHandle {
    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn offset(
        self,
        descriptor_count: u32,
        descriptor_size: u32,
    ) -> Self {
        CpuDescriptorHandle {
            ptr: self.ptr + descriptor_count as usize * descriptor_size as usize,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle {
    pub ptr: u64,
}

impl GpuDescriptorHandle {
    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn offset(
        self,
        descriptor_count: u32,
        descriptor_size: u32,
    ) -> Self {
        GpuDescriptorHandle {
            ptr: self.ptr + descriptor_count as u64 * descriptor_size as u64,
        }
    }
}

pub type GpuVirtualAddress = u64;

/// Bit mask of command queues, bit N stands for the queue with index N
pub type CommandQueueMask = u64;

/// Which queue type a pipeline or root table binding goes to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum PipelineType {
    Graphics,
    Compute,
}
