//! Resources bound to a pipeline's root tables. Every cached resource keeps a strong reference to
//! the bound object and the CPU descriptor that is copied into the shader-visible heap at commit
//! time (dynamic tables) or at bind time (static and mutable tables).

use diligent_base::RefCntAutoPtr;

use crate::descriptor_heap::DescriptorHeapAllocation;
use crate::root_signature::RootSignature;
use crate::*;

/// What a cached descriptor refers to, decides the state the resource must be in when committed
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CachedResourceType {
    Unknown,
    Cbv,
    BufSrv,
    BufUav,
    TexSrv,
    TexUav,
    Sampler,
}

impl Default for CachedResourceType {
    fn default() -> Self {
        CachedResourceType::Unknown
    }
}

impl CachedResourceType {
    /// State a resource of this type must be in to be accessed by shaders
    pub fn required_state(self) -> ResourceState {
        match self {
            CachedResourceType::Cbv => ResourceState::CONSTANT_BUFFER,
            CachedResourceType::BufSrv | CachedResourceType::TexSrv => {
                ResourceState::SHADER_RESOURCE
            }
            CachedResourceType::BufUav | CachedResourceType::TexUav => {
                ResourceState::UNORDERED_ACCESS
            }
            CachedResourceType::Sampler | CachedResourceType::Unknown => ResourceState::UNKNOWN,
        }
    }
}

/// A device object that can be bound to a shader variable
#[derive(Clone, Debug)]
pub enum BoundObject {
    Buffer(RefCntAutoPtr<Buffer>),
    Texture(RefCntAutoPtr<Texture>),
    Sampler(RefCntAutoPtr<Sampler>),
}

impl BoundObject {
    pub fn ptr_eq(
        &self,
        other: &BoundObject,
    ) -> bool {
        match (self, other) {
            (BoundObject::Buffer(a), BoundObject::Buffer(b)) => RefCntAutoPtr::ptr_eq(a, b),
            (BoundObject::Texture(a), BoundObject::Texture(b)) => RefCntAutoPtr::ptr_eq(a, b),
            (BoundObject::Sampler(a), BoundObject::Sampler(b)) => RefCntAutoPtr::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BoundObject::Buffer(buffer) => &buffer.desc().name,
            BoundObject::Texture(texture) => &texture.desc().name,
            BoundObject::Sampler(sampler) => &sampler.desc().name,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CachedResource {
    pub resource_type: CachedResourceType,
    pub cpu_descriptor_handle: CpuDescriptorHandle,
    pub object: Option<BoundObject>,
}

impl CachedResource {
    pub fn is_bound(&self) -> bool {
        self.object.is_some()
    }
}

#[derive(Debug)]
pub struct CacheTable {
    resources: Vec<CachedResource>,
    // Offset of the table in the cache's shader-visible space. Dynamic tables and caches without
    // shader-visible space have none.
    table_start_offset: Option<u32>,
    heap_type: DescriptorHeapType,
    variable_type: ShaderResourceVariableType,
}

impl CacheTable {
    pub fn size(&self) -> u32 {
        self.resources.len() as u32
    }

    pub fn resources(&self) -> &[CachedResource] {
        &self.resources
    }

    pub fn resource(
        &self,
        offset: u32,
    ) -> &CachedResource {
        &self.resources[offset as usize]
    }

    pub fn resource_mut(
        &mut self,
        offset: u32,
    ) -> &mut CachedResource {
        &mut self.resources[offset as usize]
    }

    pub fn table_start_offset(&self) -> Option<u32> {
        self.table_start_offset
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    pub fn variable_type(&self) -> ShaderResourceVariableType {
        self.variable_type
    }
}

/// One table per root table of the root signature the cache was created for
#[derive(Debug)]
pub struct ShaderResourceCache {
    tables: Vec<CacheTable>,
    cbv_srv_uav_space: DescriptorHeapAllocation,
    sampler_space: DescriptorHeapAllocation,
}

impl ShaderResourceCache {
    /// Creates a cache with no shader-visible space. `RootSignature::init_resource_cache` assigns
    /// the space for static and mutable tables.
    pub fn new(root_signature: &RootSignature) -> Self {
        let tables = root_signature
            .tables()
            .iter()
            .map(|table| CacheTable {
                resources: vec![CachedResource::default(); table.size() as usize],
                table_start_offset: None,
                heap_type: table.heap_type(),
                variable_type: table.variable_type(),
            })
            .collect();

        ShaderResourceCache {
            tables,
            cbv_srv_uav_space: Default::default(),
            sampler_space: Default::default(),
        }
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn tables(&self) -> &[CacheTable] {
        &self.tables
    }

    pub fn table(
        &self,
        table_index: usize,
    ) -> &CacheTable {
        &self.tables[table_index]
    }

    pub fn table_mut(
        &mut self,
        table_index: usize,
    ) -> &mut CacheTable {
        &mut self.tables[table_index]
    }

    pub(crate) fn set_shader_visible_space(
        &mut self,
        cbv_srv_uav_space: DescriptorHeapAllocation,
        sampler_space: DescriptorHeapAllocation,
        table_start_offsets: &[Option<u32>],
    ) {
        debug_assert_eq!(table_start_offsets.len(), self.tables.len());
        self.cbv_srv_uav_space = cbv_srv_uav_space;
        self.sampler_space = sampler_space;
        for (table, offset) in self.tables.iter_mut().zip(table_start_offsets) {
            table.table_start_offset = *offset;
        }
    }

    /// Shader-visible space of static and mutable tables in the heap of the given type
    pub fn shader_visible_space(
        &self,
        heap_type: DescriptorHeapType,
    ) -> &DescriptorHeapAllocation {
        match heap_type {
            DescriptorHeapType::Sampler => &self.sampler_space,
            _ => &self.cbv_srv_uav_space,
        }
    }

    /// CPU handle of the shader-visible slot of a static or mutable resource
    pub fn shader_visible_cpu_handle(
        &self,
        table_index: usize,
        offset: u32,
    ) -> Option<CpuDescriptorHandle> {
        let table = &self.tables[table_index];
        let start = table.table_start_offset?;
        Some(
            self.shader_visible_space(table.heap_type)
                .cpu_handle(start + offset),
        )
    }

    /// GPU handle of the first descriptor of a static or mutable table
    pub fn table_gpu_handle(
        &self,
        table_index: usize,
    ) -> Option<GpuDescriptorHandle> {
        let table = &self.tables[table_index];
        let start = table.table_start_offset?;
        Some(self.shader_visible_space(table.heap_type).gpu_handle(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_states() {
        assert_eq!(
            CachedResourceType::Cbv.required_state(),
            ResourceState::CONSTANT_BUFFER
        );
        assert_eq!(
            CachedResourceType::TexSrv.required_state(),
            ResourceState::SHADER_RESOURCE
        );
        assert_eq!(
            CachedResourceType::BufUav.required_state(),
            ResourceState::UNORDERED_ACCESS
        );
        assert!(!CachedResourceType::Sampler.required_state().is_known());
    }
}
