//! Root signature made of descriptor tables, and the protocol that commits a resource cache to a
//! command context.
//!
//! Two commit strategies exist. When the signature has no dynamic tables every table points at
//! space the resource cache owns in the shader-visible heap, and committing only binds the tables.
//! Otherwise the dynamic tables are copied on every commit into space taken from the context's
//! dynamic suballocator. Each strategy comes in a variant that transitions the referenced resources
//! and a variant that only checks their states. The strategy is chosen once, in `finalize`.

use std::sync::Arc;

use diligent_base::memory::round_size_up_to_alignment_u64;

use crate::buffer::CONSTANT_BUFFER_ALIGNMENT;
use crate::command_context::CommandContext;
use crate::descriptor_heap::DescriptorHeapAllocation;
use crate::native::{NativeDevice, NativeRootSignature};
use crate::render_device::RenderDevice;
use crate::shader_resource_cache::{BoundObject, CacheTable, CachedResource, ShaderResourceCache};
use crate::*;

const SHADER_VISIBLE_HEAP_TYPES: [DescriptorHeapType; 2] =
    [DescriptorHeapType::CbvSrvUav, DescriptorHeapType::Sampler];

fn shader_visible_heap_index(heap_type: DescriptorHeapType) -> usize {
    match heap_type {
        DescriptorHeapType::Sampler => 1,
        _ => 0,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorRangeType {
    Cbv,
    Srv,
    Uav,
    Sampler,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRangeDesc {
    pub range_type: DescriptorRangeType,
    pub num_descriptors: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootTableDesc {
    pub variable_type: ShaderResourceVariableType,
    pub ranges: Vec<DescriptorRangeDesc>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub range_type: DescriptorRangeType,
    pub num_descriptors: u32,
    pub offset_from_table_start: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootTable {
    root_index: u32,
    variable_type: ShaderResourceVariableType,
    heap_type: DescriptorHeapType,
    ranges: Vec<DescriptorRange>,
    size: u32,
}

impl RootTable {
    pub fn root_index(&self) -> u32 {
        self.root_index
    }

    pub fn variable_type(&self) -> ShaderResourceVariableType {
        self.variable_type
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    pub fn ranges(&self) -> &[DescriptorRange] {
        &self.ranges
    }

    /// Total number of descriptors in the table
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Type of the range containing the descriptor at `offset`
    pub fn range_type(
        &self,
        offset: u32,
    ) -> Option<DescriptorRangeType> {
        self.ranges
            .iter()
            .find(|range| {
                offset >= range.offset_from_table_start
                    && offset < range.offset_from_table_start + range.num_descriptors
            })
            .map(|range| range.range_type)
    }
}

/// Everything a commit needs besides the root signature and the command context
pub struct CommitResourcesAttribs<'a> {
    pub device: &'a RenderDevice,
    pub cache: &'a ShaderResourceCache,
    pub pipeline_type: PipelineType,
    pub context_id: usize,
    pub frame_number: u64,
    /// Check the states of the resources when they are not transitioned
    pub validate_states: bool,
}

type CommitDescriptorHandlesFn =
    fn(&RootSignature, &mut CommandContext, &CommitResourcesAttribs) -> DiligentResult<()>;

pub struct RootSignature {
    tables: Vec<RootTable>,
    // Descriptors of static and mutable tables, per shader-visible heap
    static_space_size: [u32; 2],
    // Descriptors of dynamic tables, per shader-visible heap
    dynamic_space_size: [u32; 2],
    native_root_signature: Option<Arc<dyn NativeRootSignature>>,
    // Indexed by "perform transitions"
    commit_descriptor_handles: Option<[CommitDescriptorHandlesFn; 2]>,
}

impl std::fmt::Debug for RootSignature {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RootSignature")
            .field("tables", &self.tables)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl RootSignature {
    pub fn new(table_descs: &[RootTableDesc]) -> DiligentResult<Self> {
        let mut tables = Vec::with_capacity(table_descs.len());
        let mut static_space_size = [0; 2];
        let mut dynamic_space_size = [0; 2];

        for (table_index, table_desc) in table_descs.iter().enumerate() {
            if table_desc.ranges.is_empty() {
                return Err(DiligentError::validation(format!(
                    "Root table {} has no descriptor ranges",
                    table_index
                )));
            }

            let num_sampler_ranges = table_desc
                .ranges
                .iter()
                .filter(|range| range.range_type == DescriptorRangeType::Sampler)
                .count();
            let heap_type = if num_sampler_ranges == 0 {
                DescriptorHeapType::CbvSrvUav
            } else if num_sampler_ranges == table_desc.ranges.len() {
                DescriptorHeapType::Sampler
            } else {
                return Err(DiligentError::validation(format!(
                    "Root table {} mixes sampler ranges with other descriptor ranges",
                    table_index
                )));
            };

            let mut ranges = Vec::with_capacity(table_desc.ranges.len());
            let mut size = 0;
            for range_desc in &table_desc.ranges {
                if range_desc.num_descriptors == 0 {
                    return Err(DiligentError::validation(format!(
                        "Descriptor range of root table {} is empty",
                        table_index
                    )));
                }
                ranges.push(DescriptorRange {
                    range_type: range_desc.range_type,
                    num_descriptors: range_desc.num_descriptors,
                    offset_from_table_start: size,
                });
                size += range_desc.num_descriptors;
            }

            let heap_index = shader_visible_heap_index(heap_type);
            if table_desc.variable_type == ShaderResourceVariableType::Dynamic {
                dynamic_space_size[heap_index] += size;
            } else {
                static_space_size[heap_index] += size;
            }

            tables.push(RootTable {
                root_index: table_index as u32,
                variable_type: table_desc.variable_type,
                heap_type,
                ranges,
                size,
            });
        }

        Ok(RootSignature {
            tables,
            static_space_size,
            dynamic_space_size,
            native_root_signature: None,
            commit_descriptor_handles: None,
        })
    }

    /// Creates the native root signature and selects the commit strategy
    pub fn finalize(
        &mut self,
        native_device: &dyn NativeDevice,
    ) -> DiligentResult<()> {
        assert!(!self.is_finalized(), "Root signature is already finalized");

        self.native_root_signature =
            Some(native_device.create_root_signature(self.tables.len() as u32)?);

        let commit_fns: [CommitDescriptorHandlesFn; 2] = if self.has_dynamic_tables() {
            [
                Self::commit_descriptor_handles::<false, true>,
                Self::commit_descriptor_handles::<true, true>,
            ]
        } else {
            [
                Self::commit_descriptor_handles::<false, false>,
                Self::commit_descriptor_handles::<true, false>,
            ]
        };
        self.commit_descriptor_handles = Some(commit_fns);

        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.native_root_signature.is_some()
    }

    pub fn native_root_signature(&self) -> Option<&Arc<dyn NativeRootSignature>> {
        self.native_root_signature.as_ref()
    }

    pub fn tables(&self) -> &[RootTable] {
        &self.tables
    }

    pub fn has_dynamic_tables(&self) -> bool {
        self.dynamic_space_size.iter().any(|size| *size > 0)
    }

    pub fn has_static_tables(&self) -> bool {
        self.tables
            .iter()
            .any(|table| table.variable_type == ShaderResourceVariableType::Static)
    }

    /// Signatures with the same table layout can share resource caches
    pub fn is_compatible_with(
        &self,
        other: &RootSignature,
    ) -> bool {
        self.tables == other.tables
    }

    /// Assigns shader-visible space to the static and mutable tables of `cache`. The tables are
    /// packed one after another in table order. Dynamic tables get no space.
    pub fn init_resource_cache(
        &self,
        device: &RenderDevice,
        cache: &mut ShaderResourceCache,
    ) -> DiligentResult<()> {
        debug_assert_eq!(cache.num_tables(), self.tables.len());

        let mut spaces: [DescriptorHeapAllocation; 2] = Default::default();
        for (heap_index, heap_type) in SHADER_VISIBLE_HEAP_TYPES.iter().enumerate() {
            let num_descriptors = self.static_space_size[heap_index];
            if num_descriptors == 0 {
                continue;
            }

            let space = device.gpu_descriptor_heap(*heap_type).allocate(num_descriptors);
            if space.is_null() {
                log::error!(
                    "Failed to allocate {} shader-visible {} descriptors for a resource cache",
                    num_descriptors,
                    heap_type.literal_name()
                );
                return Err(format!(
                    "Failed to allocate {} shader-visible descriptors",
                    num_descriptors
                )
                .into());
            }
            spaces[heap_index] = space;
        }

        let mut next_offset = [0u32; 2];
        let table_start_offsets: Vec<Option<u32>> = self
            .tables
            .iter()
            .map(|table| {
                if table.variable_type == ShaderResourceVariableType::Dynamic {
                    return None;
                }
                let heap_index = shader_visible_heap_index(table.heap_type);
                let offset = next_offset[heap_index];
                next_offset[heap_index] += table.size;
                Some(offset)
            })
            .collect();

        let [cbv_srv_uav_space, sampler_space] = spaces;
        cache.set_shader_visible_space(cbv_srv_uav_space, sampler_space, &table_start_offsets);
        Ok(())
    }

    /// Binds the tables of `attribs.cache`. With `perform_transitions` the referenced resources are
    /// transitioned into the states their tables require, otherwise their states are only checked
    /// if `attribs.validate_states` is set.
    pub fn commit_resources(
        &self,
        command_context: &mut CommandContext,
        attribs: &CommitResourcesAttribs,
        perform_transitions: bool,
    ) -> DiligentResult<()> {
        let commit_fns = self
            .commit_descriptor_handles
            .ok_or_else(|| DiligentError::from("Root signature is not finalized"))?;
        commit_fns[perform_transitions as usize](self, command_context, attribs)
    }

    /// Transitions every resource of `cache` into the state its table requires, without binding
    /// anything
    pub fn transition_resources(
        &self,
        command_context: &mut CommandContext,
        cache: &ShaderResourceCache,
    ) -> DiligentResult<()> {
        for table in cache.tables() {
            process_table_resources::<true>(command_context, table, false)?;
        }
        Ok(())
    }

    #[profiling::function]
    fn commit_descriptor_handles<const PERFORM_TRANSITIONS: bool, const HAS_DYNAMIC: bool>(
        &self,
        command_context: &mut CommandContext,
        attribs: &CommitResourcesAttribs,
    ) -> DiligentResult<()> {
        let cache = attribs.cache;
        let device = attribs.device;

        let mut dynamic_spaces: [DescriptorHeapAllocation; 2] = Default::default();
        if HAS_DYNAMIC {
            for (heap_index, heap_type) in SHADER_VISIBLE_HEAP_TYPES.iter().enumerate() {
                let num_descriptors = self.dynamic_space_size[heap_index];
                if num_descriptors == 0 {
                    continue;
                }

                let space = command_context
                    .allocate_dynamic_gpu_visible_descriptor(*heap_type, num_descriptors);
                if space.is_null() {
                    return Err(format!(
                        "Failed to allocate {} dynamic GPU-visible {} descriptors",
                        num_descriptors,
                        heap_type.literal_name()
                    )
                    .into());
                }
                dynamic_spaces[heap_index] = space;
            }
        }

        command_context.set_descriptor_heaps(
            device
                .gpu_descriptor_heap(DescriptorHeapType::CbvSrvUav)
                .native_heap(),
            device
                .gpu_descriptor_heap(DescriptorHeapType::Sampler)
                .native_heap(),
        );

        let mut dynamic_offsets = [0u32; 2];
        for (table_index, table) in self.tables.iter().enumerate() {
            let cache_table = cache.table(table_index);

            let base_descriptor =
                if HAS_DYNAMIC && table.variable_type == ShaderResourceVariableType::Dynamic {
                    let heap_index = shader_visible_heap_index(table.heap_type);
                    let space = &dynamic_spaces[heap_index];
                    let table_start = dynamic_offsets[heap_index];
                    dynamic_offsets[heap_index] += table.size;

                    for (offset, resource) in cache_table.resources().iter().enumerate() {
                        let dst = space.cpu_handle(table_start + offset as u32);
                        copy_dynamic_descriptor(
                            &**device.native_device(),
                            resource,
                            dst,
                            table,
                            offset as u32,
                            attribs,
                        )?;
                    }
                    space.gpu_handle(table_start)
                } else {
                    cache.table_gpu_handle(table_index).ok_or_else(|| {
                        DiligentError::from(
                            "Resource cache has no shader-visible space, it must be initialized by the root signature",
                        )
                    })?
                };

            process_table_resources::<PERFORM_TRANSITIONS>(
                command_context,
                cache_table,
                attribs.validate_states,
            )?;

            command_context.set_root_descriptor_table(
                attribs.pipeline_type,
                table.root_index,
                base_descriptor,
            );
        }

        Ok(())
    }
}

fn copy_dynamic_descriptor(
    native_device: &dyn NativeDevice,
    resource: &CachedResource,
    dst: CpuDescriptorHandle,
    table: &RootTable,
    offset: u32,
    attribs: &CommitResourcesAttribs,
) -> DiligentResult<()> {
    match &resource.object {
        Some(BoundObject::Buffer(buffer)) if buffer.is_dynamic_upload() => {
            let allocation = buffer.dynamic_allocation(attribs.context_id);
            if allocation.is_null() || allocation.ctx_frame_number() != attribs.frame_number {
                return Err(DiligentError::validation(format!(
                    "Dynamic buffer '{}' has not been mapped in the current frame ({}) of device context {}",
                    buffer.desc().name,
                    attribs.frame_number,
                    attribs.context_id
                )));
            }
            native_device.create_constant_buffer_view(
                allocation.gpu_address(),
                round_size_up_to_alignment_u64(buffer.desc().size_in_bytes, CONSTANT_BUFFER_ALIGNMENT),
                dst,
            );
        }
        Some(_) => {
            native_device.copy_descriptors_simple(
                1,
                dst,
                resource.cpu_descriptor_handle,
                table.heap_type,
            );
        }
        None => {
            log::error!(
                "No resource is bound to dynamic variable at offset {} of root table {}",
                offset,
                table.root_index
            );
        }
    }
    Ok(())
}

#[profiling::function]
fn process_table_resources<const PERFORM_TRANSITIONS: bool>(
    command_context: &mut CommandContext,
    cache_table: &CacheTable,
    validate_states: bool,
) -> DiligentResult<()> {
    for resource in cache_table.resources() {
        let required_state = resource.resource_type.required_state();
        if !required_state.is_known() {
            continue;
        }

        match &resource.object {
            Some(BoundObject::Buffer(buffer)) => {
                let state = buffer.state();
                // Application-managed
                if !state.is_known() {
                    continue;
                }

                if PERFORM_TRANSITIONS {
                    if !state.contains(required_state) {
                        command_context.transition_buffer(buffer, required_state)?;
                    } else if required_state == ResourceState::UNORDERED_ACCESS {
                        command_context.insert_uav_barrier(buffer.native_resource());
                    }
                } else if validate_states && !state.contains(required_state) {
                    log::error!(
                        "State of buffer '{}' is incorrect. Required state: {}. Actual state: {}. Call transition_shader_resources() or commit_shader_resources() with ResourceStateTransitionMode::Transition",
                        buffer.desc().name,
                        required_state.name(),
                        state.name()
                    );
                }
            }
            Some(BoundObject::Texture(texture)) => {
                let state = texture.state();
                if !state.is_known() {
                    continue;
                }

                if PERFORM_TRANSITIONS {
                    if !state.contains(required_state) {
                        command_context.transition_texture(texture, required_state)?;
                    } else if required_state == ResourceState::UNORDERED_ACCESS {
                        command_context.insert_uav_barrier(Some(texture.native_resource()));
                    }
                } else if validate_states && !state.contains(required_state) {
                    log::error!(
                        "State of texture '{}' is incorrect. Required state: {}. Actual state: {}. Call transition_shader_resources() or commit_shader_resources() with ResourceStateTransitionMode::Transition",
                        texture.desc().name,
                        required_state.name(),
                        state.name()
                    );
                }
            }
            Some(BoundObject::Sampler(_)) | None => {}
        }
    }

    Ok(())
}
