//! Records commands into a native command list. Resource transitions are batched and flushed
//! before any command that depends on them.

use std::sync::Arc;

use crate::descriptor_heap::{DescriptorHeapAllocation, DynamicSuballocationsManager};
use crate::native::*;
use crate::*;

/// Pending barriers are flushed once the batch reaches this size
pub const MAX_PENDING_BARRIERS: usize = 16;

fn same_object<T: ?Sized>(
    a: &Arc<T>,
    b: &Arc<T>,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn barrier_flags(transition_type: StateTransitionType) -> ResourceBarrierFlags {
    match transition_type {
        StateTransitionType::Immediate => ResourceBarrierFlags::NONE,
        StateTransitionType::Begin => ResourceBarrierFlags::BEGIN_ONLY,
        StateTransitionType::End => ResourceBarrierFlags::END_ONLY,
    }
}

fn calc_subresource(
    mip_level: u32,
    array_slice: u32,
    mip_levels: u32,
) -> u32 {
    mip_level + array_slice * mip_levels
}

pub struct CommandContext {
    command_list: Option<Box<dyn NativeCommandList>>,
    pending_resource_barriers: Vec<ResourceBarrier>,
    cur_pipeline_state: Option<Arc<dyn NativePipelineState>>,
    cur_graphics_root_signature: Option<Arc<dyn NativeRootSignature>>,
    cur_compute_root_signature: Option<Arc<dyn NativeRootSignature>>,
    bound_descriptor_heaps: [Option<Arc<dyn NativeDescriptorHeap>>; 2],
    // CBV_SRV_UAV and sampler suballocators. Transient contexts have none.
    dynamic_gpu_descriptor_allocators: Option<[DynamicSuballocationsManager; 2]>,
    num_commands: usize,
}

impl CommandContext {
    pub fn new(
        command_list: Box<dyn NativeCommandList>,
        dynamic_gpu_descriptor_allocators: Option<[DynamicSuballocationsManager; 2]>,
    ) -> Self {
        CommandContext {
            command_list: Some(command_list),
            pending_resource_barriers: Vec::with_capacity(MAX_PENDING_BARRIERS),
            cur_pipeline_state: None,
            cur_graphics_root_signature: None,
            cur_compute_root_signature: None,
            bound_descriptor_heaps: [None, None],
            dynamic_gpu_descriptor_allocators,
            num_commands: 0,
        }
    }

    fn command_list(&mut self) -> &mut dyn NativeCommandList {
        match self.command_list.as_mut() {
            Some(command_list) => &mut **command_list,
            None => panic!("Command context is closed, reset() it with a new command list"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.command_list.is_none()
    }

    /// Number of commands recorded since the last reset
    pub fn num_commands(&self) -> usize {
        self.num_commands
    }

    pub fn pending_barrier_count(&self) -> usize {
        self.pending_resource_barriers.len()
    }

    /// Flushes pending barriers and closes the command list
    #[profiling::function]
    pub fn close(&mut self) -> DiligentResult<Box<dyn NativeCommandList>> {
        self.flush_resource_barriers();
        let mut command_list = self
            .command_list
            .take()
            .ok_or_else(|| DiligentError::from("Command context is already closed"))?;
        command_list.close()?;
        Ok(command_list)
    }

    /// Starts recording into `command_list`. Cached bindings are forgotten since a new command list
    /// inherits none of them.
    pub fn reset(
        &mut self,
        command_list: Box<dyn NativeCommandList>,
    ) {
        self.command_list = Some(command_list);
        self.cur_pipeline_state = None;
        self.cur_graphics_root_signature = None;
        self.cur_compute_root_signature = None;
        self.pending_resource_barriers.clear();
        self.bound_descriptor_heaps = [None, None];
        self.num_commands = 0;
    }

    #[profiling::function]
    pub fn flush_resource_barriers(&mut self) {
        if self.pending_resource_barriers.is_empty() {
            return;
        }

        log::trace!(
            "Flushing {} resource barriers",
            self.pending_resource_barriers.len()
        );
        let barriers = std::mem::take(&mut self.pending_resource_barriers);
        self.command_list().resource_barrier(&barriers);
        self.pending_resource_barriers = barriers;
        self.pending_resource_barriers.clear();
        self.num_commands += 1;
    }

    fn add_barrier(
        &mut self,
        barrier: ResourceBarrier,
    ) {
        log::trace!("Pending barrier: {:?}", barrier);
        self.pending_resource_barriers.push(barrier);
    }

    /// Orders all UAV accesses to `resource` (or to every resource if `None`) before later ones
    pub fn insert_uav_barrier(
        &mut self,
        resource: Option<&Arc<dyn NativeResource>>,
    ) {
        self.add_barrier(ResourceBarrier::Uav {
            resource: resource.cloned(),
        });
    }

    pub fn insert_alias_barrier(
        &mut self,
        before: &Arc<dyn NativeResource>,
        after: &Arc<dyn NativeResource>,
        flush_immediate: bool,
    ) {
        self.add_barrier(ResourceBarrier::Aliasing {
            resource_before: Some(before.clone()),
            resource_after: Some(after.clone()),
        });
        if flush_immediate {
            self.flush_resource_barriers();
        }
    }

    /// Transitions a texture whose state is tracked by the engine
    pub fn transition_texture(
        &mut self,
        texture: &Texture,
        new_state: ResourceState,
    ) -> DiligentResult<()> {
        if !texture.state().is_known() {
            return Err(DiligentError::validation(format!(
                "Texture '{}' state can't be unknown",
                texture.desc().name
            )));
        }
        self.transition_resource(&StateTransitionDesc::texture(
            texture,
            ResourceState::UNKNOWN,
            new_state,
            true,
        ))
    }

    /// Transitions a buffer whose state is tracked by the engine
    pub fn transition_buffer(
        &mut self,
        buffer: &Buffer,
        new_state: ResourceState,
    ) -> DiligentResult<()> {
        if !buffer.state().is_known() {
            return Err(DiligentError::validation(format!(
                "Buffer '{}' state can't be unknown",
                buffer.desc().name
            )));
        }
        self.transition_resource(&StateTransitionDesc::buffer(
            buffer,
            ResourceState::UNKNOWN,
            new_state,
            true,
        ))
    }

    /// Records the barriers needed to move a resource into `barrier.new_state`. Nothing is
    /// recorded if the request is invalid.
    #[profiling::function]
    pub fn transition_resource(
        &mut self,
        barrier: &StateTransitionDesc,
    ) -> DiligentResult<()> {
        if !barrier.new_state.is_known() {
            return Err(DiligentError::validation(
                "New resource state can't be unknown",
            ));
        }

        let (name, tracked_state) = match barrier.resource {
            StateTransitionResource::Texture(texture) => (&texture.desc().name, texture.state()),
            StateTransitionResource::Buffer(buffer) => {
                if buffer.is_dynamic_upload() {
                    if buffer.state() != ResourceState::GENERIC_READ {
                        return Err(DiligentError::validation(format!(
                            "Dynamic buffer '{}' that cannot be bound as SRV or UAV is expected to always be in RESOURCE_STATE_GENERIC_READ state",
                            buffer.desc().name
                        )));
                    }
                    if !ResourceState::GENERIC_READ.contains(barrier.new_state) {
                        return Err(DiligentError::validation(format!(
                            "Dynamic buffer '{}' can only transition to one of RESOURCE_STATE_GENERIC_READ states, {} was requested",
                            buffer.desc().name,
                            barrier.new_state.name()
                        )));
                    }
                }
                (&buffer.desc().name, buffer.state())
            }
        };

        let old_state = if !tracked_state.is_known() {
            if !barrier.old_state.is_known() {
                return Err(DiligentError::validation(format!(
                    "The state of '{}' is unknown (which means it is managed by the app), old_state of the transition must not be RESOURCE_STATE_UNKNOWN",
                    name
                )));
            }
            barrier.old_state
        } else {
            if barrier.old_state.is_known() && barrier.old_state != tracked_state {
                return Err(DiligentError::validation(format!(
                    "The state of '{}' is known ({}) and does not match the old_state ({}) of the transition. Set old_state to RESOURCE_STATE_UNKNOWN to use the current state",
                    name,
                    tracked_state.name(),
                    barrier.old_state.name()
                )));
            }
            tracked_state
        };

        if barrier.update_resource_state && barrier.transition_type == StateTransitionType::Begin {
            return Err(DiligentError::validation(format!(
                "The state of '{}' can't be updated in begin-split barrier",
                name
            )));
        }

        let is_uav_to_uav = old_state == ResourceState::UNORDERED_ACCESS
            && barrier.new_state == ResourceState::UNORDERED_ACCESS;
        if is_uav_to_uav && barrier.transition_type != StateTransitionType::Immediate {
            return Err(DiligentError::validation("UAV barriers must not be split"));
        }

        if let StateTransitionResource::Texture(texture) = barrier.resource {
            validate_subresource_range(texture.desc(), barrier)?;
        }

        let native_resource = match barrier.resource {
            StateTransitionResource::Texture(texture) => Some(texture.native_resource().clone()),
            StateTransitionResource::Buffer(buffer) => buffer.native_resource().cloned(),
        };

        if (old_state & barrier.new_state) != barrier.new_state {
            let mut new_state = barrier.new_state;
            // Read-only states are combined instead of being replaced
            if ResourceState::GENERIC_READ.contains(old_state)
                && ResourceState::GENERIC_READ.contains(new_state)
            {
                new_state |= old_state;
            }

            let state_before = NativeResourceStates::from(old_state);
            let state_after = NativeResourceStates::from(new_state);
            let flags = barrier_flags(barrier.transition_type);

            // UNDEFINED and PRESENT both map to COMMON, such transitions need no barrier
            if state_before != state_after {
                if let Some(resource) = native_resource.as_ref() {
                    match barrier.resource {
                        StateTransitionResource::Texture(texture) => {
                            self.add_texture_transition_barriers(
                                texture.desc(),
                                resource,
                                barrier,
                                state_before,
                                state_after,
                                flags,
                            );
                        }
                        StateTransitionResource::Buffer(_) => {
                            self.add_barrier(ResourceBarrier::Transition {
                                resource: resource.clone(),
                                subresource: ALL_SUBRESOURCES,
                                state_before,
                                state_after,
                                flags,
                            });
                        }
                    }
                }
            }

            if barrier.update_resource_state {
                match barrier.resource {
                    StateTransitionResource::Texture(texture) => texture.set_state(new_state),
                    StateTransitionResource::Buffer(buffer) => buffer.set_state(new_state),
                }
            }
        }

        if is_uav_to_uav {
            self.insert_uav_barrier(native_resource.as_ref());
        }

        if self.pending_resource_barriers.len() >= MAX_PENDING_BARRIERS {
            self.flush_resource_barriers();
        }

        Ok(())
    }

    fn add_texture_transition_barriers(
        &mut self,
        desc: &TextureDesc,
        resource: &Arc<dyn NativeResource>,
        barrier: &StateTransitionDesc,
        state_before: NativeResourceStates,
        state_after: NativeResourceStates,
        flags: ResourceBarrierFlags,
    ) {
        let all_mips = barrier.mip_levels_count == REMAINING_MIP_LEVELS
            || barrier.mip_levels_count == desc.mip_levels;
        let all_slices = barrier.array_slice_count == REMAINING_ARRAY_SLICES
            || barrier.array_slice_count == desc.array_size;

        if barrier.first_mip_level == 0 && all_mips && barrier.first_array_slice == 0 && all_slices
        {
            self.add_barrier(ResourceBarrier::Transition {
                resource: resource.clone(),
                subresource: ALL_SUBRESOURCES,
                state_before,
                state_after,
                flags,
            });
            return;
        }

        let end_mip = if barrier.mip_levels_count == REMAINING_MIP_LEVELS {
            desc.mip_levels
        } else {
            barrier.first_mip_level + barrier.mip_levels_count
        };
        let end_slice = if barrier.array_slice_count == REMAINING_ARRAY_SLICES {
            desc.array_size
        } else {
            barrier.first_array_slice + barrier.array_slice_count
        };

        for mip in barrier.first_mip_level..end_mip {
            for slice in barrier.first_array_slice..end_slice {
                self.add_barrier(ResourceBarrier::Transition {
                    resource: resource.clone(),
                    subresource: calc_subresource(mip, slice, desc.mip_levels),
                    state_before,
                    state_after,
                    flags,
                });
            }
        }
    }

    pub fn set_pipeline_state(
        &mut self,
        pipeline_state: &Arc<dyn NativePipelineState>,
    ) {
        let changed = match &self.cur_pipeline_state {
            Some(cur) => !same_object(cur, pipeline_state),
            None => true,
        };
        if changed {
            self.command_list().set_pipeline_state(pipeline_state);
            self.cur_pipeline_state = Some(pipeline_state.clone());
            self.num_commands += 1;
        }
    }

    pub fn set_graphics_root_signature(
        &mut self,
        root_signature: &Arc<dyn NativeRootSignature>,
    ) {
        let changed = match &self.cur_graphics_root_signature {
            Some(cur) => !same_object(cur, root_signature),
            None => true,
        };
        if changed {
            self.command_list()
                .set_graphics_root_signature(root_signature);
            self.cur_graphics_root_signature = Some(root_signature.clone());
            self.num_commands += 1;
        }
    }

    pub fn set_compute_root_signature(
        &mut self,
        root_signature: &Arc<dyn NativeRootSignature>,
    ) {
        let changed = match &self.cur_compute_root_signature {
            Some(cur) => !same_object(cur, root_signature),
            None => true,
        };
        if changed {
            self.command_list()
                .set_compute_root_signature(root_signature);
            self.cur_compute_root_signature = Some(root_signature.clone());
            self.num_commands += 1;
        }
    }

    /// Binds the shader-visible CBV_SRV_UAV and sampler heaps unless they are already bound
    pub fn set_descriptor_heaps(
        &mut self,
        cbv_srv_uav_heap: &Arc<dyn NativeDescriptorHeap>,
        sampler_heap: &Arc<dyn NativeDescriptorHeap>,
    ) {
        let is_bound = |bound: &Option<Arc<dyn NativeDescriptorHeap>>,
                        heap: &Arc<dyn NativeDescriptorHeap>| {
            bound
                .as_ref()
                .map(|bound| same_object(bound, heap))
                .unwrap_or(false)
        };

        if is_bound(&self.bound_descriptor_heaps[0], cbv_srv_uav_heap)
            && is_bound(&self.bound_descriptor_heaps[1], sampler_heap)
        {
            return;
        }

        let heaps = [cbv_srv_uav_heap.clone(), sampler_heap.clone()];
        self.command_list().set_descriptor_heaps(&heaps);
        let [cbv_srv_uav_heap, sampler_heap] = heaps;
        self.bound_descriptor_heaps = [Some(cbv_srv_uav_heap), Some(sampler_heap)];
        self.num_commands += 1;
    }

    pub fn set_root_descriptor_table(
        &mut self,
        pipeline_type: PipelineType,
        root_index: u32,
        base_descriptor: GpuDescriptorHandle,
    ) {
        match pipeline_type {
            PipelineType::Graphics => self
                .command_list()
                .set_graphics_root_descriptor_table(root_index, base_descriptor),
            PipelineType::Compute => self
                .command_list()
                .set_compute_root_descriptor_table(root_index, base_descriptor),
        }
        self.num_commands += 1;
    }

    /// Allocates shader-visible descriptors that are valid until the end of the frame. Returns a
    /// null allocation if the dynamic space is exhausted.
    pub fn allocate_dynamic_gpu_visible_descriptor(
        &mut self,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> DescriptorHeapAllocation {
        let allocators = match self.dynamic_gpu_descriptor_allocators.as_mut() {
            Some(allocators) => allocators,
            None => {
                log::error!("Dynamic GPU descriptor allocators are not available in this context");
                return DescriptorHeapAllocation::default();
            }
        };

        match heap_type {
            DescriptorHeapType::CbvSrvUav => allocators[0].allocate(count),
            DescriptorHeapType::Sampler => allocators[1].allocate(count),
            _ => {
                log::error!(
                    "{} descriptors cannot be shader visible",
                    heap_type.literal_name()
                );
                DescriptorHeapAllocation::default()
            }
        }
    }

    /// Returns all dynamic descriptor chunks to the GPU heaps once the queues in `queue_mask` are
    /// done with them
    pub fn release_dynamic_descriptors(
        &mut self,
        queue_mask: CommandQueueMask,
    ) {
        if let Some(allocators) = self.dynamic_gpu_descriptor_allocators.as_mut() {
            for allocator in allocators.iter_mut() {
                allocator.release_allocations(queue_mask);
            }
        }
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.flush_resource_barriers();
        self.command_list()
            .draw_instanced(vertex_count, instance_count, start_vertex, start_instance);
        self.num_commands += 1;
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.flush_resource_barriers();
        self.command_list().draw_indexed_instanced(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
        self.num_commands += 1;
    }

    pub fn dispatch(
        &mut self,
        thread_group_count_x: u32,
        thread_group_count_y: u32,
        thread_group_count_z: u32,
    ) {
        self.flush_resource_barriers();
        self.command_list().dispatch(
            thread_group_count_x,
            thread_group_count_y,
            thread_group_count_z,
        );
        self.num_commands += 1;
    }

    pub fn execute_indirect(
        &mut self,
        pipeline_type: PipelineType,
        argument_buffer: &Arc<dyn NativeResource>,
        argument_offset: u64,
    ) {
        self.flush_resource_barriers();
        self.command_list()
            .execute_indirect(pipeline_type, argument_buffer, argument_offset);
        self.num_commands += 1;
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        dst_offset: u64,
        src: &Arc<dyn NativeResource>,
        src_offset: u64,
        num_bytes: u64,
    ) {
        self.flush_resource_barriers();
        self.command_list()
            .copy_buffer_region(dst, dst_offset, src, src_offset, num_bytes);
        self.num_commands += 1;
    }

    pub fn copy_resource(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        src: &Arc<dyn NativeResource>,
    ) {
        self.flush_resource_barriers();
        self.command_list().copy_resource(dst, src);
        self.num_commands += 1;
    }

    pub fn clear_render_target(
        &mut self,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    ) {
        self.flush_resource_barriers();
        self.command_list().clear_render_target_view(rtv, color);
        self.num_commands += 1;
    }

    pub fn clear_depth_stencil(
        &mut self,
        dsv: CpuDescriptorHandle,
        depth: f32,
        stencil: u8,
    ) {
        self.flush_resource_barriers();
        self.command_list()
            .clear_depth_stencil_view(dsv, depth, stencil);
        self.num_commands += 1;
    }

    pub fn clear_uav_float(
        &mut self,
        gpu_handle: GpuDescriptorHandle,
        cpu_handle: CpuDescriptorHandle,
        resource: &Arc<dyn NativeResource>,
        values: [f32; 4],
    ) {
        self.flush_resource_barriers();
        self.command_list()
            .clear_unordered_access_view_float(gpu_handle, cpu_handle, resource, values);
        self.num_commands += 1;
    }

    pub fn resolve_subresource(
        &mut self,
        dst: &Arc<dyn NativeResource>,
        dst_subresource: u32,
        src: &Arc<dyn NativeResource>,
        src_subresource: u32,
    ) {
        self.flush_resource_barriers();
        self.command_list()
            .resolve_subresource(dst, dst_subresource, src, src_subresource);
        self.num_commands += 1;
    }
}

fn validate_subresource_range(
    desc: &TextureDesc,
    barrier: &StateTransitionDesc,
) -> DiligentResult<()> {
    if barrier.first_mip_level >= desc.mip_levels {
        return Err(DiligentError::validation(format!(
            "First mip level ({}) of '{}' is out of range",
            barrier.first_mip_level, desc.name
        )));
    }
    if barrier.mip_levels_count != REMAINING_MIP_LEVELS
        && barrier
            .first_mip_level
            .checked_add(barrier.mip_levels_count)
            .map_or(true, |end_mip| end_mip > desc.mip_levels)
    {
        return Err(DiligentError::validation(format!(
            "Invalid mip level range of '{}'",
            desc.name
        )));
    }
    if barrier.first_array_slice >= desc.array_size {
        return Err(DiligentError::validation(format!(
            "First array slice ({}) of '{}' is out of range",
            barrier.first_array_slice, desc.name
        )));
    }
    if barrier.array_slice_count != REMAINING_ARRAY_SLICES
        && barrier
            .first_array_slice
            .checked_add(barrier.array_slice_count)
            .map_or(true, |end_slice| end_slice > desc.array_size)
    {
        return Err(DiligentError::validation(format!(
            "Invalid array slice range of '{}'",
            desc.name
        )));
    }
    Ok(())
}
