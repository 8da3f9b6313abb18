use std::ptr::NonNull;

use diligent_base::RefCntAutoPtr;

use crate::buffer::CONSTANT_BUFFER_ALIGNMENT;
use crate::command_context::CommandContext;
use crate::descriptor_heap::DynamicSuballocationsManager;
use crate::dynamic_heap::{DynamicAllocation, DynamicHeap};
use crate::pipeline_state::{PipelineState, ShaderResourceBinding};
use crate::render_device::RenderDevice;
use crate::root_signature::CommitResourcesAttribs;
use crate::*;

// Alignment of staging regions used by update_buffer()
const UPDATE_BUFFER_ALIGNMENT: u64 = 16;

/// Records rendering commands and submits them to one of the device's command queues.
///
/// A device context is not thread safe, every recording thread needs its own. Transient memory
/// (dynamic buffer contents, dynamic descriptors, upload regions) is taken from the context's own
/// pools and stays valid until `finish_frame()` returns it to the device.
pub struct DeviceContext {
    device: RenderDevice,
    context_id: usize,
    queue_index: usize,
    command_context: CommandContext,
    dynamic_heap: DynamicHeap,
    pipeline_state: Option<RefCntAutoPtr<PipelineState>>,
    frame_number: u64,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("context_id", &self.context_id)
            .field("queue_index", &self.queue_index)
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

impl DeviceContext {
    pub(crate) fn new(
        device: RenderDevice,
        context_id: usize,
        queue_index: usize,
    ) -> DiligentResult<Self> {
        let create_info = device.create_info();
        let chunk_sizes = create_info.dynamic_descriptor_allocation_chunk_size;
        let dynamic_gpu_descriptor_allocators = [
            DynamicSuballocationsManager::new(
                device
                    .gpu_descriptor_heap(DescriptorHeapType::CbvSrvUav)
                    .clone(),
                chunk_sizes[0],
                format!("CBV_SRV_UAV dynamic descriptors of context {}", context_id),
            ),
            DynamicSuballocationsManager::new(
                device
                    .gpu_descriptor_heap(DescriptorHeapType::Sampler)
                    .clone(),
                chunk_sizes[1],
                format!("SAMPLER dynamic descriptors of context {}", context_id),
            ),
        ];

        let dynamic_heap = DynamicHeap::new(
            device.dynamic_memory_manager().clone(),
            format!("Dynamic heap of context {}", context_id),
            create_info.dynamic_heap_page_size,
        );

        let command_list = device.native_device().create_command_list()?;
        let command_context =
            CommandContext::new(command_list, Some(dynamic_gpu_descriptor_allocators));

        log::debug!(
            "Created device context {} on command queue {}",
            context_id,
            queue_index
        );

        Ok(DeviceContext {
            device,
            context_id,
            queue_index,
            command_context,
            dynamic_heap,
            pipeline_state: None,
            frame_number: 0,
        })
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    pub fn context_id(&self) -> usize {
        self.context_id
    }

    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    pub fn command_queue_mask(&self) -> CommandQueueMask {
        1u64 << self.queue_index
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn command_context(&mut self) -> &mut CommandContext {
        &mut self.command_context
    }

    pub fn pipeline_state(&self) -> Option<&RefCntAutoPtr<PipelineState>> {
        self.pipeline_state.as_ref()
    }

    pub fn set_pipeline_state(
        &mut self,
        pipeline_state: &RefCntAutoPtr<PipelineState>,
    ) {
        if let Some(current) = &self.pipeline_state {
            if RefCntAutoPtr::ptr_eq(current, pipeline_state) {
                return;
            }
        }

        self.command_context
            .set_pipeline_state(pipeline_state.native_pipeline_state());
        if let Some(root_signature) = pipeline_state.root_signature().native_root_signature() {
            match pipeline_state.pipeline_type() {
                PipelineType::Graphics => self
                    .command_context
                    .set_graphics_root_signature(root_signature),
                PipelineType::Compute => self
                    .command_context
                    .set_compute_root_signature(root_signature),
            }
        }
        self.pipeline_state = Some(pipeline_state.clone());
    }

    /// Binds the resources of `srb` to the current pipeline. `Transition` moves the resources
    /// into the states their variables require, `Verify` only reports resources in wrong states.
    #[profiling::function]
    pub fn commit_shader_resources(
        &mut self,
        srb: &ShaderResourceBinding,
        mode: ResourceStateTransitionMode,
    ) -> DiligentResult<()> {
        let pipeline_state = match &self.pipeline_state {
            Some(pipeline_state) => pipeline_state,
            None => {
                return Err(DiligentError::validation(
                    "No pipeline state is bound, call set_pipeline_state() before committing shader resources",
                ))
            }
        };

        if !pipeline_state.is_compatible_with(srb.pipeline_state()) {
            return Err(DiligentError::validation(format!(
                "Shader resource binding of pipeline '{}' is not compatible with the bound pipeline '{}'",
                srb.pipeline_state().desc().name,
                pipeline_state.desc().name
            )));
        }

        let root_signature = srb.pipeline_state().root_signature();
        if root_signature.has_static_tables() && !srb.static_resources_initialized() {
            return Err(DiligentError::validation(format!(
                "Static resources of a shader resource binding of pipeline '{}' are not initialized. Create the binding with init_static_resources or call initialize_static_srb_resources()",
                srb.pipeline_state().desc().name
            )));
        }

        let cache = srb.resource_cache();
        let attribs = CommitResourcesAttribs {
            device: &self.device,
            cache: &cache,
            pipeline_type: pipeline_state.pipeline_type(),
            context_id: self.context_id,
            frame_number: self.frame_number,
            validate_states: mode == ResourceStateTransitionMode::Verify,
        };
        root_signature.commit_resources(
            &mut self.command_context,
            &attribs,
            mode == ResourceStateTransitionMode::Transition,
        )
    }

    /// Transitions every resource bound to `srb` without committing anything
    pub fn transition_shader_resources(
        &mut self,
        srb: &ShaderResourceBinding,
    ) -> DiligentResult<()> {
        let cache = srb.resource_cache();
        srb.pipeline_state()
            .root_signature()
            .transition_resources(&mut self.command_context, &cache)
    }

    /// Stops at the first invalid transition, the preceding ones stay recorded
    pub fn transition_resource_states(
        &mut self,
        barriers: &[StateTransitionDesc],
    ) -> DiligentResult<()> {
        for barrier in barriers {
            self.command_context.transition_resource(barrier)?;
        }
        Ok(())
    }

    fn verify_pipeline_type(
        &self,
        pipeline_type: PipelineType,
        command: &str,
    ) -> DiligentResult<()> {
        match &self.pipeline_state {
            Some(pipeline_state) if pipeline_state.pipeline_type() == pipeline_type => Ok(()),
            Some(pipeline_state) => Err(DiligentError::validation(format!(
                "{} requires a {:?} pipeline, but '{}' is a {:?} pipeline",
                command,
                pipeline_type,
                pipeline_state.desc().name,
                pipeline_state.pipeline_type()
            ))),
            None => Err(DiligentError::validation(format!(
                "{} requires a bound pipeline state",
                command
            ))),
        }
    }

    pub fn draw(
        &mut self,
        attribs: &DrawAttribs,
    ) -> DiligentResult<()> {
        self.verify_pipeline_type(PipelineType::Graphics, "draw()")?;
        self.command_context.draw(
            attribs.num_vertices,
            attribs.num_instances,
            attribs.start_vertex_location,
            attribs.first_instance_location,
        );
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        attribs: &DrawIndexedAttribs,
    ) -> DiligentResult<()> {
        self.verify_pipeline_type(PipelineType::Graphics, "draw_indexed()")?;
        self.command_context.draw_indexed(
            attribs.num_indices,
            attribs.num_instances,
            attribs.first_index_location,
            attribs.base_vertex,
            attribs.first_instance_location,
        );
        Ok(())
    }

    pub fn dispatch_compute(
        &mut self,
        attribs: &DispatchComputeAttribs,
    ) -> DiligentResult<()> {
        self.verify_pipeline_type(PipelineType::Compute, "dispatch_compute()")?;
        self.command_context.dispatch(
            attribs.thread_group_count_x,
            attribs.thread_group_count_y,
            attribs.thread_group_count_z,
        );
        Ok(())
    }

    // Moves a buffer into COPY_DEST before it is written by a copy
    fn prepare_copy_destination(
        &mut self,
        buffer: &Buffer,
        mode: ResourceStateTransitionMode,
    ) -> DiligentResult<()> {
        let state = buffer.state();
        if !state.is_known() || state == ResourceState::COPY_DEST {
            return Ok(());
        }

        match mode {
            ResourceStateTransitionMode::Transition => {
                self.command_context
                    .transition_buffer(buffer, ResourceState::COPY_DEST)
            }
            ResourceStateTransitionMode::Verify => {
                log::error!(
                    "Buffer '{}' must be in COPY_DEST state to be updated, its state is {}",
                    buffer.desc().name,
                    state.name()
                );
                Ok(())
            }
            ResourceStateTransitionMode::None => Ok(()),
        }
    }

    /// Writes `data` at `offset` through an upload region of the dynamic heap. Only buffers with
    /// default usage can be updated this way.
    #[profiling::function]
    pub fn update_buffer(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
        mode: ResourceStateTransitionMode,
    ) -> DiligentResult<()> {
        if buffer.desc().usage != Usage::Default {
            return Err(DiligentError::validation(format!(
                "Buffer '{}': only buffers with default usage can be updated with update_buffer()",
                buffer.desc().name
            )));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > buffer.desc().size_in_bytes) {
            return Err(DiligentError::validation(format!(
                "Buffer '{}': update region of {} bytes at offset {} is out of the buffer bounds ({})",
                buffer.desc().name,
                data.len(),
                offset,
                buffer.desc().size_in_bytes
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let native_resource = match buffer.native_resource() {
            Some(native_resource) => native_resource.clone(),
            None => return Err("Buffer has no native resource".into()),
        };

        let allocation = self.dynamic_heap.allocate(
            data.len() as u64,
            UPDATE_BUFFER_ALIGNMENT,
            self.frame_number,
        );
        let upload_buffer = match allocation.buffer() {
            Some(upload_buffer) => upload_buffer.clone(),
            None => {
                return Err(format!(
                    "Failed to allocate {} bytes of upload memory",
                    data.len()
                )
                .into())
            }
        };
        allocation.write(data);

        self.prepare_copy_destination(buffer, mode)?;
        self.command_context.copy_buffer_region(
            &native_resource,
            offset,
            &upload_buffer,
            allocation.offset(),
            data.len() as u64,
        );
        Ok(())
    }

    /// Maps a buffer for CPU access.
    ///
    /// * Staging buffers map for reading and return the readback memory.
    /// * Dynamic buffers map for writing. `DISCARD` hands out a fresh region of the dynamic heap,
    ///   `NO_OVERWRITE` returns the region mapped earlier in the same frame.
    #[profiling::function]
    pub fn map_buffer(
        &mut self,
        buffer: &Buffer,
        map_type: MapType,
        map_flags: MapFlags,
    ) -> DiligentResult<NonNull<u8>> {
        let desc = buffer.desc();
        match map_type {
            MapType::Read => {
                if desc.usage != Usage::Staging {
                    return Err(DiligentError::validation(format!(
                        "Buffer '{}': only staging buffers can be mapped for reading",
                        desc.name
                    )));
                }
                buffer.readback_address().ok_or_else(|| {
                    DiligentError::from(format!("Buffer '{}' has no CPU-visible memory", desc.name))
                })
            }
            MapType::Write => {
                if desc.usage != Usage::Dynamic {
                    return Err(DiligentError::validation(format!(
                        "Buffer '{}': only dynamic buffers can be mapped for writing",
                        desc.name
                    )));
                }

                let discard = map_flags.contains(MapFlags::DISCARD);
                let no_overwrite = map_flags.contains(MapFlags::NO_OVERWRITE);
                if discard == no_overwrite {
                    return Err(DiligentError::validation(format!(
                        "Buffer '{}': dynamic buffers must be mapped with exactly one of MAP_FLAG_DISCARD and MAP_FLAG_NO_OVERWRITE",
                        desc.name
                    )));
                }

                let allocation = if discard {
                    let allocation = self.dynamic_heap.allocate(
                        desc.size_in_bytes,
                        CONSTANT_BUFFER_ALIGNMENT,
                        self.frame_number,
                    );
                    if allocation.is_null() {
                        return Err(format!(
                            "Buffer '{}': failed to allocate dynamic memory",
                            desc.name
                        )
                        .into());
                    }
                    buffer.set_dynamic_allocation(self.context_id, allocation.clone());
                    allocation
                } else {
                    let allocation = buffer.dynamic_allocation(self.context_id);
                    if allocation.is_null() || allocation.ctx_frame_number() != self.frame_number
                    {
                        return Err(DiligentError::validation(format!(
                            "Buffer '{}': MAP_FLAG_NO_OVERWRITE requires the buffer to be mapped with MAP_FLAG_DISCARD earlier in the same frame",
                            desc.name
                        )));
                    }
                    allocation
                };

                allocation.cpu_address().ok_or_else(|| {
                    DiligentError::from(format!(
                        "Dynamic memory of buffer '{}' is not CPU-visible",
                        desc.name
                    ))
                })
            }
            MapType::ReadWrite => Err(DiligentError::validation(format!(
                "Buffer '{}': MAP_READ_WRITE is not supported",
                desc.name
            ))),
        }
    }

    /// Ends CPU access. Dynamic buffers that own a native resource get the mapped region copied
    /// into it.
    pub fn unmap_buffer(
        &mut self,
        buffer: &Buffer,
        map_type: MapType,
    ) -> DiligentResult<()> {
        if map_type != MapType::Write || buffer.desc().usage != Usage::Dynamic {
            return Ok(());
        }

        let native_resource = match buffer.native_resource() {
            Some(native_resource) => native_resource.clone(),
            None => return Ok(()),
        };

        let allocation: DynamicAllocation = buffer.dynamic_allocation(self.context_id);
        let upload_buffer = match allocation.buffer() {
            Some(upload_buffer) => upload_buffer.clone(),
            None => {
                return Err(DiligentError::validation(format!(
                    "Buffer '{}' is not mapped in device context {}",
                    buffer.desc().name,
                    self.context_id
                )))
            }
        };

        self.prepare_copy_destination(buffer, ResourceStateTransitionMode::Transition)?;
        self.command_context.copy_buffer_region(
            &native_resource,
            0,
            &upload_buffer,
            allocation.offset(),
            buffer.desc().size_in_bytes,
        );
        Ok(())
    }

    /// Submits the recorded commands and starts a new command list. Does nothing if nothing was
    /// recorded.
    #[profiling::function]
    pub fn flush(&mut self) -> DiligentResult<()> {
        if self.command_context.num_commands() == 0
            && self.command_context.pending_barrier_count() == 0
        {
            return Ok(());
        }

        let new_command_list = self.device.native_device().create_command_list()?;
        let command_list = self.command_context.close()?;
        self.device
            .command_queues()
            .submit_command_list(self.queue_index, command_list, true)?;
        self.command_context.reset(new_command_list);
        self.pipeline_state = None;
        Ok(())
    }

    /// Submits the frame and returns this frame's dynamic descriptors and memory to the device.
    /// They are reused once the queue is done with them.
    #[profiling::function]
    pub fn finish_frame(&mut self) -> DiligentResult<()> {
        self.flush()?;

        let queue_mask = self.command_queue_mask();
        self.command_context.release_dynamic_descriptors(queue_mask);
        self.dynamic_heap.release_allocated_pages(queue_mask);
        self.frame_number += 1;

        self.device.purge_release_queues(false);
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!(
                "Failed to flush device context {} on drop: {}",
                self.context_id,
                e
            );
        }

        let queue_mask = self.command_queue_mask();
        self.command_context.release_dynamic_descriptors(queue_mask);
        self.dynamic_heap.release_allocated_pages(queue_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::{null_resource_id, NullBarrier, NullCommand};
    use crate::pipeline_state::PipelineStateDesc;
    use crate::render_device::create_null_render_device;
    use crate::root_signature::{DescriptorRangeDesc, DescriptorRangeType, RootTableDesc};
    use crate::shader_resource_cache::BoundObject;

    fn table(
        variable_type: ShaderResourceVariableType,
        range_type: DescriptorRangeType,
    ) -> RootTableDesc {
        RootTableDesc {
            variable_type,
            ranges: vec![DescriptorRangeDesc {
                range_type,
                num_descriptors: 1,
            }],
        }
    }

    fn graphics_pipeline_desc() -> PipelineStateDesc {
        PipelineStateDesc {
            name: "graphics".to_string(),
            pipeline_type: PipelineType::Graphics,
            resource_tables: vec![
                table(ShaderResourceVariableType::Mutable, DescriptorRangeType::Srv),
                table(ShaderResourceVariableType::Dynamic, DescriptorRangeType::Cbv),
            ],
        }
    }

    fn srv_texture(device: &RenderDevice) -> RefCntAutoPtr<Texture> {
        device
            .create_texture(&TextureDesc {
                name: "albedo".to_string(),
                width: 8,
                height: 8,
                ..Default::default()
            })
            .unwrap()
    }

    fn dynamic_uniform_buffer(device: &RenderDevice) -> RefCntAutoPtr<Buffer> {
        device
            .create_buffer(
                &BufferDesc {
                    name: "constants".to_string(),
                    size_in_bytes: 64,
                    bind_flags: BindFlags::UNIFORM_BUFFER,
                    usage: Usage::Dynamic,
                },
                None,
            )
            .unwrap()
    }

    fn write_mapped(
        ptr: NonNull<u8>,
        data: &[u8],
    ) {
        // SAFETY: the mapped region is at least as large as the buffer
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
    }

    #[test]
    fn test_commit_requires_pipeline() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&graphics_pipeline_desc())
            .unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(true)
            .unwrap();

        let mut context = device.create_device_context(0).unwrap();
        assert!(context
            .commit_shader_resources(&srb, ResourceStateTransitionMode::Transition)
            .is_err());
        assert!(context.draw(&DrawAttribs::default()).is_err());
    }

    #[test]
    fn test_commit_rejects_incompatible_srb() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&graphics_pipeline_desc())
            .unwrap();
        let other_pipeline_state = device
            .create_pipeline_state(&PipelineStateDesc {
                name: "other".to_string(),
                pipeline_type: PipelineType::Graphics,
                resource_tables: vec![table(
                    ShaderResourceVariableType::Mutable,
                    DescriptorRangeType::Uav,
                )],
            })
            .unwrap();
        let other_srb = other_pipeline_state
            .create_shader_resource_binding(true)
            .unwrap();

        let mut context = device.create_device_context(0).unwrap();
        context.set_pipeline_state(&pipeline_state);
        assert!(context
            .commit_shader_resources(&other_srb, ResourceStateTransitionMode::None)
            .is_err());
    }

    #[test]
    fn test_commit_and_draw() {
        let _ = env_logger::try_init();
        let (null_device, queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&graphics_pipeline_desc())
            .unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(true)
            .unwrap();
        let texture = srv_texture(&device);
        let constants = dynamic_uniform_buffer(&device);
        srb.set_resource(0, 0, Some(BoundObject::Texture(texture.clone())))
            .unwrap();
        srb.set_resource(1, 0, Some(BoundObject::Buffer(constants.clone())))
            .unwrap();

        let mut context = device.create_device_context(0).unwrap();
        null_device.take_recorded_commands();

        let mapped = context
            .map_buffer(&constants, MapType::Write, MapFlags::DISCARD)
            .unwrap();
        write_mapped(mapped, &[7u8; 64]);
        context.unmap_buffer(&constants, MapType::Write).unwrap();

        context.set_pipeline_state(&pipeline_state);
        context
            .commit_shader_resources(&srb, ResourceStateTransitionMode::Transition)
            .unwrap();
        context.draw(&DrawAttribs::default()).unwrap();
        assert_eq!(texture.state(), ResourceState::SHADER_RESOURCE);

        let commands = null_device.take_recorded_commands();
        assert!(matches!(commands[0], NullCommand::SetPipelineState(_)));
        assert!(matches!(
            commands[1],
            NullCommand::SetGraphicsRootSignature(_)
        ));
        assert!(matches!(commands[2], NullCommand::SetDescriptorHeaps(_)));

        let bound_tables: Vec<u32> = commands
            .iter()
            .filter_map(|command| match command {
                NullCommand::SetGraphicsRootDescriptorTable { root_index, .. } => {
                    Some(*root_index)
                }
                _ => None,
            })
            .collect();
        assert_eq!(bound_tables, vec![0, 1]);

        // The texture transition is flushed right before the draw
        let texture_id = null_resource_id(&**texture.native_resource());
        let len = commands.len();
        match &commands[len - 2] {
            NullCommand::ResourceBarriers(barriers) => {
                assert_eq!(barriers.len(), 1);
                assert!(matches!(
                    barriers[0],
                    NullBarrier::Transition { resource_id, .. } if resource_id == texture_id
                ));
            }
            command => panic!("Expected resource barriers, got {:?}", command),
        }
        assert!(matches!(commands[len - 1], NullCommand::Draw { .. }));

        context.flush().unwrap();
        assert_eq!(queues[0].submitted_command_list_count(), 1);
    }

    #[test]
    fn test_dynamic_buffer_must_be_mapped_in_current_frame() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&graphics_pipeline_desc())
            .unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(true)
            .unwrap();
        let constants = dynamic_uniform_buffer(&device);
        srb.set_resource(0, 0, Some(BoundObject::Texture(srv_texture(&device))))
            .unwrap();
        srb.set_resource(1, 0, Some(BoundObject::Buffer(constants.clone())))
            .unwrap();

        let mut context = device.create_device_context(0).unwrap();
        context.set_pipeline_state(&pipeline_state);
        assert!(context
            .commit_shader_resources(&srb, ResourceStateTransitionMode::None)
            .is_err());

        context
            .map_buffer(&constants, MapType::Write, MapFlags::DISCARD)
            .unwrap();
        context
            .commit_shader_resources(&srb, ResourceStateTransitionMode::None)
            .unwrap();

        context.finish_frame().unwrap();
        context.set_pipeline_state(&pipeline_state);
        assert!(context
            .commit_shader_resources(&srb, ResourceStateTransitionMode::None)
            .is_err());
    }

    #[test]
    fn test_verify_mode_does_not_transition() {
        let _ = env_logger::try_init();
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&PipelineStateDesc {
                name: "srv only".to_string(),
                pipeline_type: PipelineType::Graphics,
                resource_tables: vec![table(
                    ShaderResourceVariableType::Mutable,
                    DescriptorRangeType::Srv,
                )],
            })
            .unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(true)
            .unwrap();
        let texture = srv_texture(&device);
        srb.set_resource(0, 0, Some(BoundObject::Texture(texture.clone())))
            .unwrap();

        let mut context = device.create_device_context(0).unwrap();
        null_device.take_recorded_commands();
        context.set_pipeline_state(&pipeline_state);
        context
            .commit_shader_resources(&srb, ResourceStateTransitionMode::Verify)
            .unwrap();
        context.draw(&DrawAttribs::default()).unwrap();

        assert_eq!(texture.state(), ResourceState::UNDEFINED);
        assert!(!null_device
            .take_recorded_commands()
            .iter()
            .any(|command| matches!(command, NullCommand::ResourceBarriers(_))));
    }

    #[test]
    fn test_transition_resource_states() {
        let _ = env_logger::try_init();
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "particles".to_string(),
                    size_in_bytes: 1024,
                    bind_flags: BindFlags::UNORDERED_ACCESS,
                    usage: Usage::Default,
                },
                None,
            )
            .unwrap();
        let buffer_id = null_resource_id(&**buffer.native_resource().unwrap());

        let mut context = device.create_device_context(0).unwrap();
        null_device.take_recorded_commands();

        let to_uav = StateTransitionDesc::buffer(
            &buffer,
            ResourceState::UNKNOWN,
            ResourceState::UNORDERED_ACCESS,
            true,
        );
        context.transition_resource_states(&[to_uav]).unwrap();
        assert_eq!(buffer.state(), ResourceState::UNORDERED_ACCESS);

        // UAV to UAV keeps the state and orders the accesses
        context.transition_resource_states(&[to_uav]).unwrap();
        context.flush().unwrap();

        let commands = null_device.take_recorded_commands();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            NullCommand::ResourceBarriers(barriers) => {
                assert_eq!(barriers.len(), 2);
                assert!(matches!(
                    barriers[0],
                    NullBarrier::Transition { resource_id, .. } if resource_id == buffer_id
                ));
                assert_eq!(
                    barriers[1],
                    NullBarrier::Uav {
                        resource_id: Some(buffer_id)
                    }
                );
            }
            command => panic!("Expected resource barriers, got {:?}", command),
        }
    }

    #[test]
    fn test_read_only_states_are_combined() {
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let texture = srv_texture(&device);
        let mut context = device.create_device_context(0).unwrap();

        context
            .transition_resource_states(&[
                StateTransitionDesc::texture(
                    &texture,
                    ResourceState::UNKNOWN,
                    ResourceState::SHADER_RESOURCE,
                    true,
                ),
                StateTransitionDesc::texture(
                    &texture,
                    ResourceState::UNKNOWN,
                    ResourceState::COPY_SOURCE,
                    true,
                ),
            ])
            .unwrap();
        assert_eq!(
            texture.state(),
            ResourceState::SHADER_RESOURCE | ResourceState::COPY_SOURCE
        );
    }

    #[test]
    fn test_split_barrier_cannot_update_state() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let texture = srv_texture(&device);
        let mut context = device.create_device_context(0).unwrap();

        let begin = StateTransitionDesc::texture(
            &texture,
            ResourceState::UNKNOWN,
            ResourceState::SHADER_RESOURCE,
            true,
        )
        .with_transition_type(StateTransitionType::Begin);
        assert!(context.transition_resource_states(&[begin]).is_err());
        assert_eq!(texture.state(), ResourceState::UNDEFINED);
        assert_eq!(context.command_context().pending_barrier_count(), 0);
    }

    #[test]
    fn test_map_buffer_validation() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let constants = dynamic_uniform_buffer(&device);
        let default_buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "vertices".to_string(),
                    size_in_bytes: 128,
                    bind_flags: BindFlags::VERTEX_BUFFER,
                    usage: Usage::Default,
                },
                None,
            )
            .unwrap();
        let mut context = device.create_device_context(0).unwrap();

        assert!(context
            .map_buffer(&constants, MapType::Read, MapFlags::NONE)
            .is_err());
        assert!(context
            .map_buffer(&constants, MapType::ReadWrite, MapFlags::DISCARD)
            .is_err());
        assert!(context
            .map_buffer(&constants, MapType::Write, MapFlags::NONE)
            .is_err());
        assert!(context
            .map_buffer(
                &constants,
                MapType::Write,
                MapFlags::DISCARD | MapFlags::NO_OVERWRITE
            )
            .is_err());
        assert!(context
            .map_buffer(&constants, MapType::Write, MapFlags::NO_OVERWRITE)
            .is_err());
        assert!(context
            .map_buffer(&default_buffer, MapType::Write, MapFlags::DISCARD)
            .is_err());

        let discarded = context
            .map_buffer(&constants, MapType::Write, MapFlags::DISCARD)
            .unwrap();
        let not_overwritten = context
            .map_buffer(&constants, MapType::Write, MapFlags::NO_OVERWRITE)
            .unwrap();
        assert_eq!(discarded, not_overwritten);
        assert_eq!(
            constants.dynamic_allocation(context.context_id()).offset() % CONSTANT_BUFFER_ALIGNMENT,
            0
        );
    }

    #[test]
    fn test_map_staging_buffer_for_reading() {
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let readback = device
            .create_buffer(
                &BufferDesc {
                    name: "readback".to_string(),
                    size_in_bytes: 32,
                    bind_flags: BindFlags::NONE,
                    usage: Usage::Staging,
                },
                None,
            )
            .unwrap();
        let mut context = device.create_device_context(0).unwrap();

        assert!(context
            .map_buffer(&readback, MapType::Write, MapFlags::DISCARD)
            .is_err());
        assert!(context
            .map_buffer(&readback, MapType::Read, MapFlags::NONE)
            .is_ok());
        context.unmap_buffer(&readback, MapType::Read).unwrap();
    }

    #[test]
    fn test_update_buffer() {
        let _ = env_logger::try_init();
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "instances".to_string(),
                    size_in_bytes: 256,
                    bind_flags: BindFlags::VERTEX_BUFFER,
                    usage: Usage::Default,
                },
                None,
            )
            .unwrap();
        let buffer_id = null_resource_id(&**buffer.native_resource().unwrap());
        let mut context = device.create_device_context(0).unwrap();
        null_device.take_recorded_commands();

        assert!(context
            .update_buffer(&buffer, 240, &[0u8; 32], ResourceStateTransitionMode::Transition)
            .is_err());
        assert!(context
            .update_buffer(&buffer, u64::MAX - 8, &[0u8; 32], ResourceStateTransitionMode::Transition)
            .is_err());

        context
            .update_buffer(&buffer, 16, &[1u8; 32], ResourceStateTransitionMode::Transition)
            .unwrap();
        assert_eq!(buffer.state(), ResourceState::COPY_DEST);

        let copies: Vec<_> = null_device
            .take_recorded_commands()
            .into_iter()
            .filter(|command| matches!(command, NullCommand::CopyBufferRegion { .. }))
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(matches!(
            copies[0],
            NullCommand::CopyBufferRegion {
                dst,
                dst_offset: 16,
                num_bytes: 32,
                ..
            } if dst == buffer_id
        ));
    }

    #[test]
    fn test_pipeline_type_must_match_command() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let compute_pipeline = device
            .create_pipeline_state(&PipelineStateDesc {
                name: "compute".to_string(),
                pipeline_type: PipelineType::Compute,
                resource_tables: vec![table(
                    ShaderResourceVariableType::Mutable,
                    DescriptorRangeType::Uav,
                )],
            })
            .unwrap();
        let mut context = device.create_device_context(0).unwrap();
        context.set_pipeline_state(&compute_pipeline);

        assert!(context.draw(&DrawAttribs::default()).is_err());
        assert!(context
            .draw_indexed(&DrawIndexedAttribs::default())
            .is_err());
        context
            .dispatch_compute(&DispatchComputeAttribs::default())
            .unwrap();
    }

    #[test]
    fn test_flush_skips_empty_command_lists() {
        let (_null_device, queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let texture = srv_texture(&device);
        let mut context = device.create_device_context(0).unwrap();

        context.flush().unwrap();
        assert_eq!(queues[0].submitted_command_list_count(), 0);

        context
            .transition_resource_states(&[StateTransitionDesc::texture(
                &texture,
                ResourceState::UNKNOWN,
                ResourceState::SHADER_RESOURCE,
                true,
            )])
            .unwrap();
        context.flush().unwrap();
        assert_eq!(queues[0].submitted_command_list_count(), 1);
    }

    #[test]
    fn test_finish_frame_returns_dynamic_pages() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let constants = dynamic_uniform_buffer(&device);
        let mut context = device.create_device_context(0).unwrap();
        let manager = device.dynamic_memory_manager().clone();
        assert_eq!(manager.available_page_count(), 1);

        context
            .map_buffer(&constants, MapType::Write, MapFlags::DISCARD)
            .unwrap();
        assert_eq!(manager.available_page_count(), 0);

        context.finish_frame().unwrap();
        assert_eq!(context.frame_number(), 1);
        // The page may still be used by the last submitted command list
        assert_eq!(manager.available_page_count(), 0);

        device.idle_gpu();
        assert_eq!(manager.available_page_count(), 1);
    }
}
