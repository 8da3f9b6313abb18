use std::sync::Arc;

use log::LevelFilter;

use diligent::api::backends::null::NullDevice;
use diligent::api::native::NativeCommandQueue;
use diligent::api::root_signature::{DescriptorRangeDesc, DescriptorRangeType, RootTableDesc};
use diligent::api::shader_resource_cache::BoundObject;
use diligent::api::*;

const FRAME_COUNT: u64 = 8;

fn main() {
    env_logger::Builder::from_default_env()
        .default_format_timestamp_nanos(true)
        .filter_level(LevelFilter::Debug)
        .init();

    run().unwrap();
}

fn run() -> DiligentResult<()> {
    //
    // Create the device on the null backend. It executes nothing, but it tracks descriptors,
    // fences and recorded commands like a real device would.
    //
    let null_device = NullDevice::new();
    let create_info = EngineD3D12CreateInfo::default();
    let native_queues: Vec<Arc<dyn NativeCommandQueue>> = (0..create_info.num_command_queues)
        .map(|_| null_device.create_command_queue() as Arc<dyn NativeCommandQueue>)
        .collect();
    let device = RenderDevice::new(Arc::new(null_device.clone()), native_queues, &create_info)?;

    // Wrap all of this so that it gets dropped before the device
    {
        let mut context = device.create_device_context(0)?;

        //
        // A pipeline with a static sampler, a mutable texture and a dynamic constant buffer
        //
        let pipeline_state = device.create_pipeline_state(&PipelineStateDesc {
            name: "frame loop pipeline".to_string(),
            pipeline_type: PipelineType::Graphics,
            resource_tables: vec![
                RootTableDesc {
                    variable_type: ShaderResourceVariableType::Static,
                    ranges: vec![DescriptorRangeDesc {
                        range_type: DescriptorRangeType::Sampler,
                        num_descriptors: 1,
                    }],
                },
                RootTableDesc {
                    variable_type: ShaderResourceVariableType::Mutable,
                    ranges: vec![DescriptorRangeDesc {
                        range_type: DescriptorRangeType::Srv,
                        num_descriptors: 1,
                    }],
                },
                RootTableDesc {
                    variable_type: ShaderResourceVariableType::Dynamic,
                    ranges: vec![DescriptorRangeDesc {
                        range_type: DescriptorRangeType::Cbv,
                        num_descriptors: 1,
                    }],
                },
            ],
        })?;

        let sampler = device.create_sampler(&SamplerDesc::default())?;
        pipeline_state.set_static_resource(0, 0, BoundObject::Sampler(sampler))?;

        let texture = device.create_texture(&TextureDesc {
            name: "albedo".to_string(),
            width: 256,
            height: 256,
            mip_levels: 9,
            ..Default::default()
        })?;

        let uniform_buffer = device.create_buffer(
            &BufferDesc {
                name: "per-frame constants".to_string(),
                size_in_bytes: 16,
                bind_flags: BindFlags::UNIFORM_BUFFER,
                usage: Usage::Dynamic,
            },
            None,
        )?;

        let srb = pipeline_state.create_shader_resource_binding(true)?;
        srb.set_resource(1, 0, Some(BoundObject::Texture(texture.clone())))?;
        srb.set_resource(2, 0, Some(BoundObject::Buffer(uniform_buffer.clone())))?;

        for frame_index in 0..FRAME_COUNT {
            profiling::scope!("Frame");

            //
            // Dynamic buffers are rewritten every frame, their contents live in the context's
            // dynamic heap until the frame is finished
            //
            let color = [frame_index as f32 / FRAME_COUNT as f32, 0.0, 1.0, 1.0];
            let bytes: Vec<u8> = color.iter().flat_map(|c| c.to_ne_bytes()).collect();
            let mapped = context.map_buffer(&uniform_buffer, MapType::Write, MapFlags::DISCARD)?;
            // SAFETY: the mapped region holds the whole buffer and is not used by the GPU yet
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.as_ptr(), bytes.len());
            }
            context.unmap_buffer(&uniform_buffer, MapType::Write)?;

            context.set_pipeline_state(&pipeline_state);
            context.commit_shader_resources(&srb, ResourceStateTransitionMode::Transition)?;
            context.draw(&DrawAttribs {
                num_vertices: 3,
                ..Default::default()
            })?;

            context.finish_frame()?;
            log::info!(
                "Frame {} recorded {} commands, texture state is {}",
                frame_index,
                null_device.take_recorded_commands().len(),
                texture.state().name()
            );

            profiling::finish_frame!();
        }
    }

    device.idle_gpu();
    Ok(())
}
