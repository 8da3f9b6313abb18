use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use diligent_base::Object;

use crate::descriptor_heap::DescriptorHeapAllocation;
use crate::native::*;
use crate::render_device::RenderDevice;
use crate::*;

fn max_mip_levels(
    width: u32,
    height: u32,
) -> u32 {
    32 - width.max(height).leading_zeros()
}

/// A 2D texture (or texture array) in GPU-local memory, with one default view per bind flag.
/// Like buffers, the native resource is released through the device's release queues.
pub struct Texture {
    device: RenderDevice,
    desc: TextureDesc,
    native_resource: Arc<dyn NativeResource>,
    state: AtomicU32,
    srv: DescriptorHeapAllocation,
    uav: DescriptorHeapAllocation,
    rtv: DescriptorHeapAllocation,
    dsv: DescriptorHeapAllocation,
}

impl Object for Texture {}

impl std::fmt::Debug for Texture {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("desc", &self.desc)
            .field("state", &self.state())
            .finish()
    }
}

fn validate_texture_desc(desc: &TextureDesc) -> DiligentResult<()> {
    if desc.width == 0 || desc.height == 0 || desc.array_size == 0 {
        return Err(DiligentError::validation(format!(
            "Texture '{}': width, height and array size must not be zero ({}x{}x{})",
            desc.name, desc.width, desc.height, desc.array_size
        )));
    }

    let max_mips = max_mip_levels(desc.width, desc.height);
    if desc.mip_levels == 0 || desc.mip_levels > max_mips {
        return Err(DiligentError::validation(format!(
            "Texture '{}': mip level count ({}) must be between 1 and {}",
            desc.name, desc.mip_levels, max_mips
        )));
    }

    if desc
        .bind_flags
        .contains(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL)
    {
        return Err(DiligentError::validation(format!(
            "Texture '{}': a texture can't be both a render target and a depth-stencil buffer",
            desc.name
        )));
    }

    if desc.usage == Usage::Dynamic || desc.usage == Usage::Staging {
        return Err(DiligentError::validation(format!(
            "Texture '{}': only immutable and default textures are supported",
            desc.name
        )));
    }

    Ok(())
}

impl Texture {
    pub(crate) fn new(
        device: RenderDevice,
        desc: &TextureDesc,
    ) -> DiligentResult<Self> {
        validate_texture_desc(desc)?;

        let native_resource = device
            .native_device()
            .create_committed_resource(&NativeResourceDesc {
                name: desc.name.clone(),
                kind: NativeResourceKind::Texture2D {
                    width: desc.width,
                    height: desc.height,
                    array_size: desc.array_size,
                    mip_levels: desc.mip_levels,
                },
                heap_type: NativeHeapType::Default,
                initial_state: NativeResourceStates::COMMON,
            })?;

        let mut texture = Texture {
            device: device.clone(),
            desc: desc.clone(),
            native_resource: native_resource.clone(),
            state: AtomicU32::new(ResourceState::UNDEFINED.bits()),
            srv: Default::default(),
            uav: Default::default(),
            rtv: Default::default(),
            dsv: Default::default(),
        };

        let views = [
            (BindFlags::SHADER_RESOURCE, ViewKind::ShaderResource, DescriptorHeapType::CbvSrvUav),
            (BindFlags::UNORDERED_ACCESS, ViewKind::UnorderedAccess, DescriptorHeapType::CbvSrvUav),
            (BindFlags::RENDER_TARGET, ViewKind::RenderTarget, DescriptorHeapType::Rtv),
            (BindFlags::DEPTH_STENCIL, ViewKind::DepthStencil, DescriptorHeapType::Dsv),
        ];
        for (bind_flag, view_kind, heap_type) in views.iter() {
            if !desc.bind_flags.contains(*bind_flag) {
                continue;
            }

            let descriptor = device.cpu_descriptor_heap(*heap_type).allocate(1);
            if descriptor.is_null() {
                return Err(format!(
                    "Texture '{}': failed to allocate a {} descriptor",
                    desc.name,
                    heap_type.literal_name()
                )
                .into());
            }
            device
                .native_device()
                .create_view(&*native_resource, *view_kind, descriptor.cpu_handle(0));

            match view_kind {
                ViewKind::ShaderResource => texture.srv = descriptor,
                ViewKind::UnorderedAccess => texture.uav = descriptor,
                ViewKind::RenderTarget => texture.rtv = descriptor,
                ViewKind::DepthStencil => texture.dsv = descriptor,
                ViewKind::ConstantBuffer => unreachable!(),
            }
        }

        Ok(texture)
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    pub fn native_resource(&self) -> &Arc<dyn NativeResource> {
        &self.native_resource
    }

    pub fn state(&self) -> ResourceState {
        ResourceState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(
        &self,
        state: ResourceState,
    ) {
        self.state.store(state.bits(), Ordering::Release);
    }

    /// Index of a single subresource as used in transition barriers
    pub fn subresource_index(
        &self,
        mip_level: u32,
        array_slice: u32,
    ) -> u32 {
        mip_level + array_slice * self.desc.mip_levels
    }

    pub fn srv_handle(&self) -> CpuDescriptorHandle {
        self.srv.first_cpu_handle()
    }

    pub fn uav_handle(&self) -> CpuDescriptorHandle {
        self.uav.first_cpu_handle()
    }

    pub fn rtv_handle(&self) -> CpuDescriptorHandle {
        self.rtv.first_cpu_handle()
    }

    pub fn dsv_handle(&self) -> CpuDescriptorHandle {
        self.dsv.first_cpu_handle()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // The field's own reference goes away right after, the release queue keeps the last one
        let command_queues = self.device.command_queues();
        command_queues.safe_release_device_object(
            self.native_resource.clone(),
            command_queues.command_queue_mask(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::{null_resource_id, NullDescriptor};
    use crate::render_device::create_null_render_device;

    #[test]
    fn test_max_mip_levels() {
        assert_eq!(max_mip_levels(1, 1), 1);
        assert_eq!(max_mip_levels(256, 256), 9);
        assert_eq!(max_mip_levels(300, 17), 9);
    }

    #[test]
    fn test_texture_desc_validation() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());

        let too_many_mips = TextureDesc {
            name: "mips".to_string(),
            width: 16,
            height: 16,
            mip_levels: 6,
            ..Default::default()
        };
        assert!(device.create_texture(&too_many_mips).is_err());

        let rt_and_ds = TextureDesc {
            name: "rt_and_ds".to_string(),
            width: 16,
            height: 16,
            bind_flags: BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL,
            ..Default::default()
        };
        assert!(device.create_texture(&rt_and_ds).is_err());

        let dynamic = TextureDesc {
            name: "dynamic".to_string(),
            usage: Usage::Dynamic,
            ..Default::default()
        };
        assert!(device.create_texture(&dynamic).is_err());
    }

    #[test]
    fn test_texture_views() {
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let texture = device
            .create_texture(&TextureDesc {
                name: "color".to_string(),
                width: 64,
                height: 32,
                mip_levels: 4,
                array_size: 2,
                bind_flags: BindFlags::SHADER_RESOURCE | BindFlags::RENDER_TARGET,
                usage: Usage::Default,
            })
            .unwrap();

        assert_eq!(texture.state(), ResourceState::UNDEFINED);
        assert!(texture.uav_handle().is_null());
        assert!(texture.dsv_handle().is_null());
        assert_eq!(texture.subresource_index(1, 1), 5);

        let resource_id = null_resource_id(&**texture.native_resource());
        assert_eq!(
            null_device.descriptor(texture.srv_handle()),
            Some(NullDescriptor::View {
                resource_id,
                view_kind: ViewKind::ShaderResource
            })
        );
        assert_eq!(
            null_device.descriptor(texture.rtv_handle()),
            Some(NullDescriptor::View {
                resource_id,
                view_kind: ViewKind::RenderTarget
            })
        );
    }
}
