use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use diligent_base::memory::round_size_up_to_alignment_u64;
use diligent_base::Object;
use parking_lot::Mutex;

use crate::command_context::CommandContext;
use crate::descriptor_heap::DescriptorHeapAllocation;
use crate::dynamic_heap::DynamicAllocation;
use crate::native::*;
use crate::render_device::RenderDevice;
use crate::*;

/// Size granularity of constant buffers
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// A GPU buffer. Dynamic buffers that cannot be bound as SRV or UAV have no native resource of
/// their own, their contents live in the dynamic heap of the context that mapped them.
///
/// The native resource is released through the device's release queues when the buffer is dropped,
/// so a buffer may be dropped while the GPU still uses it.
pub struct Buffer {
    device: RenderDevice,
    desc: BufferDesc,
    native_resource: Option<Arc<dyn NativeResource>>,
    state: AtomicU32,
    cbv: DescriptorHeapAllocation,
    srv: DescriptorHeapAllocation,
    uav: DescriptorHeapAllocation,
    // Last dynamic allocation of every device context, indexed by context id
    dynamic_data: Mutex<Vec<DynamicAllocation>>,
}

impl Object for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("desc", &self.desc)
            .field("state", &self.state())
            .finish()
    }
}

fn validate_buffer_desc(
    desc: &BufferDesc,
    initial_data: Option<&[u8]>,
) -> DiligentResult<()> {
    if desc.size_in_bytes == 0 {
        return Err(DiligentError::validation(format!(
            "Buffer '{}': size must not be zero",
            desc.name
        )));
    }

    match desc.usage {
        Usage::Immutable => {
            if initial_data.is_none() {
                return Err(DiligentError::validation(format!(
                    "Buffer '{}': initial data must not be null as immutable buffers must be initialized at creation time",
                    desc.name
                )));
            }
        }
        Usage::Dynamic => {
            if initial_data.is_some() {
                return Err(DiligentError::validation(format!(
                    "Buffer '{}': dynamic buffers must be initialized via map_buffer()",
                    desc.name
                )));
            }
        }
        Usage::Staging => {
            if desc.bind_flags != BindFlags::NONE {
                return Err(DiligentError::validation(format!(
                    "Buffer '{}': staging buffers cannot be bound to any part of the graphics pipeline and can't have any bind flags set",
                    desc.name
                )));
            }
            if initial_data.is_some() {
                return Err(DiligentError::validation(format!(
                    "Buffer '{}': staging buffers cannot be initialized at creation time",
                    desc.name
                )));
            }
        }
        Usage::Default => {}
    }

    if let Some(data) = initial_data {
        if data.len() as u64 > desc.size_in_bytes {
            return Err(DiligentError::validation(format!(
                "Buffer '{}': initial data size ({}) exceeds the buffer size ({})",
                desc.name,
                data.len(),
                desc.size_in_bytes
            )));
        }
    }

    Ok(())
}

impl Buffer {
    pub(crate) fn new(
        device: RenderDevice,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> DiligentResult<Self> {
        validate_buffer_desc(desc, initial_data)?;

        let num_contexts = device.num_device_contexts();
        let mut buffer = Buffer {
            device: device.clone(),
            desc: desc.clone(),
            native_resource: None,
            state: AtomicU32::new(ResourceState::UNKNOWN.bits()),
            cbv: Default::default(),
            srv: Default::default(),
            uav: Default::default(),
            dynamic_data: Mutex::new(vec![DynamicAllocation::default(); num_contexts]),
        };

        let needs_native_resource = desc.usage != Usage::Dynamic
            || desc
                .bind_flags
                .intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS);

        if !needs_native_resource {
            // Lives in upload memory, which is always readable by the GPU
            buffer.set_state(ResourceState::GENERIC_READ);
            return Ok(buffer);
        }

        let mut size_in_bytes = desc.size_in_bytes;
        if desc.bind_flags.contains(BindFlags::UNIFORM_BUFFER) {
            size_in_bytes = round_size_up_to_alignment_u64(size_in_bytes, CONSTANT_BUFFER_ALIGNMENT);
        }

        let (heap_type, initial_state) = if desc.usage == Usage::Staging {
            (NativeHeapType::Readback, ResourceState::COPY_DEST)
        } else if initial_data.is_some() {
            (NativeHeapType::Default, ResourceState::COPY_DEST)
        } else {
            (NativeHeapType::Default, ResourceState::UNDEFINED)
        };

        let native_device = device.native_device();
        let native_resource = native_device.create_committed_resource(&NativeResourceDesc {
            name: desc.name.clone(),
            kind: NativeResourceKind::Buffer { size_in_bytes },
            heap_type,
            initial_state: initial_state.into(),
        })?;
        buffer.set_state(initial_state);

        if let Some(data) = initial_data {
            Self::upload_initial_data(&device, &desc.name, &native_resource, data)?;
        }

        if desc.bind_flags.contains(BindFlags::UNIFORM_BUFFER) {
            buffer.cbv = Self::create_view(&device, &native_resource, ViewKind::ConstantBuffer)?;
        }
        if desc.bind_flags.contains(BindFlags::SHADER_RESOURCE) {
            buffer.srv = Self::create_view(&device, &native_resource, ViewKind::ShaderResource)?;
        }
        if desc.bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
            buffer.uav = Self::create_view(&device, &native_resource, ViewKind::UnorderedAccess)?;
        }

        buffer.native_resource = Some(native_resource);
        Ok(buffer)
    }

    fn create_view(
        device: &RenderDevice,
        native_resource: &Arc<dyn NativeResource>,
        view_kind: ViewKind,
    ) -> DiligentResult<DescriptorHeapAllocation> {
        let descriptor = device
            .cpu_descriptor_heap(DescriptorHeapType::CbvSrvUav)
            .allocate(1);
        if descriptor.is_null() {
            return Err("Failed to allocate CPU descriptor for a buffer view".into());
        }
        device
            .native_device()
            .create_view(&**native_resource, view_kind, descriptor.cpu_handle(0));
        Ok(descriptor)
    }

    // Copies the data through a transient upload resource on queue 0
    #[profiling::function]
    fn upload_initial_data(
        device: &RenderDevice,
        name: &str,
        native_resource: &Arc<dyn NativeResource>,
        data: &[u8],
    ) -> DiligentResult<()> {
        let native_device = device.native_device();
        let upload_resource = native_device.create_committed_resource(&NativeResourceDesc {
            name: format!("Upload buffer for '{}'", name),
            kind: NativeResourceKind::Buffer {
                size_in_bytes: data.len() as u64,
            },
            heap_type: NativeHeapType::Upload,
            initial_state: NativeResourceStates::GENERIC_READ,
        })?;

        let cpu_address = upload_resource
            .cpu_address()
            .ok_or_else(|| DiligentError::from("Upload resource is not mapped"))?;
        // SAFETY: the upload resource was created with exactly data.len() bytes and nobody else
        // references it yet
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), cpu_address.as_ptr(), data.len());
        }

        let mut command_context = CommandContext::new(native_device.create_command_list()?, None);
        command_context.copy_buffer_region(
            native_resource,
            0,
            &upload_resource,
            0,
            data.len() as u64,
        );
        let command_list = command_context.close()?;

        let command_queues = device.command_queues();
        command_queues.submit_command_list(0, command_list, false)?;
        command_queues.safe_release_device_object(upload_resource, 1);
        Ok(())
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    /// `None` for dynamic buffers that live entirely in dynamic memory
    pub fn native_resource(&self) -> Option<&Arc<dyn NativeResource>> {
        self.native_resource.as_ref()
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

    /// Dynamic buffer without a native resource. Such buffers must stay in `GENERIC_READ`.
    pub fn is_dynamic_upload(&self) -> bool {
        self.native_resource.is_none()
    }

    pub fn cbv_handle(&self) -> CpuDescriptorHandle {
        self.cbv.first_cpu_handle()
    }

    pub fn srv_handle(&self) -> CpuDescriptorHandle {
        self.srv.first_cpu_handle()
    }

    pub fn uav_handle(&self) -> CpuDescriptorHandle {
        self.uav.first_cpu_handle()
    }

    /// Current dynamic allocation of the context, null if the buffer was never mapped there
    pub fn dynamic_allocation(
        &self,
        context_id: usize,
    ) -> DynamicAllocation {
        self.dynamic_data
            .lock()
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_dynamic_allocation(
        &self,
        context_id: usize,
        allocation: DynamicAllocation,
    ) {
        let mut dynamic_data = self.dynamic_data.lock();
        assert!(
            context_id < dynamic_data.len(),
            "Context id {} is out of range",
            context_id
        );
        dynamic_data[context_id] = allocation;
    }

    pub fn gpu_address(
        &self,
        context_id: usize,
    ) -> GpuVirtualAddress {
        match &self.native_resource {
            Some(native_resource) if self.desc.usage != Usage::Dynamic => {
                native_resource.gpu_virtual_address()
            }
            _ => self.dynamic_allocation(context_id).gpu_address(),
        }
    }

    /// CPU address of a staging buffer
    pub(crate) fn readback_address(&self) -> Option<NonNull<u8>> {
        self.native_resource.as_ref()?.cpu_address()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(native_resource) = self.native_resource.take() {
            let command_queues = self.device.command_queues();
            command_queues
                .safe_release_device_object(native_resource, command_queues.command_queue_mask());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::{null_resource_id, NullCommand, NullDescriptor, NullResource};
    use crate::render_device::create_null_render_device;

    #[test]
    fn test_buffer_desc_validation() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());

        let empty = BufferDesc {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(device.create_buffer(&empty, None).is_err());

        let immutable = BufferDesc {
            name: "immutable".to_string(),
            size_in_bytes: 16,
            usage: Usage::Immutable,
            bind_flags: BindFlags::VERTEX_BUFFER,
        };
        assert!(device.create_buffer(&immutable, None).is_err());

        let dynamic = BufferDesc {
            name: "dynamic".to_string(),
            size_in_bytes: 16,
            usage: Usage::Dynamic,
            bind_flags: BindFlags::UNIFORM_BUFFER,
        };
        assert!(device.create_buffer(&dynamic, Some(&[0u8; 16])).is_err());

        let staging = BufferDesc {
            name: "staging".to_string(),
            size_in_bytes: 16,
            usage: Usage::Staging,
            bind_flags: BindFlags::VERTEX_BUFFER,
        };
        assert!(device.create_buffer(&staging, None).is_err());
    }

    #[test]
    fn test_dynamic_uniform_buffer_has_no_native_resource() {
        let _ = env_logger::try_init();
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let resource_count = null_device.resource_count();

        let buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "constants".to_string(),
                    size_in_bytes: 64,
                    usage: Usage::Dynamic,
                    bind_flags: BindFlags::UNIFORM_BUFFER,
                },
                None,
            )
            .unwrap();

        assert!(buffer.is_dynamic_upload());
        assert_eq!(buffer.state(), ResourceState::GENERIC_READ);
        assert!(buffer.cbv_handle().is_null());
        assert_eq!(null_device.resource_count(), resource_count);
        assert!(buffer.dynamic_allocation(0).is_null());
    }

    #[test]
    fn test_buffer_views() {
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "structured".to_string(),
                    size_in_bytes: 100,
                    usage: Usage::Default,
                    bind_flags: BindFlags::UNIFORM_BUFFER
                        | BindFlags::SHADER_RESOURCE
                        | BindFlags::UNORDERED_ACCESS,
                },
                None,
            )
            .unwrap();

        assert_eq!(buffer.state(), ResourceState::UNDEFINED);
        let native_resource = buffer.native_resource().unwrap();
        // Constant buffers are padded to 256 bytes
        assert_eq!(native_resource.size_in_bytes(), 256);

        let resource_id = null_resource_id(&**native_resource);
        assert_eq!(
            null_device.descriptor(buffer.cbv_handle()),
            Some(NullDescriptor::View {
                resource_id,
                view_kind: ViewKind::ConstantBuffer
            })
        );
        assert_eq!(
            null_device.descriptor(buffer.srv_handle()),
            Some(NullDescriptor::View {
                resource_id,
                view_kind: ViewKind::ShaderResource
            })
        );
        assert_eq!(
            null_device.descriptor(buffer.uav_handle()),
            Some(NullDescriptor::View {
                resource_id,
                view_kind: ViewKind::UnorderedAccess
            })
        );
        assert_eq!(buffer.gpu_address(0), native_resource.gpu_virtual_address());
    }

    #[test]
    fn test_initial_data_is_copied() {
        let (null_device, queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        null_device.take_recorded_commands();

        let buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "vertices".to_string(),
                    size_in_bytes: 8,
                    usage: Usage::Immutable,
                    bind_flags: BindFlags::VERTEX_BUFFER,
                },
                Some(&[1, 2, 3, 4, 5, 6, 7, 8]),
            )
            .unwrap();

        assert_eq!(buffer.state(), ResourceState::COPY_DEST);
        assert_eq!(queues[0].submitted_command_list_count(), 1);

        let commands = null_device.take_recorded_commands();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            NullCommand::CopyBufferRegion {
                dst, num_bytes, ..
            } => {
                assert_eq!(*dst, null_resource_id(&**buffer.native_resource().unwrap()));
                assert_eq!(*num_bytes, 8);
            }
            command => panic!("Unexpected command {:?}", command),
        }
    }

    #[test]
    fn test_dropped_buffer_waits_for_gpu() {
        let (_null_device, queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let buffer = device
            .create_buffer(
                &BufferDesc {
                    name: "readback".to_string(),
                    size_in_bytes: 32,
                    usage: Usage::Staging,
                    bind_flags: BindFlags::NONE,
                },
                None,
            )
            .unwrap();
        assert!(buffer.readback_address().is_some());

        let native_resource = buffer.native_resource().unwrap().clone();
        assert!((*native_resource)
            .as_any()
            .downcast_ref::<NullResource>()
            .is_some());

        queues[0].set_auto_complete(false);
        drop(buffer);
        device.purge_release_queues(false);
        // Held by the release queue and by us
        assert_eq!(Arc::strong_count(&native_resource), 2);

        queues[0].set_auto_complete(true);
        device.idle_gpu();
        assert_eq!(Arc::strong_count(&native_resource), 1);
    }
}
