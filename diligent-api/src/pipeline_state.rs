use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use diligent_base::{Object, RefCntAutoPtr, RefCntWeakPtr};
use parking_lot::{Mutex, MutexGuard};

use crate::native::NativePipelineState;
use crate::render_device::RenderDevice;
use crate::root_signature::{DescriptorRangeType, RootSignature, RootTableDesc};
use crate::shader_resource_cache::{BoundObject, CachedResourceType, ShaderResourceCache};
use crate::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineStateDesc {
    pub name: String,
    pub pipeline_type: PipelineType,
    /// Root descriptor tables, the root index of a table is its position in this list
    pub resource_tables: Vec<RootTableDesc>,
}

/// A pipeline state and the root signature its resources are bound through. Static resources are
/// set on the pipeline state and copied into every shader resource binding created from it.
pub struct PipelineState {
    device: RenderDevice,
    desc: PipelineStateDesc,
    root_signature: RootSignature,
    native_pipeline_state: Arc<dyn NativePipelineState>,
    static_resource_cache: Mutex<ShaderResourceCache>,
    weak_self: RefCntWeakPtr<PipelineState>,
}

impl Object for PipelineState {}

impl std::fmt::Debug for PipelineState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("name", &self.desc.name)
            .field("pipeline_type", &self.desc.pipeline_type)
            .finish()
    }
}

/// Checks that `object` fits the descriptor at `offset` of a table and returns the cached type
/// and the CPU descriptor of the object
fn resolve_binding(
    range_type: DescriptorRangeType,
    variable_type: ShaderResourceVariableType,
    object: &BoundObject,
) -> DiligentResult<(CachedResourceType, CpuDescriptorHandle)> {
    let incompatible = || {
        DiligentError::validation(format!(
            "Resource '{}' can't be bound to a {:?} descriptor",
            object.name(),
            range_type
        ))
    };
    let missing_bind_flag = |flag: &str| {
        DiligentError::validation(format!(
            "Resource '{}' can't be bound as {:?} because it was not created with the {} bind flag",
            object.name(),
            range_type,
            flag
        ))
    };

    match (range_type, object) {
        (DescriptorRangeType::Cbv, BoundObject::Buffer(buffer)) => {
            if !buffer
                .desc()
                .bind_flags
                .contains(BindFlags::UNIFORM_BUFFER)
            {
                return Err(missing_bind_flag("UNIFORM_BUFFER"));
            }
            if buffer.is_dynamic_upload() && variable_type != ShaderResourceVariableType::Dynamic
            {
                return Err(DiligentError::validation(format!(
                    "Dynamic buffer '{}' without a native resource can only be bound to dynamic variables",
                    buffer.desc().name
                )));
            }
            Ok((CachedResourceType::Cbv, buffer.cbv_handle()))
        }
        (DescriptorRangeType::Srv, BoundObject::Buffer(buffer)) => {
            if !buffer
                .desc()
                .bind_flags
                .contains(BindFlags::SHADER_RESOURCE)
            {
                return Err(missing_bind_flag("SHADER_RESOURCE"));
            }
            Ok((CachedResourceType::BufSrv, buffer.srv_handle()))
        }
        (DescriptorRangeType::Uav, BoundObject::Buffer(buffer)) => {
            if !buffer
                .desc()
                .bind_flags
                .contains(BindFlags::UNORDERED_ACCESS)
            {
                return Err(missing_bind_flag("UNORDERED_ACCESS"));
            }
            Ok((CachedResourceType::BufUav, buffer.uav_handle()))
        }
        (DescriptorRangeType::Srv, BoundObject::Texture(texture)) => {
            if !texture
                .desc()
                .bind_flags
                .contains(BindFlags::SHADER_RESOURCE)
            {
                return Err(missing_bind_flag("SHADER_RESOURCE"));
            }
            Ok((CachedResourceType::TexSrv, texture.srv_handle()))
        }
        (DescriptorRangeType::Uav, BoundObject::Texture(texture)) => {
            if !texture
                .desc()
                .bind_flags
                .contains(BindFlags::UNORDERED_ACCESS)
            {
                return Err(missing_bind_flag("UNORDERED_ACCESS"));
            }
            Ok((CachedResourceType::TexUav, texture.uav_handle()))
        }
        (DescriptorRangeType::Sampler, BoundObject::Sampler(sampler)) => {
            Ok((CachedResourceType::Sampler, sampler.cpu_descriptor_handle()))
        }
        _ => Err(incompatible()),
    }
}

/// Binds `object` (or unbinds with `None`) to a slot of `cache`. Static and mutable variables can
/// be bound only once. Descriptors of non-dynamic tables are copied into the cache's shader-visible
/// space right away when it has one.
fn bind_resource(
    device: &RenderDevice,
    root_signature: &RootSignature,
    cache: &mut ShaderResourceCache,
    root_index: u32,
    offset: u32,
    object: Option<BoundObject>,
) -> DiligentResult<()> {
    let table = root_signature
        .tables()
        .get(root_index as usize)
        .ok_or_else(|| {
            DiligentError::validation(format!(
                "Root index {} is out of range. The root signature has {} tables",
                root_index,
                root_signature.tables().len()
            ))
        })?;

    let range_type = table.range_type(offset).ok_or_else(|| {
        DiligentError::validation(format!(
            "Offset {} is out of range of root table {} ({} descriptors)",
            offset,
            root_index,
            table.size()
        ))
    })?;

    let variable_type = table.variable_type();
    let current = &cache.table(root_index as usize).resource(offset).object;
    if variable_type != ShaderResourceVariableType::Dynamic {
        if let Some(current) = current {
            match &object {
                Some(object) if object.ptr_eq(current) => return Ok(()),
                _ => {
                    return Err(DiligentError::validation(format!(
                        "Non-null resource '{}' is already bound to {:?} shader variable at offset {} of root table {}. Attempting to bind another resource or null is an error and may cause unpredicted behavior. Use another shader resource binding instance or label the variable as dynamic",
                        current.name(),
                        variable_type,
                        offset,
                        root_index
                    )));
                }
            }
        }
    }

    let (resource_type, cpu_descriptor_handle) = match &object {
        Some(object) => resolve_binding(range_type, variable_type, object)?,
        None => (CachedResourceType::Unknown, CpuDescriptorHandle::default()),
    };

    if variable_type != ShaderResourceVariableType::Dynamic && !cpu_descriptor_handle.is_null() {
        if let Some(dst) = cache.shader_visible_cpu_handle(root_index as usize, offset) {
            device.native_device().copy_descriptors_simple(
                1,
                dst,
                cpu_descriptor_handle,
                table.heap_type(),
            );
        }
    }

    let resource = cache.table_mut(root_index as usize).resource_mut(offset);
    resource.resource_type = resource_type;
    resource.cpu_descriptor_handle = cpu_descriptor_handle;
    resource.object = object;
    Ok(())
}

impl PipelineState {
    pub(crate) fn new(
        device: RenderDevice,
        desc: &PipelineStateDesc,
        weak_self: &RefCntWeakPtr<PipelineState>,
    ) -> DiligentResult<Self> {
        let mut root_signature = RootSignature::new(&desc.resource_tables)?;
        root_signature.finalize(&**device.native_device())?;

        let native_pipeline_state = match root_signature.native_root_signature() {
            Some(native_root_signature) => device.native_device().create_pipeline_state(
                &desc.name,
                desc.pipeline_type,
                native_root_signature,
            )?,
            None => return Err("Root signature was not finalized".into()),
        };

        let static_resource_cache = ShaderResourceCache::new(&root_signature);
        log::debug!(
            "Created pipeline state '{}' with {} root tables",
            desc.name,
            desc.resource_tables.len()
        );

        Ok(PipelineState {
            device,
            desc: desc.clone(),
            root_signature,
            native_pipeline_state,
            static_resource_cache: Mutex::new(static_resource_cache),
            weak_self: weak_self.clone(),
        })
    }

    pub fn desc(&self) -> &PipelineStateDesc {
        &self.desc
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.desc.pipeline_type
    }

    pub fn root_signature(&self) -> &RootSignature {
        &self.root_signature
    }

    pub fn native_pipeline_state(&self) -> &Arc<dyn NativePipelineState> {
        &self.native_pipeline_state
    }

    /// Pipelines with the same resource layout can use each other's shader resource bindings
    pub fn is_compatible_with(
        &self,
        other: &PipelineState,
    ) -> bool {
        std::ptr::eq(self, other) || self.root_signature.is_compatible_with(&other.root_signature)
    }

    /// Binds a resource to a static variable
    pub fn set_static_resource(
        &self,
        root_index: u32,
        offset: u32,
        object: BoundObject,
    ) -> DiligentResult<()> {
        match self.root_signature.tables().get(root_index as usize) {
            Some(table) if table.variable_type() != ShaderResourceVariableType::Static => {
                return Err(DiligentError::validation(format!(
                    "Root table {} of pipeline '{}' is not static. Only static variables can be set through the pipeline state",
                    root_index, self.desc.name
                )));
            }
            _ => {}
        }

        let mut cache = self.static_resource_cache.lock();
        bind_resource(
            &self.device,
            &self.root_signature,
            &mut cache,
            root_index,
            offset,
            Some(object),
        )
    }

    pub fn create_shader_resource_binding(
        &self,
        init_static_resources: bool,
    ) -> DiligentResult<RefCntAutoPtr<ShaderResourceBinding>> {
        let pipeline_state = self
            .weak_self
            .lock()
            .ok_or_else(|| DiligentError::from("Pipeline state is being destroyed"))?;

        let mut cache = ShaderResourceCache::new(&self.root_signature);
        self.root_signature
            .init_resource_cache(&self.device, &mut cache)?;

        let srb = diligent_base::MakeNewRcObj::new().create(|_counters, _weak_self| {
            ShaderResourceBinding {
                pipeline_state,
                cache: Mutex::new(cache),
                static_resources_initialized: AtomicBool::new(false),
            }
        });

        if init_static_resources {
            self.initialize_static_srb_resources(&srb)?;
        }
        Ok(srb)
    }

    /// Copies the static resources of the pipeline into `srb`. Every static variable must be bound.
    pub fn initialize_static_srb_resources(
        &self,
        srb: &ShaderResourceBinding,
    ) -> DiligentResult<()> {
        if !self.is_compatible_with(srb.pipeline_state()) {
            return Err(DiligentError::validation(format!(
                "Shader resource binding is not compatible with pipeline '{}'",
                self.desc.name
            )));
        }
        if srb.static_resources_initialized() {
            log::warn!(
                "Static resources have already been initialized in this shader resource binding. The operation will be ignored"
            );
            return Ok(());
        }

        let static_cache = self.static_resource_cache.lock();
        let mut srb_cache = srb.cache.lock();
        for (table_index, table) in self.root_signature.tables().iter().enumerate() {
            if table.variable_type() != ShaderResourceVariableType::Static {
                continue;
            }

            for (offset, resource) in static_cache.table(table_index).resources().iter().enumerate() {
                let object = match &resource.object {
                    Some(object) => object.clone(),
                    None => {
                        return Err(DiligentError::validation(format!(
                            "No resource is bound to static variable at offset {} of root table {} in pipeline '{}'",
                            offset, table_index, self.desc.name
                        )));
                    }
                };
                bind_resource(
                    &self.device,
                    &self.root_signature,
                    &mut srb_cache,
                    table_index as u32,
                    offset as u32,
                    Some(object),
                )?;
            }
        }

        srb.static_resources_initialized
            .store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        let command_queues = self.device.command_queues();
        let queue_mask = command_queues.command_queue_mask();
        command_queues.safe_release_device_object(self.native_pipeline_state.clone(), queue_mask);
        if let Some(native_root_signature) = self.root_signature.native_root_signature() {
            command_queues.safe_release_device_object(native_root_signature.clone(), queue_mask);
        }
    }
}

/// Resources bound to the mutable and dynamic variables of a pipeline. Keeps the pipeline alive.
pub struct ShaderResourceBinding {
    pipeline_state: RefCntAutoPtr<PipelineState>,
    cache: Mutex<ShaderResourceCache>,
    static_resources_initialized: AtomicBool,
}

impl Object for ShaderResourceBinding {}

impl std::fmt::Debug for ShaderResourceBinding {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ShaderResourceBinding")
            .field("pipeline_state", &self.pipeline_state.desc().name)
            .field(
                "static_resources_initialized",
                &self.static_resources_initialized(),
            )
            .finish()
    }
}

impl ShaderResourceBinding {
    pub fn pipeline_state(&self) -> &PipelineState {
        &self.pipeline_state
    }

    pub fn static_resources_initialized(&self) -> bool {
        self.static_resources_initialized.load(Ordering::Acquire)
    }

    /// Binds `object` (or unbinds with `None`) to a mutable or dynamic variable
    pub fn set_resource(
        &self,
        root_index: u32,
        offset: u32,
        object: Option<BoundObject>,
    ) -> DiligentResult<()> {
        let root_signature = self.pipeline_state.root_signature();
        if let Some(table) = root_signature.tables().get(root_index as usize) {
            if table.variable_type() == ShaderResourceVariableType::Static {
                return Err(DiligentError::validation(format!(
                    "Root table {} is static. Static variables must be set through the pipeline state",
                    root_index
                )));
            }
        }

        let mut cache = self.cache.lock();
        bind_resource(
            self.pipeline_state.device(),
            root_signature,
            &mut cache,
            root_index,
            offset,
            object,
        )
    }

    pub fn resource_cache(&self) -> MutexGuard<ShaderResourceCache> {
        self.cache.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::{null_resource_id, NullDescriptor};
    use crate::native::ViewKind;
    use crate::render_device::create_null_render_device;
    use crate::root_signature::DescriptorRangeDesc;

    fn table(
        variable_type: ShaderResourceVariableType,
        range_type: DescriptorRangeType,
        num_descriptors: u32,
    ) -> RootTableDesc {
        RootTableDesc {
            variable_type,
            ranges: vec![DescriptorRangeDesc {
                range_type,
                num_descriptors,
            }],
        }
    }

    fn test_pipeline_desc() -> PipelineStateDesc {
        PipelineStateDesc {
            name: "test pipeline".to_string(),
            pipeline_type: PipelineType::Graphics,
            resource_tables: vec![
                table(
                    ShaderResourceVariableType::Static,
                    DescriptorRangeType::Sampler,
                    1,
                ),
                table(
                    ShaderResourceVariableType::Mutable,
                    DescriptorRangeType::Srv,
                    2,
                ),
                table(
                    ShaderResourceVariableType::Dynamic,
                    DescriptorRangeType::Cbv,
                    1,
                ),
            ],
        }
    }

    fn srv_texture(
        device: &RenderDevice,
        name: &str,
    ) -> RefCntAutoPtr<Texture> {
        device
            .create_texture(&TextureDesc {
                name: name.to_string(),
                width: 4,
                height: 4,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_static_resources() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&test_pipeline_desc())
            .unwrap();
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();

        // Static variables must be bound before static resources are initialized
        assert!(pipeline_state.create_shader_resource_binding(true).is_err());

        // Not a static table
        assert!(pipeline_state
            .set_static_resource(1, 0, BoundObject::Sampler(sampler.clone()))
            .is_err());
        pipeline_state
            .set_static_resource(0, 0, BoundObject::Sampler(sampler.clone()))
            .unwrap();

        let srb = pipeline_state
            .create_shader_resource_binding(true)
            .unwrap();
        assert!(srb.static_resources_initialized());
        let cache = srb.resource_cache();
        let resource = cache.table(0).resource(0);
        assert_eq!(resource.resource_type, CachedResourceType::Sampler);
        assert_eq!(
            resource.cpu_descriptor_handle,
            sampler.cpu_descriptor_handle()
        );
    }

    #[test]
    fn test_set_resource_validation() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&test_pipeline_desc())
            .unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(false)
            .unwrap();
        let texture = srv_texture(&device, "albedo");
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();

        // Out of range
        assert!(srb
            .set_resource(3, 0, Some(BoundObject::Texture(texture.clone())))
            .is_err());
        assert!(srb
            .set_resource(1, 2, Some(BoundObject::Texture(texture.clone())))
            .is_err());
        // Static table
        assert!(srb
            .set_resource(0, 0, Some(BoundObject::Sampler(sampler.clone())))
            .is_err());
        // Sampler in an SRV range
        assert!(srb
            .set_resource(1, 0, Some(BoundObject::Sampler(sampler)))
            .is_err());
        // Texture without UNIFORM_BUFFER in a CBV range
        assert!(srb
            .set_resource(2, 0, Some(BoundObject::Texture(texture.clone())))
            .is_err());

        srb.set_resource(1, 0, Some(BoundObject::Texture(texture.clone())))
            .unwrap();
        // Rebinding the same object is fine, another one is not
        srb.set_resource(1, 0, Some(BoundObject::Texture(texture.clone())))
            .unwrap();
        let other_texture = srv_texture(&device, "normal");
        assert!(srb
            .set_resource(1, 0, Some(BoundObject::Texture(other_texture.clone())))
            .is_err());
        assert!(srb.set_resource(1, 0, None).is_err());
        srb.set_resource(1, 1, Some(BoundObject::Texture(other_texture)))
            .unwrap();
    }

    #[test]
    fn test_mutable_descriptor_is_copied_on_bind() {
        let (null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let pipeline_state = device
            .create_pipeline_state(&test_pipeline_desc())
            .unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(false)
            .unwrap();
        let texture = srv_texture(&device, "albedo");

        srb.set_resource(1, 1, Some(BoundObject::Texture(texture.clone())))
            .unwrap();

        let cache = srb.resource_cache();
        let dst = cache.shader_visible_cpu_handle(1, 1).unwrap();
        assert_eq!(
            null_device.descriptor(dst),
            Some(NullDescriptor::View {
                resource_id: null_resource_id(&**texture.native_resource()),
                view_kind: ViewKind::ShaderResource,
            })
        );
    }

    #[test]
    fn test_dynamic_buffer_binding() {
        let _ = env_logger::try_init();
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let mut desc = test_pipeline_desc();
        desc.resource_tables.push(table(
            ShaderResourceVariableType::Mutable,
            DescriptorRangeType::Cbv,
            1,
        ));
        let pipeline_state = device.create_pipeline_state(&desc).unwrap();
        let srb = pipeline_state
            .create_shader_resource_binding(false)
            .unwrap();

        let constants = device
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

        // Dynamic upload buffers only go to dynamic tables
        assert!(srb
            .set_resource(3, 0, Some(BoundObject::Buffer(constants.clone())))
            .is_err());
        srb.set_resource(2, 0, Some(BoundObject::Buffer(constants.clone())))
            .unwrap();
        // Dynamic variables may be rebound and unbound freely
        srb.set_resource(2, 0, None).unwrap();
        srb.set_resource(2, 0, Some(BoundObject::Buffer(constants)))
            .unwrap();
    }

    #[test]
    fn test_compatibility_and_lifetime() {
        let (_null_device, _queues, device) =
            create_null_render_device(&EngineD3D12CreateInfo::default());
        let a = device
            .create_pipeline_state(&test_pipeline_desc())
            .unwrap();
        let b = device
            .create_pipeline_state(&test_pipeline_desc())
            .unwrap();
        let mut other_desc = test_pipeline_desc();
        other_desc.resource_tables.pop();
        let c = device.create_pipeline_state(&other_desc).unwrap();

        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));

        let srb = b.create_shader_resource_binding(false).unwrap();
        let weak_b = b.downgrade();
        drop(b);
        // The binding keeps its pipeline alive
        assert!(weak_b.lock().is_some());
        drop(srb);
        assert!(weak_b.lock().is_none());
    }
}
