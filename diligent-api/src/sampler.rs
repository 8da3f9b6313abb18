use diligent_base::Object;

use crate::descriptor_heap::DescriptorHeapAllocation;
use crate::render_device::RenderDevice;
use crate::*;

/// Sampler state living in a CPU sampler descriptor heap
pub struct Sampler {
    desc: SamplerDesc,
    descriptor: DescriptorHeapAllocation,
}

impl Object for Sampler {}

impl std::fmt::Debug for Sampler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("desc", &self.desc)
            .field("descriptor", &self.descriptor.first_cpu_handle())
            .finish()
    }
}

impl Sampler {
    pub(crate) fn new(
        device: &RenderDevice,
        desc: &SamplerDesc,
    ) -> DiligentResult<Self> {
        let descriptor = device
            .cpu_descriptor_heap(DescriptorHeapType::Sampler)
            .allocate(1);
        if descriptor.is_null() {
            return Err(format!("Sampler '{}': failed to allocate a descriptor", desc.name).into());
        }
        device.native_device().create_sampler(descriptor.cpu_handle(0));

        Ok(Sampler {
            desc: desc.clone(),
            descriptor,
        })
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    pub fn cpu_descriptor_handle(&self) -> CpuDescriptorHandle {
        self.descriptor.first_cpu_handle()
    }
}
