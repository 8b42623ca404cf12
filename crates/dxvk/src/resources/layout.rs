use std::sync::Arc;

use ash::vk;

use crate::{
    DeviceError,
    device::{Device, SetLayoutBinding},
    util::next_cookie,
};

pub struct DescriptorSetLayout {
    pub inner: vk::DescriptorSetLayout,
    pub bindings: Vec<SetLayoutBinding>,
    pub device: Arc<Device>,
    cookie: u64,
}

impl DescriptorSetLayout {
    pub fn new(device: &Arc<Device>, bindings: Vec<SetLayoutBinding>) -> Result<Arc<Self>, DeviceError> {
        let flags = if device.features.descriptor_buffer {
            vk::DescriptorSetLayoutCreateFlags::DESCRIPTOR_BUFFER_EXT
        } else {
            vk::DescriptorSetLayoutCreateFlags::empty()
        };
        let inner = device.inner.create_descriptor_set_layout(&bindings, flags)?;
        Ok(Arc::new(DescriptorSetLayout {
            inner,
            bindings,
            device: device.clone(),
            cookie: next_cookie(),
        }))
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    ///Total number of descriptors in the set.
    pub fn descriptor_count(&self) -> u32 {
        self.bindings.iter().map(|b| b.count).sum()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.inner.destroy_descriptor_set_layout(self.inner);
    }
}

pub struct PipelineLayout {
    pub inner: vk::PipelineLayout,
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub push_constants: Option<vk::PushConstantRange>,
    pub device: Arc<Device>,
}

impl PipelineLayout {
    ///Creates the layout. Object creation failures are fatal for the caller, see [DeviceError].
    pub fn new(
        device: &Arc<Device>,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constants: Option<vk::PushConstantRange>,
    ) -> Result<Arc<Self>, DeviceError> {
        let raw_sets = set_layouts.iter().map(|s| s.inner).collect::<Vec<_>>();
        let ranges = push_constants.as_slice();
        let inner = device.inner.create_pipeline_layout(&raw_sets, ranges)?;
        Ok(Arc::new(PipelineLayout {
            inner,
            set_layouts,
            push_constants,
            device: device.clone(),
        }))
    }

    pub fn set_count(&self) -> u32 {
        self.set_layouts.len() as u32
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.device.inner.destroy_pipeline_layout(self.inner);
    }
}
