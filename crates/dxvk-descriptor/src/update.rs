use std::sync::Arc;

use dxvk::{
    DescriptorUpdateMode,
    ash::vk,
    device::{DescriptorInfo, DescriptorWrite, Device},
};

use crate::SetBindings;

///Writes descriptor sets.
///
/// In [Writes](DescriptorUpdateMode::Writes) mode all writes are collected and issued with a single
/// `vkUpdateDescriptorSets` call on [flush](Self::flush), so consecutive dirty sets cost one call. In
/// [Templates](DescriptorUpdateMode::Templates) mode each set is written immediately through its update template. Sets
/// without a template always fall back to writes.
pub struct DescriptorUpdater {
    device: Arc<Device>,
    mode: DescriptorUpdateMode,
    writes: Vec<DescriptorWrite>,
}

impl DescriptorUpdater {
    pub fn new(device: &Arc<Device>) -> Self {
        DescriptorUpdater {
            device: device.clone(),
            mode: device.options.descriptor_update_mode,
            writes: Vec::new(),
        }
    }

    pub fn mode(&self) -> DescriptorUpdateMode {
        self.mode
    }

    ///Writes `infos` into `set`. `infos` holds one descriptor per binding of `bindings`, in binding order.
    pub fn write_set(&mut self, set: vk::DescriptorSet, bindings: &SetBindings, infos: &[DescriptorInfo]) {
        debug_assert_eq!(bindings.bindings.len(), infos.len());

        if let (DescriptorUpdateMode::Templates, Some(template)) = (self.mode, bindings.template) {
            self.device
                .inner
                .update_descriptor_set_with_template(set, template, infos);
            return;
        }

        self.writes
            .extend(bindings.bindings.iter().zip(infos.iter()).map(|(binding, info)| DescriptorWrite {
                set,
                binding: binding.binding,
                array_element: 0,
                ty: binding.ty,
                info: *info,
            }));
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    ///Issues all collected writes.
    pub fn flush(&mut self) {
        if self.writes.is_empty() {
            return;
        }
        self.device.inner.update_descriptor_sets(&self.writes);
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{Options, device::DeviceFeatures, testing::SoftDevice};

    use super::*;
    use crate::{BindingInfo, PipelineBindings};

    fn pipeline(device: &Arc<Device>) -> Arc<PipelineBindings> {
        let bindings = [
            BindingInfo::new(0, 0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX),
            BindingInfo::new(0, 1, 1, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::FRAGMENT),
            BindingInfo::new(1, 0, 2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::FRAGMENT),
        ];
        PipelineBindings::new(device, vk::PipelineBindPoint::GRAPHICS, &bindings, None).unwrap()
    }

    #[test]
    fn writes_are_batched_across_sets() {
        let options = Options::default().with_descriptor_update_mode(DescriptorUpdateMode::Writes);
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let pipeline = pipeline(&device);
        let mut updater = DescriptorUpdater::new(&device);

        updater.write_set(
            vk::DescriptorSet::null(),
            pipeline.set(0).unwrap(),
            &[DescriptorInfo::Null, DescriptorInfo::Null],
        );
        updater.write_set(vk::DescriptorSet::null(), pipeline.set(1).unwrap(), &[DescriptorInfo::Null]);
        assert_eq!(updater.pending_writes(), 3);
        assert_eq!(soft.descriptor_write_calls(), 0);

        updater.flush();
        updater.flush();
        assert_eq!(soft.descriptor_write_calls(), 1);
        assert_eq!(soft.descriptor_writes().len(), 3);
        assert_eq!(soft.descriptor_writes()[1].ty, vk::DescriptorType::SAMPLED_IMAGE);
    }

    #[test]
    fn templates_write_immediately() {
        let options = Options::default().with_descriptor_update_mode(DescriptorUpdateMode::Templates);
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let pipeline = pipeline(&device);
        let mut updater = DescriptorUpdater::new(&device);

        updater.write_set(
            vk::DescriptorSet::null(),
            pipeline.set(0).unwrap(),
            &[DescriptorInfo::Null, DescriptorInfo::Null],
        );
        assert_eq!(updater.pending_writes(), 0);
        assert_eq!(soft.template_updates(), 1);
        updater.flush();
        assert_eq!(soft.descriptor_write_calls(), 0);
        assert!(soft.validation_errors().is_empty());
    }
}
