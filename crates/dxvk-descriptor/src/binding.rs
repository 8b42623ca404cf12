use std::sync::Arc;

use dxvk::{
    ash::vk,
    device::{DescriptorInfo, Device, SetLayoutBinding, TemplateEntry},
    resources::{Buffer, BufferSlice, BufferView, DescriptorSetLayout, ImageView, PipelineLayout, Sampler},
    util::next_cookie,
    DescriptorUpdateMode,
};
use dxvk_commands::{Access, CommandList};
use smallvec::SmallVec;

use crate::DescriptorError;

///Resource bound to a slot of the [DescriptorState](crate::DescriptorState).
#[derive(Clone, Default)]
pub enum ResourceSlot {
    ///Nothing bound. Written as null descriptor.
    #[default]
    Empty,
    Buffer(BufferSlice),
    Image {
        view: Arc<ImageView>,
        layout: vk::ImageLayout,
    },
    Sampler(Arc<Sampler>),
    CombinedImageSampler {
        view: Arc<ImageView>,
        layout: vk::ImageLayout,
        sampler: Arc<Sampler>,
    },
    TexelBuffer(Arc<BufferView>),
}

impl ResourceSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, ResourceSlot::Empty)
    }

    pub fn references_buffer(&self, buffer: &Buffer) -> bool {
        match self {
            ResourceSlot::Buffer(slice) => slice.buffer.cookie() == buffer.cookie(),
            ResourceSlot::TexelBuffer(view) => view.buffer.cookie() == buffer.cookie(),
            _ => false,
        }
    }

    ///True if the resource can be written into a descriptor of type `ty`.
    pub fn matches_type(&self, ty: vk::DescriptorType) -> bool {
        match self {
            ResourceSlot::Empty => true,
            ResourceSlot::Buffer(_) => matches!(
                ty,
                vk::DescriptorType::UNIFORM_BUFFER
                    | vk::DescriptorType::STORAGE_BUFFER
                    | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                    | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            ),
            ResourceSlot::Image { .. } => {
                matches!(ty, vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::STORAGE_IMAGE)
            }
            ResourceSlot::Sampler(_) => ty == vk::DescriptorType::SAMPLER,
            ResourceSlot::CombinedImageSampler { .. } => ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ResourceSlot::TexelBuffer(_) => matches!(
                ty,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
            ),
        }
    }

    ///Builds the descriptor for this resource and tracks everything the descriptor references in `list`.
    ///
    /// In the descriptor buffer model buffers are referenced by address. A resource that does not match `ty` is
    /// written as null descriptor.
    pub fn resolve(
        &self,
        ty: vk::DescriptorType,
        descriptor_buffer: bool,
        list: &mut CommandList,
        access: Access,
    ) -> Result<DescriptorInfo, DescriptorError> {
        if !self.matches_type(ty) {
            #[cfg(feature = "logging")]
            log::warn!("Resource bound to {:?} binding does not match, writing null descriptor", ty);
            return Ok(DescriptorInfo::Null);
        }

        let info = match self {
            ResourceSlot::Empty => DescriptorInfo::Null,
            ResourceSlot::Buffer(slice) => {
                list.track(&slice.buffer, access);
                list.track(&slice.buffer.storage(), access);
                let handle = slice.handle();
                if descriptor_buffer {
                    DescriptorInfo::Address {
                        address: handle.address,
                        range: handle.length,
                    }
                } else {
                    DescriptorInfo::Buffer {
                        buffer: handle.handle,
                        offset: handle.offset,
                        range: handle.length,
                    }
                }
            }
            ResourceSlot::Image { view, layout } => {
                list.track(view, access);
                list.track(&view.image, access);
                DescriptorInfo::Image {
                    sampler: vk::Sampler::null(),
                    view: view.handle(),
                    layout: *layout,
                }
            }
            ResourceSlot::Sampler(sampler) => {
                list.track(sampler, Access::empty());
                DescriptorInfo::Image {
                    sampler: sampler.inner,
                    view: vk::ImageView::null(),
                    layout: vk::ImageLayout::UNDEFINED,
                }
            }
            ResourceSlot::CombinedImageSampler { view, layout, sampler } => {
                list.track(view, access);
                list.track(&view.image, access);
                list.track(sampler, Access::empty());
                DescriptorInfo::Image {
                    sampler: sampler.inner,
                    view: view.handle(),
                    layout: *layout,
                }
            }
            ResourceSlot::TexelBuffer(view) => {
                let raw = view.view()?;
                list.track(view, access);
                list.track(&view.buffer, access);
                list.track(&raw, access);
                DescriptorInfo::TexelBuffer(raw.handle)
            }
        };
        Ok(info)
    }
}

///Maps shader stages to the pipeline stages they execute in.
pub fn shader_stages_to_pipeline(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags2 {
    let mut result = vk::PipelineStageFlags2::empty();
    for (shader, pipeline) in [
        (vk::ShaderStageFlags::VERTEX, vk::PipelineStageFlags2::VERTEX_SHADER),
        (
            vk::ShaderStageFlags::TESSELLATION_CONTROL,
            vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
        ),
        (
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
        ),
        (vk::ShaderStageFlags::GEOMETRY, vk::PipelineStageFlags2::GEOMETRY_SHADER),
        (vk::ShaderStageFlags::FRAGMENT, vk::PipelineStageFlags2::FRAGMENT_SHADER),
        (vk::ShaderStageFlags::COMPUTE, vk::PipelineStageFlags2::COMPUTE_SHADER),
    ] {
        if stages.intersects(shader) {
            result |= pipeline;
        }
    }
    result
}

///One descriptor binding of a pipeline and the resource slot it reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    pub set: u32,
    pub binding: u32,
    ///Index into the resource slots of the [DescriptorState](crate::DescriptorState).
    pub slot: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    ///Set if the shader only reads a storage resource.
    pub read_only: bool,
}

impl BindingInfo {
    pub fn new(set: u32, binding: u32, slot: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        BindingInfo {
            set,
            binding,
            slot,
            ty,
            stages,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self.ty,
            vk::DescriptorType::STORAGE_BUFFER
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_IMAGE
                | vk::DescriptorType::STORAGE_TEXEL_BUFFER
        )
    }

    pub fn is_uniform_buffer(&self) -> bool {
        self.ty == vk::DescriptorType::UNIFORM_BUFFER
    }

    pub fn pipeline_stages(&self) -> vk::PipelineStageFlags2 {
        shader_stages_to_pipeline(self.stages)
    }

    ///Vulkan access flags of the binding.
    pub fn access_flags(&self) -> vk::AccessFlags2 {
        match self.ty {
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                vk::AccessFlags2::UNIFORM_READ
            }
            _ if self.is_storage() && self.read_only => vk::AccessFlags2::SHADER_STORAGE_READ,
            _ if self.is_storage() => vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            _ => vk::AccessFlags2::SHADER_SAMPLED_READ,
        }
    }

    pub fn access(&self) -> Access {
        Access::from_vk(self.access_flags())
    }
}

///Bindings of one descriptor set.
pub struct SetBindings {
    pub layout: Arc<DescriptorSetLayout>,
    ///Sorted by binding number.
    pub bindings: SmallVec<[BindingInfo; 8]>,
    pub template: Option<vk::DescriptorUpdateTemplate>,
}

impl SetBindings {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn uses_slot(&self, slot: u32) -> bool {
        self.bindings.iter().any(|b| b.slot == slot)
    }
}

///Resource interface of a pipeline: its pipeline layout plus the binding to slot mapping of every set.
pub struct PipelineBindings {
    pub layout: Arc<PipelineLayout>,
    pub bind_point: vk::PipelineBindPoint,
    sets: Vec<SetBindings>,
    device: Arc<Device>,
    cookie: u64,
}

impl PipelineBindings {
    ///Creates set layouts, the pipeline layout and, if configured, one update template per set.
    ///
    /// Set indices that have no binding get an empty set layout. Failures are not recoverable.
    pub fn new(
        device: &Arc<Device>,
        bind_point: vk::PipelineBindPoint,
        bindings: &[BindingInfo],
        push_constants: Option<vk::PushConstantRange>,
    ) -> Result<Arc<Self>, DescriptorError> {
        let set_count = bindings.iter().map(|b| b.set + 1).max().unwrap_or(0);
        let use_templates =
            device.options.descriptor_update_mode == DescriptorUpdateMode::Templates && !device.features.descriptor_buffer;

        let mut sets = Vec::with_capacity(set_count as usize);
        for set in 0..set_count {
            let mut set_bindings = bindings
                .iter()
                .filter(|b| b.set == set)
                .copied()
                .collect::<SmallVec<[BindingInfo; 8]>>();
            set_bindings.sort_by_key(|b| b.binding);

            let layout_bindings = set_bindings
                .iter()
                .map(|b| SetLayoutBinding {
                    binding: b.binding,
                    ty: b.ty,
                    count: 1,
                    stages: b.stages,
                })
                .collect();
            let layout = DescriptorSetLayout::new(device, layout_bindings)?;

            let template = if use_templates && !set_bindings.is_empty() {
                let entries = set_bindings
                    .iter()
                    .map(|b| TemplateEntry {
                        binding: b.binding,
                        array_element: 0,
                        ty: b.ty,
                    })
                    .collect::<SmallVec<[TemplateEntry; 8]>>();
                Some(device.inner.create_descriptor_update_template(layout.inner, &entries)?)
            } else {
                None
            };

            sets.push(SetBindings {
                layout,
                bindings: set_bindings,
                template,
            });
        }

        let layout = PipelineLayout::new(
            device,
            sets.iter().map(|s| s.layout.clone()).collect(),
            push_constants,
        )?;

        Ok(Arc::new(PipelineBindings {
            layout,
            bind_point,
            sets,
            device: device.clone(),
            cookie: next_cookie(),
        }))
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn sets(&self) -> &[SetBindings] {
        &self.sets
    }

    pub fn set(&self, index: usize) -> Option<&SetBindings> {
        self.sets.get(index)
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    ///All bindings of all sets.
    pub fn bindings(&self) -> impl Iterator<Item = &BindingInfo> {
        self.sets.iter().flat_map(|s| s.bindings.iter())
    }

    ///Bitmask of the sets that read from `slot`.
    pub fn sets_using_slot(&self, slot: u32) -> u32 {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.uses_slot(slot))
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    ///Bitmask of all sets that have at least one binding.
    pub fn non_empty_sets(&self) -> u32 {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    pub fn push_constants(&self) -> Option<vk::PushConstantRange> {
        self.layout.push_constants
    }
}

impl Drop for PipelineBindings {
    fn drop(&mut self) {
        for set in self.sets.iter() {
            if let Some(template) = set.template {
                self.device.inner.destroy_descriptor_update_template(template);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{Options, device::DeviceFeatures, testing::SoftDevice};

    use super::*;

    fn bindings() -> Vec<BindingInfo> {
        vec![
            BindingInfo::new(0, 1, 7, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
            BindingInfo::new(0, 0, 3, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::COMPUTE),
            BindingInfo::new(2, 0, 3, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::COMPUTE),
        ]
    }

    #[test]
    fn sets_are_grouped_and_sorted() {
        let (device, _soft) = SoftDevice::device_default();
        let pipeline = PipelineBindings::new(&device, vk::PipelineBindPoint::COMPUTE, &bindings(), None).unwrap();

        assert_eq!(pipeline.set_count(), 3);
        assert_eq!(pipeline.set(0).unwrap().bindings[0].binding, 0);
        assert_eq!(pipeline.set(0).unwrap().bindings[1].binding, 1);
        assert!(pipeline.set(1).unwrap().is_empty());
        assert_eq!(pipeline.sets_using_slot(3), 0b101);
        assert_eq!(pipeline.sets_using_slot(7), 0b001);
        assert_eq!(pipeline.non_empty_sets(), 0b101);
        assert_eq!(pipeline.layout.set_count(), 3);
    }

    #[test]
    fn templates_only_in_template_mode() {
        let options = Options::default().with_descriptor_update_mode(DescriptorUpdateMode::Templates);
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let pipeline = PipelineBindings::new(&device, vk::PipelineBindPoint::COMPUTE, &bindings(), None).unwrap();
        assert!(pipeline.set(0).unwrap().template.is_some());
        assert!(pipeline.set(1).unwrap().template.is_none());

        let objects = soft.live_objects();
        drop(pipeline);
        assert!(soft.live_objects() < objects);

        let options = Options::default().with_descriptor_update_mode(DescriptorUpdateMode::Writes);
        let (device, _soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let pipeline = PipelineBindings::new(&device, vk::PipelineBindPoint::COMPUTE, &bindings(), None).unwrap();
        assert!(pipeline.sets().iter().all(|s| s.template.is_none()));
    }

    #[test]
    fn access_follows_descriptor_type() {
        let storage = BindingInfo::new(0, 0, 0, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(storage.access(), Access::READ | Access::WRITE);
        assert_eq!(storage.read_only().access(), Access::READ);
        assert_eq!(storage.pipeline_stages(), vk::PipelineStageFlags2::FRAGMENT_SHADER);

        let uniform = BindingInfo::new(0, 0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX);
        assert_eq!(uniform.access(), Access::READ);
        assert!(uniform.is_uniform_buffer());
    }

    #[test]
    fn mismatching_resources_resolve_to_null() {
        let (device, _soft) = SoftDevice::device_default();
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();

        let buffer = dxvk::resources::Buffer::new(&device, dxvk::resources::BufDesc::device_local(64)).unwrap();
        let slot = ResourceSlot::Buffer(BufferSlice::whole(buffer.clone()));
        let info = slot
            .resolve(vk::DescriptorType::SAMPLED_IMAGE, false, &mut list, Access::READ)
            .unwrap();
        assert_eq!(info, DescriptorInfo::Null);
        assert!(list.tracked_resources().is_empty());

        let info = slot
            .resolve(vk::DescriptorType::STORAGE_BUFFER, false, &mut list, Access::WRITE)
            .unwrap();
        assert_eq!(
            info,
            DescriptorInfo::Buffer {
                buffer: buffer.handle(),
                offset: 0,
                range: 64
            }
        );
        assert_eq!(list.tracked_resources().access(&buffer), Some(Access::WRITE));
    }
}
