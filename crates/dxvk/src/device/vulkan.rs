use std::{ffi::c_void, sync::Arc};

use ahash::AHashMap;
use ash::vk::{self, Handle};
use gpu_allocator::{
    MemoryLocation,
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    DeviceError,
    resources::{ImgDesc, ImgViewDesc, SamplerDesc},
};

use super::{
    BufferCreateInfo, ClearAttachment, ClearValue, DescriptorInfo, DescriptorWrite, DeviceFeatures, FormatFeatures,
    ImageBarrier, MappedPtr, MemoryBarrier, RawBuffer, RawDevice, RawImage, RenderingAttachment, RenderingInfo,
    SetLayoutBinding, SubmitBatch, TemplateEntry,
};

///Entry of the host-side array passed to `vkUpdateDescriptorSetWithTemplate`.
#[repr(C)]
#[derive(Clone, Copy)]
union TemplateData {
    buffer: vk::DescriptorBufferInfo,
    image: vk::DescriptorImageInfo,
    view: vk::BufferView,
}

const TEMPLATE_STRIDE: usize = std::mem::size_of::<TemplateData>();

fn is_image_descriptor(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}

fn is_texel_descriptor(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
    )
}

fn buffer_info(info: &DescriptorInfo) -> vk::DescriptorBufferInfo {
    match info {
        DescriptorInfo::Buffer { buffer, offset, range } => vk::DescriptorBufferInfo {
            buffer: *buffer,
            offset: *offset,
            range: *range,
        },
        _ => vk::DescriptorBufferInfo::default(),
    }
}

fn image_info(info: &DescriptorInfo) -> vk::DescriptorImageInfo {
    match info {
        DescriptorInfo::Image { sampler, view, layout } => vk::DescriptorImageInfo {
            sampler: *sampler,
            image_view: *view,
            image_layout: *layout,
        },
        _ => vk::DescriptorImageInfo::default(),
    }
}

fn texel_view(info: &DescriptorInfo) -> vk::BufferView {
    match info {
        DescriptorInfo::TexelBuffer(view) => *view,
        _ => vk::BufferView::null(),
    }
}

fn memory_location(flags: vk::MemoryPropertyFlags) -> MemoryLocation {
    if flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

fn attachment_info(attachment: &RenderingAttachment) -> vk::RenderingAttachmentInfo<'static> {
    let mut info = vk::RenderingAttachmentInfo::default()
        .image_view(attachment.view)
        .image_layout(attachment.layout)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear.to_vk());
    if let Some(resolve) = &attachment.resolve {
        info = info
            .resolve_mode(resolve.mode)
            .resolve_image_view(resolve.view)
            .resolve_image_layout(resolve.layout);
    }
    info
}

///[RawDevice] on top of an [ash::Device].
///
/// Instance and device creation, as well as extension enabling is done by the caller. Memory is allocated through
/// [gpu_allocator].
pub struct AshDevice {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    allocator: Mutex<Allocator>,
    ///Allocations by the raw handle of the buffer or image they are bound to.
    allocations: Mutex<AHashMap<u64, Allocation>>,
    transform_feedback: Option<ash::ext::transform_feedback::Device>,
    dynamic_state3: Option<ash::ext::extended_dynamic_state3::Device>,
    maintenance5: Option<ash::khr::maintenance5::Device>,
    descriptor_buffer: Option<ash::ext::descriptor_buffer::Device>,
    buffer_device_address: bool,
}

impl AshDevice {
    ///Wraps `device`. `features` must only contain features and extensions that were enabled at device creation.
    pub fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        features: &DeviceFeatures,
        buffer_device_address: bool,
    ) -> Result<Arc<Self>, DeviceError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            #[cfg(feature = "logging")]
            log::error!("Failed to create allocator: {}", e);
            let _ = e;
            DeviceError::VkError(vk::Result::ERROR_INITIALIZATION_FAILED)
        })?;

        let transform_feedback = features
            .transform_feedback
            .then(|| ash::ext::transform_feedback::Device::new(&instance, &device));
        let dynamic_state3 = features
            .dynamic_sample_mask
            .then(|| ash::ext::extended_dynamic_state3::Device::new(&instance, &device));
        let maintenance5 = features
            .maintenance5
            .then(|| ash::khr::maintenance5::Device::new(&instance, &device));
        let descriptor_buffer = features
            .descriptor_buffer
            .then(|| ash::ext::descriptor_buffer::Device::new(&instance, &device));

        Ok(Arc::new(AshDevice {
            instance,
            physical_device,
            device,
            allocator: Mutex::new(allocator),
            allocations: Mutex::new(AHashMap::default()),
            transform_feedback,
            dynamic_state3,
            maintenance5,
            descriptor_buffer,
            buffer_device_address,
        }))
    }

    fn allocate(
        &self,
        key: u64,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
        linear: bool,
    ) -> Result<(vk::DeviceMemory, vk::DeviceSize, Option<MappedPtr>), vk::Result> {
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "dxvk",
                requirements,
                location: memory_location(flags),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                #[cfg(feature = "logging")]
                log::error!("Allocation failed: {}", e);
                let _ = e;
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            })?;

        //Safety: the allocation stays alive until the resource is destroyed
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let mapped = allocation.mapped_ptr().map(|p| MappedPtr(p.cast::<u8>()));
        self.allocations.lock().insert(key, allocation);
        Ok((memory, offset, mapped))
    }

    fn free(&self, key: u64) {
        if let Some(allocation) = self.allocations.lock().remove(&key) {
            if let Err(e) = self.allocator.lock().free(allocation) {
                #[cfg(feature = "logging")]
                log::error!("Failed to free allocation: {}", e);
                let _ = e;
            }
        }
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        let leaked = std::mem::take(&mut *self.allocations.lock());
        #[cfg(feature = "logging")]
        if !leaked.is_empty() {
            log::warn!("{} allocations still alive when destroying device", leaked.len());
        }
        let mut allocator = self.allocator.lock();
        for (_, allocation) in leaked {
            let _ = allocator.free(allocation);
        }
    }
}

impl RawDevice for AshDevice {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), vk::Result> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&self, initial_value: Option<u64>) -> Result<vk::Semaphore, vk::Result> {
        let mut timeline_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value.unwrap_or(0));
        let mut ci = vk::SemaphoreCreateInfo::default();
        if initial_value.is_some() {
            ci = ci.push_next(&mut timeline_ci);
        }
        unsafe { self.device.create_semaphore(&ci, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, vk::Result> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: u64) -> Result<(), vk::Result> {
        let sems = [semaphore];
        let values = [value];
        let wait = vk::SemaphoreWaitInfo::default().semaphores(&sems).values(&values);
        unsafe { self.device.wait_semaphores(&wait, timeout) }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), vk::Result> {
        let info = vk::SemaphoreSignalInfo::default().semaphore(semaphore).value(value);
        unsafe { self.device.signal_semaphore(&info) }
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool, vk::Result> {
        let ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        unsafe { self.device.create_command_pool(&ci, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), vk::Result> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, vk::Result> {
        let ci = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&ci)? };
        buffers.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<(), vk::Result> {
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cb, &info) }
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<(), vk::Result> {
        unsafe { self.device.end_command_buffer(cb) }
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> Result<(), vk::Result> {
        let to_info = |s: &super::SemaphoreSubmit| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(s.semaphore)
                .value(s.value)
                .stage_mask(s.stages)
        };

        let waits = batches
            .iter()
            .map(|b| b.waits.iter().map(to_info).collect::<SmallVec<[_; 4]>>())
            .collect::<Vec<_>>();
        let signals = batches
            .iter()
            .map(|b| b.signals.iter().map(to_info).collect::<SmallVec<[_; 4]>>())
            .collect::<Vec<_>>();
        let cbs = batches
            .iter()
            .map(|b| {
                b.command_buffers
                    .iter()
                    .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(*cb))
                    .collect::<SmallVec<[_; 4]>>()
            })
            .collect::<Vec<_>>();

        let infos = (0..batches.len())
            .map(|i| {
                vk::SubmitInfo2::default()
                    .wait_semaphore_infos(&waits[i])
                    .command_buffer_infos(&cbs[i])
                    .signal_semaphore_infos(&signals[i])
            })
            .collect::<Vec<_>>();

        unsafe { self.device.queue_submit2(queue, &infos, fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn device_wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RawBuffer, vk::Result> {
        let mut usage = info.usage;
        if self.buffer_device_address {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        let ci = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(usage)
            .flags(info.flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&ci, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let (memory, offset, mapped) = match self.allocate(buffer.as_raw(), requirements, info.memory, true) {
            Ok(ok) => ok,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, memory, offset) } {
            self.free(buffer.as_raw());
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e);
        }

        let address = if self.buffer_device_address {
            unsafe {
                self.device
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            }
        } else {
            0
        };

        Ok(RawBuffer {
            buffer,
            memory,
            offset,
            size: info.size,
            memory_flags: info.memory,
            mapped,
            address,
        })
    }

    fn destroy_buffer(&self, buffer: &RawBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        self.free(buffer.buffer.as_raw());
    }

    fn create_buffer_view(
        &self,
        buffer: vk::Buffer,
        format: vk::Format,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Result<vk::BufferView, vk::Result> {
        let ci = vk::BufferViewCreateInfo::default()
            .buffer(buffer)
            .format(format)
            .offset(offset)
            .range(range);
        unsafe { self.device.create_buffer_view(&ci, None) }
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        unsafe { self.device.destroy_buffer_view(view, None) }
    }

    fn create_image(&self, desc: &ImgDesc) -> Result<RawImage, vk::Result> {
        let ci = vk::ImageCreateInfo::default()
            .flags(desc.flags)
            .image_type(desc.ty)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&ci, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let linear = desc.tiling == vk::ImageTiling::LINEAR;
        let (memory, offset, _mapped) = match self.allocate(image.as_raw(), requirements, desc.memory, linear) {
            Ok(ok) => ok,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, offset) } {
            self.free(image.as_raw());
            unsafe { self.device.destroy_image(image, None) };
            return Err(e);
        }

        Ok(RawImage {
            image,
            memory,
            memory_flags: desc.memory,
        })
    }

    fn destroy_image(&self, image: &RawImage) {
        unsafe { self.device.destroy_image(image.image, None) };
        self.free(image.image.as_raw());
    }

    fn create_image_view(&self, image: vk::Image, desc: &ImgViewDesc) -> Result<vk::ImageView, vk::Result> {
        let mut usage_ci = vk::ImageViewUsageCreateInfo::default().usage(desc.usage);
        let ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type)
            .format(desc.format)
            .components(vk::ComponentMapping {
                r: desc.swizzle[0],
                g: desc.swizzle[1],
                b: desc.swizzle[2],
                a: desc.swizzle[3],
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspects,
                base_mip_level: desc.min_level,
                level_count: desc.level_count,
                base_array_layer: desc.min_layer,
                layer_count: desc.layer_count,
            })
            .push_next(&mut usage_ci);
        unsafe { self.device.create_image_view(&ci, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, vk::Result> {
        let ci = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_modes[0])
            .address_mode_v(desc.address_modes[1])
            .address_mode_w(desc.address_modes[2])
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::NEVER))
            .max_lod(desc.max_lod);
        unsafe { self.device.create_sampler(&ci, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn format_features(&self, format: vk::Format) -> FormatFeatures {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        FormatFeatures {
            optimal: props.optimal_tiling_features,
            linear: props.linear_tiling_features,
            buffer: props.buffer_features,
        }
    }

    fn create_query_pool(
        &self,
        ty: vk::QueryType,
        count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> Result<vk::QueryPool, vk::Result> {
        let ci = vk::QueryPoolCreateInfo::default()
            .query_type(ty)
            .query_count(count)
            .pipeline_statistics(statistics);
        unsafe { self.device.create_query_pool(&ci, None) }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) }
    }

    fn query_results(&self, pool: vk::QueryPool, query: u32, data: &mut [u64]) -> Result<bool, vk::Result> {
        let stride = std::mem::size_of_val(data);
        let result = unsafe {
            (self.device.fp_v1_0().get_query_pool_results)(
                self.device.handle(),
                pool,
                query,
                1,
                stride,
                data.as_mut_ptr().cast::<c_void>(),
                stride as vk::DeviceSize,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            err => Err(err),
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        let raw = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect::<Vec<_>>();
        let ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw).flags(flags);
        unsafe { self.device.create_descriptor_set_layout(&ci, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(
        &self,
        sets: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result> {
        let ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(sets)
            .push_constant_ranges(push_constants);
        unsafe { self.device.create_pipeline_layout(&ci, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, vk::Result> {
        let ci = vk::DescriptorPoolCreateInfo::default().max_sets(max_sets).pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&ci, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let ci = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&ci)? };
        sets.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let buffers = writes.iter().map(|w| buffer_info(&w.info)).collect::<Vec<_>>();
        let images = writes.iter().map(|w| image_info(&w.info)).collect::<Vec<_>>();
        let views = writes.iter().map(|w| texel_view(&w.info)).collect::<Vec<_>>();

        let raw = writes
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(w.set)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(w.ty);
                if is_image_descriptor(w.ty) {
                    base.image_info(std::slice::from_ref(&images[i]))
                } else if is_texel_descriptor(w.ty) {
                    base.texel_buffer_view(std::slice::from_ref(&views[i]))
                } else {
                    base.buffer_info(std::slice::from_ref(&buffers[i]))
                }
            })
            .collect::<Vec<_>>();

        unsafe { self.device.update_descriptor_sets(&raw, &[]) }
    }

    fn create_descriptor_update_template(
        &self,
        layout: vk::DescriptorSetLayout,
        entries: &[TemplateEntry],
    ) -> Result<vk::DescriptorUpdateTemplate, vk::Result> {
        let raw = entries
            .iter()
            .enumerate()
            .map(|(i, e)| vk::DescriptorUpdateTemplateEntry {
                dst_binding: e.binding,
                dst_array_element: e.array_element,
                descriptor_count: 1,
                descriptor_type: e.ty,
                offset: i * TEMPLATE_STRIDE,
                stride: TEMPLATE_STRIDE,
            })
            .collect::<Vec<_>>();
        let ci = vk::DescriptorUpdateTemplateCreateInfo::default()
            .descriptor_update_entries(&raw)
            .template_type(vk::DescriptorUpdateTemplateType::DESCRIPTOR_SET)
            .descriptor_set_layout(layout);
        unsafe { self.device.create_descriptor_update_template(&ci, None) }
    }

    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate) {
        unsafe { self.device.destroy_descriptor_update_template(template, None) }
    }

    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    ) {
        let data = infos
            .iter()
            .map(|info| match info {
                DescriptorInfo::Image { .. } => TemplateData {
                    image: image_info(info),
                },
                DescriptorInfo::TexelBuffer(view) => TemplateData { view: *view },
                _ => TemplateData {
                    buffer: buffer_info(info),
                },
            })
            .collect::<Vec<_>>();
        unsafe {
            self.device
                .update_descriptor_set_with_template(set, template, data.as_ptr().cast::<c_void>())
        }
    }

    fn descriptor_set_layout_size(&self, layout: vk::DescriptorSetLayout) -> vk::DeviceSize {
        let Some(ext) = &self.descriptor_buffer else {
            return 0;
        };
        let mut size = 0;
        unsafe { (ext.fp().get_descriptor_set_layout_size_ext)(self.device.handle(), layout, &mut size) };
        size
    }

    fn descriptor_set_layout_binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32) -> vk::DeviceSize {
        let Some(ext) = &self.descriptor_buffer else {
            return 0;
        };
        let mut offset = 0;
        unsafe {
            (ext.fp().get_descriptor_set_layout_binding_offset_ext)(self.device.handle(), layout, binding, &mut offset)
        };
        offset
    }

    fn get_descriptor(&self, ty: vk::DescriptorType, info: &DescriptorInfo, dst: &mut [u8]) {
        let Some(ext) = &self.descriptor_buffer else {
            return;
        };
        let address = match info {
            DescriptorInfo::Address { address, range } => vk::DescriptorAddressInfoEXT::default()
                .address(*address)
                .range(*range)
                .format(vk::Format::UNDEFINED),
            _ => vk::DescriptorAddressInfoEXT::default(),
        };
        let (sampler, image) = match info {
            DescriptorInfo::Image { sampler, view, layout } => (
                *sampler,
                vk::DescriptorImageInfo::default()
                    .sampler(*sampler)
                    .image_view(*view)
                    .image_layout(*layout),
            ),
            _ => (vk::Sampler::null(), vk::DescriptorImageInfo::default()),
        };

        //null descriptors are expressed by null pointers
        let data = match (ty, info) {
            (_, DescriptorInfo::Null) => vk::DescriptorDataEXT {
                p_uniform_buffer: std::ptr::null(),
            },
            (vk::DescriptorType::SAMPLER, _) => vk::DescriptorDataEXT { p_sampler: &sampler },
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, _) => vk::DescriptorDataEXT {
                p_combined_image_sampler: &image,
            },
            (vk::DescriptorType::SAMPLED_IMAGE, _) => vk::DescriptorDataEXT { p_sampled_image: &image },
            (vk::DescriptorType::STORAGE_IMAGE, _) => vk::DescriptorDataEXT { p_storage_image: &image },
            _ => vk::DescriptorDataEXT {
                p_uniform_buffer: &address,
            },
        };
        let get_info = vk::DescriptorGetInfoEXT::default().ty(ty).data(data);
        unsafe {
            (ext.fp().get_descriptor_ext)(
                self.device.handle(),
                &get_info,
                dst.len(),
                dst.as_mut_ptr().cast::<c_void>(),
            )
        };
    }

    fn cmd_pipeline_barrier(&self, cb: vk::CommandBuffer, memory: &[MemoryBarrier], images: &[ImageBarrier]) {
        let memory = memory
            .iter()
            .map(|b| {
                vk::MemoryBarrier2::default()
                    .src_stage_mask(b.src_stages)
                    .src_access_mask(b.src_access)
                    .dst_stage_mask(b.dst_stages)
                    .dst_access_mask(b.dst_access)
            })
            .collect::<SmallVec<[_; 2]>>();
        let images = images
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(b.src_stages)
                    .src_access_mask(b.src_access)
                    .dst_stage_mask(b.dst_stages)
                    .dst_access_mask(b.dst_access)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(b.image)
                    .subresource_range(b.subresources)
            })
            .collect::<SmallVec<[_; 8]>>();
        let info = vk::DependencyInfo::default()
            .memory_barriers(&memory)
            .image_memory_barriers(&images);
        unsafe { self.device.cmd_pipeline_barrier2(cb, &info) }
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        let colors = info
            .colors
            .iter()
            .map(|c| match c {
                Some(att) => attachment_info(att),
                None => vk::RenderingAttachmentInfo::default().image_view(vk::ImageView::null()),
            })
            .collect::<SmallVec<[_; 8]>>();
        let depth = info.depth.as_ref().map(attachment_info);
        let stencil = info.stencil.as_ref().map(attachment_info);

        let mut ri = vk::RenderingInfo::default()
            .flags(info.flags)
            .render_area(info.area)
            .layer_count(info.layers)
            .color_attachments(&colors);
        if let Some(depth) = &depth {
            ri = ri.depth_attachment(depth);
        }
        if let Some(stencil) = &stencil {
            ri = ri.stencil_attachment(stencil);
        }
        unsafe { self.device.cmd_begin_rendering(cb, &ri) }
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cb) }
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(cb, bind_point, pipeline) }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cb, bind_point, layout, first_set, sets, &[])
        }
    }

    fn cmd_bind_descriptor_buffers(&self, cb: vk::CommandBuffer, buffers: &[(vk::DeviceAddress, vk::BufferUsageFlags)]) {
        let Some(ext) = &self.descriptor_buffer else {
            return;
        };
        let infos = buffers
            .iter()
            .map(|(address, usage)| {
                vk::DescriptorBufferBindingInfoEXT::default()
                    .address(*address)
                    .usage(*usage)
            })
            .collect::<SmallVec<[_; 2]>>();
        unsafe { (ext.fp().cmd_bind_descriptor_buffers_ext)(cb, infos.len() as u32, infos.as_ptr()) }
    }

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        buffer_indices: &[u32],
        offsets: &[vk::DeviceSize],
    ) {
        let Some(ext) = &self.descriptor_buffer else {
            return;
        };
        let count = buffer_indices.len().min(offsets.len()) as u32;
        unsafe {
            (ext.fp().cmd_set_descriptor_buffer_offsets_ext)(
                cb,
                bind_point,
                layout,
                first_set,
                count,
                buffer_indices.as_ptr(),
                offsets.as_ptr(),
            )
        }
    }

    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device.cmd_push_constants(cb, layout, stages, offset, data) }
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        ty: vk::IndexType,
    ) {
        match &self.maintenance5 {
            Some(ext) => unsafe { (ext.fp().cmd_bind_index_buffer2_khr)(cb, buffer, offset, size, ty) },
            None => unsafe { self.device.cmd_bind_index_buffer(cb, buffer, offset, ty) },
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
        sizes: &[vk::DeviceSize],
        strides: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers2(cb, first_binding, buffers, offsets, Some(sizes), Some(strides))
        }
    }

    fn cmd_bind_transform_feedback_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
        sizes: &[vk::DeviceSize],
    ) {
        let Some(ext) = &self.transform_feedback else {
            return;
        };
        unsafe {
            (ext.fp().cmd_bind_transform_feedback_buffers_ext)(
                cb,
                first_binding,
                buffers.len() as u32,
                buffers.as_ptr(),
                offsets.as_ptr(),
                sizes.as_ptr(),
            )
        }
    }

    fn cmd_begin_transform_feedback(&self, cb: vk::CommandBuffer, counters: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        let Some(ext) = &self.transform_feedback else {
            return;
        };
        unsafe {
            (ext.fp().cmd_begin_transform_feedback_ext)(
                cb,
                0,
                counters.len() as u32,
                counters.as_ptr(),
                offsets.as_ptr(),
            )
        }
    }

    fn cmd_end_transform_feedback(&self, cb: vk::CommandBuffer, counters: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        let Some(ext) = &self.transform_feedback else {
            return;
        };
        unsafe {
            (ext.fp().cmd_end_transform_feedback_ext)(cb, 0, counters.len() as u32, counters.as_ptr(), offsets.as_ptr())
        }
    }

    fn cmd_set_viewports(&self, cb: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        unsafe { self.device.cmd_set_viewport_with_count(cb, viewports) }
    }

    fn cmd_set_scissors(&self, cb: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        unsafe { self.device.cmd_set_scissor_with_count(cb, scissors) }
    }

    fn cmd_set_depth_bias(&self, cb: vk::CommandBuffer, constant: f32, clamp: f32, slope: f32) {
        unsafe { self.device.cmd_set_depth_bias(cb, constant, clamp, slope) }
    }

    fn cmd_set_blend_constants(&self, cb: vk::CommandBuffer, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(cb, &constants) }
    }

    fn cmd_set_stencil_reference(&self, cb: vk::CommandBuffer, reference: u32) {
        unsafe {
            self.device
                .cmd_set_stencil_reference(cb, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
        }
    }

    fn cmd_set_depth_bounds(&self, cb: vk::CommandBuffer, min: f32, max: f32) {
        unsafe { self.device.cmd_set_depth_bounds(cb, min, max) }
    }

    fn cmd_set_cull_mode(&self, cb: vk::CommandBuffer, mode: vk::CullModeFlags) {
        unsafe { self.device.cmd_set_cull_mode(cb, mode) }
    }

    fn cmd_set_front_face(&self, cb: vk::CommandBuffer, face: vk::FrontFace) {
        unsafe { self.device.cmd_set_front_face(cb, face) }
    }

    fn cmd_set_depth_test(&self, cb: vk::CommandBuffer, test: bool, write: bool, compare: vk::CompareOp) {
        unsafe {
            self.device.cmd_set_depth_test_enable(cb, test);
            self.device.cmd_set_depth_write_enable(cb, write);
            self.device.cmd_set_depth_compare_op(cb, compare);
        }
    }

    fn cmd_set_depth_bounds_test(&self, cb: vk::CommandBuffer, enable: bool) {
        unsafe { self.device.cmd_set_depth_bounds_test_enable(cb, enable) }
    }

    fn cmd_set_stencil_test(&self, cb: vk::CommandBuffer, enable: bool) {
        unsafe { self.device.cmd_set_stencil_test_enable(cb, enable) }
    }

    fn cmd_set_stencil_op(&self, cb: vk::CommandBuffer, face: vk::StencilFaceFlags, op: vk::StencilOpState) {
        unsafe {
            self.device
                .cmd_set_stencil_op(cb, face, op.fail_op, op.pass_op, op.depth_fail_op, op.compare_op);
            self.device.cmd_set_stencil_compare_mask(cb, face, op.compare_mask);
            self.device.cmd_set_stencil_write_mask(cb, face, op.write_mask);
        }
    }

    fn cmd_set_sample_mask(&self, cb: vk::CommandBuffer, samples: vk::SampleCountFlags, mask: u32) {
        let Some(ext) = &self.dynamic_state3 else {
            return;
        };
        let masks = [mask];
        unsafe { (ext.fp().cmd_set_sample_mask_ext)(cb, samples, masks.as_ptr()) }
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device
                .cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn cmd_draw_indirect(
        &self,
        cb: vk::CommandBuffer,
        indexed: bool,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        count: u32,
        stride: u32,
    ) {
        unsafe {
            if indexed {
                self.device
                    .cmd_draw_indexed_indirect(cb, buffer, offset, count, stride)
            } else {
                self.device.cmd_draw_indirect(cb, buffer, offset, count, stride)
            }
        }
    }

    fn cmd_draw_indirect_count(
        &self,
        cb: vk::CommandBuffer,
        indexed: bool,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        count_buffer: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_count: u32,
        stride: u32,
    ) {
        unsafe {
            if indexed {
                self.device.cmd_draw_indexed_indirect_count(
                    cb,
                    buffer,
                    offset,
                    count_buffer,
                    count_offset,
                    max_count,
                    stride,
                )
            } else {
                self.device.cmd_draw_indirect_count(
                    cb,
                    buffer,
                    offset,
                    count_buffer,
                    count_offset,
                    max_count,
                    stride,
                )
            }
        }
    }

    fn cmd_draw_indirect_byte_count(
        &self,
        cb: vk::CommandBuffer,
        instance_count: u32,
        first_instance: u32,
        counter_buffer: vk::Buffer,
        counter_offset: vk::DeviceSize,
        vertex_stride: u32,
    ) {
        let Some(ext) = &self.transform_feedback else {
            return;
        };
        unsafe {
            (ext.fp().cmd_draw_indirect_byte_count_ext)(
                cb,
                instance_count,
                first_instance,
                counter_buffer,
                counter_offset,
                0,
                vertex_stride,
            )
        }
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cb, x, y, z) }
    }

    fn cmd_dispatch_indirect(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe { self.device.cmd_dispatch_indirect(cb, buffer, offset) }
    }

    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(cb, src, dst, regions) }
    }

    fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image(cb, src, src_layout, dst, dst_layout, regions)
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(cb, src, dst, dst_layout, regions)
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(cb, src, src_layout, dst, regions)
        }
    }

    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(cb, src, src_layout, dst, dst_layout, regions, filter)
        }
    }

    fn cmd_resolve_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        unsafe {
            self.device
                .cmd_resolve_image(cb, src, src_layout, dst, dst_layout, regions)
        }
    }

    fn cmd_fill_buffer(&self, cb: vk::CommandBuffer, dst: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, data: u32) {
        unsafe { self.device.cmd_fill_buffer(cb, dst, offset, size, data) }
    }

    fn cmd_update_buffer(&self, cb: vk::CommandBuffer, dst: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) {
        unsafe { self.device.cmd_update_buffer(cb, dst, offset, data) }
    }

    fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        let color = vk::ClearColorValue {
            uint32: value.color_bits(),
        };
        unsafe {
            self.device
                .cmd_clear_color_image(cb, image, layout, &color, ranges)
        }
    }

    fn cmd_clear_depth_stencil_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        let ds = vk::ClearDepthStencilValue {
            depth: value.depth(),
            stencil: value.stencil(),
        };
        unsafe {
            self.device
                .cmd_clear_depth_stencil_image(cb, image, layout, &ds, ranges)
        }
    }

    fn cmd_clear_attachments(&self, cb: vk::CommandBuffer, attachments: &[ClearAttachment], rects: &[vk::ClearRect]) {
        let raw = attachments
            .iter()
            .map(|a| vk::ClearAttachment {
                aspect_mask: a.aspects,
                color_attachment: a.color_attachment,
                clear_value: a.value.to_vk(),
            })
            .collect::<SmallVec<[_; 8]>>();
        unsafe { self.device.cmd_clear_attachments(cb, &raw, rects) }
    }

    fn cmd_reset_query_pool(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.device.cmd_reset_query_pool(cb, pool, first, count) }
    }

    fn cmd_begin_query(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
        index: Option<u32>,
    ) {
        match (index, &self.transform_feedback) {
            (Some(index), Some(ext)) => unsafe { (ext.fp().cmd_begin_query_indexed_ext)(cb, pool, query, flags, index) },
            _ => unsafe { self.device.cmd_begin_query(cb, pool, query, flags) },
        }
    }

    fn cmd_end_query(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, query: u32, index: Option<u32>) {
        match (index, &self.transform_feedback) {
            (Some(index), Some(ext)) => unsafe { (ext.fp().cmd_end_query_indexed_ext)(cb, pool, query, index) },
            _ => unsafe { self.device.cmd_end_query(cb, pool, query) },
        }
    }

    fn cmd_write_timestamp(&self, cb: vk::CommandBuffer, stage: vk::PipelineStageFlags2, pool: vk::QueryPool, query: u32) {
        unsafe { self.device.cmd_write_timestamp2(cb, stage, pool, query) }
    }
}
