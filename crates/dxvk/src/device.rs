use std::sync::Arc;

use ahash::AHashMap;
use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::Options;

mod raw;
pub use raw::{
    AttachmentResolve, BufferCreateInfo, ClearAttachment, ClearValue, DescriptorInfo, DescriptorWrite, FormatFeatures,
    ImageBarrier, MappedPtr, MemoryBarrier, RawBuffer, RawDevice, RawImage, RenderingAttachment, RenderingInfo,
    SemaphoreSubmit, SetLayoutBinding, SubmitBatch, TemplateEntry,
};

#[cfg(feature = "default_allocator")]
mod vulkan;
#[cfg(feature = "default_allocator")]
pub use vulkan::AshDevice;

///Boolean feature matrix negotiated by whoever created the Vulkan device.
///
/// The core assumes Vulkan 1.3 (synchronization2, dynamic rendering, timeline semaphores). Everything else is optional.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    ///Cull mode, front face, depth and stencil test state are dynamic.
    pub extended_dynamic_state: bool,
    ///`VK_EXT_extended_dynamic_state3` with dynamic sample mask.
    pub dynamic_sample_mask: bool,
    pub depth_bounds: bool,
    ///`VK_EXT_depth_bias_control`. Only used to decide whether depth bias representation needs to be exact.
    pub depth_bias_control: bool,
    ///`VK_KHR_maintenance5`, sized index buffer binds.
    pub maintenance5: bool,
    pub transform_feedback: bool,
    ///Descriptor buffer model instead of descriptor sets.
    pub descriptor_buffer: bool,
    pub pipeline_statistics: bool,
    pub null_descriptor: bool,
}

///Byte size of one descriptor per type, as reported by `VkPhysicalDeviceDescriptorBufferPropertiesEXT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSizes {
    pub sampler: usize,
    pub combined_image_sampler: usize,
    pub sampled_image: usize,
    pub storage_image: usize,
    pub uniform_texel_buffer: usize,
    pub storage_texel_buffer: usize,
    pub uniform_buffer: usize,
    pub storage_buffer: usize,
}

impl Default for DescriptorSizes {
    fn default() -> Self {
        DescriptorSizes {
            sampler: 16,
            combined_image_sampler: 16,
            sampled_image: 16,
            storage_image: 16,
            uniform_texel_buffer: 16,
            storage_texel_buffer: 16,
            uniform_buffer: 16,
            storage_buffer: 16,
        }
    }
}

impl DescriptorSizes {
    pub fn get(&self, ty: vk::DescriptorType) -> usize {
        match ty {
            vk::DescriptorType::SAMPLER => self.sampler,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => self.combined_image_sampler,
            vk::DescriptorType::SAMPLED_IMAGE => self.sampled_image,
            vk::DescriptorType::STORAGE_IMAGE => self.storage_image,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER => self.uniform_texel_buffer,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER => self.storage_texel_buffer,
            vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => self.storage_buffer,
            _ => self.uniform_buffer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_push_constant_size: u32,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    pub max_viewports: u32,
    ///Descriptor sizes in the descriptor buffer model.
    pub descriptor_sizes: DescriptorSizes,
    pub descriptor_buffer_offset_alignment: vk::DeviceSize,
    ///Largest inline buffer update, Vulkan caps this at 64KiB.
    pub max_update_size: vk::DeviceSize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits {
            max_push_constant_size: 128,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            max_viewports: 16,
            descriptor_sizes: DescriptorSizes::default(),
            descriptor_buffer_offset_alignment: 64,
            max_update_size: 1 << 16,
        }
    }
}

///Abstract queue that collects a [ash::vk::Queue](ash::vk::Queue), its family and the lock guarding
/// external synchronisation of the queue.
#[derive(Debug)]
pub struct Queue {
    pub inner: vk::Queue,
    pub family_index: u32,
    lock: Mutex<()>,
}

impl Queue {
    pub fn new(inner: vk::Queue, family_index: u32) -> Self {
        Queue {
            inner,
            family_index,
            lock: Mutex::new(()),
        }
    }

    ///Locks the queue. Every submission and present has to happen while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

#[derive(Debug)]
pub struct DeviceQueues {
    pub graphics: Queue,
    ///Dedicated transfer queue. If set, upload command buffers are submitted here and chained into the
    /// graphics submission with a semaphore.
    pub transfer: Option<Queue>,
}

///The device as the core sees it.
pub struct Device {
    pub inner: Arc<dyn RawDevice>,
    pub features: DeviceFeatures,
    pub limits: DeviceLimits,
    pub queues: DeviceQueues,
    pub options: Options,
    format_cache: Mutex<AHashMap<vk::Format, FormatFeatures>>,
}

impl Device {
    pub fn new(
        inner: Arc<dyn RawDevice>,
        features: DeviceFeatures,
        limits: DeviceLimits,
        queues: DeviceQueues,
        options: Options,
    ) -> Arc<Self> {
        #[cfg(feature = "logging")]
        log::info!(
            "Creating device: {:?}, dedicated transfer queue: {}",
            features,
            queues.transfer.is_some()
        );

        Arc::new(Device {
            inner,
            features,
            limits,
            queues,
            options,
            format_cache: Mutex::new(AHashMap::default()),
        })
    }

    ///Returns the (cached) format features of `format`.
    pub fn format_features(&self, format: vk::Format) -> FormatFeatures {
        *self
            .format_cache
            .lock()
            .entry(format)
            .or_insert_with(|| self.inner.format_features(format))
    }

    pub fn has_dedicated_transfer_queue(&self) -> bool {
        self.queues.transfer.is_some()
    }

    ///Blocks until the whole device is idle. Takes every queue lock to stay externally synchronised.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _graphics = self.queues.graphics.lock();
        let _transfer = self.queues.transfer.as_ref().map(|q| q.lock());
        self.inner.device_wait_idle()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("features", &self.features)
            .field("limits", &self.limits)
            .field("queues", &self.queues)
            .finish()
    }
}
