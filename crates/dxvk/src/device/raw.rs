use std::ptr::NonNull;

use ash::vk;
use smallvec::SmallVec;

use crate::resources::{ImgDesc, ImgViewDesc, SamplerDesc};

///Host pointer into mapped device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(pub NonNull<u8>);

//Safety: the pointer is owned by the allocation it belongs to and is only dereferenced through the
//        buffer that owns that allocation.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

///Everything needed to create a buffer and its backing memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    pub flags: vk::BufferCreateFlags,
}

///Buffer handle plus backing memory as returned by [RawDevice::create_buffer].
#[derive(Clone, Copy, Debug)]
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_flags: vk::MemoryPropertyFlags,
    ///Set if the memory is host visible.
    pub mapped: Option<MappedPtr>,
    ///Zero if the buffer was not created with the device address usage.
    pub address: vk::DeviceAddress,
}

#[derive(Clone, Copy, Debug)]
pub struct RawImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub memory_flags: vk::MemoryPropertyFlags,
}

///Clear value stored as raw bits, so that integer and float colors can be compared and hashed alike.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([u32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0; 4])
    }
}

impl ClearValue {
    pub fn float(color: [f32; 4]) -> Self {
        ClearValue::Color(color.map(f32::to_bits))
    }

    pub fn uint(color: [u32; 4]) -> Self {
        ClearValue::Color(color)
    }

    pub fn depth_stencil(depth: f32, stencil: u32) -> Self {
        ClearValue::DepthStencil { depth, stencil }
    }

    pub fn to_vk(&self) -> vk::ClearValue {
        match self {
            ClearValue::Color(bits) => vk::ClearValue {
                color: vk::ClearColorValue { uint32: *bits },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: *depth,
                    stencil: *stencil,
                },
            },
        }
    }

    pub fn color_bits(&self) -> [u32; 4] {
        match self {
            ClearValue::Color(bits) => *bits,
            ClearValue::DepthStencil { .. } => [0; 4],
        }
    }

    pub fn depth(&self) -> f32 {
        match self {
            ClearValue::DepthStencil { depth, .. } => *depth,
            ClearValue::Color(_) => 0.0,
        }
    }

    pub fn stencil(&self) -> u32 {
        match self {
            ClearValue::DepthStencil { stencil, .. } => *stencil,
            ClearValue::Color(_) => 0,
        }
    }
}

///Global memory dependency. Buffers are always synchronised through those.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src_stages.is_empty() && self.dst_stages.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub subresources: vk::ImageSubresourceRange,
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    ///Ignored for binary semaphores
    pub value: u64,
    pub stages: vk::PipelineStageFlags2,
}

///One `VkSubmitInfo2`.
#[derive(Clone, Debug, Default)]
pub struct SubmitBatch {
    pub waits: SmallVec<[SemaphoreSubmit; 4]>,
    pub command_buffers: SmallVec<[vk::CommandBuffer; 4]>,
    pub signals: SmallVec<[SemaphoreSubmit; 4]>,
}

impl SubmitBatch {
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.command_buffers.is_empty() && self.signals.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentResolve {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub mode: vk::ResolveModeFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: ClearValue,
    pub resolve: Option<AttachmentResolve>,
}

///Description of a dynamic rendering scope. Color slots that are `None` are bound as null attachments.
#[derive(Clone, Debug)]
pub struct RenderingInfo {
    pub flags: vk::RenderingFlags,
    pub area: vk::Rect2D,
    pub layers: u32,
    pub colors: SmallVec<[Option<RenderingAttachment>; 8]>,
    pub depth: Option<RenderingAttachment>,
    pub stencil: Option<RenderingAttachment>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearAttachment {
    pub aspects: vk::ImageAspectFlags,
    pub color_attachment: u32,
    pub value: ClearValue,
}

///Content of a single descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DescriptorInfo {
    ///Null descriptor. Requires `nullDescriptor` on real hardware.
    #[default]
    Null,
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    TexelBuffer(vk::BufferView),
    ///Raw address range, only valid in the descriptor buffer model.
    Address {
        address: vk::DeviceAddress,
        range: vk::DeviceSize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub info: DescriptorInfo,
}

///Template entry. The data passed to [RawDevice::update_descriptor_set_with_template] is one
/// [DescriptorInfo] per entry, in entry order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TemplateEntry {
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatFeatures {
    pub optimal: vk::FormatFeatureFlags,
    pub linear: vk::FormatFeatureFlags,
    pub buffer: vk::FormatFeatureFlags,
}

///The only path from the core to Vulkan.
///
/// Every method maps to one (or a small, fixed group of) Vulkan entry points. Handles are raw `ash::vk` handles,
/// lifetime management is done by the wrappers in [resources](crate::resources) and by command lists.
///
/// # Safety
///
/// The signatures are safe for ergonomic reasons. Callers still have to follow Vulkan's valid usage rules, in
/// particular regarding external synchronisation of command buffers and queues, and handle lifetimes. The wrappers of this crate
/// and the command list of `dxvk-commands` take care of that.
pub trait RawDevice: Send + Sync {
    // Fences and semaphores

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result>;
    fn destroy_fence(&self, fence: vk::Fence);
    ///Waits for `fence`. Returns `Err(vk::Result::TIMEOUT)` if it was not signaled within `timeout` nanoseconds.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), vk::Result>;
    fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;

    ///Creates a timeline semaphore if `initial_value` is some, otherwise a binary semaphore.
    fn create_semaphore(&self, initial_value: Option<u64>) -> Result<vk::Semaphore, vk::Result>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, vk::Result>;
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: u64) -> Result<(), vk::Result>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), vk::Result>;

    // Command pools and buffers

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool, vk::Result>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), vk::Result>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, vk::Result>;
    ///Begins a one-time-submit primary command buffer.
    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<(), vk::Result>;
    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<(), vk::Result>;

    // Queues

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> Result<(), vk::Result>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result>;
    fn device_wait_idle(&self) -> Result<(), vk::Result>;

    // Resources

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RawBuffer, vk::Result>;
    fn destroy_buffer(&self, buffer: &RawBuffer);
    fn create_buffer_view(
        &self,
        buffer: vk::Buffer,
        format: vk::Format,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Result<vk::BufferView, vk::Result>;
    fn destroy_buffer_view(&self, view: vk::BufferView);
    fn create_image(&self, desc: &ImgDesc) -> Result<RawImage, vk::Result>;
    fn destroy_image(&self, image: &RawImage);
    fn create_image_view(&self, image: vk::Image, desc: &ImgViewDesc) -> Result<vk::ImageView, vk::Result>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, vk::Result>;
    fn destroy_sampler(&self, sampler: vk::Sampler);
    fn format_features(&self, format: vk::Format) -> FormatFeatures;

    // Queries

    fn create_query_pool(
        &self,
        ty: vk::QueryType,
        count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> Result<vk::QueryPool, vk::Result>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    ///Reads the 64bit results of a single query into `data`. Returns `Ok(false)` if the result is not yet available.
    fn query_results(&self, pool: vk::QueryPool, query: u32, data: &mut [u64]) -> Result<bool, vk::Result>;

    // Layouts and descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout, vk::Result>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        sets: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, vk::Result>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result>;
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);
    fn create_descriptor_update_template(
        &self,
        layout: vk::DescriptorSetLayout,
        entries: &[TemplateEntry],
    ) -> Result<vk::DescriptorUpdateTemplate, vk::Result>;
    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate);
    ///Writes `infos` into `set`. `infos` must contain one element per template entry.
    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    );
    fn descriptor_set_layout_size(&self, layout: vk::DescriptorSetLayout) -> vk::DeviceSize;
    fn descriptor_set_layout_binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32) -> vk::DeviceSize;
    ///Writes the descriptor for `info` into `dst`. `dst` must be at least the device's descriptor size for `ty`.
    fn get_descriptor(&self, ty: vk::DescriptorType, info: &DescriptorInfo, dst: &mut [u8]);

    // Synchronisation and rendering commands

    fn cmd_pipeline_barrier(&self, cb: vk::CommandBuffer, memory: &[MemoryBarrier], images: &[ImageBarrier]);
    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo);
    fn cmd_end_rendering(&self, cb: vk::CommandBuffer);

    // Binding

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    ///Binds descriptor buffers by device address.
    fn cmd_bind_descriptor_buffers(&self, cb: vk::CommandBuffer, buffers: &[(vk::DeviceAddress, vk::BufferUsageFlags)]);
    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        buffer_indices: &[u32],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    ///Binds an index buffer. `size` is only honored if the device supports `VK_KHR_maintenance5`.
    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        ty: vk::IndexType,
    );
    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
        sizes: &[vk::DeviceSize],
        strides: &[vk::DeviceSize],
    );
    fn cmd_bind_transform_feedback_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
        sizes: &[vk::DeviceSize],
    );
    fn cmd_begin_transform_feedback(&self, cb: vk::CommandBuffer, counters: &[vk::Buffer], offsets: &[vk::DeviceSize]);
    fn cmd_end_transform_feedback(&self, cb: vk::CommandBuffer, counters: &[vk::Buffer], offsets: &[vk::DeviceSize]);

    // Dynamic state

    fn cmd_set_viewports(&self, cb: vk::CommandBuffer, viewports: &[vk::Viewport]);
    fn cmd_set_scissors(&self, cb: vk::CommandBuffer, scissors: &[vk::Rect2D]);
    fn cmd_set_depth_bias(&self, cb: vk::CommandBuffer, constant: f32, clamp: f32, slope: f32);
    fn cmd_set_blend_constants(&self, cb: vk::CommandBuffer, constants: [f32; 4]);
    fn cmd_set_stencil_reference(&self, cb: vk::CommandBuffer, reference: u32);
    fn cmd_set_depth_bounds(&self, cb: vk::CommandBuffer, min: f32, max: f32);
    fn cmd_set_cull_mode(&self, cb: vk::CommandBuffer, mode: vk::CullModeFlags);
    fn cmd_set_front_face(&self, cb: vk::CommandBuffer, face: vk::FrontFace);
    fn cmd_set_depth_test(&self, cb: vk::CommandBuffer, test: bool, write: bool, compare: vk::CompareOp);
    fn cmd_set_depth_bounds_test(&self, cb: vk::CommandBuffer, enable: bool);
    fn cmd_set_stencil_test(&self, cb: vk::CommandBuffer, enable: bool);
    fn cmd_set_stencil_op(&self, cb: vk::CommandBuffer, face: vk::StencilFaceFlags, op: vk::StencilOpState);
    fn cmd_set_sample_mask(&self, cb: vk::CommandBuffer, samples: vk::SampleCountFlags, mask: u32);

    // Draws and dispatches

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_draw_indirect(
        &self,
        cb: vk::CommandBuffer,
        indexed: bool,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        count: u32,
        stride: u32,
    );
    #[allow(clippy::too_many_arguments)]
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
    );
    fn cmd_draw_indirect_byte_count(
        &self,
        cb: vk::CommandBuffer,
        instance_count: u32,
        first_instance: u32,
        counter_buffer: vk::Buffer,
        counter_offset: vk::DeviceSize,
        vertex_stride: u32,
    );
    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_dispatch_indirect(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize);

    // Transfer

    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    fn cmd_resolve_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    );
    fn cmd_fill_buffer(&self, cb: vk::CommandBuffer, dst: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, data: u32);
    ///Inline update. `data` must be at most 64KiB and a multiple of four bytes.
    fn cmd_update_buffer(&self, cb: vk::CommandBuffer, dst: vk::Buffer, offset: vk::DeviceSize, data: &[u8]);
    fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
        ranges: &[vk::ImageSubresourceRange],
    );
    fn cmd_clear_depth_stencil_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
        ranges: &[vk::ImageSubresourceRange],
    );
    fn cmd_clear_attachments(&self, cb: vk::CommandBuffer, attachments: &[ClearAttachment], rects: &[vk::ClearRect]);

    // Queries

    fn cmd_reset_query_pool(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);
    ///Begins a query. `index` is only honored for indexed query types (transform feedback streams).
    fn cmd_begin_query(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
        index: Option<u32>,
    );
    fn cmd_end_query(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, query: u32, index: Option<u32>);
    fn cmd_write_timestamp(&self, cb: vk::CommandBuffer, stage: vk::PipelineStageFlags2, pool: vk::QueryPool, query: u32);
}
