//! # Resources
//!
//! All resources are created through the [Device](crate::device::Device) and destroyed when their last `Arc` is dropped.
//! The core never destroys anything explicitly. Command lists keep a strong reference to every resource (or buffer
//! storage) they use until the GPU is done, which is what makes "last release after the last using command list completed"
//! hold without any further bookkeeping.
//!
//! Every resource carries a *cookie*. A process-wide unique identifier that is used as identity when hashing or comparing
//! resources. Vulkan handles can not be used for that, since they might be reused by the driver after destruction.
//!
//! Besides its handle, each resource exposes the synchronisation contract the core relies on:
//! - the pipeline stages and access flags it may be used with ([BufDesc::stages], [ImgDesc::stages], ...),
//! - the memory property flags of its backing memory,
//! - for images, the current resting layout.

mod buffer;
pub use buffer::{
    BufDesc, Buffer, BufferFlags, BufferSlice, BufferSliceHandle, BufferStorage, BufferView, BufferViewDesc,
    RawBufferView,
};

mod image;
pub use image::{Image, ImageView, ImgDesc, ImgViewDesc, Sampler, SamplerDesc};

mod layout;
pub use layout::{DescriptorSetLayout, PipelineLayout};

mod query_pool;
pub use query_pool::QueryPool;

use ash::vk;

///Stages a shader resource may be accessed from.
pub const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::PRE_RASTERIZATION_SHADERS.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
);

///Access flags that write memory. Used to decide whether a declared access set can ever write.
pub const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT.as_raw(),
);

///Returns true if `access` contains any write access.
pub fn is_write_access(access: vk::AccessFlags2) -> bool {
    access.intersects(WRITE_ACCESS)
}
