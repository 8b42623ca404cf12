use ash::vk;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Feature {0} not supported")]
    UnsupportedFeature(&'static str),
    #[error("No memory type supports {0:?}")]
    NoMemoryType(vk::MemoryPropertyFlags),
    #[error("Failed to allocate command buffer. Requested {count}, got {allocated}")]
    FailedToAllocate { allocated: usize, count: usize },
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource is not host visible")]
    NotMappable,
    #[error("Range {offset}..{end} exceeds resource size {size}")]
    OutOfBounds {
        offset: vk::DeviceSize,
        end: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    #[error("Format {0:?} is unknown to the core")]
    UnknownFormat(vk::Format),
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
}

#[derive(Error, Debug)]
pub enum DxvkError {
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Resource error: {0}")]
    ResourceError(#[from] ResourceError),
    #[error("Other error: {0}")]
    Other(String),
}

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use crate::error::{DeviceError, DxvkError, ResourceError};

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DeviceError: Send, Sync);
        assert_impl_all!(ResourceError: Send, Sync);
        assert_impl_all!(DxvkError: Send, Sync);
    }
}
