use dxvk::{DeviceError, ResourceError, ash::vk};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("vulkan error: {0}")]
    VkError(#[from] vk::Result),

    #[error("device error: {0}")]
    DeviceError(#[from] DeviceError),

    #[error("resource error: {0}")]
    ResourceError(#[from] ResourceError),

    ///A descriptor set does not fit into a single heap chunk.
    #[error("descriptor set of {size} bytes exceeds heap chunk size {chunk_size}")]
    SetTooLarge {
        size: vk::DeviceSize,
        chunk_size: vk::DeviceSize,
    },

    #[error("descriptor worker is shut down")]
    WorkerClosed,

    #[error("failed to spawn descriptor worker: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DescriptorError: Send, Sync);
    }
}
