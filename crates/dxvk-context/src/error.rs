use dxvk::{DeviceError, ResourceError, ash::vk};
use dxvk_commands::{CommandError, QueueError};
use dxvk_descriptor::DescriptorError;
use thiserror::Error;

///Errors of the [Context](crate::Context).
///
/// Only creation, submission and synchronisation report errors. Recording operations that can not be executed are
/// logged and skipped.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("command list error: {0}")]
    CommandError(#[from] CommandError),

    #[error("queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("descriptor error: {0}")]
    DescriptorError(#[from] DescriptorError),

    #[error("resource error: {0}")]
    ResourceError(#[from] ResourceError),

    #[error("device error: {0}")]
    DeviceError(#[from] DeviceError),

    #[error("vulkan error: {0}")]
    VkError(#[from] vk::Result),
}

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use super::ContextError;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(ContextError: Send, Sync);
    }
}
