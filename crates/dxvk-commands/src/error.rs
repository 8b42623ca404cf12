use dxvk::{DeviceError, ash::vk};
use thiserror::Error;

///Failures while creating or recording a [CommandList](crate::CommandList).
///
/// Creation failures are not recoverable. They indicate a broken or unsupported driver and should abort device creation.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("vulkan error: {0}")]
    VkError(#[from] vk::Result),

    #[error("device error: {0}")]
    DeviceError(#[from] DeviceError),

    #[error("command list is not recording")]
    NotRecording,

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

///Errors reported by the [SubmissionQueue](crate::SubmissionQueue).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    ///The device was lost. This state is sticky, no further work is submitted.
    #[error("device lost")]
    DeviceLost,

    ///A previous submission failed with the given result. Stays set until [cleared](crate::SubmissionQueue::clear_error).
    #[error("submission failed: {0}")]
    SubmitFailed(vk::Result),

    #[error("submission queue is shut down")]
    Closed,
}

impl From<vk::Result> for QueueError {
    fn from(value: vk::Result) -> Self {
        if value == vk::Result::ERROR_DEVICE_LOST {
            QueueError::DeviceLost
        } else {
            QueueError::SubmitFailed(value)
        }
    }
}
