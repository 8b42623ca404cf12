//! # Synchronisation
//!
//! Thin wrappers around Vulkan's host-visible synchronisation primitives:
//!
//! - [Fence]: one per command list. Signaled by the queue once the command list finished executing.
//! - [Semaphore]: timeline semaphores, attached to submissions as wait or signal operations. Those are used to order work
//!   across submissions and queues (for instance the transfer queue feeding the graphics queue).
//! - [Signal]: host side notification that is fired when a command list completes.
//!
//! The [Ring] is the bounded hand-off queue used between the render thread and worker threads.

use std::{fmt::Debug, sync::Arc};

use ash::vk;

use crate::{DeviceError, device::Device};

mod ring;
pub use ring::Ring;

///Host notification, fired with the value it was registered with once the command list it was attached to completed.
pub trait Signal: Send + Sync {
    fn signal(&self, value: u64);
}

pub struct Fence {
    pub inner: vk::Fence,
    pub device: Arc<Device>,
}

impl Fence {
    pub fn new(device: &Arc<Device>, signaled: bool) -> Result<Self, DeviceError> {
        let inner = device.inner.create_fence(signaled)?;
        Ok(Fence {
            inner,
            device: device.clone(),
        })
    }

    ///Blocks until the fence is signaled or `timeout` nanoseconds passed, in which case `vk::Result::TIMEOUT` is returned.
    pub fn wait(&self, timeout: u64) -> Result<(), vk::Result> {
        self.device.inner.wait_for_fence(self.inner, timeout)
    }

    pub fn is_signaled(&self) -> Result<bool, vk::Result> {
        self.device.inner.fence_status(self.inner)
    }

    pub fn reset(&self) -> Result<(), vk::Result> {
        self.device.inner.reset_fence(self.inner)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.inner.destroy_fence(self.inner);
    }
}

impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

///Single [TimelineSemaphore](https://www.khronos.org/blog/vulkan-timeline-semaphores), or a binary semaphore
/// if created via [binary](Semaphore::binary).
pub struct Semaphore {
    pub inner: vk::Semaphore,
    pub device: Arc<Device>,
    timeline: bool,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, initial_value: u64) -> Result<Arc<Self>, DeviceError> {
        let inner = device.inner.create_semaphore(Some(initial_value))?;
        Ok(Arc::new(Semaphore {
            inner,
            device: device.clone(),
            timeline: true,
        }))
    }

    pub fn binary(device: &Arc<Device>) -> Result<Arc<Self>, DeviceError> {
        let inner = device.inner.create_semaphore(None)?;
        Ok(Arc::new(Semaphore {
            inner,
            device: device.clone(),
            timeline: false,
        }))
    }

    pub fn is_timeline(&self) -> bool {
        self.timeline
    }

    ///Returns the current value of the semaphore. Note that this can change at any time if the semaphore is in use on
    /// the device. Returns `u64::MAX` if the value can not be read.
    pub fn value(&self) -> u64 {
        self.device.inner.semaphore_value(self.inner).unwrap_or(u64::MAX)
    }

    ///Sets the semaphore value from the host. The value has to be greater than the current value.
    pub fn set_value(&self, value: u64) -> Result<(), vk::Result> {
        self.device.inner.signal_semaphore(self.inner, value)
    }

    ///Blocks until `self` reaches `value`, or the `timeout` is reached.
    pub fn wait(&self, value: u64, timeout: u64) -> Result<(), vk::Result> {
        self.device.inner.wait_semaphore(self.inner, value, timeout)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.inner.destroy_semaphore(self.inner);
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::testing::SoftDevice;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(Fence: Send, Sync);
        assert_impl_all!(Semaphore: Send, Sync);
        assert_impl_all!(Ring<u32>: Send, Sync);
    }

    #[test]
    fn timeline_values() {
        let (device, _soft) = SoftDevice::device_default();
        let sem = Semaphore::new(&device, 3).unwrap();
        assert_eq!(sem.value(), 3);
        sem.set_value(5).unwrap();
        assert_eq!(sem.value(), 5);
        assert!(sem.wait(5, 0).is_ok());
        assert_eq!(sem.wait(6, 0), Err(vk::Result::TIMEOUT));
    }
}
