use std::{any::Any, sync::Arc};

use bitflags::bitflags;
use dxvk::{
    ash::vk,
    device::{Device, SemaphoreSubmit, SubmitBatch},
    sync::{Fence, Semaphore, Signal},
};
use smallvec::{SmallVec, smallvec};

use crate::{Access, BarrierSet, CommandError, ResourceTracker, SignalTracker};

///Sub command buffers of a [CommandList].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdBuffer {
    ///Executed before `Exec`. Used for resource initialization and query resets, which must not end up inside a render pass.
    Init,
    Exec,
    ///Uploads. Submitted to the dedicated transfer queue if there is one, otherwise in front of `Init`.
    Transfer,
}

impl CmdBuffer {
    fn index(self) -> usize {
        match self {
            CmdBuffer::Init => 0,
            CmdBuffer::Exec => 1,
            CmdBuffer::Transfer => 2,
        }
    }

    fn usage(self) -> CmdBufferUsage {
        match self {
            CmdBuffer::Init => CmdBufferUsage::INIT,
            CmdBuffer::Exec => CmdBufferUsage::EXEC,
            CmdBuffer::Transfer => CmdBufferUsage::TRANSFER,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CmdBufferUsage: u8 {
        const INIT = 1 << 0;
        const EXEC = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

const TIMEOUT_NS: u64 = 1_000_000_000;

///One submittable unit of GPU work.
///
/// A list goes through `recording -> submitted -> complete -> reset`. While recording it collects the resources it uses,
/// the host signals it should fire and the semaphores it waits on or signals. Once submitted it must not be touched until
/// [synchronize](Self::synchronize) returned, after which [reset](Self::reset) releases everything and the list can be
/// recorded again.
pub struct CommandList {
    device: Arc<Device>,
    graphics_pool: vk::CommandPool,
    transfer_pool: Option<vk::CommandPool>,
    buffers: [vk::CommandBuffer; 3],
    barriers: [BarrierSet; 3],
    used: CmdBufferUsage,
    recording: bool,

    fence: Fence,
    ///Orders the dedicated transfer queue submission before the graphics submission.
    transfer_semaphore: Option<Arc<Semaphore>>,
    transfer_value: u64,

    resources: ResourceTracker,
    signals: SignalTracker,
    waits: SmallVec<[SemaphoreSubmit; 4]>,
    signal_semaphores: SmallVec<[SemaphoreSubmit; 4]>,
    on_reset: Vec<Box<dyn FnOnce() + Send>>,
}

impl CommandList {
    ///Creates the command pools, command buffers, fence and (for a dedicated transfer queue) the semaphore.
    /// Failures are not recoverable.
    pub fn new(device: &Arc<Device>) -> Result<Self, CommandError> {
        let graphics_family = device.queues.graphics.family_index;
        let graphics_pool = device.inner.create_command_pool(graphics_family)?;

        let (transfer_pool, transfer_semaphore) = match &device.queues.transfer {
            Some(queue) => (
                Some(device.inner.create_command_pool(queue.family_index)?),
                Some(Semaphore::new(device, 0)?),
            ),
            None => (None, None),
        };

        let init = device.inner.allocate_command_buffer(graphics_pool)?;
        let exec = device.inner.allocate_command_buffer(graphics_pool)?;
        let transfer = device
            .inner
            .allocate_command_buffer(transfer_pool.unwrap_or(graphics_pool))?;

        let control = device.options.barrier_control;
        Ok(CommandList {
            device: device.clone(),
            graphics_pool,
            transfer_pool,
            buffers: [init, exec, transfer],
            barriers: [
                BarrierSet::new(control),
                BarrierSet::new(control),
                BarrierSet::new(control),
            ],
            used: CmdBufferUsage::empty(),
            recording: false,
            fence: Fence::new(device, false)?,
            transfer_semaphore,
            transfer_value: 0,
            resources: ResourceTracker::default(),
            signals: SignalTracker::default(),
            waits: SmallVec::new(),
            signal_semaphores: SmallVec::new(),
            on_reset: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    ///Resets the command buffers and starts recording. The exec buffer is always considered used.
    pub fn begin_recording(&mut self) -> Result<(), CommandError> {
        self.device.inner.reset_command_pool(self.graphics_pool)?;
        if let Some(pool) = self.transfer_pool {
            self.device.inner.reset_command_pool(pool)?;
        }
        for cb in self.buffers {
            self.device.inner.begin_command_buffer(cb)?;
        }
        for barriers in self.barriers.iter_mut() {
            barriers.reset();
        }
        self.fence.reset()?;
        self.used = CmdBufferUsage::EXEC;
        self.recording = true;
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    ///Returns the command buffer `which` and marks it as used.
    pub fn cmd_buffer(&mut self, which: CmdBuffer) -> vk::CommandBuffer {
        self.used |= which.usage();
        self.buffers[which.index()]
    }

    pub fn usage(&self) -> CmdBufferUsage {
        self.used
    }

    pub fn barriers(&mut self, which: CmdBuffer) -> &mut BarrierSet {
        &mut self.barriers[which.index()]
    }

    ///Records the pending barriers of `which` into its command buffer.
    pub fn flush_barriers(&mut self, which: CmdBuffer) {
        if !self.barriers[which.index()].has_pending_barriers() {
            self.barriers[which.index()].reset();
            return;
        }
        let cb = self.cmd_buffer(which);
        self.barriers[which.index()].record_commands(self.device.inner.as_ref(), cb);
    }

    ///Flushes all barriers and ends every command buffer.
    pub fn end_recording(&mut self) -> Result<(), CommandError> {
        if !self.recording {
            return Err(CommandError::NotRecording);
        }
        for which in [CmdBuffer::Transfer, CmdBuffer::Init, CmdBuffer::Exec] {
            self.flush_barriers(which);
        }
        for cb in self.buffers {
            self.device.inner.end_command_buffer(cb)?;
        }
        self.recording = false;
        Ok(())
    }

    ///Keeps `resource` alive until the list completed.
    pub fn track<T: Any + Send + Sync>(&mut self, resource: &Arc<T>, access: Access) {
        self.resources.track(resource, access);
    }

    pub fn tracked_resources(&self) -> &ResourceTracker {
        &self.resources
    }

    ///Fires `signal` with `value` once the list completed.
    pub fn track_signal(&mut self, signal: Arc<dyn Signal>, value: u64) {
        self.signals.add(signal, value);
    }

    ///Runs `f` when the list is reset after completion. Used to return pooled objects.
    pub fn on_reset(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_reset.push(Box::new(f));
    }

    ///Lets the submission wait for `semaphore` to reach `value`.
    pub fn wait_semaphore(&mut self, semaphore: &Arc<Semaphore>, value: u64) {
        self.track(semaphore, Access::empty());
        self.waits.push(SemaphoreSubmit {
            semaphore: semaphore.inner,
            value,
            stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        });
    }

    ///Signals `semaphore` with `value` once the submission completed.
    pub fn signal_semaphore(&mut self, semaphore: &Arc<Semaphore>, value: u64) {
        self.track(semaphore, Access::empty());
        self.signal_semaphores.push(SemaphoreSubmit {
            semaphore: semaphore.inner,
            value,
            stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        });
    }

    ///Submits the list. If a dedicated transfer queue exists and the transfer buffer was used, it is submitted there first
    /// and chained to the graphics submission via a semaphore.
    ///
    /// On error no command of this list may be assumed to have executed.
    pub fn submit(&mut self) -> Result<(), vk::Result> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if self.recording {
            return Err(vk::Result::NOT_READY);
        }

        let [init, exec, transfer] = self.buffers;
        let mut graphics = SubmitBatch {
            waits: self.waits.clone(),
            command_buffers: SmallVec::new(),
            signals: self.signal_semaphores.clone(),
        };

        if self.used.contains(CmdBufferUsage::TRANSFER) {
            match (&self.device.queues.transfer, &self.transfer_semaphore) {
                (Some(queue), Some(semaphore)) => {
                    self.transfer_value += 1;
                    let signal = SemaphoreSubmit {
                        semaphore: semaphore.inner,
                        value: self.transfer_value,
                        stages: vk::PipelineStageFlags2::ALL_TRANSFER,
                    };
                    let batch = SubmitBatch {
                        waits: SmallVec::new(),
                        command_buffers: smallvec![transfer],
                        signals: smallvec![signal],
                    };
                    {
                        let _lock = queue.lock();
                        self.device
                            .inner
                            .queue_submit(queue.inner, &[batch], vk::Fence::null())?;
                    }
                    graphics.waits.push(SemaphoreSubmit {
                        stages: vk::PipelineStageFlags2::ALL_COMMANDS,
                        ..signal
                    });
                }
                _ => graphics.command_buffers.push(transfer),
            }
        }
        if self.used.contains(CmdBufferUsage::INIT) {
            graphics.command_buffers.push(init);
        }
        if self.used.contains(CmdBufferUsage::EXEC) {
            graphics.command_buffers.push(exec);
        }

        let queue = &self.device.queues.graphics;
        let _lock = queue.lock();
        self.device
            .inner
            .queue_submit(queue.inner, &[graphics], self.fence.inner)
    }

    ///Blocks until the GPU finished executing the list.
    ///
    /// Waits in bounded slices so a hung device does not block forever without a log line. Any result other than success
    /// or timeout is returned.
    pub fn synchronize(&self) -> Result<(), vk::Result> {
        loop {
            match self.fence.wait(TIMEOUT_NS) {
                Ok(()) => return Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    #[cfg(feature = "logging")]
                    log::debug!("Command list not finished after 1s, waiting again");
                }
                Err(e) => return Err(e),
            }
        }
    }

    ///True once the fence of the last submission is signaled.
    pub fn is_complete(&self) -> Result<bool, vk::Result> {
        self.fence.is_signaled()
    }

    ///Fires the host signals. Called once the list completed.
    pub fn notify_signals(&mut self) {
        self.signals.notify();
    }

    ///Releases everything the list tracked. Must only be called after the list completed (or failed to submit).
    ///
    /// Signals that were not fired through [notify_signals](Self::notify_signals) are dropped, the work they wait for
    /// never executed.
    pub fn reset(&mut self) {
        self.signals.reset();
        for f in self.on_reset.drain(..) {
            f();
        }
        self.resources.clear();
        self.waits.clear();
        self.signal_semaphores.clear();
        for barriers in self.barriers.iter_mut() {
            barriers.reset();
        }
        self.used = CmdBufferUsage::empty();
        self.recording = false;
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.resources.clear();
        self.device.inner.destroy_command_pool(self.graphics_pool);
        if let Some(pool) = self.transfer_pool {
            self.device.inner.destroy_command_pool(pool);
        }
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("exec", &self.buffers[1])
            .field("used", &self.used)
            .field("recording", &self.recording)
            .field("resources", &self.resources)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use dxvk::{
        Options,
        device::DeviceFeatures,
        resources::{BufDesc, Buffer},
        testing::SoftDevice,
    };
    use static_assertions::assert_impl_all;

    use super::*;

    struct LastValue(AtomicU64);

    impl Signal for LastValue {
        fn signal(&self, value: u64) {
            self.0.store(value, Ordering::SeqCst);
        }
    }

    #[test]
    fn assure_send() {
        assert_impl_all!(CommandList: Send);
    }

    #[test]
    fn tracked_resources_live_until_reset() {
        let (device, soft) = SoftDevice::device_default();
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();

        let buffer = Buffer::new(&device, BufDesc::device_local(64)).unwrap();
        list.track(&buffer, Access::WRITE);
        let storage = buffer.storage();
        list.track(&storage, Access::WRITE);
        drop(storage);
        drop(buffer);
        assert_eq!(soft.live_buffers(), 1);

        list.end_recording().unwrap();
        list.submit().unwrap();
        list.synchronize().unwrap();
        assert_eq!(soft.live_buffers(), 1);

        list.reset();
        assert_eq!(soft.live_buffers(), 0);
    }

    #[test]
    fn only_used_buffers_are_submitted() {
        let (device, soft) = SoftDevice::device_default();
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();
        list.end_recording().unwrap();
        list.submit().unwrap();

        let submissions = soft.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].batches[0].command_buffers.len(), 1);

        list.reset();
        list.begin_recording().unwrap();
        let _ = list.cmd_buffer(CmdBuffer::Init);
        let _ = list.cmd_buffer(CmdBuffer::Transfer);
        list.end_recording().unwrap();
        list.submit().unwrap();
        assert_eq!(soft.submissions()[1].batches[0].command_buffers.len(), 3);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn dedicated_transfer_queue_is_chained() {
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), Options::default(), true);
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();
        let _ = list.cmd_buffer(CmdBuffer::Transfer);
        list.end_recording().unwrap();
        list.submit().unwrap();

        let submissions = soft.submissions();
        assert_eq!(submissions.len(), 2);
        let transfer_queue = device.queues.transfer.as_ref().unwrap().inner;
        assert_eq!(submissions[0].queue, transfer_queue);
        let signal = submissions[0].batches[0].signals[0];
        let wait = submissions[1].batches[0].waits[0];
        assert_eq!(signal.semaphore, wait.semaphore);
        assert_eq!(signal.value, wait.value);
    }

    #[test]
    fn signals_fire_on_notify() {
        let (device, _soft) = SoftDevice::device_default();
        let mut list = CommandList::new(&device).unwrap();
        let signal = Arc::new(LastValue(AtomicU64::new(0)));
        list.begin_recording().unwrap();
        list.track_signal(signal.clone(), 42);
        list.end_recording().unwrap();
        list.submit().unwrap();
        list.synchronize().unwrap();
        assert_eq!(signal.0.load(Ordering::SeqCst), 0);
        list.notify_signals();
        list.reset();
        assert_eq!(signal.0.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn reset_drops_unfired_signals() {
        let (device, _soft) = SoftDevice::device_default();
        let mut list = CommandList::new(&device).unwrap();
        let signal = Arc::new(LastValue(AtomicU64::new(0)));
        list.begin_recording().unwrap();
        list.track_signal(signal.clone(), 42);
        list.end_recording().unwrap();
        list.reset();
        assert_eq!(signal.0.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&signal), 1);
    }

    #[test]
    fn synchronize_waits_for_completion() {
        let (device, soft) = SoftDevice::device_default();
        soft.set_manual_completion(true);
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();
        list.end_recording().unwrap();
        list.submit().unwrap();
        assert_eq!(list.is_complete(), Ok(false));

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                soft.complete_next();
            });
            list.synchronize().unwrap();
        });
        assert_eq!(list.is_complete(), Ok(true));
    }
}
