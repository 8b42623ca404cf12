use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use dxvk::{
    ash::vk,
    device::{Device, Queue},
    sync::Ring,
};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{CommandError, CommandList, QueueError};

///Result of a submission or present, set by the submit thread.
#[derive(Debug)]
pub struct SubmitStatus {
    ticket: u64,
    result: Mutex<Option<vk::Result>>,
    cond: Condvar,
}

impl SubmitStatus {
    fn new(ticket: u64) -> Arc<Self> {
        Arc::new(SubmitStatus {
            ticket,
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn set(&self, result: vk::Result) {
        *self.result.lock() = Some(result);
        self.cond.notify_all();
    }

    ///Submission number. Pass it to [SubmissionQueue::wait_for] to wait for completion. Presents share the ticket
    /// of the last command list submitted before them.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    ///Result of the submission, `None` while it is still queued.
    pub fn result(&self) -> Option<vk::Result> {
        *self.result.lock()
    }

    ///Blocks until the submit thread processed the entry. Note that this does not wait for GPU completion.
    pub fn wait(&self) -> vk::Result {
        let mut result = self.result.lock();
        loop {
            if let Some(r) = *result {
                return r;
            }
            self.cond.wait(&mut result);
        }
    }
}

type PresentFn = Box<dyn FnOnce(&Queue) -> vk::Result + Send>;

enum SubmitEntry {
    Submit {
        list: CommandList,
        status: Arc<SubmitStatus>,
    },
    Present {
        present: PresentFn,
        status: Arc<SubmitStatus>,
    },
}

struct FinishEntry {
    list: CommandList,
    ticket: u64,
    result: Result<(), vk::Result>,
}

#[derive(Default)]
struct Progress {
    ///Command lists that were handed to [SubmissionQueue::submit] but not yet recycled.
    in_flight: usize,
    submitted: u64,
    completed: u64,
}

struct Shared {
    device: Arc<Device>,
    submit_ring: Ring<SubmitEntry>,
    finish_ring: Ring<FinishEntry>,
    free: Mutex<Vec<CommandList>>,
    progress: Mutex<Progress>,
    progress_changed: Condvar,
    last_error: Mutex<Option<QueueError>>,
    device_lost: AtomicBool,
}

impl Shared {
    fn record_error(&self, error: vk::Result) {
        let error = QueueError::from(error);
        #[cfg(feature = "logging")]
        log::error!("Submission failed: {}", error);

        *self.last_error.lock() = Some(error);
        if error == QueueError::DeviceLost {
            self.device_lost.store(true, Ordering::Release);
            //wake blocked submitters, they fail fast from now on
            self.progress_changed.notify_all();
        } else if let Err(e) = self.device.wait_idle() {
            #[cfg(feature = "logging")]
            log::error!("Waiting for idle device after failed submission: {}", e);
            if e == vk::Result::ERROR_DEVICE_LOST {
                *self.last_error.lock() = Some(QueueError::DeviceLost);
                self.device_lost.store(true, Ordering::Release);
                self.progress_changed.notify_all();
            }
        }
    }

    fn submit_loop(&self) {
        while let Some(entry) = self.submit_ring.pop() {
            match entry {
                SubmitEntry::Submit { mut list, status } => {
                    let result = if self.device_lost.load(Ordering::Acquire) {
                        Err(vk::Result::ERROR_DEVICE_LOST)
                    } else {
                        list.submit()
                    };
                    if let Err(e) = result {
                        self.record_error(e);
                    }
                    status.set(result.err().unwrap_or(vk::Result::SUCCESS));

                    let entry = FinishEntry {
                        list,
                        ticket: status.ticket,
                        result,
                    };
                    if let Err(entry) = self.finish_ring.push(entry) {
                        self.finish(entry);
                    }
                }
                SubmitEntry::Present { present, status } => {
                    let result = if self.device_lost.load(Ordering::Acquire) {
                        vk::Result::ERROR_DEVICE_LOST
                    } else {
                        let queue = &self.device.queues.graphics;
                        let _lock = queue.lock();
                        present(queue)
                    };
                    if result == vk::Result::ERROR_DEVICE_LOST {
                        self.record_error(result);
                    }
                    status.set(result);
                }
            }
        }
    }

    fn finish_loop(&self) {
        while let Some(entry) = self.finish_ring.pop() {
            self.finish(entry);
        }
    }

    fn finish(&self, entry: FinishEntry) {
        let FinishEntry {
            mut list,
            ticket,
            result,
        } = entry;

        //signals of lists that never executed are dropped by reset
        if result.is_ok() {
            match list.synchronize() {
                Ok(()) => list.notify_signals(),
                Err(e) => self.record_error(e),
            }
        }
        list.reset();
        self.free.lock().push(list);

        let mut progress = self.progress.lock();
        progress.in_flight -= 1;
        progress.completed = progress.completed.max(ticket);
        drop(progress);
        self.progress_changed.notify_all();
    }
}

///Submits command lists on a dedicated thread and recycles them on a second one once the GPU finished them.
///
/// At most [max_queued_command_buffers](dxvk::Options::max_queued_command_buffers) lists may be queued or executing at
/// any time. [submit](Self::submit) blocks until a slot is free, which bounds how far the recording thread can run
/// ahead of the GPU.
pub struct SubmissionQueue {
    shared: Arc<Shared>,
    ///Orders ticket assignment with the push into the submit ring.
    order: Mutex<()>,
    submit_thread: Option<JoinHandle<()>>,
    finish_thread: Option<JoinHandle<()>>,
}

impl SubmissionQueue {
    pub fn new(device: &Arc<Device>) -> Result<Self, CommandError> {
        let window = device.options.max_queued_command_buffers.max(1);
        let shared = Arc::new(Shared {
            device: device.clone(),
            //presents share the submit ring, give them some room on top of the command lists
            submit_ring: Ring::new(window + 4),
            finish_ring: Ring::new(window),
            free: Mutex::new(Vec::new()),
            progress: Mutex::new(Progress::default()),
            progress_changed: Condvar::new(),
            last_error: Mutex::new(None),
            device_lost: AtomicBool::new(false),
        });

        let submit_shared = shared.clone();
        let submit_thread = std::thread::Builder::new()
            .name("dxvk-submit".to_owned())
            .spawn(move || submit_shared.submit_loop())?;
        let finish_shared = shared.clone();
        let finish_thread = std::thread::Builder::new()
            .name("dxvk-finish".to_owned())
            .spawn(move || finish_shared.finish_loop())?;

        #[cfg(feature = "logging")]
        log::info!("Submission queue started, {} command lists in flight at most", window);

        Ok(SubmissionQueue {
            shared,
            order: Mutex::new(()),
            submit_thread: Some(submit_thread),
            finish_thread: Some(finish_thread),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    ///Returns a command list that is ready for recording. Recycles a completed list if there is one.
    pub fn get_command_list(&self) -> Result<CommandList, CommandError> {
        let recycled = self.shared.free.lock().pop();
        let mut list = match recycled {
            Some(list) => list,
            None => {
                #[cfg(feature = "logging")]
                log::trace!("Creating new command list");
                CommandList::new(&self.shared.device)?
            }
        };
        list.begin_recording()?;
        Ok(list)
    }

    ///Number of completed lists waiting for reuse.
    pub fn pooled_lists(&self) -> usize {
        self.shared.free.lock().len()
    }

    ///Ends recording of `list` and queues it for submission.
    ///
    /// Blocks while the maximum number of lists is in flight. Fails fast if the device was lost, in which case the list is
    /// reset and returned to the pool.
    pub fn submit(&self, mut list: CommandList) -> Result<Arc<SubmitStatus>, QueueError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if let Some(error) = self.last_error() {
            #[cfg(feature = "logging")]
            log::warn!("Rejecting submission, queue failed earlier: {}", error);
            list.reset();
            self.shared.free.lock().push(list);
            return Err(error);
        }

        if list.is_recording() {
            if let Err(e) = list.end_recording() {
                #[cfg(feature = "logging")]
                log::error!("Failed to end command list: {}", e);
                list.reset();
                self.shared.free.lock().push(list);
                return Err(match e {
                    CommandError::VkError(r) => QueueError::from(r),
                    _ => QueueError::SubmitFailed(vk::Result::ERROR_UNKNOWN),
                });
            }
        }

        let _order = self.order.lock();
        let window = self.shared.device.options.max_queued_command_buffers.max(1);
        let mut progress = self.shared.progress.lock();
        while progress.in_flight >= window && !self.is_device_lost() {
            self.shared.progress_changed.wait(&mut progress);
        }
        if self.is_device_lost() {
            drop(progress);
            list.reset();
            self.shared.free.lock().push(list);
            return Err(QueueError::DeviceLost);
        }
        progress.in_flight += 1;
        progress.submitted += 1;
        let status = SubmitStatus::new(progress.submitted);
        drop(progress);

        let entry = SubmitEntry::Submit {
            list,
            status: status.clone(),
        };
        if let Err(entry) = self.shared.submit_ring.push(entry) {
            if let SubmitEntry::Submit { mut list, .. } = entry {
                list.reset();
                self.shared.free.lock().push(list);
            }
            let mut progress = self.shared.progress.lock();
            progress.in_flight -= 1;
            return Err(QueueError::Closed);
        }
        Ok(status)
    }

    ///Queues `present` behind every command list submitted so far. It is called on the submit thread with the graphics
    /// queue locked.
    pub fn present(
        &self,
        present: impl FnOnce(&Queue) -> vk::Result + Send + 'static,
    ) -> Result<Arc<SubmitStatus>, QueueError> {
        if self.is_device_lost() {
            return Err(QueueError::DeviceLost);
        }
        let _order = self.order.lock();
        let status = SubmitStatus::new(self.shared.progress.lock().submitted);
        let entry = SubmitEntry::Present {
            present: Box::new(present),
            status: status.clone(),
        };
        self.shared
            .submit_ring
            .push(entry)
            .map_err(|_| QueueError::Closed)?;
        Ok(status)
    }

    ///Blocks until the list with `ticket` completed and was recycled.
    pub fn wait_for(&self, ticket: u64) -> Result<(), QueueError> {
        let mut progress = self.shared.progress.lock();
        while progress.completed < ticket && progress.in_flight > 0 {
            self.shared.progress_changed.wait(&mut progress);
        }
        drop(progress);
        if self.is_device_lost() {
            return Err(QueueError::DeviceLost);
        }
        Ok(())
    }

    ///Blocks until every queued present ran and every submitted list completed.
    pub fn wait_for_idle(&self) -> Result<(), QueueError> {
        self.shared.submit_ring.wait_empty();
        let mut progress = self.shared.progress.lock();
        while progress.in_flight > 0 {
            self.shared.progress_changed.wait(&mut progress);
        }
        drop(progress);
        self.last_error().map_or(Ok(()), Err)
    }

    ///Number of lists that were submitted but not yet recycled.
    pub fn in_flight(&self) -> usize {
        self.shared.progress.lock().in_flight
    }

    pub fn last_error(&self) -> Option<QueueError> {
        *self.shared.last_error.lock()
    }

    ///Clears a stored submission error. Device loss can not be cleared.
    pub fn clear_error(&self) {
        let mut error = self.shared.last_error.lock();
        if *error != Some(QueueError::DeviceLost) {
            *error = None;
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    ///Locks the graphics queue for external users, for instance a swapchain that presents outside of [present](Self::present).
    pub fn lock_device_queue(&self) -> MutexGuard<'_, ()> {
        self.shared.device.queues.graphics.lock()
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        self.shared.submit_ring.close();
        if let Some(thread) = self.submit_thread.take() {
            if thread.join().is_err() {
                #[cfg(feature = "logging")]
                log::error!("Submit thread panicked");
            }
        }
        self.shared.finish_ring.close();
        if let Some(thread) = self.finish_thread.take() {
            if thread.join().is_err() {
                #[cfg(feature = "logging")]
                log::error!("Finish thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dxvk::{
        Options,
        ash::vk::Handle,
        device::DeviceFeatures,
        resources::{BufDesc, Buffer},
        testing::SoftDevice,
    };
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Access;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(SubmissionQueue: Send, Sync);
        assert_impl_all!(SubmitStatus: Send, Sync);
    }

    #[test]
    fn lists_are_recycled() {
        let (device, soft) = SoftDevice::device_default();
        let queue = SubmissionQueue::new(&device).unwrap();

        let list = queue.get_command_list().unwrap();
        let status = queue.submit(list).unwrap();
        assert_eq!(status.wait(), vk::Result::SUCCESS);
        queue.wait_for(status.ticket()).unwrap();
        assert_eq!(queue.pooled_lists(), 1);
        assert_eq!(queue.in_flight(), 0);

        let objects = soft.live_objects();
        let list = queue.get_command_list().unwrap();
        assert_eq!(queue.pooled_lists(), 0);
        assert_eq!(soft.live_objects(), objects);
        queue.submit(list).unwrap();
        queue.wait_for_idle().unwrap();
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn submit_blocks_while_window_is_full() {
        let options = Options::default().with_max_queued_command_buffers(2);
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        soft.set_manual_completion(true);
        let queue = SubmissionQueue::new(&device).unwrap();

        for _ in 0..2 {
            let list = queue.get_command_list().unwrap();
            queue.submit(list).unwrap();
        }

        let third_submitted = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                let list = queue.get_command_list().unwrap();
                queue.submit(list).unwrap();
                third_submitted.store(true, Ordering::SeqCst);
            });

            std::thread::sleep(Duration::from_millis(50));
            assert!(!third_submitted.load(Ordering::SeqCst));
            assert_eq!(queue.in_flight(), 2);

            //wait until the submit thread handed both lists to the device
            while soft.pending_submissions() < 2 {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(soft.complete_next());
        });
        assert!(third_submitted.load(Ordering::SeqCst));

        soft.set_manual_completion(false);
        queue.wait_for_idle().unwrap();
        assert_eq!(soft.submit_count(), 3);
    }

    #[test]
    fn resources_live_until_completion() {
        let (device, soft) = SoftDevice::device_default();
        soft.set_manual_completion(true);
        let queue = SubmissionQueue::new(&device).unwrap();

        let mut list = queue.get_command_list().unwrap();
        let buffer = Buffer::new(&device, BufDesc::device_local(256)).unwrap();
        list.track(&buffer.storage(), Access::READ);
        list.track(&buffer, Access::READ);
        drop(buffer);
        let status = queue.submit(list).unwrap();
        assert_eq!(status.wait(), vk::Result::SUCCESS);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(soft.live_buffers(), 1);

        soft.set_manual_completion(false);
        queue.wait_for(status.ticket()).unwrap();
        assert_eq!(soft.live_buffers(), 0);
    }

    #[test]
    fn device_loss_is_sticky() {
        let (device, soft) = SoftDevice::device_default();
        let queue = SubmissionQueue::new(&device).unwrap();
        soft.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let list = queue.get_command_list().unwrap();
        let status = queue.submit(list).unwrap();
        assert_eq!(status.wait(), vk::Result::ERROR_DEVICE_LOST);
        assert!(queue.is_device_lost());
        assert_eq!(queue.last_error(), Some(QueueError::DeviceLost));

        let list = queue.get_command_list().unwrap();
        assert_eq!(queue.submit(list).unwrap_err(), QueueError::DeviceLost);
        queue.clear_error();
        assert_eq!(queue.last_error(), Some(QueueError::DeviceLost));
        assert!(queue.present(|_| vk::Result::SUCCESS).is_err());
    }

    #[test]
    fn submit_errors_are_kept_until_cleared() {
        let (device, soft) = SoftDevice::device_default();
        let queue = SubmissionQueue::new(&device).unwrap();
        soft.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let list = queue.get_command_list().unwrap();
        let status = queue.submit(list).unwrap();
        assert_eq!(status.wait(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        queue.wait_for(status.ticket()).unwrap();
        assert_eq!(
            queue.last_error(),
            Some(QueueError::SubmitFailed(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        );
        //the failed list is recycled nonetheless
        assert_eq!(queue.pooled_lists(), 1);

        //nothing reaches the device until the error is cleared
        let list = queue.get_command_list().unwrap();
        assert_eq!(
            queue.submit(list).unwrap_err(),
            QueueError::SubmitFailed(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(soft.submit_count(), 0);
        assert_eq!(queue.pooled_lists(), 1);

        queue.clear_error();
        assert_eq!(queue.last_error(), None);
        let list = queue.get_command_list().unwrap();
        assert_eq!(queue.submit(list).unwrap().wait(), vk::Result::SUCCESS);
        assert!(!queue.is_device_lost());
    }

    #[test]
    fn present_runs_after_submissions() {
        let (device, soft) = SoftDevice::device_default();
        let queue = SubmissionQueue::new(&device).unwrap();

        let list = queue.get_command_list().unwrap();
        queue.submit(list).unwrap();
        let soft_in_present = soft.clone();
        let status = queue
            .present(move |q| {
                assert_eq!(soft_in_present.submit_count(), 1);
                assert_eq!(q.inner, vk::Queue::from_raw(0x1000));
                vk::Result::SUBOPTIMAL_KHR
            })
            .unwrap();
        assert_eq!(status.wait(), vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(status.ticket(), 1);
        queue.wait_for_idle().unwrap();
    }
}
