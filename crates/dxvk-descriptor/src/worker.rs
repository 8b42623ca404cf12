use std::{sync::Arc, thread::JoinHandle};

use dxvk::{
    ash::vk,
    device::{DescriptorInfo, Device},
    resources::BufferStorage,
    sync::Ring,
};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::DescriptorError;

///Uniform buffer descriptor to write: `range` bytes at `address`, written to `dst_offset` of the heap chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UniformDescriptor {
    pub dst_offset: vk::DeviceSize,
    pub address: vk::DeviceAddress,
    pub range: vk::DeviceSize,
}

const BLOCK_SIZE: usize = 16;
const RING_SIZE: usize = 256;

///Fixed size unit of work. The ring pre-allocates its slots, so pushing a block never allocates.
struct CopyBlock {
    storage: Arc<BufferStorage>,
    count: usize,
    descriptors: [UniformDescriptor; BLOCK_SIZE],
}

struct WorkerShared {
    device: Arc<Device>,
    ring: Ring<CopyBlock>,
    ///Number of blocks that were fully written.
    done: Mutex<u64>,
    done_changed: Condvar,
}

impl WorkerShared {
    fn run(&self) {
        let size = self
            .device
            .limits
            .descriptor_sizes
            .get(vk::DescriptorType::UNIFORM_BUFFER);
        let mut bytes = SmallVec::<[u8; 64]>::from_elem(0, size);

        while let Some(block) = self.ring.pop() {
            for descriptor in &block.descriptors[..block.count] {
                let info = if descriptor.address == 0 {
                    DescriptorInfo::Null
                } else {
                    DescriptorInfo::Address {
                        address: descriptor.address,
                        range: descriptor.range,
                    }
                };
                self.device
                    .inner
                    .get_descriptor(vk::DescriptorType::UNIFORM_BUFFER, &info, &mut bytes);
                if let Err(_e) = block.storage.write(descriptor.dst_offset, &bytes) {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to write uniform descriptor: {}", _e);
                }
            }

            *self.done.lock() += 1;
            self.done_changed.notify_all();
        }
    }
}

///Background thread that writes uniform buffer descriptors into descriptor heap memory.
///
/// The render thread only copies address/size pairs into the ring and continues. It blocks only if the ring is full.
/// [sync](Self::sync) has to be called before submitting a command list that reads any of the written descriptors.
pub struct DescriptorCopyWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl DescriptorCopyWorker {
    pub fn new(device: &Arc<Device>) -> Result<Self, DescriptorError> {
        let shared = Arc::new(WorkerShared {
            device: device.clone(),
            ring: Ring::new(RING_SIZE),
            done: Mutex::new(0),
            done_changed: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("dxvk-descriptor-copy".to_owned())
            .spawn(move || thread_shared.run())?;

        Ok(DescriptorCopyWorker {
            shared,
            thread: Some(thread),
        })
    }

    ///Queues `descriptors` for writing into `storage`. Returns the append counter after the last pushed block.
    pub fn push(&self, storage: &Arc<BufferStorage>, descriptors: &[UniformDescriptor]) -> Result<u64, DescriptorError> {
        let mut counter = self.shared.ring.appended();
        for chunk in descriptors.chunks(BLOCK_SIZE) {
            let mut block = CopyBlock {
                storage: storage.clone(),
                count: chunk.len(),
                descriptors: [UniformDescriptor::default(); BLOCK_SIZE],
            };
            block.descriptors[..chunk.len()].copy_from_slice(chunk);
            counter = self
                .shared
                .ring
                .push(block)
                .map_err(|_| DescriptorError::WorkerClosed)?;
        }
        Ok(counter)
    }

    ///Blocks until every block pushed so far was written.
    pub fn sync(&self) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let target = self.shared.ring.appended();
        let mut done = self.shared.done.lock();
        while *done < target {
            self.shared.done_changed.wait(&mut done);
        }
    }

    ///Number of blocks written so far.
    pub fn completed(&self) -> u64 {
        *self.shared.done.lock()
    }
}

impl Drop for DescriptorCopyWorker {
    fn drop(&mut self) {
        self.shared.ring.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                #[cfg(feature = "logging")]
                log::error!("Descriptor copy worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{
        Options,
        device::DeviceFeatures,
        resources::{BufDesc, Buffer},
        testing::SoftDevice,
    };
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DescriptorCopyWorker: Send, Sync);
    }

    #[test]
    fn sync_makes_writes_visible() {
        let features = DeviceFeatures {
            descriptor_buffer: true,
            ..Default::default()
        };
        let (device, soft) = SoftDevice::device(features, Options::default(), false);
        let storage = Buffer::new(
            &device,
            BufDesc::new(
                1024,
                vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
        )
        .unwrap()
        .storage();
        let worker = DescriptorCopyWorker::new(&device).unwrap();

        //more than one block
        let descriptors = (0..40u64)
            .map(|i| UniformDescriptor {
                dst_offset: i * 16,
                address: 0x1000 + i,
                range: 256,
            })
            .collect::<Vec<_>>();
        let counter = worker.push(&storage, &descriptors[..20]).unwrap();
        assert_eq!(counter, 2);
        worker.push(&storage, &descriptors[20..]).unwrap();
        worker.sync();
        assert_eq!(worker.completed(), 4);

        let bytes = soft.buffer_contents(storage.handle());
        for (i, d) in descriptors.iter().enumerate() {
            let at = i * 16;
            assert_eq!(&bytes[at..at + 8], &d.address.to_le_bytes());
            assert_eq!(&bytes[at + 8..at + 16], &256u64.to_le_bytes());
        }
    }
}
