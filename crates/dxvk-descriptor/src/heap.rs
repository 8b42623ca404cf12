use std::sync::Arc;

use dxvk::{
    ash::vk,
    device::Device,
    resources::{BufDesc, Buffer, BufferStorage},
    util::align,
};
use dxvk_commands::{CmdBuffer, CommandList};
use parking_lot::Mutex;

use crate::DescriptorError;

///Space for one descriptor set inside a heap chunk.
#[derive(Clone)]
pub struct HeapAllocation {
    pub storage: Arc<BufferStorage>,
    pub offset: vk::DeviceSize,
    ///Set if the allocation starts a new chunk. Offsets of sets in the old chunk are invalid once the new one is bound.
    pub switched: bool,
}

///Linear allocator for descriptor set data in the descriptor buffer model.
///
/// Descriptor data lives in host visible chunks. A chunk is filled front to back and replaced once full. Like descriptor
/// pools, full chunks are handed to the current command list and recycled once it completed.
pub struct DescriptorHeap {
    device: Arc<Device>,
    chunk_size: vk::DeviceSize,
    current: Option<Arc<BufferStorage>>,
    offset: vk::DeviceSize,
    free: Arc<Mutex<Vec<Arc<BufferStorage>>>>,
    bound: bool,
    created: usize,
}

impl DescriptorHeap {
    pub const DEFAULT_CHUNK_SIZE: vk::DeviceSize = 1 << 20;

    pub const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
        vk::BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER_EXT.as_raw()
            | vk::BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER_EXT.as_raw()
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
    );

    pub fn new(device: &Arc<Device>, chunk_size: vk::DeviceSize) -> Self {
        DescriptorHeap {
            device: device.clone(),
            chunk_size,
            current: None,
            offset: 0,
            free: Arc::new(Mutex::new(Vec::new())),
            bound: false,
            created: 0,
        }
    }

    pub fn chunk_size(&self) -> vk::DeviceSize {
        self.chunk_size
    }

    ///Allocates `size` bytes of set data.
    pub fn allocate(&mut self, list: &mut CommandList, size: vk::DeviceSize) -> Result<HeapAllocation, DescriptorError> {
        if size > self.chunk_size {
            return Err(DescriptorError::SetTooLarge {
                size,
                chunk_size: self.chunk_size,
            });
        }

        let alignment = self.device.limits.descriptor_buffer_offset_alignment.max(1);
        let aligned = align(self.offset, alignment);

        let fitting = self.current.clone().filter(|_| aligned + size <= self.chunk_size);
        let allocation = match fitting {
            Some(chunk) => HeapAllocation {
                storage: chunk,
                offset: aligned,
                switched: false,
            },
            None => {
                if let Some(old) = self.current.take() {
                    let free = self.free.clone();
                    list.on_reset(move || free.lock().push(old));
                }
                let chunk = self.next_chunk()?;
                self.current = Some(chunk.clone());
                self.bound = false;
                HeapAllocation {
                    storage: chunk,
                    offset: 0,
                    switched: true,
                }
            }
        };

        self.offset = allocation.offset + size;
        Ok(allocation)
    }

    fn next_chunk(&mut self) -> Result<Arc<BufferStorage>, DescriptorError> {
        if let Some(chunk) = self.free.lock().pop() {
            return Ok(chunk);
        }
        self.created += 1;
        #[cfg(feature = "logging")]
        log::debug!("Creating descriptor heap chunk #{} of {} bytes", self.created, self.chunk_size);

        let desc = BufDesc::new(
            self.chunk_size,
            Self::USAGE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        Ok(Buffer::new(&self.device, desc)?.storage())
    }

    ///Binds the current chunk to `list`'s exec buffer, unless it is bound already.
    pub fn bind(&mut self, list: &mut CommandList) {
        if self.bound {
            return;
        }
        let Some(chunk) = &self.current else {
            return;
        };
        list.track(chunk, dxvk_commands::Access::READ);
        let cb = list.cmd_buffer(CmdBuffer::Exec);
        self.device
            .inner
            .cmd_bind_descriptor_buffers(cb, &[(chunk.raw.address, Self::USAGE)]);
        self.bound = true;
    }

    ///Forgets the binding state. Called whenever recording into a new command list starts.
    pub fn begin_list(&mut self) {
        self.bound = false;
    }

    pub fn current_chunk(&self) -> Option<&Arc<BufferStorage>> {
        self.current.as_ref()
    }

    pub fn created_chunks(&self) -> usize {
        self.created
    }

    pub fn free_chunks(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{
        Options,
        device::DeviceFeatures,
        testing::{Command, SoftDevice},
    };

    use super::*;

    #[test]
    fn allocations_are_aligned_and_chunks_recycled() {
        let features = DeviceFeatures {
            descriptor_buffer: true,
            ..Default::default()
        };
        let (device, soft) = SoftDevice::device(features, Options::default(), false);
        let mut heap = DescriptorHeap::new(&device, 256);
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();

        let a = heap.allocate(&mut list, 48).unwrap();
        assert!(a.switched);
        assert_eq!(a.offset, 0);
        let b = heap.allocate(&mut list, 48).unwrap();
        assert!(!b.switched);
        assert_eq!(b.offset, 64);
        heap.bind(&mut list);
        heap.bind(&mut list);

        let c = heap.allocate(&mut list, 200).unwrap();
        assert!(c.switched);
        assert_eq!(c.offset, 0);
        assert_eq!(heap.created_chunks(), 2);
        heap.bind(&mut list);

        assert!(heap.allocate(&mut list, 512).is_err());

        list.end_recording().unwrap();
        list.submit().unwrap();
        let binds = soft
            .submitted_commands()
            .into_iter()
            .filter(|c| matches!(c, Command::BindDescriptorBuffers(_)))
            .count();
        assert_eq!(binds, 2);

        list.synchronize().unwrap();
        list.reset();
        assert_eq!(heap.free_chunks(), 1);
    }
}
