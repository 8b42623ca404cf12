use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{
    ResourceError,
    device::{BufferCreateInfo, Device, RawBuffer},
    util::{next_cookie, ranges_overlap},
};

use super::SHADER_STAGES;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        ///Sparse residency. Storage can not be replaced.
        const SPARSE = 1 << 0;
        ///Memory owned by somebody else. Storage can not be replaced and is not destroyed by the core.
        const IMPORTED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    pub flags: BufferFlags,
    ///All stages the buffer may be used in.
    pub stages: vk::PipelineStageFlags2,
    ///All access types the buffer may be used with.
    pub access: vk::AccessFlags2,
}

impl BufDesc {
    ///Creates a description where stages and access flags are derived from `usage`.
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags, memory: vk::MemoryPropertyFlags) -> Self {
        let (stages, access) = Self::usage_stages_access(usage);
        BufDesc {
            size,
            usage,
            memory,
            flags: BufferFlags::empty(),
            stages,
            access,
        }
    }

    ///Device local buffer that can be used for transfers, indirect draws, vertex/index input and as storage buffer.
    pub fn device_local(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
    }

    ///Host visible staging buffer.
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn usage_stages_access(usage: vk::BufferUsageFlags) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        let mut stages = vk::PipelineStageFlags2::empty();
        let mut access = vk::AccessFlags2::empty();

        let mut add = |u: vk::BufferUsageFlags, s: vk::PipelineStageFlags2, a: vk::AccessFlags2| {
            if usage.contains(u) {
                stages |= s;
                access |= a;
            }
        };

        add(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        );
        add(
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        add(
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        );
        add(
            vk::BufferUsageFlags::INDEX_BUFFER,
            vk::PipelineStageFlags2::INDEX_INPUT,
            vk::AccessFlags2::INDEX_READ,
        );
        add(
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
        );
        add(vk::BufferUsageFlags::UNIFORM_BUFFER, SHADER_STAGES, vk::AccessFlags2::UNIFORM_READ);
        add(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
            SHADER_STAGES,
            vk::AccessFlags2::SHADER_READ,
        );
        add(
            vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
            SHADER_STAGES,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        );
        add(
            vk::BufferUsageFlags::STORAGE_BUFFER,
            SHADER_STAGES,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        );
        add(
            vk::BufferUsageFlags::TRANSFORM_FEEDBACK_BUFFER_EXT,
            vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT,
            vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT,
        );
        add(
            vk::BufferUsageFlags::TRANSFORM_FEEDBACK_COUNTER_BUFFER_EXT,
            vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT | vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_READ_EXT
                | vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT,
        );

        (stages, access)
    }

    fn create_info(&self) -> BufferCreateInfo {
        BufferCreateInfo {
            size: self.size,
            usage: self.usage,
            memory: self.memory,
            flags: if self.flags.contains(BufferFlags::SPARSE) {
                vk::BufferCreateFlags::SPARSE_BINDING | vk::BufferCreateFlags::SPARSE_RESIDENCY
            } else {
                vk::BufferCreateFlags::empty()
            },
        }
    }
}

///One backing allocation of a [Buffer]. A buffer might cycle through many of those when it is discarded.
pub struct BufferStorage {
    pub raw: RawBuffer,
    pub device: Arc<Device>,
    cookie: u64,
    owned: bool,
}

impl BufferStorage {
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn handle(&self) -> vk::Buffer {
        self.raw.buffer
    }

    ///Host pointer to `offset`, if the storage is mapped.
    pub fn mapped_ptr(&self, offset: vk::DeviceSize) -> Option<*mut u8> {
        let mapped = self.raw.mapped?;
        if offset >= self.raw.size {
            return None;
        }
        //Safety: offset is within the mapped range
        Some(unsafe { mapped.0.as_ptr().add(offset as usize) })
    }

    fn check_range(&self, offset: vk::DeviceSize, len: usize) -> Result<*mut u8, ResourceError> {
        let end = offset.saturating_add(len as vk::DeviceSize);
        if end > self.raw.size {
            return Err(ResourceError::OutOfBounds {
                offset,
                end,
                size: self.raw.size,
            });
        }
        let mapped = self.raw.mapped.ok_or(ResourceError::NotMappable)?;
        //Safety: checked above that offset..end is inside the mapping
        Ok(unsafe { mapped.0.as_ptr().add(offset as usize) })
    }

    ///Writes `data` at `offset` through the host mapping.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<(), ResourceError> {
        let dst = self.check_range(offset, data.len())?;
        //Safety: the range is checked, and host mapped memory never aliases `data`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    ///Reads `dst.len()` bytes starting at `offset` through the host mapping.
    pub fn read(&self, offset: vk::DeviceSize, dst: &mut [u8]) -> Result<(), ResourceError> {
        let src = self.check_range(offset, dst.len())?;
        //Safety: see write
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        if self.owned {
            self.device.inner.destroy_buffer(&self.raw);
        }
    }
}

///Buffer whose backing storage can be exchanged ("renamed") without the users of the buffer noticing.
pub struct Buffer {
    pub desc: BufDesc,
    pub device: Arc<Device>,
    cookie: u64,
    storage: Mutex<Arc<BufferStorage>>,
}

impl Buffer {
    pub fn new(device: &Arc<Device>, desc: BufDesc) -> Result<Arc<Self>, ResourceError> {
        let raw = device.inner.create_buffer(&desc.create_info())?;
        let storage = Arc::new(BufferStorage {
            raw,
            device: device.clone(),
            cookie: next_cookie(),
            owned: true,
        });

        Ok(Arc::new(Buffer {
            desc,
            device: device.clone(),
            cookie: next_cookie(),
            storage: Mutex::new(storage),
        }))
    }

    ///Wraps a buffer created outside of the core. The buffer is flagged as [imported](BufferFlags::IMPORTED) and
    /// is never destroyed by the core.
    pub fn import(device: &Arc<Device>, mut desc: BufDesc, raw: RawBuffer) -> Arc<Self> {
        desc.flags |= BufferFlags::IMPORTED;
        Arc::new(Buffer {
            desc,
            device: device.clone(),
            cookie: next_cookie(),
            storage: Mutex::new(Arc::new(BufferStorage {
                raw,
                device: device.clone(),
                cookie: next_cookie(),
                owned: false,
            })),
        })
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    ///Current backing storage.
    pub fn storage(&self) -> Arc<BufferStorage> {
        self.storage.lock().clone()
    }

    pub fn handle(&self) -> vk::Buffer {
        self.storage.lock().raw.buffer
    }

    ///Allocates a new storage compatible with this buffer. The storage is not yet used, see [assign_storage](Self::assign_storage).
    pub fn allocate_storage(&self) -> Result<Arc<BufferStorage>, ResourceError> {
        let raw = self.device.inner.create_buffer(&self.desc.create_info())?;
        Ok(Arc::new(BufferStorage {
            raw,
            device: self.device.clone(),
            cookie: next_cookie(),
            owned: true,
        }))
    }

    ///Replaces the backing storage and returns the previous one. In-flight command lists keep
    /// their own reference to the old storage.
    pub fn assign_storage(&self, storage: Arc<BufferStorage>) -> Arc<BufferStorage> {
        std::mem::replace(&mut *self.storage.lock(), storage)
    }

    pub fn is_host_visible(&self) -> bool {
        self.desc.memory.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    ///True if the storage may be exchanged instead of being updated in place.
    pub fn can_rename(&self) -> bool {
        !self.desc.flags.intersects(BufferFlags::SPARSE | BufferFlags::IMPORTED)
    }

    pub fn slice_handle(&self, offset: vk::DeviceSize, length: vk::DeviceSize) -> BufferSliceHandle {
        let storage = self.storage.lock();
        BufferSliceHandle {
            handle: storage.raw.buffer,
            offset,
            length,
            address: if storage.raw.address == 0 {
                0
            } else {
                storage.raw.address + offset
            },
        }
    }
}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cookie.hash(state)
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.cookie == other.cookie
    }
}

impl Eq for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("cookie", &self.cookie)
            .field("desc", &self.desc)
            .finish()
    }
}

///Raw handle and range of a [BufferSlice] at the time the handle was queried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferSliceHandle {
    pub handle: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub length: vk::DeviceSize,
    pub address: vk::DeviceAddress,
}

///Range of a buffer.
#[derive(Clone, Debug)]
pub struct BufferSlice {
    pub buffer: Arc<Buffer>,
    pub offset: vk::DeviceSize,
    pub length: vk::DeviceSize,
}

impl BufferSlice {
    pub fn new(buffer: Arc<Buffer>, offset: vk::DeviceSize, length: vk::DeviceSize) -> Self {
        BufferSlice { buffer, offset, length }
    }

    ///Slice covering the whole buffer.
    pub fn whole(buffer: Arc<Buffer>) -> Self {
        let length = buffer.desc.size;
        BufferSlice {
            buffer,
            offset: 0,
            length,
        }
    }

    pub fn handle(&self) -> BufferSliceHandle {
        self.buffer.slice_handle(self.offset, self.length)
    }

    ///Sub-slice relative to this slice.
    pub fn sub_slice(&self, offset: vk::DeviceSize, length: vk::DeviceSize) -> Self {
        BufferSlice {
            buffer: self.buffer.clone(),
            offset: self.offset + offset,
            length: length.min(self.length.saturating_sub(offset)),
        }
    }

    ///True if both slices describe exactly the same range of the same buffer.
    pub fn matches(&self, other: &BufferSlice) -> bool {
        self.buffer.cookie == other.buffer.cookie && self.offset == other.offset && self.length == other.length
    }

    pub fn overlaps(&self, other: &BufferSlice) -> bool {
        self.buffer.cookie == other.buffer.cookie && ranges_overlap(self.offset, self.length, other.offset, other.length)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferViewDesc {
    pub format: vk::Format,
    pub offset: vk::DeviceSize,
    pub length: vk::DeviceSize,
}

///Vulkan buffer view for one specific storage. Keeps that storage alive.
pub struct RawBufferView {
    pub handle: vk::BufferView,
    pub storage: Arc<BufferStorage>,
}

impl Drop for RawBufferView {
    fn drop(&mut self) {
        self.storage.device.inner.destroy_buffer_view(self.handle);
    }
}

///Formatted view of a buffer. The Vulkan view is recreated lazily whenever the buffer's storage was replaced.
pub struct BufferView {
    pub desc: BufferViewDesc,
    pub buffer: Arc<Buffer>,
    cookie: u64,
    current: Mutex<Arc<RawBufferView>>,
}

impl BufferView {
    pub fn new(buffer: Arc<Buffer>, desc: BufferViewDesc) -> Result<Arc<Self>, ResourceError> {
        let storage = buffer.storage();
        let raw = Self::create_raw(&storage, &desc)?;
        Ok(Arc::new(BufferView {
            desc,
            buffer,
            cookie: next_cookie(),
            current: Mutex::new(Arc::new(raw)),
        }))
    }

    fn create_raw(storage: &Arc<BufferStorage>, desc: &BufferViewDesc) -> Result<RawBufferView, ResourceError> {
        let handle =
            storage
                .device
                .inner
                .create_buffer_view(storage.raw.buffer, desc.format, desc.offset, desc.length)?;
        Ok(RawBufferView {
            handle,
            storage: storage.clone(),
        })
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    ///Returns the view for the buffer's current storage, recreating it if needed.
    pub fn view(&self) -> Result<Arc<RawBufferView>, ResourceError> {
        let storage = self.buffer.storage();
        let mut current = self.current.lock();
        if current.storage.cookie != storage.cookie {
            *current = Arc::new(Self::create_raw(&storage, &self.desc)?);
        }
        Ok(current.clone())
    }

    pub fn slice(&self) -> BufferSlice {
        BufferSlice::new(self.buffer.clone(), self.desc.offset, self.desc.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SoftDevice;

    #[test]
    fn usage_derives_stages() {
        let desc = BufDesc::new(
            64,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert!(desc.stages.contains(vk::PipelineStageFlags2::INDEX_INPUT));
        assert!(desc.access.contains(vk::AccessFlags2::TRANSFER_WRITE));
        assert!(!desc.access.contains(vk::AccessFlags2::SHADER_WRITE));
    }

    #[test]
    fn renamed_storage_outlives_buffer_handle() {
        let (device, soft) = SoftDevice::device_default();
        let buffer = Buffer::new(&device, BufDesc::device_local(128)).unwrap();
        let old = buffer.storage();
        let new = buffer.allocate_storage().unwrap();
        let new_handle = new.handle();
        let returned = buffer.assign_storage(new);

        assert_eq!(returned.cookie(), old.cookie());
        assert_eq!(buffer.handle(), new_handle);
        assert_eq!(soft.live_buffers(), 2);
        drop(returned);
        drop(old);
        assert_eq!(soft.live_buffers(), 1);
    }

    #[test]
    fn host_access_is_bounds_checked() {
        let (device, _soft) = SoftDevice::device_default();
        let buffer = Buffer::new(&device, BufDesc::staging(16)).unwrap();
        let storage = buffer.storage();
        storage.write(4, &[1, 2, 3, 4]).unwrap();
        let mut dst = [0u8; 4];
        storage.read(4, &mut dst).unwrap();
        assert_eq!(dst, [1, 2, 3, 4]);
        assert!(matches!(
            storage.write(14, &[0; 4]),
            Err(ResourceError::OutOfBounds { .. })
        ));

        let local = Buffer::new(&device, BufDesc::device_local(16)).unwrap();
        assert!(matches!(local.storage().write(0, &[0; 4]), Err(ResourceError::NotMappable)));
    }

    #[test]
    fn buffer_view_follows_storage() {
        let (device, _soft) = SoftDevice::device_default();
        let buffer = Buffer::new(&device, BufDesc::device_local(256)).unwrap();
        let view = BufferView::new(
            buffer.clone(),
            BufferViewDesc {
                format: vk::Format::R32_UINT,
                offset: 0,
                length: 256,
            },
        )
        .unwrap();

        let first = view.view().unwrap();
        assert_eq!(view.view().unwrap().handle, first.handle);
        buffer.assign_storage(buffer.allocate_storage().unwrap());
        let second = view.view().unwrap();
        assert_ne!(second.handle, first.handle);
        assert_eq!(second.storage.handle(), buffer.handle());
    }
}
