use ahash::AHashMap;
use bitflags::bitflags;
use dxvk::{
    BarrierControl,
    ash::vk,
    device::{ImageBarrier, MemoryBarrier, RawDevice},
    resources::{BufferSliceHandle, WRITE_ACCESS},
    util::{ranges_overlap, subresources_equal, subresources_overlap},
};
use smallvec::SmallVec;
use tinyvec::TinyVec;

bitflags! {
    ///Hazard class of an access. An empty set marks a resource that is used without any ordering requirement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Access {
    pub fn from_vk(access: vk::AccessFlags2) -> Self {
        let mut result = Access::empty();
        if access.intersects(WRITE_ACCESS) {
            result |= Access::WRITE;
        }
        if access.as_raw() & !WRITE_ACCESS.as_raw() != 0 {
            result |= Access::READ;
        }
        result
    }

    ///True if an access of class `self` has to wait for a pending access of class `pending`.
    ///
    /// If `ignore_waw` is set, a write does not wait for pending writes, only for pending reads. A read-write access counts
    /// as a write, its reads see whatever the skipped barrier would have ordered.
    pub fn conflicts_with(self, pending: Access, ignore_waw: bool) -> bool {
        if ignore_waw && self.contains(Access::WRITE) && pending.contains(Access::WRITE) {
            return false;
        }
        let after_write = pending.contains(Access::WRITE) && self.contains(Access::READ);
        let waw = pending.contains(Access::WRITE) && self.contains(Access::WRITE) && !ignore_waw;
        let war = pending.contains(Access::READ) && self.contains(Access::WRITE);
        after_write || waw || war
    }
}

#[derive(Clone, Copy, Debug)]
struct BufferRange {
    offset: vk::DeviceSize,
    length: vk::DeviceSize,
    access: Access,
}

#[derive(Clone, Copy, Debug)]
struct ImageRange {
    range: vk::ImageSubresourceRange,
    access: Access,
}

///Stages from which pending writes may be ignored if write-after-write hazards are relaxed.
const WAW_SAFE_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw() | vk::PipelineStageFlags2::DRAW_INDIRECT.as_raw(),
);

///Pending barriers of one command buffer.
///
/// Every access recorded via [access_buffer](Self::access_buffer) or [access_image](Self::access_image) describes an
/// operation that was *already recorded*, together with the stages and access types the resource may be used with
/// afterwards. Buffer dependencies (and image dependencies without layout change) are merged into a single global memory
/// barrier, layout transitions are kept per image and merged where possible.
///
/// Before recording an operation the caller asks [is_buffer_dirty](Self::is_buffer_dirty) (or
/// [is_image_dirty](Self::is_image_dirty)) and flushes the set via [record_commands](Self::record_commands) if the
/// operation conflicts with anything pending.
#[derive(Debug)]
pub struct BarrierSet {
    control: BarrierControl,
    memory: MemoryBarrier,
    images: TinyVec<[ImageBarrier; 6]>,
    buffer_ranges: AHashMap<vk::Buffer, SmallVec<[BufferRange; 2]>>,
    image_ranges: AHashMap<vk::Image, SmallVec<[ImageRange; 2]>>,
}

impl BarrierSet {
    pub fn new(control: BarrierControl) -> Self {
        BarrierSet {
            control,
            memory: MemoryBarrier::default(),
            images: TinyVec::default(),
            buffer_ranges: AHashMap::default(),
            image_ranges: AHashMap::default(),
        }
    }

    pub fn control(&self) -> BarrierControl {
        self.control
    }

    ///Changes the policy for everything checked from now on. Pending barriers are kept.
    pub fn set_control(&mut self, control: BarrierControl) {
        self.control = control;
    }

    ///Adds a global memory dependency that is not associated with any tracked range.
    pub fn access_memory(
        &mut self,
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stages: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.memory.src_stages |= src_stages;
        self.memory.src_access |= src_access;
        self.memory.dst_stages |= dst_stages;
        self.memory.dst_access |= dst_access;
    }

    pub fn access_buffer(
        &mut self,
        slice: &BufferSliceHandle,
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stages: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.access_memory(src_stages, src_access, dst_stages, dst_access);

        let access = Access::from_vk(src_access);
        let ranges = self.buffer_ranges.entry(slice.handle).or_default();
        if let Some(existing) = ranges
            .iter_mut()
            .find(|r| r.offset == slice.offset && r.length == slice.length)
        {
            existing.access |= access;
        } else {
            ranges.push(BufferRange {
                offset: slice.offset,
                length: slice.length,
                access,
            });
        }
    }

    ///Records an access to `subresources` of `image`. If the layouts differ a layout transition is queued, which counts
    /// as a write to the range.
    #[allow(clippy::too_many_arguments)]
    pub fn access_image(
        &mut self,
        image: vk::Image,
        subresources: vk::ImageSubresourceRange,
        src_layout: vk::ImageLayout,
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_layout: vk::ImageLayout,
        dst_stages: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let mut access = Access::from_vk(src_access);

        if src_layout == dst_layout {
            self.access_memory(src_stages, src_access, dst_stages, dst_access);
        } else {
            access |= Access::WRITE;
            let barrier = ImageBarrier {
                image,
                subresources,
                src_stages,
                src_access,
                dst_stages,
                dst_access,
                old_layout: src_layout,
                new_layout: dst_layout,
            };
            self.push_image_barrier(barrier);
        }

        let ranges = self.image_ranges.entry(image).or_default();
        if let Some(existing) = ranges
            .iter_mut()
            .find(|r| subresources_equal(&r.range, &subresources))
        {
            existing.access |= access;
        } else {
            ranges.push(ImageRange {
                range: subresources,
                access,
            });
        }
    }

    fn push_image_barrier(&mut self, barrier: ImageBarrier) {
        for pending in self.images.iter_mut() {
            if pending.image != barrier.image
                || pending.old_layout != barrier.old_layout
                || pending.new_layout != barrier.new_layout
            {
                continue;
            }
            if let Some(merged) = merge_subresources(&pending.subresources, &barrier.subresources) {
                pending.subresources = merged;
                pending.src_stages |= barrier.src_stages;
                pending.src_access |= barrier.src_access;
                pending.dst_stages |= barrier.dst_stages;
                pending.dst_access |= barrier.dst_access;
                return;
            }
        }
        self.images.push(barrier);
    }

    ///True if an access of class `access` to `slice` conflicts with a pending access.
    pub fn is_buffer_dirty(&self, slice: &BufferSliceHandle, access: Access, ignore_waw: bool) -> bool {
        self.buffer_ranges.get(&slice.handle).is_some_and(|ranges| {
            ranges.iter().any(|r| {
                ranges_overlap(r.offset, r.length, slice.offset, slice.length)
                    && access.conflicts_with(r.access, ignore_waw)
            })
        })
    }

    ///True if an access of class `access` to `subresources` of `image` conflicts with a pending access or layout transition.
    pub fn is_image_dirty(
        &self,
        image: vk::Image,
        subresources: &vk::ImageSubresourceRange,
        access: Access,
        ignore_waw: bool,
    ) -> bool {
        self.image_ranges.get(&image).is_some_and(|ranges| {
            ranges
                .iter()
                .any(|r| subresources_overlap(&r.range, subresources) && access.conflicts_with(r.access, ignore_waw))
        })
    }

    ///True if write-after-write hazards may be skipped for work of `bind_point`.
    ///
    /// Only holds if the caller opted in via [BarrierControl::IGNORE_WRITE_AFTER_WRITE], the work is compute work, and every
    /// pending barrier originates from the compute or indirect argument stages.
    pub fn can_ignore_waw(&self, bind_point: vk::PipelineBindPoint) -> bool {
        if !self.control.contains(BarrierControl::IGNORE_WRITE_AFTER_WRITE)
            || bind_point != vk::PipelineBindPoint::COMPUTE
        {
            return false;
        }
        self.src_stages().as_raw() & !WAW_SAFE_STAGES.as_raw() == 0
    }

    ///Union of all pending source stages.
    pub fn src_stages(&self) -> vk::PipelineStageFlags2 {
        self.images
            .iter()
            .fold(self.memory.src_stages, |stages, b| stages | b.src_stages)
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.memory.is_empty() || !self.images.is_empty()
    }

    ///True if there is any pending access, even one that does not need a barrier.
    pub fn has_pending_accesses(&self) -> bool {
        !self.buffer_ranges.is_empty() || !self.image_ranges.is_empty()
    }

    ///Records all pending barriers into `cb` as a single pipeline barrier and clears the set.
    pub fn record_commands(&mut self, device: &dyn RawDevice, cb: vk::CommandBuffer) {
        if self.has_pending_barriers() {
            #[cfg(feature = "logging")]
            log::trace!(
                "Flushing barriers: memory {:?}, {} image barriers",
                self.memory,
                self.images.len()
            );

            let memory = if self.memory.is_empty() {
                &[][..]
            } else {
                std::slice::from_ref(&self.memory)
            };
            device.cmd_pipeline_barrier(cb, memory, self.images.as_slice());
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.memory = MemoryBarrier::default();
        self.images.clear();
        self.buffer_ranges.clear();
        self.image_ranges.clear();
    }
}

///Merges two subresource ranges if their union is again a range.
fn merge_subresources(
    a: &vk::ImageSubresourceRange,
    b: &vk::ImageSubresourceRange,
) -> Option<vk::ImageSubresourceRange> {
    let same_mips = a.base_mip_level == b.base_mip_level && a.level_count == b.level_count;
    let same_layers = a.base_array_layer == b.base_array_layer && a.layer_count == b.layer_count;

    if same_mips && same_layers {
        return Some(vk::ImageSubresourceRange {
            aspect_mask: a.aspect_mask | b.aspect_mask,
            ..*a
        });
    }
    if a.aspect_mask != b.aspect_mask {
        return None;
    }

    let adjacent = |a_base: u32, a_count: u32, b_base: u32, b_count: u32| {
        a_base.checked_add(a_count) == Some(b_base) || b_base.checked_add(b_count) == Some(a_base)
    };

    if same_layers && adjacent(a.base_mip_level, a.level_count, b.base_mip_level, b.level_count) {
        let base = a.base_mip_level.min(b.base_mip_level);
        return Some(vk::ImageSubresourceRange {
            base_mip_level: base,
            level_count: a.level_count + b.level_count,
            ..*a
        });
    }
    if same_mips && adjacent(a.base_array_layer, a.layer_count, b.base_array_layer, b.layer_count) {
        let base = a.base_array_layer.min(b.base_array_layer);
        return Some(vk::ImageSubresourceRange {
            base_array_layer: base,
            layer_count: a.layer_count + b.layer_count,
            ..*a
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dxvk::{
        device::Device,
        testing::{Command, SoftDevice},
    };

    use super::*;

    fn recording(device: &Arc<Device>) -> vk::CommandBuffer {
        let pool = device.inner.create_command_pool(0).unwrap();
        let cb = device.inner.allocate_command_buffer(pool).unwrap();
        device.inner.begin_command_buffer(cb).unwrap();
        cb
    }

    fn slice(raw: u64, offset: u64, length: u64) -> BufferSliceHandle {
        use dxvk::ash::vk::Handle;
        BufferSliceHandle {
            handle: vk::Buffer::from_raw(raw),
            offset,
            length,
            address: 0,
        }
    }

    #[test]
    fn access_classes() {
        assert_eq!(Access::from_vk(vk::AccessFlags2::SHADER_READ), Access::READ);
        assert_eq!(Access::from_vk(vk::AccessFlags2::TRANSFER_WRITE), Access::WRITE);
        assert_eq!(
            Access::from_vk(vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE),
            Access::READ | Access::WRITE
        );
        assert!(!Access::READ.conflicts_with(Access::READ, false));
        assert!(Access::READ.conflicts_with(Access::WRITE, false));
        assert!(Access::WRITE.conflicts_with(Access::READ, true));
        assert!(!Access::WRITE.conflicts_with(Access::WRITE, true));
        let storage = Access::READ | Access::WRITE;
        assert!(storage.conflicts_with(storage, false));
        assert!(!storage.conflicts_with(storage, true));
        assert!(storage.conflicts_with(Access::READ, true));
        assert!(!Access::empty().conflicts_with(Access::WRITE, false));
    }

    #[test]
    fn overlapping_write_is_dirty_until_flushed() {
        let (device, soft) = SoftDevice::device_default();
        let cb = recording(&device);
        let mut set = BarrierSet::new(BarrierControl::empty());

        set.access_buffer(
            &slice(1, 0, 64),
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        );

        assert!(set.is_buffer_dirty(&slice(1, 32, 64), Access::READ, false));
        assert!(!set.is_buffer_dirty(&slice(1, 64, 64), Access::READ, false));
        assert!(!set.is_buffer_dirty(&slice(2, 0, 64), Access::WRITE, false));

        set.record_commands(device.inner.as_ref(), cb);
        assert!(!set.is_buffer_dirty(&slice(1, 32, 64), Access::READ, false));
        assert!(!set.has_pending_barriers());

        let commands = soft.commands(cb);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            Command::Barrier { memory, images } => {
                assert!(images.is_empty());
                assert_eq!(memory[0].src_stages, vk::PipelineStageFlags2::TRANSFER);
                assert_eq!(memory[0].dst_access, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn reads_do_not_conflict() {
        let mut set = BarrierSet::new(BarrierControl::empty());
        set.access_buffer(
            &slice(1, 0, 64),
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        assert!(!set.is_buffer_dirty(&slice(1, 0, 64), Access::READ, false));
        assert!(set.is_buffer_dirty(&slice(1, 0, 64), Access::WRITE, false));
    }

    #[test]
    fn waw_elision_is_opt_in_and_compute_only() {
        let write = |set: &mut BarrierSet, stages| {
            set.access_buffer(
                &slice(1, 0, 64),
                stages,
                vk::AccessFlags2::SHADER_WRITE,
                stages,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            )
        };

        let mut strict = BarrierSet::new(BarrierControl::empty());
        write(&mut strict, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert!(!strict.can_ignore_waw(vk::PipelineBindPoint::COMPUTE));

        let mut relaxed = BarrierSet::new(BarrierControl::IGNORE_WRITE_AFTER_WRITE);
        write(&mut relaxed, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert!(relaxed.can_ignore_waw(vk::PipelineBindPoint::COMPUTE));
        assert!(!relaxed.can_ignore_waw(vk::PipelineBindPoint::GRAPHICS));
        assert!(!relaxed.is_buffer_dirty(&slice(1, 0, 64), Access::WRITE, true));
        assert!(relaxed.is_buffer_dirty(&slice(1, 0, 64), Access::READ, true));

        relaxed.reset();
        write(&mut relaxed, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert!(!relaxed.can_ignore_waw(vk::PipelineBindPoint::COMPUTE));
    }

    #[test]
    fn adjacent_transitions_merge() {
        use dxvk::ash::vk::Handle;
        let (device, soft) = SoftDevice::device_default();
        let cb = recording(&device);
        let mut set = BarrierSet::new(BarrierControl::empty());
        let image = vk::Image::from_raw(7);

        for mip in 0..2 {
            let range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: mip,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };
            set.access_image(
                image,
                range,
                vk::ImageLayout::UNDEFINED,
                vk::PipelineStageFlags2::NONE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            );
        }

        //layout transitions count as writes
        let full = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 1,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        assert!(set.is_image_dirty(image, &full, Access::READ, false));

        set.record_commands(device.inner.as_ref(), cb);
        match &soft.commands(cb)[0] {
            Command::Barrier { memory, images } => {
                assert!(memory.is_empty());
                assert_eq!(images.len(), 1);
                assert_eq!(images[0].subresources.level_count, 2);
                assert_eq!(images[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
