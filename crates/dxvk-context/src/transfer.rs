//! Transfer operations. All of them are recorded outside of rendering on the exec command buffer.
//!
//! Every operation is framed by [prepare_ops](Context::prepare_ops), which waits for conflicting pending work and
//! moves images into the operation's layout, and [release_ops](Context::release_ops), which moves images back to their
//! resting layout and registers the operation's accesses as pending.

use std::sync::Arc;

use dxvk::{
    ash::vk,
    device::ClearValue,
    format::{aspect_element_size, format_info},
    resources::{BufDesc, Buffer, BufferSliceHandle, BufferStorage, Image, ImgDesc},
    util::{ranges_overlap, regions_overlap},
};
use dxvk_commands::{Access, CmdBuffer};

use crate::{Context, state::ContextFlags};

const TRANSFER: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::TRANSFER;

#[derive(Clone, Copy)]
pub(crate) enum OpResource<'a> {
    Buffer(&'a Arc<Buffer>, BufferSliceHandle),
    Image(&'a Arc<Image>, vk::ImageSubresourceRange, vk::ImageLayout),
}

///Access of a single resource by a transfer or meta operation.
#[derive(Clone, Copy)]
pub(crate) struct OpAccess<'a> {
    pub resource: OpResource<'a>,
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl<'a> OpAccess<'a> {
    pub fn buffer(
        buffer: &'a Arc<Buffer>,
        offset: vk::DeviceSize,
        length: vk::DeviceSize,
        stages: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        OpAccess {
            resource: OpResource::Buffer(buffer, buffer.slice_handle(offset, length)),
            stages,
            access,
        }
    }

    pub fn image(
        image: &'a Arc<Image>,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
        stages: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        OpAccess {
            resource: OpResource::Image(image, range, layout),
            stages,
            access,
        }
    }

    fn transfer_src_buffer(buffer: &'a Arc<Buffer>, offset: vk::DeviceSize, length: vk::DeviceSize) -> Self {
        Self::buffer(buffer, offset, length, TRANSFER, vk::AccessFlags2::TRANSFER_READ)
    }

    fn transfer_dst_buffer(buffer: &'a Arc<Buffer>, offset: vk::DeviceSize, length: vk::DeviceSize) -> Self {
        Self::buffer(buffer, offset, length, TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
    }
}

pub(crate) fn layers_range(layers: &vk::ImageSubresourceLayers) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: layers.aspect_mask,
        base_mip_level: layers.mip_level,
        level_count: 1,
        base_array_layer: layers.base_array_layer,
        layer_count: layers.layer_count,
    }
}

///Bytes a buffer needs to hold `extent` texels of one aspect of `format`, laid out with `row_length` and
/// `image_height` as in `VkBufferImageCopy`.
fn buffer_image_size(
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent3D,
    row_length: u32,
    image_height: u32,
    layers: u32,
) -> Option<vk::DeviceSize> {
    let element_size = aspect_element_size(format, aspect)? as vk::DeviceSize;
    let block = format_info(format)?.block_size;
    let row_blocks = row_length.max(extent.width).div_ceil(block.width) as vk::DeviceSize;
    let height_blocks = image_height.max(extent.height).div_ceil(block.height) as vk::DeviceSize;
    let depth_blocks = extent.depth.div_ceil(block.depth) as vk::DeviceSize;
    Some(row_blocks * height_blocks * depth_blocks * layers as vk::DeviceSize * element_size)
}

impl Context {
    ///Waits for pending work that conflicts with `ops` and moves images into the layout of the operation.
    pub(crate) fn prepare_ops(&mut self, ops: &[OpAccess]) {
        let barriers = self.list.barriers(CmdBuffer::Exec);
        let dirty = ops.iter().any(|op| {
            let access = Access::from_vk(op.access);
            match op.resource {
                OpResource::Buffer(_, handle) => barriers.is_buffer_dirty(&handle, access, false),
                OpResource::Image(image, range, layout) => {
                    let access = if image.layout() != layout {
                        access | Access::WRITE
                    } else {
                        access
                    };
                    barriers.is_image_dirty(image.handle(), &range, access, false)
                }
            }
        });
        if dirty {
            self.list.flush_barriers(CmdBuffer::Exec);
        }

        let barriers = self.list.barriers(CmdBuffer::Exec);
        let mut transitions = false;
        for op in ops {
            if let OpResource::Image(image, range, layout) = op.resource {
                if image.layout() != layout {
                    barriers.access_image(
                        image.handle(),
                        range,
                        image.layout(),
                        image.desc.stages,
                        image.desc.access,
                        layout,
                        op.stages,
                        op.access,
                    );
                    transitions = true;
                }
            }
        }
        if transitions {
            self.list.flush_barriers(CmdBuffer::Exec);
        }
    }

    ///Registers `ops` as pending, moves images back to their resting layout and keeps every resource alive.
    pub(crate) fn release_ops(&mut self, ops: &[OpAccess]) {
        for op in ops {
            let access = Access::from_vk(op.access);
            match op.resource {
                OpResource::Buffer(buffer, handle) => {
                    self.list.barriers(CmdBuffer::Exec).access_buffer(
                        &handle,
                        op.stages,
                        op.access,
                        buffer.desc.stages,
                        buffer.desc.access,
                    );
                    self.list.track(buffer, access);
                    self.list.track(&buffer.storage(), access);
                }
                OpResource::Image(image, range, layout) => {
                    self.list.barriers(CmdBuffer::Exec).access_image(
                        image.handle(),
                        range,
                        layout,
                        op.stages,
                        op.access,
                        image.layout(),
                        image.desc.stages,
                        image.desc.access,
                    );
                    self.list.track(image, access);
                }
            }
        }
    }

    ///Flushes pending barriers if anything is pending on `range` of `image`. Layout transitions must not be batched
    /// with earlier barriers of the same subresources.
    pub(crate) fn flush_if_image_dirty(&mut self, image: &Image, range: &vk::ImageSubresourceRange) {
        if self
            .list
            .barriers(CmdBuffer::Exec)
            .is_image_dirty(image.handle(), range, Access::WRITE, false)
        {
            self.list.flush_barriers(CmdBuffer::Exec);
        }
    }

    ///Leaves rendering before `image` is used by a transfer operation, and lands pending clears of it.
    pub(crate) fn prepare_image_transfer(&mut self, image: &Image) {
        for clear in self.clears.take_image(image) {
            self.execute_clear(clear);
        }
        let renders_to_image = self.active_targets.as_ref().is_some_and(|t| t.uses_image(image));
        if renders_to_image {
            self.spill_render_pass(false);
        } else {
            self.end_render_pass_scope();
        }
    }

    ///Copies `size` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
    pub fn copy_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: vk::DeviceSize,
        src: &Arc<Buffer>,
        src_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        if size == 0 {
            return;
        }
        if src_offset.saturating_add(size) > src.desc.size || dst_offset.saturating_add(size) > dst.desc.size {
            #[cfg(feature = "logging")]
            log::error!(
                "Buffer copy of {} bytes out of bounds (src offset {}, dst offset {})",
                size,
                src_offset,
                dst_offset
            );
            return;
        }
        if src.cookie() == dst.cookie() {
            self.copy_buffer_region(dst, dst_offset, src_offset, size);
            return;
        }

        self.end_render_pass_scope();
        self.copy_buffer_impl(dst, dst_offset, src, src_offset, size);
    }

    ///Copies within a single buffer. Overlapping ranges go through a temporary buffer.
    pub fn copy_buffer_region(
        &mut self,
        buffer: &Arc<Buffer>,
        dst_offset: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        if size == 0 || src_offset == dst_offset {
            return;
        }
        if src_offset.max(dst_offset).saturating_add(size) > buffer.desc.size {
            #[cfg(feature = "logging")]
            log::error!("Buffer region copy of {} bytes out of bounds", size);
            return;
        }

        self.end_render_pass_scope();
        if !ranges_overlap(src_offset, size, dst_offset, size) {
            self.copy_buffer_impl(buffer, dst_offset, buffer, src_offset, size);
            return;
        }

        let desc = BufDesc::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let temp = match Buffer::new(&self.device, desc) {
            Ok(temp) => temp,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to create temporary buffer for region copy: {}", _e);
                return;
            }
        };
        self.copy_buffer_impl(&temp, 0, buffer, src_offset, size);
        self.copy_buffer_impl(buffer, dst_offset, &temp, 0, size);
    }

    fn copy_buffer_impl(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: vk::DeviceSize,
        src: &Arc<Buffer>,
        src_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        let ops = [
            OpAccess::transfer_src_buffer(src, src_offset, size),
            OpAccess::transfer_dst_buffer(dst, dst_offset, size),
        ];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        self.device.inner.cmd_copy_buffer(
            cb,
            src.handle(),
            dst.handle(),
            &[vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            }],
        );
        self.release_ops(&ops);
    }

    ///Fills `size` bytes of `buffer` at `offset` with the repeated 32 bit `value`. Offset and size must be multiples of
    /// four.
    pub fn clear_buffer(&mut self, buffer: &Arc<Buffer>, offset: vk::DeviceSize, size: vk::DeviceSize, value: u32) {
        if size == 0 {
            return;
        }
        if offset % 4 != 0 || size % 4 != 0 || offset.saturating_add(size) > buffer.desc.size {
            #[cfg(feature = "logging")]
            log::error!("Invalid buffer clear of {} bytes at {}", size, offset);
            return;
        }

        self.end_render_pass_scope();
        let ops = [OpAccess::transfer_dst_buffer(buffer, offset, size)];
        self.prepare_ops(&ops);
        let cb = self.exec_cmd();
        self.device
            .inner
            .cmd_fill_buffer(cb, buffer.handle(), offset, size, value);
        self.release_ops(&ops);
    }

    ///Writes `data` to `buffer` at `offset`.
    ///
    /// Small full overwrites of renameable buffers get a fresh storage that is filled on the init command buffer, which
    /// needs no ordering against earlier work. Everything else is an ordered inline update or a staged copy.
    pub fn update_buffer(&mut self, buffer: &Arc<Buffer>, offset: vk::DeviceSize, data: &[u8]) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let size = data.len() as vk::DeviceSize;
        if size == 0 {
            return;
        }
        if offset.saturating_add(size) > buffer.desc.size {
            #[cfg(feature = "logging")]
            log::error!("Buffer update of {} bytes at {} out of bounds", size, offset);
            return;
        }

        let aligned = offset % 4 == 0 && size % 4 == 0;
        let discard = offset == 0
            && size == buffer.desc.size
            && size <= self.device.options.max_buffer_discard_size
            && buffer.can_rename()
            && !buffer.is_host_visible()
            && aligned;
        if discard {
            match buffer.allocate_storage() {
                Ok(storage) => {
                    self.invalidate_buffer(buffer, storage);
                    self.init_buffer_data(buffer, data);
                    return;
                }
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::warn!("Failed to rename buffer, updating in place: {}", _e);
                }
            }
        }

        self.end_render_pass_scope();
        if aligned && size <= self.device.limits.max_update_size {
            let ops = [OpAccess::transfer_dst_buffer(buffer, offset, size)];
            self.prepare_ops(&ops);
            let cb = self.exec_cmd();
            self.device
                .inner
                .cmd_update_buffer(cb, buffer.handle(), offset, data);
            self.release_ops(&ops);
            return;
        }

        let staging = match Buffer::new(&self.device, BufDesc::staging(size)) {
            Ok(staging) => staging,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to create staging buffer: {}", _e);
                return;
            }
        };
        if let Err(_e) = staging.storage().write(0, data) {
            #[cfg(feature = "logging")]
            log::error!("Failed to write staging buffer: {}", _e);
            return;
        }
        self.copy_buffer_impl(buffer, offset, &staging, 0, size);
    }

    ///Fills the fresh storage of `buffer` with `data` on the init command buffer.
    fn init_buffer_data(&mut self, buffer: &Arc<Buffer>, data: &[u8]) {
        let cb = self.list.cmd_buffer(CmdBuffer::Init);
        let handle = buffer.handle();
        let chunk = self.device.limits.max_update_size.max(4) as usize;
        for (index, part) in data.chunks(chunk).enumerate() {
            self.device
                .inner
                .cmd_update_buffer(cb, handle, (index * chunk) as vk::DeviceSize, part);
        }

        let slice = buffer.slice_handle(0, buffer.desc.size);
        self.list.barriers(CmdBuffer::Init).access_buffer(
            &slice,
            TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            buffer.desc.stages,
            buffer.desc.access,
        );
        self.list.track(buffer, Access::WRITE);
        self.list.track(&buffer.storage(), Access::WRITE);
    }

    ///Replaces the storage of `buffer` by `storage`. The previous storage stays alive until the current command list
    /// completed, every binding that references the buffer is applied again before the next draw or dispatch.
    pub fn invalidate_buffer(&mut self, buffer: &Arc<Buffer>, storage: Arc<BufferStorage>) {
        let previous = buffer.assign_storage(storage);
        self.list.track(&previous, Access::empty());
        self.descriptors.invalidate_buffer(buffer);

        let cookie = buffer.cookie();
        if self
            .vertex_buffers
            .iter()
            .flatten()
            .any(|b| b.slice.buffer.cookie() == cookie)
        {
            self.flags |= ContextFlags::GP_DIRTY_VERTEX_BUFFERS;
        }
        if self
            .index_buffer
            .as_ref()
            .is_some_and(|b| b.slice.buffer.cookie() == cookie)
        {
            self.flags |= ContextFlags::GP_DIRTY_INDEX_BUFFER;
        }
        if self.xfb_buffers.iter().flatten().any(|b| {
            b.slice.buffer.cookie() == cookie || b.counter.as_ref().is_some_and(|c| c.buffer.cookie() == cookie)
        }) {
            self.flags |= ContextFlags::GP_DIRTY_XFB_BUFFERS;
        }
    }

    ///Copies `extent` texels between two image subresources. Copies between different aspects, for instance depth to
    /// color, go through a buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_image(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        dst_offset: vk::Offset3D,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
        src_offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) {
        if src_subresource.aspect_mask != dst_subresource.aspect_mask {
            self.copy_image_cross_aspect(
                dst,
                dst_subresource,
                dst_offset,
                src,
                src_subresource,
                src_offset,
                extent,
            );
            return;
        }
        if src.cookie() == dst.cookie() {
            self.copy_image_region(dst, dst_subresource, dst_offset, src_subresource, src_offset, extent);
            return;
        }

        self.prepare_image_transfer(src);
        self.prepare_image_transfer(dst);
        self.copy_image_impl(
            dst,
            dst_subresource,
            dst_offset,
            src,
            src_subresource,
            src_offset,
            extent,
        );
    }

    ///Copies within a single image. Overlapping regions of the same subresource go through a temporary image.
    pub fn copy_image_region(
        &mut self,
        image: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        dst_offset: vk::Offset3D,
        src_subresource: vk::ImageSubresourceLayers,
        src_offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) {
        self.prepare_image_transfer(image);

        let same_subresource = dst_subresource.mip_level == src_subresource.mip_level
            && ranges_overlap(
                dst_subresource.base_array_layer as u64,
                dst_subresource.layer_count as u64,
                src_subresource.base_array_layer as u64,
                src_subresource.layer_count as u64,
            );
        if !same_subresource || !regions_overlap(src_offset, dst_offset, extent) {
            self.copy_image_impl(
                image,
                dst_subresource,
                dst_offset,
                image,
                src_subresource,
                src_offset,
                extent,
            );
            return;
        }

        let mut desc = ImgDesc::new_2d(
            extent.width,
            extent.height,
            image.desc.format,
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .with_layers(src_subresource.layer_count)
        .with_samples(image.desc.samples);
        desc.ty = image.desc.ty;
        desc.extent.depth = extent.depth;
        let temp = match Image::new(&self.device, desc) {
            Ok(temp) => temp,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to create temporary image for region copy: {}", _e);
                return;
            }
        };
        self.initialize_image(&temp, temp.subresources());

        let temp_layers = vk::ImageSubresourceLayers {
            aspect_mask: src_subresource.aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: src_subresource.layer_count,
        };
        self.copy_image_impl(
            &temp,
            temp_layers,
            vk::Offset3D::default(),
            image,
            src_subresource,
            src_offset,
            extent,
        );
        self.copy_image_impl(
            image,
            dst_subresource,
            dst_offset,
            &temp,
            temp_layers,
            vk::Offset3D::default(),
            extent,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_image_impl(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        dst_offset: vk::Offset3D,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
        src_offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) {
        //both sides share the layout if the image is copied to itself
        let (src_layout, dst_layout) = if src.cookie() == dst.cookie() {
            let layout = src.pick_layout(vk::ImageLayout::GENERAL);
            (layout, layout)
        } else {
            (
                src.pick_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                dst.pick_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            )
        };

        let ops = [
            OpAccess::image(
                src,
                layers_range(&src_subresource),
                src_layout,
                TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            OpAccess::image(
                dst,
                layers_range(&dst_subresource),
                dst_layout,
                TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        self.device.inner.cmd_copy_image(
            cb,
            src.handle(),
            src_layout,
            dst.handle(),
            dst_layout,
            &[vk::ImageCopy {
                src_subresource,
                src_offset,
                dst_subresource,
                dst_offset,
                extent,
            }],
        );
        self.release_ops(&ops);
    }

    ///Copies texels of a single aspect from `src` into `dst`. `row_length` and `image_height` of zero mean tightly
    /// packed.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer_to_image(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        dst_offset: vk::Offset3D,
        extent: vk::Extent3D,
        src: &Arc<Buffer>,
        src_offset: vk::DeviceSize,
        row_length: u32,
        image_height: u32,
    ) {
        let Some(size) = buffer_image_size(
            dst.desc.format,
            dst_subresource.aspect_mask,
            extent,
            row_length,
            image_height,
            dst_subresource.layer_count,
        ) else {
            #[cfg(feature = "logging")]
            log::error!(
                "Can not copy aspect {:?} of {:?} from a buffer",
                dst_subresource.aspect_mask,
                dst.desc.format
            );
            return;
        };
        if src_offset.saturating_add(size) > src.desc.size {
            #[cfg(feature = "logging")]
            log::error!("Buffer to image copy reads {} bytes at {} out of bounds", size, src_offset);
            return;
        }

        self.prepare_image_transfer(dst);
        let layout = dst.pick_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let ops = [
            OpAccess::transfer_src_buffer(src, src_offset, size),
            OpAccess::image(
                dst,
                layers_range(&dst_subresource),
                layout,
                TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        self.device.inner.cmd_copy_buffer_to_image(
            cb,
            src.handle(),
            dst.handle(),
            layout,
            &[vk::BufferImageCopy {
                buffer_offset: src_offset,
                buffer_row_length: row_length,
                buffer_image_height: image_height,
                image_subresource: dst_subresource,
                image_offset: dst_offset,
                image_extent: extent,
            }],
        );
        self.release_ops(&ops);
    }

    ///Copies texels of a single aspect from `src` into `dst`. `row_length` and `image_height` of zero mean tightly
    /// packed.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_image_to_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: vk::DeviceSize,
        row_length: u32,
        image_height: u32,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
        src_offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) {
        let Some(size) = buffer_image_size(
            src.desc.format,
            src_subresource.aspect_mask,
            extent,
            row_length,
            image_height,
            src_subresource.layer_count,
        ) else {
            #[cfg(feature = "logging")]
            log::error!(
                "Can not copy aspect {:?} of {:?} to a buffer",
                src_subresource.aspect_mask,
                src.desc.format
            );
            return;
        };
        if dst_offset.saturating_add(size) > dst.desc.size {
            #[cfg(feature = "logging")]
            log::error!("Image to buffer copy writes {} bytes at {} out of bounds", size, dst_offset);
            return;
        }

        self.prepare_image_transfer(src);
        let layout = src.pick_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let ops = [
            OpAccess::image(
                src,
                layers_range(&src_subresource),
                layout,
                TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            OpAccess::transfer_dst_buffer(dst, dst_offset, size),
        ];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        self.device.inner.cmd_copy_image_to_buffer(
            cb,
            src.handle(),
            layout,
            dst.handle(),
            &[vk::BufferImageCopy {
                buffer_offset: dst_offset,
                buffer_row_length: row_length,
                buffer_image_height: image_height,
                image_subresource: src_subresource,
                image_offset: src_offset,
                image_extent: extent,
            }],
        );
        self.release_ops(&ops);
    }

    ///Brings `range` of a freshly created image from `UNDEFINED` into its resting layout, optionally clearing it.
    /// Pending clears and discards of the image are dropped, its previous content is undefined.
    pub fn init_image(&mut self, image: &Arc<Image>, range: vk::ImageSubresourceRange, clear: Option<ClearValue>) {
        drop(self.clears.take_image(image));
        let renders_to_image = self.active_targets.as_ref().is_some_and(|t| t.uses_image(image));
        if renders_to_image {
            self.spill_render_pass(false);
        } else {
            self.end_render_pass_scope();
        }

        self.initialize_image(image, range);
        if let Some(value) = clear {
            if image.desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
                self.clear_image_range(image, range, value);
            } else {
                #[cfg(feature = "logging")]
                log::error!("Can not clear {:?} on initialization, no transfer usage", image);
            }
        }
    }

    pub(crate) fn initialize_image(&mut self, image: &Arc<Image>, range: vk::ImageSubresourceRange) {
        self.flush_if_image_dirty(image, &range);
        self.list.barriers(CmdBuffer::Exec).access_image(
            image.handle(),
            range,
            vk::ImageLayout::UNDEFINED,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            image.layout(),
            image.desc.stages,
            image.desc.access,
        );
        self.list.flush_barriers(CmdBuffer::Exec);
        self.list.track(image, Access::WRITE);
    }

    ///Clears `range` of `image` through a transfer command.
    pub(crate) fn clear_image_range(&mut self, image: &Arc<Image>, range: vk::ImageSubresourceRange, value: ClearValue) {
        let layout = image.pick_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let ops = [OpAccess::image(
            image,
            range,
            layout,
            TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        )];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        if range.aspect_mask.contains(vk::ImageAspectFlags::COLOR) {
            self.device
                .inner
                .cmd_clear_color_image(cb, image.handle(), layout, value, &[range]);
        } else {
            self.device
                .inner
                .cmd_clear_depth_stencil_image(cb, image.handle(), layout, value, &[range]);
        }
        self.release_ops(&ops);
    }

    ///Changes the resting layout of `image`. Every later operation expects the image in `layout`.
    pub fn change_image_layout(&mut self, image: &Arc<Image>, layout: vk::ImageLayout) {
        if image.layout() == layout {
            return;
        }
        self.prepare_image_transfer(image);
        self.flush_if_image_dirty(image, &image.subresources());

        self.list.barriers(CmdBuffer::Exec).access_image(
            image.handle(),
            image.subresources(),
            image.layout(),
            image.desc.stages,
            image.desc.access,
            layout,
            image.desc.stages,
            image.desc.access,
        );
        self.list.flush_barriers(CmdBuffer::Exec);
        image.set_layout(layout);
        self.list.track(image, Access::WRITE);

        #[cfg(feature = "logging")]
        log::debug!("Changed layout of {:?} to {:?}", image, layout);
    }
}

#[cfg(test)]
mod tests {
    use dxvk::testing::Command;

    use super::*;
    use crate::testing::TestContext;

    fn color_layers() -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn count(commands: &[Command], f: impl Fn(&Command) -> bool) -> usize {
        commands.iter().filter(|c| f(c)).count()
    }

    #[test]
    fn full_update_renames_storage() {
        let mut t = TestContext::new();
        let buffer = t.buffer(256);
        let old = buffer.handle();
        let data: Vec<u8> = (0..=255).collect();

        t.context.update_buffer(&buffer, 0, &data);
        assert_ne!(buffer.handle(), old);
        t.context.flush_and_wait().unwrap();

        assert_eq!(t.soft.buffer_contents(buffer.handle()), data);
        let commands = t.soft.submitted_commands();
        assert_eq!(count(&commands, |c| matches!(c, Command::UpdateBuffer { .. })), 1);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn partial_update_is_recorded_inline() {
        let mut t = TestContext::new();
        let buffer = t.buffer(256);
        let old = buffer.handle();

        t.context.update_buffer(&buffer, 16, &[7; 32]);
        assert_eq!(buffer.handle(), old);
        t.context.flush_and_wait().unwrap();

        let contents = t.soft.buffer_contents(buffer.handle());
        assert!(contents[16..48].iter().all(|b| *b == 7));
        assert!(contents[..16].iter().all(|b| *b == 0));
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn unaligned_update_uses_staging() {
        let mut t = TestContext::new();
        let buffer = t.buffer(64);

        t.context.update_buffer(&buffer, 3, &[1, 2, 3, 4, 5]);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert_eq!(count(&commands, |c| matches!(c, Command::UpdateBuffer { .. })), 0);
        assert_eq!(count(&commands, |c| matches!(c, Command::CopyBuffer { .. })), 1);
        assert_eq!(&t.soft.buffer_contents(buffer.handle())[3..8], &[1, 2, 3, 4, 5]);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn overlapping_region_copy_is_exact() {
        let mut t = TestContext::new();
        let buffer = t.buffer(256);
        let pattern: Vec<u8> = (0..=255).collect();
        t.soft.write_buffer(buffer.handle(), 0, &pattern);

        t.context.copy_buffer(&buffer, 16, &buffer, 0, 128);
        t.context.flush_and_wait().unwrap();

        let contents = t.soft.buffer_contents(buffer.handle());
        assert_eq!(&contents[16..144], &pattern[..128]);
        assert_eq!(&contents[..16], &pattern[..16]);
        assert_eq!(&contents[144..], &pattern[144..]);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn invalid_buffer_operations_are_skipped() {
        let mut t = TestContext::new();
        let a = t.buffer(64);
        let b = t.buffer(64);

        t.context.copy_buffer(&a, 32, &b, 0, 64);
        t.context.clear_buffer(&a, 2, 8, 0);
        t.context.update_buffer(&a, 60, &[0; 8]);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert_eq!(count(&commands, Command::is_draw), 0);
        assert!(!commands.iter().any(|c| matches!(
            c,
            Command::CopyBuffer { .. } | Command::FillBuffer { .. } | Command::UpdateBuffer { .. }
        )));
    }

    #[test]
    fn write_after_write_waits() {
        let mut t = TestContext::new();
        let buffer = t.buffer(64);

        t.context.clear_buffer(&buffer, 0, 64, 1);
        t.context.clear_buffer(&buffer, 0, 64, 0x0202_0202);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let first = commands
            .iter()
            .position(|c| matches!(c, Command::FillBuffer { data: 1, .. }))
            .unwrap();
        let second = commands
            .iter()
            .position(|c| matches!(c, Command::FillBuffer { data: 0x0202_0202, .. }))
            .unwrap();
        assert!(commands[first..second].iter().any(|c| matches!(c, Command::Barrier { .. })));
        assert_eq!(t.soft.buffer_contents(buffer.handle()), vec![2; 64]);
    }

    #[test]
    fn image_copy_uses_transfer_layouts() {
        let mut t = TestContext::new();
        let src = Image::new(&t.device, ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UNORM)).unwrap();
        let dst = Image::new(&t.device, ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UNORM)).unwrap();
        for image in [&src, &dst] {
            t.context.init_image(image, image.subresources(), None);
        }

        t.context.copy_image(
            &dst,
            color_layers(),
            vk::Offset3D::default(),
            &src,
            color_layers(),
            vk::Offset3D::default(),
            vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
        );
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let copy = commands
            .iter()
            .find_map(|c| match c {
                Command::CopyImage {
                    src_layout, dst_layout, ..
                } => Some((*src_layout, *dst_layout)),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            copy,
            (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            )
        );
        //both images are back in their resting layout once the list ends
        let restored = commands
            .iter()
            .filter_map(|c| match c {
                Command::Barrier { images, .. } => Some(images),
                _ => None,
            })
            .flatten()
            .filter(|b| {
                b.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL && b.old_layout != vk::ImageLayout::UNDEFINED
            })
            .count();
        assert_eq!(restored, 2);
        assert_eq!(src.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn overlapping_image_region_copy_uses_temporary() {
        let mut t = TestContext::new();
        let image = Image::new(&t.device, ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UNORM)).unwrap();
        t.context.init_image(&image, image.subresources(), None);
        let images = t.soft.live_images();

        t.context.copy_image_region(
            &image,
            color_layers(),
            vk::Offset3D { x: 4, y: 0, z: 0 },
            color_layers(),
            vk::Offset3D::default(),
            vk::Extent3D {
                width: 8,
                height: 8,
                depth: 1,
            },
        );
        //the temporary lives until the list completed
        assert_eq!(t.soft.live_images(), images + 1);
        t.context.flush_and_wait().unwrap();
        assert_eq!(t.soft.live_images(), images);

        let commands = t.soft.submitted_commands();
        let copies: Vec<(usize, vk::Image, vk::Image)> = commands
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Command::CopyImage { src, dst, .. } => Some((i, *src, *dst)),
                _ => None,
            })
            .collect();
        assert_eq!(copies.len(), 2);
        let (first, src, temp) = copies[0];
        let (second, temp_src, dst) = copies[1];
        assert_eq!(src, image.handle());
        assert_ne!(temp, image.handle());
        assert_eq!(temp_src, temp);
        assert_eq!(dst, image.handle());
        assert!(commands[first..second].iter().any(|c| matches!(c, Command::Barrier { .. })));

        let last = commands
            .iter()
            .filter_map(|c| match c {
                Command::Barrier { images, .. } => Some(images),
                _ => None,
            })
            .flatten()
            .filter(|b| b.image == image.handle())
            .last()
            .unwrap();
        assert_eq!(last.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn layout_change_is_persistent() {
        let mut t = TestContext::new();
        let image = Image::new(&t.device, ImgDesc::texture_2d(8, 8, vk::Format::R8G8B8A8_UNORM)).unwrap();
        t.context.init_image(&image, image.subresources(), Some(ClearValue::float([0.0; 4])));

        t.context.change_image_layout(&image, vk::ImageLayout::GENERAL);
        assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let clear = commands
            .iter()
            .find_map(|c| match c {
                Command::ClearColorImage { layout, .. } => Some(*layout),
                _ => None,
            })
            .unwrap();
        assert_eq!(clear, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(commands.iter().any(|c| match c {
            Command::Barrier { images, .. } => images.iter().any(|b| b.new_layout == vk::ImageLayout::GENERAL),
            _ => false,
        }));
    }

    #[test]
    fn buffer_image_copy_size() {
        let extent = vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        };
        assert_eq!(
            buffer_image_size(vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR, extent, 0, 0, 1),
            Some(64)
        );
        assert_eq!(
            buffer_image_size(vk::Format::R8G8B8A8_UNORM, vk::ImageAspectFlags::COLOR, extent, 8, 0, 2),
            Some(256)
        );
        assert_eq!(
            buffer_image_size(vk::Format::BC1_RGBA_UNORM_BLOCK, vk::ImageAspectFlags::COLOR, extent, 0, 0, 1),
            Some(8)
        );
    }
}
