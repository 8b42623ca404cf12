//! Blits, resolves and copies that need more than a single transfer command.
//!
//! Each operation has a native path and a fallback that renders. Which one is used only depends on image usage, format
//! features and view properties. If neither applies the operation is logged and skipped.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use dxvk::{
    ash::vk,
    device::{AttachmentResolve, RenderingAttachment, RenderingInfo},
    format::{aspect_element_size, format_info},
    resources::{BufDesc, Buffer, Image, ImageView, ImgViewDesc, Sampler, SamplerDesc},
};
use dxvk_commands::Access;
use dxvk_descriptor::ResourceSlot;
use smallvec::{SmallVec, smallvec};

use crate::{
    Context,
    framebuffer::{
        COLOR_ATTACHMENT_ACCESS, COLOR_ATTACHMENT_STAGES, DEPTH_ATTACHMENT_ACCESS, DEPTH_ATTACHMENT_STAGES,
        attachment_layout, is_depth_stencil,
    },
    pipeline::MetaBlitKey,
    state::ContextFlags,
    transfer::OpAccess,
};

///Push constants of the fullscreen blit pipelines. Source coordinates are normalized.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BlitRegion {
    pub src_offset: [f32; 2],
    pub src_extent: [f32; 2],
    pub src_layer: u32,
}

fn view_layers(view: &ImageView) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: view.desc.aspects,
        mip_level: view.desc.min_level,
        base_array_layer: view.desc.min_layer,
        layer_count: view.desc.layer_count,
    }
}

fn attachment_stages_access(aspects: vk::ImageAspectFlags) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    if is_depth_stencil(aspects) {
        (DEPTH_ATTACHMENT_STAGES, DEPTH_ATTACHMENT_ACCESS)
    } else {
        (COLOR_ATTACHMENT_STAGES, COLOR_ATTACHMENT_ACCESS)
    }
}

///Sorts the corners of a blit region. Returns the sorted corners and whether x and y were mirrored.
fn normalize_region(offsets: [vk::Offset3D; 2]) -> ([vk::Offset3D; 2], [bool; 2]) {
    let [a, b] = offsets;
    let min = vk::Offset3D {
        x: a.x.min(b.x),
        y: a.y.min(b.y),
        z: a.z.min(b.z),
    };
    let max = vk::Offset3D {
        x: a.x.max(b.x),
        y: a.y.max(b.y),
        z: a.z.max(b.z),
    };
    ([min, max], [a.x > b.x, a.y > b.y])
}

impl Context {
    ///True if `vkCmdBlitImage` can express the blit.
    fn can_blit_natively(&self, dst: &ImageView, src: &ImageView, filter: vk::Filter) -> bool {
        let src_features = self.device.format_features(src.image.desc.format).optimal;
        let dst_features = self.device.format_features(dst.image.desc.format).optimal;

        src.is_identity_swizzle()
            && dst.is_identity_swizzle()
            && !src.image.is_multisampled()
            && !dst.image.is_multisampled()
            && src.image.desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC)
            && dst.image.desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST)
            && src_features.contains(vk::FormatFeatureFlags::BLIT_SRC)
            && dst_features.contains(vk::FormatFeatureFlags::BLIT_DST)
            && (filter == vk::Filter::NEAREST || src_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR))
            && src.desc.aspects == dst.desc.aspects
            && src.desc.format == src.image.desc.format
            && dst.desc.format == dst.image.desc.format
    }

    ///Scales the region `src_offsets` of `src_view` into the region `dst_offsets` of `dst_view`. Swapped corners
    /// mirror the image.
    pub fn blit_image(
        &mut self,
        dst_view: &Arc<ImageView>,
        dst_offsets: [vk::Offset3D; 2],
        src_view: &Arc<ImageView>,
        src_offsets: [vk::Offset3D; 2],
        filter: vk::Filter,
    ) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.prepare_image_transfer(&src_view.image);
        self.prepare_image_transfer(&dst_view.image);

        if self.can_blit_natively(dst_view, src_view, filter) {
            self.blit_image_native(dst_view, dst_offsets, src_view, src_offsets, filter);
        } else {
            self.blit_image_fallback(dst_view, dst_offsets, src_view, src_offsets, filter);
        }
    }

    fn blit_image_native(
        &mut self,
        dst_view: &Arc<ImageView>,
        dst_offsets: [vk::Offset3D; 2],
        src_view: &Arc<ImageView>,
        src_offsets: [vk::Offset3D; 2],
        filter: vk::Filter,
    ) {
        let src = &src_view.image;
        let dst = &dst_view.image;
        let (src_layout, dst_layout) = if src.cookie() == dst.cookie() {
            (vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL)
        } else {
            (
                src.pick_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                dst.pick_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            )
        };

        let ops = [
            OpAccess::image(
                src,
                src_view.subresources(),
                src_layout,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            OpAccess::image(
                dst,
                dst_view.subresources(),
                dst_layout,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        self.device.inner.cmd_blit_image(
            cb,
            src.handle(),
            src_layout,
            dst.handle(),
            dst_layout,
            &[vk::ImageBlit {
                src_subresource: view_layers(src_view),
                src_offsets,
                dst_subresource: view_layers(dst_view),
                dst_offsets,
            }],
            filter,
        );
        self.release_ops(&ops);
    }

    fn blit_image_fallback(
        &mut self,
        dst_view: &Arc<ImageView>,
        dst_offsets: [vk::Offset3D; 2],
        src_view: &Arc<ImageView>,
        src_offsets: [vk::Offset3D; 2],
        filter: vk::Filter,
    ) {
        let attachment_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        if !dst_view.desc.usage.intersects(attachment_usage)
            || !src_view.image.desc.usage.contains(vk::ImageUsageFlags::SAMPLED)
        {
            #[cfg(feature = "logging")]
            log::error!("Blit from {:?} to {:?} is not supported", src_view, dst_view);
            return;
        }

        let key = MetaBlitKey {
            view_type: src_view.desc.view_type,
            format: dst_view.desc.format,
            samples: dst_view.image.desc.samples,
            filter,
        };
        let Some(pipeline) = self.pipelines.meta_blit_pipeline(&key) else {
            #[cfg(feature = "logging")]
            log::error!("No blit pipeline for {:?}, skipping blit", key);
            return;
        };
        let Some(binding) = pipeline.bindings.bindings().next() else {
            #[cfg(feature = "logging")]
            log::error!("Blit pipeline for {:?} has no source binding", key);
            return;
        };
        let source_slot = binding.slot;

        let sampler = match Sampler::new(
            &self.device,
            SamplerDesc {
                mag_filter: filter,
                min_filter: filter,
                ..SamplerDesc::nearest()
            },
        ) {
            Ok(sampler) => sampler,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to create blit sampler: {}", _e);
                return;
            }
        };

        let dst = &dst_view.image;
        let src = &src_view.image;
        let dst_layout = dst.pick_layout(attachment_layout(dst_view.desc.aspects));
        let (dst_stages, dst_access) = attachment_stages_access(dst_view.desc.aspects);
        let ops = [
            OpAccess::image(
                src,
                src_view.subresources(),
                src.layout(),
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
            OpAccess::image(dst, dst_view.subresources(), dst_layout, dst_stages, dst_access),
        ];
        self.prepare_ops(&ops);

        let ([dst_min, dst_max], [flip_x, flip_y]) = normalize_region(dst_offsets);
        let ([src_min, src_max], [src_flip_x, src_flip_y]) = normalize_region(src_offsets);
        let src_extent = src_view.mip_level_extent(0);
        let mut region = BlitRegion {
            src_offset: [
                src_min.x as f32 / src_extent.width as f32,
                src_min.y as f32 / src_extent.height as f32,
            ],
            src_extent: [
                (src_max.x - src_min.x) as f32 / src_extent.width as f32,
                (src_max.y - src_min.y) as f32 / src_extent.height as f32,
            ],
            src_layer: 0,
        };
        //mirroring on both sides cancels out
        if flip_x != src_flip_x {
            region.src_offset[0] += region.src_extent[0];
            region.src_extent[0] = -region.src_extent[0];
        }
        if flip_y != src_flip_y {
            region.src_offset[1] += region.src_extent[1];
            region.src_extent[1] = -region.src_extent[1];
        }

        let area = vk::Rect2D {
            offset: vk::Offset2D {
                x: dst_min.x,
                y: dst_min.y,
            },
            extent: vk::Extent2D {
                width: (dst_max.x - dst_min.x) as u32,
                height: (dst_max.y - dst_min.y) as u32,
            },
        };
        let viewport = vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let attachment = RenderingAttachment {
            view: dst_view.handle(),
            layout: dst_layout,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: Default::default(),
            resolve: None,
        };
        let depth_stencil = is_depth_stencil(dst_view.desc.aspects);
        let info = RenderingInfo {
            flags: vk::RenderingFlags::empty(),
            area,
            layers: 1,
            colors: if depth_stencil {
                SmallVec::new()
            } else {
                smallvec![Some(attachment)]
            },
            depth: (depth_stencil && dst_view.desc.aspects.contains(vk::ImageAspectFlags::DEPTH)).then_some(attachment),
            stencil: (depth_stencil && dst_view.desc.aspects.contains(vk::ImageAspectFlags::STENCIL))
                .then_some(attachment),
        };

        //the source is bound through the regular descriptor path, the previous binding is restored afterwards
        let saved = self.descriptors.slot(source_slot).clone();
        self.descriptors.bind(
            source_slot,
            ResourceSlot::CombinedImageSampler {
                view: src_view.clone(),
                layout: src.layout(),
                sampler: sampler.clone(),
            },
        );

        let cb = self.exec_cmd();
        self.device.inner.cmd_begin_rendering(cb, &info);
        self.device
            .inner
            .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline.handle);
        self.descriptors
            .set_bindings(vk::PipelineBindPoint::GRAPHICS, &pipeline.bindings);
        let committed = self
            .descriptors
            .commit(&mut self.list, vk::PipelineBindPoint::GRAPHICS);

        let cb = self.exec_cmd();
        let raw = &self.device.inner;
        raw.cmd_set_viewports(cb, &[viewport]);
        raw.cmd_set_scissors(cb, &[area]);
        for layer in 0..dst_view.desc.layer_count.min(src_view.desc.layer_count) {
            region.src_layer = layer;
            if let Some(range) = pipeline.bindings.push_constants() {
                raw.cmd_push_constants(
                    cb,
                    pipeline.bindings.layout.inner,
                    range.stage_flags,
                    range.offset,
                    bytemuck::bytes_of(&region),
                );
            }
            match &committed {
                Ok(()) => raw.cmd_draw(cb, 3, 1, 0, 0),
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to bind blit source: {}", _e);
                    break;
                }
            }
        }
        raw.cmd_end_rendering(cb);

        self.descriptors.bind(source_slot, saved);
        self.list.track(&pipeline, Access::empty());
        self.list.track(&sampler, Access::READ);
        self.list.track(src_view, Access::READ);
        self.list.track(dst_view, Access::WRITE);
        self.release_ops(&ops);

        self.flags |= ContextFlags::GP_DIRTY_PIPELINE
            | ContextFlags::GP_DIRTY_VIEWPORTS
            | ContextFlags::GP_DIRTY_PUSH_CONSTANTS;
    }

    ///Resolves a multisampled subresource of `src` into `dst`. `format` may reinterpret both images, `UNDEFINED`
    /// keeps the image format.
    pub fn resolve_image(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
        format: vk::Format,
    ) {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.prepare_image_transfer(src);
        self.prepare_image_transfer(dst);

        let same_format = format == vk::Format::UNDEFINED
            || (format == src.desc.format && format == dst.desc.format);
        let native = same_format
            && src_subresource.aspect_mask == vk::ImageAspectFlags::COLOR
            && src.desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC)
            && dst.desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST);
        if native {
            self.resolve_image_native(dst, dst_subresource, src, src_subresource);
        } else {
            let format = if format == vk::Format::UNDEFINED {
                src.desc.format
            } else {
                format
            };
            self.resolve_image_attachment(dst, dst_subresource, src, src_subresource, format);
        }
    }

    fn resolve_image_native(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
    ) {
        let src_layout = src.pick_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let dst_layout = dst.pick_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let ops = [
            OpAccess::image(
                src,
                crate::transfer::layers_range(&src_subresource),
                src_layout,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            OpAccess::image(
                dst,
                crate::transfer::layers_range(&dst_subresource),
                dst_layout,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
        ];
        self.prepare_ops(&ops);

        let cb = self.exec_cmd();
        self.device.inner.cmd_resolve_image(
            cb,
            src.handle(),
            src_layout,
            dst.handle(),
            dst_layout,
            &[vk::ImageResolve {
                src_subresource,
                src_offset: vk::Offset3D::default(),
                dst_subresource,
                dst_offset: vk::Offset3D::default(),
                extent: src.mip_level_extent(src_subresource.mip_level),
            }],
        );
        self.release_ops(&ops);
    }

    ///Resolves through the resolve attachment of an otherwise empty rendering scope.
    fn resolve_image_attachment(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
        format: vk::Format,
    ) {
        let aspects = src_subresource.aspect_mask;
        let attachment_usage = if is_depth_stencil(aspects) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        if !src.desc.usage.contains(attachment_usage) || !dst.desc.usage.contains(attachment_usage) {
            #[cfg(feature = "logging")]
            log::error!("Resolve from {:?} to {:?} is not supported", src, dst);
            return;
        }

        let view = |image: &Arc<Image>, layers: &vk::ImageSubresourceLayers| {
            let mut desc = ImgViewDesc::of_image(image)
                .with_aspects(layers.aspect_mask)
                .with_levels(layers.mip_level, 1)
                .with_layers(layers.base_array_layer, layers.layer_count)
                .with_usage(attachment_usage);
            desc.format = format;
            ImageView::new(image, desc)
        };
        let (src_view, dst_view) = match (view(src, &src_subresource), view(dst, &dst_subresource)) {
            (Ok(src_view), Ok(dst_view)) => (src_view, dst_view),
            (Err(_e), _) | (_, Err(_e)) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to create resolve views: {}", _e);
                return;
            }
        };

        let is_integer = format_info(format).is_some_and(|f| f.flags.is_integer);
        let mode = if is_depth_stencil(aspects) || is_integer {
            vk::ResolveModeFlags::SAMPLE_ZERO
        } else {
            vk::ResolveModeFlags::AVERAGE
        };

        let src_layout = src.pick_layout(attachment_layout(aspects));
        let dst_layout = dst.pick_layout(attachment_layout(aspects));
        let (stages, access) = attachment_stages_access(aspects);
        let ops = [
            OpAccess::image(src, src_view.subresources(), src_layout, stages, access),
            OpAccess::image(dst, dst_view.subresources(), dst_layout, stages, access),
        ];
        self.prepare_ops(&ops);

        let attachment = RenderingAttachment {
            view: src_view.handle(),
            layout: src_layout,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: Default::default(),
            resolve: Some(AttachmentResolve {
                view: dst_view.handle(),
                layout: dst_layout,
                mode,
            }),
        };
        let extent = src_view.mip_level_extent(0);
        let info = RenderingInfo {
            flags: vk::RenderingFlags::empty(),
            area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            },
            layers: src_subresource.layer_count,
            colors: if is_depth_stencil(aspects) {
                SmallVec::new()
            } else {
                smallvec![Some(attachment)]
            },
            depth: aspects.contains(vk::ImageAspectFlags::DEPTH).then_some(attachment),
            stencil: aspects.contains(vk::ImageAspectFlags::STENCIL).then_some(attachment),
        };

        let cb = self.exec_cmd();
        self.device.inner.cmd_begin_rendering(cb, &info);
        self.device.inner.cmd_end_rendering(cb);

        self.list.track(&src_view, Access::READ);
        self.list.track(&dst_view, Access::WRITE);
        self.release_ops(&ops);
    }

    ///Copies between different aspects of two images, for instance depth into a color image, through a temporary
    /// buffer. Both aspects need the same element size.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy_image_cross_aspect(
        &mut self,
        dst: &Arc<Image>,
        dst_subresource: vk::ImageSubresourceLayers,
        dst_offset: vk::Offset3D,
        src: &Arc<Image>,
        src_subresource: vk::ImageSubresourceLayers,
        src_offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) {
        let src_size = aspect_element_size(src.desc.format, src_subresource.aspect_mask);
        let dst_size = aspect_element_size(dst.desc.format, dst_subresource.aspect_mask);
        let element_size = match (src_size, dst_size) {
            (Some(a), Some(b)) if a == b => a as vk::DeviceSize,
            _ => {
                #[cfg(feature = "logging")]
                log::error!(
                    "Can not copy {:?} of {:?} into {:?} of {:?}",
                    src_subresource.aspect_mask,
                    src.desc.format,
                    dst_subresource.aspect_mask,
                    dst.desc.format
                );
                return;
            }
        };

        let size = element_size
            * extent.width as vk::DeviceSize
            * extent.height as vk::DeviceSize
            * extent.depth as vk::DeviceSize
            * src_subresource.layer_count as vk::DeviceSize;
        let desc = BufDesc::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let temp = match Buffer::new(&self.device, desc) {
            Ok(temp) => temp,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to create buffer for cross aspect copy: {}", _e);
                return;
            }
        };

        self.copy_image_to_buffer(&temp, 0, 0, 0, src, src_subresource, src_offset, extent);
        self.copy_buffer_to_image(dst, dst_subresource, dst_offset, extent, &temp, 0, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{device::ClearValue, resources::ImgDesc, testing::Command};
    use dxvk_descriptor::BindingInfo;

    use super::*;
    use crate::testing::{TestContext, pipeline};

    const FULL: [vk::Offset3D; 2] = [vk::Offset3D { x: 0, y: 0, z: 0 }, vk::Offset3D { x: 16, y: 16, z: 1 }];

    fn layers(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn supported_blit_is_native() {
        let mut t = TestContext::new();
        let src = t.color_target(16, 16);
        let dst = t.color_target(16, 16);

        t.context.blit_image(&dst, FULL, &src, FULL, vk::Filter::LINEAR);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::BlitImage {
                filter: vk::Filter::LINEAR,
                ..
            }
        )));
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn unfilterable_blit_draws() {
        let mut t = TestContext::new();
        let blit = pipeline(
            &t.device,
            vk::PipelineBindPoint::GRAPHICS,
            &[BindingInfo::new(
                0,
                0,
                40,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )],
            7,
        );
        *t.pipelines.meta_blit.lock() = Some(blit);
        let src = t.view(ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UINT));
        let dst = t.view(ImgDesc::render_target_2d(16, 16, vk::Format::R8G8B8A8_UINT));
        //mirrored horizontally
        let mirrored = [vk::Offset3D { x: 16, y: 0, z: 0 }, vk::Offset3D { x: 0, y: 16, z: 1 }];

        t.context.blit_image(&dst, mirrored, &src, FULL, vk::Filter::LINEAR);
        assert!(t.context.descriptors().slot(40).is_empty());
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert!(!commands.iter().any(|c| matches!(c, Command::BlitImage { .. })));
        let begin = commands
            .iter()
            .position(|c| matches!(c, Command::BeginRendering(_)))
            .unwrap();
        let draw = commands
            .iter()
            .position(|c| matches!(c, Command::Draw { vertex_count: 3, .. }))
            .unwrap();
        assert!(begin < draw);

        let region = commands
            .iter()
            .find_map(|c| match c {
                Command::PushConstants { data, .. } => Some(bytemuck::pod_read_unaligned::<BlitRegion>(data)),
                _ => None,
            })
            .unwrap();
        assert_eq!(region.src_offset, [1.0, 0.0]);
        assert_eq!(region.src_extent, [-1.0, 1.0]);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn blit_without_pipeline_is_skipped() {
        let mut t = TestContext::new();
        let src = t.view(ImgDesc::texture_2d(16, 16, vk::Format::R8G8B8A8_UINT));
        let dst = t.view(ImgDesc::render_target_2d(16, 16, vk::Format::R8G8B8A8_UINT));

        t.context.blit_image(&dst, FULL, &src, FULL, vk::Filter::LINEAR);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert!(!commands.iter().any(|c| c.is_draw() || matches!(c, Command::BlitImage { .. })));
    }

    #[test]
    fn resolve_paths() {
        let mut t = TestContext::new();
        let msaa = Image::new(
            &t.device,
            ImgDesc::render_target_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_samples(vk::SampleCountFlags::TYPE_4),
        )
        .unwrap();
        let single = Image::new(&t.device, ImgDesc::render_target_2d(16, 16, vk::Format::R8G8B8A8_UNORM)).unwrap();
        let color = layers(vk::ImageAspectFlags::COLOR);

        t.context
            .resolve_image(&single, color, &msaa, color, vk::Format::UNDEFINED);
        t.context
            .resolve_image(&single, color, &msaa, color, vk::Format::R8G8B8A8_SRGB);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, Command::ResolveImage { .. }))
                .count(),
            1
        );
        let resolve = commands
            .iter()
            .find_map(|c| match c {
                Command::BeginRendering(info) => info.colors.first().copied().flatten(),
                _ => None,
            })
            .and_then(|a| a.resolve)
            .unwrap();
        assert_eq!(resolve.mode, vk::ResolveModeFlags::AVERAGE);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn depth_to_color_copy_goes_through_buffer() {
        let mut t = TestContext::new();
        let depth = Image::new(&t.device, ImgDesc::render_target_2d(8, 8, vk::Format::D16_UNORM)).unwrap();
        let color = Image::new(&t.device, ImgDesc::texture_2d(8, 8, vk::Format::R16_UINT)).unwrap();
        let view = ImageView::new(&depth, ImgViewDesc::of_image(&depth)).unwrap();
        t.context
            .clear_render_target(&view, vk::ImageAspectFlags::DEPTH, ClearValue::depth_stencil(1.0, 0));

        t.context.copy_image(
            &color,
            layers(vk::ImageAspectFlags::COLOR),
            vk::Offset3D::default(),
            &depth,
            layers(vk::ImageAspectFlags::DEPTH),
            vk::Offset3D::default(),
            vk::Extent3D {
                width: 8,
                height: 8,
                depth: 1,
            },
        );
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        //the pending clear lands before the copy reads the image
        let clear = commands
            .iter()
            .position(|c| matches!(c, Command::BeginRendering(_)))
            .unwrap();
        let to_buffer = commands
            .iter()
            .position(|c| matches!(c, Command::CopyImageToBuffer { .. }))
            .unwrap();
        let to_image = commands
            .iter()
            .position(|c| matches!(c, Command::CopyBufferToImage { .. }))
            .unwrap();
        assert!(clear < to_buffer);
        assert!(to_buffer < to_image);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn blit_region_layout() {
        assert_eq!(std::mem::size_of::<BlitRegion>(), 20);
        let region = BlitRegion {
            src_offset: [0.5, 0.0],
            src_extent: [0.5, 1.0],
            src_layer: 2,
        };
        let bytes = bytemuck::bytes_of(&region);
        assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
    }

    #[test]
    fn mirrored_regions_are_normalized() {
        let (corners, flipped) = normalize_region([
            vk::Offset3D { x: 8, y: 0, z: 0 },
            vk::Offset3D { x: 0, y: 4, z: 1 },
        ]);
        assert_eq!(corners[0], vk::Offset3D { x: 0, y: 0, z: 0 });
        assert_eq!(corners[1], vk::Offset3D { x: 8, y: 4, z: 1 });
        assert_eq!(flipped, [true, false]);
    }
}
