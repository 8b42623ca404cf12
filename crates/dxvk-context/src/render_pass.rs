//! Render pass scopes and clears.
//!
//! A render pass is started lazily by the first draw after the render targets changed. Work that can not be recorded
//! inside of rendering either *suspends* the pass, which ends rendering but keeps the attachments in attachment layout
//! so the pass can be resumed cheaply, or *closes* it, which transitions the attachments back to their resting layout.

use std::sync::Arc;

use dxvk::{
    ash::vk,
    device::{ClearAttachment, ClearValue, RenderingAttachment, RenderingInfo},
    resources::ImageView,
};
use dxvk_commands::{Access, CmdBuffer};
use smallvec::{SmallVec, smallvec};

use crate::{
    Context,
    clear::{ClearInsert, DeferredClear},
    framebuffer::{
        Attachment, AttachmentIndex, COLOR_ATTACHMENT_ACCESS, COLOR_ATTACHMENT_STAGES, DEPTH_ATTACHMENT_ACCESS,
        DEPTH_ATTACHMENT_STAGES, MAX_RENDER_TARGETS, attachment_layout, is_depth_stencil, writable_aspects,
    },
    query::QueryKind,
    state::ContextFlags,
    transfer::OpAccess,
};

const ALL_GRAPHICS_WRITES: vk::AccessFlags2 = vk::AccessFlags2::MEMORY_WRITE;
const ALL_ACCESS: vk::AccessFlags2 =
    vk::AccessFlags2::from_raw(vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw());

fn load_op(clear: Option<&DeferredClear>, aspect: vk::ImageAspectFlags) -> vk::AttachmentLoadOp {
    match clear {
        Some(c) if c.clear_aspects.contains(aspect) => vk::AttachmentLoadOp::CLEAR,
        Some(c) if c.discard_aspects.contains(aspect) => vk::AttachmentLoadOp::DONT_CARE,
        _ => vk::AttachmentLoadOp::LOAD,
    }
}

fn rendering_attachment(
    attachment: &Attachment,
    clear: Option<&DeferredClear>,
    aspect: vk::ImageAspectFlags,
) -> RenderingAttachment {
    RenderingAttachment {
        view: attachment.view.handle(),
        layout: attachment.layout,
        load_op: load_op(clear, aspect),
        store_op: vk::AttachmentStoreOp::STORE,
        clear: clear.map(|c| c.value).unwrap_or_default(),
        resolve: None,
    }
}

fn attachment_slot(index: AttachmentIndex) -> usize {
    match index {
        AttachmentIndex::Color(i) => i,
        AttachmentIndex::Depth => MAX_RENDER_TARGETS,
    }
}

///Color attachments of a rendering scope. Trailing unused slots are dropped.
fn trim_colors(colors: &mut SmallVec<[Option<RenderingAttachment>; 8]>) {
    while matches!(colors.last(), Some(None)) {
        colors.pop();
    }
}

impl Context {
    ///Begins rendering to the bound render targets, or resumes the suspended pass if the targets did not change.
    ///
    /// Deferred clears of the attachments become load ops. Returns false if there is nothing to render to.
    pub(crate) fn start_render_pass(&mut self) -> bool {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if self.flags.contains(ContextFlags::RENDER_PASS_BOUND) {
            return true;
        }
        if self.targets.is_empty() {
            #[cfg(feature = "logging")]
            log::warn!("Draw without render targets");
            return false;
        }

        let targets = self.targets.clone();
        let mut resume = self.flags.contains(ContextFlags::RENDER_PASS_SUSPENDED)
            && self.active_targets.as_ref().is_some_and(|a| a.matches(&targets));

        let mut loads: [Option<DeferredClear>; MAX_RENDER_TARGETS + 1] = Default::default();
        let mut standalone: SmallVec<[DeferredClear; 4]> = SmallVec::new();
        for (index, attachment) in targets.iter() {
            let Some(clear) = self.clears.take_view(&attachment.view) else {
                continue;
            };
            //load ops may only touch aspects the attachment layout can write
            let aspects = clear.clear_aspects | clear.discard_aspects;
            if writable_aspects(attachment.layout).contains(aspects) {
                loads[attachment_slot(index)] = Some(clear);
            } else {
                standalone.push(clear);
            }
        }

        //clears of other views of the attachment images can not be folded
        for (_, attachment) in targets.iter() {
            standalone.extend(self.clears.take_image(&attachment.view.image));
        }
        if !standalone.is_empty() {
            self.spill_render_pass(false);
            resume = false;
            for clear in standalone {
                self.execute_clear(clear);
            }
        }
        if self.flags.contains(ContextFlags::RENDER_PASS_SUSPENDED) && !resume {
            self.spill_render_pass(false);
        }

        if !resume {
            for (_, attachment) in targets.iter() {
                self.flush_if_image_dirty(&attachment.view.image, &attachment.view.subresources());
            }
            let barriers = self.list.barriers(CmdBuffer::Exec);
            for (_, attachment) in targets.iter() {
                let image = &attachment.view.image;
                if image.layout() == attachment.layout {
                    continue;
                }
                let (stages, access) = attachment.stages_access();
                barriers.access_image(
                    image.handle(),
                    attachment.view.subresources(),
                    image.layout(),
                    image.desc.stages,
                    image.desc.access,
                    attachment.layout,
                    stages,
                    access,
                );
            }
            self.flags.remove(ContextFlags::GP_RENDER_PASS_SIDE_EFFECTS);
        }
        //a plain suspend leaves only global dependencies behind, those can wait until the pass is closed
        if !resume || self.list.barriers(CmdBuffer::Exec).has_pending_accesses() {
            self.list.flush_barriers(CmdBuffer::Exec);
        }

        let (extent, layers) = targets.render_area();
        let mut info = RenderingInfo {
            flags: vk::RenderingFlags::empty(),
            area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
            layers,
            colors: targets
                .colors
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    a.as_ref()
                        .map(|a| rendering_attachment(a, loads[i].as_ref(), vk::ImageAspectFlags::COLOR))
                })
                .collect(),
            depth: None,
            stencil: None,
        };
        trim_colors(&mut info.colors);
        if let Some(attachment) = &targets.depth {
            let clear = loads[MAX_RENDER_TARGETS].as_ref();
            let aspects = attachment.view.desc.aspects;
            if aspects.contains(vk::ImageAspectFlags::DEPTH) {
                info.depth = Some(rendering_attachment(attachment, clear, vk::ImageAspectFlags::DEPTH));
            }
            if aspects.contains(vk::ImageAspectFlags::STENCIL) {
                info.stencil = Some(rendering_attachment(attachment, clear, vk::ImageAspectFlags::STENCIL));
            }
        }

        let cb = self.exec_cmd();
        self.device.inner.cmd_begin_rendering(cb, &info);
        for (_, attachment) in targets.iter() {
            self.list.track(&attachment.view, Access::WRITE);
            self.list.track(&attachment.view.image, Access::WRITE);
        }

        self.flags.remove(ContextFlags::RENDER_PASS_SUSPENDED);
        self.flags |= ContextFlags::RENDER_PASS_BOUND;
        self.active_targets = Some(targets);

        for kind in [QueryKind::Occlusion, QueryKind::PipelineStatistics] {
            if let Err(_e) = self.queries.begin_queries(&mut self.list, kind) {
                #[cfg(feature = "logging")]
                log::error!("Failed to begin {:?} queries: {}", kind, _e);
            }
        }

        self.flags |= ContextFlags::GP_DIRTY_DYNAMIC_STATE
            | ContextFlags::GP_DIRTY_VERTEX_BUFFERS
            | ContextFlags::GP_DIRTY_INDEX_BUFFER
            | ContextFlags::GP_DIRTY_XFB_BUFFERS
            | ContextFlags::GP_DIRTY_PUSH_CONSTANTS;

        #[cfg(feature = "logging")]
        log::trace!("{} render pass", if resume { "Resumed" } else { "Started" });
        true
    }

    ///Ends rendering. With `suspend` the attachments stay in attachment layout and the pass can be resumed by
    /// [start_render_pass](Self::start_render_pass), otherwise the pass is closed.
    pub(crate) fn spill_render_pass(&mut self, suspend: bool) {
        if self.flags.contains(ContextFlags::RENDER_PASS_BOUND) {
            self.pause_transform_feedback();
            self.queries.end_queries(&mut self.list, QueryKind::Occlusion);
            self.queries.end_queries(&mut self.list, QueryKind::PipelineStatistics);

            let cb = self.exec_cmd();
            self.device.inner.cmd_end_rendering(cb);
            self.flags.remove(ContextFlags::RENDER_PASS_BOUND);
            self.flags |= ContextFlags::RENDER_PASS_SUSPENDED;

            //everything recorded after the pass waits for the graphics work
            self.list.barriers(CmdBuffer::Exec).access_memory(
                vk::PipelineStageFlags2::ALL_GRAPHICS,
                ALL_GRAPHICS_WRITES,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                ALL_ACCESS,
            );
        }

        if suspend || !self.flags.contains(ContextFlags::RENDER_PASS_SUSPENDED) {
            return;
        }

        if let Some(targets) = self.active_targets.take() {
            let barriers = self.list.barriers(CmdBuffer::Exec);
            for (_, attachment) in targets.iter() {
                let image = &attachment.view.image;
                if image.layout() == attachment.layout {
                    continue;
                }
                let (stages, access) = attachment.stages_access();
                barriers.access_image(
                    image.handle(),
                    attachment.view.subresources(),
                    attachment.layout,
                    stages,
                    access,
                    image.layout(),
                    image.desc.stages,
                    image.desc.access,
                );
            }
        }
        self.list.flush_barriers(CmdBuffer::Exec);
        self.flags
            .remove(ContextFlags::RENDER_PASS_SUSPENDED | ContextFlags::GP_RENDER_PASS_SIDE_EFFECTS);

        #[cfg(feature = "logging")]
        log::trace!("Closed render pass");
    }

    ///Executes every deferred clear.
    pub(crate) fn flush_clears(&mut self) {
        let clears: SmallVec<[DeferredClear; 8]> = self.clears.drain().collect();
        for clear in clears {
            self.execute_clear(clear);
        }
    }

    ///Executes a single deferred clear on its own. Discards need no work.
    pub(crate) fn execute_clear(&mut self, clear: DeferredClear) {
        if clear.clear_aspects.is_empty() {
            return;
        }
        self.leave_render_pass_for(&clear.view);

        let view = clear.view;
        let attachment_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        if view.desc.usage.intersects(attachment_usage) {
            self.render_clear(&view, clear.clear_aspects, clear.value, None);
        } else if view.image.desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            self.transfer_clear(&view, clear.clear_aspects, clear.value);
        } else {
            #[cfg(feature = "logging")]
            log::error!("Can not clear image view {:?}, no attachment or transfer usage", view);
        }
    }

    ///Leaves rendering before `view` is written outside of the render pass. A pass that renders to the image is closed.
    fn leave_render_pass_for(&mut self, view: &ImageView) {
        let renders_to_image = self
            .active_targets
            .as_ref()
            .is_some_and(|t| t.uses_image(&view.image));
        if renders_to_image {
            self.spill_render_pass(false);
        } else {
            self.end_render_pass_scope();
        }
    }

    ///Clears `aspects` of `view` in a rendering scope of its own. Without `rect` the whole view is cleared through the
    /// load op.
    fn render_clear(
        &mut self,
        view: &Arc<ImageView>,
        aspects: vk::ImageAspectFlags,
        value: ClearValue,
        rect: Option<vk::Rect2D>,
    ) {
        let image = &view.image;
        let depth_stencil = is_depth_stencil(view.desc.aspects);
        let layout = image.pick_layout(attachment_layout(view.desc.aspects));
        let (stages, access) = if depth_stencil {
            (DEPTH_ATTACHMENT_STAGES, DEPTH_ATTACHMENT_ACCESS)
        } else {
            (COLOR_ATTACHMENT_STAGES, COLOR_ATTACHMENT_ACCESS)
        };
        let ops = [OpAccess::image(image, view.subresources(), layout, stages, access)];
        self.prepare_ops(&ops);

        let attachment = |aspect: vk::ImageAspectFlags| RenderingAttachment {
            view: view.handle(),
            layout,
            load_op: if rect.is_none() && aspects.contains(aspect) {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            },
            store_op: vk::AttachmentStoreOp::STORE,
            clear: value,
            resolve: None,
        };

        let extent = view.mip_level_extent(0);
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };
        let info = RenderingInfo {
            flags: vk::RenderingFlags::empty(),
            area,
            layers: view.desc.layer_count,
            colors: if depth_stencil {
                SmallVec::new()
            } else {
                smallvec![Some(attachment(vk::ImageAspectFlags::COLOR))]
            },
            depth: view
                .desc
                .aspects
                .contains(vk::ImageAspectFlags::DEPTH)
                .then(|| attachment(vk::ImageAspectFlags::DEPTH)),
            stencil: view
                .desc
                .aspects
                .contains(vk::ImageAspectFlags::STENCIL)
                .then(|| attachment(vk::ImageAspectFlags::STENCIL)),
        };

        let cb = self.exec_cmd();
        let raw = &self.device.inner;
        raw.cmd_begin_rendering(cb, &info);
        if let Some(rect) = rect {
            raw.cmd_clear_attachments(
                cb,
                &[ClearAttachment {
                    aspects,
                    color_attachment: 0,
                    value,
                }],
                &[vk::ClearRect {
                    rect,
                    base_array_layer: 0,
                    layer_count: view.desc.layer_count,
                }],
            );
        }
        raw.cmd_end_rendering(cb);

        self.list.track(view, Access::WRITE);
        self.release_ops(&ops);
    }

    fn transfer_clear(&mut self, view: &Arc<ImageView>, aspects: vk::ImageAspectFlags, value: ClearValue) {
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspects,
            ..view.subresources()
        };
        self.clear_image_range(&view.image, range, value);
    }

    ///Clears `aspects` of a render target view to `value`.
    ///
    /// If the view is an attachment of the active render pass the clear is recorded right away. Otherwise it is
    /// deferred, and ideally ends up as load op of the next render pass on that view.
    pub fn clear_render_target(&mut self, view: &Arc<ImageView>, aspects: vk::ImageAspectFlags, value: ClearValue) {
        if let Some(index) = self.inline_clear_target(view, aspects) {
            self.clear_active_attachment(index, view, aspects, value, None);
            return;
        }

        if self.clears.clear(view, aspects, value) == ClearInsert::FlushRequired {
            self.flush_clears();
            self.clears.clear(view, aspects, value);
        }
    }

    ///Marks `aspects` of `view` as undefined. A pending clear of those aspects is dropped.
    pub fn discard_image_view(&mut self, view: &Arc<ImageView>, aspects: vk::ImageAspectFlags) {
        //draws recorded so far must keep their results, the discard applies to the next pass
        if self
            .active_targets
            .as_ref()
            .is_some_and(|t| t.uses_image(&view.image))
        {
            self.spill_render_pass(false);
        }
        if self.clears.discard(view, aspects) == ClearInsert::FlushRequired {
            self.flush_clears();
            self.clears.discard(view, aspects);
        }
    }

    ///Clears a region of `view`. A region that covers the whole view behaves like
    /// [clear_render_target](Self::clear_render_target).
    pub fn clear_image_view(
        &mut self,
        view: &Arc<ImageView>,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        aspects: vk::ImageAspectFlags,
        value: ClearValue,
    ) {
        let view_extent = view.mip_level_extent(0);
        let full = offset == vk::Offset3D::default()
            && extent.width >= view_extent.width
            && extent.height >= view_extent.height;
        if full {
            self.clear_render_target(view, aspects, value);
            return;
        }

        let rect = vk::Rect2D {
            offset: vk::Offset2D {
                x: offset.x,
                y: offset.y,
            },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };

        let attachment_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        if !view.desc.usage.intersects(attachment_usage) {
            #[cfg(feature = "logging")]
            log::error!("Partial clears need an attachment view, {:?} has usage {:?}", view, view.desc.usage);
            return;
        }

        if let Some(index) = self.inline_clear_target(view, aspects) {
            self.clear_active_attachment(index, view, aspects, value, Some(rect));
            return;
        }

        //pending clears of the image have to land first
        let pending = self.clears.take_image(&view.image);
        for clear in pending {
            self.execute_clear(clear);
        }
        self.leave_render_pass_for(view);
        self.render_clear(view, aspects, value, Some(rect));
    }

    ///Attachment of the bound render pass that `aspects` of `view` can be cleared on inline.
    ///
    /// If the pass renders to the image in any other way it is closed, so that the clear lands after the draws recorded
    /// so far and before any later one.
    fn inline_clear_target(&mut self, view: &ImageView, aspects: vk::ImageAspectFlags) -> Option<AttachmentIndex> {
        if !self.flags.contains(ContextFlags::RENDER_PASS_BOUND) {
            return None;
        }
        let active = self.active_targets.as_ref()?;
        if let Some(index) = active.find(view) {
            if active
                .get(index)
                .is_some_and(|a| writable_aspects(a.layout).contains(aspects))
            {
                return Some(index);
            }
        }
        if active.uses_image(&view.image) {
            self.spill_render_pass(false);
        }
        None
    }

    fn clear_active_attachment(
        &mut self,
        index: AttachmentIndex,
        view: &ImageView,
        aspects: vk::ImageAspectFlags,
        value: ClearValue,
        rect: Option<vk::Rect2D>,
    ) {
        let extent = view.mip_level_extent(0);
        let rect = rect.unwrap_or(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        });
        let color_attachment = match index {
            AttachmentIndex::Color(i) => i as u32,
            AttachmentIndex::Depth => 0,
        };

        let cb = self.exec_cmd();
        self.device.inner.cmd_clear_attachments(
            cb,
            &[ClearAttachment {
                aspects,
                color_attachment,
                value,
            }],
            &[vk::ClearRect {
                rect,
                base_array_layer: 0,
                layer_count: view.desc.layer_count,
            }],
        );
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{
        resources::{Image, ImgDesc, ImgViewDesc},
        testing::Command,
    };

    use super::*;
    use crate::{framebuffer::RenderTargets, testing::TestContext};

    fn targets(view: &Arc<ImageView>) -> RenderTargets {
        let mut targets = RenderTargets::default();
        targets.colors[0] = Some(Attachment::new(view.clone()));
        targets
    }

    fn begins(commands: &[Command]) -> Vec<RenderingInfo> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::BeginRendering(info) => Some(info.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn deferred_clear_becomes_load_op() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let view = t.color_target(32, 32);
        let red = ClearValue::float([1.0, 0.0, 0.0, 1.0]);

        t.context.bind_render_targets(targets(&view));
        t.context.clear_render_target(&view, vk::ImageAspectFlags::COLOR, red);
        t.context.draw(3, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let begins = begins(&commands);
        assert_eq!(begins.len(), 1);
        let color = begins[0].colors[0].unwrap();
        assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color.clear, red);
        assert!(!commands.iter().any(|c| matches!(c, Command::ClearAttachments(_))));
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn discard_becomes_dont_care() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let view = t.color_target(8, 8);

        t.context.bind_render_targets(targets(&view));
        t.context.discard_image_view(&view, vk::ImageAspectFlags::COLOR);
        t.context.draw(3, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let begins = begins(&t.soft.submitted_commands());
        assert_eq!(begins[0].colors[0].unwrap().load_op, vk::AttachmentLoadOp::DONT_CARE);
    }

    #[test]
    fn resume_after_suspend_is_barrier_free() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let view = t.color_target(16, 16);

        t.context.bind_render_targets(targets(&view));
        t.context.draw(3, 1, 0, 0);
        t.context.spill_render_pass(true);
        assert!(t.context.flags.contains(ContextFlags::RENDER_PASS_SUSPENDED));
        t.context.draw(3, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let end = commands
            .iter()
            .position(|c| matches!(c, Command::EndRendering))
            .unwrap();
        let resumed = end
            + commands[end..]
                .iter()
                .position(|c| matches!(c, Command::BeginRendering(_)))
                .unwrap();
        assert!(!commands[end..resumed].iter().any(|c| matches!(c, Command::Barrier { .. })));

        let begins = begins(&commands);
        assert_eq!(begins.len(), 2);
        assert_eq!(begins[1].colors[0].unwrap().load_op, vk::AttachmentLoadOp::LOAD);
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn clear_of_bound_attachment_is_recorded_inline() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let view = t.color_target(16, 16);

        t.context.bind_render_targets(targets(&view));
        t.context.draw(3, 1, 0, 0);
        t.context
            .clear_render_target(&view, vk::ImageAspectFlags::COLOR, ClearValue::uint([0; 4]));
        t.context.draw(3, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        assert_eq!(begins(&commands).len(), 1);
        assert!(commands.iter().any(|c| matches!(c, Command::ClearAttachments(_))));
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn partial_clear_uses_own_render_pass() {
        let mut t = TestContext::new();
        let view = t.color_target(16, 16);

        t.context.clear_image_view(
            &view,
            vk::Offset3D { x: 4, y: 4, z: 0 },
            vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            vk::ImageAspectFlags::COLOR,
            ClearValue::float([0.5; 4]),
        );
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let begins = begins(&commands);
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].colors[0].unwrap().load_op, vk::AttachmentLoadOp::LOAD);
        assert!(commands.iter().any(|c| matches!(c, Command::ClearAttachments(_))));
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn clear_of_other_view_of_attachment_stays_ordered() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let image = Image::new(
            &t.device,
            ImgDesc::render_target_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_layers(2),
        )
        .unwrap();
        let layered = ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap();
        let first_layer = ImageView::new(
            &image,
            ImgViewDesc {
                view_type: vk::ImageViewType::TYPE_2D,
                ..ImgViewDesc::of_image(&image).with_layers(0, 1)
            },
        )
        .unwrap();

        t.context.bind_render_targets(targets(&layered));
        t.context.draw(3, 1, 0, 0);
        t.context
            .clear_render_target(&first_layer, vk::ImageAspectFlags::COLOR, ClearValue::float([1.0; 4]));
        t.context.draw(4, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let draw = |count: u32| {
            commands
                .iter()
                .position(|c| matches!(c, Command::Draw { vertex_count, .. } if *vertex_count == count))
                .unwrap()
        };
        let clear = commands
            .iter()
            .position(|c| {
                matches!(c, Command::BeginRendering(info)
                    if info.colors.first().copied().flatten().is_some_and(|a| a.load_op == vk::AttachmentLoadOp::CLEAR))
            })
            .unwrap();
        assert!(draw(3) < clear);
        assert!(clear < draw(4));
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn discard_of_bound_attachment_keeps_earlier_draws() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let view = t.color_target(8, 8);

        t.context.bind_render_targets(targets(&view));
        t.context.draw(3, 1, 0, 0);
        t.context.discard_image_view(&view, vk::ImageAspectFlags::COLOR);
        t.context.draw(4, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let load_ops: Vec<_> = begins(&commands)
            .iter()
            .map(|info| info.colors[0].unwrap().load_op)
            .collect();
        assert_eq!(
            load_ops,
            vec![vk::AttachmentLoadOp::LOAD, vk::AttachmentLoadOp::DONT_CARE]
        );
        let discarded = commands
            .iter()
            .rposition(|c| matches!(c, Command::BeginRendering(_)))
            .unwrap();
        let second_draw = commands
            .iter()
            .position(|c| matches!(c, Command::Draw { vertex_count: 4, .. }))
            .unwrap();
        assert!(discarded < second_draw);
    }

    #[test]
    fn read_only_depth_is_not_cleared_through_load_op() {
        let mut t = TestContext::new();
        t.use_graphics(&[]);
        let depth = t.view(ImgDesc::render_target_2d(16, 16, vk::Format::D32_SFLOAT));

        let mut targets = RenderTargets::default();
        targets.depth = Some(Attachment {
            view: depth.clone(),
            layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        });
        t.context.bind_render_targets(targets);
        t.context
            .clear_render_target(&depth, vk::ImageAspectFlags::DEPTH, ClearValue::depth_stencil(1.0, 0));
        t.context.draw(3, 1, 0, 0);
        t.context.flush_and_wait().unwrap();

        let depths: Vec<_> = begins(&t.soft.submitted_commands())
            .iter()
            .filter_map(|info| info.depth.map(|d| (d.layout, d.load_op)))
            .collect();
        assert_eq!(
            depths,
            vec![
                (
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    vk::AttachmentLoadOp::CLEAR
                ),
                (
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                    vk::AttachmentLoadOp::LOAD
                ),
            ]
        );
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn pending_clear_executes_on_flush() {
        let mut t = TestContext::new();
        let view = t.color_target(16, 16);

        t.context
            .clear_render_target(&view, vk::ImageAspectFlags::COLOR, ClearValue::float([1.0; 4]));
        t.context.flush_and_wait().unwrap();

        let begins = begins(&t.soft.submitted_commands());
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].colors[0].unwrap().load_op, vk::AttachmentLoadOp::CLEAR);
    }
}
