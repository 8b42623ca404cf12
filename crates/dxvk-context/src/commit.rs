//! Lazy state application. Everything a draw or dispatch depends on is resolved here, right before the command is
//! recorded.

use std::sync::Arc;

use dxvk::{
    BarrierControl,
    ash::vk,
    resources::{BufferSlice, BufferSliceHandle, ImageView},
};
use dxvk_commands::{Access, CmdBuffer, CommandList};
use dxvk_descriptor::ResourceSlot;
use smallvec::SmallVec;

use crate::{Context, clear::DeferredClear, pipeline::PipelineFlags, query::QueryKind, state::ContextFlags};

const GRAPHICS: vk::PipelineBindPoint = vk::PipelineBindPoint::GRAPHICS;
const COMPUTE: vk::PipelineBindPoint = vk::PipelineBindPoint::COMPUTE;

const XFB_COUNTER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT.as_raw() | vk::PipelineStageFlags2::DRAW_INDIRECT.as_raw(),
);
const XFB_COUNTER_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_READ_EXT.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT.as_raw(),
);

#[derive(Clone, Debug)]
pub(crate) enum BarrierTarget {
    Buffer(BufferSliceHandle),
    Image {
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
    },
}

///One resource access of a draw or dispatch.
///
/// `stages` and `access` describe the operation, `dst_stages` and `dst_access` everything the resource may be used
/// with afterwards.
#[derive(Clone, Debug)]
pub(crate) struct BarrierAccess {
    pub target: BarrierTarget,
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BarrierAccess {
    pub fn buffer(slice: &BufferSlice, stages: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        BarrierAccess {
            target: BarrierTarget::Buffer(slice.handle()),
            stages,
            access,
            dst_stages: slice.buffer.desc.stages,
            dst_access: slice.buffer.desc.access,
        }
    }

    pub fn indirect(slice: &BufferSlice) -> Self {
        Self::buffer(
            slice,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
        )
    }

    pub fn image(
        view: &ImageView,
        layout: vk::ImageLayout,
        stages: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        BarrierAccess {
            target: BarrierTarget::Image {
                image: view.image.handle(),
                range: view.subresources(),
                layout,
            },
            stages,
            access,
            dst_stages: view.image.desc.stages,
            dst_access: view.image.desc.access,
        }
    }
}

type Accesses = SmallVec<[BarrierAccess; 16]>;

///True if any of `accesses` has to wait for pending work of the exec command buffer.
pub(crate) fn is_exec_dirty(list: &mut CommandList, accesses: &[BarrierAccess], ignore_waw: bool) -> bool {
    let barriers = list.barriers(CmdBuffer::Exec);
    accesses.iter().any(|a| {
        let access = Access::from_vk(a.access);
        match &a.target {
            BarrierTarget::Buffer(handle) => barriers.is_buffer_dirty(handle, access, ignore_waw),
            BarrierTarget::Image { image, range, .. } => barriers.is_image_dirty(*image, range, access, ignore_waw),
        }
    })
}

///Registers `accesses` as pending on the exec command buffer. Must be called before anything else is flushed.
pub(crate) fn record_exec_accesses(list: &mut CommandList, accesses: &[BarrierAccess]) {
    let barriers = list.barriers(CmdBuffer::Exec);
    for a in accesses {
        match &a.target {
            BarrierTarget::Buffer(handle) => {
                barriers.access_buffer(handle, a.stages, a.access, a.dst_stages, a.dst_access)
            }
            BarrierTarget::Image { image, range, layout } => barriers.access_image(
                *image,
                *range,
                *layout,
                a.stages,
                a.access,
                *layout,
                a.dst_stages,
                a.dst_access,
            ),
        }
    }
}

fn slot_view(slot: &ResourceSlot) -> Option<&Arc<ImageView>> {
    match slot {
        ResourceSlot::Image { view, .. } | ResourceSlot::CombinedImageSampler { view, .. } => Some(view),
        _ => None,
    }
}

impl Context {
    ///Makes the graphics state current: pipeline, render pass, barriers, descriptors, vertex input and dynamic state.
    /// Returns false if the draw has to be skipped.
    pub(crate) fn commit_graphics_state(&mut self, indexed: bool, extra: &[BarrierAccess]) -> bool {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if self.flags.contains(ContextFlags::GP_DIRTY_FRAMEBUFFER) {
            self.update_framebuffer();
        }
        if (self.flags.intersects(ContextFlags::GP_DIRTY_PIPELINE | ContextFlags::GP_DIRTY_PIPELINE_STATE)
            || self.gp_pipeline.is_none())
            && !self.update_graphics_pipeline()
        {
            return false;
        }

        self.flush_bound_clears(GRAPHICS);
        if !self.flags.contains(ContextFlags::RENDER_PASS_BOUND) && !self.start_render_pass() {
            return false;
        }

        let side_effects = self.flags.contains(ContextFlags::GP_HAS_SIDE_EFFECTS);
        if side_effects || self.flags.contains(ContextFlags::GP_RENDER_PASS_SIDE_EFFECTS) {
            let accesses = self.gather_accesses(GRAPHICS, extra);
            if !self.barrier_control.contains(BarrierControl::IGNORE_GRAPHICS_BARRIERS)
                && is_exec_dirty(&mut self.list, &accesses, false)
            {
                //barriers can not be recorded inside of rendering
                self.spill_render_pass(true);
                self.list.flush_barriers(CmdBuffer::Exec);
                if !self.start_render_pass() {
                    return false;
                }
            }
            if side_effects {
                self.flags |= ContextFlags::GP_RENDER_PASS_SIDE_EFFECTS;
                record_exec_accesses(&mut self.list, &accesses);
            }
        }

        if indexed && self.flags.take(ContextFlags::GP_DIRTY_INDEX_BUFFER) {
            self.commit_index_buffer();
        }
        if self.flags.take(ContextFlags::GP_DIRTY_VERTEX_BUFFERS) {
            self.commit_vertex_buffers();
        }

        if let Err(_e) = self.descriptors.commit(&mut self.list, GRAPHICS) {
            #[cfg(feature = "logging")]
            log::error!("Failed to commit graphics descriptors: {}", _e);
            return false;
        }

        self.commit_transform_feedback();
        self.commit_dynamic_state();
        if self.flags.take(ContextFlags::GP_DIRTY_PUSH_CONSTANTS) {
            self.commit_push_constants(GRAPHICS);
        }
        true
    }

    ///Makes the compute state current. A missing pipeline leaves everything untouched and returns false.
    pub(crate) fn commit_compute_state(&mut self, extra: &[BarrierAccess]) -> bool {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let mut bind = None;
        if self.flags.contains(ContextFlags::CP_DIRTY_PIPELINE) || self.cp_pipeline.is_none() {
            let Some(shader) = &self.cs_shader else {
                #[cfg(feature = "logging")]
                log::warn!("Dispatch without compute shader");
                return false;
            };
            let Some(pipeline) = self.pipelines.compute_pipeline(shader, &self.cs_spec) else {
                #[cfg(feature = "logging")]
                log::warn!("No compute pipeline available, skipping dispatch");
                return false;
            };
            bind = Some(pipeline);
        }

        self.end_render_pass_scope();
        self.flush_bound_clears(COMPUTE);

        if let Some(pipeline) = bind {
            let cb = self.exec_cmd();
            self.device.inner.cmd_bind_pipeline(cb, COMPUTE, pipeline.handle);
            self.descriptors.set_bindings(COMPUTE, &pipeline.bindings);
            self.list.track(&pipeline, Access::empty());
            self.flags.remove(ContextFlags::CP_DIRTY_PIPELINE);
            self.flags |= ContextFlags::CP_DIRTY_PUSH_CONSTANTS;
            self.cp_pipeline = Some(pipeline);
        }

        let accesses = self.gather_accesses(COMPUTE, extra);
        let ignore_waw = self.list.barriers(CmdBuffer::Exec).can_ignore_waw(COMPUTE);
        if is_exec_dirty(&mut self.list, &accesses, ignore_waw) {
            self.list.flush_barriers(CmdBuffer::Exec);
        }
        record_exec_accesses(&mut self.list, &accesses);

        if let Err(_e) = self.descriptors.commit(&mut self.list, COMPUTE) {
            #[cfg(feature = "logging")]
            log::error!("Failed to commit compute descriptors: {}", _e);
            return false;
        }
        if self.flags.take(ContextFlags::CP_DIRTY_PUSH_CONSTANTS) {
            self.commit_push_constants(COMPUTE);
        }
        true
    }

    ///Leaves rendering so that non-render-pass work can be recorded, and orders it after the rendering work.
    pub(crate) fn end_render_pass_scope(&mut self) {
        if self.flags.contains(ContextFlags::RENDER_PASS_BOUND) {
            self.spill_render_pass(true);
            self.list.flush_barriers(CmdBuffer::Exec);
        }
    }

    fn update_framebuffer(&mut self) {
        self.flags.remove(ContextFlags::GP_DIRTY_FRAMEBUFFER);
        let stale = self.active_targets.as_ref().is_some_and(|active| !active.matches(&self.targets));
        if stale {
            self.spill_render_pass(false);
        }

        let formats = self.targets.formats();
        if formats != self.gp_state.targets {
            self.gp_state.targets = formats;
            self.flags |= ContextFlags::GP_DIRTY_PIPELINE_STATE;
        }
    }

    fn update_graphics_pipeline(&mut self) -> bool {
        let key = self.gp_state.key(&self.device.features);
        let Some(pipeline) = self.pipelines.graphics_pipeline(&self.gp_shaders, &key) else {
            #[cfg(feature = "logging")]
            log::warn!("No graphics pipeline available, skipping draw");
            return false;
        };
        self.flags
            .remove(ContextFlags::GP_DIRTY_PIPELINE | ContextFlags::GP_DIRTY_PIPELINE_STATE);

        let cb = self.exec_cmd();
        self.device.inner.cmd_bind_pipeline(cb, GRAPHICS, pipeline.handle);
        self.descriptors.set_bindings(GRAPHICS, &pipeline.bindings);
        self.list.track(&pipeline, Access::empty());
        self.flags
            .set(ContextFlags::GP_HAS_SIDE_EFFECTS, pipeline.has_side_effects());
        self.flags |= ContextFlags::GP_DIRTY_PUSH_CONSTANTS;
        self.gp_pipeline = Some(pipeline);
        true
    }

    ///Executes deferred clears of images that the pipelines of `bind_point` read from.
    fn flush_bound_clears(&mut self, bind_point: vk::PipelineBindPoint) {
        if self.clears.is_empty() {
            return;
        }
        let Some(bindings) = self.descriptors.bindings(bind_point).cloned() else {
            return;
        };

        let mut pending: SmallVec<[DeferredClear; 4]> = SmallVec::new();
        for binding in bindings.bindings() {
            if let Some(view) = slot_view(self.descriptors.slot(binding.slot)) {
                pending.extend(self.clears.take_image(&view.image));
            }
        }
        for clear in pending {
            self.execute_clear(clear);
        }
    }

    ///Every resource access of the next draw or dispatch on `bind_point`, plus `extra`.
    fn gather_accesses(&self, bind_point: vk::PipelineBindPoint, extra: &[BarrierAccess]) -> Accesses {
        let mut accesses: Accesses = extra.iter().cloned().collect();

        if let Some(bindings) = self.descriptors.bindings(bind_point) {
            for binding in bindings.bindings() {
                let stages = binding.pipeline_stages();
                let access = binding.access_flags();
                match self.descriptors.slot(binding.slot) {
                    ResourceSlot::Buffer(slice) => accesses.push(BarrierAccess::buffer(slice, stages, access)),
                    ResourceSlot::TexelBuffer(view) => {
                        accesses.push(BarrierAccess::buffer(&view.slice(), stages, access))
                    }
                    ResourceSlot::Image { view, layout } | ResourceSlot::CombinedImageSampler { view, layout, .. } => {
                        accesses.push(BarrierAccess::image(view, *layout, stages, access))
                    }
                    ResourceSlot::Sampler(_) | ResourceSlot::Empty => {}
                }
            }
        }

        if bind_point == GRAPHICS {
            for binding in self.vertex_buffers.iter().flatten() {
                accesses.push(BarrierAccess::buffer(
                    &binding.slice,
                    vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                    vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                ));
            }
            if let Some(binding) = &self.index_buffer {
                accesses.push(BarrierAccess::buffer(
                    &binding.slice,
                    vk::PipelineStageFlags2::INDEX_INPUT,
                    vk::AccessFlags2::INDEX_READ,
                ));
            }
            if self.uses_transform_feedback() {
                for binding in self.xfb_buffers.iter().flatten() {
                    accesses.push(BarrierAccess::buffer(
                        &binding.slice,
                        vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT,
                        vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT,
                    ));
                    if let Some(counter) = &binding.counter {
                        accesses.push(BarrierAccess::buffer(counter, XFB_COUNTER_STAGES, XFB_COUNTER_ACCESS));
                    }
                }
            }
        }
        accesses
    }

    fn commit_index_buffer(&mut self) {
        let Some(binding) = &self.index_buffer else {
            return;
        };
        let handle = binding.slice.handle();
        let size = if self.device.features.maintenance5 {
            handle.length
        } else {
            vk::WHOLE_SIZE
        };
        let cb = self.list.cmd_buffer(CmdBuffer::Exec);
        self.device
            .inner
            .cmd_bind_index_buffer(cb, handle.handle, handle.offset, size, binding.ty);
        self.list.track(&binding.slice.buffer, Access::READ);
        self.list.track(&binding.slice.buffer.storage(), Access::READ);
    }

    ///Binds the vertex buffers used by the current input layout, in runs of consecutive bindings.
    fn commit_vertex_buffers(&mut self) {
        let used: u64 = if self.gp_state.bindings.is_empty() {
            !0
        } else {
            self.gp_state
                .bindings
                .iter()
                .fold(0, |mask, b| mask | (1u64 << b.binding.min(63)))
        };

        let cb = self.list.cmd_buffer(CmdBuffer::Exec);
        let mut first = 0u32;
        let mut buffers: SmallVec<[vk::Buffer; 8]> = SmallVec::new();
        let mut offsets: SmallVec<[vk::DeviceSize; 8]> = SmallVec::new();
        let mut sizes: SmallVec<[vk::DeviceSize; 8]> = SmallVec::new();
        let mut strides: SmallVec<[vk::DeviceSize; 8]> = SmallVec::new();

        for (index, binding) in self.vertex_buffers.iter().enumerate() {
            let binding = binding.as_ref().filter(|_| used & (1 << index) != 0);
            match binding {
                Some(binding) => {
                    if buffers.is_empty() {
                        first = index as u32;
                    }
                    let handle = binding.slice.handle();
                    buffers.push(handle.handle);
                    offsets.push(handle.offset);
                    sizes.push(handle.length);
                    strides.push(binding.stride as vk::DeviceSize);
                    self.list.track(&binding.slice.buffer, Access::READ);
                    self.list.track(&binding.slice.buffer.storage(), Access::READ);
                }
                None if !buffers.is_empty() => {
                    self.device
                        .inner
                        .cmd_bind_vertex_buffers(cb, first, &buffers, &offsets, &sizes, &strides);
                    buffers.clear();
                    offsets.clear();
                    sizes.clear();
                    strides.clear();
                }
                None => {}
            }
        }
        if !buffers.is_empty() {
            self.device
                .inner
                .cmd_bind_vertex_buffers(cb, first, &buffers, &offsets, &sizes, &strides);
        }
    }

    fn uses_transform_feedback(&self) -> bool {
        self.device.features.transform_feedback
            && self
                .gp_pipeline
                .as_ref()
                .is_some_and(|p| p.flags.contains(PipelineFlags::HAS_TRANSFORM_FEEDBACK))
    }

    ///Starts transform feedback if the pipeline captures, resuming from the counters if they are valid.
    fn commit_transform_feedback(&mut self) {
        if !self.uses_transform_feedback() {
            if self.flags.contains(ContextFlags::XFB_ACTIVE) {
                self.pause_transform_feedback();
            }
            return;
        }

        if self.flags.take(ContextFlags::GP_DIRTY_XFB_BUFFERS) && self.flags.contains(ContextFlags::XFB_ACTIVE) {
            self.pause_transform_feedback();
        }
        if self.flags.contains(ContextFlags::XFB_ACTIVE) {
            return;
        }

        let cb = self.list.cmd_buffer(CmdBuffer::Exec);
        let mut counters: SmallVec<[vk::Buffer; 4]> = SmallVec::new();
        let mut counter_offsets: SmallVec<[vk::DeviceSize; 4]> = SmallVec::new();
        for (index, binding) in self.xfb_buffers.iter().enumerate() {
            let (counter, offset) = match binding {
                Some(binding) => {
                    let handle = binding.slice.handle();
                    self.device.inner.cmd_bind_transform_feedback_buffers(
                        cb,
                        index as u32,
                        &[handle.handle],
                        &[handle.offset],
                        &[handle.length],
                    );
                    self.list.track(&binding.slice.buffer, Access::WRITE);
                    self.list.track(&binding.slice.buffer.storage(), Access::WRITE);

                    match &binding.counter {
                        Some(counter) => {
                            self.list.track(&counter.buffer, Access::WRITE);
                            self.list.track(&counter.buffer.storage(), Access::WRITE);
                            let handle = counter.handle();
                            (handle.handle, handle.offset)
                        }
                        None => (vk::Buffer::null(), 0),
                    }
                }
                None => (vk::Buffer::null(), 0),
            };
            counters.push(counter);
            counter_offsets.push(offset);
        }

        //null counters make capture start at offset zero
        if !self.flags.contains(ContextFlags::XFB_COUNTERS_VALID) {
            counters.iter_mut().for_each(|c| *c = vk::Buffer::null());
        }
        self.device
            .inner
            .cmd_begin_transform_feedback(cb, &counters, &counter_offsets);
        self.flags |= ContextFlags::XFB_ACTIVE;

        if let Err(_e) = self.queries.begin_queries(&mut self.list, QueryKind::TransformFeedback) {
            #[cfg(feature = "logging")]
            log::error!("Failed to begin transform feedback queries: {}", _e);
        }
    }

    ///Ends transform feedback and stores the byte offsets in the counter buffers.
    pub(crate) fn pause_transform_feedback(&mut self) {
        if !self.flags.take(ContextFlags::XFB_ACTIVE) {
            return;
        }
        self.queries.end_queries(&mut self.list, QueryKind::TransformFeedback);

        let mut counters: SmallVec<[vk::Buffer; 4]> = SmallVec::new();
        let mut offsets: SmallVec<[vk::DeviceSize; 4]> = SmallVec::new();
        for binding in self.xfb_buffers.iter() {
            let counter = binding.as_ref().and_then(|b| b.counter.as_ref());
            match counter {
                Some(counter) => {
                    let handle = counter.handle();
                    counters.push(handle.handle);
                    offsets.push(handle.offset);
                    self.list.barriers(CmdBuffer::Exec).access_buffer(
                        &handle,
                        vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT,
                        vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT,
                        counter.buffer.desc.stages | XFB_COUNTER_STAGES,
                        counter.buffer.desc.access | XFB_COUNTER_ACCESS,
                    );
                }
                None => {
                    counters.push(vk::Buffer::null());
                    offsets.push(0);
                }
            }
        }

        let cb = self.list.cmd_buffer(CmdBuffer::Exec);
        self.device.inner.cmd_end_transform_feedback(cb, &counters, &offsets);
        self.flags |= ContextFlags::XFB_COUNTERS_VALID;
    }

    fn commit_dynamic_state(&mut self) {
        let features = self.device.features;
        let cb = self.list.cmd_buffer(CmdBuffer::Exec);
        let raw = &self.device.inner;
        let dynamic = &self.dynamic;

        if self.flags.take(ContextFlags::GP_DIRTY_VIEWPORTS) && !dynamic.viewports.is_empty() {
            raw.cmd_set_viewports(cb, &dynamic.viewports);
            raw.cmd_set_scissors(cb, &dynamic.scissors);
        }
        if self.flags.take(ContextFlags::GP_DIRTY_DEPTH_BIAS) {
            let bias = dynamic.depth_bias;
            raw.cmd_set_depth_bias(cb, bias.constant, bias.clamp, bias.slope);
        }
        if self.flags.take(ContextFlags::GP_DIRTY_BLEND_CONSTANTS) {
            raw.cmd_set_blend_constants(cb, dynamic.blend_constants);
        }
        if self.flags.take(ContextFlags::GP_DIRTY_STENCIL_REF) {
            raw.cmd_set_stencil_reference(cb, dynamic.stencil_reference);
        }
        if self.flags.take(ContextFlags::GP_DIRTY_DEPTH_BOUNDS) && features.depth_bounds {
            raw.cmd_set_depth_bounds(cb, dynamic.depth_bounds.min, dynamic.depth_bounds.max);
        }

        if self.flags.take(ContextFlags::GP_DIRTY_RASTERIZER) && features.extended_dynamic_state {
            let rs = &self.gp_state.rasterizer;
            raw.cmd_set_cull_mode(cb, rs.cull_mode);
            raw.cmd_set_front_face(cb, rs.front_face);
        }
        if self.flags.take(ContextFlags::GP_DIRTY_DEPTH_STENCIL) && features.extended_dynamic_state {
            let ds = &self.gp_state.depth_stencil;
            raw.cmd_set_depth_test(cb, ds.depth_test, ds.depth_write, ds.depth_compare);
            if features.depth_bounds {
                raw.cmd_set_depth_bounds_test(cb, ds.depth_bounds_test);
            }
            raw.cmd_set_stencil_test(cb, ds.stencil_test);
            raw.cmd_set_stencil_op(cb, vk::StencilFaceFlags::FRONT, ds.front.to_vk(dynamic.stencil_reference));
            raw.cmd_set_stencil_op(cb, vk::StencilFaceFlags::BACK, ds.back.to_vk(dynamic.stencil_reference));
        }
        if self.flags.take(ContextFlags::GP_DIRTY_SAMPLE_MASK) && features.dynamic_sample_mask {
            let ms = &self.gp_state.multisample;
            raw.cmd_set_sample_mask(cb, ms.sample_count, ms.sample_mask);
        }
    }

    fn commit_push_constants(&mut self, bind_point: vk::PipelineBindPoint) {
        let pipeline = if bind_point == COMPUTE {
            &self.cp_pipeline
        } else {
            &self.gp_pipeline
        };
        let Some(pipeline) = pipeline else {
            return;
        };
        let Some(range) = pipeline.bindings.push_constants() else {
            return;
        };
        let start = range.offset as usize;
        let Some(data) = self.push_constants.get(start..start + range.size as usize) else {
            return;
        };

        let cb = self.list.cmd_buffer(CmdBuffer::Exec);
        self.device.inner.cmd_push_constants(
            cb,
            pipeline.bindings.layout.inner,
            range.stage_flags,
            range.offset,
            data,
        );
    }
}
