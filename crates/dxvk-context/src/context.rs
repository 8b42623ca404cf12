use std::sync::Arc;

use dxvk::{
    BarrierControl,
    ash::vk,
    device::Device,
    resources::BufferSlice,
    sync::{Semaphore, Signal},
};
use dxvk_commands::{Access, CmdBuffer, CommandList, SubmissionQueue, SubmitStatus};
use dxvk_descriptor::{DescriptorState, ResourceSlot};

use crate::{
    ContextError,
    clear::DeferredClears,
    commit::BarrierAccess,
    framebuffer::RenderTargets,
    pipeline::{
        BlendAttachment, DepthStencilState, GraphicsPipelineState, GraphicsShaders, InputAssemblyState,
        MultisampleState, Pipeline, PipelineManager, RasterizerState, Shader, SpecConstants, VertexAttribute,
        VertexBinding,
    },
    query::{Query, QueryKind, QueryManager},
    state::{
        ContextFlags, DepthBias, DepthBounds, DynamicState, IndexBufferBinding, MAX_PUSH_CONSTANT_SIZE,
        MAX_VERTEX_BINDINGS, MAX_XFB_BUFFERS, VertexBufferBinding, XfbBufferBinding,
    },
};

///Records commands into one command list at a time.
///
/// The context shadows all bound state and only records what changed since the last draw or dispatch. Barriers,
/// layout transitions, render pass scopes and resource lifetimes are handled internally. A context is owned by a single
/// thread, finished command lists are handed to the [SubmissionQueue] on [flush](Self::flush).
///
/// Operations that can not be executed, for instance because no pipeline is available or the arguments are out of
/// range, are logged and skipped.
pub struct Context {
    pub(crate) device: Arc<Device>,
    pub(crate) queue: Arc<SubmissionQueue>,
    pub(crate) pipelines: Arc<dyn PipelineManager>,
    pub(crate) list: CommandList,
    pub(crate) barrier_control: BarrierControl,
    pub(crate) flags: ContextFlags,

    pub(crate) descriptors: DescriptorState,
    pub(crate) queries: QueryManager,
    pub(crate) clears: DeferredClears,

    pub(crate) gp_shaders: GraphicsShaders,
    pub(crate) gp_state: GraphicsPipelineState,
    pub(crate) gp_pipeline: Option<Arc<Pipeline>>,
    pub(crate) targets: RenderTargets,
    ///Targets of the render pass that is bound or suspended.
    pub(crate) active_targets: Option<RenderTargets>,
    pub(crate) vertex_buffers: [Option<VertexBufferBinding>; MAX_VERTEX_BINDINGS],
    pub(crate) index_buffer: Option<IndexBufferBinding>,
    pub(crate) xfb_buffers: [Option<XfbBufferBinding>; MAX_XFB_BUFFERS],
    pub(crate) dynamic: DynamicState,
    pub(crate) push_constants: [u8; MAX_PUSH_CONSTANT_SIZE],

    pub(crate) cs_shader: Option<Arc<Shader>>,
    pub(crate) cs_spec: SpecConstants,
    pub(crate) cp_pipeline: Option<Arc<Pipeline>>,
}

impl Context {
    pub fn new(
        device: &Arc<Device>,
        queue: Arc<SubmissionQueue>,
        pipelines: Arc<dyn PipelineManager>,
    ) -> Result<Self, ContextError> {
        let list = queue.get_command_list()?;
        let mut descriptors = DescriptorState::new(device)?;
        descriptors.begin_list();

        let mut context = Context {
            device: device.clone(),
            queue,
            pipelines,
            list,
            barrier_control: device.options.barrier_control,
            flags: ContextFlags::GP_DIRTY_ALL | ContextFlags::CP_DIRTY_ALL,
            descriptors,
            queries: QueryManager::new(device),
            clears: DeferredClears::default(),
            gp_shaders: GraphicsShaders::default(),
            gp_state: GraphicsPipelineState::default(),
            gp_pipeline: None,
            targets: RenderTargets::default(),
            active_targets: None,
            vertex_buffers: std::array::from_fn(|_| None),
            index_buffer: None,
            xfb_buffers: std::array::from_fn(|_| None),
            dynamic: DynamicState::default(),
            push_constants: [0; MAX_PUSH_CONSTANT_SIZE],
            cs_shader: None,
            cs_spec: SpecConstants::default(),
            cp_pipeline: None,
        };
        context.apply_barrier_control();
        Ok(context)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        &self.queue
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn descriptors(&self) -> &DescriptorState {
        &self.descriptors
    }

    ///Render targets that are used by the next draw.
    pub fn render_targets(&self) -> &RenderTargets {
        &self.targets
    }

    ///The command list currently recorded into.
    pub fn cmd_list(&mut self) -> &mut CommandList {
        &mut self.list
    }

    pub(crate) fn exec_cmd(&mut self) -> vk::CommandBuffer {
        self.list.cmd_buffer(CmdBuffer::Exec)
    }

    ///Ends all pending work and submits the current command list. Recording continues on a fresh list and all state is
    /// recorded again before the next draw or dispatch.
    pub fn flush(&mut self) -> Result<Arc<SubmitStatus>, ContextError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.spill_render_pass(false);
        self.flush_clears();
        self.descriptors.sync();

        let next = self.queue.get_command_list()?;
        let finished = std::mem::replace(&mut self.list, next);
        self.apply_barrier_control();
        self.descriptors.begin_list();
        self.flags |= ContextFlags::GP_DIRTY_ALL | ContextFlags::CP_DIRTY_ALL;
        self.flags.remove(ContextFlags::XFB_COUNTERS_VALID);

        #[cfg(feature = "logging")]
        log::trace!("Flushing command list");

        Ok(self.queue.submit(finished)?)
    }

    ///Flushes and blocks until the GPU finished the submitted list, and the list was recycled.
    pub fn flush_and_wait(&mut self) -> Result<(), ContextError> {
        let status = self.flush()?;
        let result = status.wait();
        if result != vk::Result::SUCCESS {
            return Err(ContextError::VkError(result));
        }
        self.queue.wait_for(status.ticket())?;
        Ok(())
    }

    ///Sets `signal` to `value` once the current command list completed.
    pub fn signal(&mut self, signal: Arc<dyn Signal>, value: u64) {
        self.list.track_signal(signal, value);
    }

    ///Waits for `semaphore` to reach `value` before the current command list executes.
    pub fn wait_semaphore(&mut self, semaphore: &Arc<Semaphore>, value: u64) {
        self.list.wait_semaphore(semaphore, value);
    }

    ///Signals `semaphore` with `value` once the current command list executed.
    pub fn signal_semaphore(&mut self, semaphore: &Arc<Semaphore>, value: u64) {
        self.list.signal_semaphore(semaphore, value);
    }

    ///Changes the barrier policy for everything recorded from now on.
    pub fn set_barrier_control(&mut self, control: BarrierControl) {
        self.barrier_control = control;
        self.apply_barrier_control();
    }

    fn apply_barrier_control(&mut self) {
        for which in [CmdBuffer::Init, CmdBuffer::Exec, CmdBuffer::Transfer] {
            self.list.barriers(which).set_control(self.barrier_control);
        }
    }

    ///Binds the render targets used by subsequent draws. The render pass only changes once something is drawn.
    pub fn bind_render_targets(&mut self, targets: RenderTargets) {
        if !targets.matches(&self.targets) {
            self.targets = targets;
            self.flags |= ContextFlags::GP_DIRTY_FRAMEBUFFER;
        }
    }

    ///Binds `shader` to `stage`. `None` unbinds the stage.
    pub fn bind_shader(&mut self, stage: vk::ShaderStageFlags, shader: Option<Arc<Shader>>) {
        if stage == vk::ShaderStageFlags::COMPUTE {
            self.cs_shader = shader;
            self.flags |= ContextFlags::CP_DIRTY_PIPELINE;
            return;
        }

        match self.gp_shaders.stage_mut(stage) {
            Some(slot) => {
                *slot = shader;
                self.flags |= ContextFlags::GP_DIRTY_PIPELINE;
            }
            None => {
                #[cfg(feature = "logging")]
                log::warn!("Can not bind shader to stage {:?}", stage);
            }
        }
    }

    ///Binds `resource` to `slot`. Binding a view of an image that is currently rendered to ends the render pass.
    pub fn bind_resource(&mut self, slot: u32, resource: ResourceSlot) {
        let view = match &resource {
            ResourceSlot::Image { view, .. } | ResourceSlot::CombinedImageSampler { view, .. } => Some(view),
            _ => None,
        };
        if let (Some(view), Some(active)) = (view, &self.active_targets) {
            if active.overlaps_view(view) {
                self.spill_render_pass(false);
            }
        }
        self.descriptors.bind(slot, resource);
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, slice: Option<BufferSlice>, stride: u32) {
        let Some(entry) = self.vertex_buffers.get_mut(binding as usize) else {
            #[cfg(feature = "logging")]
            log::warn!("Vertex binding {} out of range", binding);
            return;
        };
        *entry = slice.map(|slice| VertexBufferBinding { slice, stride });
        self.flags |= ContextFlags::GP_DIRTY_VERTEX_BUFFERS;
    }

    pub fn bind_index_buffer(&mut self, slice: Option<BufferSlice>, ty: vk::IndexType) {
        self.index_buffer = slice.map(|slice| IndexBufferBinding { slice, ty });
        self.flags |= ContextFlags::GP_DIRTY_INDEX_BUFFER;
    }

    ///Binds a transform feedback buffer. Binding anything invalidates the counters of all buffers.
    pub fn bind_xfb_buffer(&mut self, index: u32, slice: Option<BufferSlice>, counter: Option<BufferSlice>) {
        let Some(entry) = self.xfb_buffers.get_mut(index as usize) else {
            #[cfg(feature = "logging")]
            log::warn!("Transform feedback buffer {} out of range", index);
            return;
        };
        *entry = slice.map(|slice| XfbBufferBinding { slice, counter });
        self.flags |= ContextFlags::GP_DIRTY_XFB_BUFFERS;
        self.flags.remove(ContextFlags::XFB_COUNTERS_VALID);
    }

    pub fn set_viewports(&mut self, viewports: &[vk::Viewport], scissors: &[vk::Rect2D]) {
        self.dynamic.viewports = viewports.iter().copied().collect();
        self.dynamic.scissors = scissors.iter().copied().collect();
        self.flags |= ContextFlags::GP_DIRTY_VIEWPORTS;
    }

    pub fn set_depth_bias(&mut self, bias: DepthBias) {
        self.dynamic.depth_bias = bias;
        self.flags |= ContextFlags::GP_DIRTY_DEPTH_BIAS;
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.dynamic.blend_constants = constants;
        self.flags |= ContextFlags::GP_DIRTY_BLEND_CONSTANTS;
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.dynamic.stencil_reference = reference;
        self.flags |= ContextFlags::GP_DIRTY_STENCIL_REF;
    }

    pub fn set_depth_bounds(&mut self, bounds: DepthBounds) {
        self.dynamic.depth_bounds = bounds;
        self.flags |= ContextFlags::GP_DIRTY_DEPTH_BOUNDS;
    }

    pub fn set_input_assembly(&mut self, state: InputAssemblyState) {
        self.update_graphics_state(ContextFlags::empty(), |s| s.input_assembly = state);
    }

    pub fn set_input_layout(&mut self, attributes: &[VertexAttribute], bindings: &[VertexBinding]) {
        self.update_graphics_state(ContextFlags::GP_DIRTY_VERTEX_BUFFERS, |s| {
            s.attributes = attributes.iter().copied().collect();
            s.bindings = bindings.iter().copied().collect();
        });
    }

    pub fn set_rasterizer(&mut self, state: RasterizerState) {
        self.update_graphics_state(ContextFlags::GP_DIRTY_RASTERIZER | ContextFlags::GP_DIRTY_DEPTH_BIAS, |s| {
            s.rasterizer = state
        });
    }

    pub fn set_depth_stencil(&mut self, state: DepthStencilState) {
        self.update_graphics_state(
            ContextFlags::GP_DIRTY_DEPTH_STENCIL | ContextFlags::GP_DIRTY_DEPTH_BOUNDS,
            |s| s.depth_stencil = state,
        );
    }

    pub fn set_multisample(&mut self, state: MultisampleState) {
        self.update_graphics_state(ContextFlags::GP_DIRTY_SAMPLE_MASK, |s| s.multisample = state);
    }

    pub fn set_blend(&mut self, index: usize, state: BlendAttachment) {
        if index >= self.gp_state.blend.len() {
            #[cfg(feature = "logging")]
            log::warn!("Blend state {} out of range", index);
            return;
        }
        self.update_graphics_state(ContextFlags::empty(), |s| s.blend[index] = state);
    }

    ///Applies `update` to the graphics pipeline state. Only changes to state that is part of the pipeline key cause a new
    /// pipeline lookup, `dynamic` is flagged either way.
    fn update_graphics_state(&mut self, dynamic: ContextFlags, update: impl FnOnce(&mut GraphicsPipelineState)) {
        let features = &self.device.features;
        let before = self.gp_state.key(features);
        update(&mut self.gp_state);
        if self.gp_state.key(features) != before {
            self.flags |= ContextFlags::GP_DIRTY_PIPELINE_STATE;
        }
        self.flags |= dynamic;
    }

    ///Sets specialization constant `id` of the pipelines of `bind_point`.
    pub fn set_spec_constant(&mut self, bind_point: vk::PipelineBindPoint, id: u32, value: u32) {
        if bind_point == vk::PipelineBindPoint::COMPUTE {
            if self.cs_spec.set(id, value) {
                self.flags |= ContextFlags::CP_DIRTY_PIPELINE;
            }
        } else if self.gp_state.spec_constants.set(id, value) {
            self.flags |= ContextFlags::GP_DIRTY_PIPELINE_STATE;
        }
    }

    ///Writes push constant data shared by graphics and compute pipelines.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        let Some(dst) = self.push_constants.get_mut(start..start + data.len()) else {
            #[cfg(feature = "logging")]
            log::warn!("Push constant range {}..{} out of range", start, start + data.len());
            return;
        };
        dst.copy_from_slice(data);
        self.flags |= ContextFlags::GP_DIRTY_PUSH_CONSTANTS | ContextFlags::CP_DIRTY_PUSH_CONSTANTS;
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if self.commit_graphics_state(false, &[]) {
            let cb = self.exec_cmd();
            self.device
                .inner
                .cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if self.commit_graphics_state(true, &[]) {
            let cb = self.exec_cmd();
            self.device.inner.cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn draw_indirect(&mut self, args: &BufferSlice, count: u32, stride: u32) {
        self.draw_indirect_impl(false, args, count, stride);
    }

    pub fn draw_indexed_indirect(&mut self, args: &BufferSlice, count: u32, stride: u32) {
        self.draw_indirect_impl(true, args, count, stride);
    }

    fn draw_indirect_impl(&mut self, indexed: bool, args: &BufferSlice, count: u32, stride: u32) {
        let accesses = [BarrierAccess::indirect(args)];
        if self.commit_graphics_state(indexed, &accesses) {
            self.track_slice(args, Access::READ);
            let handle = args.handle();
            let cb = self.exec_cmd();
            self.device
                .inner
                .cmd_draw_indirect(cb, indexed, handle.handle, handle.offset, count, stride);
        }
    }

    ///Indirect draw with the draw count read from `count_buffer`.
    pub fn draw_indirect_count(
        &mut self,
        indexed: bool,
        args: &BufferSlice,
        count_buffer: &BufferSlice,
        max_count: u32,
        stride: u32,
    ) {
        let accesses = [BarrierAccess::indirect(args), BarrierAccess::indirect(count_buffer)];
        if self.commit_graphics_state(indexed, &accesses) {
            self.track_slice(args, Access::READ);
            self.track_slice(count_buffer, Access::READ);
            let handle = args.handle();
            let count = count_buffer.handle();
            let cb = self.exec_cmd();
            self.device.inner.cmd_draw_indirect_count(
                cb,
                indexed,
                handle.handle,
                handle.offset,
                count.handle,
                count.offset,
                max_count,
                stride,
            );
        }
    }

    ///Draws the vertices captured by transform feedback, with the byte count read from `counter`.
    pub fn draw_indirect_xfb(
        &mut self,
        counter: &BufferSlice,
        vertex_stride: u32,
        instance_count: u32,
        first_instance: u32,
    ) {
        if !self.device.features.transform_feedback {
            #[cfg(feature = "logging")]
            log::warn!("Transform feedback draws are not supported");
            return;
        }

        let accesses = [BarrierAccess::buffer(
            counter,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_READ_EXT,
        )];
        if self.commit_graphics_state(false, &accesses) {
            self.track_slice(counter, Access::READ);
            let handle = counter.handle();
            let cb = self.exec_cmd();
            self.device.inner.cmd_draw_indirect_byte_count(
                cb,
                instance_count,
                first_instance,
                handle.handle,
                handle.offset,
                vertex_stride,
            );
        }
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if !self.commit_compute_state(&[]) {
            return;
        }
        self.begin_compute_queries();
        let cb = self.exec_cmd();
        self.device.inner.cmd_dispatch(cb, x, y, z);
        self.queries.end_queries(&mut self.list, QueryKind::PipelineStatistics);
    }

    pub fn dispatch_indirect(&mut self, args: &BufferSlice) {
        let accesses = [BarrierAccess::indirect(args)];
        if !self.commit_compute_state(&accesses) {
            return;
        }
        self.track_slice(args, Access::READ);
        self.begin_compute_queries();
        let handle = args.handle();
        let cb = self.exec_cmd();
        self.device.inner.cmd_dispatch_indirect(cb, handle.handle, handle.offset);
        self.queries.end_queries(&mut self.list, QueryKind::PipelineStatistics);
    }

    fn begin_compute_queries(&mut self) {
        if let Err(_e) = self.queries.begin_queries(&mut self.list, QueryKind::PipelineStatistics) {
            #[cfg(feature = "logging")]
            log::error!("Failed to begin pipeline statistics queries: {}", _e);
        }
    }

    ///Starts accumulating `query`. Occlusion and pipeline statistics queries count render pass work (statistics also
    /// count dispatches), transform feedback queries count while capture is active.
    pub fn begin_query(&mut self, query: &Arc<Query>) {
        if let Err(_e) = self.queries.enable(&mut self.list, query) {
            #[cfg(feature = "logging")]
            log::error!("Failed to begin query: {}", _e);
        }
    }

    ///Stops accumulating `query`. The result becomes available once the current command list completed.
    pub fn end_query(&mut self, query: &Arc<Query>) {
        if let Err(_e) = self.queries.disable(&mut self.list, query) {
            #[cfg(feature = "logging")]
            log::error!("Failed to end query: {}", _e);
        }
    }

    pub fn write_timestamp(&mut self, query: &Arc<Query>) {
        if let Err(_e) = self.queries.write_timestamp(&mut self.list, query) {
            #[cfg(feature = "logging")]
            log::error!("Failed to write timestamp: {}", _e);
        }
    }

    ///Keeps the buffer and its current storage alive until the command list completed.
    pub(crate) fn track_slice(&mut self, slice: &BufferSlice, access: Access) {
        self.list.track(&slice.buffer, access);
        self.list.track(&slice.buffer.storage(), access);
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{ash::vk, resources::BufferSlice, testing::Command};
    use dxvk_descriptor::{BindingInfo, ResourceSlot};
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{
        framebuffer::Attachment,
        pipeline::ShaderFlags,
        query::{QueryData, QueryStatus, QueryType},
        testing::TestContext,
    };

    fn position(commands: &[Command], f: impl Fn(&Command) -> bool) -> usize {
        commands.iter().position(f).unwrap()
    }

    #[test]
    fn assure_send() {
        assert_impl_all!(Context: Send);
    }

    #[test]
    fn storage_read_after_copy_waits() {
        let mut t = TestContext::new();
        t.use_compute(&[BindingInfo::new(
            0,
            0,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
        )
        .read_only()]);
        let src = t.buffer(256);
        let dst = t.buffer(256);

        t.context.copy_buffer(&dst, 0, &src, 0, 256);
        t.context.bind_resource(0, ResourceSlot::Buffer(BufferSlice::whole(dst.clone())));
        t.context.dispatch(1, 1, 1);
        //read after read needs no barrier
        t.context.dispatch(2, 1, 1);
        t.context.flush_and_wait().unwrap();

        let commands = t.soft.submitted_commands();
        let copy = position(&commands, |c| matches!(c, Command::CopyBuffer { .. }));
        let first = position(&commands, |c| matches!(c, Command::Dispatch { x: 1, .. }));
        let second = position(&commands, |c| matches!(c, Command::Dispatch { x: 2, .. }));
        assert!(copy < first);
        assert!(commands[copy..first].iter().any(|c| matches!(c, Command::Barrier { .. })));
        assert!(!commands[first..second].iter().any(|c| matches!(c, Command::Barrier { .. })));
        assert!(t.soft.validation_errors().is_empty());
    }

    ///Dispatches twice on a read-write storage buffer. Returns true if a barrier separates the dispatches.
    fn storage_writes_need_barrier(control: BarrierControl) -> bool {
        let mut t = TestContext::new();
        t.context.set_barrier_control(control);
        t.use_compute(&[BindingInfo::new(
            0,
            0,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
        )]);
        let buffer = t.buffer(256);
        t.context.bind_resource(0, ResourceSlot::Buffer(BufferSlice::whole(buffer)));
        t.context.dispatch(1, 1, 1);
        t.context.dispatch(2, 1, 1);
        t.context.flush_and_wait().unwrap();
        assert!(t.soft.validation_errors().is_empty());

        let commands = t.soft.submitted_commands();
        let first = position(&commands, |c| matches!(c, Command::Dispatch { x: 1, .. }));
        let second = position(&commands, |c| matches!(c, Command::Dispatch { x: 2, .. }));
        commands[first..second].iter().any(|c| matches!(c, Command::Barrier { .. }))
    }

    #[test]
    fn write_after_write_elision_skips_compute_barrier() {
        assert!(storage_writes_need_barrier(BarrierControl::empty()));
        assert!(!storage_writes_need_barrier(BarrierControl::IGNORE_WRITE_AFTER_WRITE));
    }

    #[test]
    fn resources_live_until_list_completed() {
        let mut t = TestContext::new();
        let before = t.soft.live_buffers();

        let buffer = t.buffer(64);
        t.context.clear_buffer(&buffer, 0, 64, 7);
        drop(buffer);
        //still referenced by the command list
        assert_eq!(t.soft.live_buffers(), before + 1);

        t.context.flush_and_wait().unwrap();
        assert_eq!(t.soft.live_buffers(), before);
    }

    #[test]
    fn missing_pipeline_skips_dispatch() {
        let mut t = TestContext::new();
        t.context.bind_shader(
            vk::ShaderStageFlags::COMPUTE,
            Some(Shader::new(vk::ShaderStageFlags::COMPUTE, vec![], ShaderFlags::empty())),
        );
        t.context.dispatch(4, 1, 1);
        t.context.flush_and_wait().unwrap();
        assert!(
            !t.soft
                .submitted_commands()
                .iter()
                .any(|c| matches!(c, Command::Dispatch { .. }))
        );

        //the lookup is retried once a pipeline exists
        t.use_compute(&[]);
        t.context.dispatch(4, 1, 1);
        t.context.flush_and_wait().unwrap();
        assert!(
            t.soft
                .submitted_commands()
                .iter()
                .any(|c| matches!(c, Command::Dispatch { x: 4, .. }))
        );
    }

    #[test]
    fn occlusion_query_spans_render_pass_restarts() {
        let mut t = TestContext::new();
        t.soft.set_query_value(5);
        t.use_graphics(&[]);
        let view = t.color_target(16, 16);
        let mut targets = RenderTargets::default();
        targets.colors[0] = Some(Attachment::new(view));
        t.context.bind_render_targets(targets);
        let scratch = t.buffer(64);

        let query = Query::new(QueryType::Occlusion { precise: true });
        t.context.begin_query(&query);
        t.context.draw(3, 1, 0, 0);
        //leaves the render pass, which ends the running Vulkan query
        t.context.clear_buffer(&scratch, 0, 64, 0);
        t.context.draw(3, 1, 0, 0);
        t.context.end_query(&query);
        assert_eq!(query.handle_count(), 2);

        t.context.flush_and_wait().unwrap();
        assert_eq!(
            query.status(),
            QueryStatus::Available(QueryData::Occlusion { samples_passed: 10 })
        );
        assert!(t.soft.validation_errors().is_empty());
    }

    #[test]
    fn query_of_failed_submission_stays_pending() {
        let mut t = TestContext::new();
        t.soft.set_query_value(5);
        t.use_graphics(&[]);
        let view = t.color_target(16, 16);
        let mut targets = RenderTargets::default();
        targets.colors[0] = Some(Attachment::new(view));
        t.context.bind_render_targets(targets);

        let query = Query::new(QueryType::Occlusion { precise: false });
        t.context.begin_query(&query);
        t.context.draw(3, 1, 0, 0);
        t.context.end_query(&query);

        t.soft.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let status = t.context.flush().unwrap();
        assert_eq!(status.wait(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        t.context.queue().wait_for(status.ticket()).unwrap();
        assert_eq!(t.context.queue().pooled_lists(), 1);
        assert_eq!(query.status(), QueryStatus::Pending);
    }

    #[test]
    fn spec_constants_rebind_compute_pipeline() {
        let mut t = TestContext::new();
        t.use_compute(&[]);
        t.context.dispatch(1, 1, 1);
        t.context.dispatch(1, 1, 1);
        assert_eq!(t.pipelines.lookups.load(std::sync::atomic::Ordering::Relaxed), 1);

        t.context.set_spec_constant(vk::PipelineBindPoint::COMPUTE, 0, 3);
        t.context.dispatch(1, 1, 1);
        assert_eq!(t.pipelines.lookups.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
