//! # Software device
//!
//! [SoftDevice] implements [RawDevice] without a GPU. It is used by the test suites of all crates in this workspace.
//!
//! - Every command is recorded per command buffer and can be inspected via [SoftDevice::commands] and
//!   [SoftDevice::submissions].
//! - Buffers have host memory. Buffer copies, fills and updates are executed when the command buffer is submitted.
//! - Fences (and the semaphore signals of a submission) either complete right away, or, in
//!   [manual](SoftDevice::set_manual_completion) mode, once the test calls [complete_next](SoftDevice::complete_next).
//! - Queries become available together with their submission and report a configurable value.
//! - Invalid usage that a validation layer would report is collected in [validation_errors](SoftDevice::validation_errors).

use std::{collections::VecDeque, ptr::NonNull, sync::Arc, time::Duration};

use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use slotmap::{DefaultKey, Key, KeyData, SlotMap};

use crate::{
    Options,
    device::{
        BufferCreateInfo, ClearAttachment, ClearValue, DescriptorInfo, DescriptorWrite, Device, DeviceFeatures,
        DeviceLimits, DeviceQueues, FormatFeatures, ImageBarrier, MappedPtr, MemoryBarrier, Queue, RawBuffer,
        RawDevice, RawImage, RenderingInfo, SetLayoutBinding, SubmitBatch, TemplateEntry,
    },
    resources::{ImgDesc, ImgViewDesc, SamplerDesc},
    util::ranges_overlap,
};

///A recorded command.
#[derive(Clone, Debug)]
pub enum Command {
    Barrier {
        memory: Vec<MemoryBarrier>,
        images: Vec<ImageBarrier>,
    },
    BeginRendering(RenderingInfo),
    EndRendering,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    BindDescriptorBuffers(Vec<vk::DeviceAddress>),
    SetDescriptorBufferOffsets {
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        offsets: Vec<vk::DeviceSize>,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        ty: vk::IndexType,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<vk::DeviceSize>,
        strides: Vec<vk::DeviceSize>,
    },
    BindTransformFeedbackBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
    },
    BeginTransformFeedback(Vec<vk::Buffer>),
    EndTransformFeedback(Vec<vk::Buffer>),
    SetViewports(Vec<vk::Viewport>),
    SetScissors(Vec<vk::Rect2D>),
    ///Any other dynamic state command, by name.
    SetState(&'static str),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    DrawIndirect {
        indexed: bool,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        count: u32,
    },
    DrawIndirectCount {
        indexed: bool,
        buffer: vk::Buffer,
        count_buffer: vk::Buffer,
    },
    DrawIndirectByteCount {
        counter_buffer: vk::Buffer,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        filter: vk::Filter,
    },
    ResolveImage {
        src: vk::Image,
        dst: vk::Image,
    },
    FillBuffer {
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    },
    UpdateBuffer {
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        data: Vec<u8>,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
    },
    ClearAttachments(Vec<ClearAttachment>),
    ResetQueryPool {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    BeginQuery {
        pool: vk::QueryPool,
        query: u32,
        index: Option<u32>,
    },
    EndQuery {
        pool: vk::QueryPool,
        query: u32,
        index: Option<u32>,
    },
    WriteTimestamp {
        pool: vk::QueryPool,
        query: u32,
    },
}

impl Command {
    fn is_transfer(&self) -> bool {
        matches!(
            self,
            Command::CopyBuffer { .. }
                | Command::CopyImage { .. }
                | Command::CopyBufferToImage { .. }
                | Command::CopyImageToBuffer { .. }
                | Command::BlitImage { .. }
                | Command::ResolveImage { .. }
                | Command::FillBuffer { .. }
                | Command::UpdateBuffer { .. }
                | Command::ClearColorImage { .. }
                | Command::ClearDepthStencilImage { .. }
                | Command::ResetQueryPool { .. }
                | Command::Barrier { .. }
        )
    }

    fn needs_rendering(&self) -> bool {
        matches!(
            self,
            Command::Draw { .. }
                | Command::DrawIndexed { .. }
                | Command::DrawIndirect { .. }
                | Command::DrawIndirectCount { .. }
                | Command::DrawIndirectByteCount { .. }
                | Command::ClearAttachments(_)
        )
    }

    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            Command::Draw { .. }
                | Command::DrawIndexed { .. }
                | Command::DrawIndirect { .. }
                | Command::DrawIndirectCount { .. }
                | Command::DrawIndirectByteCount { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CbState {
    Initial,
    Recording,
    Executable,
}

struct SoftCommandBuffer {
    state: CbState,
    in_rendering: bool,
    commands: Vec<Command>,
}

struct SoftQueryPool {
    ty: vk::QueryType,
    values_per_query: usize,
    ///`None` if the query was never ended since the last reset, `Some(false)` if pending.
    written: Vec<Option<bool>>,
}

enum Object {
    Fence { signaled: bool },
    Semaphore { value: u64 },
    CommandPool { buffers: Vec<u64> },
    CommandBuffer(SoftCommandBuffer),
    Buffer { data: Vec<u8> },
    BufferView,
    Image,
    ImageView,
    Sampler,
    QueryPool(SoftQueryPool),
    SetLayout { bindings: Vec<SetLayoutBinding> },
    PipelineLayout,
    DescriptorPool { max_sets: u32, allocated: u32 },
    DescriptorSet,
    Template { entries: Vec<TemplateEntry> },
}

///What the software queue saw for one `queue_submit` call.
#[derive(Clone, Debug)]
pub struct Submission {
    pub queue: vk::Queue,
    pub batches: Vec<SubmitBatch>,
    ///Commands of every submitted command buffer, in submission order.
    pub commands: Vec<Command>,
    pub fence: vk::Fence,
}

struct Pending {
    fence: vk::Fence,
    signals: Vec<(vk::Semaphore, u64)>,
    queries: Vec<(vk::QueryPool, u32)>,
}

#[derive(Default)]
struct SoftState {
    objects: SlotMap<DefaultKey, Object>,
    submissions: Vec<Submission>,
    pending: VecDeque<Pending>,
    manual: bool,
    query_value: u64,
    fail_next_submit: Option<vk::Result>,
    device_lost: bool,
    validation_errors: Vec<String>,
    descriptor_writes: Vec<DescriptorWrite>,
    descriptor_write_calls: usize,
    template_updates: usize,
}

fn key(raw: u64) -> DefaultKey {
    KeyData::from_ffi(raw).into()
}

fn raw(key: DefaultKey) -> u64 {
    key.data().as_ffi()
}

impl SoftState {
    fn insert(&mut self, object: Object) -> u64 {
        raw(self.objects.insert(object))
    }

    fn remove(&mut self, handle: u64) {
        if handle != 0 {
            self.objects.remove(key(handle));
        }
    }

    fn get_mut(&mut self, handle: u64) -> Option<&mut Object> {
        self.objects.get_mut(key(handle))
    }

    fn record(&mut self, cb: vk::CommandBuffer, command: Command) {
        let mut errors = Vec::new();
        match self.objects.get_mut(key(cb.as_raw())) {
            Some(Object::CommandBuffer(buffer)) => {
                if buffer.state != CbState::Recording {
                    errors.push(format!("{:?} recorded on command buffer in state {:?}", command, buffer.state));
                }
                match &command {
                    Command::BeginRendering(_) if buffer.in_rendering => {
                        errors.push("Rendering begun twice".to_owned())
                    }
                    Command::BeginRendering(_) => buffer.in_rendering = true,
                    Command::EndRendering if !buffer.in_rendering => {
                        errors.push("Rendering ended without being begun".to_owned())
                    }
                    Command::EndRendering => buffer.in_rendering = false,
                    c if c.needs_rendering() && !buffer.in_rendering => {
                        errors.push(format!("{:?} outside of rendering", c))
                    }
                    c if c.is_transfer() && buffer.in_rendering => {
                        errors.push(format!("{:?} inside of rendering", c))
                    }
                    _ => {}
                }
                buffer.commands.push(command);
            }
            _ => errors.push(format!("{:?} recorded on unknown command buffer", command)),
        }
        self.validation_errors.extend(errors);
    }

    fn buffer_data(&mut self, buffer: vk::Buffer) -> Option<&mut Vec<u8>> {
        match self.get_mut(buffer.as_raw()) {
            Some(Object::Buffer { data }) => Some(data),
            _ => None,
        }
    }

    ///Executes the transfer commands that touch host memory. Returns queries that were written.
    fn execute(&mut self, commands: &[Command]) -> Vec<(vk::QueryPool, u32)> {
        let mut queries = Vec::new();
        for command in commands {
            match command {
                Command::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        if src == dst && ranges_overlap(region.src_offset, region.size, region.dst_offset, region.size) {
                            self.validation_errors
                                .push(format!("Overlapping copy regions {:?} on {:?}", region, src));
                        }
                        let start = region.src_offset as usize;
                        let end = (region.src_offset + region.size) as usize;
                        let dst_start = region.dst_offset as usize;
                        let copied = match self.buffer_data(*src).and_then(|d| d.get(start..end).map(<[u8]>::to_vec)) {
                            Some(bytes) => self
                                .buffer_data(*dst)
                                .and_then(|d| d.get_mut(dst_start..dst_start + bytes.len()))
                                .map(|target| target.copy_from_slice(&bytes))
                                .is_some(),
                            None => false,
                        };
                        if !copied {
                            self.validation_errors.push(format!("Copy out of bounds: {:?}", region));
                        }
                    }
                }
                Command::FillBuffer { dst, offset, size, data } => {
                    let Some(dst_data) = self.buffer_data(*dst) else {
                        continue;
                    };
                    let start = *offset as usize;
                    let end = if *size == vk::WHOLE_SIZE {
                        dst_data.len()
                    } else {
                        (offset + size) as usize
                    };
                    let bytes = data.to_le_bytes();
                    if let Some(target) = dst_data.get_mut(start..end) {
                        for (i, b) in target.iter_mut().enumerate() {
                            *b = bytes[i % 4];
                        }
                    }
                }
                Command::UpdateBuffer { dst, offset, data } => {
                    let Some(dst_data) = self.buffer_data(*dst) else {
                        continue;
                    };
                    let start = *offset as usize;
                    if let Some(target) = dst_data.get_mut(start..start + data.len()) {
                        target.copy_from_slice(data);
                    }
                }
                Command::ResetQueryPool { pool, first, count } => {
                    if let Some(Object::QueryPool(p)) = self.get_mut(pool.as_raw()) {
                        for q in *first..(*first + *count) {
                            if let Some(w) = p.written.get_mut(q as usize) {
                                *w = None;
                            }
                        }
                    }
                }
                Command::EndQuery { pool, query, .. } | Command::WriteTimestamp { pool, query } => {
                    if let Some(Object::QueryPool(p)) = self.get_mut(pool.as_raw()) {
                        if let Some(w) = p.written.get_mut(*query as usize) {
                            *w = Some(false);
                        }
                    }
                    queries.push((*pool, *query));
                }
                _ => {}
            }
        }
        queries
    }

    fn complete(&mut self, pending: Pending) {
        if let Some(Object::Fence { signaled }) = self.get_mut(pending.fence.as_raw()) {
            *signaled = true;
        }
        for (semaphore, value) in pending.signals {
            if let Some(Object::Semaphore { value: current }) = self.get_mut(semaphore.as_raw()) {
                *current = (*current).max(value);
            }
        }
        for (pool, query) in pending.queries {
            if let Some(Object::QueryPool(p)) = self.get_mut(pool.as_raw()) {
                if let Some(Some(available)) = p.written.get_mut(query as usize) {
                    *available = true;
                }
            }
        }
    }
}

///Software implementation of [RawDevice]. See the [module](self) documentation.
#[derive(Default)]
pub struct SoftDevice {
    state: Mutex<SoftState>,
    progress: Condvar,
}

impl SoftDevice {
    pub fn new() -> Arc<Self> {
        let device = SoftDevice::default();
        device.state.lock().query_value = 1;
        Arc::new(device)
    }

    ///Creates a software device and the [Device] wrapping it, with default options and features.
    pub fn device_default() -> (Arc<Device>, Arc<SoftDevice>) {
        Self::device(DeviceFeatures::default(), Options::default(), false)
    }

    ///Creates a software device and a [Device] with `features` and `options`. If `transfer_queue` is set, a dedicated transfer
    /// queue is exposed as well.
    pub fn device(features: DeviceFeatures, options: Options, transfer_queue: bool) -> (Arc<Device>, Arc<SoftDevice>) {
        let soft = Self::new();
        let queues = DeviceQueues {
            graphics: Queue::new(vk::Queue::from_raw(0x1000), 0),
            transfer: transfer_queue.then(|| Queue::new(vk::Queue::from_raw(0x2000), 1)),
        };
        let device = Device::new(soft.clone(), features, DeviceLimits::default(), queues, options);
        (device, soft)
    }

    ///If set, submissions stay pending until [complete_next](Self::complete_next) is called.
    pub fn set_manual_completion(&self, manual: bool) {
        let mut state = self.state.lock();
        state.manual = manual;
        if !manual {
            while let Some(pending) = state.pending.pop_front() {
                state.complete(pending);
            }
            drop(state);
            self.progress.notify_all();
        }
    }

    ///Completes the oldest pending submission. Returns false if there was none.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.pop_front() else {
            return false;
        };
        state.complete(pending);
        drop(state);
        self.progress.notify_all();
        true
    }

    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    ///Value every query reports per result value.
    pub fn set_query_value(&self, value: u64) {
        self.state.lock().query_value = value;
    }

    ///Lets the next submission fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }

    pub fn lose_device(&self) {
        self.state.lock().device_lost = true;
        self.progress.notify_all();
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    ///Every command of every submission, in order.
    pub fn submitted_commands(&self) -> Vec<Command> {
        self.state
            .lock()
            .submissions
            .iter()
            .flat_map(|s| s.commands.iter().cloned())
            .collect()
    }

    ///Commands currently recorded into `cb`.
    pub fn commands(&self, cb: vk::CommandBuffer) -> Vec<Command> {
        match self.state.lock().objects.get(key(cb.as_raw())) {
            Some(Object::CommandBuffer(b)) => b.commands.clone(),
            _ => Vec::new(),
        }
    }

    ///Returns the content of `buffer`'s memory.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.lock().buffer_data(buffer).cloned().unwrap_or_default()
    }

    ///Writes into the memory of `buffer` as if the GPU had done so.
    pub fn write_buffer(&self, buffer: vk::Buffer, offset: usize, data: &[u8]) {
        if let Some(memory) = self.state.lock().buffer_data(buffer) {
            memory[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.count(|o| matches!(o, Object::Buffer { .. }))
    }

    pub fn live_images(&self) -> usize {
        self.count(|o| matches!(o, Object::Image))
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    fn count(&self, f: impl Fn(&Object) -> bool) -> usize {
        self.state.lock().objects.values().filter(|o| f(o)).count()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().descriptor_writes.clone()
    }

    ///Number of `update_descriptor_sets` calls.
    pub fn descriptor_write_calls(&self) -> usize {
        self.state.lock().descriptor_write_calls
    }

    pub fn template_updates(&self) -> usize {
        self.state.lock().template_updates
    }

    fn wait_until(&self, timeout: u64, mut done: impl FnMut(&mut SoftState) -> Option<Result<(), vk::Result>>) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        loop {
            if state.device_lost {
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
            if let Some(result) = done(&mut *state) {
                return result;
            }
            if timeout == 0 || self.progress.wait_for(&mut state, Duration::from_nanos(timeout)).timed_out() {
                return done(&mut *state).unwrap_or(Err(vk::Result::TIMEOUT));
            }
        }
    }
}

impl RawDevice for SoftDevice {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result> {
        Ok(vk::Fence::from_raw(self.state.lock().insert(Object::Fence { signaled })))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().remove(fence.as_raw())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<(), vk::Result> {
        self.wait_until(timeout, |state| match state.get_mut(fence.as_raw()) {
            Some(Object::Fence { signaled: true }) => Some(Ok(())),
            Some(Object::Fence { signaled: false }) => None,
            _ => Some(Err(vk::Result::ERROR_UNKNOWN)),
        })
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.get_mut(fence.as_raw()) {
            Some(Object::Fence { signaled }) => Ok(*signaled),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        match self.state.lock().get_mut(fence.as_raw()) {
            Some(Object::Fence { signaled }) => {
                *signaled = false;
                Ok(())
            }
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn create_semaphore(&self, initial_value: Option<u64>) -> Result<vk::Semaphore, vk::Result> {
        let value = initial_value.unwrap_or(0);
        Ok(vk::Semaphore::from_raw(self.state.lock().insert(Object::Semaphore { value })))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().remove(semaphore.as_raw())
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, vk::Result> {
        match self.state.lock().get_mut(semaphore.as_raw()) {
            Some(Object::Semaphore { value }) => Ok(*value),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: u64) -> Result<(), vk::Result> {
        self.wait_until(timeout, |state| match state.get_mut(semaphore.as_raw()) {
            Some(Object::Semaphore { value: current }) if *current >= value => Some(Ok(())),
            Some(Object::Semaphore { .. }) => None,
            _ => Some(Err(vk::Result::ERROR_UNKNOWN)),
        })
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), vk::Result> {
        let result = match self.state.lock().get_mut(semaphore.as_raw()) {
            Some(Object::Semaphore { value: current }) if value > *current => {
                *current = value;
                Ok(())
            }
            _ => Err(vk::Result::ERROR_UNKNOWN),
        };
        self.progress.notify_all();
        result
    }

    fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool, vk::Result> {
        Ok(vk::CommandPool::from_raw(
            self.state.lock().insert(Object::CommandPool { buffers: Vec::new() }),
        ))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if let Some(Object::CommandPool { buffers }) = state.get_mut(pool.as_raw()) {
            let buffers = std::mem::take(buffers);
            for cb in buffers {
                state.remove(cb);
            }
        }
        state.remove(pool.as_raw());
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        let buffers = match state.get_mut(pool.as_raw()) {
            Some(Object::CommandPool { buffers }) => buffers.clone(),
            _ => return Err(vk::Result::ERROR_UNKNOWN),
        };
        for cb in buffers {
            if let Some(Object::CommandBuffer(b)) = state.get_mut(cb) {
                b.state = CbState::Initial;
                b.in_rendering = false;
                b.commands.clear();
            }
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, vk::Result> {
        let mut state = self.state.lock();
        let cb = state.insert(Object::CommandBuffer(SoftCommandBuffer {
            state: CbState::Initial,
            in_rendering: false,
            commands: Vec::new(),
        }));
        match state.get_mut(pool.as_raw()) {
            Some(Object::CommandPool { buffers }) => buffers.push(cb),
            _ => return Err(vk::Result::ERROR_UNKNOWN),
        }
        Ok(vk::CommandBuffer::from_raw(cb))
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        let error = match state.get_mut(cb.as_raw()) {
            Some(Object::CommandBuffer(b)) if b.state == CbState::Initial => {
                b.state = CbState::Recording;
                None
            }
            Some(Object::CommandBuffer(b)) => Some(format!("Begin on command buffer in state {:?}", b.state)),
            _ => return Err(vk::Result::ERROR_UNKNOWN),
        };
        state.validation_errors.extend(error);
        Ok(())
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        let error = match state.get_mut(cb.as_raw()) {
            Some(Object::CommandBuffer(b)) if b.state == CbState::Recording && !b.in_rendering => {
                b.state = CbState::Executable;
                None
            }
            Some(Object::CommandBuffer(b)) => Some(format!(
                "End on command buffer in state {:?}, rendering: {}",
                b.state, b.in_rendering
            )),
            _ => return Err(vk::Result::ERROR_UNKNOWN),
        };
        state.validation_errors.extend(error);
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if let Some(result) = state.fail_next_submit.take() {
            if result == vk::Result::ERROR_DEVICE_LOST {
                state.device_lost = true;
            }
            return Err(result);
        }

        let mut commands = Vec::new();
        let mut errors = Vec::new();
        for cb in batches.iter().flat_map(|b| b.command_buffers.iter()) {
            match state.objects.get(key(cb.as_raw())) {
                Some(Object::CommandBuffer(b)) => {
                    if b.state != CbState::Executable {
                        errors.push(format!("Submitted command buffer in state {:?}", b.state));
                    }
                    commands.extend(b.commands.iter().cloned());
                }
                _ => errors.push("Submitted unknown command buffer".to_owned()),
            }
        }
        state.validation_errors.extend(errors);

        let queries = state.execute(&commands);
        let signals = batches
            .iter()
            .flat_map(|b| b.signals.iter().map(|s| (s.semaphore, s.value)))
            .collect::<Vec<_>>();

        state.submissions.push(Submission {
            queue,
            batches: batches.to_vec(),
            commands,
            fence,
        });

        let pending = Pending {
            fence,
            signals,
            queries,
        };
        if state.manual {
            state.pending.push_back(pending);
        } else {
            state.complete(pending);
            drop(state);
            self.progress.notify_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<(), vk::Result> {
        self.device_wait_idle()
    }

    fn device_wait_idle(&self) -> Result<(), vk::Result> {
        self.wait_until(u64::MAX, |state| state.pending.is_empty().then_some(Ok(())))
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RawBuffer, vk::Result> {
        let mut state = self.state.lock();
        let handle = state.insert(Object::Buffer {
            data: vec![0; info.size as usize],
        });
        let mapped = if info.memory.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            match state.get_mut(handle) {
                Some(Object::Buffer { data }) => NonNull::new(data.as_mut_ptr()).map(MappedPtr),
                _ => None,
            }
        } else {
            None
        };

        Ok(RawBuffer {
            buffer: vk::Buffer::from_raw(handle),
            memory: vk::DeviceMemory::null(),
            offset: 0,
            size: info.size,
            memory_flags: info.memory,
            mapped,
            address: if info.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
                handle << 16
            } else {
                0
            },
        })
    }

    fn destroy_buffer(&self, buffer: &RawBuffer) {
        self.state.lock().remove(buffer.buffer.as_raw())
    }

    fn create_buffer_view(
        &self,
        _buffer: vk::Buffer,
        _format: vk::Format,
        _offset: vk::DeviceSize,
        _range: vk::DeviceSize,
    ) -> Result<vk::BufferView, vk::Result> {
        Ok(vk::BufferView::from_raw(self.state.lock().insert(Object::BufferView)))
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        self.state.lock().remove(view.as_raw())
    }

    fn create_image(&self, desc: &ImgDesc) -> Result<RawImage, vk::Result> {
        Ok(RawImage {
            image: vk::Image::from_raw(self.state.lock().insert(Object::Image)),
            memory: vk::DeviceMemory::null(),
            memory_flags: desc.memory,
        })
    }

    fn destroy_image(&self, image: &RawImage) {
        self.state.lock().remove(image.image.as_raw())
    }

    fn create_image_view(&self, _image: vk::Image, _desc: &ImgViewDesc) -> Result<vk::ImageView, vk::Result> {
        Ok(vk::ImageView::from_raw(self.state.lock().insert(Object::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().remove(view.as_raw())
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler, vk::Result> {
        Ok(vk::Sampler::from_raw(self.state.lock().insert(Object::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().remove(sampler.as_raw())
    }

    fn format_features(&self, format: vk::Format) -> FormatFeatures {
        let Some(info) = crate::format::format_info(format) else {
            return FormatFeatures::default();
        };
        let mut optimal = vk::FormatFeatureFlags::TRANSFER_SRC
            | vk::FormatFeatureFlags::TRANSFER_DST
            | vk::FormatFeatureFlags::SAMPLED_IMAGE
            | vk::FormatFeatureFlags::BLIT_SRC;
        if info.is_depth_stencil() {
            optimal |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        } else if !info.flags.is_compressed {
            optimal |= vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::STORAGE_IMAGE
                | vk::FormatFeatureFlags::BLIT_DST;
            if !info.flags.is_integer {
                optimal |= vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
            }
        }
        FormatFeatures {
            optimal,
            linear: vk::FormatFeatureFlags::TRANSFER_SRC | vk::FormatFeatureFlags::TRANSFER_DST,
            buffer: vk::FormatFeatureFlags::UNIFORM_TEXEL_BUFFER | vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER,
        }
    }

    fn create_query_pool(
        &self,
        ty: vk::QueryType,
        count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> Result<vk::QueryPool, vk::Result> {
        let values_per_query = match ty {
            vk::QueryType::PIPELINE_STATISTICS => statistics.as_raw().count_ones() as usize,
            vk::QueryType::TRANSFORM_FEEDBACK_STREAM_EXT => 2,
            _ => 1,
        };
        Ok(vk::QueryPool::from_raw(self.state.lock().insert(Object::QueryPool(
            SoftQueryPool {
                ty,
                values_per_query,
                written: vec![None; count as usize],
            },
        ))))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state.lock().remove(pool.as_raw())
    }

    fn query_results(&self, pool: vk::QueryPool, query: u32, data: &mut [u64]) -> Result<bool, vk::Result> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let value = state.query_value;
        let Some(Object::QueryPool(p)) = state.get_mut(pool.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        match p.written.get(query as usize) {
            Some(Some(true)) => {
                let count = p.values_per_query.min(data.len());
                let value = if p.ty == vk::QueryType::TIMESTAMP {
                    value * (query as u64 + 1)
                } else {
                    value
                };
                data[..count].fill(value);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[SetLayoutBinding],
        _flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        Ok(vk::DescriptorSetLayout::from_raw(self.state.lock().insert(Object::SetLayout {
            bindings: bindings.to_vec(),
        })))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().remove(layout.as_raw())
    }

    fn create_pipeline_layout(
        &self,
        _sets: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result> {
        Ok(vk::PipelineLayout::from_raw(self.state.lock().insert(Object::PipelineLayout)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.lock().remove(layout.as_raw())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, vk::Result> {
        Ok(vk::DescriptorPool::from_raw(self.state.lock().insert(Object::DescriptorPool {
            max_sets,
            allocated: 0,
        })))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().remove(pool.as_raw())
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result> {
        match self.state.lock().get_mut(pool.as_raw()) {
            Some(Object::DescriptorPool { allocated, .. }) => {
                *allocated = 0;
                Ok(())
            }
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let mut state = self.state.lock();
        match state.get_mut(pool.as_raw()) {
            Some(Object::DescriptorPool { max_sets, allocated }) if *allocated < *max_sets => *allocated += 1,
            Some(Object::DescriptorPool { .. }) => return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            _ => return Err(vk::Result::ERROR_UNKNOWN),
        }
        Ok(vk::DescriptorSet::from_raw(state.insert(Object::DescriptorSet)))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        state.descriptor_write_calls += 1;
        state.descriptor_writes.extend_from_slice(writes);
    }

    fn create_descriptor_update_template(
        &self,
        _layout: vk::DescriptorSetLayout,
        entries: &[TemplateEntry],
    ) -> Result<vk::DescriptorUpdateTemplate, vk::Result> {
        Ok(vk::DescriptorUpdateTemplate::from_raw(self.state.lock().insert(Object::Template {
            entries: entries.to_vec(),
        })))
    }

    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate) {
        self.state.lock().remove(template.as_raw())
    }

    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    ) {
        let mut state = self.state.lock();
        let entries = match state.get_mut(template.as_raw()) {
            Some(Object::Template { entries }) => entries.clone(),
            _ => {
                state.validation_errors.push("Update with unknown template".to_owned());
                return;
            }
        };
        if entries.len() != infos.len() {
            state
                .validation_errors
                .push(format!("Template has {} entries, got {} infos", entries.len(), infos.len()));
        }
        state.template_updates += 1;
        let writes = entries.iter().zip(infos.iter()).map(|(e, info)| DescriptorWrite {
            set,
            binding: e.binding,
            array_element: e.array_element,
            ty: e.ty,
            info: *info,
        });
        let writes = writes.collect::<Vec<_>>();
        state.descriptor_writes.extend(writes);
    }

    fn descriptor_set_layout_size(&self, layout: vk::DescriptorSetLayout) -> vk::DeviceSize {
        match self.state.lock().get_mut(layout.as_raw()) {
            Some(Object::SetLayout { bindings }) => {
                bindings.iter().map(|b| b.count as u64).sum::<u64>()
                    * DeviceLimits::default().descriptor_sizes.uniform_buffer as u64
            }
            _ => 0,
        }
    }

    fn descriptor_set_layout_binding_offset(&self, layout: vk::DescriptorSetLayout, binding: u32) -> vk::DeviceSize {
        match self.state.lock().get_mut(layout.as_raw()) {
            Some(Object::SetLayout { bindings }) => {
                bindings
                    .iter()
                    .take_while(|b| b.binding != binding)
                    .map(|b| b.count as u64)
                    .sum::<u64>()
                    * DeviceLimits::default().descriptor_sizes.uniform_buffer as u64
            }
            _ => 0,
        }
    }

    fn get_descriptor(&self, _ty: vk::DescriptorType, info: &DescriptorInfo, dst: &mut [u8]) {
        let (address, range) = match info {
            DescriptorInfo::Address { address, range } => (*address, *range),
            _ => (0, 0),
        };
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&address.to_le_bytes());
        bytes[8..].copy_from_slice(&range.to_le_bytes());
        let len = dst.len().min(16);
        dst[..len].copy_from_slice(&bytes[..len]);
    }

    fn cmd_pipeline_barrier(&self, cb: vk::CommandBuffer, memory: &[MemoryBarrier], images: &[ImageBarrier]) {
        self.state.lock().record(
            cb,
            Command::Barrier {
                memory: memory.to_vec(),
                images: images.to_vec(),
            },
        )
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        self.state.lock().record(cb, Command::BeginRendering(info.clone()))
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        self.state.lock().record(cb, Command::EndRendering)
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.state
            .lock()
            .record(cb, Command::BindPipeline { bind_point, pipeline })
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.lock().record(
            cb,
            Command::BindDescriptorSets {
                bind_point,
                first_set,
                sets: sets.to_vec(),
            },
        )
    }

    fn cmd_bind_descriptor_buffers(&self, cb: vk::CommandBuffer, buffers: &[(vk::DeviceAddress, vk::BufferUsageFlags)]) {
        self.state.lock().record(
            cb,
            Command::BindDescriptorBuffers(buffers.iter().map(|(a, _)| *a).collect()),
        )
    }

    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        _buffer_indices: &[u32],
        offsets: &[vk::DeviceSize],
    ) {
        self.state.lock().record(
            cb,
            Command::SetDescriptorBufferOffsets {
                bind_point,
                first_set,
                offsets: offsets.to_vec(),
            },
        )
    }

    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state.lock().record(
            cb,
            Command::PushConstants {
                stages,
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
        ty: vk::IndexType,
    ) {
        self.state
            .lock()
            .record(cb, Command::BindIndexBuffer { buffer, offset, ty })
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
        _sizes: &[vk::DeviceSize],
        strides: &[vk::DeviceSize],
    ) {
        self.state.lock().record(
            cb,
            Command::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
                offsets: offsets.to_vec(),
                strides: strides.to_vec(),
            },
        )
    }

    fn cmd_bind_transform_feedback_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
        _sizes: &[vk::DeviceSize],
    ) {
        self.state.lock().record(
            cb,
            Command::BindTransformFeedbackBuffers {
                first_binding,
                buffers: buffers.to_vec(),
            },
        )
    }

    fn cmd_begin_transform_feedback(&self, cb: vk::CommandBuffer, counters: &[vk::Buffer], _offsets: &[vk::DeviceSize]) {
        self.state
            .lock()
            .record(cb, Command::BeginTransformFeedback(counters.to_vec()))
    }

    fn cmd_end_transform_feedback(&self, cb: vk::CommandBuffer, counters: &[vk::Buffer], _offsets: &[vk::DeviceSize]) {
        self.state
            .lock()
            .record(cb, Command::EndTransformFeedback(counters.to_vec()))
    }

    fn cmd_set_viewports(&self, cb: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        self.state.lock().record(cb, Command::SetViewports(viewports.to_vec()))
    }

    fn cmd_set_scissors(&self, cb: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        self.state.lock().record(cb, Command::SetScissors(scissors.to_vec()))
    }

    fn cmd_set_depth_bias(&self, cb: vk::CommandBuffer, _constant: f32, _clamp: f32, _slope: f32) {
        self.state.lock().record(cb, Command::SetState("depth_bias"))
    }

    fn cmd_set_blend_constants(&self, cb: vk::CommandBuffer, _constants: [f32; 4]) {
        self.state.lock().record(cb, Command::SetState("blend_constants"))
    }

    fn cmd_set_stencil_reference(&self, cb: vk::CommandBuffer, _reference: u32) {
        self.state.lock().record(cb, Command::SetState("stencil_reference"))
    }

    fn cmd_set_depth_bounds(&self, cb: vk::CommandBuffer, _min: f32, _max: f32) {
        self.state.lock().record(cb, Command::SetState("depth_bounds"))
    }

    fn cmd_set_cull_mode(&self, cb: vk::CommandBuffer, _mode: vk::CullModeFlags) {
        self.state.lock().record(cb, Command::SetState("cull_mode"))
    }

    fn cmd_set_front_face(&self, cb: vk::CommandBuffer, _face: vk::FrontFace) {
        self.state.lock().record(cb, Command::SetState("front_face"))
    }

    fn cmd_set_depth_test(&self, cb: vk::CommandBuffer, _test: bool, _write: bool, _compare: vk::CompareOp) {
        self.state.lock().record(cb, Command::SetState("depth_test"))
    }

    fn cmd_set_depth_bounds_test(&self, cb: vk::CommandBuffer, _enable: bool) {
        self.state.lock().record(cb, Command::SetState("depth_bounds_test"))
    }

    fn cmd_set_stencil_test(&self, cb: vk::CommandBuffer, _enable: bool) {
        self.state.lock().record(cb, Command::SetState("stencil_test"))
    }

    fn cmd_set_stencil_op(&self, cb: vk::CommandBuffer, _face: vk::StencilFaceFlags, _op: vk::StencilOpState) {
        self.state.lock().record(cb, Command::SetState("stencil_op"))
    }

    fn cmd_set_sample_mask(&self, cb: vk::CommandBuffer, _samples: vk::SampleCountFlags, _mask: u32) {
        self.state.lock().record(cb, Command::SetState("sample_mask"))
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.state.lock().record(
            cb,
            Command::Draw {
                vertex_count,
                instance_count,
            },
        )
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.lock().record(
            cb,
            Command::DrawIndexed {
                index_count,
                instance_count,
            },
        )
    }

    fn cmd_draw_indirect(
        &self,
        cb: vk::CommandBuffer,
        indexed: bool,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        count: u32,
        _stride: u32,
    ) {
        self.state.lock().record(
            cb,
            Command::DrawIndirect {
                indexed,
                buffer,
                offset,
                count,
            },
        )
    }

    fn cmd_draw_indirect_count(
        &self,
        cb: vk::CommandBuffer,
        indexed: bool,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        count_buffer: vk::Buffer,
        _count_offset: vk::DeviceSize,
        _max_count: u32,
        _stride: u32,
    ) {
        self.state.lock().record(
            cb,
            Command::DrawIndirectCount {
                indexed,
                buffer,
                count_buffer,
            },
        )
    }

    fn cmd_draw_indirect_byte_count(
        &self,
        cb: vk::CommandBuffer,
        _instance_count: u32,
        _first_instance: u32,
        counter_buffer: vk::Buffer,
        _counter_offset: vk::DeviceSize,
        _vertex_stride: u32,
    ) {
        self.state
            .lock()
            .record(cb, Command::DrawIndirectByteCount { counter_buffer })
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state.lock().record(cb, Command::Dispatch { x, y, z })
    }

    fn cmd_dispatch_indirect(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.state
            .lock()
            .record(cb, Command::DispatchIndirect { buffer, offset })
    }

    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.state.lock().record(
            cb,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        )
    }

    fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        let mut state = self.state.lock();
        if src == dst {
            for r in regions {
                let same_subresource = r.src_subresource.mip_level == r.dst_subresource.mip_level
                    && ranges_overlap(
                        r.src_subresource.base_array_layer as u64,
                        r.src_subresource.layer_count as u64,
                        r.dst_subresource.base_array_layer as u64,
                        r.dst_subresource.layer_count as u64,
                    );
                if same_subresource && crate::util::regions_overlap(r.src_offset, r.dst_offset, r.extent) {
                    state
                        .validation_errors
                        .push(format!("Overlapping image copy regions {:?}", r));
                }
            }
        }
        state.record(
            cb,
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        )
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state.lock().record(
            cb,
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        )
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state.lock().record(
            cb,
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions: regions.to_vec(),
            },
        )
    }

    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.state
            .lock()
            .record(cb, Command::BlitImage { src, dst, filter })
    }

    fn cmd_resolve_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageResolve],
    ) {
        self.state.lock().record(cb, Command::ResolveImage { src, dst })
    }

    fn cmd_fill_buffer(&self, cb: vk::CommandBuffer, dst: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, data: u32) {
        self.state.lock().record(
            cb,
            Command::FillBuffer {
                dst,
                offset,
                size,
                data,
            },
        )
    }

    fn cmd_update_buffer(&self, cb: vk::CommandBuffer, dst: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) {
        let mut state = self.state.lock();
        if data.len() > 1 << 16 || data.len() % 4 != 0 {
            state
                .validation_errors
                .push(format!("Invalid inline update size {}", data.len()));
        }
        state.record(
            cb,
            Command::UpdateBuffer {
                dst,
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) {
        self.state
            .lock()
            .record(cb, Command::ClearColorImage { image, layout, value })
    }

    fn cmd_clear_depth_stencil_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: ClearValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) {
        self.state
            .lock()
            .record(cb, Command::ClearDepthStencilImage { image, layout, value })
    }

    fn cmd_clear_attachments(&self, cb: vk::CommandBuffer, attachments: &[ClearAttachment], _rects: &[vk::ClearRect]) {
        self.state
            .lock()
            .record(cb, Command::ClearAttachments(attachments.to_vec()))
    }

    fn cmd_reset_query_pool(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        self.state
            .lock()
            .record(cb, Command::ResetQueryPool { pool, first, count })
    }

    fn cmd_begin_query(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        query: u32,
        _flags: vk::QueryControlFlags,
        index: Option<u32>,
    ) {
        self.state
            .lock()
            .record(cb, Command::BeginQuery { pool, query, index })
    }

    fn cmd_end_query(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, query: u32, index: Option<u32>) {
        self.state
            .lock()
            .record(cb, Command::EndQuery { pool, query, index })
    }

    fn cmd_write_timestamp(&self, cb: vk::CommandBuffer, _stage: vk::PipelineStageFlags2, pool: vk::QueryPool, query: u32) {
        self.state
            .lock()
            .record(cb, Command::WriteTimestamp { pool, query })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SemaphoreSubmit;
    use smallvec::smallvec;

    fn recording_buffer(soft: &SoftDevice) -> vk::CommandBuffer {
        let pool = soft.create_command_pool(0).unwrap();
        let cb = soft.allocate_command_buffer(pool).unwrap();
        soft.begin_command_buffer(cb).unwrap();
        cb
    }

    #[test]
    fn copies_execute_at_submission() {
        let soft = SoftDevice::new();
        let info = BufferCreateInfo {
            size: 8,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            flags: vk::BufferCreateFlags::empty(),
        };
        let a = soft.create_buffer(&info).unwrap();
        let b = soft.create_buffer(&info).unwrap();
        soft.write_buffer(a.buffer, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let cb = recording_buffer(&soft);
        soft.cmd_copy_buffer(
            cb,
            a.buffer,
            b.buffer,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 4,
                size: 4,
            }],
        );
        assert_eq!(soft.buffer_contents(b.buffer), vec![0; 8]);
        soft.end_command_buffer(cb).unwrap();
        let batch = SubmitBatch {
            command_buffers: smallvec![cb],
            ..Default::default()
        };
        soft.queue_submit(vk::Queue::null(), &[batch], vk::Fence::null()).unwrap();
        assert_eq!(soft.buffer_contents(b.buffer), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn manual_completion_gates_fences_and_semaphores() {
        let soft = SoftDevice::new();
        soft.set_manual_completion(true);
        let fence = soft.create_fence(false).unwrap();
        let sem = soft.create_semaphore(Some(0)).unwrap();
        let batch = SubmitBatch {
            signals: smallvec![SemaphoreSubmit {
                semaphore: sem,
                value: 3,
                stages: vk::PipelineStageFlags2::ALL_COMMANDS,
            }],
            ..Default::default()
        };
        soft.queue_submit(vk::Queue::null(), &[batch], fence).unwrap();

        assert_eq!(soft.wait_for_fence(fence, 1000), Err(vk::Result::TIMEOUT));
        assert_eq!(soft.semaphore_value(sem), Ok(0));
        assert!(soft.complete_next());
        assert_eq!(soft.wait_for_fence(fence, 0), Ok(()));
        assert_eq!(soft.semaphore_value(sem), Ok(3));
    }

    #[test]
    fn misuse_is_reported() {
        let soft = SoftDevice::new();
        let cb = recording_buffer(&soft);
        soft.cmd_draw(cb, 3, 1, 0, 0);
        assert_eq!(soft.validation_errors().len(), 1);

        soft.cmd_end_rendering(cb);
        assert_eq!(soft.validation_errors().len(), 2);
    }
}
