//! Logical queries.
//!
//! Vulkan queries can not be paused. A [Query] whose scope spans render pass restarts or command list boundaries is
//! therefore backed by several Vulkan queries over its lifetime. The [QueryManager] ends the Vulkan query that is
//! currently active for a query type whenever the set of enabled queries of that type changes or the type is
//! suspended, and begins a fresh one if queries of the type are still wanted. Every enabled logical query registers
//! interest in that fresh Vulkan query, and reports the sum of all of them.

use std::sync::Arc;

use ahash::AHashMap;
use dxvk::{
    DeviceError,
    ash::vk,
    device::Device,
    resources::QueryPool,
    sync::Signal,
};
use dxvk_commands::{Access, CmdBuffer, CommandList};
use parking_lot::Mutex;
use smallvec::SmallVec;

///Slots per Vulkan query pool. Slots are never reused, a full pool is replaced by a new one.
pub const QUERY_POOL_SIZE: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    Occlusion {
        ///Count samples instead of reporting any non zero value.
        precise: bool,
    },
    PipelineStatistics,
    ///Primitives written to, and needed for, a single transform feedback stream.
    TransformFeedbackStream(u32),
    Timestamp,
}

impl QueryType {
    fn kind(&self) -> Option<(QueryKind, u32)> {
        match self {
            QueryType::Occlusion { .. } => Some((QueryKind::Occlusion, 0)),
            QueryType::PipelineStatistics => Some((QueryKind::PipelineStatistics, 0)),
            QueryType::TransformFeedbackStream(stream) => Some((QueryKind::TransformFeedback, *stream)),
            QueryType::Timestamp => None,
        }
    }
}

///Scoped query types. Each kind has a type wide active flag, the context toggles it around render passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Occlusion,
    PipelineStatistics,
    TransformFeedback,
}

impl QueryKind {
    fn index(self) -> usize {
        match self {
            QueryKind::Occlusion => 0,
            QueryKind::PipelineStatistics => 1,
            QueryKind::TransformFeedback => 2,
        }
    }
}

///Pipeline statistics in the bit order of `VkQueryPipelineStatisticFlagBits`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub ia_vertices: u64,
    pub ia_primitives: u64,
    pub vs_invocations: u64,
    pub gs_invocations: u64,
    pub gs_primitives: u64,
    pub clipping_invocations: u64,
    pub clipping_primitives: u64,
    pub fs_invocations: u64,
    pub tcs_patches: u64,
    pub tes_invocations: u64,
    pub cs_invocations: u64,
}

impl PipelineStatistics {
    pub const FLAGS: vk::QueryPipelineStatisticFlags = vk::QueryPipelineStatisticFlags::from_raw(0x7ff);

    fn accumulate(&mut self, values: &[u64]) {
        let fields = [
            &mut self.ia_vertices,
            &mut self.ia_primitives,
            &mut self.vs_invocations,
            &mut self.gs_invocations,
            &mut self.gs_primitives,
            &mut self.clipping_invocations,
            &mut self.clipping_primitives,
            &mut self.fs_invocations,
            &mut self.tcs_patches,
            &mut self.tes_invocations,
            &mut self.cs_invocations,
        ];
        for (field, value) in fields.into_iter().zip(values) {
            *field += *value;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryData {
    Occlusion { samples_passed: u64 },
    Timestamp { time: u64 },
    PipelineStatistics(PipelineStatistics),
    TransformFeedbackStream { primitives_written: u64, primitives_needed: u64 },
}

impl QueryData {
    fn zero(ty: QueryType) -> Self {
        match ty {
            QueryType::Occlusion { .. } => QueryData::Occlusion { samples_passed: 0 },
            QueryType::Timestamp => QueryData::Timestamp { time: 0 },
            QueryType::PipelineStatistics => QueryData::PipelineStatistics(PipelineStatistics::default()),
            QueryType::TransformFeedbackStream(_) => QueryData::TransformFeedbackStream {
                primitives_written: 0,
                primitives_needed: 0,
            },
        }
    }

    fn accumulate(&mut self, values: &[u64]) {
        let first = values.first().copied().unwrap_or(0);
        match self {
            QueryData::Occlusion { samples_passed } => *samples_passed += first,
            QueryData::Timestamp { time } => *time = first,
            QueryData::PipelineStatistics(stats) => stats.accumulate(values),
            QueryData::TransformFeedbackStream {
                primitives_written,
                primitives_needed,
            } => {
                *primitives_written += first;
                *primitives_needed += values.get(1).copied().unwrap_or(0);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    ///The query is active, or not all contributing Vulkan queries are available yet.
    Pending,
    Available(QueryData),
    Failed(vk::Result),
}

///One slot of a Vulkan query pool.
#[derive(Clone)]
pub struct QueryHandle {
    pub pool: Arc<QueryPool>,
    pub index: u32,
}

struct QueryInner {
    handles: SmallVec<[QueryHandle; 4]>,
    ///Incremented by every begin. The command list that ends the query signals this value on completion.
    revision: u64,
    completed: u64,
    ended: bool,
}

///Logical query as seen by the client API.
pub struct Query {
    ty: QueryType,
    inner: Mutex<QueryInner>,
}

impl Query {
    pub fn new(ty: QueryType) -> Arc<Self> {
        Arc::new(Query {
            ty,
            inner: Mutex::new(QueryInner {
                handles: SmallVec::new(),
                revision: 0,
                completed: 0,
                ended: false,
            }),
        })
    }

    pub fn ty(&self) -> QueryType {
        self.ty
    }

    fn begin(&self) {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        inner.handles.clear();
        inner.ended = false;
    }

    fn end(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.ended = true;
        inner.revision
    }

    fn add_handle(&self, handle: QueryHandle) {
        self.inner.lock().handles.push(handle);
    }

    ///Number of Vulkan queries backing the current revision.
    pub fn handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    ///Reads the accumulated result. Never blocks.
    pub fn status(&self) -> QueryStatus {
        let inner = self.inner.lock();
        if !inner.ended || inner.completed < inner.revision {
            return QueryStatus::Pending;
        }

        let mut data = QueryData::zero(self.ty);
        let mut values = [0u64; 11];
        for handle in inner.handles.iter() {
            match handle.pool.results(handle.index, &mut values) {
                Ok(true) => data.accumulate(&values[..handle.pool.value_count()]),
                Ok(false) => return QueryStatus::Pending,
                Err(e) => {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to read query results: {}", e);
                    return QueryStatus::Failed(e);
                }
            }
        }
        QueryStatus::Available(data)
    }
}

impl Signal for Query {
    fn signal(&self, value: u64) {
        let mut inner = self.inner.lock();
        inner.completed = inner.completed.max(value);
    }
}

///Hands out query slots of one Vulkan query type.
struct QueryAllocator {
    ty: vk::QueryType,
    statistics: vk::QueryPipelineStatisticFlags,
    pool: Option<Arc<QueryPool>>,
    next: u32,
}

impl QueryAllocator {
    fn new(ty: vk::QueryType, statistics: vk::QueryPipelineStatisticFlags) -> Self {
        QueryAllocator {
            ty,
            statistics,
            pool: None,
            next: 0,
        }
    }

    ///Allocates a slot and resets it on the init command buffer of `list`.
    fn allocate(&mut self, device: &Arc<Device>, list: &mut CommandList) -> Result<QueryHandle, DeviceError> {
        let pool = match &self.pool {
            Some(pool) if self.next < pool.size() => pool.clone(),
            _ => {
                #[cfg(feature = "logging")]
                log::trace!("Allocating {:?} query pool", self.ty);

                let pool = QueryPool::new(device, self.ty, QUERY_POOL_SIZE, self.statistics)?;
                self.pool = Some(pool.clone());
                self.next = 0;
                pool
            }
        };

        let index = self.next;
        self.next += 1;

        let cb = list.cmd_buffer(CmdBuffer::Init);
        device.inner.cmd_reset_query_pool(cb, pool.inner, index, 1);
        list.track(&pool, Access::empty());

        Ok(QueryHandle { pool, index })
    }
}

#[derive(Default)]
struct QuerySlot {
    queries: SmallVec<[Arc<Query>; 4]>,
    current: Option<QueryHandle>,
}

///Maps enabled logical queries onto Vulkan queries.
pub struct QueryManager {
    device: Arc<Device>,
    occlusion: QueryAllocator,
    statistics: QueryAllocator,
    xfb: QueryAllocator,
    timestamps: QueryAllocator,
    slots: AHashMap<(QueryKind, u32), QuerySlot>,
    active: [bool; 3],
}

impl QueryManager {
    pub fn new(device: &Arc<Device>) -> Self {
        let none = vk::QueryPipelineStatisticFlags::empty();
        QueryManager {
            device: device.clone(),
            occlusion: QueryAllocator::new(vk::QueryType::OCCLUSION, none),
            statistics: QueryAllocator::new(vk::QueryType::PIPELINE_STATISTICS, PipelineStatistics::FLAGS),
            xfb: QueryAllocator::new(vk::QueryType::TRANSFORM_FEEDBACK_STREAM_EXT, none),
            timestamps: QueryAllocator::new(vk::QueryType::TIMESTAMP, none),
            slots: AHashMap::default(),
            active: [false; 3],
        }
    }

    pub fn is_active(&self, kind: QueryKind) -> bool {
        self.active[kind.index()]
    }

    ///True if any logical query of `kind` is enabled.
    pub fn has_queries(&self, kind: QueryKind) -> bool {
        self.slots
            .iter()
            .any(|((k, _), slot)| *k == kind && !slot.queries.is_empty())
    }

    ///Starts a new revision of `query` and adds it to the enabled set of its type.
    pub fn enable(&mut self, list: &mut CommandList, query: &Arc<Query>) -> Result<(), DeviceError> {
        let Some((kind, index)) = query.ty.kind() else {
            #[cfg(feature = "logging")]
            log::warn!("Timestamp queries can not be enabled, use write_timestamp");
            return Ok(());
        };

        let slot = self.slots.entry((kind, index)).or_default();
        if slot.queries.iter().any(|q| Arc::ptr_eq(q, query)) {
            return Ok(());
        }
        query.begin();
        slot.queries.push(query.clone());
        self.restart(list, kind, index)
    }

    ///Removes `query` from the enabled set. Its result becomes available once `list` completed.
    pub fn disable(&mut self, list: &mut CommandList, query: &Arc<Query>) -> Result<(), DeviceError> {
        let Some((kind, index)) = query.ty.kind() else {
            return Ok(());
        };
        let Some(slot) = self.slots.get_mut(&(kind, index)) else {
            return Ok(());
        };
        let Some(position) = slot.queries.iter().position(|q| Arc::ptr_eq(q, query)) else {
            return Ok(());
        };

        //end the shared Vulkan query while the query is still registered, then continue without it
        let result = self.restart_without(list, kind, index, position);
        let revision = query.end();
        list.track_signal(query.clone(), revision);
        result
    }

    fn restart_without(
        &mut self,
        list: &mut CommandList,
        kind: QueryKind,
        index: u32,
        position: usize,
    ) -> Result<(), DeviceError> {
        self.end_current(list, kind, index);
        if let Some(slot) = self.slots.get_mut(&(kind, index)) {
            slot.queries.remove(position);
        }
        self.begin_current(list, kind, index)
    }

    ///Marks `kind` active and begins a Vulkan query for each slot with enabled queries.
    pub fn begin_queries(&mut self, list: &mut CommandList, kind: QueryKind) -> Result<(), DeviceError> {
        self.active[kind.index()] = true;
        for index in self.slot_indices(kind) {
            self.restart(list, kind, index)?;
        }
        Ok(())
    }

    ///Ends every Vulkan query of `kind` and marks the kind inactive.
    pub fn end_queries(&mut self, list: &mut CommandList, kind: QueryKind) {
        self.active[kind.index()] = false;
        for index in self.slot_indices(kind) {
            self.end_current(list, kind, index);
        }
    }

    ///Writes a timestamp. The previous value of `query` is discarded.
    pub fn write_timestamp(&mut self, list: &mut CommandList, query: &Arc<Query>) -> Result<(), DeviceError> {
        if query.ty != QueryType::Timestamp {
            #[cfg(feature = "logging")]
            log::warn!("write_timestamp called with {:?} query", query.ty);
            return Ok(());
        }

        query.begin();
        let handle = self.timestamps.allocate(&self.device, list)?;
        let cb = list.cmd_buffer(CmdBuffer::Exec);
        self.device
            .inner
            .cmd_write_timestamp(cb, vk::PipelineStageFlags2::ALL_COMMANDS, handle.pool.inner, handle.index);
        query.add_handle(handle);
        let revision = query.end();
        list.track_signal(query.clone(), revision);
        Ok(())
    }

    fn slot_indices(&self, kind: QueryKind) -> SmallVec<[u32; 4]> {
        self.slots.keys().filter(|(k, _)| *k == kind).map(|(_, i)| *i).collect()
    }

    fn restart(&mut self, list: &mut CommandList, kind: QueryKind, index: u32) -> Result<(), DeviceError> {
        self.end_current(list, kind, index);
        self.begin_current(list, kind, index)
    }

    fn end_current(&mut self, list: &mut CommandList, kind: QueryKind, index: u32) {
        let Some(handle) = self.slots.get_mut(&(kind, index)).and_then(|s| s.current.take()) else {
            return;
        };
        let cb = list.cmd_buffer(CmdBuffer::Exec);
        self.device
            .inner
            .cmd_end_query(cb, handle.pool.inner, handle.index, vk_index(kind, index));
    }

    fn begin_current(&mut self, list: &mut CommandList, kind: QueryKind, index: u32) -> Result<(), DeviceError> {
        if !self.active[kind.index()] {
            return Ok(());
        }
        let Some(slot) = self.slots.get_mut(&(kind, index)) else {
            return Ok(());
        };
        if slot.queries.is_empty() {
            return Ok(());
        }

        let allocator = match kind {
            QueryKind::Occlusion => &mut self.occlusion,
            QueryKind::PipelineStatistics => &mut self.statistics,
            QueryKind::TransformFeedback => &mut self.xfb,
        };
        let handle = allocator.allocate(&self.device, list)?;

        let precise = slot
            .queries
            .iter()
            .any(|q| matches!(q.ty, QueryType::Occlusion { precise: true }));
        let flags = if precise {
            vk::QueryControlFlags::PRECISE
        } else {
            vk::QueryControlFlags::empty()
        };

        let cb = list.cmd_buffer(CmdBuffer::Exec);
        self.device
            .inner
            .cmd_begin_query(cb, handle.pool.inner, handle.index, flags, vk_index(kind, index));
        for query in slot.queries.iter() {
            query.add_handle(handle.clone());
        }
        slot.current = Some(handle);
        Ok(())
    }
}

fn vk_index(kind: QueryKind, index: u32) -> Option<u32> {
    (kind == QueryKind::TransformFeedback).then_some(index)
}

#[cfg(test)]
mod tests {
    use dxvk::testing::SoftDevice;
    use dxvk_commands::SubmissionQueue;
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(Query: Send, Sync);
        assert_impl_all!(QueryManager: Send);
    }

    #[test]
    fn query_sums_all_restarts() {
        let (device, soft) = SoftDevice::device_default();
        soft.set_query_value(3);
        let queue = SubmissionQueue::new(&device).unwrap();
        let mut list = queue.get_command_list().unwrap();
        let mut manager = QueryManager::new(&device);

        let query = Query::new(QueryType::Occlusion { precise: true });
        manager.enable(&mut list, &query).unwrap();
        //not active yet, so no Vulkan query
        assert_eq!(query.handle_count(), 0);

        manager.begin_queries(&mut list, QueryKind::Occlusion).unwrap();
        manager.end_queries(&mut list, QueryKind::Occlusion);
        manager.begin_queries(&mut list, QueryKind::Occlusion).unwrap();
        manager.disable(&mut list, &query).unwrap();
        manager.end_queries(&mut list, QueryKind::Occlusion);
        assert_eq!(query.handle_count(), 2);
        assert_eq!(query.status(), QueryStatus::Pending);

        let status = queue.submit(list).unwrap();
        queue.wait_for(status.ticket()).unwrap();

        assert_eq!(
            query.status(),
            QueryStatus::Available(QueryData::Occlusion { samples_passed: 6 })
        );
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn query_is_pending_until_every_list_completed() {
        let (device, soft) = SoftDevice::device_default();
        soft.set_manual_completion(true);
        let queue = SubmissionQueue::new(&device).unwrap();
        let mut manager = QueryManager::new(&device);
        let query = Query::new(QueryType::PipelineStatistics);

        let mut list = queue.get_command_list().unwrap();
        manager.begin_queries(&mut list, QueryKind::PipelineStatistics).unwrap();
        manager.enable(&mut list, &query).unwrap();
        manager.end_queries(&mut list, QueryKind::PipelineStatistics);
        let first = queue.submit(list).unwrap();

        let mut list = queue.get_command_list().unwrap();
        manager.begin_queries(&mut list, QueryKind::PipelineStatistics).unwrap();
        manager.disable(&mut list, &query).unwrap();
        manager.end_queries(&mut list, QueryKind::PipelineStatistics);
        let second = queue.submit(list).unwrap();
        assert_eq!(first.wait(), vk::Result::SUCCESS);
        assert_eq!(second.wait(), vk::Result::SUCCESS);

        assert!(soft.complete_next());
        queue.wait_for(first.ticket()).unwrap();
        assert_eq!(query.status(), QueryStatus::Pending);

        assert!(soft.complete_next());
        queue.wait_for(second.ticket()).unwrap();
        match query.status() {
            QueryStatus::Available(QueryData::PipelineStatistics(stats)) => {
                assert_eq!(stats.vs_invocations, 2);
                assert_eq!(stats.cs_invocations, 2);
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn timestamps_do_not_accumulate() {
        let (device, soft) = SoftDevice::device_default();
        soft.set_query_value(5);
        let queue = SubmissionQueue::new(&device).unwrap();
        let mut manager = QueryManager::new(&device);
        let query = Query::new(QueryType::Timestamp);

        let mut list = queue.get_command_list().unwrap();
        manager.write_timestamp(&mut list, &query).unwrap();
        manager.write_timestamp(&mut list, &query).unwrap();
        assert_eq!(query.handle_count(), 1);

        let status = queue.submit(list).unwrap();
        queue.wait_for(status.ticket()).unwrap();

        //second slot of the pool, see SoftDevice::query_results
        assert_eq!(query.status(), QueryStatus::Available(QueryData::Timestamp { time: 10 }));
    }
}
