use std::sync::Arc;

use dxvk::{
    ash::vk,
    device::{DescriptorInfo, Device},
    resources::Buffer,
};
use dxvk_commands::{CmdBuffer, CommandList};
use smallvec::SmallVec;

use crate::{
    DescriptorCopyWorker, DescriptorError, DescriptorHeap, DescriptorPoolSet, DescriptorUpdater, PipelineBindings,
    ResourceSlot, SetBindings, UniformDescriptor,
};

const EMPTY_SLOT: &ResourceSlot = &ResourceSlot::Empty;

type Infos = SmallVec<[DescriptorInfo; 8]>;

fn bind_point_index(bind_point: vk::PipelineBindPoint) -> usize {
    if bind_point == vk::PipelineBindPoint::COMPUTE { 1 } else { 0 }
}

fn set_bits(mask: u32) -> impl Iterator<Item = usize> {
    (0..32usize).filter(move |i| mask & (1 << i) != 0)
}

///Groups `(set, value)` pairs, sorted by set, into runs of consecutive set indices.
fn consecutive_runs<T: Copy>(items: &[(usize, T)]) -> SmallVec<[(u32, SmallVec<[T; 8]>); 4]> {
    let mut runs: SmallVec<[(u32, SmallVec<[T; 8]>); 4]> = SmallVec::new();
    for (set, value) in items {
        match runs.last_mut() {
            Some((first, values)) if *first as usize + values.len() == *set => values.push(*value),
            _ => {
                let mut values = SmallVec::new();
                values.push(*value);
                runs.push((*set as u32, values));
            }
        }
    }
    runs
}

///Last written content of one descriptor set.
#[derive(Default)]
struct SetShadow {
    layout_cookie: u64,
    infos: Infos,
    ///Host copy of the set data in the descriptor buffer model. Uniform buffers written by the worker are not included.
    bytes: Vec<u8>,
    set: vk::DescriptorSet,
    ///Heap offset of the set in the descriptor buffer model.
    offset: vk::DeviceSize,
    ///Set while `set` (or the heap allocation) may be reused within the current command list.
    valid: bool,
}

#[derive(Default)]
struct BindPointState {
    bindings: Option<Arc<PipelineBindings>>,
    dirty: u32,
    shadows: Vec<SetShadow>,
}

impl BindPointState {
    fn invalidate(&mut self) {
        for shadow in self.shadows.iter_mut() {
            shadow.valid = false;
        }
        self.dirty = self.bindings.as_ref().map(|b| b.non_empty_sets()).unwrap_or(0);
    }
}

///Resources bound to slots and the descriptor sets derived from them, per bind point.
///
/// Binding a resource only marks the sets reading that slot dirty. [commit](Self::commit) resolves every dirty set and
/// compares the result against the last written content. Sets whose content did not change are rebound as they are,
/// changed sets are written to fresh memory. Set handles and heap offsets are only reused within one command list,
/// [begin_list](Self::begin_list) forces every set to be written again.
pub struct DescriptorState {
    device: Arc<Device>,
    slots: Vec<ResourceSlot>,
    updater: DescriptorUpdater,
    pools: DescriptorPoolSet,
    heap: Option<DescriptorHeap>,
    worker: Option<DescriptorCopyWorker>,
    bind_points: [BindPointState; 2],
    sets_written: u64,
}

impl DescriptorState {
    ///Creates the descriptor state. In the descriptor buffer model a heap is created, and if enabled in the options, the
    /// copy worker is started.
    pub fn new(device: &Arc<Device>) -> Result<Self, DescriptorError> {
        let descriptor_buffer = device.features.descriptor_buffer;
        let heap = descriptor_buffer.then(|| DescriptorHeap::new(device, DescriptorHeap::DEFAULT_CHUNK_SIZE));
        let worker = if descriptor_buffer && device.options.descriptor_worker {
            Some(DescriptorCopyWorker::new(device)?)
        } else {
            None
        };

        Ok(DescriptorState {
            device: device.clone(),
            slots: Vec::new(),
            updater: DescriptorUpdater::new(device),
            pools: DescriptorPoolSet::new(device),
            heap,
            worker,
            bind_points: Default::default(),
            sets_written: 0,
        })
    }

    ///Binds `resource` to `slot`.
    pub fn bind(&mut self, slot: u32, resource: ResourceSlot) {
        let index = slot as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, ResourceSlot::Empty);
        }
        self.slots[index] = resource;
        self.invalidate_slot(slot);
    }

    ///Marks every set reading `slot` dirty, for instance because the storage of the bound buffer was replaced.
    pub fn invalidate_slot(&mut self, slot: u32) {
        for state in self.bind_points.iter_mut() {
            if let Some(bindings) = &state.bindings {
                state.dirty |= bindings.sets_using_slot(slot);
            }
        }
    }

    ///Marks every set reading a slot that references `buffer` dirty.
    pub fn invalidate_buffer(&mut self, buffer: &Buffer) {
        let slots: SmallVec<[u32; 8]> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.references_buffer(buffer))
            .map(|(index, _)| index as u32)
            .collect();
        for slot in slots {
            self.invalidate_slot(slot);
        }
    }

    pub fn slot(&self, slot: u32) -> &ResourceSlot {
        self.slots.get(slot as usize).unwrap_or(EMPTY_SLOT)
    }

    ///Switches the resource interface of `bind_point`. Every set is rebound on the next commit.
    pub fn set_bindings(&mut self, bind_point: vk::PipelineBindPoint, bindings: &Arc<PipelineBindings>) {
        let state = &mut self.bind_points[bind_point_index(bind_point)];
        if state.bindings.as_ref().map(|b| b.cookie()) == Some(bindings.cookie()) {
            return;
        }

        state.shadows.resize_with(bindings.set_count(), SetShadow::default);
        for (shadow, set) in state.shadows.iter_mut().zip(bindings.sets()) {
            if shadow.layout_cookie != set.layout.cookie() {
                *shadow = SetShadow {
                    layout_cookie: set.layout.cookie(),
                    ..Default::default()
                };
            }
        }
        state.dirty = bindings.non_empty_sets();
        state.bindings = Some(bindings.clone());
    }

    pub fn bindings(&self, bind_point: vk::PipelineBindPoint) -> Option<&Arc<PipelineBindings>> {
        self.bind_points[bind_point_index(bind_point)].bindings.as_ref()
    }

    ///Forgets everything bound to the previous command list.
    pub fn begin_list(&mut self) {
        for state in self.bind_points.iter_mut() {
            state.invalidate();
        }
        if let Some(heap) = &mut self.heap {
            heap.begin_list();
        }
    }

    pub fn dirty_sets(&self, bind_point: vk::PipelineBindPoint) -> u32 {
        let state = &self.bind_points[bind_point_index(bind_point)];
        state.dirty & state.bindings.as_ref().map(|b| b.non_empty_sets()).unwrap_or(0)
    }

    pub fn is_dirty(&self, bind_point: vk::PipelineBindPoint) -> bool {
        self.dirty_sets(bind_point) != 0
    }

    ///Number of descriptor sets written so far.
    pub fn sets_written(&self) -> u64 {
        self.sets_written
    }

    pub fn heap(&self) -> Option<&DescriptorHeap> {
        self.heap.as_ref()
    }

    ///Waits for the copy worker. Must be called before a command list that uses descriptors written by the worker is
    /// submitted.
    pub fn sync(&self) {
        if let Some(worker) = &self.worker {
            worker.sync();
        }
    }

    fn resolve_set(&self, list: &mut CommandList, set: &SetBindings) -> Result<Infos, DescriptorError> {
        let descriptor_buffer = self.heap.is_some();
        set.bindings
            .iter()
            .map(|b| self.slot(b.slot).resolve(b.ty, descriptor_buffer, list, b.access()))
            .collect()
    }

    ///Writes and binds every dirty set of `bind_point`. Tracks all referenced resources in `list`.
    pub fn commit(&mut self, list: &mut CommandList, bind_point: vk::PipelineBindPoint) -> Result<(), DescriptorError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let index = bind_point_index(bind_point);
        let Some(bindings) = self.bind_points[index].bindings.clone() else {
            return Ok(());
        };
        if self.dirty_sets(bind_point) == 0 {
            return Ok(());
        }

        if self.heap.is_some() {
            self.commit_heap(list, index, &bindings)?;
        } else {
            self.commit_sets(list, index, &bindings)?;
        }
        self.bind_points[index].dirty = 0;
        Ok(())
    }

    fn commit_sets(
        &mut self,
        list: &mut CommandList,
        index: usize,
        bindings: &PipelineBindings,
    ) -> Result<(), DescriptorError> {
        let dirty = self.bind_points[index].dirty & bindings.non_empty_sets();
        let mut handles: SmallVec<[(usize, vk::DescriptorSet); 8]> = SmallVec::new();

        for set_index in set_bits(dirty) {
            let Some(set) = bindings.set(set_index) else {
                continue;
            };
            let infos = self.resolve_set(list, set)?;

            let shadow = &mut self.bind_points[index].shadows[set_index];
            if !shadow.valid || shadow.infos != infos {
                let handle = self.pools.allocate(list, set.layout.inner)?;
                self.updater.write_set(handle, set, &infos);
                shadow.set = handle;
                shadow.infos = infos;
                shadow.valid = true;
                self.sets_written += 1;
            }
            handles.push((set_index, shadow.set));
        }
        self.updater.flush();

        let cb = list.cmd_buffer(CmdBuffer::Exec);
        for (first_set, sets) in consecutive_runs(&handles) {
            self.device
                .inner
                .cmd_bind_descriptor_sets(cb, bindings.bind_point, bindings.layout.inner, first_set, &sets);
        }
        Ok(())
    }

    fn commit_heap(
        &mut self,
        list: &mut CommandList,
        index: usize,
        bindings: &PipelineBindings,
    ) -> Result<(), DescriptorError> {
        let all_sets = bindings.non_empty_sets();
        let mut dirty = self.bind_points[index].dirty & all_sets;
        let mut offsets: SmallVec<[(usize, vk::DeviceSize); 8]> = SmallVec::new();

        //a chunk switch invalidates every offset into the old chunk, this happens at most once per commit
        'restart: for pass in 0..2 {
            offsets.clear();
            for set_index in set_bits(dirty) {
                let Some(set) = bindings.set(set_index) else {
                    continue;
                };
                let infos = self.resolve_set(list, set)?;

                let shadow = &self.bind_points[index].shadows[set_index];
                if shadow.valid && shadow.infos == infos {
                    offsets.push((set_index, shadow.offset));
                    continue;
                }

                let size = self.device.inner.descriptor_set_layout_size(set.layout.inner);
                let Some(heap) = self.heap.as_mut() else {
                    return Ok(());
                };
                let allocation = heap.allocate(list, size)?;
                if allocation.switched {
                    //the other bind point lives in the old chunk as well
                    self.bind_points[1 - index].invalidate();
                    if pass == 0 && (dirty != all_sets || !offsets.is_empty()) {
                        for shadow in self.bind_points[index].shadows.iter_mut() {
                            shadow.valid = false;
                        }
                        dirty = all_sets;
                        continue 'restart;
                    }
                    if !offsets.is_empty() {
                        #[cfg(feature = "logging")]
                        log::warn!("Descriptor sets of one pipeline exceed a heap chunk");
                    }
                }

                self.write_heap_set(index, set_index, set, &infos, &allocation)?;
                let shadow = &mut self.bind_points[index].shadows[set_index];
                shadow.infos = infos;
                shadow.offset = allocation.offset;
                shadow.valid = true;
                offsets.push((set_index, allocation.offset));
                self.sets_written += 1;
            }
            break;
        }

        if let Some(heap) = self.heap.as_mut() {
            heap.bind(list);
        }
        let cb = list.cmd_buffer(CmdBuffer::Exec);
        for (first_set, set_offsets) in consecutive_runs(&offsets) {
            let indices = SmallVec::<[u32; 8]>::from_elem(0, set_offsets.len());
            self.device.inner.cmd_set_descriptor_buffer_offsets(
                cb,
                bindings.bind_point,
                bindings.layout.inner,
                first_set,
                &indices,
                &set_offsets,
            );
        }
        Ok(())
    }

    ///Generates the data of one set into its shadow, regenerating only descriptors that changed, and copies it into
    /// the heap. Uniform buffers are handed to the worker if there is one.
    fn write_heap_set(
        &mut self,
        index: usize,
        set_index: usize,
        set: &SetBindings,
        infos: &Infos,
        allocation: &crate::HeapAllocation,
    ) -> Result<(), DescriptorError> {
        let device = self.device.clone();
        let size = device.inner.descriptor_set_layout_size(set.layout.inner) as usize;
        let use_worker = self.worker.is_some();
        let shadow = &mut self.bind_points[index].shadows[set_index];

        let regenerate_all = shadow.bytes.len() != size || shadow.infos.len() != infos.len();
        if regenerate_all {
            shadow.bytes.clear();
            shadow.bytes.resize(size, 0);
        }

        let mut uniforms: SmallVec<[UniformDescriptor; 8]> = SmallVec::new();
        for (i, (binding, info)) in set.bindings.iter().zip(infos.iter()).enumerate() {
            let offset = device
                .inner
                .descriptor_set_layout_binding_offset(set.layout.inner, binding.binding);

            if use_worker && binding.is_uniform_buffer() {
                let (address, range) = match info {
                    DescriptorInfo::Address { address, range } => (*address, *range),
                    _ => (0, 0),
                };
                uniforms.push(UniformDescriptor {
                    dst_offset: allocation.offset + offset,
                    address,
                    range,
                });
                continue;
            }

            if !regenerate_all && shadow.infos.get(i) == Some(info) {
                continue;
            }
            let descriptor_size = device.limits.descriptor_sizes.get(binding.ty);
            let range = offset as usize..offset as usize + descriptor_size;
            match shadow.bytes.get_mut(range) {
                Some(dst) => device.inner.get_descriptor(binding.ty, info, dst),
                None => {
                    #[cfg(feature = "logging")]
                    log::error!("Descriptor of binding {} exceeds set size {}", binding.binding, size);
                }
            }
        }

        allocation.storage.write(allocation.offset, &shadow.bytes)?;
        if let Some(worker) = &self.worker {
            if !uniforms.is_empty() {
                worker.push(&allocation.storage, &uniforms)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{
        DescriptorUpdateMode, Options,
        device::DeviceFeatures,
        resources::{BufDesc, Buffer, BufferSlice},
        testing::{Command, SoftDevice},
    };

    use super::*;
    use crate::BindingInfo;

    const GRAPHICS: vk::PipelineBindPoint = vk::PipelineBindPoint::GRAPHICS;

    fn pipeline(device: &Arc<Device>) -> Arc<PipelineBindings> {
        let bindings = [
            BindingInfo::new(0, 0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX),
            BindingInfo::new(0, 1, 1, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::FRAGMENT),
            BindingInfo::new(1, 0, 2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::FRAGMENT).read_only(),
        ];
        PipelineBindings::new(device, GRAPHICS, &bindings, None).unwrap()
    }

    fn buffer(device: &Arc<Device>) -> Arc<Buffer> {
        let desc = BufDesc::new(
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        Buffer::new(device, desc).unwrap()
    }

    fn new_list(device: &Arc<Device>, state: &mut DescriptorState) -> CommandList {
        let mut list = CommandList::new(device).unwrap();
        list.begin_recording().unwrap();
        state.begin_list();
        list
    }

    fn set_binds(soft: &SoftDevice, list: &mut CommandList) -> Vec<(u32, usize)> {
        soft.commands(list.cmd_buffer(CmdBuffer::Exec))
            .into_iter()
            .filter_map(|c| match c {
                Command::BindDescriptorSets { first_set, sets, .. } => Some((first_set, sets.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unchanged_sets_are_rebound_but_not_rewritten() {
        let options = Options::default().with_descriptor_update_mode(DescriptorUpdateMode::Writes);
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let mut state = DescriptorState::new(&device).unwrap();
        let uniforms = buffer(&device);
        let storage = buffer(&device);

        state.bind(0, ResourceSlot::Buffer(BufferSlice::whole(uniforms.clone())));
        state.bind(2, ResourceSlot::Buffer(BufferSlice::whole(storage.clone())));
        state.set_bindings(GRAPHICS, &pipeline(&device));
        assert_eq!(state.dirty_sets(GRAPHICS), 0b11);

        let mut list = new_list(&device, &mut state);
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(state.sets_written(), 2);
        assert_eq!(soft.descriptor_write_calls(), 1);
        assert_eq!(set_binds(&soft, &mut list), vec![(0, 2)]);
        assert!(!state.is_dirty(GRAPHICS));

        //clean state, nothing to do
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(set_binds(&soft, &mut list).len(), 1);

        //same resource again, set 0 is rebound as it is
        state.bind(0, ResourceSlot::Buffer(BufferSlice::whole(uniforms.clone())));
        assert_eq!(state.dirty_sets(GRAPHICS), 0b01);
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(state.sets_written(), 2);
        assert_eq!(soft.descriptor_write_calls(), 1);
        assert_eq!(set_binds(&soft, &mut list), vec![(0, 2), (0, 1)]);

        //different range, set 0 is written again
        state.bind(0, ResourceSlot::Buffer(BufferSlice::new(uniforms.clone(), 64, 64)));
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(state.sets_written(), 3);
        assert_eq!(soft.descriptor_write_calls(), 2);
        let last = soft.descriptor_writes()[3..].to_vec();
        assert_eq!(last.len(), 2);
        assert_eq!(
            last[0].info,
            DescriptorInfo::Buffer {
                buffer: uniforms.handle(),
                offset: 64,
                range: 64
            }
        );
    }

    #[test]
    fn new_lists_rewrite_and_track_again() {
        let (device, soft) = SoftDevice::device_default();
        let mut state = DescriptorState::new(&device).unwrap();
        let uniforms = buffer(&device);
        state.bind(0, ResourceSlot::Buffer(BufferSlice::whole(uniforms.clone())));
        state.set_bindings(GRAPHICS, &pipeline(&device));

        let mut first = new_list(&device, &mut state);
        state.commit(&mut first, GRAPHICS).unwrap();
        assert!(first.tracked_resources().access(&uniforms).is_some());

        let mut second = new_list(&device, &mut state);
        assert_eq!(state.dirty_sets(GRAPHICS), 0b11);
        state.commit(&mut second, GRAPHICS).unwrap();
        assert_eq!(state.sets_written(), 4);
        assert!(second.tracked_resources().access(&uniforms).is_some());
        assert_eq!(set_binds(&soft, &mut second), vec![(0, 2)]);
    }

    #[test]
    fn renamed_buffers_are_written_again() {
        let (device, soft) = SoftDevice::device_default();
        let mut state = DescriptorState::new(&device).unwrap();
        let uniforms = buffer(&device);
        state.bind(0, ResourceSlot::Buffer(BufferSlice::whole(uniforms.clone())));
        state.set_bindings(GRAPHICS, &pipeline(&device));

        let mut list = new_list(&device, &mut state);
        state.commit(&mut list, GRAPHICS).unwrap();
        let written = state.sets_written();

        let old = uniforms.assign_storage(uniforms.allocate_storage().unwrap());
        state.invalidate_slot(0);
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(state.sets_written(), written + 1);

        let write = soft
            .descriptor_writes()
            .into_iter()
            .rev()
            .find(|w| w.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert!(matches!(write.info, DescriptorInfo::Buffer { buffer, .. } if buffer == uniforms.handle()));
        assert_ne!(old.handle(), uniforms.handle());
    }

    #[test]
    fn template_mode_uses_templates() {
        let options = Options::default().with_descriptor_update_mode(DescriptorUpdateMode::Templates);
        let (device, soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let mut state = DescriptorState::new(&device).unwrap();
        state.set_bindings(GRAPHICS, &pipeline(&device));

        let mut list = new_list(&device, &mut state);
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(soft.template_updates(), 2);
        assert_eq!(soft.descriptor_write_calls(), 0);
    }

    fn heap_setup(worker: bool) -> (Arc<Device>, Arc<SoftDevice>, DescriptorState, Arc<Buffer>) {
        let features = DeviceFeatures {
            descriptor_buffer: true,
            ..Default::default()
        };
        let options = Options::default().with_descriptor_worker(worker);
        let (device, soft) = SoftDevice::device(features, options, false);
        let mut state = DescriptorState::new(&device).unwrap();
        let uniforms = buffer(&device);
        state.bind(0, ResourceSlot::Buffer(BufferSlice::new(uniforms.clone(), 0, 128)));
        state.bind(2, ResourceSlot::Buffer(BufferSlice::new(uniforms.clone(), 128, 64)));
        state.set_bindings(GRAPHICS, &pipeline(&device));
        (device, soft, state, uniforms)
    }

    fn check_heap(soft: &SoftDevice, state: &DescriptorState, list: &mut CommandList, uniforms: &Buffer) {
        let commands = soft.commands(list.cmd_buffer(CmdBuffer::Exec));
        assert!(matches!(commands[0], Command::BindDescriptorBuffers(ref b) if b.len() == 1));
        let offsets = commands
            .iter()
            .find_map(|c| match c {
                Command::SetDescriptorBufferOffsets { first_set, offsets, .. } => Some((*first_set, offsets.clone())),
                _ => None,
            })
            .unwrap();
        //set 0 holds two descriptors, set 1 starts at the next aligned offset
        assert_eq!(offsets, (0, vec![0, 64]));

        let chunk = state.heap().unwrap().current_chunk().unwrap();
        let bytes = soft.buffer_contents(chunk.handle());
        let address = uniforms.slice_handle(0, 128).address;
        assert_ne!(address, 0);
        assert_eq!(&bytes[0..8], &address.to_le_bytes());
        assert_eq!(&bytes[8..16], &128u64.to_le_bytes());
        //the sampled image slot is empty
        assert!(bytes[16..32].iter().all(|b| *b == 0));
        assert_eq!(&bytes[64..72], &(address + 128).to_le_bytes());
        assert_eq!(&bytes[72..80], &64u64.to_le_bytes());
    }

    #[test]
    fn descriptor_buffer_sets_are_written_into_the_heap() {
        let (device, soft, mut state, uniforms) = heap_setup(false);
        let mut list = new_list(&device, &mut state);
        state.commit(&mut list, GRAPHICS).unwrap();
        check_heap(&soft, &state, &mut list, &uniforms);
        assert_eq!(soft.descriptor_write_calls(), 0);

        //unchanged sets keep their offsets
        state.bind(2, ResourceSlot::Buffer(BufferSlice::new(uniforms.clone(), 128, 64)));
        state.commit(&mut list, GRAPHICS).unwrap();
        assert_eq!(state.sets_written(), 2);
        let last = soft
            .commands(list.cmd_buffer(CmdBuffer::Exec))
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Command::SetDescriptorBufferOffsets { first_set, offsets, .. } => Some((first_set, offsets)),
                _ => None,
            })
            .unwrap();
        assert_eq!(last, (1, vec![64]));
    }

    #[test]
    fn uniform_descriptors_are_written_by_the_worker() {
        let (device, soft, mut state, uniforms) = heap_setup(true);
        let mut list = new_list(&device, &mut state);
        state.commit(&mut list, GRAPHICS).unwrap();
        state.sync();
        check_heap(&soft, &state, &mut list, &uniforms);
    }
}
