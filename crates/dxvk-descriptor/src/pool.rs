use std::sync::Arc;

use dxvk::{ash::vk, device::Device};
use dxvk_commands::CommandList;
use parking_lot::Mutex;

use crate::DescriptorError;

///Descriptors reserved per set and descriptor type. Pools are sized for the average set, not the worst case.
const DESCRIPTORS_PER_SET: [(vk::DescriptorType, u32); 8] = [
    (vk::DescriptorType::SAMPLER, 2),
    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
    (vk::DescriptorType::SAMPLED_IMAGE, 4),
    (vk::DescriptorType::STORAGE_IMAGE, 1),
    (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1),
    (vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1),
    (vk::DescriptorType::UNIFORM_BUFFER, 2),
    (vk::DescriptorType::STORAGE_BUFFER, 2),
];

///Single Vulkan descriptor pool. Destroyed on drop.
pub struct DescriptorPool {
    pub inner: vk::DescriptorPool,
    pub device: Arc<Device>,
    pub max_sets: u32,
}

impl DescriptorPool {
    pub fn new(device: &Arc<Device>, max_sets: u32) -> Result<Self, DescriptorError> {
        let sizes = DESCRIPTORS_PER_SET.map(|(ty, count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: count * max_sets,
        });
        let inner = device.inner.create_descriptor_pool(max_sets, &sizes)?;
        Ok(DescriptorPool {
            inner,
            device: device.clone(),
            max_sets,
        })
    }

    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet, vk::Result> {
        self.device.inner.allocate_descriptor_set(self.inner, layout)
    }

    ///Frees all sets of the pool at once.
    pub fn reset(&self) -> Result<(), vk::Result> {
        self.device.inner.reset_descriptor_pool(self.inner)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.inner.destroy_descriptor_pool(self.inner);
    }
}

///Self growing set of descriptor pools.
///
/// Sets are allocated from the current pool until it runs out of memory. The exhausted pool is then handed to the
/// command list that allocated from it last, and returns to the free list once that list completed. Since command lists
/// complete in submission order, every earlier user of the pool is done at that point as well.
pub struct DescriptorPoolSet {
    device: Arc<Device>,
    current: Option<DescriptorPool>,
    free: Arc<Mutex<Vec<DescriptorPool>>>,
    created: usize,
}

impl DescriptorPoolSet {
    pub fn new(device: &Arc<Device>) -> Self {
        DescriptorPoolSet {
            device: device.clone(),
            current: None,
            free: Arc::new(Mutex::new(Vec::new())),
            created: 0,
        }
    }

    ///Allocates a set with `layout`. Grows the pool set if needed.
    pub fn allocate(
        &mut self,
        list: &mut CommandList,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, DescriptorError> {
        //a fresh pool always has room for at least one set
        for _ in 0..2 {
            let pool = match self.current.take() {
                Some(pool) => pool,
                None => self.next_pool()?,
            };
            match pool.allocate(layout) {
                Ok(set) => {
                    self.current = Some(pool);
                    return Ok(set);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                    self.retire(list, pool);
                }
                Err(e) => {
                    self.current = Some(pool);
                    return Err(e.into());
                }
            }
        }
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into())
    }

    fn next_pool(&mut self) -> Result<DescriptorPool, DescriptorError> {
        if let Some(pool) = self.free.lock().pop() {
            return Ok(pool);
        }
        self.created += 1;
        #[cfg(feature = "logging")]
        log::debug!("Creating descriptor pool #{}", self.created);
        DescriptorPool::new(&self.device, self.device.options.descriptor_pool_sets)
    }

    fn retire(&mut self, list: &mut CommandList, pool: DescriptorPool) {
        let free = self.free.clone();
        list.on_reset(move || match pool.reset() {
            Ok(()) => free.lock().push(pool),
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Failed to reset descriptor pool: {}", _e);
            }
        });
    }

    ///Number of pools created so far.
    pub fn created_pools(&self) -> usize {
        self.created
    }

    ///Number of reset pools waiting for reuse.
    pub fn free_pools(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{Options, device::DeviceFeatures, testing::SoftDevice};

    use super::*;

    #[test]
    fn exhausted_pools_are_recycled_after_completion() {
        let options = Options::default().with_descriptor_pool_sets(2);
        let (device, _soft) = SoftDevice::device(DeviceFeatures::default(), options, false);
        let mut pools = DescriptorPoolSet::new(&device);
        let mut list = CommandList::new(&device).unwrap();
        list.begin_recording().unwrap();

        let layout = vk::DescriptorSetLayout::null();
        for _ in 0..5 {
            pools.allocate(&mut list, layout).unwrap();
        }
        assert_eq!(pools.created_pools(), 3);
        assert_eq!(pools.free_pools(), 0);

        list.end_recording().unwrap();
        list.submit().unwrap();
        list.synchronize().unwrap();
        list.reset();
        assert_eq!(pools.free_pools(), 2);

        //the recycled pools are used before new ones are created
        list.begin_recording().unwrap();
        for _ in 0..5 {
            pools.allocate(&mut list, layout).unwrap();
        }
        assert_eq!(pools.created_pools(), 3);
    }
}
