use std::sync::Arc;

use ash::vk;

use crate::{DeviceError, device::Device};

///Vulkan query pool.
///
/// In generally there are [multiple](https://registry.khronos.org/vulkan/specs/1.3-extensions/html/vkspec.html#queries)
/// types of queries. The core uses occlusion, pipeline statistics, transform feedback stream and timestamp queries.
pub struct QueryPool {
    pub inner: vk::QueryPool,
    pub ty: vk::QueryType,
    pub statistics: vk::QueryPipelineStatisticFlags,
    pub device: Arc<Device>,
    //NOTE hiding since changing that would make the struct invalid
    pub(crate) size: u32,
}

impl QueryPool {
    pub fn new(
        device: &Arc<Device>,
        ty: vk::QueryType,
        size: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> Result<Arc<Self>, DeviceError> {
        let inner = device.inner.create_query_pool(ty, size, statistics)?;
        Ok(Arc::new(QueryPool {
            inner,
            ty,
            statistics,
            device: device.clone(),
            size,
        }))
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    ///Number of 64bit values a single query of this pool produces.
    pub fn value_count(&self) -> usize {
        match self.ty {
            vk::QueryType::PIPELINE_STATISTICS => self.statistics.as_raw().count_ones() as usize,
            //primitives written + primitives needed
            vk::QueryType::TRANSFORM_FEEDBACK_STREAM_EXT => 2,
            _ => 1,
        }
    }

    ///Reads the results of `query` into `dst`. Returns `Ok(false)` if the results are not yet available.
    ///
    /// `dst` must hold at least [value_count](Self::value_count) elements.
    pub fn results(&self, query: u32, dst: &mut [u64]) -> Result<bool, vk::Result> {
        if query >= self.size {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let count = self.value_count().min(dst.len());
        self.device.inner.query_results(self.inner, query, &mut dst[..count])
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        self.device.inner.destroy_query_pool(self.inner);
    }
}
