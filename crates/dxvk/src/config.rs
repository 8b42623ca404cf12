use bitflags::bitflags;

bitflags! {
    ///Barrier policy bits. Each bit trades strict ordering for throughput and is only valid under guarantees
    /// the caller has to give, therefore none of them is enabled by default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BarrierControl: u32 {
        ///Skip barriers between back-to-back storage writes of compute work, as long as every pending
        /// write originates from the compute or indirect-argument stages.
        const IGNORE_WRITE_AFTER_WRITE = 1 << 0;
        ///Skip hazard checks for storage resources written by graphics pipelines.
        const IGNORE_GRAPHICS_BARRIERS = 1 << 1;
    }
}

///How descriptor sets are written.
///
/// Both modes are functionally identical. Update templates are faster on some 32-bit hosts while plain
/// writes are faster on some 64-bit drivers, so the default is chosen per pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorUpdateMode {
    Writes,
    Templates,
}

impl Default for DescriptorUpdateMode {
    fn default() -> Self {
        if cfg!(target_pointer_width = "32") {
            DescriptorUpdateMode::Templates
        } else {
            DescriptorUpdateMode::Writes
        }
    }
}

///Runtime options of the core. Created by the client API layer, usually from its own configuration source.
#[derive(Debug, Clone)]
pub struct Options {
    pub barrier_control: BarrierControl,
    ///Maximum number of command lists that may be queued or in flight before [submit](crate) blocks.
    pub max_queued_command_buffers: usize,
    pub descriptor_update_mode: DescriptorUpdateMode,
    ///If set, and the device uses descriptor buffers, uniform buffer descriptors are written on a worker thread.
    pub descriptor_worker: bool,
    ///Largest buffer that may be replaced by fresh storage instead of being updated in place.
    pub max_buffer_discard_size: ash::vk::DeviceSize,
    ///Number of descriptor sets each descriptor pool is sized for.
    pub descriptor_pool_sets: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            barrier_control: BarrierControl::empty(),
            max_queued_command_buffers: 32,
            descriptor_update_mode: DescriptorUpdateMode::default(),
            descriptor_worker: true,
            max_buffer_discard_size: 1 << 16,
            descriptor_pool_sets: 1024,
        }
    }
}

impl Options {
    pub fn with_barrier_control(mut self, control: BarrierControl) -> Self {
        self.barrier_control = control;
        self
    }

    pub fn with_max_queued_command_buffers(mut self, count: usize) -> Self {
        //a window of zero would deadlock the first submission
        self.max_queued_command_buffers = count.max(1);
        self
    }

    pub fn with_descriptor_update_mode(mut self, mode: DescriptorUpdateMode) -> Self {
        self.descriptor_update_mode = mode;
        self
    }

    pub fn with_descriptor_worker(mut self, enabled: bool) -> Self {
        self.descriptor_worker = enabled;
        self
    }

    pub fn with_max_buffer_discard_size(mut self, size: ash::vk::DeviceSize) -> Self {
        self.max_buffer_discard_size = size;
        self
    }

    pub fn with_descriptor_pool_sets(mut self, sets: u32) -> Self {
        self.descriptor_pool_sets = sets.max(1);
        self
    }

    ///Allows changing `self` builder style
    pub fn with(mut self, mut mapping: impl FnMut(&mut Options)) -> Self {
        mapping(&mut self);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let opt = Options::default();
        assert!(opt.barrier_control.is_empty());
        assert_eq!(opt.max_queued_command_buffers, 32);
    }

    #[test]
    fn zero_window_is_clamped() {
        let opt = Options::default().with_max_queued_command_buffers(0);
        assert_eq!(opt.max_queued_command_buffers, 1);
    }
}
