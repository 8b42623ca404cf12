//! # DXVK-Descriptor
//!
//! Turns "resource X is bound to slot N" into descriptors the GPU can consume.
//!
//! Pipelines describe their resource interface through [PipelineBindings], a list of [BindingInfo]s that map a
//! descriptor binding to a context-wide resource slot. The [DescriptorState] keeps the resources currently bound to
//! each slot and, before a draw or dispatch, rewrites exactly the descriptor sets whose content changed since they were
//! last written.
//!
//! Two descriptor models are supported:
//!
//! - Classic descriptor sets, allocated from self growing [DescriptorPoolSet]s and written either with batched
//!   `vkUpdateDescriptorSets` calls or with update templates (see [DescriptorUpdater]).
//! - Descriptor buffers. Set data is written into host visible [DescriptorHeap] chunks. Uniform buffer descriptors can
//!   be generated on a background [DescriptorCopyWorker].
//!
//! Pools and heap chunks are handed to the command list that used them last and are recycled once that list completed.

mod binding;
pub use binding::{BindingInfo, PipelineBindings, ResourceSlot, SetBindings, shader_stages_to_pipeline};

mod error;
pub use error::DescriptorError;

mod heap;
pub use heap::{DescriptorHeap, HeapAllocation};

mod pool;
pub use pool::{DescriptorPool, DescriptorPoolSet};

mod state;
pub use state::DescriptorState;

mod update;
pub use update::DescriptorUpdater;

mod worker;
pub use worker::{DescriptorCopyWorker, UniformDescriptor};
