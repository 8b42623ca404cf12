//! # DXVK
//!
//! Base crate of the command-stream core. It provides everything the higher level crates need to talk to the GPU
//! without knowing *how* Vulkan is reached:
//!
//! - The [Device](device::Device), which bundles the [RawDevice](device::RawDevice) seam with the capabilities negotiated
//!   by whoever created the Vulkan device (feature matrix, limits, queues) and the core's [Options].
//! - Resource wrappers ([Buffer](resources::Buffer), [Image](resources::Image), views, samplers, query pools, layouts). Those are
//!   reference counted and destroy their Vulkan objects on drop. Keeping an `Arc` alive therefore keeps the GPU object alive,
//!   which is what command lists rely on to extend lifetimes across asynchronous execution.
//! - Synchronisation primitives ([Fence](sync::Fence), timeline [Semaphore](sync::Semaphore)) and the bounded [Ring](sync::Ring)
//!   used for cross-thread hand-off.
//!
//! Device and adapter negotiation, the swapchain and the static format tables of a full driver live outside of this
//! crate. The [format] module only carries the handful of properties the core consumes.
//!
//! With the `testing` feature enabled the [testing] module exposes a software device that records commands and
//! executes transfer operations on host memory.

pub use ash;

mod config;
pub use config::{BarrierControl, DescriptorUpdateMode, Options};

///The device seam, device capabilities and queue handles.
pub mod device;

mod error;
pub use error::{DeviceError, DxvkError, ResourceError};

///Minimal format property lookup.
pub mod format;

///Reference counted GPU resources.
pub mod resources;

///Vulkan synchronisation primitives and cross-thread queues.
pub mod sync;

///Range, extent and identity helpers shared by all crates.
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
