//! # DXVK-Commands
//!
//! Everything between "a context wants to record something" and "the GPU finished executing it":
//!
//! - [CommandList]: one submittable unit of work. Owns an init, an exec and a transfer command buffer, the
//!   [BarrierSet] of each of them, and a [ResourceTracker] that keeps every used resource alive until the GPU is done.
//! - [BarrierSet]: accumulates pending barriers and answers whether an access to a buffer or image range has to wait
//!   for a previous one.
//! - [SubmissionQueue]: hands command lists to a submit thread and a finish thread. The finish thread waits for
//!   completion, fires signals, releases tracked resources and recycles the list. The number of lists that may be queued or
//!   in flight is bounded, [submit](SubmissionQueue::submit) blocks once the bound is reached.
//!
//! Cross-submission hazards are not tracked. If two command lists access the same resource in conflicting ways the
//! caller has to order them via semaphores.

mod barrier;
pub use barrier::{Access, BarrierSet};

mod command_list;
pub use command_list::{CmdBuffer, CmdBufferUsage, CommandList};

mod error;
pub use error::{CommandError, QueueError};

mod queue;
pub use queue::{SubmissionQueue, SubmitStatus};

mod tracker;
pub use tracker::{ResourceTracker, SignalTracker};
