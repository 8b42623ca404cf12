//! # DXVK-Context
//!
//! The state tracking [Context] records draws, dispatches, copies, clears and queries into
//! [CommandList](dxvk_commands::CommandList)s.
//!
//! Callers bind state (render targets, shaders, resources, vertex buffers, fixed function state) without regard for
//! when it reaches the GPU. Right before a draw or dispatch the context resolves everything that changed:
//!
//! - The render pass is started, resumed or ended. Clears that were requested earlier are folded into the attachment
//!   load operations where possible.
//! - Pipelines are looked up through the [PipelineManager], descriptor sets are rewritten through the
//!   [DescriptorState](dxvk_descriptor::DescriptorState).
//! - Barriers are only emitted if a resource is actually accessed in a conflicting way since the last barrier.
//!
//! Transfer operations (buffer and image copies, updates, clears, blits and resolves) end the render pass on their own and
//! pick the cheapest way the device supports. Blits and resolves the device can not execute natively fall back to
//! render pass based implementations.

mod clear;
pub use clear::{ClearInsert, DeferredClear, DeferredClears, MAX_DEFERRED_CLEARS};

mod commit;

mod context;
pub use context::Context;

mod error;
pub use error::ContextError;

mod framebuffer;
pub use framebuffer::{
    Attachment, AttachmentIndex, COLOR_ATTACHMENT_ACCESS, COLOR_ATTACHMENT_STAGES, DEPTH_ATTACHMENT_ACCESS,
    DEPTH_ATTACHMENT_STAGES, MAX_RENDER_TARGETS, RenderTargets, attachment_layout, is_depth_stencil, writable_aspects,
};

mod meta;
pub use meta::BlitRegion;

mod pipeline;
pub use pipeline::{
    BlendAttachment, DepthStencilState, GraphicsPipelineState, GraphicsShaders, InputAssemblyState, MAX_SPEC_CONSTANTS,
    MetaBlitKey, MultisampleState, Pipeline, PipelineFlags, PipelineManager, RasterizerState, RenderTargetFormats, Shader,
    ShaderFlags, SpecConstants, StencilFace, VertexAttribute, VertexBinding,
};

mod query;
pub use query::{
    PipelineStatistics, QUERY_POOL_SIZE, Query, QueryData, QueryHandle, QueryKind, QueryManager, QueryStatus, QueryType,
};

mod render_pass;

mod state;
pub use state::{
    ContextFlags, DepthBias, DepthBounds, DynamicState, IndexBufferBinding, MAX_PUSH_CONSTANT_SIZE, MAX_VERTEX_BINDINGS,
    MAX_XFB_BUFFERS, VertexBufferBinding, XfbBufferBinding,
};

mod transfer;

#[cfg(test)]
mod testing;
