use bitflags::bitflags;
use dxvk::{ash::vk, resources::BufferSlice};
use smallvec::SmallVec;

bitflags! {
    ///Render pass state and dirty state of the [Context](crate::Context).
    ///
    /// Setters only flip bits, the commit routines resolve them once before the next draw or dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u64 {
        ///Rendering is active on the exec command buffer.
        const RENDER_PASS_BOUND = 1 << 0;
        ///Rendering was ended, but the attachments are still in attachment layout.
        const RENDER_PASS_SUSPENDED = 1 << 1;
        ///Transform feedback is active.
        const XFB_ACTIVE = 1 << 2;
        ///A pipeline with side effects was used in the current render pass.
        const GP_RENDER_PASS_SIDE_EFFECTS = 1 << 3;
        ///The bound graphics pipeline writes storage resources.
        const GP_HAS_SIDE_EFFECTS = 1 << 4;
        ///Transform feedback counters hold a value that can be resumed from.
        const XFB_COUNTERS_VALID = 1 << 5;

        const GP_DIRTY_FRAMEBUFFER = 1 << 8;
        ///Shaders changed, the pipeline has to be looked up again.
        const GP_DIRTY_PIPELINE = 1 << 9;
        ///Non-dynamic state changed, the pipeline has to be looked up again.
        const GP_DIRTY_PIPELINE_STATE = 1 << 10;
        const GP_DIRTY_VERTEX_BUFFERS = 1 << 11;
        const GP_DIRTY_INDEX_BUFFER = 1 << 12;
        const GP_DIRTY_XFB_BUFFERS = 1 << 13;
        const GP_DIRTY_VIEWPORTS = 1 << 14;
        const GP_DIRTY_DEPTH_BIAS = 1 << 15;
        const GP_DIRTY_BLEND_CONSTANTS = 1 << 16;
        const GP_DIRTY_STENCIL_REF = 1 << 17;
        const GP_DIRTY_DEPTH_BOUNDS = 1 << 18;
        const GP_DIRTY_RASTERIZER = 1 << 19;
        const GP_DIRTY_DEPTH_STENCIL = 1 << 20;
        const GP_DIRTY_SAMPLE_MASK = 1 << 21;
        const GP_DIRTY_PUSH_CONSTANTS = 1 << 22;

        const CP_DIRTY_PIPELINE = 1 << 32;
        const CP_DIRTY_PUSH_CONSTANTS = 1 << 33;

        const GP_DIRTY_DYNAMIC_STATE = Self::GP_DIRTY_VIEWPORTS.bits()
            | Self::GP_DIRTY_DEPTH_BIAS.bits()
            | Self::GP_DIRTY_BLEND_CONSTANTS.bits()
            | Self::GP_DIRTY_STENCIL_REF.bits()
            | Self::GP_DIRTY_DEPTH_BOUNDS.bits()
            | Self::GP_DIRTY_RASTERIZER.bits()
            | Self::GP_DIRTY_DEPTH_STENCIL.bits()
            | Self::GP_DIRTY_SAMPLE_MASK.bits();

        ///Everything that has to be recorded again on a fresh command buffer.
        const GP_DIRTY_ALL = Self::GP_DIRTY_FRAMEBUFFER.bits()
            | Self::GP_DIRTY_PIPELINE.bits()
            | Self::GP_DIRTY_VERTEX_BUFFERS.bits()
            | Self::GP_DIRTY_INDEX_BUFFER.bits()
            | Self::GP_DIRTY_XFB_BUFFERS.bits()
            | Self::GP_DIRTY_DYNAMIC_STATE.bits()
            | Self::GP_DIRTY_PUSH_CONSTANTS.bits();

        const CP_DIRTY_ALL = Self::CP_DIRTY_PIPELINE.bits() | Self::CP_DIRTY_PUSH_CONSTANTS.bits();
    }
}

impl ContextFlags {
    ///Clears `flags`. Returns true if any of them was set.
    pub fn take(&mut self, flags: ContextFlags) -> bool {
        let set = self.intersects(flags);
        self.remove(flags);
        set
    }
}

pub const MAX_VERTEX_BINDINGS: usize = 32;
pub const MAX_XFB_BUFFERS: usize = 4;
pub const MAX_PUSH_CONSTANT_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub clamp: f32,
    pub slope: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthBounds {
    pub min: f32,
    pub max: f32,
}

impl Default for DepthBounds {
    fn default() -> Self {
        DepthBounds { min: 0.0, max: 1.0 }
    }
}

///State that is always set through dynamic state commands.
#[derive(Clone, Debug, Default)]
pub struct DynamicState {
    pub viewports: SmallVec<[vk::Viewport; 16]>,
    pub scissors: SmallVec<[vk::Rect2D; 16]>,
    pub depth_bias: DepthBias,
    pub blend_constants: [f32; 4],
    pub stencil_reference: u32,
    pub depth_bounds: DepthBounds,
}

#[derive(Clone)]
pub struct VertexBufferBinding {
    pub slice: BufferSlice,
    pub stride: u32,
}

#[derive(Clone)]
pub struct IndexBufferBinding {
    pub slice: BufferSlice,
    pub ty: vk::IndexType,
}

#[derive(Clone)]
pub struct XfbBufferBinding {
    pub slice: BufferSlice,
    ///Counter the byte offset is written to when capture is paused.
    pub counter: Option<BufferSlice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_only_requested_bits() {
        let mut flags = ContextFlags::GP_DIRTY_VIEWPORTS | ContextFlags::RENDER_PASS_BOUND;
        assert!(flags.take(ContextFlags::GP_DIRTY_DYNAMIC_STATE));
        assert!(!flags.take(ContextFlags::GP_DIRTY_DYNAMIC_STATE));
        assert_eq!(flags, ContextFlags::RENDER_PASS_BOUND);
    }
}
