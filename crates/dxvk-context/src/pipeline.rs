//! Pipeline state and the seam to whoever compiles pipelines.
//!
//! The context never compiles shaders. It collects the bound shaders and the non-dynamic state into a
//! [GraphicsPipelineState] and asks a [PipelineManager] for a matching pipeline before each draw (or
//! [SpecConstants] plus compute shader before each dispatch). Lookups are only repeated after the relevant
//! state changed.

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use bitflags::bitflags;
use dxvk::{ash::vk, device::DeviceFeatures, util::next_cookie};
use dxvk_descriptor::PipelineBindings;
use smallvec::SmallVec;

use crate::framebuffer::MAX_RENDER_TARGETS;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFlags: u32 {
        ///The shader writes transform feedback outputs.
        const HAS_TRANSFORM_FEEDBACK = 1 << 0;
    }
}

///SPIR-V module plus the metadata the context needs. Identity is the cookie.
#[derive(Debug)]
pub struct Shader {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    pub flags: ShaderFlags,
    cookie: u64,
}

impl Shader {
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u32>, flags: ShaderFlags) -> Arc<Self> {
        Arc::new(Shader {
            stage,
            code,
            flags,
            cookie: next_cookie(),
        })
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

///Shaders bound to the graphics stages.
#[derive(Clone, Default, Debug)]
pub struct GraphicsShaders {
    pub vs: Option<Arc<Shader>>,
    pub tcs: Option<Arc<Shader>>,
    pub tes: Option<Arc<Shader>>,
    pub gs: Option<Arc<Shader>>,
    pub fs: Option<Arc<Shader>>,
}

impl GraphicsShaders {
    ///Slot of a single graphics stage. `None` for non graphics stages.
    pub fn stage_mut(&mut self, stage: vk::ShaderStageFlags) -> Option<&mut Option<Arc<Shader>>> {
        match stage {
            vk::ShaderStageFlags::VERTEX => Some(&mut self.vs),
            vk::ShaderStageFlags::TESSELLATION_CONTROL => Some(&mut self.tcs),
            vk::ShaderStageFlags::TESSELLATION_EVALUATION => Some(&mut self.tes),
            vk::ShaderStageFlags::GEOMETRY => Some(&mut self.gs),
            vk::ShaderStageFlags::FRAGMENT => Some(&mut self.fs),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Shader>> {
        [&self.vs, &self.tcs, &self.tes, &self.gs, &self.fs]
            .into_iter()
            .flatten()
    }

    ///True if the last pre-rasterization stage writes transform feedback.
    pub fn has_transform_feedback(&self) -> bool {
        self.gs
            .as_ref()
            .or(self.tes.as_ref())
            .or(self.vs.as_ref())
            .is_some_and(|s| s.flags.contains(ShaderFlags::HAS_TRANSFORM_FEEDBACK))
    }

    ///Cookies of all stages, usable as lookup key.
    pub fn key(&self) -> [u64; 5] {
        [&self.vs, &self.tcs, &self.tes, &self.gs, &self.fs].map(|s| s.as_ref().map(|s| s.cookie()).unwrap_or(0))
    }
}

impl PartialEq for GraphicsShaders {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for GraphicsShaders {}

impl Hash for GraphicsShaders {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub patch_control_points: u32,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        InputAssemblyState {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            patch_control_points: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub input_rate: vk::VertexInputRate,
    pub divisor: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterizerState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_clip_enable: bool,
    pub depth_bias_enable: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        RasterizerState {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_clip_enable: true,
            depth_bias_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilFace {
    fn default() -> Self {
        StencilFace {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: !0,
            write_mask: !0,
        }
    }
}

impl StencilFace {
    pub fn to_vk(&self, reference: u32) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op,
            compare_mask: self.compare_mask,
            write_mask: self.write_mask,
            reference,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub depth_bounds_test: bool,
    pub stencil_test: bool,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        DepthStencilState {
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::ALWAYS,
            depth_bounds_test: false,
            stencil_test: false,
            front: StencilFace::default(),
            back: StencilFace::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MultisampleState {
    pub sample_count: vk::SampleCountFlags,
    pub sample_mask: u32,
    pub alpha_to_coverage: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        MultisampleState {
            sample_count: vk::SampleCountFlags::TYPE_1,
            sample_mask: !0,
            alpha_to_coverage: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendAttachment {
    pub enable: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

impl Default for BlendAttachment {
    fn default() -> Self {
        BlendAttachment {
            enable: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

///Formats of the bound render targets. Part of the pipeline key for dynamic rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetFormats {
    pub colors: [vk::Format; MAX_RENDER_TARGETS],
    pub depth: vk::Format,
    pub samples: vk::SampleCountFlags,
}

impl Default for RenderTargetFormats {
    fn default() -> Self {
        RenderTargetFormats {
            colors: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS],
            depth: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

pub const MAX_SPEC_CONSTANTS: usize = 12;

///Specialization constant values. Only ids whose bit is set in `mask` were ever written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpecConstants {
    pub values: [u32; MAX_SPEC_CONSTANTS],
    pub mask: u32,
}

impl SpecConstants {
    ///Sets constant `id`. Returns true if the value changed.
    pub fn set(&mut self, id: u32, value: u32) -> bool {
        let Some(slot) = self.values.get_mut(id as usize) else {
            #[cfg(feature = "logging")]
            log::warn!("Specialization constant {} out of range", id);
            return false;
        };

        let bit = 1 << id;
        if *slot == value && self.mask & bit != 0 {
            return false;
        }
        *slot = value;
        self.mask |= bit;
        true
    }
}

///All graphics state that is baked into the pipeline object.
///
/// Some of the state is dynamic on devices that support it. [key](Self::key) masks those parts out, so that
/// changing them does not cause a new lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineState {
    pub input_assembly: InputAssemblyState,
    pub attributes: SmallVec<[VertexAttribute; 8]>,
    pub bindings: SmallVec<[VertexBinding; 8]>,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub multisample: MultisampleState,
    pub blend: [BlendAttachment; MAX_RENDER_TARGETS],
    pub targets: RenderTargetFormats,
    pub spec_constants: SpecConstants,
}

impl GraphicsPipelineState {
    ///Copy of the state with everything that is set through dynamic state on `features` reset to defaults.
    pub fn key(&self, features: &DeviceFeatures) -> GraphicsPipelineState {
        let mut key = self.clone();
        if features.extended_dynamic_state {
            key.rasterizer.cull_mode = vk::CullModeFlags::NONE;
            key.rasterizer.front_face = vk::FrontFace::CLOCKWISE;
            key.depth_stencil = DepthStencilState::default();
        }
        if features.dynamic_sample_mask {
            key.multisample.sample_mask = 0;
        }
        key
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineFlags: u32 {
        ///The pipeline writes storage resources. Draws need barrier checks within a render pass.
        const HAS_STORAGE_WRITES = 1 << 0;
        const HAS_TRANSFORM_FEEDBACK = 1 << 1;
    }
}

///Compiled pipeline plus the resource interface it was compiled against.
pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub bindings: Arc<PipelineBindings>,
    pub flags: PipelineFlags,
}

impl Pipeline {
    pub fn new(handle: vk::Pipeline, bindings: Arc<PipelineBindings>, transform_feedback: bool) -> Arc<Self> {
        let mut flags = PipelineFlags::empty();
        if bindings.bindings().any(|b| b.is_storage() && !b.read_only) {
            flags |= PipelineFlags::HAS_STORAGE_WRITES;
        }
        if transform_feedback {
            flags |= PipelineFlags::HAS_TRANSFORM_FEEDBACK;
        }
        Arc::new(Pipeline {
            handle,
            bindings,
            flags,
        })
    }

    ///True if the pipeline writes memory other than its attachments.
    pub fn has_side_effects(&self) -> bool {
        !self.flags.is_empty()
    }
}

///Key of the fullscreen blit pipelines used when a blit can not be done with `vkCmdBlitImage`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetaBlitKey {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub filter: vk::Filter,
}

///Pipeline provider. Usually backed by a pipeline cache and a shader compiler.
///
/// Returning `None` skips the draw or dispatch that asked for the pipeline.
pub trait PipelineManager: Send + Sync {
    fn graphics_pipeline(&self, shaders: &GraphicsShaders, state: &GraphicsPipelineState) -> Option<Arc<Pipeline>>;

    fn compute_pipeline(&self, shader: &Arc<Shader>, spec: &SpecConstants) -> Option<Arc<Pipeline>>;

    ///Fullscreen triangle pipeline that samples a combined image sampler at its first binding and writes a single color
    /// or depth attachment. Push constants are a [BlitRegion](crate::BlitRegion).
    fn meta_blit_pipeline(&self, _key: &MetaBlitKey) -> Option<Arc<Pipeline>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_constant_change_detection() {
        let mut spec = SpecConstants::default();
        assert!(spec.set(0, 0));
        assert!(!spec.set(0, 0));
        assert!(spec.set(0, 4));
        assert!(!spec.set(42, 1));
    }

    #[test]
    fn dynamic_state_is_not_part_of_the_key() {
        let features = DeviceFeatures {
            extended_dynamic_state: true,
            ..Default::default()
        };
        let a = GraphicsPipelineState::default();
        let mut b = a.clone();
        b.rasterizer.cull_mode = vk::CullModeFlags::NONE;
        b.depth_stencil.depth_test = true;

        assert_eq!(a.key(&features), b.key(&features));
        assert_ne!(a.key(&DeviceFeatures::default()), b.key(&DeviceFeatures::default()));
    }

    #[test]
    fn transform_feedback_follows_last_geometry_stage() {
        let mut shaders = GraphicsShaders {
            vs: Some(Shader::new(
                vk::ShaderStageFlags::VERTEX,
                vec![],
                ShaderFlags::HAS_TRANSFORM_FEEDBACK,
            )),
            ..Default::default()
        };
        assert!(shaders.has_transform_feedback());

        shaders.gs = Some(Shader::new(vk::ShaderStageFlags::GEOMETRY, vec![], ShaderFlags::empty()));
        assert!(!shaders.has_transform_feedback());
    }
}
