//! Helpers shared by the context tests.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use dxvk::{
    ash::vk::{self, Handle},
    device::Device,
    resources::{Buffer, BufDesc, Image, ImageView, ImgDesc, ImgViewDesc},
    testing::SoftDevice,
};
use dxvk_commands::SubmissionQueue;
use dxvk_descriptor::{BindingInfo, PipelineBindings};
use parking_lot::Mutex;

use crate::{
    Context, GraphicsPipelineState, GraphicsShaders, MetaBlitKey, Pipeline, PipelineManager, Shader, ShaderFlags,
    SpecConstants,
};

///Pipeline manager that hands out whatever pipelines the test installed.
#[derive(Default)]
pub struct TestPipelines {
    pub graphics: Mutex<Option<Arc<Pipeline>>>,
    pub compute: Mutex<Option<Arc<Pipeline>>>,
    pub meta_blit: Mutex<Option<Arc<Pipeline>>>,
    pub lookups: AtomicUsize,
}

impl PipelineManager for TestPipelines {
    fn graphics_pipeline(&self, _shaders: &GraphicsShaders, _state: &GraphicsPipelineState) -> Option<Arc<Pipeline>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.graphics.lock().clone()
    }

    fn compute_pipeline(&self, _shader: &Arc<Shader>, _spec: &SpecConstants) -> Option<Arc<Pipeline>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.compute.lock().clone()
    }

    fn meta_blit_pipeline(&self, _key: &MetaBlitKey) -> Option<Arc<Pipeline>> {
        self.meta_blit.lock().clone()
    }
}

pub struct TestContext {
    pub device: Arc<Device>,
    pub soft: Arc<SoftDevice>,
    pub pipelines: Arc<TestPipelines>,
    pub context: Context,
}

impl TestContext {
    pub fn new() -> Self {
        let (device, soft) = SoftDevice::device_default();
        Self::with_device(device, soft)
    }

    pub fn with_device(device: Arc<Device>, soft: Arc<SoftDevice>) -> Self {
        let queue = Arc::new(SubmissionQueue::new(&device).unwrap());
        let pipelines = Arc::new(TestPipelines::default());
        let context = Context::new(&device, queue, pipelines.clone()).unwrap();
        TestContext {
            device,
            soft,
            pipelines,
            context,
        }
    }

    ///Installs a graphics pipeline with `bindings` and binds a vertex and fragment shader.
    pub fn use_graphics(&mut self, bindings: &[BindingInfo]) -> Arc<Pipeline> {
        let pipeline = pipeline(&self.device, vk::PipelineBindPoint::GRAPHICS, bindings, 1);
        *self.pipelines.graphics.lock() = Some(pipeline.clone());
        self.context.bind_shader(
            vk::ShaderStageFlags::VERTEX,
            Some(Shader::new(vk::ShaderStageFlags::VERTEX, vec![], ShaderFlags::empty())),
        );
        self.context.bind_shader(
            vk::ShaderStageFlags::FRAGMENT,
            Some(Shader::new(vk::ShaderStageFlags::FRAGMENT, vec![], ShaderFlags::empty())),
        );
        pipeline
    }

    ///Installs a compute pipeline with `bindings` and binds a compute shader.
    pub fn use_compute(&mut self, bindings: &[BindingInfo]) -> Arc<Pipeline> {
        let pipeline = pipeline(&self.device, vk::PipelineBindPoint::COMPUTE, bindings, 2);
        *self.pipelines.compute.lock() = Some(pipeline.clone());
        self.context.bind_shader(
            vk::ShaderStageFlags::COMPUTE,
            Some(Shader::new(vk::ShaderStageFlags::COMPUTE, vec![], ShaderFlags::empty())),
        );
        pipeline
    }

    pub fn buffer(&self, size: vk::DeviceSize) -> Arc<Buffer> {
        Buffer::new(&self.device, BufDesc::device_local(size)).unwrap()
    }

    pub fn view(&self, desc: ImgDesc) -> Arc<ImageView> {
        let image = Image::new(&self.device, desc).unwrap();
        ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap()
    }

    pub fn color_target(&self, width: u32, height: u32) -> Arc<ImageView> {
        self.view(ImgDesc::render_target_2d(width, height, vk::Format::R8G8B8A8_UNORM))
    }
}

pub fn pipeline(
    device: &Arc<Device>,
    bind_point: vk::PipelineBindPoint,
    bindings: &[BindingInfo],
    handle: u64,
) -> Arc<Pipeline> {
    let range = vk::PushConstantRange {
        stage_flags: if bind_point == vk::PipelineBindPoint::COMPUTE {
            vk::ShaderStageFlags::COMPUTE
        } else {
            vk::ShaderStageFlags::ALL_GRAPHICS
        },
        offset: 0,
        size: 64,
    };
    let layout = PipelineBindings::new(device, bind_point, bindings, Some(range)).unwrap();
    Pipeline::new(vk::Pipeline::from_raw(handle), layout, false)
}
