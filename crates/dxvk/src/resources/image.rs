use std::{
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
};

use ash::vk;

use crate::{
    ResourceError,
    device::{Device, RawImage},
    format::{FormatInfo, format_info},
    util::{mip_extent, next_cookie, resolve_remaining, subresources_overlap},
};

use super::SHADER_STAGES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImgDesc {
    pub ty: vk::ImageType,
    pub format: vk::Format,
    pub flags: vk::ImageCreateFlags,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    ///Layout the image rests in between operations.
    pub layout: vk::ImageLayout,
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl ImgDesc {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        let (stages, access) = Self::usage_stages_access(usage);
        ImgDesc {
            ty: vk::ImageType::TYPE_2D,
            format,
            flags: vk::ImageCreateFlags::empty(),
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            layout: Self::default_layout(usage),
            stages,
            access,
        }
    }

    ///Sampled 2D texture that can be written by transfer operations.
    pub fn texture_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self::new_2d(
            width,
            height,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
        )
    }

    ///Color or depth/stencil render target, depending on `format`.
    pub fn render_target_2d(width: u32, height: u32, format: vk::Format) -> Self {
        let is_depth = format_info(format).map(|f| f.is_depth_stencil()).unwrap_or(false);
        let attachment = if is_depth {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        Self::new_2d(
            width,
            height,
            format,
            attachment
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers.max(1);
        self
    }

    pub fn with_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    ///Picks the resting layout most operations on an image of `usage` can use without transition.
    pub fn default_layout(usage: vk::ImageUsageFlags) -> vk::ImageLayout {
        if usage.contains(vk::ImageUsageFlags::STORAGE) {
            vk::ImageLayout::GENERAL
        } else if usage.contains(vk::ImageUsageFlags::SAMPLED) {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::GENERAL
        }
    }

    pub fn usage_stages_access(usage: vk::ImageUsageFlags) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        let mut stages = vk::PipelineStageFlags2::empty();
        let mut access = vk::AccessFlags2::empty();

        if usage.intersects(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST) {
            stages |= vk::PipelineStageFlags2::TRANSFER;
        }
        if usage.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
            access |= vk::AccessFlags2::TRANSFER_READ;
        }
        if usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            access |= vk::AccessFlags2::TRANSFER_WRITE;
        }
        if usage.intersects(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::INPUT_ATTACHMENT) {
            stages |= SHADER_STAGES;
            access |= vk::AccessFlags2::SHADER_READ;
        }
        if usage.contains(vk::ImageUsageFlags::STORAGE) {
            stages |= SHADER_STAGES;
            access |= vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
        }
        if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            stages |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
            access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
        }
        if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            stages |=
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        (stages, access)
    }
}

///Image with a tracked resting layout.
///
/// The layout is only changed by the context while it records the transition. It always describes the layout the
/// image will be in once the recorded work executed, not the layout at any point during recording.
pub struct Image {
    pub desc: ImgDesc,
    pub inner: RawImage,
    pub device: Arc<Device>,
    cookie: u64,
    layout: AtomicI32,
    owned: bool,
}

impl Image {
    pub fn new(device: &Arc<Device>, desc: ImgDesc) -> Result<Arc<Self>, ResourceError> {
        if format_info(desc.format).is_none() {
            return Err(ResourceError::UnknownFormat(desc.format));
        }

        let inner = device.inner.create_image(&desc)?;
        Ok(Arc::new(Image {
            desc,
            inner,
            device: device.clone(),
            cookie: next_cookie(),
            layout: AtomicI32::new(desc.layout.as_raw()),
            owned: true,
        }))
    }

    ///Wraps an image that is owned by someone else, for instance a swapchain image.
    pub fn import(device: &Arc<Device>, desc: ImgDesc, inner: RawImage) -> Arc<Self> {
        Arc::new(Image {
            desc,
            inner,
            device: device.clone(),
            cookie: next_cookie(),
            layout: AtomicI32::new(desc.layout.as_raw()),
            owned: false,
        })
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn handle(&self) -> vk::Image {
        self.inner.image
    }

    ///Current resting layout.
    pub fn layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.layout.load(Ordering::Acquire))
    }

    ///Sets the resting layout. Must only be called while recording the transition to `layout`.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        self.layout.store(layout.as_raw(), Ordering::Release);
    }

    ///Returns `target`, unless the image rests in `GENERAL`, in which case every operation uses `GENERAL`.
    pub fn pick_layout(&self, target: vk::ImageLayout) -> vk::ImageLayout {
        if self.layout() == vk::ImageLayout::GENERAL {
            vk::ImageLayout::GENERAL
        } else {
            target
        }
    }

    pub fn format_info(&self) -> FormatInfo {
        //checked at creation for owned images, imported images fall back to a plain color format
        format_info(self.desc.format).unwrap_or(FormatInfo {
            element_size: 4,
            aspects: vk::ImageAspectFlags::COLOR,
            block_size: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            flags: Default::default(),
        })
    }

    pub fn aspects(&self) -> vk::ImageAspectFlags {
        self.format_info().aspects
    }

    pub fn subresources(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspects(),
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        }
    }

    pub fn mip_level_extent(&self, level: u32) -> vk::Extent3D {
        mip_extent(self.desc.extent, level)
    }

    ///True if `range` covers every subresource of the image.
    pub fn is_full_subresource(&self, range: &vk::ImageSubresourceRange) -> bool {
        range.aspect_mask.contains(self.aspects())
            && range.base_mip_level == 0
            && resolve_remaining(0, range.level_count, self.desc.mip_levels) == self.desc.mip_levels
            && range.base_array_layer == 0
            && resolve_remaining(0, range.layer_count, self.desc.array_layers) == self.desc.array_layers
    }

    pub fn is_multisampled(&self) -> bool {
        self.desc.samples != vk::SampleCountFlags::TYPE_1
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.owned {
            self.device.inner.destroy_image(&self.inner);
        }
    }
}

impl Hash for Image {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cookie.hash(state)
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.cookie == other.cookie
    }
}

impl Eq for Image {}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("cookie", &self.cookie)
            .field("layout", &self.layout())
            .field("desc", &self.desc)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImgViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspects: vk::ImageAspectFlags,
    pub min_level: u32,
    pub level_count: u32,
    pub min_layer: u32,
    pub layer_count: u32,
    pub swizzle: [vk::ComponentSwizzle; 4],
    ///Usage of the view. Subset of the image's usage.
    pub usage: vk::ImageUsageFlags,
}

impl ImgViewDesc {
    ///View of the whole image with identity swizzle.
    pub fn of_image(image: &Image) -> Self {
        let view_type = match (image.desc.ty, image.desc.array_layers > 1) {
            (vk::ImageType::TYPE_1D, false) => vk::ImageViewType::TYPE_1D,
            (vk::ImageType::TYPE_1D, true) => vk::ImageViewType::TYPE_1D_ARRAY,
            (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
            (_, true) => vk::ImageViewType::TYPE_2D_ARRAY,
            _ => vk::ImageViewType::TYPE_2D,
        };
        ImgViewDesc {
            view_type,
            format: image.desc.format,
            aspects: image.aspects(),
            min_level: 0,
            level_count: image.desc.mip_levels,
            min_layer: 0,
            layer_count: image.desc.array_layers,
            swizzle: [vk::ComponentSwizzle::IDENTITY; 4],
            usage: image.desc.usage,
        }
    }

    pub fn with_aspects(mut self, aspects: vk::ImageAspectFlags) -> Self {
        self.aspects = aspects;
        self
    }

    pub fn with_levels(mut self, min_level: u32, level_count: u32) -> Self {
        self.min_level = min_level;
        self.level_count = level_count;
        self
    }

    pub fn with_layers(mut self, min_layer: u32, layer_count: u32) -> Self {
        self.min_layer = min_layer;
        self.layer_count = layer_count;
        self
    }

    pub fn with_swizzle(mut self, swizzle: [vk::ComponentSwizzle; 4]) -> Self {
        self.swizzle = swizzle;
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }
}

pub struct ImageView {
    pub desc: ImgViewDesc,
    pub image: Arc<Image>,
    pub inner: vk::ImageView,
    cookie: u64,
}

impl ImageView {
    pub fn new(image: &Arc<Image>, desc: ImgViewDesc) -> Result<Arc<Self>, ResourceError> {
        let inner = image.device.inner.create_image_view(image.handle(), &desc)?;
        Ok(Arc::new(ImageView {
            desc,
            image: image.clone(),
            inner,
            cookie: next_cookie(),
        }))
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn handle(&self) -> vk::ImageView {
        self.inner
    }

    pub fn subresources(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.desc.aspects,
            base_mip_level: self.desc.min_level,
            level_count: self.desc.level_count,
            base_array_layer: self.desc.min_layer,
            layer_count: self.desc.layer_count,
        }
    }

    ///Extent of `level`, relative to the view's first mip.
    pub fn mip_level_extent(&self, level: u32) -> vk::Extent3D {
        self.image.mip_level_extent(self.desc.min_level + level)
    }

    ///True if both views describe the same subresources of the same image, with the same format.
    pub fn matches_view(&self, other: &ImageView) -> bool {
        self.cookie == other.cookie || (self.image.cookie == other.image.cookie && self.desc == other.desc)
    }

    ///True if both views share at least one subresource.
    pub fn check_subresource_overlap(&self, other: &ImageView) -> bool {
        self.image.cookie == other.image.cookie && subresources_overlap(&self.subresources(), &other.subresources())
    }

    pub fn is_identity_swizzle(&self) -> bool {
        self.desc
            .swizzle
            .iter()
            .enumerate()
            .all(|(i, s)| *s == vk::ComponentSwizzle::IDENTITY || s.as_raw() == i as i32 + 3)
    }

    pub fn format_info(&self) -> Option<FormatInfo> {
        format_info(self.desc.format)
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.image.device.inner.destroy_image_view(self.inner);
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("cookie", &self.cookie)
            .field("image", &self.image.cookie)
            .field("desc", &self.desc)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_modes: [vk::SamplerAddressMode; 3],
    pub compare_op: Option<vk::CompareOp>,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_modes: [vk::SamplerAddressMode::CLAMP_TO_EDGE; 3],
            compare_op: None,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

impl SamplerDesc {
    pub fn nearest() -> Self {
        SamplerDesc {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Default::default()
        }
    }
}

pub struct Sampler {
    pub desc: SamplerDesc,
    pub inner: vk::Sampler,
    pub device: Arc<Device>,
    cookie: u64,
}

impl Sampler {
    pub fn new(device: &Arc<Device>, desc: SamplerDesc) -> Result<Arc<Self>, ResourceError> {
        let inner = device.inner.create_sampler(&desc)?;
        Ok(Arc::new(Sampler {
            desc,
            inner,
            device: device.clone(),
            cookie: next_cookie(),
        }))
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.inner.destroy_sampler(self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SoftDevice;

    #[test]
    fn views_match_by_subresource() {
        let (device, _soft) = SoftDevice::device_default();
        let image = Image::new(&device, ImgDesc::texture_2d(64, 64, vk::Format::R8G8B8A8_UNORM).with_mips(4)).unwrap();

        let a = ImageView::new(&image, ImgViewDesc::of_image(&image).with_levels(0, 1)).unwrap();
        let b = ImageView::new(&image, ImgViewDesc::of_image(&image).with_levels(0, 1)).unwrap();
        let c = ImageView::new(&image, ImgViewDesc::of_image(&image).with_levels(1, 3)).unwrap();
        let all = ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap();

        assert!(a.matches_view(&b));
        assert!(!a.matches_view(&c));
        assert!(!a.check_subresource_overlap(&c));
        assert!(all.check_subresource_overlap(&c));
        assert_eq!(c.mip_level_extent(0).width, 32);
    }

    #[test]
    fn layout_is_tracked() {
        let (device, _soft) = SoftDevice::device_default();
        let image = Image::new(&device, ImgDesc::texture_2d(4, 4, vk::Format::R8G8B8A8_UNORM)).unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        image.set_layout(vk::ImageLayout::GENERAL);
        assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(
            image.pick_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageLayout::GENERAL
        );
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let (device, _soft) = SoftDevice::device_default();
        assert!(matches!(
            Image::new(&device, ImgDesc::texture_2d(4, 4, vk::Format::UNDEFINED)),
            Err(ResourceError::UnknownFormat(_))
        ));
    }
}
