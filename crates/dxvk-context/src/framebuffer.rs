use std::sync::Arc;

use dxvk::{
    ash::vk,
    resources::{Image, ImageView},
};

use crate::pipeline::RenderTargetFormats;

pub const MAX_RENDER_TARGETS: usize = 8;

pub const COLOR_ATTACHMENT_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
pub const COLOR_ATTACHMENT_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw() | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
);
pub const DEPTH_ATTACHMENT_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
);
pub const DEPTH_ATTACHMENT_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
);

///View bound as render target, and the layout it is rendered in.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub view: Arc<ImageView>,
    pub layout: vk::ImageLayout,
}

impl Attachment {
    ///Attachment in the optimal layout for its aspects, or `GENERAL` if the image rests in `GENERAL`.
    pub fn new(view: Arc<ImageView>) -> Self {
        let layout = view.image.pick_layout(attachment_layout(view.desc.aspects));
        Attachment { view, layout }
    }

    pub fn is_depth_stencil(&self) -> bool {
        is_depth_stencil(self.view.desc.aspects)
    }

    pub fn stages_access(&self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        if self.is_depth_stencil() {
            (DEPTH_ATTACHMENT_STAGES, DEPTH_ATTACHMENT_ACCESS)
        } else {
            (COLOR_ATTACHMENT_STAGES, COLOR_ATTACHMENT_ACCESS)
        }
    }

    fn matches(&self, other: &Attachment) -> bool {
        self.view.matches_view(&other.view) && self.layout == other.layout
    }
}

pub fn is_depth_stencil(aspects: vk::ImageAspectFlags) -> bool {
    aspects.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
}

pub fn attachment_layout(aspects: vk::ImageAspectFlags) -> vk::ImageLayout {
    if is_depth_stencil(aspects) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

///Aspects that rendering may write to in `layout`.
pub fn writable_aspects(layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    match layout {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::READ_ONLY_OPTIMAL
        | vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::ImageAspectFlags::empty(),
        vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL => vk::ImageAspectFlags::STENCIL,
        vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR | vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

///Index of an attachment within [RenderTargets].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentIndex {
    Color(usize),
    Depth,
}

///Render targets bound to the context.
#[derive(Clone, Debug, Default)]
pub struct RenderTargets {
    pub colors: [Option<Attachment>; MAX_RENDER_TARGETS],
    pub depth: Option<Attachment>,
}

impl RenderTargets {
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    ///True if both describe the same views in the same layouts.
    pub fn matches(&self, other: &RenderTargets) -> bool {
        let same = |a: &Option<Attachment>, b: &Option<Attachment>| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a.matches(b),
            _ => false,
        };
        self.colors.iter().zip(other.colors.iter()).all(|(a, b)| same(a, b)) && same(&self.depth, &other.depth)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttachmentIndex, &Attachment)> {
        self.colors
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_ref().map(|a| (AttachmentIndex::Color(i), a)))
            .chain(self.depth.as_ref().map(|a| (AttachmentIndex::Depth, a)))
    }

    ///Finds the attachment that is exactly `view`.
    pub fn find(&self, view: &ImageView) -> Option<AttachmentIndex> {
        self.iter()
            .find(|(_, a)| a.view.matches_view(view))
            .map(|(index, _)| index)
    }

    pub fn get(&self, index: AttachmentIndex) -> Option<&Attachment> {
        match index {
            AttachmentIndex::Color(i) => self.colors.get(i).and_then(Option::as_ref),
            AttachmentIndex::Depth => self.depth.as_ref(),
        }
    }

    ///True if any attachment is a view of `image`.
    pub fn uses_image(&self, image: &Image) -> bool {
        self.iter().any(|(_, a)| a.view.image.cookie() == image.cookie())
    }

    ///True if any attachment shares a subresource with `view`.
    pub fn overlaps_view(&self, view: &ImageView) -> bool {
        self.iter().any(|(_, a)| a.view.check_subresource_overlap(view))
    }

    pub fn formats(&self) -> RenderTargetFormats {
        let mut formats = RenderTargetFormats::default();
        for (index, attachment) in self.iter() {
            match index {
                AttachmentIndex::Color(i) => formats.colors[i] = attachment.view.desc.format,
                AttachmentIndex::Depth => formats.depth = attachment.view.desc.format,
            }
            formats.samples = attachment.view.image.desc.samples;
        }
        formats
    }

    ///Largest area and layer count all attachments can render to.
    pub fn render_area(&self) -> (vk::Extent2D, u32) {
        let mut extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        let mut layers = u32::MAX;
        for (_, attachment) in self.iter() {
            let mip = attachment.view.mip_level_extent(0);
            extent.width = extent.width.min(mip.width);
            extent.height = extent.height.min(mip.height);
            layers = layers.min(attachment.view.desc.layer_count);
        }
        if layers == u32::MAX {
            return (vk::Extent2D::default(), 0);
        }
        (extent, layers)
    }
}

#[cfg(test)]
mod tests {
    use dxvk::{
        resources::{Image, ImageView, ImgDesc, ImgViewDesc},
        testing::SoftDevice,
    };

    use super::*;

    #[test]
    fn render_area_is_minimum_of_attachments() {
        let (device, _soft) = SoftDevice::device_default();
        let big = Image::new(&device, ImgDesc::render_target_2d(64, 64, vk::Format::R8G8B8A8_UNORM)).unwrap();
        let small = Image::new(&device, ImgDesc::render_target_2d(32, 16, vk::Format::D32_SFLOAT)).unwrap();

        let mut targets = RenderTargets::default();
        targets.colors[0] = Some(Attachment::new(ImageView::new(&big, ImgViewDesc::of_image(&big)).unwrap()));
        targets.depth = Some(Attachment::new(ImageView::new(&small, ImgViewDesc::of_image(&small)).unwrap()));

        let (extent, layers) = targets.render_area();
        assert_eq!((extent.width, extent.height, layers), (32, 16, 1));
        assert_eq!(
            targets.depth.as_ref().unwrap().layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert!(targets.uses_image(&small));
    }

    #[test]
    fn matching_compares_views_not_handles() {
        let (device, _soft) = SoftDevice::device_default();
        let image = Image::new(&device, ImgDesc::render_target_2d(8, 8, vk::Format::R8G8B8A8_UNORM)).unwrap();

        let mut a = RenderTargets::default();
        a.colors[0] = Some(Attachment::new(ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap()));
        let mut b = RenderTargets::default();
        b.colors[0] = Some(Attachment::new(ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap()));

        assert!(a.matches(&b));
        b.colors[1] = b.colors[0].clone();
        assert!(!a.matches(&b));
    }

    #[test]
    fn read_only_layouts_are_not_writable() {
        let all = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        assert!(writable_aspects(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL).contains(all));
        assert!(writable_aspects(vk::ImageLayout::GENERAL).contains(all));
        assert!(writable_aspects(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL).is_empty());
        assert_eq!(
            writable_aspects(vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL),
            vk::ImageAspectFlags::STENCIL
        );
    }
}
