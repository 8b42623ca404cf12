//! Deferred clears and discards.
//!
//! Clearing a render target outside of a render pass does not record anything. The clear is kept until either a
//! render pass starts on the same view, in which case it becomes the load op of the attachment, or until something
//! else touches the image, in which case it is executed on its own.

use std::sync::Arc;

use dxvk::{
    ash::vk,
    device::ClearValue,
    resources::{Image, ImageView},
};
use smallvec::SmallVec;

pub const MAX_DEFERRED_CLEARS: usize = 8;

#[derive(Clone, Debug)]
pub struct DeferredClear {
    pub view: Arc<ImageView>,
    ///Aspects that are cleared to `value`.
    pub clear_aspects: vk::ImageAspectFlags,
    ///Aspects whose content is undefined afterwards.
    pub discard_aspects: vk::ImageAspectFlags,
    pub value: ClearValue,
}

///Result of queueing a clear or discard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearInsert {
    Added,
    ///Folded into the entry of the same view.
    Merged,
    ///An entry of an overlapping view exists, or the list is full. The pending clears have to be executed first.
    FlushRequired,
}

#[derive(Default)]
pub struct DeferredClears {
    entries: SmallVec<[DeferredClear; MAX_DEFERRED_CLEARS]>,
}

impl DeferredClears {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredClear> {
        self.entries.iter()
    }

    ///Queues a clear of `aspects` of `view` to `value`.
    pub fn clear(&mut self, view: &Arc<ImageView>, aspects: vk::ImageAspectFlags, value: ClearValue) -> ClearInsert {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.view.matches_view(view)) {
            entry.value = merge_value(entry.clear_aspects, entry.value, aspects, value);
            entry.clear_aspects |= aspects;
            entry.discard_aspects &= !aspects;
            return ClearInsert::Merged;
        }

        self.insert(DeferredClear {
            view: view.clone(),
            clear_aspects: aspects,
            discard_aspects: vk::ImageAspectFlags::empty(),
            value,
        })
    }

    ///Queues a discard of `aspects` of `view`. Discarding an aspect drops a pending clear of it.
    pub fn discard(&mut self, view: &Arc<ImageView>, aspects: vk::ImageAspectFlags) -> ClearInsert {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.view.matches_view(view)) {
            entry.clear_aspects &= !aspects;
            entry.discard_aspects |= aspects;
            return ClearInsert::Merged;
        }

        self.insert(DeferredClear {
            view: view.clone(),
            clear_aspects: vk::ImageAspectFlags::empty(),
            discard_aspects: aspects,
            value: ClearValue::default(),
        })
    }

    fn insert(&mut self, clear: DeferredClear) -> ClearInsert {
        let overlaps = self
            .entries
            .iter()
            .any(|e| e.view.check_subresource_overlap(&clear.view));
        if overlaps || self.entries.len() >= MAX_DEFERRED_CLEARS {
            return ClearInsert::FlushRequired;
        }
        self.entries.push(clear);
        ClearInsert::Added
    }

    ///Removes and returns the entry of exactly `view`.
    pub fn take_view(&mut self, view: &ImageView) -> Option<DeferredClear> {
        let index = self.entries.iter().position(|e| e.view.matches_view(view))?;
        Some(self.entries.remove(index))
    }

    ///Removes and returns every entry that targets `image`.
    pub fn take_image(&mut self, image: &Image) -> SmallVec<[DeferredClear; MAX_DEFERRED_CLEARS]> {
        let mut taken = SmallVec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].view.image.cookie() == image.cookie() {
                taken.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        taken
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DeferredClear> + '_ {
        self.entries.drain(..)
    }
}

///Combines two clear values. Color clears replace each other. Depth and stencil are taken per aspect from the newer
/// clear if it covers that aspect.
fn merge_value(
    old_aspects: vk::ImageAspectFlags,
    old: ClearValue,
    new_aspects: vk::ImageAspectFlags,
    new: ClearValue,
) -> ClearValue {
    if new_aspects.contains(vk::ImageAspectFlags::COLOR) {
        return new;
    }
    let depth = if new_aspects.contains(vk::ImageAspectFlags::DEPTH)
        || !old_aspects.contains(vk::ImageAspectFlags::DEPTH)
    {
        new.depth()
    } else {
        old.depth()
    };
    let stencil = if new_aspects.contains(vk::ImageAspectFlags::STENCIL)
        || !old_aspects.contains(vk::ImageAspectFlags::STENCIL)
    {
        new.stencil()
    } else {
        old.stencil()
    };
    ClearValue::depth_stencil(depth, stencil)
}

#[cfg(test)]
mod tests {
    use dxvk::{
        resources::{ImgDesc, ImgViewDesc},
        testing::SoftDevice,
    };

    use super::*;

    fn depth_view(device: &Arc<dxvk::device::Device>) -> Arc<ImageView> {
        let image = Image::new(device, ImgDesc::render_target_2d(16, 16, vk::Format::D24_UNORM_S8_UINT)).unwrap();
        ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap()
    }

    #[test]
    fn depth_and_stencil_clears_merge() {
        let (device, _soft) = SoftDevice::device_default();
        let view = depth_view(&device);

        let mut clears = DeferredClears::default();
        assert_eq!(
            clears.clear(&view, vk::ImageAspectFlags::DEPTH, ClearValue::depth_stencil(0.5, 0)),
            ClearInsert::Added
        );
        assert_eq!(
            clears.clear(&view, vk::ImageAspectFlags::STENCIL, ClearValue::depth_stencil(0.0, 7)),
            ClearInsert::Merged
        );

        assert_eq!(clears.len(), 1);
        let entry = clears.take_view(&view).unwrap();
        assert_eq!(
            entry.clear_aspects,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(entry.value, ClearValue::depth_stencil(0.5, 7));
    }

    #[test]
    fn discard_drops_pending_clear() {
        let (device, _soft) = SoftDevice::device_default();
        let view = depth_view(&device);

        let mut clears = DeferredClears::default();
        clears.clear(&view, vk::ImageAspectFlags::DEPTH, ClearValue::depth_stencil(1.0, 0));
        clears.discard(&view, vk::ImageAspectFlags::DEPTH);

        let entry = clears.take_view(&view).unwrap();
        assert!(entry.clear_aspects.is_empty());
        assert_eq!(entry.discard_aspects, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn overlapping_views_require_flush() {
        let (device, _soft) = SoftDevice::device_default();
        let image = Image::new(
            &device,
            ImgDesc::render_target_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_layers(4),
        )
        .unwrap();
        let all = ImageView::new(&image, ImgViewDesc::of_image(&image)).unwrap();
        let first = ImageView::new(&image, ImgViewDesc::of_image(&image).with_layers(0, 1)).unwrap();
        let value = ClearValue::float([1.0, 0.0, 0.0, 1.0]);

        let mut clears = DeferredClears::default();
        assert_eq!(clears.clear(&all, vk::ImageAspectFlags::COLOR, value), ClearInsert::Added);
        assert_eq!(
            clears.clear(&first, vk::ImageAspectFlags::COLOR, value),
            ClearInsert::FlushRequired
        );
        assert_eq!(clears.len(), 1);
        assert_eq!(clears.take_image(&image).len(), 1);
        assert!(clears.is_empty());
    }
}
