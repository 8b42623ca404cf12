use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

///Returns a process-wide unique, never zero, identifier. Resources use it as identity for hashing and
/// tracking, since Vulkan handles may be reused after destruction.
pub fn next_cookie() -> u64 {
    NEXT_COOKIE.fetch_add(1, Ordering::Relaxed)
}

///Converts an extent into the offset at the far corner of the described region.
pub fn extent_to_offset(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width.try_into().unwrap_or(i32::MAX),
        y: extent.height.try_into().unwrap_or(i32::MAX),
        z: extent.depth.try_into().unwrap_or(i32::MAX),
    }
}

pub fn offset_to_extent(offset: vk::Offset3D) -> vk::Extent3D {
    vk::Extent3D {
        width: offset.x.max(0) as u32,
        height: offset.y.max(0) as u32,
        depth: offset.z.max(0) as u32,
    }
}

///Extent of mip `level` for an image with base `extent`. Never shrinks below one texel.
pub fn mip_extent(extent: vk::Extent3D, level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
        depth: (extent.depth >> level).max(1),
    }
}

///Rounds `value` up to `alignment`. `alignment` of zero is treated as one.
pub fn align(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

///True if the byte ranges `[a, a + a_len)` and `[b, b + b_len)` intersect.
pub fn ranges_overlap(a: vk::DeviceSize, a_len: vk::DeviceSize, b: vk::DeviceSize, b_len: vk::DeviceSize) -> bool {
    a < b.saturating_add(b_len) && b < a.saturating_add(a_len)
}

///Returns `count` or, if count is `REMAINING_*`, the remaining elements from `base` to `total`.
pub fn resolve_remaining(base: u32, count: u32, total: u32) -> u32 {
    if count == vk::REMAINING_MIP_LEVELS {
        total.saturating_sub(base)
    } else {
        count
    }
}

pub fn subresources_overlap(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    !(a.aspect_mask & b.aspect_mask).is_empty()
        && ranges_overlap(
            a.base_mip_level as u64,
            a.level_count as u64,
            b.base_mip_level as u64,
            b.level_count as u64,
        )
        && ranges_overlap(
            a.base_array_layer as u64,
            a.layer_count as u64,
            b.base_array_layer as u64,
            b.layer_count as u64,
        )
}

pub fn subresources_equal(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.aspect_mask == b.aspect_mask
        && a.base_mip_level == b.base_mip_level
        && a.level_count == b.level_count
        && a.base_array_layer == b.base_array_layer
        && a.layer_count == b.layer_count
}

///True if `inner` is completely contained in `outer`.
pub fn subresources_contain(outer: &vk::ImageSubresourceRange, inner: &vk::ImageSubresourceRange) -> bool {
    outer.aspect_mask.contains(inner.aspect_mask)
        && outer.base_mip_level <= inner.base_mip_level
        && outer.base_mip_level + outer.level_count >= inner.base_mip_level + inner.level_count
        && outer.base_array_layer <= inner.base_array_layer
        && outer.base_array_layer + outer.layer_count >= inner.base_array_layer + inner.layer_count
}

pub fn layers_to_range(layers: &vk::ImageSubresourceLayers) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: layers.aspect_mask,
        base_mip_level: layers.mip_level,
        level_count: 1,
        base_array_layer: layers.base_array_layer,
        layer_count: layers.layer_count,
    }
}

///True if the two 3D boxes intersect.
pub fn regions_overlap(
    a_offset: vk::Offset3D,
    b_offset: vk::Offset3D,
    extent: vk::Extent3D,
) -> bool {
    let axis = |a: i32, b: i32, len: u32| {
        let len = len as i64;
        (a as i64) < b as i64 + len && (b as i64) < a as i64 + len
    };
    axis(a_offset.x, b_offset.x, extent.width)
        && axis(a_offset.y, b_offset.y, extent.height)
        && axis(a_offset.z, b_offset.z, extent.depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ranges() {
        assert!(ranges_overlap(0, 16, 8, 16));
        assert!(!ranges_overlap(0, 16, 16, 16));
        assert!(!ranges_overlap(0, 0, 0, 16));
        assert!(ranges_overlap(0, vk::WHOLE_SIZE, 1024, 4));
    }

    #[test]
    fn mips_never_reach_zero() {
        let e = mip_extent(
            vk::Extent3D {
                width: 16,
                height: 4,
                depth: 1,
            },
            3,
        );
        assert_eq!((e.width, e.height, e.depth), (2, 1, 1));
    }

    #[test]
    fn subresource_overlap_needs_common_aspect() {
        let depth = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let stencil = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::STENCIL,
            ..depth
        };
        assert!(!subresources_overlap(&depth, &stencil));
        assert!(subresources_overlap(&depth, &depth));
    }

    #[test]
    fn alignment() {
        assert_eq!(align(5, 4), 8);
        assert_eq!(align(8, 4), 8);
        assert_eq!(align(3, 0), 3);
    }
}
