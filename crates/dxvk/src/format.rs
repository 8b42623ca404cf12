use ash::vk;

///Properties of a format the core needs for copies, clears and barrier decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    ///Bytes per element. For block compressed formats the size of a block.
    pub element_size: u32,
    pub aspects: vk::ImageAspectFlags,
    ///Texel block extent, `1x1x1` for uncompressed formats.
    pub block_size: vk::Extent3D,
    pub flags: FormatFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatFlags {
    pub is_srgb: bool,
    pub is_integer: bool,
    pub is_compressed: bool,
}

impl FormatInfo {
    const fn color(element_size: u32) -> Self {
        FormatInfo {
            element_size,
            aspects: vk::ImageAspectFlags::COLOR,
            block_size: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            flags: FormatFlags {
                is_srgb: false,
                is_integer: false,
                is_compressed: false,
            },
        }
    }

    const fn int(mut self) -> Self {
        self.flags.is_integer = true;
        self
    }

    const fn srgb(mut self) -> Self {
        self.flags.is_srgb = true;
        self
    }

    const fn compressed(element_size: u32) -> Self {
        let mut info = Self::color(element_size);
        info.block_size = vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        };
        info.flags.is_compressed = true;
        info
    }

    const fn depth_stencil(element_size: u32, aspects: vk::ImageAspectFlags) -> Self {
        let mut info = Self::color(element_size);
        info.aspects = aspects;
        info
    }

    pub fn has_depth(&self) -> bool {
        self.aspects.contains(vk::ImageAspectFlags::DEPTH)
    }

    pub fn has_stencil(&self) -> bool {
        self.aspects.contains(vk::ImageAspectFlags::STENCIL)
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.has_depth() || self.has_stencil()
    }

    ///Size in bytes of a tightly packed region of `extent` texels.
    pub fn region_size(&self, extent: vk::Extent3D) -> vk::DeviceSize {
        let blocks_x = extent.width.div_ceil(self.block_size.width) as vk::DeviceSize;
        let blocks_y = extent.height.div_ceil(self.block_size.height) as vk::DeviceSize;
        let blocks_z = extent.depth.div_ceil(self.block_size.depth) as vk::DeviceSize;
        blocks_x * blocks_y * blocks_z * self.element_size as vk::DeviceSize
    }
}

const DEPTH: vk::ImageAspectFlags = vk::ImageAspectFlags::DEPTH;
const STENCIL: vk::ImageAspectFlags = vk::ImageAspectFlags::STENCIL;
const DEPTH_STENCIL: vk::ImageAspectFlags =
    vk::ImageAspectFlags::from_raw(DEPTH.as_raw() | STENCIL.as_raw());

///Returns the format info of `format`, or `None` if the format is not known to the core. That is the case for
/// `UNDEFINED` and for planar formats.
pub fn format_info(format: vk::Format) -> Option<FormatInfo> {
    let info = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM => FormatInfo::color(1),
        vk::Format::R8_UINT | vk::Format::R8_SINT => FormatInfo::color(1).int(),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SNORM => FormatInfo::color(2),
        vk::Format::R8G8_UINT | vk::Format::R8G8_SINT => FormatInfo::color(2).int(),
        vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::B5G6R5_UNORM_PACK16
        | vk::Format::A1R5G5B5_UNORM_PACK16
        | vk::Format::B4G4R4A4_UNORM_PACK16 => FormatInfo::color(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::A2R10G10B10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::E5B9G9R9_UFLOAT_PACK32 => FormatInfo::color(4),
        vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_SRGB => FormatInfo::color(4).srgb(),
        vk::Format::R8G8B8A8_UINT | vk::Format::R8G8B8A8_SINT | vk::Format::A2B10G10R10_UINT_PACK32 => {
            FormatInfo::color(4).int()
        }
        vk::Format::R16_UNORM | vk::Format::R16_SNORM | vk::Format::R16_SFLOAT => FormatInfo::color(2),
        vk::Format::R16_UINT | vk::Format::R16_SINT => FormatInfo::color(2).int(),
        vk::Format::R16G16_UNORM | vk::Format::R16G16_SNORM | vk::Format::R16G16_SFLOAT => FormatInfo::color(4),
        vk::Format::R16G16_UINT | vk::Format::R16G16_SINT => FormatInfo::color(4).int(),
        vk::Format::R16G16B16A16_UNORM | vk::Format::R16G16B16A16_SNORM | vk::Format::R16G16B16A16_SFLOAT => {
            FormatInfo::color(8)
        }
        vk::Format::R16G16B16A16_UINT | vk::Format::R16G16B16A16_SINT => FormatInfo::color(8).int(),
        vk::Format::R32_SFLOAT => FormatInfo::color(4),
        vk::Format::R32_UINT | vk::Format::R32_SINT => FormatInfo::color(4).int(),
        vk::Format::R32G32_SFLOAT => FormatInfo::color(8),
        vk::Format::R32G32_UINT | vk::Format::R32G32_SINT => FormatInfo::color(8).int(),
        vk::Format::R32G32B32_SFLOAT => FormatInfo::color(12),
        vk::Format::R32G32B32_UINT | vk::Format::R32G32B32_SINT => FormatInfo::color(12).int(),
        vk::Format::R32G32B32A32_SFLOAT => FormatInfo::color(16),
        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SINT => FormatInfo::color(16).int(),
        vk::Format::BC1_RGB_UNORM_BLOCK | vk::Format::BC1_RGBA_UNORM_BLOCK | vk::Format::BC4_UNORM_BLOCK => {
            FormatInfo::compressed(8)
        }
        vk::Format::BC1_RGBA_SRGB_BLOCK => FormatInfo::compressed(8).srgb(),
        vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC5_UNORM_BLOCK
        | vk::Format::BC6H_UFLOAT_BLOCK
        | vk::Format::BC7_UNORM_BLOCK => FormatInfo::compressed(16),
        vk::Format::BC2_SRGB_BLOCK | vk::Format::BC3_SRGB_BLOCK | vk::Format::BC7_SRGB_BLOCK => {
            FormatInfo::compressed(16).srgb()
        }
        vk::Format::D16_UNORM => FormatInfo::depth_stencil(2, DEPTH),
        vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => FormatInfo::depth_stencil(4, DEPTH),
        vk::Format::S8_UINT => FormatInfo::depth_stencil(1, STENCIL),
        vk::Format::D24_UNORM_S8_UINT => FormatInfo::depth_stencil(4, DEPTH_STENCIL),
        vk::Format::D32_SFLOAT_S8_UINT => FormatInfo::depth_stencil(8, DEPTH_STENCIL),
        _ => return None,
    };

    Some(info)
}

///Size of a single aspect's element, as used by buffer-image copies. Depth/stencil images are copied one
/// aspect at a time with aspect specific packing.
pub fn aspect_element_size(format: vk::Format, aspect: vk::ImageAspectFlags) -> Option<u32> {
    let info = format_info(format)?;
    if aspect == vk::ImageAspectFlags::STENCIL {
        return info.has_stencil().then_some(1);
    }
    if aspect == vk::ImageAspectFlags::DEPTH {
        return match format {
            vk::Format::D16_UNORM => Some(2),
            vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D32_SFLOAT_S8_UINT => Some(4),
            _ => None,
        };
    }

    (aspect == vk::ImageAspectFlags::COLOR && info.aspects == vk::ImageAspectFlags::COLOR)
        .then_some(info.element_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_region_size() {
        let info = format_info(vk::Format::BC1_RGBA_UNORM_BLOCK).unwrap();
        let size = info.region_size(vk::Extent3D {
            width: 6,
            height: 4,
            depth: 1,
        });
        //two blocks of eight bytes
        assert_eq!(size, 16);
    }

    #[test]
    fn depth_stencil_aspects() {
        assert_eq!(aspect_element_size(vk::Format::D24_UNORM_S8_UINT, STENCIL), Some(1));
        assert_eq!(aspect_element_size(vk::Format::D24_UNORM_S8_UINT, DEPTH), Some(4));
        assert_eq!(
            aspect_element_size(vk::Format::D24_UNORM_S8_UINT, vk::ImageAspectFlags::COLOR),
            None
        );
        assert!(format_info(vk::Format::UNDEFINED).is_none());
    }
}
