// Portable pixel formats
//
// Pure lookup tables: sizes, block extents and aspect classification.
// Native encodings live next to each backend in `native::*`.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    #[default]
    Unknown,

    // 8-bit
    R8Unorm,
    R8Uint,
    // 16-bit
    Rg8Unorm,
    R16Unorm,
    R16Uint,
    R16Float,
    // 32-bit
    R32Uint,
    R32Sint,
    R32Float,
    Rg16Float,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba8Uint,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10a2Unorm,
    Rg11b10Float,
    // 64-bit
    Rg32Float,
    Rgba16Unorm,
    Rgba16Float,
    // 128-bit
    Rgba32Uint,
    Rgba32Float,

    // Depth / stencil
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8UintX24,

    // Block compressed
    Bc1RgbaUnorm,
    Bc1RgbaUnormSrgb,
    Bc3RgbaUnorm,
    Bc5RgUnorm,
    Bc7RgbaUnorm,
    Bc7RgbaUnormSrgb,
}

impl Format {
    /// Bits per pixel. Block-compressed formats report the average over a block.
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R8Unorm | Format::R8Uint => 8,
            Format::Rg8Unorm
            | Format::R16Unorm
            | Format::R16Uint
            | Format::R16Float
            | Format::D16Unorm => 16,
            Format::R32Uint
            | Format::R32Sint
            | Format::R32Float
            | Format::Rg16Float
            | Format::Rgba8Unorm
            | Format::Rgba8UnormSrgb
            | Format::Rgba8Uint
            | Format::Bgra8Unorm
            | Format::Bgra8UnormSrgb
            | Format::Rgb10a2Unorm
            | Format::Rg11b10Float
            | Format::D24UnormS8Uint
            | Format::D32Float => 32,
            Format::Rg32Float
            | Format::Rgba16Unorm
            | Format::Rgba16Float
            | Format::D32FloatS8UintX24 => 64,
            Format::Rgba32Uint | Format::Rgba32Float => 128,
            Format::Bc1RgbaUnorm | Format::Bc1RgbaUnormSrgb => 4,
            Format::Bc3RgbaUnorm
            | Format::Bc5RgUnorm
            | Format::Bc7RgbaUnorm
            | Format::Bc7RgbaUnormSrgb => 8,
        }
    }

    pub const fn is_compressed(self) -> bool {
        matches!(
            self,
            Format::Bc1RgbaUnorm
                | Format::Bc1RgbaUnormSrgb
                | Format::Bc3RgbaUnorm
                | Format::Bc5RgUnorm
                | Format::Bc7RgbaUnorm
                | Format::Bc7RgbaUnormSrgb
        )
    }

    pub const fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D24UnormS8Uint | Format::D32Float | Format::D32FloatS8UintX24
        )
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32FloatS8UintX24)
    }

    /// Returns `(block_width, block_height, bytes_per_block)`.
    /// Uncompressed formats are 1x1 blocks.
    pub const fn block_info(self) -> (u32, u32, u32) {
        if self.is_compressed() {
            (4, 4, self.bits_per_pixel() * 16 / 8)
        } else {
            (1, 1, self.bits_per_pixel() / 8)
        }
    }

    /// Byte stride of one element when used as an index buffer format.
    pub const fn index_stride(self) -> Option<u32> {
        match self {
            Format::R16Uint => Some(2),
            Format::R32Uint => Some(4),
            _ => None,
        }
    }

    /// Encodes a clear colour for formats the host timeline knows how to fill.
    pub fn encode_clear_color(self, color: glam::Vec4) -> Option<Vec<u8>> {
        let unorm8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
        match self {
            Format::R8Unorm => Some(vec![unorm8(color.x)]),
            Format::Rgba8Unorm | Format::Rgba8UnormSrgb => Some(vec![
                unorm8(color.x),
                unorm8(color.y),
                unorm8(color.z),
                unorm8(color.w),
            ]),
            Format::Bgra8Unorm | Format::Bgra8UnormSrgb => Some(vec![
                unorm8(color.z),
                unorm8(color.y),
                unorm8(color.x),
                unorm8(color.w),
            ]),
            Format::R32Float => Some(color.x.to_le_bytes().to_vec()),
            Format::Rgba32Float => Some(
                color
                    .to_array()
                    .iter()
                    .flat_map(|c| c.to_le_bytes())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Encodes a depth clear value for depth-only formats.
    pub fn encode_clear_depth(self, depth: f32) -> Option<Vec<u8>> {
        match self {
            Format::D32Float => Some(depth.to_le_bytes().to_vec()),
            Format::D16Unorm => Some(((depth.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16).to_le_bytes().to_vec()),
            _ => None,
        }
    }
}
