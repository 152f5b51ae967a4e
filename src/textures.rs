// DDS texture parsing
//
// The texture collaborator hands the renderer .dds files with
// block-compressed data; this module validates the header, maps the
// format tag to a Vulkan format, and computes the mip chain layout the
// upload path copies level by level. Formats: legacy DXT1/3/5 FourCC
// plus DX10 header BC1-BC7.

use ash::vk;

use crate::{BlitzenError, Result};
use utils::log;

use std::fs;
use std::path::Path;

const DDS_HEADER_SIZE: usize = 124;
const DDS_PIXELFORMAT_SIZE: u32 = 32;
const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x200000;
const DDS_DIMENSION_TEXTURE2D: u32 = 3;

// The dxgi format ids the DX10 extension header can carry
const DXGI_FORMAT_BC1_UNORM: u32 = 71;
const DXGI_FORMAT_BC1_UNORM_SRGB: u32 = 72;
const DXGI_FORMAT_BC2_UNORM: u32 = 74;
const DXGI_FORMAT_BC2_UNORM_SRGB: u32 = 75;
const DXGI_FORMAT_BC3_UNORM: u32 = 77;
const DXGI_FORMAT_BC3_UNORM_SRGB: u32 = 78;
const DXGI_FORMAT_BC4_UNORM: u32 = 80;
const DXGI_FORMAT_BC4_SNORM: u32 = 81;
const DXGI_FORMAT_BC5_UNORM: u32 = 83;
const DXGI_FORMAT_BC5_SNORM: u32 = 84;
const DXGI_FORMAT_BC6H_UF16: u32 = 95;
const DXGI_FORMAT_BC6H_SF16: u32 = 96;
const DXGI_FORMAT_BC7_UNORM: u32 = 98;
const DXGI_FORMAT_BC7_UNORM_SRGB: u32 = 99;

pub fn four_cc(s: &[u8; 4]) -> u32 {
    (s[0] as u32) | (s[1] as u32) << 8 | (s[2] as u32) << 16 | (s[3] as u32) << 24
}

/// A parsed, validated DDS file with its raw block-compressed mip chain
pub struct DdsTexture {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub block_size: u32,
    /// All mip levels, tightly packed largest first
    pub data: Vec<u8>,
}

/// One buffer-to-image copy: where a mip level sits in `data` and its extent
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MipRegion {
    pub offset: usize,
    pub width: u32,
    pub height: u32,
}

impl DdsTexture {
    pub fn load(filepath: &Path) -> Result<Self> {
        let bytes = fs::read(filepath).map_err(|_| {
            log::error!("Could not open texture file {:?}", filepath);
            BlitzenError::TEXTURE_LOAD_FAILED
        })?;
        Self::parse(&bytes)
    }

    /// Parses the magic, header and optional DX10 extension, then keeps
    /// the payload. Cubemaps and volumes are rejected; DX10 files must
    /// be plain 2D textures.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 + DDS_HEADER_SIZE || read_u32(bytes, 0) != four_cc(b"DDS ") {
            return Err(BlitzenError::TEXTURE_LOAD_FAILED);
        }

        let header = &bytes[4..4 + DDS_HEADER_SIZE];
        if read_u32(header, 0) != DDS_HEADER_SIZE as u32
            || read_u32(header, 72) != DDS_PIXELFORMAT_SIZE
        {
            return Err(BlitzenError::TEXTURE_LOAD_FAILED);
        }

        let height = read_u32(header, 8);
        let width = read_u32(header, 12);
        let mip_levels = utils::partial_max(read_u32(header, 24), 1);
        let pf_four_cc = read_u32(header, 80);
        let caps2 = read_u32(header, 108);

        if caps2 & (DDSCAPS2_CUBEMAP | DDSCAPS2_VOLUME) != 0 {
            return Err(BlitzenError::TEXTURE_LOAD_FAILED);
        }

        let mut data_start = 4 + DDS_HEADER_SIZE;
        let dxgi_format = if pf_four_cc == four_cc(b"DX10") {
            if bytes.len() < data_start + 20 {
                return Err(BlitzenError::TEXTURE_LOAD_FAILED);
            }
            let header10 = &bytes[data_start..data_start + 20];
            if read_u32(header10, 4) != DDS_DIMENSION_TEXTURE2D {
                return Err(BlitzenError::TEXTURE_LOAD_FAILED);
            }
            data_start += 20;
            Some(read_u32(header10, 0))
        } else {
            None
        };

        let format = vk_format(pf_four_cc, dxgi_format)?;
        let block_size = block_size(pf_four_cc, dxgi_format);

        let expected = image_size_bc(width, height, mip_levels, block_size);
        let data = bytes[data_start..].to_vec();
        if data.len() < expected {
            log::error!(
                "DDS payload holds {} bytes but the mip chain needs {}",
                data.len(),
                expected
            );
            return Err(BlitzenError::TEXTURE_LOAD_FAILED);
        }

        Ok(Self {
            width,
            height,
            mip_levels,
            format,
            block_size,
            data,
        })
    }

    /// Total bytes of the mip chain
    pub fn byte_size(&self) -> usize {
        image_size_bc(self.width, self.height, self.mip_levels, self.block_size)
    }

    /// Offsets and extents for the per-level buffer-image copies
    pub fn mip_regions(&self) -> Vec<MipRegion> {
        let mut regions = Vec::with_capacity(self.mip_levels as usize);
        let mut offset = 0;
        let mut width = self.width;
        let mut height = self.height;
        for _ in 0..self.mip_levels {
            regions.push(MipRegion {
                offset,
                width,
                height,
            });
            offset += level_size(width, height, self.block_size);
            width = utils::partial_max(width / 2, 1);
            height = utils::partial_max(height / 2, 1);
        }
        regions
    }
}

/// Block bytes of one mip level: `ceil(w/4) * ceil(h/4) * blockSize`
fn level_size(width: u32, height: u32, block_size: u32) -> usize {
    (((width + 3) / 4) * ((height + 3) / 4) * block_size) as usize
}

/// Mip chain byte size for a block-compressed image
pub fn image_size_bc(width: u32, height: u32, levels: u32, block_size: u32) -> usize {
    let mut result = 0;
    let mut width = width;
    let mut height = height;
    for _ in 0..levels {
        result += level_size(width, height, block_size);
        width = if width > 1 { width / 2 } else { 1 };
        height = if height > 1 { height / 2 } else { 1 };
    }
    result
}

/// 8 bytes per block for BC1/BC4, 16 otherwise
fn block_size(pf_four_cc: u32, dxgi_format: Option<u32>) -> u32 {
    if pf_four_cc == four_cc(b"DXT1") {
        return 8;
    }
    if let Some(dxgi) = dxgi_format {
        match dxgi {
            DXGI_FORMAT_BC1_UNORM
            | DXGI_FORMAT_BC1_UNORM_SRGB
            | DXGI_FORMAT_BC4_UNORM
            | DXGI_FORMAT_BC4_SNORM => return 8,
            _ => return 16,
        }
    }
    16
}

fn vk_format(pf_four_cc: u32, dxgi_format: Option<u32>) -> Result<vk::Format> {
    if let Some(dxgi) = dxgi_format {
        return match dxgi {
            DXGI_FORMAT_BC1_UNORM => Ok(vk::Format::BC1_RGBA_UNORM_BLOCK),
            DXGI_FORMAT_BC1_UNORM_SRGB => Ok(vk::Format::BC1_RGBA_SRGB_BLOCK),
            DXGI_FORMAT_BC2_UNORM => Ok(vk::Format::BC2_UNORM_BLOCK),
            DXGI_FORMAT_BC2_UNORM_SRGB => Ok(vk::Format::BC2_SRGB_BLOCK),
            DXGI_FORMAT_BC3_UNORM => Ok(vk::Format::BC3_UNORM_BLOCK),
            DXGI_FORMAT_BC3_UNORM_SRGB => Ok(vk::Format::BC3_SRGB_BLOCK),
            DXGI_FORMAT_BC4_UNORM => Ok(vk::Format::BC4_UNORM_BLOCK),
            DXGI_FORMAT_BC4_SNORM => Ok(vk::Format::BC4_SNORM_BLOCK),
            DXGI_FORMAT_BC5_UNORM => Ok(vk::Format::BC5_UNORM_BLOCK),
            DXGI_FORMAT_BC5_SNORM => Ok(vk::Format::BC5_SNORM_BLOCK),
            DXGI_FORMAT_BC6H_UF16 => Ok(vk::Format::BC6H_UFLOAT_BLOCK),
            DXGI_FORMAT_BC6H_SF16 => Ok(vk::Format::BC6H_SFLOAT_BLOCK),
            DXGI_FORMAT_BC7_UNORM => Ok(vk::Format::BC7_UNORM_BLOCK),
            DXGI_FORMAT_BC7_UNORM_SRGB => Ok(vk::Format::BC7_SRGB_BLOCK),
            _ => Err(BlitzenError::TEXTURE_LOAD_FAILED),
        };
    }

    if pf_four_cc == four_cc(b"DXT1") {
        Ok(vk::Format::BC1_RGBA_UNORM_BLOCK)
    } else if pf_four_cc == four_cc(b"DXT3") {
        Ok(vk::Format::BC2_UNORM_BLOCK)
    } else if pf_four_cc == four_cc(b"DXT5") {
        Ok(vk::Format::BC3_UNORM_BLOCK)
    } else {
        Err(BlitzenError::TEXTURE_LOAD_FAILED)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the 128 byte prefix of a legacy DDS file
    fn legacy_header(width: u32, height: u32, mips: u32, fourcc: &[u8; 4], caps2: u32) -> Vec<u8> {
        let mut b = vec![0u8; 4 + DDS_HEADER_SIZE];
        b[0..4].copy_from_slice(b"DDS ");
        let h = &mut b[4..];
        h[0..4].copy_from_slice(&(DDS_HEADER_SIZE as u32).to_le_bytes());
        h[8..12].copy_from_slice(&height.to_le_bytes());
        h[12..16].copy_from_slice(&width.to_le_bytes());
        h[24..28].copy_from_slice(&mips.to_le_bytes());
        h[72..76].copy_from_slice(&DDS_PIXELFORMAT_SIZE.to_le_bytes());
        h[80..84].copy_from_slice(fourcc);
        h[108..112].copy_from_slice(&caps2.to_le_bytes());
        b
    }

    fn dx10_header(width: u32, height: u32, mips: u32, dxgi: u32, dimension: u32) -> Vec<u8> {
        let mut b = legacy_header(width, height, mips, b"DX10", 0);
        let mut ext = vec![0u8; 20];
        ext[0..4].copy_from_slice(&dxgi.to_le_bytes());
        ext[4..8].copy_from_slice(&dimension.to_le_bytes());
        b.extend_from_slice(&ext);
        b
    }

    #[test]
    fn mip_chain_size_sums_block_footprints() {
        // 64x64 BC1: 16*16*8 + 8*8*8 + 4*4*8 = 2048 + 512 + 128
        assert_eq!(image_size_bc(64, 64, 3, 8), 2688);
        // Degenerate tail levels clamp to one block
        assert_eq!(image_size_bc(4, 4, 3, 16), 16 * 3);
        // Non multiple of 4 rounds up to whole blocks
        assert_eq!(image_size_bc(5, 5, 1, 8), 4 * 8);
    }

    #[test]
    fn legacy_dxt_formats_parse() {
        let mut bytes = legacy_header(8, 8, 1, b"DXT1", 0);
        bytes.extend_from_slice(&vec![0u8; image_size_bc(8, 8, 1, 8)]);
        let tex = DdsTexture::parse(&bytes).unwrap();
        assert_eq!(tex.format, vk::Format::BC1_RGBA_UNORM_BLOCK);
        assert_eq!(tex.block_size, 8);

        let mut bytes = legacy_header(8, 8, 1, b"DXT5", 0);
        bytes.extend_from_slice(&vec![0u8; image_size_bc(8, 8, 1, 16)]);
        let tex = DdsTexture::parse(&bytes).unwrap();
        assert_eq!(tex.format, vk::Format::BC3_UNORM_BLOCK);
        assert_eq!(tex.block_size, 16);
    }

    #[test]
    fn dx10_bc7_srgb_parses_with_mips() {
        let mut bytes = dx10_header(64, 32, 4, DXGI_FORMAT_BC7_UNORM_SRGB, DDS_DIMENSION_TEXTURE2D);
        bytes.extend_from_slice(&vec![0u8; image_size_bc(64, 32, 4, 16)]);
        let tex = DdsTexture::parse(&bytes).unwrap();
        assert_eq!(tex.format, vk::Format::BC7_SRGB_BLOCK);
        assert_eq!(tex.mip_levels, 4);

        let regions = tex.mip_regions();
        assert_eq!(regions.len(), 4);
        assert_eq!(
            regions[0],
            MipRegion {
                offset: 0,
                width: 64,
                height: 32
            }
        );
        assert_eq!(regions[1].offset, 16 * 8 * 16);
        assert_eq!(regions[3].width, 8);
        assert_eq!(regions[3].height, 4);
        // The regions tile the payload exactly
        let last = regions[3];
        assert_eq!(
            last.offset + image_size_bc(last.width, last.height, 1, 16),
            tex.byte_size()
        );
    }

    #[test]
    fn cubemaps_and_volumes_are_rejected() {
        let mut bytes = legacy_header(8, 8, 1, b"DXT1", DDSCAPS2_CUBEMAP);
        bytes.extend_from_slice(&vec![0u8; 1024]);
        assert!(DdsTexture::parse(&bytes).is_err());

        let mut bytes = legacy_header(8, 8, 1, b"DXT1", DDSCAPS2_VOLUME);
        bytes.extend_from_slice(&vec![0u8; 1024]);
        assert!(DdsTexture::parse(&bytes).is_err());
    }

    #[test]
    fn dx10_non_2d_is_rejected() {
        let mut bytes = dx10_header(8, 8, 1, DXGI_FORMAT_BC7_UNORM, 4);
        bytes.extend_from_slice(&vec![0u8; 1024]);
        assert!(DdsTexture::parse(&bytes).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = legacy_header(64, 64, 3, b"DXT1", 0);
        bytes.extend_from_slice(&vec![0u8; 100]);
        assert!(DdsTexture::parse(&bytes).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = legacy_header(8, 8, 1, b"DXT1", 0);
        bytes[0] = b'X';
        assert!(DdsTexture::parse(&bytes).is_err());
    }
}
