//! Guest GPU enumerations and register field decoding.

use serde::Serialize;

use crate::backend::{PrimitiveTopologyType, TextureFormat};
use crate::cmd::PrimitiveTopology;
use crate::registers::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ShaderType {
    Vertex,
    Pixel,
}

/// `VGT_DRAW_INITIATOR` primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveType {
    None,
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleFan,
    TriangleStrip,
    RectangleList,
    LineLoop,
    QuadList,
    QuadStrip,
}

impl PrimitiveType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x00 => Self::None,
            0x01 => Self::PointList,
            0x02 => Self::LineList,
            0x03 => Self::LineStrip,
            0x04 => Self::TriangleList,
            0x05 => Self::TriangleFan,
            0x06 => Self::TriangleStrip,
            0x08 => Self::RectangleList,
            0x0C => Self::LineLoop,
            0x0D => Self::QuadList,
            0x0E => Self::QuadStrip,
            _ => return None,
        })
    }

    /// Host topology once fans, quads and rectangles have been expanded into
    /// lists by the primitive converter.
    pub fn host_topology(self) -> Option<PrimitiveTopology> {
        match self {
            Self::None => None,
            Self::PointList => Some(PrimitiveTopology::PointList),
            Self::LineList => Some(PrimitiveTopology::LineList),
            Self::LineStrip | Self::LineLoop => Some(PrimitiveTopology::LineStrip),
            Self::TriangleStrip => Some(PrimitiveTopology::TriangleStrip),
            Self::TriangleList
            | Self::TriangleFan
            | Self::RectangleList
            | Self::QuadList
            | Self::QuadStrip => Some(PrimitiveTopology::TriangleList),
        }
    }
}

impl PrimitiveTopology {
    pub fn topology_type(self) -> PrimitiveTopologyType {
        match self {
            Self::PointList => PrimitiveTopologyType::Point,
            Self::LineList | Self::LineStrip => PrimitiveTopologyType::Line,
            Self::TriangleList | Self::TriangleStrip => PrimitiveTopologyType::Triangle,
        }
    }
}

/// `RB_MODECONTROL` edram mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeControl {
    Ignore,
    ColorDepth,
    Depth,
    Copy,
}

impl ModeControl {
    pub fn from_regs(regs: &RegisterFile) -> Self {
        match regs.get(RB_MODECONTROL) & 0x7 {
            4 => Self::ColorDepth,
            5 => Self::Depth,
            6 => Self::Copy,
            _ => Self::Ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endian {
    None,
    Swap8In16,
    Swap8In32,
    Swap16In32,
}

impl Endian {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::None,
            1 => Self::Swap8In16,
            2 => Self::Swap8In32,
            _ => Self::Swap16In32,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// `RB_SURFACE_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    /// Surface pitch in pixels. Zero means rendering is disabled.
    pub pitch: u32,
    pub msaa_samples: u32,
}

impl SurfaceInfo {
    pub fn from_regs(regs: &RegisterFile) -> Self {
        let raw = regs.get(RB_SURFACE_INFO);
        Self {
            pitch: raw & 0x3FFF,
            msaa_samples: 1 << ((raw >> 16) & 0x3),
        }
    }
}

/// `RB_COLOR*_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorInfo {
    pub edram_base: u32,
    pub format: u32,
}

impl ColorInfo {
    pub const REGISTERS: [u32; 4] = [RB_COLOR_INFO, RB_COLOR1_INFO, RB_COLOR2_INFO, RB_COLOR3_INFO];

    pub fn from_raw(raw: u32) -> Self {
        Self {
            edram_base: raw & 0xFFF,
            format: (raw >> 16) & 0xF,
        }
    }

    pub fn host_format(self) -> Option<TextureFormat> {
        Some(match self.format {
            0 | 1 => TextureFormat::Rgba8Unorm,
            2 | 10 => TextureFormat::Rgb10A2Unorm,
            3 | 5 | 7 | 12 => TextureFormat::Rgba16Float,
            4 | 6 => TextureFormat::Rg16Float,
            14 => TextureFormat::R32Float,
            15 => TextureFormat::Rg32Float,
            _ => return None,
        })
    }
}

/// `RB_DEPTH_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthInfo {
    pub edram_base: u32,
    pub float24: bool,
}

impl DepthInfo {
    pub fn from_regs(regs: &RegisterFile) -> Self {
        let raw = regs.get(RB_DEPTH_INFO);
        Self {
            edram_base: raw & 0xFFF,
            float24: (raw >> 16) & 1 != 0,
        }
    }

    pub fn host_format(self) -> TextureFormat {
        if self.float24 {
            TextureFormat::Depth32FloatStencil8
        } else {
            TextureFormat::Depth24PlusStencil8
        }
    }
}

/// `RB_DEPTHCONTROL` bits the command processor looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthControl {
    pub stencil_enable: bool,
    pub z_enable: bool,
    pub z_write_enable: bool,
}

impl DepthControl {
    pub fn from_regs(regs: &RegisterFile) -> Self {
        let raw = regs.get(RB_DEPTHCONTROL);
        Self {
            stencil_enable: raw & 1 != 0,
            z_enable: raw & 2 != 0,
            z_write_enable: raw & 4 != 0,
        }
    }

    pub fn uses_depth_buffer(self) -> bool {
        self.stencil_enable || self.z_enable
    }
}

/// Vertex fetch constant: a guest buffer the vertex shader reads by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexFetch {
    pub address: u32,
    pub size_bytes: u32,
    pub endian: Endian,
}

impl VertexFetch {
    pub fn decode(dwords: [u32; 2]) -> Option<Self> {
        if dwords[0] & 3 != 3 {
            return None;
        }
        Some(Self {
            address: dwords[0] & !3,
            size_bytes: ((dwords[1] >> 2) & 0xFF_FFFF) * 4,
            endian: Endian::from_bits(dwords[1]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_control_ignores_upper_bits() {
        let mut regs = RegisterFile::new();
        regs.set(RB_MODECONTROL, 0xF0 | 6);
        assert_eq!(ModeControl::from_regs(&regs), ModeControl::Copy);
        regs.set(RB_MODECONTROL, 0);
        assert_eq!(ModeControl::from_regs(&regs), ModeControl::Ignore);
    }

    #[test]
    fn fans_and_quads_become_triangle_lists() {
        for raw in [0x05, 0x08, 0x0D] {
            let prim = PrimitiveType::from_raw(raw).unwrap();
            assert_eq!(prim.host_topology(), Some(PrimitiveTopology::TriangleList));
        }
        assert_eq!(PrimitiveType::None.host_topology(), None);
        assert_eq!(PrimitiveType::from_raw(0x07), None);
    }

    #[test]
    fn vertex_fetch_decodes_address_and_size() {
        let fetch = VertexFetch::decode([0x1000_0003, (64 << 2) | 2]).unwrap();
        assert_eq!(fetch.address, 0x1000_0000);
        assert_eq!(fetch.size_bytes, 256);
        assert_eq!(fetch.endian, Endian::Swap8In32);
        assert_eq!(VertexFetch::decode([0x1000_0002, 0]), None);
    }

    #[test]
    fn surface_pitch_and_color_format() {
        let mut regs = RegisterFile::new();
        regs.set(RB_SURFACE_INFO, 1280 | (2 << 16));
        let surface = SurfaceInfo::from_regs(&regs);
        assert_eq!(surface.pitch, 1280);
        assert_eq!(surface.msaa_samples, 4);
        let color = ColorInfo::from_raw((2 << 16) | 0x40);
        assert_eq!(color.edram_base, 0x40);
        assert_eq!(color.host_format(), Some(TextureFormat::Rgb10A2Unorm));
    }
}
