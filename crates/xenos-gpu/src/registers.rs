//! Shadow copy of the Xenos register file.
//!
//! Indices are dword offsets as written by the guest. Only the registers the
//! command processor interprets have names here.

pub const REGISTER_COUNT: u32 = 0x5003;

pub const RB_SURFACE_INFO: u32 = 0x2000;
pub const RB_COLOR_INFO: u32 = 0x2001;
pub const RB_DEPTH_INFO: u32 = 0x2002;
pub const RB_COLOR1_INFO: u32 = 0x2003;
pub const RB_COLOR2_INFO: u32 = 0x2004;
pub const RB_COLOR3_INFO: u32 = 0x2005;

pub const PA_SC_WINDOW_OFFSET: u32 = 0x2080;
pub const PA_SC_WINDOW_SCISSOR_TL: u32 = 0x2081;
pub const PA_SC_WINDOW_SCISSOR_BR: u32 = 0x2082;

pub const VGT_MAX_VTX_INDX: u32 = 0x2100;
pub const VGT_MIN_VTX_INDX: u32 = 0x2101;
pub const VGT_INDX_OFFSET: u32 = 0x2102;

pub const RB_COLOR_MASK: u32 = 0x2104;
pub const RB_BLEND_RED: u32 = 0x2105;
pub const RB_BLEND_GREEN: u32 = 0x2106;
pub const RB_BLEND_BLUE: u32 = 0x2107;
pub const RB_BLEND_ALPHA: u32 = 0x2108;
pub const RB_STENCILREFMASK: u32 = 0x210D;
pub const RB_ALPHA_REF: u32 = 0x210E;

pub const PA_CL_VPORT_XSCALE: u32 = 0x210F;
pub const PA_CL_VPORT_XOFFSET: u32 = 0x2110;
pub const PA_CL_VPORT_YSCALE: u32 = 0x2111;
pub const PA_CL_VPORT_YOFFSET: u32 = 0x2112;
pub const PA_CL_VPORT_ZSCALE: u32 = 0x2113;
pub const PA_CL_VPORT_ZOFFSET: u32 = 0x2114;

pub const SQ_PROGRAM_CNTL: u32 = 0x2180;

pub const RB_DEPTHCONTROL: u32 = 0x2200;
pub const RB_BLENDCONTROL0: u32 = 0x2201;
pub const RB_COLORCONTROL: u32 = 0x2202;
pub const PA_CL_CLIP_CNTL: u32 = 0x2204;
pub const PA_SU_SC_MODE_CNTL: u32 = 0x2205;
pub const PA_CL_VTE_CNTL: u32 = 0x2206;
pub const RB_MODECONTROL: u32 = 0x2208;
pub const RB_BLENDCONTROL1: u32 = 0x2209;
pub const RB_BLENDCONTROL2: u32 = 0x220A;
pub const RB_BLENDCONTROL3: u32 = 0x220B;

pub const RB_COPY_CONTROL: u32 = 0x2318;
pub const RB_COPY_DEST_BASE: u32 = 0x2319;
pub const RB_COPY_DEST_PITCH: u32 = 0x231A;
pub const RB_COPY_DEST_INFO: u32 = 0x231B;

/// 512 float4 constants: 256 for vertex shaders then 256 for pixel shaders.
pub const SHADER_CONSTANT_000_X: u32 = 0x4000;
pub const FLOAT_CONSTANT_DWORDS: u32 = 512 * 4;
/// Float constants are uploaded in pages of 32 float4s.
pub const FLOAT_PAGE_DWORDS: u32 = 32 * 4;
pub const FLOAT_PAGE_COUNT: usize = (FLOAT_CONSTANT_DWORDS / FLOAT_PAGE_DWORDS) as usize;
pub const VERTEX_FLOAT_PAGES: usize = FLOAT_PAGE_COUNT / 2;

/// 32 texture fetch constants of six dwords each, aliased by 96 vertex
/// fetch constants of two dwords.
pub const SHADER_CONSTANT_FETCH_00_0: u32 = 0x4800;
pub const FETCH_CONSTANT_DWORDS: u32 = 32 * 6;
pub const SHADER_CONSTANT_BOOL_000_031: u32 = 0x4900;
pub const BOOL_CONSTANT_DWORDS: u32 = 8;
pub const SHADER_CONSTANT_LOOP_00: u32 = 0x4908;
pub const LOOP_CONSTANT_DWORDS: u32 = 32;

#[derive(Clone)]
pub struct RegisterFile {
    values: Box<[u32]>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let written = self.values.iter().filter(|&&v| v != 0).count();
        f.debug_struct("RegisterFile")
            .field("nonzero", &written)
            .finish()
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            values: vec![0u32; REGISTER_COUNT as usize].into_boxed_slice(),
        }
    }

    /// # Panics
    ///
    /// If `index` is outside the register file.
    #[inline]
    pub fn get(&self, index: u32) -> u32 {
        assert!(
            index < REGISTER_COUNT,
            "register index 0x{index:04x} out of range"
        );
        self.values[index as usize]
    }

    #[inline]
    pub fn get_f32(&self, index: u32) -> f32 {
        f32::from_bits(self.get(index))
    }

    /// Stores `value`, returning whether it differs from the previous one.
    ///
    /// # Panics
    ///
    /// If `index` is outside the register file.
    #[inline]
    pub fn set(&mut self, index: u32, value: u32) -> bool {
        assert!(
            index < REGISTER_COUNT,
            "register index 0x{index:04x} out of range"
        );
        let slot = &mut self.values[index as usize];
        let changed = *slot != value;
        *slot = value;
        changed
    }

    /// Contiguous register range starting at `start`.
    pub fn slice(&self, start: u32, len: u32) -> &[u32] {
        let end = start + len;
        assert!(end <= REGISTER_COUNT, "register range 0x{start:04x}+{len} out of range");
        &self.values[start as usize..end as usize]
    }

    /// The six dwords of texture fetch constant `index` (0..32).
    pub fn texture_fetch(&self, index: u32) -> [u32; 6] {
        let s = self.slice(SHADER_CONSTANT_FETCH_00_0 + index * 6, 6);
        [s[0], s[1], s[2], s[3], s[4], s[5]]
    }

    /// The two dwords of vertex fetch constant `index` (0..96).
    pub fn vertex_fetch(&self, index: u32) -> [u32; 2] {
        let s = self.slice(SHADER_CONSTANT_FETCH_00_0 + index * 2, 2);
        [s[0], s[1]]
    }
}
