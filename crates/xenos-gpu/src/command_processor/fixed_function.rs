//! Viewport, scissor, blend factor and stencil reference.
//!
//! Register writes only set a dirty bit. At draw time each dirty category is
//! recomputed and recorded if it differs from what the command list already
//! has.

use bitflags::bitflags;

use crate::cmd::{CommandList, HostCmd, ScissorRect, Viewport};
use crate::registers::*;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FixedFunctionDirty: u8 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const BLEND_FACTOR = 1 << 2;
        const STENCIL_REF = 1 << 3;
    }
}

impl FixedFunctionDirty {
    /// Category affected by a write to `index`, if any.
    pub(crate) fn for_register(index: u32) -> Self {
        match index {
            PA_CL_VPORT_XSCALE..=PA_CL_VPORT_ZOFFSET | PA_CL_VTE_CNTL => Self::VIEWPORT,
            PA_SC_WINDOW_OFFSET | PA_SU_SC_MODE_CNTL => Self::VIEWPORT | Self::SCISSOR,
            PA_SC_WINDOW_SCISSOR_TL | PA_SC_WINDOW_SCISSOR_BR => Self::SCISSOR,
            RB_BLEND_RED..=RB_BLEND_ALPHA => Self::BLEND_FACTOR,
            RB_STENCILREFMASK => Self::STENCIL_REF,
            _ => Self::empty(),
        }
    }
}

/// `PA_CL_VTE_CNTL` scale and offset enables for x, y, z.
const VTE_XY_SCALE_OFFSET: u32 = 0b1111;
const VTE_Z_SCALE_OFFSET: u32 = 0b11_0000;
const SC_MODE_VTX_WINDOW_OFFSET_ENABLE: u32 = 1 << 16;
const SCISSOR_WINDOW_OFFSET_DISABLE: u32 = 1 << 31;

fn sign_extend_15(value: u32) -> i32 {
    ((value << 17) as i32) >> 17
}

fn window_offset(regs: &RegisterFile) -> (i32, i32) {
    let raw = regs.get(PA_SC_WINDOW_OFFSET);
    (sign_extend_15(raw & 0x7FFF), sign_extend_15((raw >> 16) & 0x7FFF))
}

/// Whether the guest applies the viewport transform itself.
pub(crate) fn viewport_transform_enabled(regs: &RegisterFile) -> bool {
    regs.get(PA_CL_VTE_CNTL) & VTE_XY_SCALE_OFFSET == VTE_XY_SCALE_OFFSET
}

pub(crate) fn compute_viewport(regs: &RegisterFile, rt_width: u32, rt_height: u32) -> Viewport {
    let (mut x, mut y, width, height) = if viewport_transform_enabled(regs) {
        let x_scale = regs.get_f32(PA_CL_VPORT_XSCALE).abs();
        let y_scale = regs.get_f32(PA_CL_VPORT_YSCALE).abs();
        (
            regs.get_f32(PA_CL_VPORT_XOFFSET) - x_scale,
            regs.get_f32(PA_CL_VPORT_YOFFSET) - y_scale,
            x_scale * 2.0,
            y_scale * 2.0,
        )
    } else {
        (0.0, 0.0, rt_width as f32, rt_height as f32)
    };
    if regs.get(PA_SU_SC_MODE_CNTL) & SC_MODE_VTX_WINDOW_OFFSET_ENABLE != 0 {
        let (dx, dy) = window_offset(regs);
        x += dx as f32;
        y += dy as f32;
    }

    let (min_depth, max_depth) =
        if regs.get(PA_CL_VTE_CNTL) & VTE_Z_SCALE_OFFSET == VTE_Z_SCALE_OFFSET {
            let offset = regs.get_f32(PA_CL_VPORT_ZOFFSET);
            let scale = regs.get_f32(PA_CL_VPORT_ZSCALE);
            let (a, b) = (offset, offset + scale);
            (a.min(b).clamp(0.0, 1.0), a.max(b).clamp(0.0, 1.0))
        } else {
            (0.0, 1.0)
        };

    Viewport {
        x,
        y,
        width,
        height,
        min_depth,
        max_depth,
    }
}

pub(crate) fn compute_scissor(regs: &RegisterFile) -> ScissorRect {
    let tl = regs.get(PA_SC_WINDOW_SCISSOR_TL);
    let br = regs.get(PA_SC_WINDOW_SCISSOR_BR);
    let mut left = (tl & 0x7FFF) as i32;
    let mut top = ((tl >> 16) & 0x7FFF) as i32;
    let mut right = (br & 0x7FFF) as i32;
    let mut bottom = ((br >> 16) & 0x7FFF) as i32;
    if tl & SCISSOR_WINDOW_OFFSET_DISABLE == 0 {
        let (dx, dy) = window_offset(regs);
        left += dx;
        right += dx;
        top += dy;
        bottom += dy;
    }
    let left = left.max(0) as u32;
    let top = top.max(0) as u32;
    ScissorRect {
        left,
        top,
        right: (right.max(0) as u32).max(left),
        bottom: (bottom.max(0) as u32).max(top),
    }
}

/// What the current command list has recorded, plus pending changes.
#[derive(Debug)]
pub(crate) struct FixedFunctionState {
    dirty: FixedFunctionDirty,
    /// Render target size the recorded viewport was computed for.
    rt_size: Option<(u32, u32)>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    blend_factor: Option<[f32; 4]>,
    stencil_ref: Option<u32>,
}

impl FixedFunctionState {
    pub(crate) fn new() -> Self {
        Self {
            dirty: FixedFunctionDirty::all(),
            rt_size: None,
            viewport: None,
            scissor: None,
            blend_factor: None,
            stencil_ref: None,
        }
    }

    pub(crate) fn register_written(&mut self, index: u32) {
        self.dirty |= FixedFunctionDirty::for_register(index);
    }

    pub(crate) fn dirty(&self) -> FixedFunctionDirty {
        self.dirty
    }

    /// A fresh command list has no fixed-function state recorded.
    pub(crate) fn invalidate(&mut self) {
        *self = Self::new();
    }

    /// Records whatever is dirty and differs from the list's current state.
    pub(crate) fn update(
        &mut self,
        regs: &RegisterFile,
        list: &mut CommandList,
        rt_width: u32,
        rt_height: u32,
    ) {
        let mut dirty = std::mem::replace(&mut self.dirty, FixedFunctionDirty::empty());
        // Without the guest transform the viewport covers the whole target.
        if self.rt_size != Some((rt_width, rt_height)) {
            self.rt_size = Some((rt_width, rt_height));
            dirty |= FixedFunctionDirty::VIEWPORT;
        }

        if dirty.contains(FixedFunctionDirty::VIEWPORT) {
            let viewport = compute_viewport(regs, rt_width, rt_height);
            if self.viewport != Some(viewport) {
                list.push(HostCmd::SetViewport(viewport));
                self.viewport = Some(viewport);
            }
        }
        if dirty.contains(FixedFunctionDirty::SCISSOR) {
            let scissor = compute_scissor(regs);
            if self.scissor != Some(scissor) {
                list.push(HostCmd::SetScissor(scissor));
                self.scissor = Some(scissor);
            }
        }
        if dirty.contains(FixedFunctionDirty::BLEND_FACTOR) {
            let factor = [
                regs.get_f32(RB_BLEND_RED),
                regs.get_f32(RB_BLEND_GREEN),
                regs.get_f32(RB_BLEND_BLUE),
                regs.get_f32(RB_BLEND_ALPHA),
            ];
            if self.blend_factor != Some(factor) {
                list.push(HostCmd::SetBlendFactor(factor));
                self.blend_factor = Some(factor);
            }
        }
        if dirty.contains(FixedFunctionDirty::STENCIL_REF) {
            let stencil_ref = regs.get(RB_STENCILREFMASK) & 0xFF;
            if self.stencil_ref != Some(stencil_ref) {
                list.push(HostCmd::SetStencilRef(stencil_ref));
                self.stencil_ref = Some(stencil_ref);
            }
        }
    }
}
