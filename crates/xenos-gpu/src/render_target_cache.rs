//! Guest EDRAM surface bindings to host attachments.

use hashbrown::HashMap;
use tracing::debug;

use crate::backend::{
    BackendError, GpuBackend, ResourceId, ResourceState, TextureDesc, TextureDimension,
    TextureFormat,
};
use crate::deferred::{DeferredDeletionQueue, DeferredObject};
use crate::pipeline_cache::RenderTargetFormats;
use crate::registers::*;
use crate::xenos::{ColorInfo, DepthControl, DepthInfo, SurfaceInfo};

/// Packed host render target identity:
/// `width / 80` (7 bits), `height / 16` (9 bits), depth flag (1 bit),
/// format (4 bits), all in supersampled units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetKey(u32);

impl RenderTargetKey {
    pub fn new(width_ss_div_80: u32, height_ss_div_16: u32, is_depth: bool, format: u32) -> Self {
        debug_assert!(width_ss_div_80 < (1 << 7));
        debug_assert!(height_ss_div_16 < (1 << 9));
        Self(
            (width_ss_div_80 & 0x7F)
                | ((height_ss_div_16 & 0x1FF) << 7)
                | (u32::from(is_depth) << 16)
                | ((format & 0xF) << 17),
        )
    }

    pub fn width_ss_div_80(self) -> u32 {
        self.0 & 0x7F
    }

    pub fn height_ss_div_16(self) -> u32 {
        (self.0 >> 7) & 0x1FF
    }

    pub fn is_depth(self) -> bool {
        (self.0 >> 16) & 1 != 0
    }

    pub fn format(self) -> u32 {
        (self.0 >> 17) & 0xF
    }

    pub fn width(self) -> u32 {
        self.width_ss_div_80() * 80
    }

    pub fn height(self) -> u32 {
        self.height_ss_div_16() * 16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    key: RenderTargetKey,
    edram_base: u32,
    resource: ResourceId,
    format: TextureFormat,
}

/// Result of [`RenderTargetCache::update_render_targets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetConfig {
    pub formats: RenderTargetFormats,
    pub colors: [Option<ResourceId>; 4],
    pub depth: Option<ResourceId>,
    pub width: u32,
    pub height: u32,
    /// The attachments differ from what the command list has bound.
    pub changed: bool,
}

/// Source of a resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveSource {
    pub resource: ResourceId,
    pub format: TextureFormat,
    pub state: ResourceState,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Default)]
pub struct RenderTargetCache {
    targets: HashMap<(RenderTargetKey, u32), ResourceId>,
    current: [Option<Binding>; 5],
    bound_on_list: bool,
}

impl RenderTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// A new command list has nothing bound.
    pub fn invalidate_bindings(&mut self) {
        self.bound_on_list = false;
    }

    fn get_or_create<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: RenderTargetKey,
        edram_base: u32,
        format: TextureFormat,
    ) -> Result<ResourceId, BackendError> {
        if let Some(&id) = self.targets.get(&(key, edram_base)) {
            return Ok(id);
        }
        let id = backend.create_texture(&TextureDesc {
            label: "xenos render target",
            dimension: TextureDimension::D2,
            format,
            width: key.width(),
            height: key.height(),
            depth_or_layers: 1,
            mip_levels: 1,
            initial_state: if key.is_depth() {
                ResourceState::DEPTH_WRITE
            } else {
                ResourceState::RENDER_TARGET
            },
            render_attachment: true,
        })?;
        debug!(
            width = key.width(),
            height = key.height(),
            depth = key.is_depth(),
            edram_base,
            "created render target"
        );
        self.targets.insert((key, edram_base), id);
        Ok(id)
    }

    /// Works out the attachments for the next draw. `None` when the guest
    /// state does not describe a usable surface yet.
    pub fn update_render_targets<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        regs: &RegisterFile,
        color_targets_written: u8,
    ) -> Result<Option<RenderTargetConfig>, BackendError> {
        let surface = SurfaceInfo::from_regs(regs);
        let br = regs.get(PA_SC_WINDOW_SCISSOR_BR);
        let height = (br >> 16) & 0x7FFF;
        if surface.pitch == 0 || height == 0 {
            return Ok(None);
        }
        let ss = surface.msaa_samples.min(4);
        let width_ss_div_80 = (surface.pitch * if ss >= 4 { 2 } else { 1 }).div_ceil(80);
        let height_ss_div_16 = (height * if ss >= 2 { 2 } else { 1 }).div_ceil(16);
        if width_ss_div_80 >= (1 << 7) || height_ss_div_16 >= (1 << 9) {
            return Ok(None);
        }

        let mut next = [None; 5];
        let color_mask = regs.get(RB_COLOR_MASK);
        for (i, reg) in ColorInfo::REGISTERS.into_iter().enumerate() {
            if color_targets_written & (1 << i) == 0 || (color_mask >> (i * 4)) & 0xF == 0 {
                continue;
            }
            let info = ColorInfo::from_raw(regs.get(reg));
            let Some(format) = info.host_format() else {
                return Ok(None);
            };
            let key = RenderTargetKey::new(width_ss_div_80, height_ss_div_16, false, info.format);
            let resource = self.get_or_create(backend, key, info.edram_base, format)?;
            next[i] = Some(Binding {
                key,
                edram_base: info.edram_base,
                resource,
                format,
            });
        }
        if DepthControl::from_regs(regs).uses_depth_buffer() {
            let info = DepthInfo::from_regs(regs);
            let format = info.host_format();
            let key = RenderTargetKey::new(
                width_ss_div_80,
                height_ss_div_16,
                true,
                u32::from(info.float24),
            );
            let resource = self.get_or_create(backend, key, info.edram_base, format)?;
            next[4] = Some(Binding {
                key,
                edram_base: info.edram_base,
                resource,
                format,
            });
        }

        let changed = !self.bound_on_list || next != self.current;
        self.current = next;
        self.bound_on_list = true;

        let colors = std::array::from_fn(|i| next[i].map(|b| b.resource));
        let formats = RenderTargetFormats {
            colors: std::array::from_fn(|i| next[i].map(|b| b.format)),
            depth: next[4].map(|b| b.format),
        };
        Ok(Some(RenderTargetConfig {
            formats,
            colors,
            depth: next[4].map(|b| b.resource),
            width: width_ss_div_80 * 80,
            height: height_ss_div_16 * 16,
            changed,
        }))
    }

    /// The attachment `RB_COPY_CONTROL` selects: 0-3 color, 4 depth.
    pub fn resolve_source(&self, regs: &RegisterFile) -> Option<ResolveSource> {
        let select = (regs.get(RB_COPY_CONTROL) & 0x7) as usize;
        let binding = self.current.get(select.min(4))?.as_ref()?;
        Some(ResolveSource {
            resource: binding.resource,
            format: binding.format,
            state: if binding.key.is_depth() {
                ResourceState::DEPTH_WRITE
            } else {
                ResourceState::RENDER_TARGET
            },
            width: binding.key.width(),
            height: binding.key.height(),
        })
    }

    /// Drops every render target. Destruction waits for in-flight frames.
    pub fn clear(&mut self, deferred: &mut DeferredDeletionQueue, current_frame: u64) {
        for (_, id) in self.targets.drain() {
            deferred.push(DeferredObject::Resource(id), current_frame);
        }
        self.current = [None; 5];
        self.bound_on_list = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;

    fn color_regs() -> RegisterFile {
        let mut regs = RegisterFile::new();
        regs.set(RB_SURFACE_INFO, 1280);
        regs.set(PA_SC_WINDOW_SCISSOR_BR, (720 << 16) | 1280);
        regs.set(RB_COLOR_MASK, 0xF);
        regs
    }

    #[test]
    fn key_packs_fields() {
        let key = RenderTargetKey::new(16, 45, true, 1);
        assert_eq!(key.width(), 1280);
        assert_eq!(key.height(), 720);
        assert!(key.is_depth());
        assert_eq!(key.format(), 1);
    }

    #[test]
    fn unchanged_state_does_not_rebind() {
        let mut backend = NullBackend::default();
        let mut cache = RenderTargetCache::new();
        let regs = color_regs();

        let first = cache.update_render_targets(&mut backend, &regs, 1).unwrap().unwrap();
        assert!(first.changed);
        assert!(first.colors[0].is_some());
        assert_eq!(first.formats.colors[0], Some(TextureFormat::Rgba8Unorm));
        assert_eq!((first.width, first.height), (1280, 720));

        let second = cache.update_render_targets(&mut backend, &regs, 1).unwrap().unwrap();
        assert!(!second.changed);

        cache.invalidate_bindings();
        let third = cache.update_render_targets(&mut backend, &regs, 1).unwrap().unwrap();
        assert!(third.changed);
        assert_eq!(cache.target_count(), 1);
    }

    #[test]
    fn depth_attachment_follows_depth_control() {
        let mut backend = NullBackend::default();
        let mut cache = RenderTargetCache::new();
        let mut regs = color_regs();
        regs.set(RB_DEPTHCONTROL, 0b110);
        regs.set(RB_DEPTH_INFO, 1 << 16);

        let config = cache.update_render_targets(&mut backend, &regs, 0).unwrap().unwrap();
        assert!(config.colors.iter().all(Option::is_none));
        assert_eq!(config.formats.depth, Some(TextureFormat::Depth32FloatStencil8));

        regs.set(RB_COPY_CONTROL, 4);
        let source = cache.resolve_source(&regs).unwrap();
        assert_eq!(source.state, ResourceState::DEPTH_WRITE);
    }

    #[test]
    fn zero_pitch_is_not_resolvable() {
        let mut backend = NullBackend::default();
        let mut cache = RenderTargetCache::new();
        let mut regs = color_regs();
        regs.set(RB_SURFACE_INFO, 0);
        assert_eq!(cache.update_render_targets(&mut backend, &regs, 1).unwrap(), None);
    }
}
