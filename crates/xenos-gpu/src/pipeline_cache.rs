//! Shader registry and pipeline state objects.

use std::num::NonZeroUsize;
use std::sync::Arc;

use hashbrown::HashMap;
use lru::LruCache;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::backend::{
    BackendError, GpuBackend, PipelineDesc, PipelineId, PrimitiveTopologyType, RootSignatureId,
    TextureFormat,
};
use crate::registers::*;
use crate::shader::{
    Shader, ShaderId, ShaderTranslateError, ShaderTranslator, TranslatedShader, Translation,
};
use crate::xenos::ShaderType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineCacheConfig {
    /// Live pipelines before the least recently used one is evicted.
    pub capacity: usize,
}

impl Default for PipelineCacheConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Whether the pipeline bound on the command list can stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Compatible,
    Mismatch,
}

/// Render target formats a pipeline is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderTargetFormats {
    pub colors: [Option<TextureFormat>; 4],
    pub depth: Option<TextureFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    vertex_shader: u64,
    pixel_shader: Option<u64>,
    root_signature: RootSignatureId,
    topology_type: PrimitiveTopologyType,
    formats: RenderTargetFormats,
    color_mask: u32,
    blend_controls: [u32; 4],
    depth_control: u32,
    cull_mode: u32,
}

pub struct PipelineCache {
    translator: Box<dyn ShaderTranslator>,
    shaders: Vec<Shader>,
    shader_map: HashMap<(ShaderType, u64), ShaderId>,
    pipelines: LruCache<PipelineKey, PipelineId>,
    current: Option<PipelineId>,
    evicted: Vec<PipelineId>,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("shaders", &self.shaders.len())
            .field("pipelines", &self.pipelines.len())
            .field("current", &self.current)
            .finish()
    }
}

impl PipelineCache {
    pub fn new(config: PipelineCacheConfig, translator: Box<dyn ShaderTranslator>) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            translator,
            shaders: Vec::new(),
            shader_map: HashMap::new(),
            pipelines: LruCache::new(capacity),
            current: None,
            evicted: Vec::new(),
        }
    }

    /// Registers guest microcode, returning the existing handle when the same
    /// content was loaded before.
    pub fn load_shader(
        &mut self,
        shader_type: ShaderType,
        guest_address: u32,
        microcode: &[u32],
    ) -> ShaderId {
        let hash = xxh64(bytemuck::cast_slice(microcode), 0);
        if let Some(&id) = self.shader_map.get(&(shader_type, hash)) {
            return id;
        }
        let id = ShaderId(self.shaders.len() as u32);
        self.shaders.push(Shader {
            shader_type,
            guest_address,
            hash,
            microcode: microcode.into(),
            translation: Translation::Pending,
        });
        self.shader_map.insert((shader_type, hash), id);
        debug!(?shader_type, guest_address, hash, dwords = microcode.len(), "loaded shader");
        id
    }

    pub fn shader(&self, id: ShaderId) -> &Shader {
        &self.shaders[id.0 as usize]
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Translates on first use. A failed translation is remembered and
    /// reported again without retrying.
    pub fn translated_shader(
        &mut self,
        id: ShaderId,
    ) -> Result<(Arc<TranslatedShader>, bool), ShaderTranslateError> {
        let shader = &mut self.shaders[id.0 as usize];
        match &shader.translation {
            Translation::Done(t) => return Ok((Arc::clone(t), false)),
            Translation::Failed(e) => return Err(e.clone()),
            Translation::Pending => {}
        }
        match self.translator.translate(shader.shader_type, &shader.microcode) {
            Ok(t) => {
                let t = Arc::new(t);
                shader.translation = Translation::Done(Arc::clone(&t));
                Ok((t, true))
            }
            Err(e) => {
                warn!(hash = shader.hash, error = %e, "shader translation failed");
                shader.translation = Translation::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Finds or creates the pipeline for the current state.
    #[allow(clippy::too_many_arguments)]
    pub fn configure_pipeline<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        regs: &RegisterFile,
        vertex_shader: ShaderId,
        pixel_shader: Option<ShaderId>,
        root_signature: RootSignatureId,
        topology_type: PrimitiveTopologyType,
        formats: RenderTargetFormats,
    ) -> Result<(UpdateStatus, PipelineId, bool), BackendError> {
        let key = PipelineKey {
            vertex_shader: self.shader(vertex_shader).hash,
            pixel_shader: pixel_shader.map(|ps| self.shader(ps).hash),
            root_signature,
            topology_type,
            formats,
            color_mask: regs.get(RB_COLOR_MASK),
            blend_controls: [
                regs.get(RB_BLENDCONTROL0),
                regs.get(RB_BLENDCONTROL1),
                regs.get(RB_BLENDCONTROL2),
                regs.get(RB_BLENDCONTROL3),
            ],
            depth_control: regs.get(RB_DEPTHCONTROL),
            cull_mode: regs.get(PA_SU_SC_MODE_CNTL) & 0x3,
        };

        let cached = self.pipelines.get(&key).copied();
        let (pipeline, created) = match cached {
            Some(pipeline) => (pipeline, false),
            None => {
                let vs_binary = self
                    .shader(vertex_shader)
                    .translated()
                    .map(|t| t.binary.as_slice())
                    .unwrap_or(&[]);
                let ps_binary = pixel_shader.and_then(|ps| {
                    self.shader(ps).translated().map(|t| t.binary.as_slice())
                });
                let pipeline = backend.create_pipeline(&PipelineDesc {
                    root_signature,
                    vertex_shader: vs_binary,
                    pixel_shader: ps_binary,
                    topology_type,
                    color_formats: formats.colors,
                    depth_format: formats.depth,
                    color_write_masks: std::array::from_fn(|i| {
                        ((key.color_mask >> (i * 4)) & 0xF) as u8
                    }),
                    blend_controls: key.blend_controls,
                    depth_control: key.depth_control,
                    cull_mode: key.cull_mode,
                })?;
                if let Some((_, old)) = self.pipelines.push(key, pipeline) {
                    debug!(?old, "evicting pipeline");
                    self.evicted.push(old);
                }
                (pipeline, true)
            }
        };

        let status = if self.current == Some(pipeline) {
            UpdateStatus::Compatible
        } else {
            UpdateStatus::Mismatch
        };
        self.current = Some(pipeline);
        Ok((status, pipeline, created))
    }

    /// Pipelines dropped from the cache that the GPU may still reference.
    pub fn take_evicted(&mut self) -> Vec<PipelineId> {
        std::mem::take(&mut self.evicted)
    }

    /// Forgets which pipeline is bound, e.g. when a new command list starts.
    pub fn reset_current(&mut self) {
        self.current = None;
    }

    /// Drops every pipeline and translation. Guest shader handles stay valid
    /// and are translated again on next use. The GPU must be idle.
    pub fn clear<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for id in self.take_evicted() {
            backend.destroy_pipeline(id);
        }
        while let Some((_, id)) = self.pipelines.pop_lru() {
            backend.destroy_pipeline(id);
        }
        for shader in &mut self.shaders {
            shader.translation = Translation::Pending;
        }
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NullBackend, RootSignatureDesc};
    use crate::shader::NullShaderTranslator;

    fn setup(capacity: usize) -> (NullBackend, PipelineCache, RootSignatureId) {
        let mut backend = NullBackend::default();
        let root = backend
            .create_root_signature(&RootSignatureDesc { parameters: vec![] })
            .unwrap();
        let cache = PipelineCache::new(
            PipelineCacheConfig { capacity },
            Box::new(NullShaderTranslator),
        );
        (backend, cache, root)
    }

    #[test]
    fn identical_microcode_shares_a_handle() {
        let (_, mut cache, _) = setup(4);
        let a = cache.load_shader(ShaderType::Vertex, 0x1000, &[1, 2, 3]);
        let b = cache.load_shader(ShaderType::Vertex, 0x2000, &[1, 2, 3]);
        let c = cache.load_shader(ShaderType::Pixel, 0x1000, &[1, 2, 3]);
        let d = cache.load_shader(ShaderType::Vertex, 0x1000, &[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(cache.shader_count(), 3);
    }

    #[test]
    fn failed_translation_is_sticky() {
        let (_, mut cache, _) = setup(4);
        let empty = cache.load_shader(ShaderType::Pixel, 0, &[]);
        assert!(cache.translated_shader(empty).is_err());
        assert!(cache.translated_shader(empty).is_err());
        let ok = cache.load_shader(ShaderType::Pixel, 0, &[9]);
        let (_, fresh) = cache.translated_shader(ok).unwrap();
        assert!(fresh);
        let (_, fresh) = cache.translated_shader(ok).unwrap();
        assert!(!fresh);
    }

    #[test]
    fn same_state_reuses_pipeline_and_reports_compatible() {
        let (mut backend, mut cache, root) = setup(4);
        let regs = RegisterFile::new();
        let vs = cache.load_shader(ShaderType::Vertex, 0, &[1]);
        cache.translated_shader(vs).unwrap();
        let formats = RenderTargetFormats::default();

        let (s1, p1, created) = cache
            .configure_pipeline(&mut backend, &regs, vs, None, root, PrimitiveTopologyType::Triangle, formats)
            .unwrap();
        assert_eq!((s1, created), (UpdateStatus::Mismatch, true));
        let (s2, p2, created) = cache
            .configure_pipeline(&mut backend, &regs, vs, None, root, PrimitiveTopologyType::Triangle, formats)
            .unwrap();
        assert_eq!((s2, created), (UpdateStatus::Compatible, false));
        assert_eq!(p1, p2);
        assert_eq!(backend.pipeline_count(), 1);
    }

    #[test]
    fn lru_eviction_hands_back_old_pipelines() {
        let (mut backend, mut cache, root) = setup(2);
        let mut regs = RegisterFile::new();
        let vs = cache.load_shader(ShaderType::Vertex, 0, &[1]);
        let formats = RenderTargetFormats::default();
        let mut created = Vec::new();
        for cull in 0..3 {
            regs.set(PA_SU_SC_MODE_CNTL, cull);
            let (_, p, _) = cache
                .configure_pipeline(&mut backend, &regs, vs, None, root, PrimitiveTopologyType::Triangle, formats)
                .unwrap();
            created.push(p);
        }
        assert_eq!(cache.pipeline_count(), 2);
        assert_eq!(cache.take_evicted(), vec![created[0]]);
        // Eviction only hands the pipeline over; destruction is up to the caller.
        assert_eq!(backend.pipeline_count(), 3);
    }
}
