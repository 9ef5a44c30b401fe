//! Shared helpers for `xenos-gpu` integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use xenos_gpu::backend::{FenceMode, TextureDimension};
use xenos_gpu::registers::*;
use xenos_gpu::shader::{
    SamplerBinding, ShaderTranslateError, ShaderTranslator, TextureBinding, TranslatedShader,
};
use xenos_gpu::{
    CommandProcessor, CommandProcessorConfig, NullBackend, ShaderId, ShaderType, VecGuestMemory,
};

pub const GUEST_MEMORY_SIZE: usize = 4 << 20;

/// Translator whose output is chosen by the first microcode dword.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTranslator {
    outputs: HashMap<u32, TranslatedShader>,
}

impl ScriptedTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: u32, shader: TranslatedShader) -> Self {
        self.outputs.insert(tag, shader);
        self
    }
}

impl ShaderTranslator for ScriptedTranslator {
    fn translate(
        &mut self,
        shader_type: ShaderType,
        microcode: &[u32],
    ) -> Result<TranslatedShader, ShaderTranslateError> {
        let tag = *microcode.first().ok_or(ShaderTranslateError::Empty)?;
        if let Some(shader) = self.outputs.get(&tag) {
            return Ok(shader.clone());
        }
        Ok(TranslatedShader {
            color_targets_written: u8::from(shader_type == ShaderType::Pixel),
            ..TranslatedShader::default()
        })
    }
}

pub fn textures(fetch_constants: &[u32]) -> Vec<TextureBinding> {
    fetch_constants
        .iter()
        .map(|&fetch_constant| TextureBinding {
            fetch_constant,
            dimension: TextureDimension::D2,
        })
        .collect()
}

pub fn samplers(fetch_constants: &[u32]) -> Vec<SamplerBinding> {
    fetch_constants
        .iter()
        .map(|&fetch_constant| SamplerBinding { fetch_constant })
        .collect()
}

pub fn test_config() -> CommandProcessorConfig {
    CommandProcessorConfig {
        shared_memory_size: GUEST_MEMORY_SIZE as u64,
        view_descriptors_per_frame: 4096,
        ..CommandProcessorConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn processor_with(
    mode: FenceMode,
    config: CommandProcessorConfig,
    translator: ScriptedTranslator,
) -> CommandProcessor<NullBackend> {
    init_tracing();
    CommandProcessor::new(
        NullBackend::new(mode),
        Arc::new(VecGuestMemory::new(GUEST_MEMORY_SIZE)),
        config,
        Box::new(translator),
    )
    .expect("command processor")
}

pub fn processor(mode: FenceMode) -> CommandProcessor<NullBackend> {
    processor_with(mode, test_config(), ScriptedTranslator::new())
}

/// 1280x720 single color target, color writes enabled.
pub fn setup_color_target(cp: &mut CommandProcessor<NullBackend>) {
    cp.write_register(RB_MODECONTROL, 4);
    cp.write_register(RB_SURFACE_INFO, 1280);
    cp.write_register(RB_COLOR_INFO, 0);
    cp.write_register(PA_SC_WINDOW_SCISSOR_BR, (720 << 16) | 1280);
    cp.write_register(RB_COLOR_MASK, 0xF);
}

/// Loads and binds a shader pair whose translations are picked by `vs_tag`
/// and `ps_tag`.
pub fn bind_shaders(
    cp: &mut CommandProcessor<NullBackend>,
    vs_tag: u32,
    ps_tag: u32,
) -> (ShaderId, ShaderId) {
    let vs = cp.load_shader(ShaderType::Vertex, 0x1000 + vs_tag, &[vs_tag, 0xAAAA]);
    let ps = cp.load_shader(ShaderType::Pixel, 0x2000 + ps_tag, &[ps_tag, 0xBBBB]);
    cp.set_active_shaders(Some(vs), Some(ps));
    (vs, ps)
}
