//! Guest shaders and the translation seam.
//!
//! Microcode translation is an external subsystem. The command processor
//! only needs the host binary and the binding metadata the translator
//! extracts.

use std::sync::Arc;

use serde::Serialize;

use crate::backend::TextureDimension;
use crate::xenos::ShaderType;

/// Handle returned by [`crate::CommandProcessor::load_shader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ShaderId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    pub fetch_constant: u32,
    pub dimension: TextureDimension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerBinding {
    pub fetch_constant: u32,
}

/// Translator output for one guest shader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedShader {
    pub binary: Vec<u8>,
    /// Shader resource table layout, in table order.
    pub texture_bindings: Vec<TextureBinding>,
    /// Sampler table layout, in table order.
    pub sampler_bindings: Vec<SamplerBinding>,
    /// Vertex fetch constants read by a vertex shader.
    pub vertex_fetch_constants: Vec<u32>,
    /// Color targets written by a pixel shader, one bit per target.
    pub color_targets_written: u8,
}

impl TranslatedShader {
    pub fn texture_count(&self) -> u32 {
        self.texture_bindings.len() as u32
    }

    pub fn sampler_count(&self) -> u32 {
        self.sampler_bindings.len() as u32
    }

    /// Bit per texture fetch constant referenced by textures or samplers.
    pub fn used_texture_fetch_mask(&self) -> u32 {
        let textures = self.texture_bindings.iter().map(|b| b.fetch_constant);
        let samplers = self.sampler_bindings.iter().map(|b| b.fetch_constant);
        textures
            .chain(samplers)
            .fold(0, |mask, fetch| mask | (1 << (fetch & 31)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShaderTranslateError {
    #[error("empty microcode")]
    Empty,
    #[error("unsupported instruction at dword {offset}: 0x{word:08x}")]
    UnsupportedInstruction { offset: usize, word: u32 },
    #[error("{0}")]
    Other(String),
}

pub trait ShaderTranslator: Send {
    fn translate(
        &mut self,
        shader_type: ShaderType,
        microcode: &[u32],
    ) -> Result<TranslatedShader, ShaderTranslateError>;
}

/// Produces empty binaries with no bindings. Pairs with the null backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullShaderTranslator;

impl ShaderTranslator for NullShaderTranslator {
    fn translate(
        &mut self,
        shader_type: ShaderType,
        microcode: &[u32],
    ) -> Result<TranslatedShader, ShaderTranslateError> {
        if microcode.is_empty() {
            return Err(ShaderTranslateError::Empty);
        }
        Ok(TranslatedShader {
            color_targets_written: match shader_type {
                ShaderType::Pixel => 0b0001,
                ShaderType::Vertex => 0,
            },
            ..TranslatedShader::default()
        })
    }
}

#[derive(Debug)]
pub(crate) enum Translation {
    Pending,
    Done(Arc<TranslatedShader>),
    Failed(ShaderTranslateError),
}

#[derive(Debug)]
pub struct Shader {
    pub(crate) shader_type: ShaderType,
    pub(crate) guest_address: u32,
    pub(crate) hash: u64,
    pub(crate) microcode: Box<[u32]>,
    pub(crate) translation: Translation,
}

impl Shader {
    pub fn shader_type(&self) -> ShaderType {
        self.shader_type
    }

    pub fn guest_address(&self) -> u32 {
        self.guest_address
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn dword_count(&self) -> usize {
        self.microcode.len()
    }

    pub fn translated(&self) -> Option<&Arc<TranslatedShader>> {
        match &self.translation {
            Translation::Done(t) => Some(t),
            _ => None,
        }
    }
}
