//! Root signature layouts per shader pair.
//!
//! Every signature starts with the same five descriptor tables. Up to four
//! optional tables follow, present only when the shader pair uses them, in a
//! fixed order: pixel textures, pixel samplers, vertex textures, vertex
//! samplers. Signatures are keyed by which optional tables are present, so at
//! most sixteen ever exist.

use hashbrown::HashMap;
use tracing::debug;

use crate::backend::{
    BackendError, DescriptorRangeKind, GpuBackend, RootParameterDesc, RootSignatureDesc,
    RootSignatureId, ShaderVisibility,
};
use crate::shader::TranslatedShader;

/// Fixed root parameters, in root signature order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RootParameter {
    FetchConstants = 0,
    VertexFloatConstants = 1,
    PixelFloatConstants = 2,
    /// System constants and bool/loop constants.
    CommonConstants = 3,
    SharedMemory = 4,
}

pub const ROOT_PARAMETER_BASE_COUNT: u32 = 5;

/// Texture and sampler tables are sized for every fetch constant.
pub const MAX_TEXTURE_BINDINGS: u32 = 32;

/// Root parameter indices of the optional tables, `None` when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootExtraParameterIndices {
    pub pixel_textures: Option<u32>,
    pub pixel_samplers: Option<u32>,
    pub vertex_textures: Option<u32>,
    pub vertex_samplers: Option<u32>,
}

impl RootExtraParameterIndices {
    /// Cache key: one bit per present table, in layout order.
    pub fn mask(&self) -> u8 {
        [
            self.pixel_textures,
            self.pixel_samplers,
            self.vertex_textures,
            self.vertex_samplers,
        ]
        .iter()
        .enumerate()
        .fold(0, |mask, (bit, index)| {
            mask | (u8::from(index.is_some()) << bit)
        })
    }
}

/// Which optional tables `vertex_shader` and `pixel_shader` need and where
/// they go. Also returns the total root parameter count.
pub fn root_extra_parameter_indices(
    vertex_shader: &TranslatedShader,
    pixel_shader: Option<&TranslatedShader>,
) -> (RootExtraParameterIndices, u32) {
    let mut next = ROOT_PARAMETER_BASE_COUNT;
    let mut slot = |present: bool| {
        present.then(|| {
            let index = next;
            next += 1;
            index
        })
    };
    let indices = RootExtraParameterIndices {
        pixel_textures: slot(pixel_shader.is_some_and(|ps| ps.texture_count() != 0)),
        pixel_samplers: slot(pixel_shader.is_some_and(|ps| ps.sampler_count() != 0)),
        vertex_textures: slot(vertex_shader.texture_count() != 0),
        vertex_samplers: slot(vertex_shader.sampler_count() != 0),
    };
    (indices, next)
}

fn layout_for_mask(mask: u8) -> RootSignatureDesc {
    let table = |range, base_register, register_space, count, visibility| RootParameterDesc {
        range,
        base_register,
        register_space,
        count,
        visibility,
    };
    use DescriptorRangeKind::*;
    use ShaderVisibility::*;

    let mut parameters = vec![
        table(ConstantBuffer, 2, 0, 1, All),
        table(ConstantBuffer, 0, 1, 8, Vertex),
        table(ConstantBuffer, 0, 1, 8, Pixel),
        table(ConstantBuffer, 0, 0, 2, All),
        table(ShaderResource, 0, 0, 1, All),
    ];
    let optional = [
        table(ShaderResource, 0, 1, MAX_TEXTURE_BINDINGS, Pixel),
        table(Sampler, 0, 0, MAX_TEXTURE_BINDINGS, Pixel),
        table(ShaderResource, 0, 1, MAX_TEXTURE_BINDINGS, Vertex),
        table(Sampler, 0, 0, MAX_TEXTURE_BINDINGS, Vertex),
    ];
    for (bit, param) in optional.into_iter().enumerate() {
        if mask & (1 << bit) != 0 {
            parameters.push(param);
        }
    }
    RootSignatureDesc { parameters }
}

/// Process-lifetime root signature cache.
#[derive(Debug, Default)]
pub struct RootSignatureCache {
    signatures: HashMap<u8, RootSignatureId>,
}

impl RootSignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Returns the signature for `indices`, creating it on first use.
    /// The second value tells whether it was created now.
    pub fn get_or_create<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        indices: &RootExtraParameterIndices,
    ) -> Result<(RootSignatureId, bool), BackendError> {
        let mask = indices.mask();
        if let Some(&id) = self.signatures.get(&mask) {
            return Ok((id, false));
        }
        let id = backend.create_root_signature(&layout_for_mask(mask))?;
        debug!(mask, ?id, "created root signature");
        self.signatures.insert(mask, id);
        Ok((id, true))
    }

    /// Destroys every signature. The GPU must be idle.
    pub fn clear<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, id) in self.signatures.drain() {
            backend.destroy_root_signature(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NullBackend, TextureDimension};
    use crate::shader::{SamplerBinding, TextureBinding};

    fn shader(textures: u32, samplers: u32) -> TranslatedShader {
        TranslatedShader {
            texture_bindings: (0..textures)
                .map(|i| TextureBinding {
                    fetch_constant: i,
                    dimension: TextureDimension::D2,
                })
                .collect(),
            sampler_bindings: (0..samplers)
                .map(|i| SamplerBinding { fetch_constant: i })
                .collect(),
            ..TranslatedShader::default()
        }
    }

    #[test]
    fn optional_tables_follow_fixed_order() {
        let vs = shader(1, 1);
        let ps = shader(2, 2);
        let (indices, count) = root_extra_parameter_indices(&vs, Some(&ps));
        assert_eq!(indices.pixel_textures, Some(5));
        assert_eq!(indices.pixel_samplers, Some(6));
        assert_eq!(indices.vertex_textures, Some(7));
        assert_eq!(indices.vertex_samplers, Some(8));
        assert_eq!(count, 9);
        assert_eq!(indices.mask(), 0b1111);
    }

    #[test]
    fn absent_tables_are_skipped() {
        let vs = shader(0, 1);
        let ps = shader(2, 0);
        let (indices, count) = root_extra_parameter_indices(&vs, Some(&ps));
        assert_eq!(indices.pixel_textures, Some(5));
        assert_eq!(indices.pixel_samplers, None);
        assert_eq!(indices.vertex_textures, None);
        assert_eq!(indices.vertex_samplers, Some(6));
        assert_eq!(count, 7);

        let (depth_only, count) = root_extra_parameter_indices(&vs, None);
        assert_eq!(depth_only.mask(), 0b1000);
        assert_eq!(count, 6);
    }

    #[test]
    fn same_mask_same_signature() {
        let mut backend = NullBackend::default();
        let mut cache = RootSignatureCache::new();

        let (a, _) = root_extra_parameter_indices(&shader(0, 0), Some(&shader(2, 0)));
        let (b, _) = root_extra_parameter_indices(&shader(0, 0), Some(&shader(7, 0)));
        let (first, created) = cache.get_or_create(&mut backend, &a).unwrap();
        assert!(created);
        let (second, created) = cache.get_or_create(&mut backend, &b).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(backend.root_signature_count(), 1);

        let desc = backend.root_signature_desc(first).unwrap();
        assert_eq!(desc.parameters.len(), 6);
        assert_eq!(desc.parameters[5].range, DescriptorRangeKind::ShaderResource);
        assert_eq!(desc.parameters[5].visibility, ShaderVisibility::Pixel);
    }

    #[test]
    fn at_most_sixteen_signatures() {
        let mut backend = NullBackend::default();
        let mut cache = RootSignatureCache::new();
        for vt in 0..2 {
            for vsmp in 0..2 {
                for pt in 0..3 {
                    for psmp in 0..3 {
                        let (idx, _) = root_extra_parameter_indices(
                            &shader(vt, vsmp),
                            Some(&shader(pt, psmp)),
                        );
                        cache.get_or_create(&mut backend, &idx).unwrap();
                    }
                }
            }
        }
        assert_eq!(cache.len(), 16);
    }
}
