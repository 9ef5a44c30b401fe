//! Guest texture fetch constants to host textures.
//!
//! Textures are created on first reference and loaded from shared memory.
//! The command processor performs the loads the cache asks for, since they
//! need the shared memory buffer, the scratch buffer and the command list.

use hashbrown::HashMap;
use tracing::trace;

use crate::backend::{
    AddressMode, BackendError, CpuDescriptorHandle, Descriptor, FilterMode, GpuBackend,
    ResourceId, ResourceState, SamplerDesc, TextureDesc, TextureDimension, TextureFormat,
};
use crate::deferred::{DeferredDeletionQueue, DeferredObject};
use crate::registers::RegisterFile;
use crate::xenos::Endian;

pub const TEXTURE_FETCH_CONSTANT_COUNT: usize = 32;

pub const SHADER_RESOURCE_STATE: ResourceState = ResourceState::PIXEL_SHADER_RESOURCE
    .union(ResourceState::NON_PIXEL_SHADER_RESOURCE);

/// Decoded texture fetch constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFetch {
    pub base_address: u32,
    pub guest_format: u32,
    pub endian: Endian,
    pub tiled: bool,
    /// Row pitch in texels.
    pub pitch: u32,
    pub clamp: [u32; 3],
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mag_filter: u32,
    pub min_filter: u32,
    pub mip_filter: u32,
    pub aniso: u32,
}

impl TextureFetch {
    pub fn decode(d: [u32; 6]) -> Option<Self> {
        if d[0] & 3 != 2 {
            return None;
        }
        let dimension = match (d[5] >> 9) & 3 {
            0 => TextureDimension::D1,
            1 => TextureDimension::D2,
            2 => TextureDimension::D3,
            _ => TextureDimension::Cube,
        };
        let size = d[2];
        let (width, height, depth) = match dimension {
            TextureDimension::D1 => ((size & 0xFF_FFFF) + 1, 1, 1),
            TextureDimension::D2 => ((size & 0x1FFF) + 1, ((size >> 13) & 0x1FFF) + 1, 1),
            TextureDimension::D3 => (
                (size & 0x7FF) + 1,
                ((size >> 11) & 0x7FF) + 1,
                ((size >> 22) & 0x3FF) + 1,
            ),
            TextureDimension::Cube => ((size & 0x1FFF) + 1, ((size >> 13) & 0x1FFF) + 1, 6),
        };
        Some(Self {
            base_address: d[1] & 0xFFFF_F000,
            guest_format: d[1] & 0x3F,
            endian: Endian::from_bits(d[1] >> 6),
            tiled: d[0] >> 31 != 0,
            pitch: ((d[0] >> 22) & 0x1FF) * 32,
            clamp: [(d[0] >> 10) & 7, (d[0] >> 13) & 7, (d[0] >> 16) & 7],
            dimension,
            width,
            height,
            depth,
            mag_filter: (d[3] >> 19) & 3,
            min_filter: (d[3] >> 21) & 3,
            mip_filter: (d[3] >> 23) & 3,
            aniso: (d[3] >> 25) & 7,
        })
    }

    pub fn host_format(&self) -> Option<TextureFormat> {
        Some(match self.guest_format {
            6 => TextureFormat::Rgba8Unorm,
            7 => TextureFormat::Rgb10A2Unorm,
            18 => TextureFormat::Bc1RgbaUnorm,
            19 => TextureFormat::Bc2RgbaUnorm,
            20 => TextureFormat::Bc3RgbaUnorm,
            31 => TextureFormat::Rg16Float,
            32 => TextureFormat::Rgba16Float,
            36 => TextureFormat::R32Float,
            37 => TextureFormat::Rg32Float,
            38 => TextureFormat::Rgba32Float,
            _ => return None,
        })
    }

    pub fn sampler_desc(&self) -> SamplerDesc {
        let filter = |f| if f == 1 { FilterMode::Linear } else { FilterMode::Point };
        let address = |c| match c {
            0 => AddressMode::Repeat,
            1 => AddressMode::MirrorRepeat,
            2 | 3 => AddressMode::ClampToEdge,
            _ => AddressMode::ClampToBorder,
        };
        SamplerDesc {
            mag_filter: filter(self.mag_filter),
            min_filter: filter(self.min_filter),
            mip_filter: filter(self.mip_filter),
            address_u: address(self.clamp[0]),
            address_v: address(self.clamp[1]),
            address_w: address(self.clamp[2]),
            max_anisotropy: if self.aniso == 0 { 1 } else { 1 << (self.aniso - 1) },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub base_address: u32,
    pub format: TextureFormat,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub pitch: u32,
    pub tiled: bool,
    pub endian: Endian,
}

impl TextureKey {
    fn from_fetch(fetch: &TextureFetch) -> Option<Self> {
        Some(Self {
            base_address: fetch.base_address,
            format: fetch.host_format()?,
            dimension: fetch.dimension,
            width: fetch.width,
            height: fetch.height,
            depth: fetch.depth,
            pitch: fetch.pitch.max(fetch.width),
            tiled: fetch.tiled,
            endian: fetch.endian,
        })
    }

    fn rows(&self) -> u32 {
        self.height.div_ceil(self.format.block_dim()) * self.depth
    }

    /// Bytes the texture occupies in guest memory.
    pub fn guest_size(&self) -> u64 {
        u64::from(self.format.row_pitch(self.pitch)) * u64::from(self.rows())
    }
}

/// Copy work the command processor must record before the draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureLoad {
    pub texture: ResourceId,
    pub state_before: ResourceState,
    pub source_address: u32,
    pub source_size: u64,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub tiled: bool,
    pub pitch_blocks: u32,
}

#[derive(Debug)]
struct CachedTexture {
    resource: ResourceId,
    state: ResourceState,
    loaded: bool,
}

#[derive(Debug)]
pub struct TextureCache {
    textures: HashMap<TextureKey, CachedTexture>,
    bindings: [Option<TextureKey>; TEXTURE_FETCH_CONSTANT_COUNT],
    fetch_dirty: u32,
    bindings_changed: bool,
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureCache {
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
            bindings: [None; TEXTURE_FETCH_CONSTANT_COUNT],
            fetch_dirty: u32::MAX,
            bindings_changed: true,
        }
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn fetch_constant_written(&mut self, index: u32) {
        self.fetch_dirty |= 1 << (index & 31);
    }

    /// Whether any texture binding changed since the last call.
    pub fn take_bindings_changed(&mut self) -> bool {
        std::mem::take(&mut self.bindings_changed)
    }

    /// Resolves the fetch constants in `used_mask`, creating textures and
    /// returning the loads that must happen before they are sampled.
    pub fn request_textures<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        regs: &RegisterFile,
        used_mask: u32,
    ) -> Result<Vec<TextureLoad>, BackendError> {
        let refresh = used_mask & self.fetch_dirty;
        for index in BitIter(refresh) {
            let key = TextureFetch::decode(regs.texture_fetch(index))
                .as_ref()
                .and_then(TextureKey::from_fetch);
            if self.bindings[index as usize] != key {
                self.bindings[index as usize] = key;
                self.bindings_changed = true;
            }
        }
        self.fetch_dirty &= !refresh;

        let mut loads = Vec::new();
        for index in BitIter(used_mask) {
            let Some(key) = self.bindings[index as usize] else {
                continue;
            };
            if !self.textures.contains_key(&key) {
                let resource = backend.create_texture(&TextureDesc {
                    label: "xenos texture",
                    dimension: key.dimension,
                    format: key.format,
                    width: key.width,
                    height: key.height,
                    depth_or_layers: key.depth,
                    mip_levels: 1,
                    initial_state: ResourceState::COPY_DEST,
                    render_attachment: false,
                })?;
                trace!(?key, ?resource, "created texture");
                self.textures.insert(
                    key,
                    CachedTexture {
                        resource,
                        state: ResourceState::COPY_DEST,
                        loaded: false,
                    },
                );
            }
            let Some(texture) = self.textures.get_mut(&key) else {
                continue;
            };
            if texture.loaded {
                continue;
            }
            loads.push(TextureLoad {
                texture: texture.resource,
                state_before: texture.state,
                source_address: key.base_address,
                source_size: key.guest_size(),
                format: key.format,
                width: key.width,
                height: key.height * key.depth,
                tiled: key.tiled,
                pitch_blocks: key.pitch.div_ceil(key.format.block_dim()),
            });
            texture.loaded = true;
            texture.state = SHADER_RESOURCE_STATE;
        }
        Ok(loads)
    }

    pub fn write_texture_srv<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        fetch_constant: u32,
        dimension: TextureDimension,
        handle: CpuDescriptorHandle,
    ) {
        let texture = self.bindings[(fetch_constant & 31) as usize]
            .filter(|key| key.dimension == dimension)
            .and_then(|key| self.textures.get(&key));
        let descriptor = match texture {
            Some(texture) => Descriptor::Texture {
                texture: texture.resource,
                dimension,
            },
            None => Descriptor::NullTexture { dimension },
        };
        backend.write_descriptor(handle, &descriptor);
    }

    pub fn write_sampler<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        regs: &RegisterFile,
        fetch_constant: u32,
        handle: CpuDescriptorHandle,
    ) {
        let desc = TextureFetch::decode(regs.texture_fetch(fetch_constant & 31))
            .map(|fetch| fetch.sampler_desc())
            .unwrap_or_default();
        backend.write_descriptor(handle, &Descriptor::Sampler(desc));
    }

    /// Records that the load handed out for `resource` did not happen. The
    /// texture stays in the shader resource state and is retried next draw.
    pub fn load_skipped(&mut self, resource: ResourceId) {
        if let Some(texture) = self
            .textures
            .values_mut()
            .find(|texture| texture.resource == resource)
        {
            texture.loaded = false;
        }
    }

    /// Marks textures overlapping guest range `[start, start + len)` for reload.
    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        let end = u64::from(start) + u64::from(len);
        for (key, texture) in self.textures.iter_mut() {
            let tex_start = u64::from(key.base_address);
            let tex_end = tex_start + key.guest_size();
            if tex_start < end && u64::from(start) < tex_end {
                texture.loaded = false;
            }
        }
    }

    /// Drops every texture. Destruction waits for the frames that may use them.
    pub fn clear(&mut self, deferred: &mut DeferredDeletionQueue, current_frame: u64) {
        for (_, texture) in self.textures.drain() {
            deferred.push(DeferredObject::Resource(texture.resource), current_frame);
        }
        self.bindings = [None; TEXTURE_FETCH_CONSTANT_COUNT];
        self.fetch_dirty = u32::MAX;
        self.bindings_changed = true;
    }
}

/// Iterates set bit positions, lowest first.
pub(crate) struct BitIter(pub u32);

impl Iterator for BitIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::registers::SHADER_CONSTANT_FETCH_00_0;

    fn write_fetch(regs: &mut RegisterFile, index: u32, dwords: [u32; 6]) {
        for (i, d) in dwords.iter().enumerate() {
            regs.set(SHADER_CONSTANT_FETCH_00_0 + index * 6 + i as u32, *d);
        }
    }

    /// Linear 2D k_8_8_8_8 texture at `base`.
    fn rgba8_fetch(base: u32, width: u32, height: u32) -> [u32; 6] {
        [
            2 | (((width / 32) & 0x1FF) << 22),
            base | 6,
            (width - 1) | ((height - 1) << 13),
            (1 << 19) | (1 << 21),
            0,
            1 << 9,
        ]
    }

    #[test]
    fn decodes_2d_fetch_constant() {
        let fetch = TextureFetch::decode(rgba8_fetch(0x10000, 64, 32)).unwrap();
        assert_eq!(fetch.base_address, 0x10000);
        assert_eq!((fetch.width, fetch.height, fetch.depth), (64, 32, 1));
        assert_eq!(fetch.dimension, TextureDimension::D2);
        assert_eq!(fetch.host_format(), Some(TextureFormat::Rgba8Unorm));
        assert_eq!(fetch.sampler_desc().mag_filter, FilterMode::Linear);
        assert!(!fetch.tiled);
        assert_eq!(TextureFetch::decode([0; 6]), None);
    }

    #[test]
    fn textures_load_once_until_invalidated() {
        let mut backend = NullBackend::default();
        let mut regs = RegisterFile::new();
        let mut cache = TextureCache::new();
        write_fetch(&mut regs, 3, rgba8_fetch(0x20000, 64, 64));

        let loads = cache.request_textures(&mut backend, &regs, 1 << 3).unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].source_address, 0x20000);
        assert_eq!(loads[0].source_size, 64 * 64 * 4);
        assert!(cache.take_bindings_changed());

        assert!(cache.request_textures(&mut backend, &regs, 1 << 3).unwrap().is_empty());
        assert!(!cache.take_bindings_changed());

        cache.invalidate_range(0x20000 + 100, 4);
        let reload = cache.request_textures(&mut backend, &regs, 1 << 3).unwrap();
        assert_eq!(reload.len(), 1);
        assert_eq!(reload[0].state_before, SHADER_RESOURCE_STATE);
        assert_eq!(cache.texture_count(), 1);
    }

    #[test]
    fn skipped_load_is_requested_again() {
        let mut backend = NullBackend::default();
        let mut regs = RegisterFile::new();
        let mut cache = TextureCache::new();
        write_fetch(&mut regs, 0, rgba8_fetch(0x40000, 32, 32));

        let loads = cache.request_textures(&mut backend, &regs, 1).unwrap();
        assert_eq!(loads[0].state_before, ResourceState::COPY_DEST);
        cache.load_skipped(loads[0].texture);

        let retry = cache.request_textures(&mut backend, &regs, 1).unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].texture, loads[0].texture);
        assert_eq!(retry[0].state_before, SHADER_RESOURCE_STATE);
    }

    #[test]
    fn missing_texture_gets_null_descriptor() {
        let mut backend = NullBackend::default();
        let heap = backend
            .create_descriptor_heap(crate::backend::DescriptorHeapKind::View, 4)
            .unwrap();
        let cache = TextureCache::new();
        let handle = CpuDescriptorHandle { heap, index: 2 };
        cache.write_texture_srv(&mut backend, 0, TextureDimension::D2, handle);
        assert_eq!(
            backend.descriptor(handle),
            Some(&Descriptor::NullTexture {
                dimension: TextureDimension::D2
            })
        );
    }

    #[test]
    fn bit_iter_yields_positions() {
        assert_eq!(BitIter(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
    }
}
