//! Host graphics API capability.
//!
//! Orchestration in [`crate::CommandProcessor`] is written once against
//! [`GpuBackend`]. A backend owns the device and queue, creates the objects
//! the caches ask for, and executes recorded [`CommandList`]s.

mod null;
#[cfg(feature = "wgpu-backend")]
mod wgpu_backend;

pub use null::{FenceMode, NullBackend, NullSubmission};
#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuBackend;

use bitflags::bitflags;
use serde::Serialize;

use crate::cmd::CommandList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PipelineId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RootSignatureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DescriptorHeapId(pub u32);

/// Which host API actually executes the command lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Null,
    D3D12,
    Vulkan,
    /// A wgpu adapter on some other API (Metal, GL); useful for development only.
    OtherWgpu,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("no suitable GPU adapter: {0}")]
    NoAdapter(String),
    #[error("device request failed: {0}")]
    RequestDevice(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("out of device memory allocating {what} ({size} bytes)")]
    OutOfMemory { what: &'static str, size: u64 },
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("unsupported: {0}")]
    Unsupported(String),
}

bitflags! {
    /// Host resource states, D3D12-style. Empty means "common".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 5;
        const PIXEL_SHADER_RESOURCE = 1 << 6;
        const COPY_DEST = 1 << 7;
        const COPY_SOURCE = 1 << 8;
        const PRESENT = 1 << 9;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::COPY_SOURCE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryHeap {
    /// Device-local, written by copies.
    Default,
    /// CPU-visible, written through [`GpuBackend::write_buffer`].
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub heap: MemoryHeap,
    pub initial_state: ResourceState,
    pub unordered_access: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgb10A2Unorm,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    Bc1RgbaUnorm,
    Bc2RgbaUnorm,
    Bc3RgbaUnorm,
    Depth24PlusStencil8,
    Depth32FloatStencil8,
}

impl TextureFormat {
    /// Bytes per texel, or per 4x4 block for block-compressed formats.
    pub fn bytes_per_block(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgb10A2Unorm | Self::Rg16Float | Self::R32Float => 4,
            Self::Depth24PlusStencil8 => 4,
            Self::Rgba16Float | Self::Rg32Float | Self::Depth32FloatStencil8 => 8,
            Self::Rgba32Float => 16,
            Self::Bc1RgbaUnorm => 8,
            Self::Bc2RgbaUnorm | Self::Bc3RgbaUnorm => 16,
        }
    }

    pub fn block_dim(self) -> u32 {
        match self {
            Self::Bc1RgbaUnorm | Self::Bc2RgbaUnorm | Self::Bc3RgbaUnorm => 4,
            _ => 1,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }

    /// Tightly packed row pitch for `width` texels.
    pub fn row_pitch(self, width: u32) -> u32 {
        width.div_ceil(self.block_dim()) * self.bytes_per_block()
    }

    pub fn image_size(self, width: u32, height: u32) -> u64 {
        u64::from(self.row_pitch(width)) * u64::from(height.div_ceil(self.block_dim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub dimension: TextureDimension,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub mip_levels: u32,
    pub initial_state: ResourceState,
    pub render_attachment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorHeapKind {
    /// Constant buffer, shader resource and unordered access views.
    View,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CpuDescriptorHandle {
    pub heap: DescriptorHeapId,
    pub index: u32,
}

impl CpuDescriptorHandle {
    pub fn offset(self, by: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + by,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GpuDescriptorHandle {
    pub heap: DescriptorHeapId,
    pub index: u32,
}

impl GpuDescriptorHandle {
    pub fn offset(self, by: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + by,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FilterMode {
    Point,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub max_anisotropy: u8,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: FilterMode::Point,
            min_filter: FilterMode::Point,
            mip_filter: FilterMode::Point,
            address_u: AddressMode::ClampToEdge,
            address_v: AddressMode::ClampToEdge,
            address_w: AddressMode::ClampToEdge,
            max_anisotropy: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    ConstantBuffer {
        buffer: ResourceId,
        offset: u64,
        size: u32,
    },
    /// Raw (byte address) view of a whole buffer.
    RawBuffer { buffer: ResourceId, size: u64 },
    Texture {
        texture: ResourceId,
        dimension: TextureDimension,
    },
    /// Bound where a shader expects a texture that the guest never set up.
    NullTexture { dimension: TextureDimension },
    Sampler(SamplerDesc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRangeKind {
    ConstantBuffer,
    ShaderResource,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderVisibility {
    Vertex,
    Pixel,
    All,
}

/// One root parameter; every parameter is a single-range descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootParameterDesc {
    pub range: DescriptorRangeKind,
    pub base_register: u32,
    pub register_space: u32,
    pub count: u32,
    pub visibility: ShaderVisibility,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameterDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveTopologyType {
    Point,
    Line,
    Triangle,
}

/// Render pipeline creation input. Shader binaries are the translator's
/// output and are opaque to everything but the backend.
#[derive(Debug, Clone)]
pub struct PipelineDesc<'a> {
    pub root_signature: RootSignatureId,
    pub vertex_shader: &'a [u8],
    pub pixel_shader: Option<&'a [u8]>,
    pub topology_type: PrimitiveTopologyType,
    pub color_formats: [Option<TextureFormat>; 4],
    pub depth_format: Option<TextureFormat>,
    pub color_write_masks: [u8; 4],
    pub blend_controls: [u32; 4],
    pub depth_control: u32,
    pub cull_mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresentRequest {
    pub frontbuffer: u32,
    pub width: u32,
    pub height: u32,
    /// Host texture holding the most recent resolve of the front buffer, if any.
    pub source: Option<ResourceId>,
}

pub trait GpuBackend {
    fn kind(&self) -> BackendKind;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, BackendError>;
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<ResourceId, BackendError>;
    /// Frees a buffer or texture. Callers guarantee the GPU no longer uses it.
    fn destroy_resource(&mut self, id: ResourceId);
    /// CPU write into an upload-heap buffer.
    fn write_buffer(&mut self, id: ResourceId, offset: u64, data: &[u8])
        -> Result<(), BackendError>;

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeapId, BackendError>;
    fn write_descriptor(&mut self, handle: CpuDescriptorHandle, descriptor: &Descriptor);

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureId, BackendError>;
    fn destroy_root_signature(&mut self, id: RootSignatureId);

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineId, BackendError>;
    fn destroy_pipeline(&mut self, id: PipelineId);

    /// Executes `lists` in order, then signals `signal_fence`.
    fn submit(&mut self, lists: &[&CommandList], signal_fence: u64) -> Result<(), BackendError>;
    /// Highest fence value the GPU has finished.
    fn completed_fence(&mut self) -> u64;
    /// Blocks until `fence` has been reached.
    fn wait_for_fence(&mut self, fence: u64) -> Result<(), BackendError>;

    fn present(&mut self, request: &PresentRequest) -> Result<(), BackendError>;
}
