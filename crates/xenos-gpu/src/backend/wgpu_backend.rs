use std::borrow::Cow;
use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};
use wgpu::util::DeviceExt;

use crate::backend::*;
use crate::cmd::{CommandList, HostCmd, IndexFormat, PrimitiveTopology, ScissorRect, Viewport};

/// Bind group 0 binding of entry `i` of root parameter `p` is
/// `p * BINDINGS_PER_TABLE + i`.
pub const BINDINGS_PER_TABLE: u32 = 32;

/// Entry point name expected in translated WGSL modules.
pub const SHADER_ENTRY_POINT: &str = "main";

const NULL_CONSTANT_BUFFER_SIZE: u64 = 256;
const COPY_ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

const UNTILE_WGSL: &str = r#"
struct Params {
    src_offset: u32,
    dst_offset: u32,
    words_per_block: u32,
    log2_bpb: u32,
    width_blocks: u32,
    height_blocks: u32,
    pitch_blocks: u32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

fn tiled_offset(x: u32, y: u32, pitch: u32, log2_bpb: u32) -> u32 {
    let aligned_pitch = (pitch + 31u) & ~31u;
    let macro_row = ((y >> 5u) * (aligned_pitch >> 5u)) << (log2_bpb + 7u);
    let micro_row = ((y & 6u) << 2u) << log2_bpb;
    let row = macro_row + ((micro_row & ~15u) << 1u) + (micro_row & 15u)
        + ((y & 8u) << (3u + log2_bpb)) + ((y & 1u) << 4u);
    let macro_col = (x >> 5u) << (log2_bpb + 7u);
    let micro_col = (x & 7u) << log2_bpb;
    let offset = row + macro_col + ((micro_col & ~15u) << 1u) + (micro_col & 15u);
    return ((offset & ~511u) << 3u) + ((offset & 448u) << 2u) + (offset & 63u)
        + ((y & 16u) << 7u) + (((((y & 8u) >> 2u) + (x >> 3u)) & 3u) << 6u);
}

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.width_blocks || id.y >= params.height_blocks) {
        return;
    }
    let src_word = params.src_offset
        + (tiled_offset(id.x, id.y, params.pitch_blocks, params.log2_bpb) >> 2u);
    let dst_word = params.dst_offset
        + (id.y * params.width_blocks + id.x) * params.words_per_block;
    for (var i = 0u; i < params.words_per_block; i = i + 1u) {
        dst[dst_word + i] = src[src_word + i];
    }
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct UntileParams {
    src_offset: u32,
    dst_offset: u32,
    words_per_block: u32,
    log2_bpb: u32,
    width_blocks: u32,
    height_blocks: u32,
    pitch_blocks: u32,
    _pad: u32,
}

struct StoredTexture {
    texture: wgpu::Texture,
    desc: TextureDesc,
}

struct StoredRootSignature {
    desc: RootSignatureDesc,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

struct StoredPipeline {
    root_signature: RootSignatureId,
    vertex_shader: Vec<u8>,
    pixel_shader: Option<Vec<u8>>,
    color_formats: [Option<TextureFormat>; 4],
    depth_format: Option<TextureFormat>,
    color_write_masks: [u8; 4],
    blend_controls: [u32; 4],
    depth_control: u32,
    cull_mode: u32,
    /// wgpu bakes topology into pipelines; one variant per topology actually
    /// drawn with, plus the strip index format for indexed strips.
    variants: HashMap<(PrimitiveTopology, Option<IndexFormat>), wgpu::RenderPipeline>,
}

struct Untiler {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Draw-relevant state of the command list being lowered.
#[derive(Debug, Default)]
struct ListState {
    pipeline: Option<PipelineId>,
    root_signature: Option<RootSignatureId>,
    tables: Vec<Option<GpuDescriptorHandle>>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    blend_factor: [f32; 4],
    stencil_ref: u32,
    topology: Option<PrimitiveTopology>,
    colors: [Option<ResourceId>; 4],
    depth: Option<ResourceId>,
    index_buffer: Option<(ResourceId, u64, u64, IndexFormat)>,
}

enum DrawKind {
    Vertices(u32, u32),
    Indices(u32, u32),
}

/// Bind group entry before the referenced wgpu objects are borrowed.
enum PlannedBinding {
    Buffer {
        buffer: ResourceId,
        offset: u64,
        size: u64,
        uniform: bool,
    },
    NullConstants,
    View(usize),
    NullView,
    Sampler(SamplerDesc),
}

/// `wgpu` implementation of [`GpuBackend`].
///
/// Root signatures become a single bind group layout with every table laid
/// out back to back (see [`BINDINGS_PER_TABLE`]). Shader binaries are WGSL
/// source with a [`SHADER_ENTRY_POINT`] entry. Presentation is headless.
pub struct WgpuBackend {
    kind: BackendKind,
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    next_id: u64,

    buffers: HashMap<ResourceId, wgpu::Buffer>,
    textures: HashMap<ResourceId, StoredTexture>,
    heaps: Vec<Vec<Option<Descriptor>>>,
    root_signatures: HashMap<RootSignatureId, StoredRootSignature>,
    pipelines: HashMap<PipelineId, StoredPipeline>,
    samplers: HashMap<SamplerDesc, wgpu::Sampler>,

    null_view: wgpu::TextureView,
    null_constants: wgpu::Buffer,
    untiler: Untiler,

    submissions: VecDeque<(u64, wgpu::SubmissionIndex)>,
    completed: Arc<AtomicU64>,
    presents: u64,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("kind", &self.kind)
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("pipelines", &self.pipelines.len())
            .field("completed", &self.completed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl WgpuBackend {
    /// Opens the preferred adapter without a presentation surface.
    pub fn new_headless() -> Result<Self, BackendError> {
        pollster::block_on(Self::new_headless_async())
    }

    pub async fn new_headless_async() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::DX12 | wgpu::Backends::VULKAN | wgpu::Backends::METAL,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::NoAdapter("no DX12, Vulkan or Metal adapter".into()))?;

        let info = adapter.get_info();
        let kind = match info.backend {
            wgpu::Backend::Dx12 => BackendKind::D3D12,
            wgpu::Backend::Vulkan => BackendKind::Vulkan,
            _ => BackendKind::OtherWgpu,
        };
        let features = adapter.features()
            & (wgpu::Features::TEXTURE_COMPRESSION_BC
                | wgpu::Features::DEPTH32FLOAT_STENCIL8
                | wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("xenos-gpu"),
                    required_features: features,
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|err| BackendError::RequestDevice(err.to_string()))?;
        debug!(adapter = %info.name, ?kind, ?features, "opened wgpu device");

        let null_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("xenos null texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let null_view = null_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let null_constants = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("xenos null constants"),
            size: NULL_CONSTANT_BUFFER_SIZE,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let untiler = Self::create_untiler(&device);

        Ok(Self {
            kind,
            device,
            queue,
            features,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            heaps: Vec::new(),
            root_signatures: HashMap::new(),
            pipelines: HashMap::new(),
            samplers: HashMap::new(),
            null_view,
            null_constants,
            untiler,
            submissions: VecDeque::new(),
            completed: Arc::new(AtomicU64::new(0)),
            presents: 0,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_untiler(device: &wgpu::Device) -> Untiler {
        let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("xenos untile"),
            entries: &[
                storage(0, true),
                storage(1, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("xenos untile"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("xenos untile"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(UNTILE_WGSL)),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("xenos untile"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        Untiler { layout, pipeline }
    }

    /// Runs `f` inside a validation error scope.
    fn validated<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(BackendError::Unsupported(err.to_string())),
            None => Ok(value),
        }
    }

    fn map_texture_format(&self, format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgb10A2Unorm => wgpu::TextureFormat::Rgb10a2Unorm,
            TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
            TextureFormat::Bc2RgbaUnorm => wgpu::TextureFormat::Bc2RgbaUnorm,
            TextureFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::Depth32FloatStencil8
                if self.features.contains(wgpu::Features::DEPTH32FLOAT_STENCIL8) =>
            {
                wgpu::TextureFormat::Depth32FloatStencil8
            }
            TextureFormat::Depth32FloatStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn map_address_mode(&self, mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::ClampToBorder
                if self
                    .features
                    .contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER) =>
            {
                wgpu::AddressMode::ClampToBorder
            }
            AddressMode::ClampToBorder => wgpu::AddressMode::ClampToEdge,
        }
    }

    fn map_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Point => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn map_visibility(visibility: ShaderVisibility) -> wgpu::ShaderStages {
        match visibility {
            ShaderVisibility::Vertex => wgpu::ShaderStages::VERTEX,
            ShaderVisibility::Pixel => wgpu::ShaderStages::FRAGMENT,
            ShaderVisibility::All => wgpu::ShaderStages::VERTEX_FRAGMENT,
        }
    }

    fn map_index_format(format: IndexFormat) -> wgpu::IndexFormat {
        match format {
            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
        }
    }

    fn map_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }

    fn map_blend_factor(raw: u32) -> wgpu::BlendFactor {
        use wgpu::BlendFactor::*;
        match raw & 0x1F {
            0 => Zero,
            4 => Src,
            5 => OneMinusSrc,
            6 => SrcAlpha,
            7 => OneMinusSrcAlpha,
            8 => Dst,
            9 => OneMinusDst,
            10 => DstAlpha,
            11 => OneMinusDstAlpha,
            12 | 14 => Constant,
            13 | 15 => OneMinusConstant,
            16 => SrcAlphaSaturated,
            _ => One,
        }
    }

    fn map_blend_op(raw: u32) -> wgpu::BlendOperation {
        match raw & 0x7 {
            1 => wgpu::BlendOperation::Subtract,
            2 => wgpu::BlendOperation::Min,
            3 => wgpu::BlendOperation::Max,
            4 => wgpu::BlendOperation::ReverseSubtract,
            _ => wgpu::BlendOperation::Add,
        }
    }

    /// `RB_BLENDCONTROL*` to a blend state; `None` when it is a plain write.
    fn map_blend(control: u32) -> Option<wgpu::BlendState> {
        let component = |shift: u32| wgpu::BlendComponent {
            src_factor: Self::map_blend_factor(control >> shift),
            dst_factor: Self::map_blend_factor(control >> (shift + 8)),
            operation: Self::map_blend_op(control >> (shift + 5)),
        };
        let state = wgpu::BlendState {
            color: component(0),
            alpha: component(16),
        };
        (state != wgpu::BlendState::REPLACE).then_some(state)
    }

    fn map_compare(raw: u32) -> wgpu::CompareFunction {
        use wgpu::CompareFunction::*;
        match raw & 0x7 {
            0 => Never,
            1 => Less,
            2 => Equal,
            3 => LessEqual,
            4 => Greater,
            5 => NotEqual,
            6 => GreaterEqual,
            _ => Always,
        }
    }

    fn is_blendable(format: TextureFormat) -> bool {
        !matches!(
            format,
            TextureFormat::R32Float | TextureFormat::Rg32Float | TextureFormat::Rgba32Float
        )
    }

    fn buffer(&self, id: ResourceId) -> Result<&wgpu::Buffer, BackendError> {
        self.buffers.get(&id).ok_or(BackendError::UnknownHandle {
            kind: "buffer",
            id: id.0,
        })
    }

    fn texture(&self, id: ResourceId) -> Result<&StoredTexture, BackendError> {
        self.textures.get(&id).ok_or(BackendError::UnknownHandle {
            kind: "texture",
            id: id.0,
        })
    }

    fn descriptor(&self, handle: GpuDescriptorHandle) -> Option<Descriptor> {
        self.heaps
            .get(handle.heap.0 as usize)?
            .get(handle.index as usize)
            .copied()
            .flatten()
    }

    fn sampler_desc(&self, desc: &SamplerDesc) -> wgpu::SamplerDescriptor<'static> {
        let mag_filter = Self::map_filter_mode(desc.mag_filter);
        let min_filter = Self::map_filter_mode(desc.min_filter);
        let mipmap_filter = Self::map_filter_mode(desc.mip_filter);
        let all_linear = [mag_filter, min_filter, mipmap_filter]
            .iter()
            .all(|f| *f == wgpu::FilterMode::Linear);
        wgpu::SamplerDescriptor {
            label: Some("xenos sampler"),
            address_mode_u: self.map_address_mode(desc.address_u),
            address_mode_v: self.map_address_mode(desc.address_v),
            address_mode_w: self.map_address_mode(desc.address_w),
            mag_filter,
            min_filter,
            mipmap_filter,
            anisotropy_clamp: if all_linear {
                u16::from(desc.max_anisotropy.max(1))
            } else {
                1
            },
            ..Default::default()
        }
    }

    fn ensure_variant(
        &mut self,
        id: PipelineId,
        topology: PrimitiveTopology,
        strip_index: Option<IndexFormat>,
    ) -> Result<(), BackendError> {
        let key = (topology, strip_index);
        let pipeline = self.pipelines.get(&id).ok_or(BackendError::UnknownHandle {
            kind: "pipeline",
            id: id.0,
        })?;
        if pipeline.variants.contains_key(&key) {
            return Ok(());
        }
        let root = self
            .root_signatures
            .get(&pipeline.root_signature)
            .ok_or(BackendError::UnknownHandle {
                kind: "root signature",
                id: pipeline.root_signature.0,
            })?;
        let render_pipeline = self.compile(pipeline, root, topology, strip_index)?;
        trace!(?id, ?topology, "compiled pipeline variant");
        if let Some(pipeline) = self.pipelines.get_mut(&id) {
            pipeline.variants.insert(key, render_pipeline);
        }
        Ok(())
    }

    fn compile(
        &self,
        pipeline: &StoredPipeline,
        root: &StoredRootSignature,
        topology: PrimitiveTopology,
        strip_index: Option<IndexFormat>,
    ) -> Result<wgpu::RenderPipeline, BackendError> {
        let wgsl = |binary: &[u8]| {
            std::str::from_utf8(binary)
                .map(str::to_owned)
                .map_err(|_| BackendError::Unsupported("shader binary is not WGSL text".into()))
        };
        let vertex_source = wgsl(&pipeline.vertex_shader)?;
        let pixel_source = pipeline.pixel_shader.as_deref().map(wgsl).transpose()?;

        let targets: Vec<Option<wgpu::ColorTargetState>> = (0..4)
            .map(|i| {
                pipeline.color_formats[i].map(|format| wgpu::ColorTargetState {
                    format: self.map_texture_format(format),
                    blend: Self::is_blendable(format)
                        .then(|| Self::map_blend(pipeline.blend_controls[i]))
                        .flatten(),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(u32::from(
                        pipeline.color_write_masks[i] & 0xF,
                    )),
                })
            })
            .collect();

        let z_enable = pipeline.depth_control & 0b10 != 0;
        let z_write = pipeline.depth_control & 0b100 != 0;
        let depth_stencil = pipeline.depth_format.map(|format| wgpu::DepthStencilState {
            format: self.map_texture_format(format),
            depth_write_enabled: z_enable && z_write,
            depth_compare: if z_enable {
                Self::map_compare(pipeline.depth_control >> 4)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });
        let cull_mode = match pipeline.cull_mode & 0x3 {
            1 => Some(wgpu::Face::Front),
            2 => Some(wgpu::Face::Back),
            _ => None,
        };

        self.validated(|device| {
            let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("xenos vertex shader"),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(vertex_source)),
            });
            let pixel = pixel_source.map(|source| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("xenos pixel shader"),
                    source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
                })
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("xenos pipeline"),
                layout: Some(&root.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex,
                    entry_point: SHADER_ENTRY_POINT,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[],
                },
                fragment: pixel.as_ref().map(|module| wgpu::FragmentState {
                    module,
                    entry_point: SHADER_ENTRY_POINT,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &targets,
                }),
                primitive: wgpu::PrimitiveState {
                    topology: Self::map_topology(topology),
                    strip_index_format: strip_index.map(Self::map_index_format),
                    front_face: wgpu::FrontFace::Cw,
                    cull_mode,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })
    }

    fn lower(&mut self, list: &CommandList) -> Result<wgpu::CommandBuffer, BackendError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(list.label()),
            });
        let mut state = ListState::default();

        for cmd in list.cmds() {
            match cmd {
                HostCmd::SetPipeline(id) => state.pipeline = Some(*id),
                HostCmd::SetGraphicsRootSignature(id) => {
                    let count = self
                        .root_signatures
                        .get(id)
                        .map_or(0, |root| root.desc.parameters.len());
                    state.root_signature = Some(*id);
                    state.tables = vec![None; count];
                }
                HostCmd::SetDescriptorHeaps { .. } => {}
                HostCmd::SetGraphicsRootDescriptorTable { parameter, base } => {
                    if let Some(slot) = state.tables.get_mut(*parameter as usize) {
                        *slot = Some(*base);
                    }
                }
                HostCmd::SetViewport(viewport) => state.viewport = Some(*viewport),
                HostCmd::SetScissor(scissor) => state.scissor = Some(*scissor),
                HostCmd::SetBlendFactor(factor) => state.blend_factor = *factor,
                HostCmd::SetStencilRef(stencil_ref) => state.stencil_ref = *stencil_ref,
                HostCmd::SetPrimitiveTopology(topology) => state.topology = Some(*topology),
                HostCmd::SetRenderTargets { colors, depth } => {
                    state.colors = *colors;
                    state.depth = *depth;
                }
                HostCmd::SetIndexBuffer {
                    buffer,
                    offset,
                    size,
                    format,
                } => state.index_buffer = Some((*buffer, *offset, *size, *format)),
                // wgpu tracks resource usage itself.
                HostCmd::ResourceBarrier { .. } | HostCmd::UavBarrier(_) => {}
                HostCmd::CopyBufferRegion {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    size,
                } => {
                    encoder.copy_buffer_to_buffer(
                        self.buffer(*src)?,
                        *src_offset,
                        self.buffer(*dst)?,
                        *dst_offset,
                        *size,
                    );
                }
                HostCmd::CopyBufferToTexture {
                    src,
                    src_offset,
                    row_pitch,
                    dst,
                    format,
                    width,
                    height,
                } => self.encode_buffer_texture_copy(
                    &mut encoder,
                    *src,
                    *src_offset,
                    *row_pitch,
                    *dst,
                    *format,
                    (*width, *height),
                    true,
                )?,
                HostCmd::CopyTextureToBuffer {
                    src,
                    dst,
                    dst_offset,
                    row_pitch,
                    format,
                    width,
                    height,
                } => self.encode_buffer_texture_copy(
                    &mut encoder,
                    *dst,
                    *dst_offset,
                    *row_pitch,
                    *src,
                    *format,
                    (*width, *height),
                    false,
                )?,
                HostCmd::Untile {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    bytes_per_block,
                    width_blocks,
                    height_blocks,
                    pitch_blocks,
                } => {
                    let params = UntileParams {
                        src_offset: u32::try_from(src_offset / 4).unwrap_or(u32::MAX),
                        dst_offset: u32::try_from(dst_offset / 4).unwrap_or(u32::MAX),
                        words_per_block: bytes_per_block / 4,
                        log2_bpb: bytes_per_block.trailing_zeros(),
                        width_blocks: *width_blocks,
                        height_blocks: *height_blocks,
                        pitch_blocks: *pitch_blocks,
                        _pad: 0,
                    };
                    self.encode_untile(&mut encoder, *src, *dst, &params)?;
                }
                HostCmd::Draw {
                    vertex_count,
                    instance_count,
                } => self.encode_draw(
                    &mut encoder,
                    &state,
                    DrawKind::Vertices(*vertex_count, *instance_count),
                )?,
                HostCmd::DrawIndexed {
                    index_count,
                    instance_count,
                } => self.encode_draw(
                    &mut encoder,
                    &state,
                    DrawKind::Indices(*index_count, *instance_count),
                )?,
            }
        }
        Ok(encoder.finish())
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_buffer_texture_copy(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffer: ResourceId,
        buffer_offset: u64,
        row_pitch: u32,
        texture: ResourceId,
        format: TextureFormat,
        (width, height): (u32, u32),
        to_texture: bool,
    ) -> Result<(), BackendError> {
        let buffer = self.buffer(buffer)?;
        let texture = &self.texture(texture)?.texture;
        let block = format.block_dim();
        let block_rows = height.div_ceil(block);

        // Unaligned pitches are copied one block row at a time.
        let (rows_per_copy, copies) = if row_pitch % COPY_ROW_ALIGNMENT == 0 {
            (block_rows, 1)
        } else {
            (1, block_rows)
        };
        for copy in 0..copies {
            let first_row = copy * rows_per_copy;
            let buffer_copy = wgpu::ImageCopyBuffer {
                buffer,
                layout: wgpu::ImageDataLayout {
                    offset: buffer_offset + u64::from(first_row) * u64::from(row_pitch),
                    bytes_per_row: (rows_per_copy > 1).then_some(row_pitch),
                    rows_per_image: None,
                },
            };
            let texture_copy = wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: first_row * block,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            };
            let extent = wgpu::Extent3d {
                width: width.div_ceil(block) * block,
                height: (rows_per_copy * block).min(height.div_ceil(block) * block),
                depth_or_array_layers: 1,
            };
            if to_texture {
                encoder.copy_buffer_to_texture(buffer_copy, texture_copy, extent);
            } else {
                encoder.copy_texture_to_buffer(texture_copy, buffer_copy, extent);
            }
        }
        Ok(())
    }

    fn encode_untile(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: ResourceId,
        dst: ResourceId,
        params: &UntileParams,
    ) -> Result<(), BackendError> {
        let uniforms = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("xenos untile params"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("xenos untile"),
            layout: &self.untiler.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.buffer(src)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.buffer(dst)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("xenos untile"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.untiler.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            params.width_blocks.div_ceil(8),
            params.height_blocks.div_ceil(8),
            1,
        );
        Ok(())
    }

    fn plan_bindings(
        &mut self,
        state: &ListState,
        root: &RootSignatureDesc,
        views: &mut Vec<ResourceId>,
    ) -> Vec<(u32, PlannedBinding)> {
        let mut planned = Vec::new();
        for (p, param) in root.parameters.iter().enumerate() {
            let base = state.tables.get(p).copied().flatten();
            for i in 0..param.count {
                let binding = p as u32 * BINDINGS_PER_TABLE + i;
                let descriptor = base.and_then(|base| self.descriptor(base.offset(i)));
                let plan = match (param.range, descriptor) {
                    (_, Some(Descriptor::ConstantBuffer { buffer, offset, size })) => {
                        PlannedBinding::Buffer {
                            buffer,
                            offset,
                            size: u64::from(size),
                            uniform: true,
                        }
                    }
                    (_, Some(Descriptor::RawBuffer { buffer, size })) => PlannedBinding::Buffer {
                        buffer,
                        offset: 0,
                        size,
                        uniform: false,
                    },
                    (
                        _,
                        Some(Descriptor::Texture {
                            texture,
                            dimension: TextureDimension::D2,
                        }),
                    ) => {
                        views.push(texture);
                        PlannedBinding::View(views.len() - 1)
                    }
                    (_, Some(Descriptor::Sampler(desc))) => {
                        if !self.samplers.contains_key(&desc) {
                            let sampler = self.device.create_sampler(&self.sampler_desc(&desc));
                            self.samplers.insert(desc, sampler);
                        }
                        PlannedBinding::Sampler(desc)
                    }
                    (DescriptorRangeKind::ConstantBuffer, _) => PlannedBinding::NullConstants,
                    (DescriptorRangeKind::Sampler, _) => {
                        let desc = SamplerDesc::default();
                        if !self.samplers.contains_key(&desc) {
                            let sampler = self.device.create_sampler(&self.sampler_desc(&desc));
                            self.samplers.insert(desc, sampler);
                        }
                        PlannedBinding::Sampler(desc)
                    }
                    (DescriptorRangeKind::ShaderResource, _) => PlannedBinding::NullView,
                };
                planned.push((binding, plan));
            }
        }
        planned
    }

    fn encode_draw(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        state: &ListState,
        kind: DrawKind,
    ) -> Result<(), BackendError> {
        let (Some(pipeline_id), Some(root_id)) = (state.pipeline, state.root_signature) else {
            warn!("draw without pipeline state");
            return Ok(());
        };
        let topology = state.topology.unwrap_or(PrimitiveTopology::TriangleList);
        let strip_index = match (&kind, topology, state.index_buffer) {
            (
                DrawKind::Indices(..),
                PrimitiveTopology::LineStrip | PrimitiveTopology::TriangleStrip,
                Some((_, _, _, format)),
            ) => Some(format),
            _ => None,
        };
        self.ensure_variant(pipeline_id, topology, strip_index)?;

        let root_desc = self
            .root_signatures
            .get(&root_id)
            .map(|root| root.desc.clone())
            .ok_or(BackendError::UnknownHandle {
                kind: "root signature",
                id: root_id.0,
            })?;
        let mut view_textures = Vec::new();
        let planned = self.plan_bindings(state, &root_desc, &mut view_textures);

        let views = view_textures
            .iter()
            .map(|id| {
                self.texture(*id).map(|t| {
                    t.texture.create_view(&wgpu::TextureViewDescriptor {
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        ..Default::default()
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut entries = Vec::with_capacity(planned.len());
        for (binding, plan) in &planned {
            let resource = match plan {
                PlannedBinding::Buffer {
                    buffer,
                    offset,
                    size,
                    ..
                } => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: self.buffer(*buffer)?,
                    offset: *offset,
                    size: NonZeroU64::new(*size),
                }),
                PlannedBinding::NullConstants => self.null_constants.as_entire_binding(),
                PlannedBinding::View(index) => wgpu::BindingResource::TextureView(&views[*index]),
                PlannedBinding::NullView => wgpu::BindingResource::TextureView(&self.null_view),
                PlannedBinding::Sampler(desc) => match self.samplers.get(desc) {
                    Some(sampler) => wgpu::BindingResource::Sampler(sampler),
                    None => continue,
                },
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let root = &self.root_signatures[&root_id];
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("xenos draw"),
            layout: &root.bind_group_layout,
            entries: &entries,
        });

        let mut target_size = None;
        let mut color_views = Vec::with_capacity(4);
        for color in state.colors {
            let view = match color {
                Some(id) => {
                    let stored = self.texture(id)?;
                    target_size.get_or_insert((stored.desc.width, stored.desc.height));
                    Some(stored.texture.create_view(&wgpu::TextureViewDescriptor::default()))
                }
                None => None,
            };
            color_views.push(view);
        }
        let depth_view = match state.depth {
            Some(id) => {
                let stored = self.texture(id)?;
                target_size.get_or_insert((stored.desc.width, stored.desc.height));
                Some(stored.texture.create_view(&wgpu::TextureViewDescriptor::default()))
            }
            None => None,
        };
        let Some((target_width, target_height)) = target_size else {
            trace!("draw without attachments");
            return Ok(());
        };

        let scissor = state.scissor.unwrap_or(ScissorRect {
            left: 0,
            top: 0,
            right: target_width,
            bottom: target_height,
        });
        let left = scissor.left.min(target_width);
        let top = scissor.top.min(target_height);
        let right = scissor.right.min(target_width);
        let bottom = scissor.bottom.min(target_height);
        if right <= left || bottom <= top {
            return Ok(());
        }

        let pipeline = self
            .pipelines
            .get(&pipeline_id)
            .and_then(|p| p.variants.get(&(topology, strip_index)))
            .ok_or(BackendError::UnknownHandle {
                kind: "pipeline",
                id: pipeline_id.0,
            })?;
        let index_buffer = match (&kind, state.index_buffer) {
            (DrawKind::Indices(..), Some((id, offset, size, format))) => {
                Some((self.buffer(id)?, offset, size, format))
            }
            (DrawKind::Indices(..), None) => {
                warn!("indexed draw without an index buffer");
                return Ok(());
            }
            _ => None,
        };

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = color_views
            .iter()
            .map(|view| {
                view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("xenos draw"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth_view.as_ref().map(|view| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        if let Some(vp) = state.viewport {
            let x = vp.x.clamp(0.0, target_width as f32);
            let y = vp.y.clamp(0.0, target_height as f32);
            let width = vp.width.min(target_width as f32 - x).max(0.0);
            let height = vp.height.min(target_height as f32 - y).max(0.0);
            if width > 0.0 && height > 0.0 {
                pass.set_viewport(x, y, width, height, vp.min_depth, vp.max_depth);
            }
        }
        pass.set_scissor_rect(left, top, right - left, bottom - top);
        let [r, g, b, a] = state.blend_factor;
        pass.set_blend_constant(wgpu::Color {
            r: f64::from(r),
            g: f64::from(g),
            b: f64::from(b),
            a: f64::from(a),
        });
        pass.set_stencil_reference(state.stencil_ref);
        match kind {
            DrawKind::Vertices(count, instances) => pass.draw(0..count, 0..instances),
            DrawKind::Indices(count, instances) => {
                if let Some((buffer, offset, size, format)) = index_buffer {
                    pass.set_index_buffer(
                        buffer.slice(offset..offset + size),
                        Self::map_index_format(format),
                    );
                    pass.draw_indexed(0..count, 0, 0..instances);
                }
            }
        }
        Ok(())
    }
}

impl GpuBackend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceId, BackendError> {
        let mut usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        usage |= match desc.heap {
            MemoryHeap::Upload => wgpu::BufferUsages::UNIFORM,
            MemoryHeap::Default => wgpu::BufferUsages::INDEX | wgpu::BufferUsages::UNIFORM,
        };
        if desc.unordered_access || desc.initial_state.contains(ResourceState::NON_PIXEL_SHADER_RESOURCE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        let size = desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.validated(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })?;
        let id = ResourceId(self.alloc_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<ResourceId, BackendError> {
        let mut usage = wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::TEXTURE_BINDING;
        if desc.render_attachment {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let dimension = match desc.dimension {
            TextureDimension::D1 => wgpu::TextureDimension::D1,
            TextureDimension::D2 | TextureDimension::Cube => wgpu::TextureDimension::D2,
            TextureDimension::D3 => wgpu::TextureDimension::D3,
        };
        let format = self.map_texture_format(desc.format);
        let texture = self.validated(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.width.max(1),
                    height: desc.height.max(1),
                    depth_or_array_layers: desc.depth_or_layers.max(1),
                },
                mip_level_count: desc.mip_levels.max(1),
                sample_count: 1,
                dimension,
                format,
                usage,
                view_formats: &[],
            })
        })?;
        let id = ResourceId(self.alloc_id());
        self.textures.insert(
            id,
            StoredTexture {
                texture,
                desc: *desc,
            },
        );
        Ok(id)
    }

    fn destroy_resource(&mut self, id: ResourceId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.destroy();
        } else if let Some(stored) = self.textures.remove(&id) {
            stored.texture.destroy();
        }
    }

    fn write_buffer(
        &mut self,
        id: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let align = wgpu::COPY_BUFFER_ALIGNMENT;
        if offset % align != 0 || data.len() as u64 % align != 0 {
            return Err(BackendError::Unsupported(format!(
                "buffer writes must be {align}-byte aligned (offset {offset}, {} bytes)",
                data.len()
            )));
        }
        let buffer = self.buffer(id)?;
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeapId, BackendError> {
        let id = DescriptorHeapId(self.heaps.len() as u32);
        self.heaps.push(vec![None; capacity as usize]);
        debug!(?kind, capacity, ?id, "created descriptor heap");
        Ok(id)
    }

    fn write_descriptor(&mut self, handle: CpuDescriptorHandle, descriptor: &Descriptor) {
        if let Some(slot) = self
            .heaps
            .get_mut(handle.heap.0 as usize)
            .and_then(|heap| heap.get_mut(handle.index as usize))
        {
            *slot = Some(*descriptor);
        }
    }

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureId, BackendError> {
        let mut entries = Vec::new();
        for (p, param) in desc.parameters.iter().enumerate() {
            let ty = match param.range {
                DescriptorRangeKind::ConstantBuffer => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                // Space 0 holds the raw shared memory view, space 1 textures.
                DescriptorRangeKind::ShaderResource if param.register_space == 0 => {
                    wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    }
                }
                DescriptorRangeKind::ShaderResource => wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                DescriptorRangeKind::Sampler => {
                    wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
                }
            };
            for i in 0..param.count {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: p as u32 * BINDINGS_PER_TABLE + i,
                    visibility: Self::map_visibility(param.visibility),
                    ty,
                    count: None,
                });
            }
        }
        let (bind_group_layout, pipeline_layout) = self.validated(|device| {
            let bind_group_layout =
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("xenos root signature"),
                    entries: &entries,
                });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("xenos root signature"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
            (bind_group_layout, pipeline_layout)
        })?;
        let id = RootSignatureId(self.alloc_id());
        self.root_signatures.insert(
            id,
            StoredRootSignature {
                desc: desc.clone(),
                bind_group_layout,
                pipeline_layout,
            },
        );
        Ok(id)
    }

    fn destroy_root_signature(&mut self, id: RootSignatureId) {
        self.root_signatures.remove(&id);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineId, BackendError> {
        let stored = StoredPipeline {
            root_signature: desc.root_signature,
            vertex_shader: desc.vertex_shader.to_vec(),
            pixel_shader: desc.pixel_shader.map(<[u8]>::to_vec),
            color_formats: desc.color_formats,
            depth_format: desc.depth_format,
            color_write_masks: desc.color_write_masks,
            blend_controls: desc.blend_controls,
            depth_control: desc.depth_control,
            cull_mode: desc.cull_mode,
            variants: HashMap::new(),
        };
        let id = PipelineId(self.alloc_id());
        self.pipelines.insert(id, stored);
        // Surface compile errors now rather than at the first draw.
        let topology = match desc.topology_type {
            PrimitiveTopologyType::Point => PrimitiveTopology::PointList,
            PrimitiveTopologyType::Line => PrimitiveTopology::LineList,
            PrimitiveTopologyType::Triangle => PrimitiveTopology::TriangleList,
        };
        if let Err(err) = self.ensure_variant(id, topology, None) {
            self.pipelines.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    fn destroy_pipeline(&mut self, id: PipelineId) {
        self.pipelines.remove(&id);
    }

    fn submit(&mut self, lists: &[&CommandList], signal_fence: u64) -> Result<(), BackendError> {
        let buffers = lists
            .iter()
            .map(|list| self.lower(list))
            .collect::<Result<Vec<_>, _>>()?;
        let index = self.queue.submit(buffers);
        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(signal_fence, Ordering::AcqRel);
        });
        self.submissions.push_back((signal_fence, index));
        Ok(())
    }

    fn completed_fence(&mut self) -> u64 {
        self.device.poll(wgpu::Maintain::Poll);
        let completed = self.completed.load(Ordering::Acquire);
        while self
            .submissions
            .front()
            .is_some_and(|(fence, _)| *fence <= completed)
        {
            self.submissions.pop_front();
        }
        completed
    }

    fn wait_for_fence(&mut self, fence: u64) -> Result<(), BackendError> {
        if self.completed_fence() >= fence {
            return Ok(());
        }
        let Some((reached, index)) = self
            .submissions
            .iter()
            .find(|(submitted, _)| *submitted >= fence)
            .cloned()
        else {
            return Err(BackendError::Unsupported(format!(
                "waiting on fence {fence} that was never submitted"
            )));
        };
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        self.completed.fetch_max(reached, Ordering::AcqRel);
        self.completed_fence();
        Ok(())
    }

    fn present(&mut self, request: &PresentRequest) -> Result<(), BackendError> {
        self.presents += 1;
        trace!(
            frontbuffer = request.frontbuffer,
            width = request.width,
            height = request.height,
            source = ?request.source,
            "present (headless)"
        );
        Ok(())
    }
}
