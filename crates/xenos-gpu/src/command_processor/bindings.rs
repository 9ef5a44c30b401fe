//! Constant buffers, descriptor tables and root parameter binding.
//!
//! Every constant category is one entry of a fixed table walked by a single
//! loop. Descriptor tables are written into the per-frame descriptor pools,
//! as partial updates while the pool's full-update generation is unchanged.

use tracing::trace;

use crate::backend::{Descriptor, GpuBackend, GpuDescriptorHandle, RootSignatureId};
use crate::cmd::HostCmd;
use crate::descriptor_pool::DescriptorAllocation;
use crate::error::GpuError;
use crate::registers::*;
use crate::root_signature::{RootExtraParameterIndices, RootParameter};
use crate::shader::{ShaderId, TranslatedShader};
use crate::upload_pool::UploadAllocation;
use crate::xenos::Endian;

use super::fixed_function::viewport_transform_enabled;
use super::CommandProcessor;

/// Constant buffer views must start and end on this boundary.
const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// A guest constant category with its own constant buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstantBuffer {
    System,
    /// A page of 32 float4 constants. Pages below [`VERTEX_FLOAT_PAGES`]
    /// belong to the vertex shader.
    Float(u8),
    BoolLoop,
    Fetch,
}

pub(crate) const CONSTANT_BUFFER_COUNT: usize = 2 + FLOAT_PAGE_COUNT + 1;

impl ConstantBuffer {
    fn index(self) -> usize {
        match self {
            Self::System => 0,
            Self::Float(page) => 1 + page as usize,
            Self::BoolLoop => 1 + FLOAT_PAGE_COUNT,
            Self::Fetch => 2 + FLOAT_PAGE_COUNT,
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => Self::System,
            i if i <= FLOAT_PAGE_COUNT => Self::Float((i - 1) as u8),
            i if i == 1 + FLOAT_PAGE_COUNT => Self::BoolLoop,
            _ => Self::Fetch,
        }
    }

    /// Category holding register `index`, if it is a shader constant.
    pub(crate) fn for_register(index: u32) -> Option<Self> {
        let in_range = |start: u32, len: u32| index >= start && index - start < len;
        if in_range(SHADER_CONSTANT_000_X, FLOAT_CONSTANT_DWORDS) {
            Some(Self::Float(
                ((index - SHADER_CONSTANT_000_X) / FLOAT_PAGE_DWORDS) as u8,
            ))
        } else if in_range(SHADER_CONSTANT_FETCH_00_0, FETCH_CONSTANT_DWORDS) {
            Some(Self::Fetch)
        } else if in_range(
            SHADER_CONSTANT_BOOL_000_031,
            BOOL_CONSTANT_DWORDS + LOOP_CONSTANT_DWORDS,
        ) {
            Some(Self::BoolLoop)
        } else {
            None
        }
    }

    fn view_table(self) -> ViewTable {
        match self {
            Self::System | Self::BoolLoop => ViewTable::CommonConstants,
            Self::Float(page) if (page as usize) < VERTEX_FLOAT_PAGES => {
                ViewTable::VertexFloatConstants
            }
            Self::Float(_) => ViewTable::PixelFloatConstants,
            Self::Fetch => ViewTable::FetchConstants,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConstantBufferBinding {
    pub(crate) address: Option<UploadAllocation>,
    pub(crate) up_to_date: bool,
}

/// View descriptor tables, in the order their descriptors are packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewTable {
    FetchConstants,
    VertexFloatConstants,
    PixelFloatConstants,
    CommonConstants,
    SharedMemory,
    PixelTextures,
    VertexTextures,
}

const VIEW_TABLE_COUNT: usize = 7;

impl ViewTable {
    const ALL: [Self; VIEW_TABLE_COUNT] = [
        Self::FetchConstants,
        Self::VertexFloatConstants,
        Self::PixelFloatConstants,
        Self::CommonConstants,
        Self::SharedMemory,
        Self::PixelTextures,
        Self::VertexTextures,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }

    fn root_parameter(self, indices: &RootExtraParameterIndices) -> Option<u32> {
        match self {
            Self::FetchConstants => Some(RootParameter::FetchConstants as u32),
            Self::VertexFloatConstants => Some(RootParameter::VertexFloatConstants as u32),
            Self::PixelFloatConstants => Some(RootParameter::PixelFloatConstants as u32),
            Self::CommonConstants => Some(RootParameter::CommonConstants as u32),
            Self::SharedMemory => Some(RootParameter::SharedMemory as u32),
            Self::PixelTextures => indices.pixel_textures,
            Self::VertexTextures => indices.vertex_textures,
        }
    }
}

/// Sampler tables. Bit 0 is the pixel stage.
const SAMPLER_TABLE_COUNT: usize = 2;
const SAMPLER_PIXEL: usize = 0;
const SAMPLER_VERTEX: usize = 1;

fn sampler_root_parameter(table: usize, indices: &RootExtraParameterIndices) -> Option<u32> {
    if table == SAMPLER_PIXEL {
        indices.pixel_samplers
    } else {
        indices.vertex_samplers
    }
}

/// Binding state of the current command list.
#[derive(Debug)]
pub(crate) struct BindingState {
    pub(crate) constant_buffers: [ConstantBufferBinding; CONSTANT_BUFFER_COUNT],
    root_signature: Option<RootSignatureId>,
    indices: RootExtraParameterIndices,
    /// Bit per root parameter whose table is bound on the list.
    root_up_to_date: u32,
    vertex_shader: Option<ShaderId>,
    pixel_shader: Option<ShaderId>,

    view_full_update: u64,
    view_tables: [Option<GpuDescriptorHandle>; VIEW_TABLE_COUNT],
    view_dirty: u8,
    sampler_full_update: u64,
    sampler_tables: [Option<GpuDescriptorHandle>; SAMPLER_TABLE_COUNT],
    sampler_dirty: u8,
}

impl BindingState {
    pub(crate) fn new() -> Self {
        Self {
            constant_buffers: [ConstantBufferBinding::default(); CONSTANT_BUFFER_COUNT],
            root_signature: None,
            indices: RootExtraParameterIndices::default(),
            root_up_to_date: 0,
            vertex_shader: None,
            pixel_shader: None,
            view_full_update: 0,
            view_tables: [None; VIEW_TABLE_COUNT],
            view_dirty: u8::MAX,
            sampler_full_update: 0,
            sampler_tables: [None; SAMPLER_TABLE_COUNT],
            sampler_dirty: u8::MAX,
        }
    }

    /// Forgets everything bound on the previous command list. Constants are
    /// uploaded again because the previous frame's upload pages may be
    /// recycled while this frame is in flight.
    pub(crate) fn invalidate(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn constant_written(&mut self, buffer: ConstantBuffer) {
        self.constant_buffers[buffer.index()].up_to_date = false;
        if buffer == ConstantBuffer::Fetch {
            // Sampler state lives in the texture fetch constants.
            self.sampler_dirty = u8::MAX;
        }
    }

    pub(crate) fn textures_changed(&mut self) {
        self.view_dirty |= ViewTable::PixelTextures.bit() | ViewTable::VertexTextures.bit();
    }
}

impl Default for BindingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-draw constants computed on the host.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct SystemConstants {
    /// Alpha test function (bits 0-2) and enable (bit 3) from `RB_COLORCONTROL`.
    pub(crate) alpha_test: u32,
    pub(crate) vertex_index_endian: u32,
    pub(crate) vertex_base_index: i32,
    pub(crate) pixel_half_pixel_offset: f32,
    pub(crate) ndc_scale: [f32; 3],
    pub(crate) alpha_test_reference: f32,
    pub(crate) ndc_offset: [f32; 3],
    pub(crate) _pad: f32,
    /// Host render target for each guest color output, `u32::MAX` when the
    /// output is masked.
    pub(crate) color_output_map: [u32; 4],
}

impl SystemConstants {
    pub(crate) fn from_regs(
        regs: &RegisterFile,
        index_endian: Endian,
        rt_width: u32,
        rt_height: u32,
    ) -> Self {
        let (ndc_scale, ndc_offset) = if viewport_transform_enabled(regs) {
            ([1.0, 1.0, 1.0], [0.0, 0.0, 0.0])
        } else {
            // Vertices arrive in window space.
            let width = rt_width.max(1) as f32;
            let height = rt_height.max(1) as f32;
            ([2.0 / width, -2.0 / height, 1.0], [-1.0, 1.0, 0.0])
        };
        let color_mask = regs.get(RB_COLOR_MASK);
        Self {
            alpha_test: regs.get(RB_COLORCONTROL) & 0xF,
            vertex_index_endian: index_endian.bits(),
            vertex_base_index: regs.get(VGT_INDX_OFFSET) as i32,
            pixel_half_pixel_offset: if regs.get(PA_SU_SC_MODE_CNTL) & (1 << 15) != 0 {
                0.5
            } else {
                0.0
            },
            ndc_scale,
            alpha_test_reference: regs.get_f32(RB_ALPHA_REF),
            ndc_offset,
            _pad: 0.0,
            color_output_map: std::array::from_fn(|i| {
                if (color_mask >> (i * 4)) & 0xF != 0 {
                    i as u32
                } else {
                    u32::MAX
                }
            }),
        }
    }
}

impl<B: GpuBackend> CommandProcessor<B> {
    pub(super) fn update_system_constants(
        &mut self,
        index_endian: Endian,
        rt_width: u32,
        rt_height: u32,
    ) {
        let constants = SystemConstants::from_regs(&self.regs, index_endian, rt_width, rt_height);
        if constants != self.system_constants {
            self.system_constants = constants;
            self.bindings.constant_written(ConstantBuffer::System);
        }
    }

    fn upload_constant_buffer(&mut self, buffer: ConstantBuffer) -> Result<(), GpuError> {
        let data: &[u8] = match buffer {
            ConstantBuffer::System => bytemuck::bytes_of(&self.system_constants),
            ConstantBuffer::Float(page) => bytemuck::cast_slice(self.regs.slice(
                SHADER_CONSTANT_000_X + u32::from(page) * FLOAT_PAGE_DWORDS,
                FLOAT_PAGE_DWORDS,
            )),
            ConstantBuffer::BoolLoop => bytemuck::cast_slice(self.regs.slice(
                SHADER_CONSTANT_BOOL_000_031,
                BOOL_CONSTANT_DWORDS + LOOP_CONSTANT_DWORDS,
            )),
            ConstantBuffer::Fetch => bytemuck::cast_slice(
                self.regs
                    .slice(SHADER_CONSTANT_FETCH_00_0, FETCH_CONSTANT_DWORDS),
            ),
        };
        let size = crate::ring::align_up(data.len() as u64, CONSTANT_BUFFER_ALIGNMENT);
        let alloc = self.constant_pool.request_full(
            &mut self.backend,
            self.frame_current,
            size,
            CONSTANT_BUFFER_ALIGNMENT,
        )?;
        self.backend.write_buffer(alloc.buffer, alloc.offset, data)?;

        let binding = &mut self.bindings.constant_buffers[buffer.index()];
        binding.address = Some(alloc);
        binding.up_to_date = true;
        self.bindings.view_dirty |= buffer.view_table().bit();
        Ok(())
    }

    fn constant_buffer_descriptor(&self, buffer: ConstantBuffer) -> Descriptor {
        match self.bindings.constant_buffers[buffer.index()].address {
            Some(alloc) => Descriptor::ConstantBuffer {
                buffer: alloc.buffer,
                offset: alloc.offset,
                size: alloc.size as u32,
            },
            None => unreachable!("{buffer:?} bound before its first upload"),
        }
    }

    fn view_table_size(
        table: ViewTable,
        vs: &TranslatedShader,
        ps: Option<&TranslatedShader>,
    ) -> u32 {
        match table {
            ViewTable::FetchConstants | ViewTable::SharedMemory => 1,
            ViewTable::VertexFloatConstants | ViewTable::PixelFloatConstants => {
                VERTEX_FLOAT_PAGES as u32
            }
            ViewTable::CommonConstants => 2,
            ViewTable::PixelTextures => ps.map_or(0, TranslatedShader::texture_count),
            ViewTable::VertexTextures => vs.texture_count(),
        }
    }

    fn write_view_table(
        &mut self,
        table: ViewTable,
        alloc: &DescriptorAllocation,
        offset: u32,
        vs: &TranslatedShader,
        ps: Option<&TranslatedShader>,
    ) {
        let base = alloc.cpu.offset(offset);
        match table {
            ViewTable::FetchConstants => {
                let cbv = self.constant_buffer_descriptor(ConstantBuffer::Fetch);
                self.backend.write_descriptor(base, &cbv);
            }
            ViewTable::VertexFloatConstants | ViewTable::PixelFloatConstants => {
                let first = if table == ViewTable::VertexFloatConstants {
                    0
                } else {
                    VERTEX_FLOAT_PAGES
                };
                for i in 0..VERTEX_FLOAT_PAGES {
                    let cbv = self.constant_buffer_descriptor(ConstantBuffer::Float((first + i) as u8));
                    self.backend.write_descriptor(base.offset(i as u32), &cbv);
                }
            }
            ViewTable::CommonConstants => {
                let system = self.constant_buffer_descriptor(ConstantBuffer::System);
                let bool_loop = self.constant_buffer_descriptor(ConstantBuffer::BoolLoop);
                self.backend.write_descriptor(base, &system);
                self.backend.write_descriptor(base.offset(1), &bool_loop);
            }
            ViewTable::SharedMemory => {
                self.backend.write_descriptor(
                    base,
                    &Descriptor::RawBuffer {
                        buffer: self.shared_memory.buffer(),
                        size: self.shared_memory.size(),
                    },
                );
            }
            ViewTable::PixelTextures | ViewTable::VertexTextures => {
                let shader = if table == ViewTable::PixelTextures {
                    ps
                } else {
                    Some(vs)
                };
                let bindings = shader.map_or(&[][..], |s| s.texture_bindings.as_slice());
                for (i, binding) in bindings.iter().enumerate() {
                    self.texture_cache.write_texture_srv(
                        &mut self.backend,
                        binding.fetch_constant,
                        binding.dimension,
                        base.offset(i as u32),
                    );
                }
            }
        }
    }

    /// Brings constants and descriptor tables up to date for a draw with
    /// `vs`/`ps` under `root_signature`, recording root table binds.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn update_bindings(
        &mut self,
        vs_id: ShaderId,
        ps_id: Option<ShaderId>,
        vs: &TranslatedShader,
        ps: Option<&TranslatedShader>,
        root_signature: RootSignatureId,
        indices: RootExtraParameterIndices,
        textures_changed: bool,
    ) -> Result<(), GpuError> {
        if self.bindings.root_signature != Some(root_signature) {
            self.draw_list()
                .push(HostCmd::SetGraphicsRootSignature(root_signature));
            self.bindings.root_signature = Some(root_signature);
            // Parameter indices may have moved.
            self.bindings.root_up_to_date = 0;
        }
        self.bindings.indices = indices;

        if self.bindings.vertex_shader != Some(vs_id) {
            self.bindings.vertex_shader = Some(vs_id);
            self.bindings.view_dirty |= ViewTable::VertexTextures.bit();
            self.bindings.sampler_dirty |= 1 << SAMPLER_VERTEX;
        }
        if self.bindings.pixel_shader != ps_id {
            self.bindings.pixel_shader = ps_id;
            self.bindings.view_dirty |= ViewTable::PixelTextures.bit();
            self.bindings.sampler_dirty |= 1 << SAMPLER_PIXEL;
        }
        if textures_changed {
            self.bindings.textures_changed();
        }

        for index in 0..CONSTANT_BUFFER_COUNT {
            if !self.bindings.constant_buffers[index].up_to_date {
                self.upload_constant_buffer(ConstantBuffer::from_index(index))?;
            }
        }

        self.update_view_tables(vs, ps)?;
        self.update_sampler_tables(vs, ps);

        for table in ViewTable::ALL {
            let (Some(parameter), Some(base)) = (
                table.root_parameter(&indices),
                self.bindings.view_tables[table as usize],
            ) else {
                continue;
            };
            self.bind_root_table(parameter, base);
        }
        for table in 0..SAMPLER_TABLE_COUNT {
            let (Some(parameter), Some(base)) = (
                sampler_root_parameter(table, &indices),
                self.bindings.sampler_tables[table],
            ) else {
                continue;
            };
            self.bind_root_table(parameter, base);
        }
        Ok(())
    }

    fn bind_root_table(&mut self, parameter: u32, base: GpuDescriptorHandle) {
        if self.bindings.root_up_to_date & (1 << parameter) != 0 {
            return;
        }
        self.draw_list()
            .push(HostCmd::SetGraphicsRootDescriptorTable { parameter, base });
        self.bindings.root_up_to_date |= 1 << parameter;
    }

    fn update_view_tables(
        &mut self,
        vs: &TranslatedShader,
        ps: Option<&TranslatedShader>,
    ) -> Result<(), GpuError> {
        let indices = self.bindings.indices;
        let needed = ViewTable::ALL
            .iter()
            .filter(|t| t.root_parameter(&indices).is_some())
            .fold(0u8, |mask, t| mask | t.bit());
        let missing = ViewTable::ALL
            .iter()
            .filter(|t| self.bindings.view_tables[**t as usize].is_none())
            .fold(0u8, |mask, t| mask | t.bit());
        let write = needed & (self.bindings.view_dirty | missing);
        if write == 0 {
            return Ok(());
        }

        let count = |mask: u8| -> u32 {
            ViewTable::ALL
                .iter()
                .filter(|t| mask & t.bit() != 0)
                .map(|&t| Self::view_table_size(t, vs, ps))
                .sum()
        };
        let alloc = self.request_view_descriptors(
            self.bindings.view_full_update,
            count(write),
            count(needed),
        );
        self.bindings.view_full_update = alloc.full_update;
        let write = if alloc.is_full {
            // Tables from older generations must not be reused.
            self.bindings.view_tables = [None; VIEW_TABLE_COUNT];
            needed
        } else {
            write
        };

        let mut offset = 0;
        for table in ViewTable::ALL {
            if write & table.bit() == 0 {
                continue;
            }
            self.write_view_table(table, &alloc, offset, vs, ps);
            self.bindings.view_tables[table as usize] = Some(alloc.gpu.offset(offset));
            if let Some(parameter) = table.root_parameter(&indices) {
                self.bindings.root_up_to_date &= !(1 << parameter);
            }
            offset += Self::view_table_size(table, vs, ps);
        }
        self.bindings.view_dirty &= !write;
        trace!(tables = write, descriptors = offset, full = alloc.is_full, "wrote view tables");
        Ok(())
    }

    fn update_sampler_tables(&mut self, vs: &TranslatedShader, ps: Option<&TranslatedShader>) {
        let indices = self.bindings.indices;
        let stage = |table: usize| if table == SAMPLER_PIXEL { ps } else { Some(vs) };
        let size = |table: usize| stage(table).map_or(0, TranslatedShader::sampler_count);

        let mut needed = 0u8;
        let mut missing = 0u8;
        for table in 0..SAMPLER_TABLE_COUNT {
            if sampler_root_parameter(table, &indices).is_some() {
                needed |= 1 << table;
            }
            if self.bindings.sampler_tables[table].is_none() {
                missing |= 1 << table;
            }
        }
        let write = needed & (self.bindings.sampler_dirty | missing);
        if write == 0 {
            return;
        }

        let count = |mask: u8| -> u32 {
            (0..SAMPLER_TABLE_COUNT)
                .filter(|t| mask & (1 << t) != 0)
                .map(size)
                .sum()
        };
        let alloc = self.request_sampler_descriptors(
            self.bindings.sampler_full_update,
            count(write),
            count(needed),
        );
        self.bindings.sampler_full_update = alloc.full_update;
        let write = if alloc.is_full {
            self.bindings.sampler_tables = [None; SAMPLER_TABLE_COUNT];
            needed
        } else {
            write
        };

        let mut offset = 0;
        for table in 0..SAMPLER_TABLE_COUNT {
            if write & (1 << table) == 0 {
                continue;
            }
            let base = alloc.cpu.offset(offset);
            let samplers = stage(table).map_or(&[][..], |s| s.sampler_bindings.as_slice());
            for (i, binding) in samplers.iter().enumerate() {
                self.texture_cache.write_sampler(
                    &mut self.backend,
                    &self.regs,
                    binding.fetch_constant,
                    base.offset(i as u32),
                );
            }
            self.bindings.sampler_tables[table] = Some(alloc.gpu.offset(offset));
            if let Some(parameter) = sampler_root_parameter(table, &indices) {
                self.bindings.root_up_to_date &= !(1 << parameter);
            }
            offset += size(table);
        }
        self.bindings.sampler_dirty &= !write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_registers_map_to_categories() {
        assert_eq!(
            ConstantBuffer::for_register(SHADER_CONSTANT_000_X),
            Some(ConstantBuffer::Float(0))
        );
        assert_eq!(
            ConstantBuffer::for_register(SHADER_CONSTANT_000_X + FLOAT_CONSTANT_DWORDS - 1),
            Some(ConstantBuffer::Float(15))
        );
        assert_eq!(
            ConstantBuffer::for_register(SHADER_CONSTANT_FETCH_00_0 + 5),
            Some(ConstantBuffer::Fetch)
        );
        assert_eq!(
            ConstantBuffer::for_register(SHADER_CONSTANT_LOOP_00 + 31),
            Some(ConstantBuffer::BoolLoop)
        );
        assert_eq!(ConstantBuffer::for_register(RB_COLOR_INFO), None);
    }

    #[test]
    fn index_round_trips_over_the_table() {
        for index in 0..CONSTANT_BUFFER_COUNT {
            assert_eq!(ConstantBuffer::from_index(index).index(), index);
        }
        assert_eq!(CONSTANT_BUFFER_COUNT, 19);
    }

    #[test]
    fn float_pages_split_between_stages() {
        assert_eq!(
            ConstantBuffer::Float(7).view_table(),
            ViewTable::VertexFloatConstants
        );
        assert_eq!(
            ConstantBuffer::Float(8).view_table(),
            ViewTable::PixelFloatConstants
        );
        assert_eq!(ConstantBuffer::System.view_table(), ViewTable::CommonConstants);
    }

    #[test]
    fn system_constants_are_64_bytes() {
        assert_eq!(std::mem::size_of::<SystemConstants>(), 64);
    }

    #[test]
    fn window_space_vertices_get_ndc_scale() {
        let mut regs = RegisterFile::new();
        regs.set(RB_COLOR_MASK, 0x00F);
        let constants = SystemConstants::from_regs(&regs, Endian::Swap8In32, 1280, 720);
        assert_eq!(constants.ndc_scale, [2.0 / 1280.0, -2.0 / 720.0, 1.0]);
        assert_eq!(constants.vertex_index_endian, 2);
        assert_eq!(constants.color_output_map, [0, u32::MAX, u32::MAX, u32::MAX]);
    }

    #[test]
    fn fetch_writes_dirty_samplers() {
        let mut state = BindingState::new();
        state.sampler_dirty = 0;
        state.constant_written(ConstantBuffer::Float(3));
        assert_eq!(state.sampler_dirty, 0);
        state.constant_written(ConstantBuffer::Fetch);
        assert_eq!(state.sampler_dirty, u8::MAX);
        assert!(!state.constant_buffers[ConstantBuffer::Fetch.index()].up_to_date);
    }
}
