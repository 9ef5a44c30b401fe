//! Draw and resolve recording.

use tracing::{debug, trace};

use crate::backend::{GpuBackend, ResourceState};
use crate::cmd::{HostCmd, IndexFormat};
use crate::deferred::DeferredObject;
use crate::error::GpuError;
use crate::registers::*;
use crate::root_signature::root_extra_parameter_indices;
use crate::texture_cache::{TextureLoad, SHADER_RESOURCE_STATE};
use crate::trace::TraceEvent;
use crate::xenos::{Endian, ModeControl, PrimitiveType, SurfaceInfo, VertexFetch};

use super::CommandProcessor;

/// Guest index buffer of an indexed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferInfo {
    pub guest_base: u32,
    pub endian: Endian,
    pub format: IndexFormat,
    pub count: u32,
    /// Size in bytes.
    pub length: u32,
}

impl<B: GpuBackend> CommandProcessor<B> {
    /// Records a draw of `index_count` vertices (or indices, with
    /// `index_buffer`) using the current register state.
    ///
    /// Returns `Ok(false)` when the guest state is not complete enough to draw,
    /// e.g. no shaders bound. Nothing is recorded in that case.
    pub fn issue_draw(
        &mut self,
        primitive_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<&IndexBufferInfo>,
    ) -> Result<bool, GpuError> {
        let drawn = self.record_draw(primitive_type, index_count, index_buffer)?;
        self.trace.record(TraceEvent::Draw {
            primitive: primitive_type,
            index_count,
            indexed: index_buffer.is_some(),
            drawn,
        });
        if drawn {
            self.stats.inc_draws();
        } else {
            self.stats.inc_draws_skipped();
        }
        Ok(drawn)
    }

    fn record_draw(
        &mut self,
        primitive_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<&IndexBufferInfo>,
    ) -> Result<bool, GpuError> {
        let mode = ModeControl::from_regs(&self.regs);
        if mode == ModeControl::Copy {
            return self.issue_copy();
        }

        let Some(vs_id) = self.active_vertex_shader else {
            debug!("draw without a vertex shader");
            return Ok(false);
        };
        let ps_id = match (mode, self.active_pixel_shader) {
            (ModeControl::Depth, _) => None,
            (_, Some(ps)) => Some(ps),
            (_, None) => {
                debug!("draw without a pixel shader");
                return Ok(false);
            }
        };

        if mode == ModeControl::Ignore || SurfaceInfo::from_regs(&self.regs).pitch == 0 {
            return Ok(true);
        }
        let Some(topology) = primitive_type.host_topology() else {
            return Ok(true);
        };
        if index_count == 0 {
            return Ok(true);
        }

        let Ok((vs, _)) = self.translate(vs_id) else {
            return Ok(false);
        };
        let ps = match ps_id {
            Some(id) => match self.translate(id) {
                Ok((ps, _)) => Some(ps),
                Err(_) => return Ok(false),
            },
            None => None,
        };

        self.begin_frame()?;

        let color_targets = ps.as_ref().map_or(0, |ps| ps.color_targets_written);
        let Some(targets) = self.render_target_cache.update_render_targets(
            &mut self.backend,
            &self.regs,
            color_targets,
        )?
        else {
            debug!("draw with unresolved render targets");
            return Ok(false);
        };
        // The cache now considers these bound, even if the draw is dropped below.
        if targets.changed {
            self.draw_list().push(HostCmd::SetRenderTargets {
                colors: targets.colors,
                depth: targets.depth,
            });
        }

        // Everything the draw reads from guest memory must be inside it.
        for &fetch in &vs.vertex_fetch_constants {
            let Some(fetch) = VertexFetch::decode(self.regs.vertex_fetch(fetch)) else {
                continue;
            };
            if !self
                .shared_memory
                .request_range(u64::from(fetch.address), u64::from(fetch.size_bytes))
            {
                debug!(
                    address = fetch.address,
                    size = fetch.size_bytes,
                    "vertex buffer outside guest memory"
                );
                return Ok(false);
            }
        }
        if let Some(ib) = index_buffer {
            if !self
                .shared_memory
                .request_range(u64::from(ib.guest_base), u64::from(ib.length))
            {
                debug!(
                    address = ib.guest_base,
                    length = ib.length,
                    "index buffer outside guest memory"
                );
                return Ok(false);
            }
        }

        let (indices, _) = root_extra_parameter_indices(&vs, ps.as_deref());
        let (root_signature, created) = self
            .root_signatures
            .get_or_create(&mut self.backend, &indices)?;
        if created {
            self.stats.inc_root_signatures_created();
        }

        let (status, pipeline, created) = self.pipeline_cache.configure_pipeline(
            &mut self.backend,
            &self.regs,
            vs_id,
            ps_id,
            root_signature,
            topology.topology_type(),
            targets.formats,
        )?;
        if created {
            self.stats.inc_pipeline_misses();
        } else {
            self.stats.inc_pipeline_hits();
        }
        for evicted in self.pipeline_cache.take_evicted() {
            self.stats.inc_pipeline_evictions();
            self.defer_destroy(DeferredObject::Pipeline(evicted));
        }
        trace!(?status, ?pipeline, "pipeline");
        self.set_pipeline(pipeline);

        if self.primitive_topology != Some(topology) {
            self.draw_list().push(HostCmd::SetPrimitiveTopology(topology));
            self.primitive_topology = Some(topology);
        }

        let list = &mut self.frames[self.current_queue_frame].draw;
        self.fixed_function
            .update(&self.regs, list, targets.width, targets.height);
        self.update_system_constants(
            index_buffer.map_or(Endian::None, |ib| ib.endian),
            targets.width,
            targets.height,
        );

        let used_fetch = vs.used_texture_fetch_mask()
            | ps.as_ref().map_or(0, |ps| ps.used_texture_fetch_mask());
        let loads = self
            .texture_cache
            .request_textures(&mut self.backend, &self.regs, used_fetch)?;
        for load in &loads {
            if !self.load_texture(load)? {
                self.texture_cache.load_skipped(load.texture);
            }
        }
        let textures_changed = self.texture_cache.take_bindings_changed();

        self.update_bindings(
            vs_id,
            ps_id,
            &vs,
            ps.as_deref(),
            root_signature,
            indices,
            textures_changed,
        )?;

        let list = &mut self.frames[self.current_queue_frame].draw;
        self.shared_memory.use_for_reading(list);
        match index_buffer {
            Some(ib) => {
                list.push(HostCmd::SetIndexBuffer {
                    buffer: self.shared_memory.buffer(),
                    offset: u64::from(ib.guest_base),
                    size: u64::from(ib.length),
                    format: ib.format,
                });
                list.push(HostCmd::DrawIndexed {
                    index_count,
                    instance_count: 1,
                });
            }
            None => list.push(HostCmd::Draw {
                vertex_count: index_count,
                instance_count: 1,
            }),
        }
        trace!(
            frame = self.frame_current,
            ?primitive_type,
            index_count,
            indexed = index_buffer.is_some(),
            "draw"
        );
        Ok(true)
    }

    /// Copies guest texture data from shared memory into its host texture,
    /// untiling through the scratch buffer when needed.
    ///
    /// Returns `false` when the data is outside guest memory. The texture is
    /// still left in the shader resource state so it can be bound.
    fn load_texture(&mut self, load: &TextureLoad) -> Result<bool, GpuError> {
        let start = u64::from(load.source_address);
        if !self.shared_memory.request_range(start, load.source_size) {
            debug!(
                address = load.source_address,
                size = load.source_size,
                "texture outside guest memory"
            );
            if load.state_before != SHADER_RESOURCE_STATE {
                self.draw_list().push(HostCmd::ResourceBarrier {
                    resource: load.texture,
                    before: load.state_before,
                    after: SHADER_RESOURCE_STATE,
                });
            }
            return Ok(false);
        }

        let shared = self.shared_memory.buffer();
        let list = &mut self.frames[self.current_queue_frame].draw;
        self.shared_memory.use_for_reading(list);
        if load.state_before != ResourceState::COPY_DEST {
            list.push(HostCmd::ResourceBarrier {
                resource: load.texture,
                before: load.state_before,
                after: ResourceState::COPY_DEST,
            });
        }

        let block = load.format.block_dim();
        let bytes_per_block = load.format.bytes_per_block();
        let width_blocks = load.width.div_ceil(block);
        let height_blocks = load.height.div_ceil(block);

        if load.tiled {
            let linear_size = u64::from(width_blocks * bytes_per_block) * u64::from(height_blocks);
            let scratch =
                self.request_scratch_gpu_buffer(linear_size, ResourceState::UNORDERED_ACCESS)?;
            let list = self.draw_list();
            list.push(HostCmd::Untile {
                src: shared,
                src_offset: start,
                dst: scratch,
                dst_offset: 0,
                bytes_per_block,
                width_blocks,
                height_blocks,
                pitch_blocks: load.pitch_blocks,
            });
            list.push(HostCmd::UavBarrier(scratch));
            list.push(HostCmd::ResourceBarrier {
                resource: scratch,
                before: ResourceState::UNORDERED_ACCESS,
                after: ResourceState::COPY_SOURCE,
            });
            list.push(HostCmd::CopyBufferToTexture {
                src: scratch,
                src_offset: 0,
                row_pitch: width_blocks * bytes_per_block,
                dst: load.texture,
                format: load.format,
                width: load.width,
                height: load.height,
            });
            self.release_scratch_gpu_buffer(scratch, ResourceState::COPY_SOURCE);
        } else {
            self.draw_list().push(HostCmd::CopyBufferToTexture {
                src: shared,
                src_offset: start,
                row_pitch: load.pitch_blocks * bytes_per_block,
                dst: load.texture,
                format: load.format,
                width: load.width,
                height: load.height,
            });
        }

        self.draw_list().push(HostCmd::ResourceBarrier {
            resource: load.texture,
            before: ResourceState::COPY_DEST,
            after: SHADER_RESOURCE_STATE,
        });
        trace!(texture = ?load.texture, tiled = load.tiled, "texture load");
        Ok(true)
    }

    /// Resolves the render target `RB_COPY_CONTROL` selects into guest
    /// memory at `RB_COPY_DEST_BASE`. Pipeline state is not touched.
    pub fn issue_copy(&mut self) -> Result<bool, GpuError> {
        let resolved = self.record_copy()?;
        self.trace.record(TraceEvent::Copy { resolved });
        if resolved {
            self.stats.inc_copies();
        }
        Ok(resolved)
    }

    fn record_copy(&mut self) -> Result<bool, GpuError> {
        let Some(source) = self.render_target_cache.resolve_source(&self.regs) else {
            debug!("resolve without a bound render target");
            return Ok(false);
        };
        let dest_base = self.regs.get(RB_COPY_DEST_BASE);
        let dest_pitch = self.regs.get(RB_COPY_DEST_PITCH);
        let width = (dest_pitch & 0x3FFF).min(source.width);
        let height = ((dest_pitch >> 16) & 0x3FFF).min(source.height);
        if width == 0 || height == 0 {
            return Ok(false);
        }
        let size = source.format.image_size(width, height);
        if !self.shared_memory.covers(u64::from(dest_base), size) {
            debug!(dest_base, size, "resolve destination outside guest memory");
            return Ok(false);
        }

        self.begin_frame()?;
        let scratch = self.request_scratch_gpu_buffer(size, ResourceState::COPY_DEST)?;
        let shared = self.shared_memory.buffer();
        let list = &mut self.frames[self.current_queue_frame].draw;
        list.push(HostCmd::ResourceBarrier {
            resource: source.resource,
            before: source.state,
            after: ResourceState::COPY_SOURCE,
        });
        list.push(HostCmd::CopyTextureToBuffer {
            src: source.resource,
            dst: scratch,
            dst_offset: 0,
            row_pitch: source.format.row_pitch(width),
            format: source.format,
            width,
            height,
        });
        list.push(HostCmd::ResourceBarrier {
            resource: source.resource,
            before: ResourceState::COPY_SOURCE,
            after: source.state,
        });
        list.push(HostCmd::ResourceBarrier {
            resource: scratch,
            before: ResourceState::COPY_DEST,
            after: ResourceState::COPY_SOURCE,
        });
        self.shared_memory.use_for_writing(list);
        list.push(HostCmd::CopyBufferRegion {
            dst: shared,
            dst_offset: u64::from(dest_base),
            src: scratch,
            src_offset: 0,
            size,
        });
        self.release_scratch_gpu_buffer(scratch, ResourceState::COPY_SOURCE);

        self.shared_memory
            .mark_range_gpu_written(u64::from(dest_base), size);
        self.texture_cache
            .invalidate_range(dest_base, u32::try_from(size).unwrap_or(u32::MAX));
        self.last_resolve = Some((dest_base, source.resource));
        trace!(dest_base, width, height, "resolve");
        Ok(true)
    }
}
