//! Frame lifecycle and guest-facing entry points.
//!
//! The processor runs on one thread and owns every cache and pool. Guest
//! register writes land in a shadow register file and only set dirty flags;
//! draws and copies turn the accumulated state into host commands.
//!
//! Frames are numbered from 1 and frame `n` signals fence `n` on submission.
//! Frame `n` records into slot `(n - 1) % F`, so opening it first waits for
//! frame `n - F`, the previous user of that slot, to retire.

mod bindings;
mod draw;
mod fixed_function;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{
    DescriptorHeapKind, GpuBackend, PipelineId, PresentRequest, ResourceId, ResourceState,
    RootSignatureId,
};
use crate::cmd::{CommandList, HostCmd, PrimitiveTopology};
use crate::config::CommandProcessorConfig;
use crate::deferred::{DeferredDeletionQueue, DeferredObject};
use crate::descriptor_pool::{DescriptorAllocation, DescriptorHeapPool};
use crate::error::GpuError;
use crate::guest_memory::GuestMemory;
use crate::pipeline_cache::PipelineCache;
use crate::registers::RegisterFile;
use crate::render_target_cache::RenderTargetCache;
use crate::root_signature::{root_extra_parameter_indices, RootSignatureCache};
use crate::scratch::ScratchBuffer;
use crate::shader::{ShaderId, ShaderTranslator};
use crate::shared_memory::{SharedMemory, SharedMemoryWatch};
use crate::stats::GpuStats;
use crate::texture_cache::TextureCache;
use crate::trace::{FrameTrace, FrameTraceRecorder, TraceEvent};
use crate::upload_pool::UploadBufferPool;
use crate::xenos::ShaderType;

use bindings::{BindingState, ConstantBuffer, SystemConstants};
use fixed_function::FixedFunctionState;

pub use draw::IndexBufferInfo;

/// Requests a cache clear from any thread. The processor acts on it at the
/// next swap, once the frame has been submitted.
#[derive(Debug, Clone, Default)]
pub struct CacheClearHandle(Arc<AtomicBool>);

impl CacheClearHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
struct FrameSlot {
    /// Shared memory uploads. Submitted ahead of `draw` when not empty.
    setup: CommandList,
    draw: CommandList,
}

pub struct CommandProcessor<B: GpuBackend> {
    config: CommandProcessorConfig,
    backend: B,
    stats: Arc<GpuStats>,
    regs: RegisterFile,

    frames: Vec<FrameSlot>,
    frame_open: bool,
    /// Slot of the open frame, or of the last one submitted.
    current_queue_frame: usize,
    /// Index of the open frame, or of the next one to open.
    frame_current: u64,
    frame_completed: u64,

    deferred: DeferredDeletionQueue,
    scratch: ScratchBuffer,
    view_pool: DescriptorHeapPool,
    sampler_pool: DescriptorHeapPool,
    constant_pool: UploadBufferPool,
    upload_pool: UploadBufferPool,
    shared_memory: SharedMemory,
    pipeline_cache: PipelineCache,
    texture_cache: TextureCache,
    render_target_cache: RenderTargetCache,
    root_signatures: RootSignatureCache,

    active_vertex_shader: Option<ShaderId>,
    active_pixel_shader: Option<ShaderId>,

    fixed_function: FixedFunctionState,
    bindings: BindingState,
    system_constants: SystemConstants,
    bound_pipeline: Option<PipelineId>,
    primitive_topology: Option<PrimitiveTopology>,
    descriptor_heaps_bound: bool,

    cache_clear: CacheClearHandle,
    trace: FrameTraceRecorder,
    /// Guest address and host source of the most recent resolve.
    last_resolve: Option<(u32, ResourceId)>,
}

impl<B: GpuBackend> std::fmt::Debug for CommandProcessor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("frame_current", &self.frame_current)
            .field("frame_completed", &self.frame_completed)
            .field("frame_open", &self.frame_open)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend> CommandProcessor<B> {
    /// Creates the processor and the long-lived host objects: descriptor
    /// heaps and the shared memory buffer.
    pub fn new(
        mut backend: B,
        memory: Arc<dyn GuestMemory>,
        config: CommandProcessorConfig,
        translator: Box<dyn ShaderTranslator>,
    ) -> Result<Self, GpuError> {
        assert!(config.frames_in_flight > 0, "at least one frame must be in flight");
        let frames_in_flight = config.frames_in_flight;

        let view_pool = DescriptorHeapPool::new(
            &mut backend,
            DescriptorHeapKind::View,
            config.view_descriptors_per_frame,
            frames_in_flight,
        )?;
        let sampler_pool = DescriptorHeapPool::new(
            &mut backend,
            DescriptorHeapKind::Sampler,
            config.sampler_descriptors_per_frame,
            frames_in_flight,
        )?;
        let shared_memory = SharedMemory::new(&mut backend, memory, config.shared_memory_size)?;

        let frames = (0..frames_in_flight)
            .map(|_| FrameSlot {
                setup: CommandList::new("xenos setup"),
                draw: CommandList::new("xenos draw"),
            })
            .collect();

        debug!(
            backend = ?backend.kind(),
            frames_in_flight,
            shared_memory = shared_memory.size(),
            "command processor created"
        );

        Ok(Self {
            config,
            backend,
            stats: Arc::new(GpuStats::new()),
            regs: RegisterFile::new(),
            frames,
            frame_open: false,
            current_queue_frame: frames_in_flight - 1,
            frame_current: 1,
            frame_completed: 0,
            deferred: DeferredDeletionQueue::new(frames_in_flight),
            scratch: ScratchBuffer::new(config.scratch_increment),
            view_pool,
            sampler_pool,
            constant_pool: UploadBufferPool::new("xenos constants", config.constant_page_size),
            upload_pool: UploadBufferPool::new("xenos uploads", config.upload_page_size),
            shared_memory,
            pipeline_cache: PipelineCache::new(config.pipeline_cache, translator),
            texture_cache: TextureCache::new(),
            render_target_cache: RenderTargetCache::new(),
            root_signatures: RootSignatureCache::new(),
            active_vertex_shader: None,
            active_pixel_shader: None,
            fixed_function: FixedFunctionState::new(),
            bindings: BindingState::new(),
            system_constants: SystemConstants::default(),
            bound_pipeline: None,
            primitive_topology: None,
            descriptor_heaps_bound: false,
            cache_clear: CacheClearHandle::default(),
            trace: FrameTraceRecorder::default(),
            last_resolve: None,
        })
    }

    pub fn config(&self) -> &CommandProcessorConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn stats(&self) -> Arc<GpuStats> {
        Arc::clone(&self.stats)
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn is_frame_open(&self) -> bool {
        self.frame_open
    }

    /// Index of the open frame, or of the next frame to open.
    pub fn frame_current(&self) -> u64 {
        self.frame_current
    }

    /// Highest frame known to have retired.
    pub fn frame_completed(&self) -> u64 {
        self.frame_completed
    }

    pub fn pending_deletions(&self) -> usize {
        self.deferred.len()
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipeline_cache
    }

    pub fn root_signature_count(&self) -> usize {
        self.root_signatures.len()
    }

    pub fn texture_count(&self) -> usize {
        self.texture_cache.texture_count()
    }

    pub fn render_target_count(&self) -> usize {
        self.render_target_cache.target_count()
    }

    pub fn scratch_buffer_size(&self) -> u64 {
        self.scratch.size()
    }

    pub fn shared_memory_watch(&self) -> SharedMemoryWatch {
        self.shared_memory.watch()
    }

    pub fn cache_clear_handle(&self) -> CacheClearHandle {
        self.cache_clear.clone()
    }

    /// Opens a frame if none is open. Blocks until the slot's previous frame
    /// has retired. Returns whether a frame was opened.
    pub fn begin_frame(&mut self) -> Result<bool, GpuError> {
        if self.frame_open {
            return Ok(false);
        }

        let frames_in_flight = self.config.frames_in_flight as u64;
        let slot = (self.current_queue_frame + 1) % self.frames.len();
        debug_assert_eq!(slot as u64, (self.frame_current - 1) % frames_in_flight);

        self.frame_completed = self.backend.completed_fence();
        if let Some(reuse) = self.frame_current.checked_sub(frames_in_flight) {
            if reuse > 0 && self.frame_completed < reuse {
                trace!(frame = self.frame_current, waiting_for = reuse, "frame slot busy");
                self.backend.wait_for_fence(reuse)?;
                self.stats.inc_fence_waits();
                self.frame_completed = self.backend.completed_fence();
            }
        }

        let backend = &mut self.backend;
        let released = self
            .deferred
            .release_retired(self.frame_completed, |object| object.destroy(backend));
        self.stats.add_deferred_released(released as u64);

        self.constant_pool.begin_frame(self.frame_completed);
        self.upload_pool.begin_frame(self.frame_completed);
        self.view_pool.begin_frame(slot);
        self.sampler_pool.begin_frame(slot);

        for range in self.shared_memory.apply_watches() {
            let start = u32::try_from(range.start).unwrap_or(u32::MAX);
            let len = u32::try_from(range.end - range.start).unwrap_or(u32::MAX);
            self.texture_cache.invalidate_range(start, len);
        }

        let frame = &mut self.frames[slot];
        frame.setup.reset();
        frame.draw.reset();

        self.pipeline_cache.reset_current();
        self.render_target_cache.invalidate_bindings();
        self.fixed_function.invalidate();
        self.bindings.invalidate();
        self.bound_pipeline = None;
        self.primitive_topology = None;
        self.descriptor_heaps_bound = false;

        self.current_queue_frame = slot;
        self.frame_open = true;
        self.trace.begin_frame(self.frame_current);
        debug!(
            frame = self.frame_current,
            slot,
            completed = self.frame_completed,
            released,
            "begin frame"
        );
        Ok(true)
    }

    /// Submits the open frame. Returns false if no frame was open.
    pub fn end_frame(&mut self) -> Result<bool, GpuError> {
        if !self.frame_open {
            return Ok(false);
        }

        let frame_index = self.frame_current;
        let frame = &mut self.frames[self.current_queue_frame];
        let uploaded = self.shared_memory.upload_pending(
            &mut self.backend,
            &mut self.upload_pool,
            frame_index,
            &mut frame.setup,
        )?;
        self.stats.add_shared_memory_bytes_uploaded(uploaded);
        self.shared_memory.end_frame(&mut frame.draw);

        let lists: Vec<&CommandList> = if frame.setup.is_empty() {
            vec![&frame.draw]
        } else {
            vec![&frame.setup, &frame.draw]
        };
        self.backend.submit(&lists, frame_index)?;
        self.trace.end_frame(lists.iter().copied());

        self.constant_pool.end_frame(frame_index);
        self.upload_pool.end_frame(frame_index);
        self.stats.inc_frames_submitted();
        debug!(
            frame = frame_index,
            commands = frame.draw.len(),
            uploaded,
            "end frame"
        );

        self.frame_open = false;
        self.frame_current += 1;
        Ok(true)
    }

    /// Updates the shadow register file and marks dependent state dirty.
    ///
    /// # Panics
    ///
    /// If `index` is outside the register file.
    pub fn write_register(&mut self, index: u32, value: u32) {
        let changed = self.regs.set(index, value);
        self.trace.record(TraceEvent::RegisterWrite { index, value });
        if !changed {
            return;
        }
        if let Some(buffer) = ConstantBuffer::for_register(index) {
            if buffer == ConstantBuffer::Fetch {
                let offset = index - crate::registers::SHADER_CONSTANT_FETCH_00_0;
                self.texture_cache.fetch_constant_written(offset / 6);
            }
            self.bindings.constant_written(buffer);
            return;
        }
        self.fixed_function.register_written(index);
    }

    /// Registers guest microcode. Identical microcode yields the same handle.
    pub fn load_shader(
        &mut self,
        shader_type: ShaderType,
        guest_address: u32,
        microcode: &[u32],
    ) -> ShaderId {
        self.pipeline_cache
            .load_shader(shader_type, guest_address, microcode)
    }

    /// Selects the shaders used by subsequent draws.
    ///
    /// # Panics
    ///
    /// If a handle names a shader of the wrong stage.
    pub fn set_active_shaders(&mut self, vertex: Option<ShaderId>, pixel: Option<ShaderId>) {
        for (id, expected) in [(vertex, ShaderType::Vertex), (pixel, ShaderType::Pixel)] {
            if let Some(id) = id {
                let actual = self.pipeline_cache.shader(id).shader_type();
                assert_eq!(actual, expected, "{id:?} bound to the wrong stage");
            }
        }
        self.active_vertex_shader = vertex;
        self.active_pixel_shader = pixel;
    }

    pub fn active_shaders(&self) -> (Option<ShaderId>, Option<ShaderId>) {
        (self.active_vertex_shader, self.active_pixel_shader)
    }

    /// The draw command list of the open frame.
    pub fn get_current_command_list(&mut self) -> Option<&mut CommandList> {
        if self.frame_open {
            Some(&mut self.frames[self.current_queue_frame].draw)
        } else {
            None
        }
    }

    fn draw_list(&mut self) -> &mut CommandList {
        debug_assert!(self.frame_open, "recording outside of a frame");
        &mut self.frames[self.current_queue_frame].draw
    }

    /// Binds `pipeline` on the current command list unless already bound.
    pub fn set_pipeline(&mut self, pipeline: PipelineId) {
        if self.bound_pipeline != Some(pipeline) {
            self.draw_list().push(HostCmd::SetPipeline(pipeline));
            self.bound_pipeline = Some(pipeline);
        }
    }

    /// The root signature for a shader pair, created on first use. Shaders
    /// are translated if they have not been yet.
    pub fn get_root_signature(
        &mut self,
        vertex_shader: ShaderId,
        pixel_shader: Option<ShaderId>,
    ) -> Result<RootSignatureId, GpuError> {
        let (vs, _) = self.translate(vertex_shader)?;
        let ps = match pixel_shader {
            Some(id) => Some(self.translate(id)?.0),
            None => None,
        };
        let (indices, _) = root_extra_parameter_indices(&vs, ps.as_deref());
        let (id, created) = self
            .root_signatures
            .get_or_create(&mut self.backend, &indices)?;
        if created {
            self.stats.inc_root_signatures_created();
        }
        Ok(id)
    }

    fn translate(
        &mut self,
        id: ShaderId,
    ) -> Result<(Arc<crate::shader::TranslatedShader>, bool), GpuError> {
        let (shader, fresh) = self.pipeline_cache.translated_shader(id)?;
        if fresh {
            self.stats.inc_shader_translations();
        }
        Ok((shader, fresh))
    }

    fn bind_descriptor_heaps(&mut self) {
        if !self.descriptor_heaps_bound {
            let cmd = HostCmd::SetDescriptorHeaps {
                view: self.view_pool.heap(),
                sampler: self.sampler_pool.heap(),
            };
            self.draw_list().push(cmd);
            self.descriptor_heaps_bound = true;
        }
    }

    /// Allocates view descriptors in the open frame; see
    /// [`DescriptorHeapPool::request`].
    pub fn request_view_descriptors(
        &mut self,
        previous_full_update: u64,
        count_for_partial: u32,
        count_for_full: u32,
    ) -> DescriptorAllocation {
        self.bind_descriptor_heaps();
        let alloc = self
            .view_pool
            .request(previous_full_update, count_for_partial, count_for_full);
        if alloc.is_full {
            self.stats.inc_view_full_updates();
        } else {
            self.stats.inc_view_partial_updates();
        }
        alloc
    }

    /// Allocates sampler descriptors in the open frame; see
    /// [`DescriptorHeapPool::request`].
    pub fn request_sampler_descriptors(
        &mut self,
        previous_full_update: u64,
        count_for_partial: u32,
        count_for_full: u32,
    ) -> DescriptorAllocation {
        self.bind_descriptor_heaps();
        let alloc =
            self.sampler_pool
                .request(previous_full_update, count_for_partial, count_for_full);
        if alloc.is_full {
            self.stats.inc_sampler_full_updates();
        } else {
            self.stats.inc_sampler_partial_updates();
        }
        alloc
    }

    /// Takes the scratch buffer, growing it to at least `size` bytes. Any
    /// barrier needed to reach `state` is recorded on the current list.
    ///
    /// # Panics
    ///
    /// If the scratch buffer is already held.
    pub fn request_scratch_gpu_buffer(
        &mut self,
        size: u64,
        state: ResourceState,
    ) -> Result<ResourceId, GpuError> {
        let acquired = self.scratch.acquire(
            &mut self.backend,
            &mut self.deferred,
            self.frame_current,
            size,
            state,
        )?;
        if let Some((before, after)) = acquired.transition {
            if self.frame_open {
                self.draw_list().push(HostCmd::ResourceBarrier {
                    resource: acquired.buffer,
                    before,
                    after,
                });
            }
        }
        Ok(acquired.buffer)
    }

    pub fn release_scratch_gpu_buffer(&mut self, buffer: ResourceId, new_state: ResourceState) {
        self.scratch.release(buffer, new_state);
    }

    /// Ends the guest frame and presents `frontbuffer`. A pending cache clear
    /// is carried out afterwards, with the GPU idle.
    pub fn perform_swap(
        &mut self,
        frontbuffer: u32,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        self.begin_frame()?;
        self.trace.record(TraceEvent::Swap {
            frontbuffer,
            width,
            height,
        });
        self.end_frame()?;

        let source = self
            .last_resolve
            .filter(|&(address, _)| address == frontbuffer)
            .map(|(_, resource)| resource);
        self.backend.present(&PresentRequest {
            frontbuffer,
            width,
            height,
            source,
        })?;
        self.stats.inc_swaps();

        if self.cache_clear.take() {
            self.clear_caches_now()?;
        }
        Ok(())
    }

    /// Schedules dropping every cached pipeline, root signature, texture and
    /// render target at the next swap.
    pub fn clear_caches(&mut self) {
        self.cache_clear.request();
    }

    /// Blocks until every submitted frame has retired.
    fn wait_idle(&mut self) -> Result<(), GpuError> {
        let last_submitted = self.frame_current - 1;
        if last_submitted > 0 && self.backend.completed_fence() < last_submitted {
            self.backend.wait_for_fence(last_submitted)?;
            self.stats.inc_fence_waits();
        }
        self.frame_completed = self.backend.completed_fence();
        Ok(())
    }

    fn clear_caches_now(&mut self) -> Result<(), GpuError> {
        debug_assert!(!self.frame_open);
        self.wait_idle()?;

        self.pipeline_cache.clear(&mut self.backend);
        self.root_signatures.clear(&mut self.backend);
        self.texture_cache
            .clear(&mut self.deferred, self.frame_current);
        self.render_target_cache
            .clear(&mut self.deferred, self.frame_current);

        let backend = &mut self.backend;
        let released = self.deferred.flush(|object| object.destroy(backend));
        self.stats.add_deferred_released(released as u64);

        self.bindings.invalidate();
        self.bound_pipeline = None;
        self.last_resolve = None;
        self.stats.inc_cache_clears();
        debug!(released, "caches cleared");
        Ok(())
    }

    /// Submits any open frame, waits for the GPU and frees every host object
    /// the processor created.
    pub fn shutdown(&mut self) -> Result<(), GpuError> {
        self.end_frame()?;
        self.clear_caches_now()?;
        if let Some(buffer) = self.scratch.take() {
            self.backend.destroy_resource(buffer);
        }
        self.constant_pool.clear(&mut self.backend);
        self.upload_pool.clear(&mut self.backend);
        debug!(frames = self.frame_current - 1, "command processor shut down");
        Ok(())
    }

    /// Captures the next complete frame.
    pub fn request_frame_trace(&mut self) {
        self.trace.request();
    }

    pub fn take_frame_trace(&mut self) -> Option<FrameTrace> {
        self.trace.take()
    }

    fn defer_destroy(&mut self, object: DeferredObject) {
        self.deferred.push(object, self.frame_current);
    }
}
