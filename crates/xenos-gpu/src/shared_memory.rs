//! Guest physical memory mirrored in one large host buffer.
//!
//! Pages are uploaded lazily: draws request the ranges they read, and the
//! pages that are not in sync are copied at the end of the frame through the
//! upload pool. CPU writes reported through [`SharedMemoryWatch`] put pages
//! back out of sync.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::backend::{
    BackendError, BufferDesc, GpuBackend, MemoryHeap, ResourceId, ResourceState,
};
use crate::cmd::{CommandList, HostCmd};
use crate::error::GpuError;
use crate::guest_memory::GuestMemory;
use crate::upload_pool::UploadBufferPool;

pub const PAGE_SIZE_LOG2: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SIZE_LOG2;

pub const READ_STATE: ResourceState = ResourceState::INDEX_BUFFER
    .union(ResourceState::NON_PIXEL_SHADER_RESOURCE)
    .union(ResourceState::PIXEL_SHADER_RESOURCE)
    .union(ResourceState::COPY_SOURCE);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PageBitmap(Vec<u64>);

impl PageBitmap {
    fn new(pages: usize) -> Self {
        Self(vec![0; pages.div_ceil(64)])
    }

    fn get(&self, page: usize) -> bool {
        self.0[page / 64] & (1 << (page % 64)) != 0
    }

    fn set_range(&mut self, pages: Range<usize>, value: bool) {
        for page in pages {
            let word = &mut self.0[page / 64];
            if value {
                *word |= 1 << (page % 64);
            } else {
                *word &= !(1 << (page % 64));
            }
        }
    }

    fn clear_all(&mut self) {
        self.0.fill(0);
    }

    fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Maximal runs of set pages.
    fn runs(&self, page_count: usize) -> Vec<Range<usize>> {
        let mut runs = Vec::new();
        let mut start = None;
        for page in 0..page_count {
            match (self.get(page), start) {
                (true, None) => start = Some(page),
                (false, Some(s)) => {
                    runs.push(s..page);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push(s..page_count);
        }
        runs
    }
}

fn page_range(start: u64, len: u64) -> Range<usize> {
    let first = start >> PAGE_SIZE_LOG2;
    let last = (start + len.max(1) - 1) >> PAGE_SIZE_LOG2;
    first as usize..last as usize + 1
}

/// Cloneable handle for reporting CPU writes from other threads.
#[derive(Debug, Clone)]
pub struct SharedMemoryWatch {
    triggered: Arc<Mutex<PageBitmap>>,
    size: u64,
}

impl SharedMemoryWatch {
    /// Records that the CPU wrote guest range `[start, start + len)`.
    pub fn notify_cpu_write(&self, start: u64, len: u64) {
        if len == 0 || start >= self.size {
            return;
        }
        let len = len.min(self.size - start);
        let mut triggered = self.triggered.lock().unwrap_or_else(|e| e.into_inner());
        triggered.set_range(page_range(start, len), true);
    }
}

pub struct SharedMemory {
    memory: Arc<dyn GuestMemory>,
    buffer: ResourceId,
    size: u64,
    page_count: usize,
    in_sync: PageBitmap,
    upload_pending: PageBitmap,
    watch: SharedMemoryWatch,
    state: ResourceState,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("state", &self.state)
            .finish()
    }
}

impl SharedMemory {
    pub fn new<B: GpuBackend + ?Sized>(
        backend: &mut B,
        memory: Arc<dyn GuestMemory>,
        size: u64,
    ) -> Result<Self, BackendError> {
        let size = size.min(memory.size());
        let buffer = backend.create_buffer(&BufferDesc {
            label: "xenos shared memory",
            size,
            heap: MemoryHeap::Default,
            initial_state: ResourceState::COPY_DEST,
            unordered_access: true,
        })?;
        let page_count = size.div_ceil(PAGE_SIZE) as usize;
        Ok(Self {
            memory,
            buffer,
            size,
            page_count,
            in_sync: PageBitmap::new(page_count),
            upload_pending: PageBitmap::new(page_count),
            watch: SharedMemoryWatch {
                triggered: Arc::new(Mutex::new(PageBitmap::new(page_count))),
                size,
            },
            state: ResourceState::COPY_DEST,
        })
    }

    pub fn buffer(&self) -> ResourceId {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn watch(&self) -> SharedMemoryWatch {
        self.watch.clone()
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn has_pending_uploads(&self) -> bool {
        !self.upload_pending.is_empty()
    }

    pub fn covers(&self, start: u64, len: u64) -> bool {
        start.checked_add(len).is_some_and(|end| end <= self.size)
    }

    /// Makes `[start, start + len)` valid for GPU reads in the current frame.
    /// Returns false if the range is outside guest memory.
    pub fn request_range(&mut self, start: u64, len: u64) -> bool {
        if !self.covers(start, len) {
            return false;
        }
        if len == 0 {
            return true;
        }
        for page in page_range(start, len) {
            if !self.in_sync.get(page) {
                self.upload_pending.set_range(page..page + 1, true);
            }
        }
        true
    }

    /// Applies CPU writes reported since the last call. Returns the guest
    /// byte ranges that changed so dependent caches can invalidate.
    pub fn apply_watches(&mut self) -> Vec<Range<u64>> {
        let mut triggered = self.watch.triggered.lock().unwrap_or_else(|e| e.into_inner());
        if triggered.is_empty() {
            return Vec::new();
        }
        let runs = triggered.runs(self.page_count);
        triggered.clear_all();
        drop(triggered);
        for run in &runs {
            self.in_sync.set_range(run.clone(), false);
        }
        runs.into_iter()
            .map(|r| (r.start as u64) << PAGE_SIZE_LOG2..(r.end as u64) << PAGE_SIZE_LOG2)
            .collect()
    }

    /// Records the GPU writing `[start, start + len)`, e.g. a resolve. The
    /// buffer now holds the newest data, so the pages must not be uploaded
    /// over it.
    pub fn mark_range_gpu_written(&mut self, start: u64, len: u64) {
        if len == 0 || !self.covers(start, len) {
            return;
        }
        let pages = page_range(start, len);
        self.in_sync.set_range(pages.clone(), true);
        self.upload_pending.set_range(pages, false);
    }

    fn transition(&mut self, list: &mut CommandList, state: ResourceState) {
        if self.state != state {
            list.push(HostCmd::ResourceBarrier {
                resource: self.buffer,
                before: self.state,
                after: state,
            });
            self.state = state;
        }
    }

    pub fn use_for_reading(&mut self, list: &mut CommandList) {
        self.transition(list, READ_STATE);
    }

    pub fn use_for_writing(&mut self, list: &mut CommandList) {
        self.transition(list, ResourceState::COPY_DEST);
    }

    /// Records uploads of every pending page into `setup`, which executes
    /// before the frame's draw list. Returns the number of bytes uploaded.
    pub fn upload_pending<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        pool: &mut UploadBufferPool,
        frame: u64,
        setup: &mut CommandList,
    ) -> Result<u64, GpuError> {
        let mut uploaded = 0;
        let mut staging = Vec::new();
        for run in self.upload_pending.runs(self.page_count) {
            let start = (run.start as u64) << PAGE_SIZE_LOG2;
            let end = ((run.end as u64) << PAGE_SIZE_LOG2).min(self.size);
            let mut cursor = start;
            while cursor < end {
                let alloc = pool.request_partial(backend, frame, end - cursor, PAGE_SIZE)?;
                staging.resize(alloc.size as usize, 0);
                self.memory.read(cursor, &mut staging)?;
                backend.write_buffer(alloc.buffer, alloc.offset, &staging)?;
                setup.push(HostCmd::CopyBufferRegion {
                    dst: self.buffer,
                    dst_offset: cursor,
                    src: alloc.buffer,
                    src_offset: alloc.offset,
                    size: alloc.size,
                });
                cursor += alloc.size;
            }
            uploaded += end - start;
            self.in_sync.set_range(run.clone(), true);
            self.upload_pending.set_range(run, false);
        }
        if uploaded != 0 {
            trace!(bytes = uploaded, "shared memory upload");
        }
        Ok(uploaded)
    }

    /// Leaves the buffer in the copy destination state the next frame's
    /// setup list expects.
    pub fn end_frame(&mut self, draw: &mut CommandList) {
        self.use_for_writing(draw);
    }
}
