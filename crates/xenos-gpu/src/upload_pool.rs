//! Paged CPU-to-GPU upload memory: constant buffers and shared memory
//! staging.
//!
//! Pages are written by the CPU through the backend and read by the GPU in
//! the frame that wrote them. A page becomes writable again once that frame
//! has retired.

use std::collections::VecDeque;

use tracing::trace;

use crate::backend::{BufferDesc, GpuBackend, MemoryHeap, ResourceId, ResourceState};
use crate::error::GpuError;
use crate::ring::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    pub buffer: ResourceId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Page {
    buffer: ResourceId,
    last_frame: u64,
}

#[derive(Debug)]
pub struct UploadBufferPool {
    label: &'static str,
    page_size: u64,
    writable: Option<Page>,
    cursor: u64,
    sent: VecDeque<Page>,
    free: Vec<Page>,
    pages_created: usize,
}

impl UploadBufferPool {
    pub fn new(label: &'static str, page_size: u64) -> Self {
        Self {
            label,
            page_size,
            writable: None,
            cursor: 0,
            sent: VecDeque::new(),
            free: Vec::new(),
            pages_created: 0,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn pages_created(&self) -> usize {
        self.pages_created
    }

    /// Pages waiting for their frame to retire.
    pub fn pages_in_flight(&self) -> usize {
        self.sent.len()
    }

    /// Recycles every page whose frame is at or below `completed_frame`.
    pub fn begin_frame(&mut self, completed_frame: u64) {
        while self
            .sent
            .front()
            .is_some_and(|page| page.last_frame <= completed_frame)
        {
            if let Some(page) = self.sent.pop_front() {
                self.free.push(page);
            }
        }
    }

    /// Stops writing to the current page; it is handed back after `frame`.
    pub fn end_frame(&mut self, frame: u64) {
        if let Some(mut page) = self.writable.take() {
            page.last_frame = frame;
            self.sent.push_back(page);
        }
        self.cursor = 0;
    }

    fn next_page<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        frame: u64,
    ) -> Result<(), GpuError> {
        if let Some(mut page) = self.writable.take() {
            page.last_frame = frame;
            self.sent.push_back(page);
        }
        let page = match self.free.pop() {
            Some(page) => page,
            None => {
                let buffer = backend.create_buffer(&BufferDesc {
                    label: self.label,
                    size: self.page_size,
                    heap: MemoryHeap::Upload,
                    initial_state: ResourceState::GENERIC_READ,
                    unordered_access: false,
                })?;
                self.pages_created += 1;
                trace!(pool = self.label, pages = self.pages_created, "new upload page");
                Page {
                    buffer,
                    last_frame: frame,
                }
            }
        };
        self.writable = Some(page);
        self.cursor = 0;
        Ok(())
    }

    /// Allocates exactly `size` bytes in one piece.
    pub fn request_full<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        frame: u64,
        size: u64,
        alignment: u64,
    ) -> Result<UploadAllocation, GpuError> {
        if size > self.page_size {
            return Err(GpuError::UploadTooLarge {
                requested: size,
                page_size: self.page_size,
            });
        }
        let mut offset = align_up(self.cursor, alignment.max(1));
        if self.writable.is_none() || offset + size > self.page_size {
            self.next_page(backend, frame)?;
            offset = 0;
        }
        self.cursor = offset + size;
        Ok(UploadAllocation {
            buffer: self.writable_buffer(),
            offset,
            size,
        })
    }

    /// Allocates up to `size` bytes; may return less when the current page is
    /// nearly full. Callers loop until their data is consumed.
    pub fn request_partial<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        frame: u64,
        size: u64,
        alignment: u64,
    ) -> Result<UploadAllocation, GpuError> {
        let alignment = alignment.max(1);
        let mut offset = align_up(self.cursor, alignment);
        if self.writable.is_none() || offset + alignment.min(size) > self.page_size {
            self.next_page(backend, frame)?;
            offset = 0;
        }
        let size = size.min(self.page_size - offset);
        self.cursor = offset + size;
        Ok(UploadAllocation {
            buffer: self.writable_buffer(),
            offset,
            size,
        })
    }

    fn writable_buffer(&self) -> ResourceId {
        match self.writable {
            Some(page) => page.buffer,
            None => unreachable!("upload pool has no writable page after next_page"),
        }
    }

    /// Destroys every page. The GPU must be idle.
    pub fn clear<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        let pages = self
            .writable
            .take()
            .into_iter()
            .chain(self.sent.drain(..))
            .chain(self.free.drain(..));
        for page in pages {
            backend.destroy_resource(page.buffer);
        }
        self.cursor = 0;
        self.pages_created = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;

    #[test]
    fn allocations_are_aligned_and_spill_to_new_pages() {
        let mut backend = NullBackend::default();
        let mut pool = UploadBufferPool::new("test", 1024);

        let a = pool.request_full(&mut backend, 1, 100, 256).unwrap();
        let b = pool.request_full(&mut backend, 1, 100, 256).unwrap();
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);

        let c = pool.request_full(&mut backend, 1, 900, 256).unwrap();
        assert_ne!(c.buffer, a.buffer);
        assert_eq!(c.offset, 0);
        assert_eq!(pool.pages_created(), 2);
    }

    #[test]
    fn pages_recycle_only_after_their_frame_retires() {
        let mut backend = NullBackend::default();
        let mut pool = UploadBufferPool::new("test", 512);

        let a = pool.request_full(&mut backend, 1, 64, 1).unwrap();
        pool.end_frame(1);

        pool.begin_frame(0);
        let b = pool.request_full(&mut backend, 2, 64, 1).unwrap();
        assert_ne!(a.buffer, b.buffer);
        pool.end_frame(2);

        pool.begin_frame(1);
        let c = pool.request_full(&mut backend, 3, 64, 1).unwrap();
        assert_eq!(c.buffer, a.buffer);
        assert_eq!(pool.pages_created(), 2);
    }

    #[test]
    fn partial_requests_split_large_uploads() {
        let mut backend = NullBackend::default();
        let mut pool = UploadBufferPool::new("test", 4096);
        pool.request_full(&mut backend, 1, 4000, 1).unwrap();

        let mut remaining = 6000;
        let mut pieces = Vec::new();
        while remaining > 0 {
            let alloc = pool.request_partial(&mut backend, 1, remaining, 4).unwrap();
            remaining -= alloc.size;
            pieces.push(alloc.size);
        }
        assert_eq!(pieces, vec![96, 4096, 1808]);
    }

    #[test]
    fn oversized_full_request_is_an_error() {
        let mut backend = NullBackend::default();
        let mut pool = UploadBufferPool::new("test", 256);
        assert!(matches!(
            pool.request_full(&mut backend, 1, 257, 1),
            Err(GpuError::UploadTooLarge { .. })
        ));
    }
}
