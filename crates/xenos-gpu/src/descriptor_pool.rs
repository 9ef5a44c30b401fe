//! Per-frame ring allocation of shader-visible descriptors.

use crate::backend::{
    BackendError, CpuDescriptorHandle, DescriptorHeapId, DescriptorHeapKind, GpuBackend,
    GpuDescriptorHandle,
};
use crate::ring::SegmentedRing;

/// A contiguous descriptor range handed out by [`DescriptorHeapPool::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorAllocation {
    /// Generation of the full table this allocation belongs to. Pass it back
    /// as `previous_full_update` on the next request.
    pub full_update: u64,
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
    /// Whether the caller must write every descriptor of its table.
    pub is_full: bool,
}

/// One shader-visible heap split into a segment per frame slot.
///
/// Descriptors written in a frame stay valid until the slot is reopened, so
/// a table written by a full update can be extended by later partial updates
/// for as long as the generation is unchanged.
#[derive(Debug)]
pub struct DescriptorHeapPool {
    kind: DescriptorHeapKind,
    heap: DescriptorHeapId,
    ring: SegmentedRing,
    generation: u64,
}

impl DescriptorHeapPool {
    pub fn new<B: GpuBackend + ?Sized>(
        backend: &mut B,
        kind: DescriptorHeapKind,
        per_frame_capacity: u32,
        frames_in_flight: usize,
    ) -> Result<Self, BackendError> {
        let ring = SegmentedRing::new(frames_in_flight, u64::from(per_frame_capacity));
        let heap = backend.create_descriptor_heap(kind, ring.total_len() as u32)?;
        Ok(Self {
            kind,
            heap,
            ring,
            generation: 0,
        })
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn heap(&self) -> DescriptorHeapId {
        self.heap
    }

    /// Current full-update generation. Zero means no full update yet.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn used_in_frame(&self) -> u64 {
        self.ring.used()
    }

    /// Rewinds the segment of `slot`. Every table from earlier frames becomes
    /// unusable, so the generation advances.
    pub fn begin_frame(&mut self, slot: usize) {
        self.ring.begin_segment(slot);
        self.generation += 1;
    }

    /// Allocates `count_for_partial` descriptors when `previous_full_update`
    /// is the current generation, otherwise `count_for_full` descriptors as a
    /// new full table.
    ///
    /// # Panics
    ///
    /// If the frame's segment cannot hold the request. Heaps are sized for the
    /// worst case at startup.
    pub fn request(
        &mut self,
        previous_full_update: u64,
        count_for_partial: u32,
        count_for_full: u32,
    ) -> DescriptorAllocation {
        let is_full = previous_full_update == 0 || previous_full_update != self.generation;
        let count = if is_full {
            count_for_full
        } else {
            count_for_partial
        };

        let index = if count == 0 {
            self.ring.cursor()
        } else {
            self.ring.alloc(u64::from(count), 1).unwrap_or_else(|| {
                panic!(
                    "{:?} descriptor heap exhausted: requested {count}, {} of {} left this frame",
                    self.kind,
                    self.ring.remaining(),
                    self.ring.segment_len()
                )
            })
        } as u32;

        if is_full {
            self.generation += 1;
        }
        DescriptorAllocation {
            full_update: self.generation,
            cpu: CpuDescriptorHandle {
                heap: self.heap,
                index,
            },
            gpu: GpuDescriptorHandle {
                heap: self.heap,
                index,
            },
            is_full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;

    fn pool(per_frame: u32) -> DescriptorHeapPool {
        let mut backend = NullBackend::default();
        DescriptorHeapPool::new(&mut backend, DescriptorHeapKind::View, per_frame, 3).unwrap()
    }

    #[test]
    fn matching_generation_allows_partial_update() {
        let mut pool = pool(64);
        pool.begin_frame(0);

        let full = pool.request(0, 2, 10);
        assert!(full.is_full);
        assert_eq!(full.cpu.index, 0);

        let partial = pool.request(full.full_update, 2, 10);
        assert!(!partial.is_full);
        assert_eq!(partial.full_update, full.full_update);
        assert_eq!(partial.cpu.index, 10);
        assert_eq!(pool.used_in_frame(), 12);
    }

    #[test]
    fn stale_generation_forces_full_update() {
        let mut pool = pool(64);
        pool.begin_frame(0);
        let first = pool.request(0, 1, 4);

        let stale = first.full_update - 1;
        let next = pool.request(stale, 1, 4);
        assert!(next.is_full);
        assert!(next.full_update > first.full_update);
        assert_eq!(pool.used_in_frame(), 8);
    }

    #[test]
    fn new_frame_invalidates_tables_of_the_previous_one() {
        let mut pool = pool(16);
        pool.begin_frame(0);
        let a = pool.request(0, 1, 4);
        pool.begin_frame(1);
        let b = pool.request(a.full_update, 1, 4);
        assert!(b.is_full);
        assert_eq!(b.cpu.index, 16);
    }

    #[test]
    fn empty_partial_update_allocates_nothing() {
        let mut pool = pool(16);
        pool.begin_frame(2);
        let a = pool.request(0, 0, 3);
        let b = pool.request(a.full_update, 0, 3);
        assert!(!b.is_full);
        assert_eq!(pool.used_in_frame(), 3);
    }

    #[test]
    #[should_panic(expected = "descriptor heap exhausted")]
    fn overflow_is_fatal() {
        let mut pool = pool(8);
        pool.begin_frame(0);
        let a = pool.request(0, 0, 6);
        pool.request(a.full_update, 3, 6);
    }
}
