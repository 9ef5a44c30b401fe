//! Frame-epoch based deferred destruction.
//!
//! Host objects that an in-flight frame may still reference are parked here
//! together with the index of the last frame that could have used them.

use std::collections::VecDeque;

use crate::backend::{GpuBackend, PipelineId, ResourceId};

/// A host object waiting for the GPU to let go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredObject {
    Resource(ResourceId),
    Pipeline(PipelineId),
}

impl DeferredObject {
    pub fn destroy<B: GpuBackend + ?Sized>(self, backend: &mut B) {
        match self {
            Self::Resource(id) => backend.destroy_resource(id),
            Self::Pipeline(id) => backend.destroy_pipeline(id),
        }
    }
}

#[derive(Debug)]
struct PendingDeletion<T> {
    object: T,
    last_used_frame: u64,
}

/// Entries queued at frame `n` are released once frame `n + frames_in_flight`
/// has retired.
#[derive(Debug)]
pub struct DeferredDeletionQueue<T = DeferredObject> {
    pending: VecDeque<PendingDeletion<T>>,
    frames_in_flight: u64,
}

impl<T> DeferredDeletionQueue<T> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queues `object`, last referenced by frame `last_used_frame`.
    pub fn push(&mut self, object: T, last_used_frame: u64) {
        // Callers push with the current frame index, which never decreases, so
        // the queue stays sorted and only the front can mature.
        debug_assert!(self
            .pending
            .back()
            .map_or(true, |p| p.last_used_frame <= last_used_frame));
        self.pending.push_back(PendingDeletion {
            object,
            last_used_frame,
        });
    }

    /// Hands every entry that is safe to free given `completed_frame` to
    /// `free`. Returns how many were released.
    pub fn release_retired(&mut self, completed_frame: u64, mut free: impl FnMut(T)) -> usize {
        let mut released = 0;
        while let Some(front) = self.pending.front() {
            if completed_frame < front.last_used_frame + self.frames_in_flight {
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                free(entry.object);
                released += 1;
            }
        }
        released
    }

    /// Releases everything. Only valid once the GPU is idle.
    pub fn flush(&mut self, mut free: impl FnMut(T)) -> usize {
        let released = self.pending.len();
        for entry in self.pending.drain(..) {
            free(entry.object);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_survive_until_pipeline_depth_retires() {
        let mut queue = DeferredDeletionQueue::new(3);
        queue.push("a", 5);
        queue.push("b", 6);

        let mut freed = Vec::new();
        for completed in 0..8 {
            queue.release_retired(completed, |o| freed.push(o));
        }
        assert!(freed.is_empty());

        queue.release_retired(8, |o| freed.push(o));
        assert_eq!(freed, vec!["a"]);

        queue.release_retired(9, |o| freed.push(o));
        assert_eq!(freed, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn release_jumps_over_several_frames() {
        let mut queue = DeferredDeletionQueue::new(2);
        queue.push(1, 1);
        queue.push(2, 2);
        queue.push(3, 10);
        let mut freed = Vec::new();
        assert_eq!(queue.release_retired(5, |o| freed.push(o)), 2);
        assert_eq!(freed, vec![1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = DeferredDeletionQueue::new(3);
        queue.push(DeferredObject::Resource(ResourceId(7)), 100);
        let mut freed = Vec::new();
        assert_eq!(queue.flush(|o| freed.push(o)), 1);
        assert_eq!(freed, vec![DeferredObject::Resource(ResourceId(7))]);
    }
}
