//! The single growable scratch buffer used for untiling and resolves.

use tracing::debug;

use crate::backend::{
    BackendError, BufferDesc, GpuBackend, MemoryHeap, ResourceId, ResourceState,
};
use crate::deferred::{DeferredDeletionQueue, DeferredObject};
use crate::ring::align_up;

pub const DEFAULT_SCRATCH_INCREMENT: u64 = 16 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchAcquire {
    pub buffer: ResourceId,
    pub size: u64,
    /// `(before, after)` barrier the caller must record before using the buffer.
    pub transition: Option<(ResourceState, ResourceState)>,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    buffer: ResourceId,
    size: u64,
    state: ResourceState,
}

#[derive(Debug)]
pub struct ScratchBuffer {
    increment: u64,
    current: Option<Allocation>,
    in_use: bool,
}

impl ScratchBuffer {
    pub fn new(increment: u64) -> Self {
        assert!(increment > 0, "scratch increment must be non-zero");
        Self {
            increment,
            current: None,
            in_use: false,
        }
    }

    pub fn size(&self) -> u64 {
        self.current.map_or(0, |a| a.size)
    }

    pub fn buffer(&self) -> Option<ResourceId> {
        self.current.map(|a| a.buffer)
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Hands out a buffer of at least `size` bytes, growing in whole
    /// increments. A buffer that is too small goes to `deferred` tagged with
    /// `current_frame`.
    ///
    /// # Panics
    ///
    /// If the buffer is already held.
    pub fn acquire<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        deferred: &mut DeferredDeletionQueue,
        current_frame: u64,
        size: u64,
        state: ResourceState,
    ) -> Result<ScratchAcquire, BackendError> {
        assert!(
            !self.in_use,
            "scratch buffer requested while already in use"
        );

        if let Some(current) = self.current.as_mut() {
            if current.size >= size {
                let transition = (current.state != state).then_some((current.state, state));
                current.state = state;
                self.in_use = true;
                return Ok(ScratchAcquire {
                    buffer: current.buffer,
                    size: current.size,
                    transition,
                });
            }
        }

        let new_size = align_up(size.max(1), self.increment);
        let buffer = backend.create_buffer(&BufferDesc {
            label: "xenos scratch buffer",
            size: new_size,
            heap: MemoryHeap::Default,
            initial_state: state,
            unordered_access: true,
        })?;
        if let Some(old) = self.current.take() {
            debug!(old_size = old.size, new_size, "growing scratch buffer");
            deferred.push(DeferredObject::Resource(old.buffer), current_frame);
        }
        self.current = Some(Allocation {
            buffer,
            size: new_size,
            state,
        });
        self.in_use = true;
        Ok(ScratchAcquire {
            buffer,
            size: new_size,
            transition: None,
        })
    }

    /// Returns the buffer, recording the state the holder left it in.
    pub fn release(&mut self, buffer: ResourceId, new_state: ResourceState) {
        assert!(self.in_use, "releasing a scratch buffer that was not acquired");
        let current = self
            .current
            .as_mut()
            .filter(|a| a.buffer == buffer)
            .unwrap_or_else(|| panic!("releasing foreign buffer {buffer:?} as scratch"));
        current.state = new_state;
        self.in_use = false;
    }

    /// Gives up the buffer for destruction, e.g. at shutdown.
    pub fn take(&mut self) -> Option<ResourceId> {
        assert!(!self.in_use, "dropping scratch buffer while in use");
        self.current.take().map(|a| a.buffer)
    }
}
