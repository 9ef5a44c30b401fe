//! Offset bookkeeping for per-frame ring allocators.
//!
//! Only offsets are tracked here. Owners map them onto descriptor heaps or
//! upload buffers.

/// Round `value` up to the nearest multiple of `alignment` (which must be > 0).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// A fixed range split into one linear segment per frame slot.
///
/// A segment is only rewound when its frame slot is reopened, which happens
/// after the frame that last used it has retired.
#[derive(Debug, Clone)]
pub struct SegmentedRing {
    segment_len: u64,
    cursors: Vec<u64>,
    active: usize,
}

impl SegmentedRing {
    pub fn new(segment_count: usize, segment_len: u64) -> Self {
        assert!(segment_count > 0, "ring needs at least one segment");
        Self {
            segment_len,
            cursors: vec![0; segment_count],
            active: 0,
        }
    }

    pub fn segment_len(&self) -> u64 {
        self.segment_len
    }

    pub fn total_len(&self) -> u64 {
        self.segment_len * self.cursors.len() as u64
    }

    /// Make `segment` the allocation target and rewind it.
    pub fn begin_segment(&mut self, segment: usize) {
        assert!(
            segment < self.cursors.len(),
            "segment {segment} out of range ({} segments)",
            self.cursors.len()
        );
        self.active = segment;
        self.cursors[segment] = 0;
    }

    /// Absolute offset of the active segment's cursor.
    pub fn cursor(&self) -> u64 {
        self.segment_base(self.active) + self.cursors[self.active]
    }

    pub fn used(&self) -> u64 {
        self.cursors[self.active]
    }

    pub fn remaining(&self) -> u64 {
        self.segment_len - self.cursors[self.active]
    }

    fn segment_base(&self, segment: usize) -> u64 {
        segment as u64 * self.segment_len
    }

    /// Allocate `len` units from the active segment, returning an absolute
    /// offset into the whole ring.
    pub fn alloc(&mut self, len: u64, alignment: u64) -> Option<u64> {
        let local = align_up(self.cursors[self.active], alignment.max(1));
        let end = local.checked_add(len)?;
        if end > self.segment_len {
            return None;
        }
        self.cursors[self.active] = end;
        Some(self.segment_base(self.active) + local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(10 << 20, 16 << 20), 16 << 20);
        assert_eq!(align_up(20 << 20, 16 << 20), 32 << 20);
        assert_eq!(align_up(u64::MAX, 256), u64::MAX / 256 * 256);
    }

    #[test]
    fn segments_do_not_overlap() {
        let mut ring = SegmentedRing::new(3, 100);
        ring.begin_segment(0);
        assert_eq!(ring.alloc(60, 1), Some(0));
        ring.begin_segment(1);
        assert_eq!(ring.alloc(60, 1), Some(100));
        assert_eq!(ring.alloc(60, 1), None);
        assert_eq!(ring.remaining(), 40);
        ring.begin_segment(2);
        assert_eq!(ring.alloc(10, 32), Some(200));
        assert_eq!(ring.alloc(10, 32), Some(232));
    }

    #[test]
    fn reopening_a_segment_rewinds_it() {
        let mut ring = SegmentedRing::new(2, 8);
        ring.begin_segment(1);
        ring.alloc(8, 1).unwrap();
        assert_eq!(ring.remaining(), 0);
        ring.begin_segment(1);
        assert_eq!(ring.cursor(), 8);
        assert_eq!(ring.alloc(8, 1), Some(8));
    }
}
