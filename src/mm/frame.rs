//! Physical page frame allocator.
//!
//! Frames are tracked with a flat bitmap (one bit per 4 KiB frame) plus a
//! small LIFO "fast buffer" of the most recently freed frames. `free_frame`
//! pushes onto the fast buffer first and only falls back to clearing the
//! bitmap bit when the buffer is full; `alloc_frame` pops the fast buffer
//! before scanning the bitmap. This keeps the common alloc/free churn of a
//! single task off the bitmap scan entirely, without the free-list-per-order
//! bookkeeping a buddy allocator needs.
//!
//! Unlike a buddy allocator there is no splitting, no coalescing, and no
//! concept of allocation order: every request is for exactly one frame.
//! Callers needing a run of contiguous frames (e.g. a large heap growth)
//! loop calling `alloc_frame` and accept the fragmentation risk explicitly.

use super::page::{pa_to_pfn, pfn_to_pa, page_align_down, page_align_up, Frame, FrameFlags, Pfn, PhysAddr, PAGE_SIZE};
use alloc::vec::Vec;
use heapless::Deque;
use spin::Mutex;

/// Fast buffer capacity: recently-freed frames returned before touching the bitmap.
const FAST_BUFFER_CAP: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub fast_buffer_len: usize,
}

/// A contiguous range of physical memory available for allocation.
#[derive(Debug, Clone, Copy)]
pub struct RamRange {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

struct FrameAllocator {
    base_pfn: Pfn,
    num_frames: usize,
    /// One bit per frame; 1 = allocated.
    bitmap: Vec<u64>,
    metadata: Vec<Frame>,
    fast_buffer: Deque<Pfn, FAST_BUFFER_CAP>,
    free_frames: usize,
}

impl FrameAllocator {
    fn new(ranges: &[RamRange]) -> Self {
        let min_pfn = ranges.iter().map(|r| pa_to_pfn(page_align_down(r.start))).min().unwrap_or(0);
        let max_pfn = ranges
            .iter()
            .map(|r| pa_to_pfn(page_align_up(r.end)))
            .max()
            .unwrap_or(0);
        let num_frames = max_pfn - min_pfn;

        let mut metadata = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            metadata.push(Frame::new());
        }

        let words = (num_frames + 63) / 64;
        // Start fully reserved; usable ranges are cleared below.
        let mut bitmap = Vec::with_capacity(words);
        bitmap.resize(words, !0u64);

        let mut allocator = Self {
            base_pfn: min_pfn,
            num_frames,
            bitmap,
            metadata,
            fast_buffer: Deque::new(),
            free_frames: 0,
        };

        for range in ranges {
            allocator.mark_range_free(range.start, range.end);
        }

        allocator
    }

    fn mark_range_free(&mut self, start: PhysAddr, end: PhysAddr) {
        let start_pfn = pa_to_pfn(page_align_up(start));
        let end_pfn = pa_to_pfn(page_align_down(end));
        for pfn in start_pfn..end_pfn {
            let idx = pfn - self.base_pfn;
            self.clear_bit(idx);
            self.free_frames += 1;
        }
    }

    #[inline]
    fn test_bit(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    fn clear_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }

    fn scan_free_pfn(&mut self) -> Option<Pfn> {
        for idx in 0..self.num_frames {
            if !self.test_bit(idx) {
                self.set_bit(idx);
                return Some(self.base_pfn + idx);
            }
        }
        None
    }

    fn alloc(&mut self) -> Option<PhysAddr> {
        let pfn = if let Some(pfn) = self.fast_buffer.pop_back() {
            Some(pfn)
        } else {
            self.scan_free_pfn()
        }?;

        self.free_frames -= 1;
        let meta = &mut self.metadata[pfn - self.base_pfn];
        meta.set_refcount(1);
        Some(pfn_to_pa(pfn))
    }

    fn free(&mut self, pa: PhysAddr) {
        let pfn = pa_to_pfn(pa);
        let idx = pfn - self.base_pfn;
        debug_assert!(self.test_bit(idx) || self.fast_buffer.iter().any(|&p| p == pfn));
        self.metadata[idx].set_refcount(0);
        self.free_frames += 1;

        // The bitmap bit for `pfn` stays set (as it was while allocated) for
        // as long as the frame sits in the fast buffer; alloc() drains the
        // fast buffer before ever consulting the bitmap, so the bit is only
        // cleared once the frame is spilled back out of the buffer below.
        if self.fast_buffer.push_back(pfn).is_err() {
            if let Some(spill) = self.fast_buffer.pop_front() {
                self.clear_bit(spill - self.base_pfn);
                let _ = self.fast_buffer.push_back(pfn);
            } else {
                self.clear_bit(idx);
            }
        }
    }

    fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.num_frames,
            free_frames: self.free_frames,
            fast_buffer_len: self.fast_buffer.len(),
        }
    }
}

static ALLOCATOR: Mutex<Option<FrameAllocator>> = Mutex::new(None);

/// Initialize the frame allocator over the given usable RAM ranges.
///
/// Must be called exactly once, early in boot, before any other `mm` call.
pub fn init(ranges: &[RamRange]) {
    let mut guard = ALLOCATOR.lock();
    *guard = Some(FrameAllocator::new(ranges));
}

/// Allocate a single physical frame. Content is unspecified — callers that
/// need zeroed memory should zero it through whatever window they map it
/// with (see `arch::x86_64::paging::alloc_zeroed_frame` for the common case).
pub fn alloc_frame() -> Option<PhysAddr> {
    ALLOCATOR.lock().as_mut()?.alloc()
}

/// Return a frame to the allocator.
pub fn free_frame(pa: PhysAddr) {
    if let Some(a) = ALLOCATOR.lock().as_mut() {
        a.free(pa);
    }
}

pub fn stats() -> FrameStats {
    ALLOCATOR.lock().as_ref().map(|a| a.stats()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_is_reusable_via_fast_buffer() {
        let ranges = [RamRange { start: 0, end: (FAST_BUFFER_CAP as u64 + 8) * PAGE_SIZE as u64 }];
        let mut a = FrameAllocator::new(&ranges);
        let f = a.alloc().unwrap();
        let before = a.stats().free_frames;
        a.free(f);
        assert_eq!(a.stats().free_frames, before + 1);
        assert_eq!(a.stats().fast_buffer_len, 1);
    }

    #[test]
    fn frame_conservation_round_trip() {
        let ranges = [RamRange { start: 0, end: 16 * PAGE_SIZE as u64 }];
        let mut a = FrameAllocator::new(&ranges);
        let total = a.stats().free_frames;
        let mut frames = Vec::new();
        for _ in 0..total {
            frames.push(a.alloc().unwrap());
        }
        assert!(a.alloc().is_none());
        for f in frames {
            a.free(f);
        }
        assert_eq!(a.stats().free_frames, total);
    }
}
