//! Kernel heap allocator.
//!
//! Backed by `linked_list_allocator` over a fixed static region, wrapped in a
//! [`GlobalAlloc`] that tracks allocation statistics and large allocations
//! are instead backed by individually-mapped physical frames (the frame
//! allocator has no notion of allocation order, so "large" just means "more
//! than one frame, fetched and mapped in a loop").

use crate::arch::x86_64::paging;
use crate::mm;
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

/// Cache-aligned array wrapper for heap memory.
#[repr(align(64))]
struct CacheAlignedArray([u8; HEAP_SIZE]);

static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Deterministic no-alloc guard (when true, allocations are rejected).
static DET_NO_ALLOC: AtomicBool = AtomicBool::new(false);

/// Heap statistics for monitoring and debugging.
pub struct HeapStats {
    total_allocations: usize,
    total_deallocations: usize,
    current_allocated: usize,
    peak_allocated: usize,
    allocation_failures: usize,
}

impl HeapStats {
    pub fn total_allocations(&self) -> usize { self.total_allocations }
    pub fn total_deallocations(&self) -> usize { self.total_deallocations }
    pub fn current_allocated(&self) -> usize { self.current_allocated }
    pub fn peak_allocated(&self) -> usize { self.peak_allocated }
    pub fn allocation_failures(&self) -> usize { self.allocation_failures }
}

static HEAP_STATS: Mutex<HeapStats> = Mutex::new(HeapStats {
    total_allocations: 0,
    total_deallocations: 0,
    current_allocated: 0,
    peak_allocated: 0,
    allocation_failures: 0,
});

const HEAP_START: usize = 0xFFFF_8800_0000_0000;
const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Return total heap size for telemetry calculations.
pub const fn heap_total_size() -> usize {
    HEAP_SIZE
}

static HEAP_INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Initialize the kernel heap. Backed by a fixed static region, so this can
/// and must run before the frame allocator: its bitmap and metadata are
/// `Vec`s that need a working global allocator to be built at all.
pub fn init_heap() -> Result<(), &'static str> {
    if HEAP_INIT_DONE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        unsafe {
            crate::arch::x86_64::serial::serial_write(b"[HEAP] mapping region\n");
            static mut HEAP_MEMORY: CacheAlignedArray = CacheAlignedArray([0; HEAP_SIZE]);
            let heap_arr_ptr = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut CacheAlignedArray;
            let heap_start = core::ptr::addr_of_mut!((*heap_arr_ptr).0) as *mut u8;

            ALLOCATOR.lock().init(heap_start, HEAP_SIZE);

            crate::arch::x86_64::serial::serial_write(b"[HEAP] initialized ");
            print_size(HEAP_SIZE);
            crate::arch::x86_64::serial::serial_write(b" heap\n");
        }
    }

    Ok(())
}

/// Custom wrapper around `GlobalAlloc` that tracks statistics.
pub struct StatsTrackingAllocator;

unsafe impl GlobalAlloc for StatsTrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if DET_NO_ALLOC.load(Ordering::Relaxed) {
            return core::ptr::null_mut();
        }

        const LARGE_ALLOC_THRESHOLD: usize = 1024 * 1024;
        let ptr = if layout.size() >= LARGE_ALLOC_THRESHOLD {
            large_alloc(layout)
        } else {
            ALLOCATOR.alloc(layout)
        };

        let mut stats = HEAP_STATS.lock();
        if !ptr.is_null() {
            stats.total_allocations += 1;
            stats.current_allocated += layout.size();
            if stats.current_allocated > stats.peak_allocated {
                stats.peak_allocated = stats.current_allocated;
            }
        } else {
            stats.allocation_failures += 1;
        }

        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut stats = HEAP_STATS.lock();
        stats.total_deallocations += 1;
        stats.current_allocated = stats.current_allocated.saturating_sub(layout.size());
        drop(stats);

        if large_dealloc(ptr, layout) {
            return;
        }
        ALLOCATOR.dealloc(ptr, layout);
    }
}

#[global_allocator]
static GLOBAL_ALLOC: StatsTrackingAllocator = StatsTrackingAllocator;

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    unsafe {
        crate::arch::x86_64::serial::serial_write(b"[HEAP] allocation error: size=");
        print_size(layout.size());
        crate::arch::x86_64::serial::serial_write(b" align=");
        print_size(layout.align());
        crate::arch::x86_64::serial::serial_write(b"\n");
    }
    print_heap_stats();
    loop {
        x86_64::instructions::hlt();
    }
}

// --------- Large allocation fallback: frames mapped one at a time ---------

const LARGE_MAGIC: u64 = 0x4C41_5247_5F41_4C4C;

#[repr(C)]
struct LargeAllocHeader {
    magic: u64,
    base_vaddr: u64,
    num_frames: usize,
}

#[inline(always)]
fn align_up(value: usize, align: usize) -> usize {
    let a = align.max(1);
    (value + a - 1) & !(a - 1)
}

/// Virtual address pool that large heap allocations are carved from. Kept
/// separate from the main heap region so growing it never fights the
/// `linked_list_allocator` pool for address space.
lazy_static::lazy_static! {
    static ref LARGE_REGION: Mutex<mm::RangePool> = Mutex::new(mm::RangePool::new(mm::AddressRange {
        start: 0xFFFF_8900_0000_0000,
        end: 0xFFFF_8A00_0000_0000,
    }));
}

unsafe fn large_alloc(layout: Layout) -> *mut u8 {
    let header_size = core::mem::size_of::<LargeAllocHeader>();
    let total = align_up(layout.size() + header_size, mm::page::PAGE_SIZE);
    let num_frames = total / mm::page::PAGE_SIZE;

    let range = match LARGE_REGION.lock().alloc(total as u64) {
        Some(r) => r,
        None => return core::ptr::null_mut(),
    };

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    for i in 0..num_frames {
        let frame = match mm::alloc_frame() {
            Some(f) => f,
            None => return core::ptr::null_mut(),
        };
        let vaddr = VirtAddr::new(range.start + (i as u64) * mm::page::PAGE_SIZE as u64);
        if paging::map_page(vaddr, PhysAddr::new(frame), flags).is_err() {
            return core::ptr::null_mut();
        }
    }

    let base = range.start as usize;
    let header_ptr = base as *mut LargeAllocHeader;
    core::ptr::write(header_ptr, LargeAllocHeader {
        magic: LARGE_MAGIC,
        base_vaddr: range.start,
        num_frames,
    });

    let ret = align_up(base + header_size, layout.align());
    ret as *mut u8
}

unsafe fn large_dealloc(ptr: *mut u8, layout: Layout) -> bool {
    if ptr.is_null() {
        return false;
    }
    let header_size = core::mem::size_of::<LargeAllocHeader>();
    // The header sits at the start of the mapped region, not directly before
    // `ptr` (alignment padding may separate them); recover it by re-deriving
    // the region start from the allocation size floor.
    let _ = layout;
    let probe = (ptr as usize).saturating_sub(header_size) as *const LargeAllocHeader;
    let hdr = &*probe;
    if hdr.magic != LARGE_MAGIC {
        return false;
    }

    for i in 0..hdr.num_frames {
        let vaddr = VirtAddr::new(hdr.base_vaddr + (i as u64) * mm::page::PAGE_SIZE as u64);
        if let Ok(pa) = paging::unmap_page(vaddr) {
            mm::free_frame(pa.as_u64());
        }
    }
    let total = hdr.num_frames * mm::page::PAGE_SIZE;
    LARGE_REGION.lock().free(mm::AddressRange { start: hdr.base_vaddr, end: hdr.base_vaddr + total as u64 });
    true
}

/// Print current heap statistics.
pub fn print_heap_stats() {
    let stats = HEAP_STATS.lock();
    unsafe {
        crate::arch::x86_64::serial::serial_write(b"[HEAP] allocs=");
        print_number(stats.total_allocations);
        crate::arch::x86_64::serial::serial_write(b" deallocs=");
        print_number(stats.total_deallocations);
        crate::arch::x86_64::serial::serial_write(b" current=");
        print_size(stats.current_allocated);
        crate::arch::x86_64::serial::serial_write(b" peak=");
        print_size(stats.peak_allocated);
        crate::arch::x86_64::serial::serial_write(b" failures=");
        print_number(stats.allocation_failures);
        crate::arch::x86_64::serial::serial_write(b"\n");
    }
}

/// Get current heap usage statistics.
pub fn get_heap_stats() -> HeapStats {
    let stats = HEAP_STATS.lock();
    HeapStats {
        total_allocations: stats.total_allocations,
        total_deallocations: stats.total_deallocations,
        current_allocated: stats.current_allocated,
        peak_allocated: stats.peak_allocated,
        allocation_failures: stats.allocation_failures,
    }
}

/// Enter deterministic no-alloc region.
pub fn det_no_alloc_enter() {
    DET_NO_ALLOC.store(true, Ordering::Relaxed);
}

/// Exit deterministic no-alloc region.
pub fn det_no_alloc_exit() {
    DET_NO_ALLOC.store(false, Ordering::Relaxed);
}

unsafe fn print_number(mut num: usize) {
    if num == 0 {
        crate::arch::x86_64::serial::serial_write(b"0");
        return;
    }
    let mut digits = [0u8; 20];
    let mut i = 0;
    while num > 0 {
        digits[i] = b'0' + (num % 10) as u8;
        num /= 10;
        i += 1;
    }
    while i > 0 {
        i -= 1;
        crate::arch::x86_64::serial::serial_write(&[digits[i]]);
    }
}

unsafe fn print_size(size: usize) {
    if size >= 1024 * 1024 {
        print_number(size / (1024 * 1024));
        crate::arch::x86_64::serial::serial_write(b" MiB");
    } else if size >= 1024 {
        print_number(size / 1024);
        crate::arch::x86_64::serial::serial_write(b" KiB");
    } else {
        print_number(size);
        crate::arch::x86_64::serial::serial_write(b" bytes");
    }
}

/// Bounds check for pointers handed back by the main (non-large) heap region.
pub fn is_valid_heap_ptr(ptr: *const u8, size: usize) -> bool {
    let addr = ptr as usize;
    addr >= HEAP_START && addr.saturating_add(size) <= HEAP_START + HEAP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_stats_start_at_zero() {
        let stats = get_heap_stats();
        assert_eq!(stats.total_allocations(), 0);
        assert_eq!(stats.allocation_failures(), 0);
    }
}
