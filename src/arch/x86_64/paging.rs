//! # x86_64 Paging — Recursive Self-Mapped Page Tables
//!
//! Implements the 4-level x86_64 page table hierarchy using a **recursive
//! mapping**: PML4 slot [`RECURSIVE_INDEX`] points back at the PML4 itself.
//! Reading bits 39-47, 30-38, and 21-29 of a virtual address as successive
//! PML4 indices walks back into the recursive slot instead of descending,
//! which turns any page table at any level into an ordinarily addressable
//! array of 512 entries — no direct physical map of all of RAM is kept.
//!
//! ```text
//! Address layout used to reach a table at level L that governs indices
//! (p4, p3, p2) above it — fill the remaining high slots with R:
//!
//!   level 4 (PML4 itself): R  R  R  R
//!   level 3 (PDPT for p4): R  R  R  p4
//!   level 2 (PD for p4/p3): R  R  p4 p3
//!   level 1 (PT for p4/p3/p2): R  p4 p3 p2
//! ```
//!
//! This is the opposite tradeoff from a direct physical map: walking and
//! editing tables costs a few extra loads through the recursive slot instead
//! of one offset add, but the kernel's virtual address space no longer has
//! to reserve a window the size of all physical memory.
//!
//! ## Scratch window
//!
//! Frames fresh out of the allocator (see [`crate::mm::frame`]) aren't
//! mapped anywhere yet, so they can't be reached through any address space's
//! page tables. [`phys_to_kernel`] works around this with a single
//! kernel-reserved virtual address whose last-level PTE is repointed at the
//! requested physical frame on every call, under a lock so only one such
//! temporary mapping is live at a time.

use crate::lib::error::{Errno, Result};
use x86_64::{
    structures::paging::{PageTable, PageTableEntry, PageTableFlags, PageTableIndex},
    PhysAddr, VirtAddr,
};
use spin::Mutex;

/// Recursive PML4 slot. 510 leaves 511 free for a future higher-half kernel
/// image slot and keeps the recursive window out of canonical user space.
const RECURSIVE_INDEX: u16 = 510;

/// Kernel-reserved virtual address used as a temporary single-frame window.
/// Lives in the PML4 slot directly below the recursive slot so its own
/// intermediate tables never alias the recursive walk.
const SCRATCH_VADDR: u64 = 0xFFFF_FF00_0000_0000;

fn canonical(addr: u64) -> VirtAddr {
    // Sign-extend bit 47 so the result is a valid canonical address.
    let shifted = ((addr << 16) as i64 >> 16) as u64;
    VirtAddr::new(shifted)
}

fn build(a: u16, b: u16, c: u16, d: u16) -> VirtAddr {
    canonical((a as u64) << 39 | (b as u64) << 30 | (c as u64) << 21 | (d as u64) << 12)
}

fn pml4_table() -> *mut PageTable {
    build(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX).as_mut_ptr()
}

fn pdpt_table(p4: u16) -> *mut PageTable {
    build(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, p4).as_mut_ptr()
}

fn pd_table(p4: u16, p3: u16) -> *mut PageTable {
    build(RECURSIVE_INDEX, RECURSIVE_INDEX, p4, p3).as_mut_ptr()
}

fn pt_table(p4: u16, p3: u16, p2: u16) -> *mut PageTable {
    build(RECURSIVE_INDEX, p4, p3, p2).as_mut_ptr()
}

fn indices(virt: VirtAddr) -> (PageTableIndex, PageTableIndex, PageTableIndex, PageTableIndex) {
    let a = virt.as_u64();
    (
        PageTableIndex::new((a >> 39) as u16 & 0x1FF),
        PageTableIndex::new((a >> 30) as u16 & 0x1FF),
        PageTableIndex::new((a >> 21) as u16 & 0x1FF),
        PageTableIndex::new((a >> 12) as u16 & 0x1FF),
    )
}

/// Flags a caller may request for a mapping; always ORed with PRESENT.
pub use x86_64::structures::paging::PageTableFlags as PageFlags;

/// Walk to (creating if necessary) the level-1 PTE governing `virt` in the
/// *currently active* address space (the one whose PML4 occupies the
/// recursive slot right now).
///
/// # Safety
/// Caller must hold whatever lock serializes edits to this address space's
/// page tables and must not call this for an address in another, inactive
/// address space (recursive addressing only ever exposes the active one).
unsafe fn walk_create(virt: VirtAddr) -> Result<*mut PageTableEntry> {
    let (p4i, p3i, p2i, p1i) = indices(virt);

    let pml4 = &mut *pml4_table();
    ensure_present(&mut pml4[p4i], pdpt_table(p4i.into()))?;

    let pdpt = &mut *pdpt_table(p4i.into());
    ensure_present(&mut pdpt[p3i], pd_table(p4i.into(), p3i.into()))?;

    let pd = &mut *pd_table(p4i.into(), p3i.into());
    ensure_present(&mut pd[p2i], pt_table(p4i.into(), p3i.into(), p2i.into()))?;

    let pt = &mut *pt_table(p4i.into(), p3i.into(), p2i.into());
    Ok(&mut pt[p1i] as *mut _)
}

/// Ensure `entry` is present, allocating a backing frame for its child table
/// if not. `child_table_virt` is the virtual address through which that
/// child table will be reachable via the recursive window once `entry` is
/// installed — computed by the caller from the same indices, since the
/// recursive window only resolves to the right physical frame after the
/// entry exists.
unsafe fn ensure_present(
    entry: &mut PageTableEntry,
    child_table_virt: *mut PageTable,
) -> Result<()> {
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        let frame_pa = crate::mm::frame::alloc_frame().ok_or(Errno::ENOMEM)?;
        entry.set_addr(
            PhysAddr::new(frame_pa),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
        flush(VirtAddr::new(child_table_virt as u64));
        (&mut *child_table_virt).zero();
    }
    Ok(())
}

/// Map a single 4 KiB page in the active address space.
///
/// # Safety
/// Caller must ensure `phys` is a frame it owns and that no other mapping of
/// `virt` already exists.
pub unsafe fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<()> {
    let entry = walk_create(virt)?;
    let entry = &mut *entry;
    if entry.flags().contains(PageTableFlags::PRESENT) {
        return Err(Errno::EEXIST);
    }
    entry.set_addr(phys, flags | PageTableFlags::PRESENT);
    flush(virt);
    Ok(())
}

/// Unmap a single page, returning the physical frame that was mapped there.
///
/// # Safety
/// Caller is responsible for freeing the returned frame if appropriate.
pub unsafe fn unmap_page(virt: VirtAddr) -> Result<PhysAddr> {
    let (p4i, p3i, p2i, p1i) = indices(virt);
    let pml4 = &*pml4_table();
    if !pml4[p4i].flags().contains(PageTableFlags::PRESENT) {
        return Err(Errno::ENOENT);
    }
    let pdpt = &*pdpt_table(p4i.into());
    if !pdpt[p3i].flags().contains(PageTableFlags::PRESENT) {
        return Err(Errno::ENOENT);
    }
    let pd = &*pd_table(p4i.into(), p3i.into());
    if !pd[p2i].flags().contains(PageTableFlags::PRESENT) {
        return Err(Errno::ENOENT);
    }
    let pt = &mut *pt_table(p4i.into(), p3i.into(), p2i.into());
    let entry = &mut pt[p1i];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return Err(Errno::ENOENT);
    }
    let phys = entry.addr();
    entry.set_unused();
    flush(virt);
    Ok(phys)
}

/// Translate a virtual address to its mapped physical address, if present.
pub unsafe fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    let (p4i, p3i, p2i, p1i) = indices(virt);
    let pml4 = &*pml4_table();
    if !pml4[p4i].flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let pdpt = &*pdpt_table(p4i.into());
    if !pdpt[p3i].flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let pd = &*pd_table(p4i.into(), p3i.into());
    if !pd[p2i].flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let pt = &*pt_table(p4i.into(), p3i.into(), p2i.into());
    let entry = &pt[p1i];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(entry.addr() + (virt.as_u64() & 0xFFF))
}

fn flush(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(virt);
}

static SCRATCH_LOCK: Mutex<()> = Mutex::new(());

/// Temporarily map `pa` at a reserved kernel address and return a pointer to
/// it, valid only until the next call to `phys_to_kernel` (the window is
/// reused). Used by the frame allocator to zero frames that aren't mapped
/// anywhere yet.
pub unsafe fn phys_to_kernel(pa: PhysAddr) -> *mut u8 {
    let _guard = SCRATCH_LOCK.lock();
    let virt = VirtAddr::new(SCRATCH_VADDR);
    let entry = walk_create_infallible(virt);
    entry.set_addr(pa, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
    flush(virt);
    virt.as_mut_ptr()
}

/// Allocate a frame and zero it through the scratch window. Requires
/// `init_scratch_slot` to have run. Not used by `ensure_present` itself,
/// which zeroes freshly-linked page table frames directly through the
/// recursive window instead of the scratch slot, avoiding a bootstrap
/// dependency on the scratch slot already existing.
pub unsafe fn alloc_zeroed_frame() -> Result<PhysAddr> {
    let pa = crate::mm::frame::alloc_frame().ok_or(Errno::ENOMEM)?;
    let pa = PhysAddr::new(pa);
    let ptr = phys_to_kernel(pa);
    core::ptr::write_bytes(ptr, 0, 4096);
    Ok(pa)
}

/// Same walk as `walk_create` but panics instead of propagating allocation
/// failure — used only for the always-resident scratch slot, whose
/// intermediate tables are installed once at boot (see `init_scratch_slot`).
unsafe fn walk_create_infallible(virt: VirtAddr) -> &'static mut PageTableEntry {
    &mut *(walk_create(virt).expect("scratch slot page tables must already be reserved"))
}

/// Pre-allocate the intermediate tables backing the scratch slot so later
/// `phys_to_kernel` calls only ever touch its final-level PTE.
///
/// # Safety
/// Must run once during early boot with a frame allocator already installed.
pub unsafe fn init_scratch_slot() {
    let virt = VirtAddr::new(SCRATCH_VADDR);
    let _ = walk_create(virt).expect("failed to reserve scratch slot page tables");
}

/// Load a fresh all-zero PML4 frame and recursively self-map it at
/// `RECURSIVE_INDEX`, producing a brand new, empty address space.
///
/// # Safety
/// Caller must switch to it (or hand it to a task that will) before any
/// other code assumes the old address space's mappings still apply.
pub unsafe fn new_address_space() -> Result<PhysAddr> {
    let pml4_pa = crate::mm::frame::alloc_frame().ok_or(Errno::ENOMEM)?;
    let pml4_pa = PhysAddr::new(pml4_pa);
    let pml4_virt = phys_to_kernel(pml4_pa);
    let pml4 = &mut *(pml4_virt as *mut PageTable);
    pml4.zero();
    pml4[PageTableIndex::new(RECURSIVE_INDEX)].set_addr(
        pml4_pa,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    );
    Ok(pml4_pa)
}

/// Switch the active address space to the one rooted at `pml4_pa`.
///
/// # Safety
/// `pml4_pa` must be a frame produced by `new_address_space` (or the boot
/// PML4), with the recursive slot already installed, and must contain
/// whatever kernel mappings the currently executing code depends on.
pub unsafe fn switch_to(pml4_pa: PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    Cr3::write(PhysFrame::containing_address(pml4_pa), Cr3Flags::empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_address_math_hits_expected_bits() {
        let addr = build(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX);
        let a = addr.as_u64();
        assert_eq!((a >> 39) as u16 & 0x1FF, RECURSIVE_INDEX);
        assert_eq!((a >> 30) as u16 & 0x1FF, RECURSIVE_INDEX);
        assert_eq!((a >> 21) as u16 & 0x1FF, RECURSIVE_INDEX);
        assert_eq!((a >> 12) as u16 & 0x1FF, RECURSIVE_INDEX);
    }
}
