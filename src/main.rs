#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
// CI lint gate: when built with `--features strict`, fail on any warning
#![cfg_attr(feature = "strict", deny(warnings))]

// Required for heap allocation
extern crate alloc;

// Core library (error handling, logging, ring buffer, panic diagnostics)
#[allow(special_module_name)]
pub mod lib;
// Kernel security levels
pub mod cap;
// Kernel heap allocator
pub mod heap;
// Physical memory: frame accounting and address-range pool
pub mod mm;
// Task/process tables, scheduler, and blocking waiters
pub mod process;
// Message-passing channels
pub mod ipc;
// System call dispatch
pub mod syscall;
// Virtual file system
pub mod vfs;
// Platform-wide interrupt handler registry
pub mod interrupts;
// Monotonic time since boot
pub mod time;
// Build/version information
pub mod build_info;

pub mod arch {
    pub mod x86_64;
    pub use x86_64::*;
}

use crate::cap::SecurityLevel;
use crate::mm::{AddressRange, RangePool};
use crate::process::{Process, Task};
use alloc::string::String;
use alloc::vec::Vec;
use bootloader_api::config::BootloaderConfig;
use bootloader_api::{entry_point, BootInfo};

/// Low half of the canonical address space, below the recursive-mapping
/// slot, handed out to user processes by their `RangePool`.
const USER_SPACE_START: u64 = 0x0000_0000_0040_0000;
const USER_SPACE_END: u64 = 0x0000_7000_0000_0000;

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.kernel_stack_size = 256 * 1024;
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    unsafe {
        if let Err(e) = arch::boot::early_init() {
            arch::serial::serial_write(b"\n[FATAL] Boot error: ");
            arch::serial::serial_write(e.as_bytes());
            arch::serial::serial_write(b"\n");
            arch::boot::halt_forever();
        }
    }
    arch::boot::print_boot_info();

    // The heap is a fixed static region and needs nothing but itself, so it
    // comes up first: the frame allocator's bitmap and metadata are `Vec`s
    // and need a working global allocator before they can be built.
    if let Err(e) = heap::init_heap() {
        arch::serial::serial_write(b"[FATAL] Heap init failed: ");
        arch::serial::serial_write(e.as_bytes());
        arch::serial::serial_write(b"\n");
        arch::boot::halt_forever();
    }
    crate::info!("kernel heap initialized");

    let ram_ranges: Vec<mm::RamRange> = boot_info
        .memory_regions
        .iter()
        .filter(|r| r.kind == bootloader_api::info::MemoryRegionKind::Usable)
        .map(|r| mm::RamRange { start: r.start, end: r.end })
        .collect();
    mm::init_frames(&ram_ranges);
    crate::info!("frame allocator: {} usable ranges", ram_ranges.len());

    unsafe {
        arch::paging::init_scratch_slot();
    }

    spawn_kernel_tasks();

    arch::serial::serial_write(b"[BOOT] Kernel initialization complete, entering idle loop\n");

    loop {
        process::scheduler::reap_dead();
        process::scheduler::yield_now();
    }
}

/// Build the kernel process (pid 1, holding the boot-time address space)
/// and register its idle task, which is all a core ever falls back to run
/// once the ready queue empties.
fn spawn_kernel_tasks() {
    let (pml4_frame, _) = x86_64::registers::control::Cr3::read();
    let kernel_pml4 = pml4_frame.start_address();

    let kernel_pid = process::insert_process(|id| {
        Process::new(
            id,
            kernel_pml4,
            RangePool::new(AddressRange { start: USER_SPACE_START, end: USER_SPACE_END }),
            USER_SPACE_START,
            String::from("kernel"),
        )
    })
    .expect("process table has room for the kernel process");

    let idle_id = process::spawn_task(|id| {
        Task::new(
            id,
            kernel_pid,
            SecurityLevel::Kernel,
            Default::default(),
            AddressRange { start: 0, end: 0 },
            0,
            String::from("idle"),
        )
    })
    .expect("task table has room for the idle task");

    process::register_well_known("idle", idle_id);
    process::scheduler::enqueue_ready(0, idle_id, false);
    process::scheduler::pick_next(0);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::lib::panic::panic_handler(info)
}

/// Early-boot and panic-path console output. Writes straight to the serial
/// port rather than going through the log ring buffer, so it still works
/// before the heap (and therefore `alloc::format!`) is available.
#[inline(always)]
pub unsafe fn uart_print(msg: &[u8]) {
    arch::serial::serial_write(msg);
}

#[macro_export]
macro_rules! kprint {
    ($($t:tt)*) => {{
        let s = alloc::format!($($t)*);
        #[allow(unused_unsafe)]
        unsafe { crate::uart_print(s.as_bytes()); }
    }};
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($t:tt)*) => { $crate::kprint!("{}\n", format_args!($($t)*)) };
}
