//! AArch64 MMU backend: TTBR0/TTBR1 split, MAIR attributes, TLBI.
//!
//! User address spaces live in TTBR0; the kernel half is the single TTBR1
//! tree, so switching spaces never touches kernel translations.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::PageFaultInfo;
use crate::mm::{PhysAddr, VirtAddr};

/// Base of the TTBR1 region; the linear map of physical memory starts here.
pub const KERNEL_BASE: u64 = 0xFFFF_0000_0000_0000;

/// The linear map covers at most this much physical memory.
pub const LINEAR_CEILING: u64 = 64 * 1024 * 1024 * 1024;

/// Kernel-only window reserved exclusively for MMIO mappings
/// (TTBR1 top-level entry 1, disjoint from the linear map's entry 0).
pub const MMIO_BASE: u64 = 0xFFFF_0080_0000_0000;
pub const MMIO_WINDOW_SIZE: u64 = 1024 * 1024 * 1024;

static WRITE_COMBINING: AtomicBool = AtomicBool::new(false);

/// Program MAIR_EL1: index 0 = normal write-back, index 1 = Device-nGnRnE,
/// index 2 = normal non-cacheable (the write-combining analogue).
pub fn init() {
    let mair: u64 = 0xFF | (0x00 << 8) | (0x44 << 16);
    // SAFETY: MAIR_EL1 write plus the barrier pair making it visible to
    // the translation walks that follow.
    unsafe {
        core::arch::asm!(
            "msr MAIR_EL1, {}",
            "dsb sy",
            "isb",
            in(reg) mair,
        );
    }
    WRITE_COMBINING.store(true, Ordering::Release);
    log::info!("mmu: MAIR programmed (WB / device / non-cacheable)");
}

pub fn write_combining_available() -> bool {
    WRITE_COMBINING.load(Ordering::Acquire)
}

/// Root of the active user half (TTBR0).
pub fn current_root() -> PhysAddr {
    let ttbr0: u64;
    // SAFETY: Read-only system register access.
    unsafe { core::arch::asm!("mrs {}, TTBR0_EL1", out(reg) ttbr0) };
    PhysAddr::new(ttbr0 & 0x0000_FFFF_FFFF_F000)
}

/// Root of the kernel half (TTBR1).
pub fn kernel_root() -> PhysAddr {
    let ttbr1: u64;
    // SAFETY: Read-only system register access.
    unsafe { core::arch::asm!("mrs {}, TTBR1_EL1", out(reg) ttbr1) };
    PhysAddr::new(ttbr1 & 0x0000_FFFF_FFFF_F000)
}

/// Load a new user root and invalidate stale translations.
pub fn switch_root(root: PhysAddr) {
    // SAFETY: The caller guarantees a valid user top-level table. The
    // barrier/TLBI sequence is the architectural recipe for a TTBR change
    // without ASIDs.
    unsafe {
        core::arch::asm!(
            "msr TTBR0_EL1, {}",
            "isb",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            in(reg) root.as_u64(),
        );
    }
}

pub fn flush_tlb(vaddr: VirtAddr) {
    let page = vaddr.as_u64() >> 12;
    // SAFETY: TLB invalidation by VA, all ASIDs; ordering barriers follow.
    unsafe {
        core::arch::asm!(
            "tlbi vaae1, {}",
            "dsb ish",
            "isb",
            in(reg) page,
        );
    }
}

pub fn flush_tlb_all() {
    // SAFETY: Full EL1 TLB invalidation with the required barriers.
    unsafe {
        core::arch::asm!("tlbi vmalle1", "dsb ish", "isb");
    }
}

/// Decode an ESR_EL1 syndrome (passed through from the trap entry) plus
/// FAR_EL1 into the neutral record.
pub fn parse_fault(raw_error: u64) -> PageFaultInfo {
    let far: u64;
    // SAFETY: FAR_EL1 holds the faulting address of the last abort.
    unsafe { core::arch::asm!("mrs {}, FAR_EL1", out(reg) far) };

    let ec = (raw_error >> 26) & 0x3F;
    // EC 0x20/0x21: instruction abort (lower/current EL);
    // EC 0x24/0x25: data abort (lower/current EL).
    let is_exec = ec == 0x20 || ec == 0x21;
    let is_user = ec == 0x20 || ec == 0x24;
    let dfsc = raw_error & 0x3F;
    // DFSC 0b0001xx: translation fault; 0b0011xx: permission fault.
    let is_present = (0x0C..=0x0F).contains(&dfsc);
    let is_write = raw_error & (1 << 6) != 0 && !is_exec;

    PageFaultInfo {
        fault_addr: far,
        is_present,
        is_write,
        is_user,
        is_exec,
        is_reserved: false,
        raw_error,
    }
}

/// Physical extent of the kernel image, from the linker symbols the boot
/// layer provides.
#[cfg(target_os = "none")]
pub fn kernel_image_range() -> (PhysAddr, PhysAddr) {
    extern "C" {
        static _kernel_start: u8;
        static _kernel_end: u8;
    }
    // SAFETY: The linker script defines both symbols; only their addresses
    // are taken.
    unsafe {
        let start = &raw const _kernel_start as u64;
        let end = &raw const _kernel_end as u64;
        (
            PhysAddr::new(start - KERNEL_BASE),
            PhysAddr::new(end - KERNEL_BASE),
        )
    }
}
