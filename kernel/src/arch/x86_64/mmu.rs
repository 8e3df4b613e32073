//! x86-64 MMU backend: control registers, TLB maintenance, PAT, and fault
//! decoding.

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::registers::control::{Cr2, Cr3};

use crate::hal::PageFaultInfo;
use crate::mm::{PhysAddr, VirtAddr};

/// Base of the kernel half; the linear map of physical memory starts here.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// The linear map covers at most this much physical memory.
pub const LINEAR_CEILING: u64 = 64 * 1024 * 1024 * 1024;

/// Kernel-only window reserved exclusively for MMIO mappings.
pub const MMIO_BASE: u64 = 0xFFFF_9000_0000_0000;
pub const MMIO_WINDOW_SIZE: u64 = 1024 * 1024 * 1024;

static WRITE_COMBINING: AtomicBool = AtomicBool::new(false);

/// IA32_PAT MSR.
const MSR_PAT: u32 = 0x277;

/// Program PAT entry 5 (selected by PAT=1, PCD=0, PWT=1 in a PTE) to
/// write-combining. The remaining entries keep their reset defaults.
pub fn init() {
    use x86_64::registers::model_specific::Msr;
    let mut pat = Msr::new(MSR_PAT);
    // SAFETY: Rewriting the PAT is a privileged MSR write; entry 5 is
    // changed from WT to WC (0x01), everything else keeps reset values.
    unsafe {
        let mut value = pat.read();
        value &= !(0xFFu64 << 40);
        value |= 0x01u64 << 40;
        pat.write(value);
    }
    WRITE_COMBINING.store(true, Ordering::Release);
    log::info!("mmu: PAT entry 5 programmed for write-combining");
}

pub fn write_combining_available() -> bool {
    WRITE_COMBINING.load(Ordering::Acquire)
}

/// Physical address of the active top-level table (CR3).
pub fn current_root() -> PhysAddr {
    let (frame, _) = Cr3::read();
    PhysAddr::new(frame.start_address().as_u64())
}

/// On the x86 family the kernel half lives in each root; the master
/// template is whatever root is active at init.
pub fn kernel_root() -> PhysAddr {
    current_root()
}

/// Load a new root; the CR3 write also flushes non-global TLB entries.
pub fn switch_root(root: PhysAddr) {
    use x86_64::structures::paging::PhysFrame;
    let (_, flags) = Cr3::read();
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
    // SAFETY: The caller (VMM) guarantees `root` is a valid, protected
    // top-level table carrying the kernel half.
    unsafe { Cr3::write(frame, flags) };
}

pub fn flush_tlb(vaddr: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.as_u64()));
}

pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

/// Decode the page-fault error code and CR2 into the neutral record.
///
/// Error code bits: 0 = present, 1 = write, 2 = user, 3 = reserved-bit,
/// 4 = instruction fetch.
pub fn parse_fault(raw_error: u64) -> PageFaultInfo {
    let fault_addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    PageFaultInfo {
        fault_addr,
        is_present: raw_error & 1 != 0,
        is_write: raw_error & 2 != 0,
        is_user: raw_error & 4 != 0,
        is_reserved: raw_error & 8 != 0,
        is_exec: raw_error & 16 != 0,
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
    // are taken. The image is linked at KERNEL_BASE + load address.
    unsafe {
        let start = &raw const _kernel_start as u64;
        let end = &raw const _kernel_end as u64;
        (
            PhysAddr::new(start - KERNEL_BASE),
            PhysAddr::new(end - KERNEL_BASE),
        )
    }
}
