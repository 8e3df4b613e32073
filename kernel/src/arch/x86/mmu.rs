//! 32-bit x86 MMU backend: 2-level paging, CR2/CR3, PAT for
//! write-combining.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::PageFaultInfo;
use crate::mm::{PhysAddr, VirtAddr};

/// Base of the kernel half; the linear map of low physical memory starts
/// here (the classic 3/1 split).
pub const KERNEL_BASE: u64 = 0xC000_0000;

/// The linear map covers at most this much physical memory; RAM above the
/// ceiling is unreachable through the direct mapping.
pub const LINEAR_CEILING: u64 = 896 * 1024 * 1024;

/// Kernel-only window reserved exclusively for MMIO mappings.
pub const MMIO_BASE: u64 = 0xF800_0000;
pub const MMIO_WINDOW_SIZE: u64 = 64 * 1024 * 1024;

static WRITE_COMBINING: AtomicBool = AtomicBool::new(false);

const IA32_PAT: u32 = 0x277;

/// Program PAT entry 5 to write-combining, as on the 64-bit port.
pub fn init() {
    // SAFETY: Privileged MSR read-modify-write changing only entry 5.
    unsafe {
        let mut value = x86::msr::rdmsr(IA32_PAT);
        value &= !(0xFFu64 << 40);
        value |= 0x01u64 << 40;
        x86::msr::wrmsr(IA32_PAT, value);
    }
    WRITE_COMBINING.store(true, Ordering::Release);
    log::info!("mmu: PAT entry 5 programmed for write-combining");
}

pub fn write_combining_available() -> bool {
    WRITE_COMBINING.load(Ordering::Acquire)
}

/// Physical address of the active page directory (CR3).
pub fn current_root() -> PhysAddr {
    // SAFETY: Reading CR3 is side-effect free in kernel mode.
    let cr3 = unsafe { x86::controlregs::cr3() };
    PhysAddr::new(cr3 & 0xFFFF_F000)
}

/// The kernel half lives in each page directory; the master template is
/// whatever directory is active at init.
pub fn kernel_root() -> PhysAddr {
    current_root()
}

/// Load a new page directory; the CR3 write flushes the TLB.
pub fn switch_root(root: PhysAddr) {
    // SAFETY: The caller (VMM) guarantees a valid, protected directory.
    unsafe { x86::controlregs::cr3_write(root.as_u64()) };
}

pub fn flush_tlb(vaddr: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry.
    unsafe { x86::tlb::flush(vaddr.as_u64() as usize) };
}

pub fn flush_tlb_all() {
    // SAFETY: CR3 reload; drops all non-global entries.
    unsafe { x86::tlb::flush_all() };
}

/// Decode the page-fault error code and CR2. Same bit layout as the
/// 64-bit port, minus instruction-fetch reporting (no NX without PAE).
pub fn parse_fault(raw_error: u64) -> PageFaultInfo {
    // SAFETY: CR2 holds the faulting linear address.
    let fault_addr = unsafe { x86::controlregs::cr2() } as u64;
    PageFaultInfo {
        fault_addr,
        is_present: raw_error & 1 != 0,
        is_write: raw_error & 2 != 0,
        is_user: raw_error & 4 != 0,
        is_reserved: raw_error & 8 != 0,
        is_exec: false,
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
