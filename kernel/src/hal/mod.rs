//! Hardware abstraction layer
//!
//! The architecture-neutral contract the rest of the kernel programs
//! against. Each operation delegates to the backend selected at compile
//! time under `arch/`; on hosted builds (unit tests) the privileged
//! operations are inert so that pure logic above the HAL can run untrusted.
//!
//! MMU table operations are serialized by the VMM; the per-arch backends
//! are not required to be reentrant.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::mm::{AddrSpace, PageFlags, PhysAddr, VirtAddr};

// ---------------------------------------------------------------------------
// Neutral types
// ---------------------------------------------------------------------------

/// Architecture-neutral description of a page fault, filled in by
/// [`mmu_parse_fault`] from the per-arch fault registers.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub fault_addr: u64,
    /// The PTE was present (protection fault) rather than missing.
    pub is_present: bool,
    pub is_write: bool,
    /// The access came from user mode.
    pub is_user: bool,
    /// The access was an instruction fetch.
    pub is_exec: bool,
    /// Reserved-bit or translation-table corruption fault.
    pub is_reserved: bool,
    /// Raw architectural error/syndrome value, for diagnostics.
    pub raw_error: u64,
}

/// Opaque saved interrupt state returned by [`interrupt_save`]. Tokens are
/// CPU-local and must be restored on the CPU that produced them.
#[derive(Debug, Clone, Copy)]
#[must_use = "dropping the token loses the saved interrupt state"]
pub struct IrqToken(pub(crate) u64);

/// IRQ handler: called from interrupt context with the opaque pointer that
/// was registered alongside it.
pub type IrqHandlerFn = fn(*mut ());

/// The single system-call entry point: `(number, args) -> return value`.
pub type SyscallHandler = fn(u64, &[u64; 6]) -> u64;

// ---------------------------------------------------------------------------
// Boot-sequencing witnesses
// ---------------------------------------------------------------------------

static CPU_INIT: AtomicBool = AtomicBool::new(false);
static INTERRUPT_INIT: AtomicBool = AtomicBool::new(false);
static MMU_INIT: AtomicBool = AtomicBool::new(false);

pub fn cpu_initialized() -> bool {
    CPU_INIT.load(Ordering::Acquire)
}

pub fn interrupt_initialized() -> bool {
    INTERRUPT_INIT.load(Ordering::Acquire)
}

pub fn mmu_initialized() -> bool {
    MMU_INIT.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

/// Enable FPU/SIMD and per-CPU features. Idempotent.
#[cfg(target_os = "none")]
pub fn cpu_init() {
    if !CPU_INIT.swap(true, Ordering::AcqRel) {
        crate::arch::cpu::init();
    }
}

/// Unique id of the executing CPU; 0 on single-core configurations.
#[cfg(target_os = "none")]
pub fn cpu_id() -> u32 {
    crate::arch::cpu::id()
}

/// Sleep until the next enabled interrupt arrives.
#[cfg(target_os = "none")]
pub fn cpu_halt() {
    crate::arch::cpu::halt();
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// Install the vector table and initialize the interrupt controller.
/// Interrupts remain globally masked afterwards.
#[cfg(target_os = "none")]
pub fn interrupt_init() {
    if !INTERRUPT_INIT.swap(true, Ordering::AcqRel) {
        crate::arch::trap::init();
        crate::arch::intc::init();
    }
}

/// Record a handler for a physical IRQ and unmask it. Replaces any
/// previous entry.
pub fn interrupt_register(irq: u32, handler: IrqHandlerFn, data: *mut ()) -> crate::error::KernelResult<()> {
    crate::irq::register(irq, handler, data)
}

/// Globally enable interrupt delivery.
#[cfg(target_os = "none")]
pub fn interrupt_enable() {
    crate::arch::cpu::irq_enable();
}

/// Globally disable interrupt delivery.
#[cfg(target_os = "none")]
pub fn interrupt_disable() {
    crate::arch::cpu::irq_disable();
}

/// Atomically save the interrupt state and disable interrupts.
#[cfg(target_os = "none")]
pub fn interrupt_save() -> IrqToken {
    IrqToken(crate::arch::cpu::irq_save())
}

/// Restore interrupt state saved by [`interrupt_save`].
#[cfg(target_os = "none")]
pub fn interrupt_restore(token: IrqToken) {
    crate::arch::cpu::irq_restore(token.0);
}

/// Signal end-of-interrupt to the controller.
#[cfg(target_os = "none")]
pub fn interrupt_eoi(irq: u32) {
    crate::arch::intc::eoi(irq);
}

// Hosted builds: privileged operations are a fiction, but the interfaces
// keep their shape so the logic above the HAL runs in unit tests.
#[cfg(not(target_os = "none"))]
pub fn interrupt_save() -> IrqToken {
    IrqToken(0)
}

#[cfg(not(target_os = "none"))]
pub fn interrupt_restore(_token: IrqToken) {}

#[cfg(not(target_os = "none"))]
pub fn interrupt_enable() {}

#[cfg(not(target_os = "none"))]
pub fn interrupt_disable() {}

#[cfg(not(target_os = "none"))]
pub fn interrupt_init() {}

#[cfg(not(target_os = "none"))]
pub fn interrupt_eoi(_irq: u32) {}

#[cfg(not(target_os = "none"))]
pub fn cpu_init() {}

#[cfg(not(target_os = "none"))]
pub fn cpu_id() -> u32 {
    0
}

#[cfg(not(target_os = "none"))]
pub fn cpu_halt() {
    core::hint::spin_loop();
}

// ---------------------------------------------------------------------------
// MMU
// ---------------------------------------------------------------------------

/// Finalize the boot page tables and enable paging caches.
#[cfg(target_os = "none")]
pub fn mmu_init() -> crate::error::KernelResult<()> {
    if !MMU_INIT.swap(true, Ordering::AcqRel) {
        crate::arch::mmu::init();
        crate::mm::vmm::init()?;
    }
    Ok(())
}

/// Map `vaddr -> paddr` in `space`. Returns `false` on allocation failure.
pub fn mmu_map(space: AddrSpace, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) -> bool {
    crate::mm::vmm::map_page_in(space, vaddr, paddr, flags).is_ok()
}

/// Remove a mapping; returns the old frame or [`PhysAddr::INVALID`].
pub fn mmu_unmap(space: AddrSpace, vaddr: VirtAddr) -> PhysAddr {
    crate::mm::vmm::unmap_page_in(space, vaddr).unwrap_or(PhysAddr::INVALID)
}

/// Read-only lookup.
pub fn mmu_query(space: AddrSpace, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    crate::mm::vmm::query_page(space, vaddr)
}

/// Bit-level modify of an existing mapping's flags.
pub fn mmu_protect(
    space: AddrSpace,
    vaddr: VirtAddr,
    set: PageFlags,
    clear: PageFlags,
) -> crate::error::KernelResult<()> {
    crate::mm::vmm::protect_page_in(space, vaddr, set, clear)
}

pub fn mmu_create_space() -> crate::error::KernelResult<AddrSpace> {
    crate::mm::vmm::create_space()
}

pub fn mmu_clone_space(src: AddrSpace) -> crate::error::KernelResult<AddrSpace> {
    crate::mm::vmm::clone_space(src)
}

pub fn mmu_destroy_space(space: AddrSpace) -> crate::error::KernelResult<()> {
    crate::mm::vmm::destroy_space(space)
}

pub fn mmu_switch_space(space: AddrSpace) -> crate::error::KernelResult<()> {
    crate::mm::vmm::switch_space(space)
}

/// Invalidate the TLB entry for one address on this CPU.
#[cfg(target_os = "none")]
pub fn mmu_flush_tlb(vaddr: VirtAddr) {
    crate::arch::mmu::flush_tlb(vaddr);
}

/// Invalidate the whole TLB on this CPU.
#[cfg(target_os = "none")]
pub fn mmu_flush_tlb_all() {
    crate::arch::mmu::flush_tlb_all();
}

/// Load a new page-table root with the required barriers.
#[cfg(target_os = "none")]
pub fn mmu_switch_root(root: PhysAddr) {
    crate::arch::mmu::switch_root(root);
}

/// Read the architectural fault registers into a neutral record.
/// `raw_error` is the error code / syndrome the trap entry captured.
#[cfg(target_os = "none")]
pub fn mmu_parse_fault(raw_error: u64) -> PageFaultInfo {
    crate::arch::mmu::parse_fault(raw_error)
}

/// Whether a write-combining memory type has been programmed (PAT slot on
/// the x86 family, MAIR attribute on AArch64).
#[cfg(target_os = "none")]
pub fn write_combining_available() -> bool {
    crate::arch::mmu::write_combining_available()
}

#[cfg(not(target_os = "none"))]
pub fn mmu_flush_tlb(_vaddr: VirtAddr) {}

#[cfg(not(target_os = "none"))]
pub fn mmu_flush_tlb_all() {}

#[cfg(not(target_os = "none"))]
pub fn mmu_switch_root(_root: PhysAddr) {}

#[cfg(not(target_os = "none"))]
pub fn mmu_init() -> crate::error::KernelResult<()> {
    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn mmu_parse_fault(raw_error: u64) -> PageFaultInfo {
    PageFaultInfo {
        fault_addr: 0,
        is_present: false,
        is_write: false,
        is_user: false,
        is_exec: false,
        is_reserved: false,
        raw_error,
    }
}

#[cfg(not(target_os = "none"))]
pub fn write_combining_available() -> bool {
    false
}

#[cfg(not(target_os = "none"))]
pub fn enter_usermode(_entry: VirtAddr, _user_sp: VirtAddr) -> ! {
    unreachable!("user mode does not exist on hosted builds")
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Program the hardware timer to `hz` interrupts per second; `callback`
/// runs from the IRQ handler with interrupts masked and must not block.
pub fn timer_init(hz: u32, callback: Option<fn()>) -> crate::error::KernelResult<()> {
    crate::irq::timer_init(hz, callback)
}

pub fn timer_get_ticks() -> u64 {
    crate::irq::timer_ticks()
}

pub fn timer_get_frequency() -> u32 {
    crate::irq::timer_frequency()
}

// ---------------------------------------------------------------------------
// Syscall
// ---------------------------------------------------------------------------

static SYSCALL_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Register the single entry point invoked by user-mode trap instructions.
pub fn syscall_init(handler: SyscallHandler) {
    SYSCALL_HANDLER.store(handler as usize, Ordering::Release);
}

/// The registered syscall handler, if any.
pub fn syscall_handler() -> Option<SyscallHandler> {
    let raw = SYSCALL_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // SAFETY: The value was stored from a valid `SyscallHandler` fn
        // pointer in `syscall_init` and fn pointers are address-sized.
        Some(unsafe { core::mem::transmute::<usize, SyscallHandler>(raw) })
    }
}

// ---------------------------------------------------------------------------
// User mode
// ---------------------------------------------------------------------------

/// Drop to user privilege with interrupts enabled. Never returns.
#[cfg(target_os = "none")]
pub fn enter_usermode(entry: VirtAddr, user_sp: VirtAddr) -> ! {
    crate::arch::usermode::enter(entry, user_sp)
}

// ---------------------------------------------------------------------------
// MMIO accessors
// ---------------------------------------------------------------------------

macro_rules! mmio_accessors {
    ($read:ident, $write:ident, $ty:ty) => {
        /// Width-correct volatile MMIO read with the architecture's
        /// device-ordering barrier.
        ///
        /// # Safety
        ///
        /// `addr` must be a mapped device register of this width.
        pub unsafe fn $read(addr: VirtAddr) -> $ty {
            // SAFETY: Caller guarantees a valid device mapping.
            let v = unsafe { core::ptr::read_volatile(addr.as_u64() as *const $ty) };
            read_barrier();
            v
        }

        /// Width-correct volatile MMIO write with the architecture's
        /// device-ordering barrier.
        ///
        /// # Safety
        ///
        /// `addr` must be a mapped device register of this width.
        pub unsafe fn $write(addr: VirtAddr, value: $ty) {
            write_barrier();
            // SAFETY: Caller guarantees a valid device mapping.
            unsafe { core::ptr::write_volatile(addr.as_u64() as *mut $ty, value) };
        }
    };
}

mmio_accessors!(mmio_read8, mmio_write8, u8);
mmio_accessors!(mmio_read16, mmio_write16, u16);
mmio_accessors!(mmio_read32, mmio_write32, u32);
mmio_accessors!(mmio_read64, mmio_write64, u64);

// ---------------------------------------------------------------------------
// Barriers
// ---------------------------------------------------------------------------

/// Full fence: loads and stores before it are globally visible before any
/// after it.
#[inline(always)]
pub fn memory_barrier() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: Pure ordering barrier, no memory side effects.
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, nomem, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Load-only fence.
#[inline(always)]
pub fn read_barrier() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: Pure ordering barrier, no memory side effects.
    unsafe {
        core::arch::asm!("dsb ld", options(nostack, nomem, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
}

/// Store-only fence.
#[inline(always)]
pub fn write_barrier() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: Pure ordering barrier, no memory side effects.
    unsafe {
        core::arch::asm!("dsb st", options(nostack, nomem, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}

/// Pipeline synchronization: subsequent instruction fetches observe prior
/// stores (no-op on the strongly-ordered x86 family).
#[inline(always)]
pub fn instruction_barrier() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: Pure pipeline barrier, no memory side effects.
    unsafe {
        core::arch::asm!("isb", options(nostack, nomem, preserves_flags));
    }
}

// ---------------------------------------------------------------------------
// Port I/O (x86 family only)
// ---------------------------------------------------------------------------

#[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
pub use crate::arch::port::{
    port_read16, port_read32, port_read8, port_write16, port_write32, port_write8,
};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_save_restore_nests() {
        let outer = interrupt_save();
        let inner = interrupt_save();
        interrupt_restore(inner);
        interrupt_restore(outer);
    }

    #[test]
    fn test_syscall_handler_registration() {
        fn handler(num: u64, _args: &[u64; 6]) -> u64 {
            num + 1
        }
        syscall_init(handler);
        let h = syscall_handler().expect("handler registered");
        assert_eq!(h(41, &[0; 6]), 42);
    }

    #[test]
    fn test_barriers_are_callable() {
        memory_barrier();
        read_barrier();
        write_barrier();
        instruction_barrier();
    }
}
