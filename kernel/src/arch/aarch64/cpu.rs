//! AArch64 CPU bring-up and DAIF primitives.

use cortex_a::asm;

/// Enable FP/SIMD access from EL1 and EL0. Safe to call more than once.
pub fn init() {
    // SAFETY: CPACR_EL1.FPEN = 0b11 removes the FP/SIMD trap; the isb makes
    // the change visible to subsequent instructions.
    unsafe {
        core::arch::asm!(
            "mrs {tmp}, CPACR_EL1",
            "orr {tmp}, {tmp}, #(0x3 << 20)",
            "msr CPACR_EL1, {tmp}",
            "isb",
            tmp = out(reg) _,
        );
    }
}

/// Affinity level 0 of MPIDR_EL1; core 0 on the virt machine.
pub fn id() -> u32 {
    let mpidr: u64;
    // SAFETY: MPIDR_EL1 is a read-only identification register.
    unsafe { core::arch::asm!("mrs {}, MPIDR_EL1", out(reg) mpidr) };
    (mpidr & 0xFF) as u32
}

/// Wait for an interrupt.
pub fn halt() {
    asm::wfi();
}

pub fn irq_enable() {
    // SAFETY: Clearing the I bit unmasks IRQs; no memory effects.
    unsafe { core::arch::asm!("msr DAIFClr, #2", options(nostack, nomem)) };
}

pub fn irq_disable() {
    // SAFETY: Setting the I bit masks IRQs; no memory effects.
    unsafe { core::arch::asm!("msr DAIFSet, #2", options(nostack, nomem)) };
}

/// Save DAIF and mask IRQs; the token is the saved DAIF value.
pub fn irq_save() -> u64 {
    let daif: u64;
    // SAFETY: Read-then-mask of the interrupt flags; no memory effects.
    unsafe {
        core::arch::asm!("mrs {}, DAIF", out(reg) daif);
        core::arch::asm!("msr DAIFSet, #2", options(nostack, nomem));
    }
    daif
}

/// Restore a DAIF value saved by [`irq_save`].
pub fn irq_restore(token: u64) {
    // SAFETY: Restores the exact flags that were saved on this CPU.
    unsafe { core::arch::asm!("msr DAIF, {}", in(reg) token, options(nostack, nomem)) };
}
