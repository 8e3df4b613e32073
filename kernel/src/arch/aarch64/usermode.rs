//! Transition to EL0.

use crate::mm::VirtAddr;

/// Drop to EL0 at `entry` with `user_sp`, interrupts enabled
/// (SPSR DAIF clear, EL0t). Never returns.
pub fn enter(entry: VirtAddr, user_sp: VirtAddr) -> ! {
    // SAFETY: Sets the EL0 stack, return address, and processor state,
    // then eret leaves EL1 for good.
    unsafe {
        core::arch::asm!(
            "msr SP_EL0, {sp}",
            "msr ELR_EL1, {entry}",
            "msr SPSR_EL1, xzr",
            "eret",
            sp = in(reg) user_sp.as_u64(),
            entry = in(reg) entry.as_u64(),
            options(noreturn)
        );
    }
}
