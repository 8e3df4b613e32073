//! 32-bit x86 CPU bring-up and EFLAGS primitives.

/// Enable SSE. Safe to call more than once.
pub fn init() {
    // SAFETY: The architectural SSE-enable sequence: CR0.EM off, CR0.MP on,
    // CR4.OSFXSR and CR4.OSXMMEXCPT on.
    unsafe {
        use x86::controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4};
        let mut c0 = cr0();
        c0.remove(Cr0::CR0_EMULATE_COPROCESSOR);
        c0.insert(Cr0::CR0_MONITOR_COPROCESSOR);
        cr0_write(c0);
        let mut c4 = cr4();
        c4.insert(Cr4::CR4_ENABLE_SSE | Cr4::CR4_UNMASKED_SSE);
        cr4_write(c4);
    }
}

/// Logical CPU id; this kernel runs one CPU.
pub fn id() -> u32 {
    0
}

/// Sleep until the next enabled interrupt.
pub fn halt() {
    // SAFETY: hlt waits for an interrupt; it resumes on delivery.
    unsafe { x86::halt() };
}

pub fn irq_enable() {
    // SAFETY: sti only changes the interrupt flag.
    unsafe { x86::irq::enable() };
}

pub fn irq_disable() {
    // SAFETY: cli only changes the interrupt flag.
    unsafe { x86::irq::disable() };
}

/// Save EFLAGS and disable interrupts; the token is the saved EFLAGS.
pub fn irq_save() -> u64 {
    let flags: u32;
    // SAFETY: pushfd/pop reads EFLAGS; cli only clears the interrupt flag.
    unsafe {
        core::arch::asm!("pushfd", "pop {}", out(reg) flags);
        x86::irq::disable();
    }
    flags as u64
}

/// Restore the interrupt flag from a token produced by [`irq_save`].
pub fn irq_restore(token: u64) {
    const IF: u64 = 1 << 9;
    if token & IF != 0 {
        // SAFETY: As in `irq_enable`.
        unsafe { x86::irq::enable() };
    }
}
