//! x86-64 CPU bring-up and interrupt-flag primitives.

use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
use x86_64::registers::model_specific::{Efer, EferFlags};
use x86_64::registers::rflags::{self, RFlags};

/// Enable SSE and the NX bit. Safe to call more than once.
pub fn init() {
    // SAFETY: Setting MP/clearing EM and enabling OSFXSR/OSXMMEXCPT is the
    // architectural SSE-enable sequence; NXE makes the page-table NX bit
    // effective. All are privileged writes with no memory side effects.
    unsafe {
        Cr0::update(|f| {
            f.remove(Cr0Flags::EMULATE_COPROCESSOR);
            f.insert(Cr0Flags::MONITOR_COPROCESSOR);
        });
        Cr4::update(|f| {
            f.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        });
        Efer::update(|f| {
            f.insert(EferFlags::NO_EXECUTE_ENABLE);
        });
    }
}

/// Logical CPU id; this kernel runs one CPU.
pub fn id() -> u32 {
    0
}

/// Sleep until the next enabled interrupt.
pub fn halt() {
    x86_64::instructions::hlt();
}

pub fn irq_enable() {
    x86_64::instructions::interrupts::enable();
}

pub fn irq_disable() {
    x86_64::instructions::interrupts::disable();
}

/// Save RFLAGS and disable interrupts; the token is the saved RFLAGS value.
pub fn irq_save() -> u64 {
    let flags = rflags::read_raw();
    x86_64::instructions::interrupts::disable();
    flags
}

/// Restore the interrupt flag from a token produced by [`irq_save`].
pub fn irq_restore(token: u64) {
    if RFlags::from_bits_truncate(token).contains(RFlags::INTERRUPT_FLAG) {
        x86_64::instructions::interrupts::enable();
    }
}
