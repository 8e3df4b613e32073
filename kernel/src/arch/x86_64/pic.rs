//! Legacy 8259 PIC pair as the interrupt controller.
//!
//! IRQs 0-15 are remapped to vectors 32-47. The PIC identifies the IRQ by
//! vector, so acknowledgment happens in the trap path; this module manages
//! masks, spurious filtering, and EOI.

use pic8259::ChainedPics;
use spin::Mutex;

use super::trap::IRQ_BASE;

/// Number of IRQ lines the controller advertises.
pub const MAX_IRQS: u32 = 16;

/// IRQ reported for spurious interrupts on each chip.
const SPURIOUS_MASTER: u32 = 7;
const SPURIOUS_SLAVE: u32 = 15;

// SAFETY: The standard offsets 32/40 are above the exception range.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(IRQ_BASE, IRQ_BASE + 8) });

/// Remap both chips and mask every line; the router unmasks lines as
/// handlers register.
pub fn init() {
    // SAFETY: Standard PIC initialization sequence on the well-known ports.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0xFF, 0xFF);
    }
    log::info!("intc: 8259 PIC remapped to vectors {}..{}", IRQ_BASE, IRQ_BASE + 16);
}

pub fn enable_irq(irq: u32) {
    if irq >= MAX_IRQS {
        return;
    }
    let mut pics = PICS.lock();
    // SAFETY: Reading the current masks has no side effects.
    let [mut master, mut slave] = unsafe { pics.read_masks() };
    if irq < 8 {
        master &= !(1 << irq);
    } else {
        slave &= !(1 << (irq - 8));
        // Cascade line for the slave chip.
        master &= !(1 << 2);
    }
    // SAFETY: Mask writes only gate delivery.
    unsafe { pics.write_masks(master, slave) };
}

pub fn disable_irq(irq: u32) {
    if irq >= MAX_IRQS {
        return;
    }
    let mut pics = PICS.lock();
    // SAFETY: As in `enable_irq`.
    let [mut master, mut slave] = unsafe { pics.read_masks() };
    if irq < 8 {
        master |= 1 << irq;
    } else {
        slave |= 1 << (irq - 8);
    }
    // SAFETY: As in `enable_irq`.
    unsafe { pics.write_masks(master, slave) };
}

/// The PIC has no priority registers; delivery order is fixed by line
/// number. Kept for interface parity with the GIC.
pub fn set_priority(_irq: u32, _priority: u8) {}

/// Check a spurious IRQ 7/15: the in-service register bit is clear for a
/// spurious interrupt.
pub fn is_spurious(irq: u32) -> bool {
    if irq != SPURIOUS_MASTER && irq != SPURIOUS_SLAVE {
        return false;
    }
    let (cmd_port, bit) = if irq == SPURIOUS_MASTER {
        (0x20u16, 7u8)
    } else {
        (0xA0u16, 7u8)
    };
    // SAFETY: OCW3 "read ISR" followed by a read of the same port; a
    // documented, side-effect-free PIC query.
    let isr = unsafe {
        super::port::port_write8(cmd_port, 0x0B);
        super::port::port_read8(cmd_port)
    };
    isr & (1 << bit) == 0
}

pub fn eoi(irq: u32) {
    if irq >= MAX_IRQS {
        return;
    }
    // Spurious slave IRQs still require an EOI on the master (cascade).
    if irq == SPURIOUS_SLAVE && is_spurious(irq) {
        // SAFETY: Master EOI only.
        unsafe { PICS.lock().notify_end_of_interrupt(IRQ_BASE + 2) };
        return;
    }
    if irq == SPURIOUS_MASTER && is_spurious(irq) {
        return;
    }
    // SAFETY: EOI for the vector the IRQ was delivered on.
    unsafe { PICS.lock().notify_end_of_interrupt(IRQ_BASE + irq as u8) };
}
