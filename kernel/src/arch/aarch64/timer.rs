//! EL1 physical generic timer (CNTP).

use core::sync::atomic::{AtomicU64, Ordering};

/// The timer interrupt is PPI 30 on the virt machine.
pub const TIMER_IRQ: u32 = 30;

/// Countdown value re-armed on every tick.
static INTERVAL: AtomicU64 = AtomicU64::new(0);

/// Program the countdown for `hz` interrupts per second and enable the
/// timer.
pub fn start(hz: u32) {
    let cntfrq: u64;
    // SAFETY: CNTFRQ_EL0 is a read-only frequency register.
    unsafe { core::arch::asm!("mrs {}, CNTFRQ_EL0", out(reg) cntfrq) };
    let interval = cntfrq / hz.max(1) as u64;
    INTERVAL.store(interval, Ordering::Relaxed);

    // SAFETY: Writing the countdown and enabling the timer (ENABLE=1,
    // IMASK=0) are the documented CNTP programming steps.
    unsafe {
        core::arch::asm!("msr CNTP_TVAL_EL0, {}", in(reg) interval);
        core::arch::asm!("msr CNTP_CTL_EL0, {}", in(reg) 1u64);
    }
    log::info!("timer: generic timer at {} Hz (interval {})", hz, interval);
}

/// The CNTP countdown is one-shot per expiry: write the interval back
/// before the callback runs so no tick window is lost.
pub fn rearm() {
    let interval = INTERVAL.load(Ordering::Relaxed);
    // SAFETY: TVAL write restarts the countdown.
    unsafe { core::arch::asm!("msr CNTP_TVAL_EL0, {}", in(reg) interval) };
}
