//! Programmable interval timer (PIT channel 0).

use super::port;

const PIT_CLOCK: u32 = 1_193_182;

/// Physical IRQ line of the timer.
pub const TIMER_IRQ: u32 = 0;

/// Program channel 0 as a rate generator at `hz`.
pub fn start(hz: u32) {
    let divisor = (PIT_CLOCK / hz.max(19)).clamp(1, 65535) as u16;
    // SAFETY: Command 0x36 = channel 0, lobyte/hibyte, mode 2.
    unsafe {
        port::port_write8(0x43, 0x36);
        port::port_write8(0x40, (divisor & 0xFF) as u8);
        port::port_write8(0x40, (divisor >> 8) as u8);
    }
    log::info!("timer: PIT at {} Hz (divisor {})", hz, divisor);
}

/// The rate generator reloads itself; nothing to re-arm per tick.
pub fn rearm() {}
