//! Serial diagnostic sink
//!
//! Early boot, panic, and log output all funnel through the platform UART
//! (16550 on the x86 family, PL011 on AArch64). Two raw helpers are exported
//! for contexts where the formatting machinery cannot be trusted (panic,
//! double fault): [`serial_puts`] and [`serial_put_hex64`].
//!
//! The [`log`] facade is backed by the same sink; `init_logging` installs it
//! once the UART works.

use core::fmt;

use log::{Level, LevelFilter, Metadata, Record};

/// Write a raw string to the UART. Safe to call from panic paths.
pub fn serial_puts(s: &str) {
    #[cfg(target_os = "none")]
    for b in s.bytes() {
        crate::arch::serial::put_byte(b);
    }
    #[cfg(not(target_os = "none"))]
    let _ = s;
}

/// Write a 64-bit value as 16 hex digits. Safe to call from panic paths.
pub fn serial_put_hex64(value: u64) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    serial_puts("0x");
    let mut shift = 64;
    while shift > 0 {
        shift -= 4;
        let nibble = ((value >> shift) & 0xF) as usize;
        let digit = [DIGITS[nibble]];
        // Single ASCII byte, always valid UTF-8.
        serial_puts(core::str::from_utf8(&digit).unwrap_or("?"));
    }
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        serial_puts(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // The UART backends tolerate concurrent writers (worst case interleaved
    // characters), which is preferable to taking a lock on the panic path.
    let _ = SerialWriter.write_fmt(args);
}

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info || cfg!(debug_assertions)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::kprintln!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial-backed `log` implementation.
///
/// Called once during early boot, after the UART has been initialized.
/// Logging before this point is dropped by the facade, not buffered.
pub fn init_logging() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}
