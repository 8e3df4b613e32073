//! Raw port I/O, x86 family only.

use x86_64::instructions::port::Port;

/// # Safety
///
/// Reading a port can have device side effects; the caller must own the
/// device at `port`.
pub unsafe fn port_read8(port: u16) -> u8 {
    // SAFETY: Forwarded to the caller.
    unsafe { Port::new(port).read() }
}

/// # Safety
///
/// See [`port_read8`].
pub unsafe fn port_read16(port: u16) -> u16 {
    // SAFETY: Forwarded to the caller.
    unsafe { Port::new(port).read() }
}

/// # Safety
///
/// See [`port_read8`].
pub unsafe fn port_read32(port: u16) -> u32 {
    // SAFETY: Forwarded to the caller.
    unsafe { Port::new(port).read() }
}

/// # Safety
///
/// Writing a port programs the device at `port`; the caller must own it.
pub unsafe fn port_write8(port: u16, value: u8) {
    // SAFETY: Forwarded to the caller.
    unsafe { Port::new(port).write(value) }
}

/// # Safety
///
/// See [`port_write8`].
pub unsafe fn port_write16(port: u16, value: u16) {
    // SAFETY: Forwarded to the caller.
    unsafe { Port::new(port).write(value) }
}

/// # Safety
///
/// See [`port_write8`].
pub unsafe fn port_write32(port: u16, value: u32) {
    // SAFETY: Forwarded to the caller.
    unsafe { Port::new(port).write(value) }
}
