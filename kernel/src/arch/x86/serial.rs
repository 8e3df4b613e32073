//! 16550 serial port (COM1), driven through raw port I/O.

use spin::Mutex;

const COM1: u16 = 0x3F8;

static PORT: Mutex<()> = Mutex::new(());

pub fn init() {
    let _guard = PORT.lock();
    // SAFETY: Standard 16550 setup on COM1: disable interrupts, program
    // 38400 baud, 8N1, enable and clear the FIFOs.
    unsafe {
        super::port::port_write8(COM1 + 1, 0x00);
        super::port::port_write8(COM1 + 3, 0x80);
        super::port::port_write8(COM1, 0x03);
        super::port::port_write8(COM1 + 1, 0x00);
        super::port::port_write8(COM1 + 3, 0x03);
        super::port::port_write8(COM1 + 2, 0xC7);
        super::port::port_write8(COM1 + 4, 0x0B);
    }
}

pub fn put_byte(byte: u8) {
    let _guard = PORT.lock();
    // SAFETY: Poll the line-status THR-empty bit, then write the data
    // register.
    unsafe {
        while super::port::port_read8(COM1 + 5) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        super::port::port_write8(COM1, byte);
    }
}
