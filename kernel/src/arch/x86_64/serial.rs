//! 16550 serial port (COM1).

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port is exclusively
        // owned by this driver.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

pub fn init() {
    lazy_static::initialize(&COM1);
}

pub fn put_byte(byte: u8) {
    COM1.lock().send(byte);
}
