//! PL011 UART on the QEMU virt machine.

/// UART0 data register, identity-covered by the boot mapping and later by
/// the kernel linear map.
const UART0_DR: u64 = 0x0900_0000;
/// Flag register; bit 5 = TX FIFO full.
const UART0_FR: u64 = 0x0900_0018;

/// QEMU's PL011 comes up usable; nothing to program for early boot output.
pub fn init() {}

pub fn put_byte(byte: u8) {
    // SAFETY: Fixed PL011 MMIO registers on the virt machine; volatile
    // accesses with a bounded busy-wait on the FIFO-full flag.
    unsafe {
        while core::ptr::read_volatile(UART0_FR as *const u32) & (1 << 5) != 0 {
            core::hint::spin_loop();
        }
        core::ptr::write_volatile(UART0_DR as *mut u32, byte as u32);
    }
}
