//! Bare-metal test framework
//!
//! Test binaries for the QEMU targets report over serial and exit through
//! the debug-exit device (x86 family) or PSCI (AArch64). Host-target unit
//! tests use the standard harness and never touch this module's runner.

use core::panic::PanicInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Trait that all bare-metal testable functions implement.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}

/// Custom test runner for bare-metal test binaries.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    crate::serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    crate::serial_println!("All tests passed");
    exit_qemu(QemuExitCode::Success)
}

/// Panic handler for test mode: report and exit with failure.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    crate::serial_println!("[failed]");
    crate::serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed)
}

/// Exit QEMU with the given code.
pub fn exit_qemu(_exit_code: QemuExitCode) -> ! {
    #[cfg(all(target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
    // SAFETY: Port 0xF4 is the QEMU isa-debug-exit device; the write
    // terminates the VM.
    unsafe {
        crate::arch::port::port_write32(0xF4, _exit_code as u32);
    }

    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    // SAFETY: PSCI SYSTEM_OFF via HVC powers off the virt machine.
    unsafe {
        core::arch::asm!(
            "mov w0, {psci_off:w}",
            "hvc #0",
            psci_off = in(reg) 0x8400_0008u32,
            options(noreturn)
        );
    }

    #[allow(unreachable_code)]
    loop {
        core::hint::spin_loop();
    }
}
