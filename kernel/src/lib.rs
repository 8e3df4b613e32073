//! nova kernel library
//!
//! The memory and trap core of a small multi-architecture kernel:
//! hardware abstraction ([`hal`]), physical and virtual memory management
//! ([`mm`]), the trap/exception dispatcher ([`trap`]), and IRQ routing
//! ([`irq`]). Compiles for x86-64, AArch64, and 32-bit x86 bare-metal
//! targets; on hosted targets the pure logic builds against `std` so the
//! unit tests run under the standard harness.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Host target: link std so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

/// Global kernel heap; backed by PMM frames in `mm::heap::init`.
#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod error;
pub mod hal;
pub mod irq;
pub mod mm;
pub mod sched;
#[cfg(feature = "self-test")]
pub mod selftest;
pub mod serial;
pub mod sync;
pub mod test_framework;
pub mod trap;

// Re-exports for tests and external collaborators.
pub use error::{KernelError, KernelResult};
pub use mm::{AddrSpace, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
