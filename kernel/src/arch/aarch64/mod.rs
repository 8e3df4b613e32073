//! AArch64 backend for the QEMU virt machine: EL1 vector table, TTBR0/1
//! split paging, GICv2, the generic timer, PL011 serial.

pub mod cpu;
pub mod gic;
pub mod mmu;
pub mod serial;
pub mod timer;
pub mod trap;
pub mod usermode;

pub use gic as intc;
