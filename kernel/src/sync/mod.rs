//! Synchronization primitives
//!
//! Global-state cells that avoid `static mut`, and the interrupt-disabling
//! spinlock used by the PMM and VMM critical sections.

pub mod irq_lock;
pub mod once_lock;

pub use irq_lock::{IrqMutex, IrqMutexGuard};
pub use once_lock::{GlobalState, OnceLock};
