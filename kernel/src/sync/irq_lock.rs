//! Interrupt-disabling spinlock
//!
//! The PMM and VMM critical sections must run with interrupts disabled so
//! that an IRQ handler can never observe (or deadlock on) a half-updated
//! bitmap or page table. [`IrqMutex`] couples a `spin::Mutex` with the
//! interrupt save/restore pair: the flags are saved and interrupts disabled
//! before spinning, and the saved state is restored when the guard drops.
//!
//! Lock ordering: when both core locks are needed, the VMM lock is taken
//! first, then the PMM lock.

use core::ops::{Deref, DerefMut};

use crate::hal::{self, IrqToken};

/// A spinlock whose critical section runs with interrupts disabled.
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqMutex<T> {
    /// Create a new lock wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Save and disable interrupts, then acquire the lock.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let token = hal::interrupt_save();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            token,
        }
    }
}

/// Guard returned by [`IrqMutex::lock`]. Releases the lock and restores the
/// saved interrupt state on drop, in that order.
pub struct IrqMutexGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    token: IrqToken,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the spinlock before re-enabling interrupts so a handler
        // that fires immediately cannot spin on a lock we still hold.
        self.guard.take();
        hal::interrupt_restore(self.token);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_lock_roundtrip() {
        let m = IrqMutex::new(41u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
    }
}
