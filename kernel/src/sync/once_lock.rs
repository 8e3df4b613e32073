//! Safe global initialization
//!
//! Replacements for `static mut` globals: [`OnceLock`] for values written
//! exactly once and read without locking afterwards, and [`GlobalState`] for
//! mutable singletons behind a `spin::Mutex`.

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

/// A cell that can be written to only once.
///
/// Works like `std::sync::OnceLock` but in a no_std environment. The value is
/// boxed so that `get` can hand out `&'static T` references.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    /// Create a new empty cell.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was produced by `Box::into_raw` in
            // `set`. The Acquire load pairs with the Release store there, so
            // the pointee is fully initialized. The allocation is never freed
            // while the OnceLock lives, so 'static is sound.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns the value back if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from `Box::into_raw` above and nobody
                // else has seen it (the exchange failed), so reclaiming the
                // box is the only way to avoid leaking it.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The inner value is reached only through the AtomicPtr with
// Acquire/Release ordering; transferring the lock transfers ownership of the
// boxed value.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `set` publishes the value at most once via compare_exchange, and
// `get` hands out shared references only, so T: Send + Sync suffices.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: `&mut self` gives exclusive access; the pointer was
            // created by `Box::into_raw` in `set`.
            unsafe {
                let _ = alloc::boxed::Box::from_raw(ptr);
            }
        }
    }
}

/// Mutable global state behind a `spin::Mutex`.
///
/// Starts out uninitialized; `init` installs the value, `with`/`with_mut`
/// run a closure against it and return `None` when called before `init`.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state. Fails if already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Run a closure against a shared reference to the value.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run a closure against a mutable reference to the value.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }

    /// Whether `init` has run.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_once_lock_single_init() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.get(), Some(&7));
        assert_eq!(cell.set(9), Err(9));
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn test_global_state_lifecycle() {
        let state: GlobalState<u32> = GlobalState::new();
        assert!(state.with(|v| *v).is_none());
        state.init(1).expect("first init should succeed");
        assert_eq!(state.with(|v| *v), Some(1));
        state.with_mut(|v| *v += 1);
        assert_eq!(state.with(|v| *v), Some(2));
        assert!(state.init(5).is_err());
    }
}
