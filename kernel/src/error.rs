//! Kernel error types
//!
//! One structured error enum for the whole core. Variants carry enough
//! context to be logged without string formatting at the call site.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frame or page table could be allocated.
    OutOfMemory {
        requested: usize,
    },
    /// Misaligned or out-of-range address argument.
    InvalidAddress {
        addr: u64,
    },
    /// Lookup/unmap on an address with no mapping.
    NotMapped {
        addr: u64,
    },
    /// The platform has no resource of the requested kind
    /// (e.g. a logical IRQ with no physical line).
    NotSupported {
        what: &'static str,
    },
    /// `free_frame` on a frame that is already free.
    DoubleFree {
        frame: u64,
    },
    /// A bitmap or page-table self-check failed; the operation was refused.
    CorruptionDetected {
        subsystem: &'static str,
        detail: &'static str,
    },
    /// Operation refused on a protected frame or the active address space.
    ResourceBusy {
        what: &'static str,
    },
    /// A fixed-capacity table (protected registry, boot-info regions) is full.
    ResourceExhausted {
        resource: &'static str,
    },
    /// Argument outside its documented domain.
    InvalidArgument {
        name: &'static str,
    },
    /// Subsystem entry point called before its `init`.
    NotInitialized {
        subsystem: &'static str,
    },
    /// A user-mode fault that could not be resolved; carries the signal the
    /// task layer should deliver.
    UserFault {
        signal: u32,
        addr: u64,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} frames)", requested)
            }
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {:#x}", addr)
            }
            KernelError::NotMapped { addr } => {
                write!(f, "address {:#x} is not mapped", addr)
            }
            KernelError::NotSupported { what } => {
                write!(f, "{} not supported on this platform", what)
            }
            KernelError::DoubleFree { frame } => {
                write!(f, "double free of frame {:#x}", frame)
            }
            KernelError::CorruptionDetected { subsystem, detail } => {
                write!(f, "corruption detected in {}: {}", subsystem, detail)
            }
            KernelError::ResourceBusy { what } => write!(f, "{} is busy", what),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "{} exhausted", resource)
            }
            KernelError::InvalidArgument { name } => {
                write!(f, "invalid argument: {}", name)
            }
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
            KernelError::UserFault { signal, addr } => {
                write!(f, "unresolvable user fault at {:#x} (signal {})", addr, signal)
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = KernelError::NotMapped { addr: 0x4000 };
        let mut buf = alloc::string::String::new();
        use core::fmt::Write;
        write!(buf, "{}", e).expect("formatting a kernel error should not fail");
        assert!(buf.contains("0x4000"));
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            KernelError::DoubleFree { frame: 3 },
            KernelError::DoubleFree { frame: 3 }
        );
        assert_ne!(
            KernelError::DoubleFree { frame: 3 },
            KernelError::DoubleFree { frame: 4 }
        );
    }
}
