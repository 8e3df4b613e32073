//! Memory management
//!
//! Address newtypes, the architecture-neutral page flag set, and the
//! submodules that make up the memory core: PTE codecs ([`pte`]), the
//! physical frame allocator ([`pmm`]), the generic table walker
//! ([`walker`]), the virtual memory manager ([`vmm`]) and the kernel heap
//! ([`heap`]).

pub mod heap;
pub mod pmm;
pub mod pte;
#[cfg(all(test, not(target_os = "none")))]
pub mod testutil;
pub mod vmm;
pub mod walker;

use bitflags::bitflags;

/// Size of a page and of a physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Sentinel for "no frame" / allocation failure.
    pub const INVALID: PhysAddr = PhysAddr(u64::MAX);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    /// Page frame number: `paddr / PAGE_SIZE`.
    pub const fn frame(self) -> u64 {
        self.0 / PAGE_SIZE as u64
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn offset(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Sentinel for "no address".
    pub const INVALID: VirtAddr = VirtAddr(u64::MAX);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    pub const fn offset(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Handle to an address space: the physical address of its top-level page
/// table. Two values are reserved and never returned by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AddrSpace(pub u64);

impl AddrSpace {
    /// No address space.
    pub const INVALID: AddrSpace = AddrSpace(u64::MAX);
    /// The address space the MMU is using right now.
    pub const CURRENT: AddrSpace = AddrSpace(u64::MAX - 1);

    pub const fn new(root: PhysAddr) -> Self {
        Self(root.0)
    }

    pub const fn root(self) -> PhysAddr {
        PhysAddr(self.0)
    }

    pub const fn is_handle(self) -> bool {
        self.0 != Self::INVALID.0 && self.0 != Self::CURRENT.0
    }
}

bitflags! {
    /// Architecture-neutral page flags. Each PTE codec maps these onto its
    /// hardware encoding; `COW` always lands in a software-available bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT   = 1 << 0;
        const WRITE     = 1 << 1;
        const USER      = 1 << 2;
        const EXEC      = 1 << 3;
        const NOCACHE   = 1 << 4;
        const WRITECOMB = 1 << 5;
        const COW       = 1 << 6;
        const DIRTY     = 1 << 7;
        const ACCESSED  = 1 << 8;
    }
}

impl PageFlags {
    /// Flags for a kernel data mapping.
    pub const KERNEL_DATA: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITE);

    /// Flags for an MMIO mapping.
    pub const MMIO: PageFlags = PageFlags::PRESENT
        .union(PageFlags::WRITE)
        .union(PageFlags::NOCACHE);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_addr_alignment() {
        let a = PhysAddr::new(0x1234);
        assert!(!a.is_page_aligned());
        assert_eq!(a.align_down(), PhysAddr::new(0x1000));
        assert_eq!(a.frame(), 1);
        assert_eq!(VirtAddr::new(0x5678).page_offset(), 0x678);
    }

    #[test]
    fn test_sentinels_distinct() {
        assert!(!PhysAddr::INVALID.is_valid());
        assert!(AddrSpace::INVALID != AddrSpace::CURRENT);
        assert!(!AddrSpace::INVALID.is_handle());
        assert!(!AddrSpace::CURRENT.is_handle());
        assert!(AddrSpace::new(PhysAddr::new(0x1000)).is_handle());
    }
}
