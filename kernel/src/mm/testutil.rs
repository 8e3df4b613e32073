//! Host-test support: a page-table arena backed by heap memory.
//!
//! "Physical" addresses are offsets into a leaked, page-aligned buffer, so
//! the PMM, the walker, and the address-space logic can all be exercised on
//! the build host exactly as they run on target.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::pmm::FrameAllocator;
use super::walker::TableSource;
use super::{PhysAddr, PAGE_SIZE};

#[repr(align(4096))]
#[derive(Clone)]
struct Page([u8; PAGE_SIZE]);

/// A simulated bank of physical memory with its own frame allocator.
pub struct TestArena {
    base: *mut u8,
    pub frames: usize,
    pub pmm: FrameAllocator,
}

impl TestArena {
    pub fn new(frames: usize) -> Self {
        let mut pages = Vec::new();
        pages.resize(frames, Page([0u8; PAGE_SIZE]));
        let buf: &'static mut [Page] = Box::leak(pages.into_boxed_slice());
        let base = buf.as_mut_ptr() as *mut u8;

        let bitmap: &'static mut [u64] =
            Box::leak(alloc::vec![0u64; frames.div_ceil(64)].into_boxed_slice());
        let refcounts: &'static mut [u16] =
            Box::leak(alloc::vec![0u16; frames].into_boxed_slice());

        let pmm = FrameAllocator::new();
        // SAFETY: The leaked tables are exclusively owned by this PMM, and
        // `base + paddr` is valid for every arena frame.
        unsafe {
            pmm.init_raw(
                bitmap.as_mut_ptr(),
                refcounts.as_mut_ptr(),
                frames as u64,
                base as u64,
            );
        }
        pmm.release_range(PhysAddr::new(0), (frames * PAGE_SIZE) as u64);

        Self { base, frames, pmm }
    }

    /// Pointer to the first byte of an arena frame.
    pub fn frame_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        assert!((paddr.as_u64() as usize) < self.frames * PAGE_SIZE);
        // SAFETY: Asserted in range.
        unsafe { self.base.add(paddr.as_u64() as usize) }
    }
}

impl TableSource for TestArena {
    fn alloc_table(&self) -> KernelResult<PhysAddr> {
        let p = self.pmm.alloc_frame();
        if p.is_valid() {
            Ok(p)
        } else {
            Err(KernelError::OutOfMemory { requested: 1 })
        }
    }

    fn free_table(&self, paddr: PhysAddr) {
        let _ = self.pmm.free_frame(paddr);
    }

    fn table_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        self.frame_ptr(paddr)
    }
}

/// A table source that starts failing after a budget of allocations; used to
/// drive the clone-rollback paths.
pub struct FailingSource<'a> {
    pub arena: &'a TestArena,
    budget: core::cell::Cell<usize>,
}

impl<'a> FailingSource<'a> {
    pub fn new(arena: &'a TestArena, budget: usize) -> Self {
        Self {
            arena,
            budget: core::cell::Cell::new(budget),
        }
    }
}

impl TableSource for FailingSource<'_> {
    fn alloc_table(&self) -> KernelResult<PhysAddr> {
        if self.budget.get() == 0 {
            return Err(KernelError::OutOfMemory { requested: 1 });
        }
        self.budget.set(self.budget.get() - 1);
        self.arena.alloc_table()
    }

    fn free_table(&self, paddr: PhysAddr) {
        self.arena.free_table(paddr)
    }

    fn table_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        self.arena.table_ptr(paddr)
    }
}
