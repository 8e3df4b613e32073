//! Kernel heap bring-up
//!
//! Backs the global `linked_list_allocator` heap with a contiguous run of
//! PMM frames reached through the kernel linear map. The heap serves the
//! kernel's own collections and boxes; it sits above the PMM and is a
//! collaborator of the memory core, not part of it.

use crate::error::KernelResult;

#[cfg(target_os = "none")]
use super::pmm::FRAME_ALLOCATOR;
#[cfg(target_os = "none")]
use super::PAGE_SIZE;

/// Kernel heap size: 4 MiB.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Allocate the backing frames and hand them to the global allocator.
/// Must run after `pmm::init` and before the first heap allocation.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    let frames = (HEAP_SIZE / PAGE_SIZE) as u64;
    let base = FRAME_ALLOCATOR.alloc_frames(frames);
    if !base.is_valid() {
        return Err(crate::error::KernelError::OutOfMemory {
            requested: frames as usize,
        });
    }

    let bottom = super::vmm::phys_to_virt(base).as_u64() as *mut u8;
    // SAFETY: The frames were just allocated and are covered by the linear
    // map; the allocator takes exclusive ownership of the range.
    unsafe {
        crate::ALLOCATOR.lock().init(bottom, HEAP_SIZE);
    }
    log::info!("heap: {} KiB at {:#x}", HEAP_SIZE / 1024, bottom as usize);
    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn init() -> KernelResult<()> {
    // Host builds use the system allocator.
    Ok(())
}
