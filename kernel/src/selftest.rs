//! End-of-boot invariant checks
//!
//! With the `self-test` feature enabled, `run()` exercises the live PMM
//! and VMM after init and panics on any accounting violation. Useful when
//! bringing up a new board or bootloader.

use crate::mm::pmm::FRAME_ALLOCATOR;
use crate::mm::{vmm, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};

pub fn run() {
    frame_accounting_roundtrip();
    space_lifecycle_leaks_nothing();
    map_unmap_roundtrip();
    crate::kprintln!("selftest: all checks passed");
}

/// Allocate a batch of frames and free them; the free count must return
/// to its starting value with no duplicates handed out.
fn frame_accounting_roundtrip() {
    let before = FRAME_ALLOCATOR.get_info().free_frames;
    let mut frames = [PhysAddr::INVALID; 32];
    for slot in frames.iter_mut() {
        *slot = FRAME_ALLOCATOR.alloc_frame();
        assert!(slot.is_valid(), "selftest: allocation failed");
    }
    for (i, frame) in frames.iter().enumerate() {
        assert!(
            !frames[..i].contains(frame),
            "selftest: duplicate frame handed out"
        );
    }
    for frame in frames {
        FRAME_ALLOCATOR
            .free_frame(frame)
            .expect("selftest: free of allocated frame");
    }
    assert_eq!(
        FRAME_ALLOCATOR.get_info().free_frames,
        before,
        "selftest: frame accounting drifted"
    );
}

/// Create and destroy an address space; no frames may leak and the root
/// must come and go from the protected registry.
fn space_lifecycle_leaks_nothing() {
    let before = FRAME_ALLOCATOR.get_info().free_frames;
    let space = vmm::create_space().expect("selftest: create_space");
    assert!(FRAME_ALLOCATOR.is_protected(space.root()));
    vmm::destroy_space(space).expect("selftest: destroy_space");
    assert!(!FRAME_ALLOCATOR.is_protected(space.root()));
    assert_eq!(
        FRAME_ALLOCATOR.get_info().free_frames,
        before,
        "selftest: space lifecycle leaked frames"
    );
}

/// Map, query, and unmap a probe page in the MMIO window (guaranteed
/// unused virtual space).
fn map_unmap_roundtrip() {
    let frame = FRAME_ALLOCATOR.alloc_frame();
    let probe = VirtAddr::new(
        crate::arch::mmu::MMIO_BASE + crate::arch::mmu::MMIO_WINDOW_SIZE - PAGE_SIZE as u64,
    );
    vmm::map_page(probe, frame, PageFlags::KERNEL_DATA).expect("selftest: map");
    let (mapped, flags) = vmm::query_page(crate::mm::AddrSpace::CURRENT, probe)
        .expect("selftest: query after map");
    assert_eq!(mapped, frame);
    assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITE));
    let old = vmm::unmap_page(probe).expect("selftest: unmap");
    assert_eq!(old, frame);
    assert!(vmm::query_page(crate::mm::AddrSpace::CURRENT, probe).is_none());
    FRAME_ALLOCATOR
        .free_frame(frame)
        .expect("selftest: free probe frame");
}
