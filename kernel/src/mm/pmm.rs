//! Physical memory manager
//!
//! Bitmap-backed page-frame allocator with per-frame reference counts and a
//! protected-frame registry. One bit per frame (`1` = used, `0` = free), a
//! parallel `u16` refcount table, and a flat array of protected entries that
//! pins page-table roots and kernel tables against reallocation.
//!
//! The bitmap and refcount table are placed immediately above the kernel
//! image at init and their own frames are pre-marked used. Every entry point
//! runs under a single interrupt-disabling spinlock; all operations are
//! amortized O(1) except the linear scan in [`FrameAllocator::alloc_frames`].

use core::ptr;

use crate::error::{KernelError, KernelResult};
use crate::sync::IrqMutex;

use super::{PhysAddr, PAGE_SIZE};

/// Capacity of the protected-frame registry: active page-directory roots
/// plus a few hundred kernel tables. Filling it up indicates a bug, not a
/// dimensioning problem.
pub const MAX_PROTECTED: usize = 512;

/// Refcount ceiling; increments saturate here with a logged warning.
const REFCOUNT_MAX: u16 = 0xFFFF;

#[derive(Clone, Copy)]
struct ProtectedEntry {
    frame: u64,
    refs: u16,
}

impl ProtectedEntry {
    const EMPTY: ProtectedEntry = ProtectedEntry {
        frame: u64::MAX,
        refs: 0,
    };
}

/// Frame accounting snapshot returned by [`FrameAllocator::get_info`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PmmInfo {
    pub total_frames: u64,
    pub free_frames: u64,
    pub used_frames: u64,
    pub reserved_frames: u64,
    pub kernel_frames: u64,
    pub bitmap_frames: u64,
    pub allocations: u64,
}

struct PmmInner {
    /// One bit per frame, 1 = used. Null until init.
    bitmap: *mut u64,
    bitmap_words: usize,
    /// One u16 per frame, parallel to the bitmap.
    refcounts: *mut u16,
    total_frames: u64,
    free_frames: u64,
    reserved_frames: u64,
    kernel_frames: u64,
    bitmap_frames: u64,
    /// Rotating scan start for `alloc_frame`.
    hint: u64,
    /// Offset translating a physical address to a dereferenceable pointer
    /// (the kernel linear map base, or the arena base under test).
    linear_base: u64,
    protected: [ProtectedEntry; MAX_PROTECTED],
    allocation_count: u64,
}

// SAFETY: The raw table pointers are only dereferenced while the IrqMutex
// around PmmInner is held, which serializes all access.
unsafe impl Send for PmmInner {}

impl PmmInner {
    const fn empty() -> Self {
        Self {
            bitmap: ptr::null_mut(),
            bitmap_words: 0,
            refcounts: ptr::null_mut(),
            total_frames: 0,
            free_frames: 0,
            reserved_frames: 0,
            kernel_frames: 0,
            bitmap_frames: 0,
            hint: 0,
            linear_base: 0,
            protected: [ProtectedEntry::EMPTY; MAX_PROTECTED],
            allocation_count: 0,
        }
    }

    fn is_initialized(&self) -> bool {
        !self.bitmap.is_null()
    }

    #[inline]
    fn bit_is_used(&self, frame: u64) -> bool {
        let word = frame as usize / 64;
        let bit = frame % 64;
        // SAFETY: `frame < total_frames` is checked by every caller, and the
        // bitmap covers `total_frames` bits.
        unsafe { *self.bitmap.add(word) & (1 << bit) != 0 }
    }

    #[inline]
    fn set_used(&mut self, frame: u64) {
        let word = frame as usize / 64;
        let bit = frame % 64;
        // SAFETY: As in `bit_is_used`.
        unsafe { *self.bitmap.add(word) |= 1 << bit };
    }

    #[inline]
    fn set_free(&mut self, frame: u64) {
        let word = frame as usize / 64;
        let bit = frame % 64;
        // SAFETY: As in `bit_is_used`.
        unsafe { *self.bitmap.add(word) &= !(1 << bit) };
    }

    #[inline]
    fn refcount(&self, frame: u64) -> u16 {
        // SAFETY: Bounds as in `bit_is_used`; the refcount table parallels
        // the bitmap.
        unsafe { *self.refcounts.add(frame as usize) }
    }

    #[inline]
    fn set_refcount(&mut self, frame: u64, count: u16) {
        // SAFETY: As in `refcount`.
        unsafe { *self.refcounts.add(frame as usize) = count };
    }

    fn protected_slot(&self, frame: u64) -> Option<usize> {
        self.protected
            .iter()
            .position(|e| e.refs > 0 && e.frame == frame)
    }

    fn is_protected(&self, frame: u64) -> bool {
        self.protected_slot(frame).is_some()
    }

    /// Zero a frame through the linear mapping.
    fn zero_frame(&self, paddr: PhysAddr) {
        let ptr = (self.linear_base + paddr.as_u64()) as *mut u8;
        // SAFETY: The frame was just taken from the bitmap, so nothing else
        // references it, and the linear mapping covers all managed RAM.
        unsafe { ptr::write_bytes(ptr, 0, PAGE_SIZE) };
    }

    /// Claim a known-free frame: set the bit, refcount 1, bump stats.
    fn claim(&mut self, frame: u64) {
        self.set_used(frame);
        self.set_refcount(frame, 1);
        self.free_frames -= 1;
        self.allocation_count += 1;
    }

    /// Find the first free frame at or after `start`, not wrapping.
    fn scan_free(&self, start: u64) -> Option<u64> {
        let mut frame = start;
        // Skip ahead word-wise past fully used regions.
        while frame < self.total_frames {
            let word = frame as usize / 64;
            // SAFETY: word < bitmap_words because frame < total_frames.
            let value = unsafe { *self.bitmap.add(word) };
            if value == u64::MAX {
                frame = (word as u64 + 1) * 64;
                continue;
            }
            let end = ((word as u64 + 1) * 64).min(self.total_frames);
            while frame < end {
                if !self.bit_is_used(frame) {
                    return Some(frame);
                }
                frame += 1;
            }
        }
        None
    }
}

/// The physical memory manager. A single global instance manages all RAM;
/// separate instances exist only in tests.
pub struct FrameAllocator {
    inner: IrqMutex<PmmInner>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(PmmInner::empty()),
        }
    }

    /// Install the bitmap and refcount tables and mark every frame used.
    ///
    /// Callers then carve out the usable regions with [`release_range`] and
    /// re-reserve the kernel image, the tables themselves, and boot modules
    /// with [`reserve_range`].
    ///
    /// # Safety
    ///
    /// `bitmap` must point to at least `total_frames / 8` writable bytes and
    /// `refcounts` to `total_frames * 2` writable bytes, both exclusively
    /// owned by the PMM from here on. `linear_base + paddr` must be a valid
    /// pointer for every managed frame.
    pub unsafe fn init_raw(
        &self,
        bitmap: *mut u64,
        refcounts: *mut u16,
        total_frames: u64,
        linear_base: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.bitmap = bitmap;
        inner.bitmap_words = (total_frames as usize).div_ceil(64);
        inner.refcounts = refcounts;
        inner.total_frames = total_frames;
        inner.free_frames = 0;
        inner.linear_base = linear_base;
        // Everything starts used with refcount 1; release_range opens up the
        // usable regions afterwards.
        // SAFETY: Caller guarantees the table sizes.
        unsafe {
            ptr::write_bytes(bitmap, 0xFF, inner.bitmap_words * 8);
            for frame in 0..total_frames {
                *refcounts.add(frame as usize) = 1;
            }
        }
    }

    /// Mark `[start, start + len)` free. Used during init to open up the
    /// usable regions from the boot memory map.
    pub fn release_range(&self, start: PhysAddr, len: u64) {
        let mut inner = self.inner.lock();
        let first = start.frame();
        let last = (start.as_u64() + len) / PAGE_SIZE as u64;
        for frame in first..last.min(inner.total_frames) {
            if inner.bit_is_used(frame) {
                inner.set_free(frame);
                inner.set_refcount(frame, 0);
                inner.free_frames += 1;
            }
        }
    }

    /// Mark `[start, start + len)` used and attribute it to `class`.
    pub fn reserve_range(&self, start: PhysAddr, len: u64, class: ReserveClass) {
        let mut inner = self.inner.lock();
        let first = start.frame();
        let last = (start.as_u64() + len).div_ceil(PAGE_SIZE as u64);
        let mut count = 0;
        for frame in first..last.min(inner.total_frames) {
            if !inner.bit_is_used(frame) {
                inner.set_used(frame);
                inner.set_refcount(frame, 1);
                inner.free_frames -= 1;
            }
            count += 1;
        }
        match class {
            ReserveClass::Kernel => inner.kernel_frames += count,
            ReserveClass::Bitmap => inner.bitmap_frames += count,
            ReserveClass::Firmware => inner.reserved_frames += count,
        }
    }

    /// Allocate one zeroed frame. Returns [`PhysAddr::INVALID`] when no
    /// frame is free.
    pub fn alloc_frame(&self) -> PhysAddr {
        let mut inner = self.inner.lock();
        if !inner.is_initialized() {
            return PhysAddr::INVALID;
        }

        let mut start = inner.hint;
        loop {
            match inner.scan_free(start) {
                Some(frame) => {
                    // Self-check: a frame in the protected registry must
                    // never be free in the bitmap.
                    if inner.is_protected(frame) {
                        log::error!(
                            "pmm: protected frame {:#x} found free, repairing",
                            frame
                        );
                        inner.claim(frame);
                        inner.allocation_count -= 1;
                        start = frame + 1;
                        continue;
                    }
                    inner.claim(frame);
                    inner.hint = frame + 1;
                    if inner.hint >= inner.total_frames {
                        inner.hint = 0;
                    }
                    let paddr = PhysAddr::new(frame * PAGE_SIZE as u64);
                    inner.zero_frame(paddr);
                    return paddr;
                }
                None if start > 0 => {
                    // Wrap once to cover frames below the hint.
                    start = 0;
                    inner.hint = 0;
                }
                None => return PhysAddr::INVALID,
            }
        }
    }

    /// Allocate `count` consecutive zeroed frames by linear scan. There is
    /// no buddy structure; callers needing large runs are rare and pay the
    /// scan cost.
    pub fn alloc_frames(&self, count: u64) -> PhysAddr {
        if count == 0 {
            return PhysAddr::INVALID;
        }
        if count == 1 {
            return self.alloc_frame();
        }
        let mut inner = self.inner.lock();
        if !inner.is_initialized() || count > inner.free_frames {
            return PhysAddr::INVALID;
        }

        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for frame in 0..inner.total_frames {
            if inner.bit_is_used(frame) || inner.is_protected(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    inner.claim(f);
                }
                let paddr = PhysAddr::new(run_start * PAGE_SIZE as u64);
                for i in 0..count {
                    inner.zero_frame(paddr.offset(i * PAGE_SIZE as u64));
                }
                return paddr;
            }
        }
        PhysAddr::INVALID
    }

    /// Release one reference to a frame; the frame returns to the bitmap
    /// only when the count reaches zero. Protected frames are refused.
    pub fn free_frame(&self, paddr: PhysAddr) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let frame = Self::validate(&inner, paddr)?;

        if inner.is_protected(frame) {
            return Err(KernelError::ResourceBusy {
                what: "protected frame",
            });
        }
        if !inner.bit_is_used(frame) {
            log::warn!("pmm: double free of frame {:#x}", paddr.as_u64());
            return Err(KernelError::DoubleFree {
                frame: paddr.as_u64(),
            });
        }

        // Drop one reference (a prior `frame_ref_dec` may already have taken
        // the count to zero; then this call just closes the accounting).
        let rc = inner.refcount(frame).saturating_sub(1);
        inner.set_refcount(frame, rc);
        if rc == 0 {
            inner.set_free(frame);
            inner.free_frames += 1;
            inner.hint = inner.hint.min(frame);
        }
        Ok(())
    }

    /// Free `count` consecutive frames starting at `paddr`.
    pub fn free_frames(&self, paddr: PhysAddr, count: u64) -> KernelResult<()> {
        for i in 0..count {
            self.free_frame(paddr.offset(i * PAGE_SIZE as u64))?;
        }
        Ok(())
    }

    /// Increment a frame's reference count (saturating).
    pub fn frame_ref_inc(&self, paddr: PhysAddr) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let frame = Self::validate(&inner, paddr)?;
        let rc = inner.refcount(frame);
        if rc == REFCOUNT_MAX {
            log::warn!("pmm: refcount overflow on frame {:#x}", paddr.as_u64());
            return Ok(());
        }
        inner.set_refcount(frame, rc + 1);
        Ok(())
    }

    /// Decrement a frame's reference count and return the new value.
    ///
    /// Reaching zero does NOT free the frame: this call never touches the
    /// bitmap, so it is safe inside the page-fault path under the VMM lock;
    /// the owner still calls [`free_frame`] to close the accounting.
    pub fn frame_ref_dec(&self, paddr: PhysAddr) -> KernelResult<u16> {
        let mut inner = self.inner.lock();
        let frame = Self::validate(&inner, paddr)?;
        let rc = inner.refcount(frame);
        if rc == 0 {
            log::warn!("pmm: refcount underflow on frame {:#x}", paddr.as_u64());
            return Ok(0);
        }
        inner.set_refcount(frame, rc - 1);
        Ok(rc - 1)
    }

    /// Current reference count of a frame.
    pub fn frame_refcount(&self, paddr: PhysAddr) -> KernelResult<u16> {
        let inner = self.inner.lock();
        let frame = Self::validate(&inner, paddr)?;
        Ok(inner.refcount(frame))
    }

    /// Pin a frame against reallocation. Registration is reference-counted;
    /// a free frame is claimed first so that protected implies used.
    pub fn protect_frame(&self, paddr: PhysAddr) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let frame = Self::validate(&inner, paddr)?;

        if !inner.bit_is_used(frame) {
            inner.claim(frame);
            inner.allocation_count -= 1;
        }
        if let Some(slot) = inner.protected_slot(frame) {
            inner.protected[slot].refs += 1;
            return Ok(());
        }
        match inner.protected.iter().position(|e| e.refs == 0) {
            Some(slot) => {
                inner.protected[slot] = ProtectedEntry { frame, refs: 1 };
                Ok(())
            }
            None => {
                log::error!("pmm: protected-frame registry full");
                Err(KernelError::ResourceExhausted {
                    resource: "protected-frame registry",
                })
            }
        }
    }

    /// Drop one protection reference. Never frees the frame.
    pub fn unprotect_frame(&self, paddr: PhysAddr) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let frame = Self::validate(&inner, paddr)?;
        match inner.protected_slot(frame) {
            Some(slot) => {
                inner.protected[slot].refs -= 1;
                if inner.protected[slot].refs == 0 {
                    inner.protected[slot] = ProtectedEntry::EMPTY;
                }
                Ok(())
            }
            None => Err(KernelError::InvalidArgument {
                name: "frame not protected",
            }),
        }
    }

    /// Whether the frame has a protection refcount > 0.
    pub fn is_protected(&self, paddr: PhysAddr) -> bool {
        let inner = self.inner.lock();
        paddr.is_page_aligned()
            && paddr.frame() < inner.total_frames
            && inner.is_protected(paddr.frame())
    }

    /// Frame accounting snapshot.
    pub fn get_info(&self) -> PmmInfo {
        let inner = self.inner.lock();
        PmmInfo {
            total_frames: inner.total_frames,
            free_frames: inner.free_frames,
            used_frames: inner.total_frames - inner.free_frames,
            reserved_frames: inner.reserved_frames,
            kernel_frames: inner.kernel_frames,
            bitmap_frames: inner.bitmap_frames,
            allocations: inner.allocation_count,
        }
    }

    fn validate(inner: &PmmInner, paddr: PhysAddr) -> KernelResult<u64> {
        if !inner.is_initialized() {
            return Err(KernelError::NotInitialized { subsystem: "pmm" });
        }
        if !paddr.is_valid() || !paddr.is_page_aligned() {
            log::warn!("pmm: misaligned frame address {:#x}", paddr.as_u64());
            return Err(KernelError::InvalidAddress {
                addr: paddr.as_u64(),
            });
        }
        let frame = paddr.frame();
        if frame >= inner.total_frames {
            log::warn!("pmm: frame address {:#x} out of range", paddr.as_u64());
            return Err(KernelError::InvalidAddress {
                addr: paddr.as_u64(),
            });
        }
        Ok(frame)
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Accounting class for [`FrameAllocator::reserve_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveClass {
    /// The kernel image itself.
    Kernel,
    /// The PMM bitmap and refcount tables.
    Bitmap,
    /// Firmware holes, low memory, boot modules.
    Firmware,
}

/// Global frame allocator instance.
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

/// Size and place the PMM tables from the normalized boot info, then seed
/// the bitmap: usable regions become free, the kernel image, the tables
/// themselves, boot modules, and (on the x86 family) memory below 1 MiB are
/// marked used.
#[cfg(target_os = "none")]
pub fn init(boot_info: &crate::bootinfo::BootInfo) -> KernelResult<PmmInfo> {
    let total_frames = boot_info.highest_usable_addr() / PAGE_SIZE as u64;
    if total_frames == 0 {
        return Err(KernelError::InvalidArgument {
            name: "empty memory map",
        });
    }

    let (kernel_start, kernel_end) = crate::arch::mmu::kernel_image_range();
    let bitmap_bytes = (total_frames as usize).div_ceil(8).next_multiple_of(8);
    let refcount_bytes = total_frames as usize * 2;

    // Tables live immediately above the kernel image, page aligned.
    let bitmap_phys = PhysAddr::new(kernel_end.as_u64().next_multiple_of(PAGE_SIZE as u64));
    let refcount_phys = bitmap_phys.offset(bitmap_bytes.next_multiple_of(PAGE_SIZE) as u64);
    let tables_end = refcount_phys
        .offset(refcount_bytes.next_multiple_of(PAGE_SIZE) as u64);

    let linear_base = crate::arch::mmu::KERNEL_BASE;
    // SAFETY: The table range lies inside usable RAM above the kernel image
    // and below the linear-map ceiling; nothing else owns it yet.
    unsafe {
        FRAME_ALLOCATOR.init_raw(
            (linear_base + bitmap_phys.as_u64()) as *mut u64,
            (linear_base + refcount_phys.as_u64()) as *mut u16,
            total_frames,
            linear_base,
        );
    }

    for region in boot_info.usable_regions() {
        FRAME_ALLOCATOR.release_range(PhysAddr::new(region.base), region.length);
    }

    // Low memory on the x86 family is left to the firmware.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    FRAME_ALLOCATOR.reserve_range(PhysAddr::new(0), 0x10_0000, ReserveClass::Firmware);

    FRAME_ALLOCATOR.reserve_range(
        kernel_start,
        kernel_end.as_u64() - kernel_start.as_u64(),
        ReserveClass::Kernel,
    );
    FRAME_ALLOCATOR.reserve_range(
        bitmap_phys,
        tables_end.as_u64() - bitmap_phys.as_u64(),
        ReserveClass::Bitmap,
    );
    for module in boot_info.modules() {
        FRAME_ALLOCATOR.reserve_range(
            PhysAddr::new(module.start),
            module.end - module.start,
            ReserveClass::Firmware,
        );
    }

    let info = FRAME_ALLOCATOR.get_info();
    log::info!(
        "pmm: {} frames total, {} free, {} kernel, {} bitmap",
        info.total_frames,
        info.free_frames,
        info.kernel_frames,
        info.bitmap_frames
    );
    Ok(info)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testutil::TestArena;

    #[test]
    fn test_alloc_free_roundtrip() {
        let arena = TestArena::new(128);
        let before = arena.pmm.get_info().free_frames;

        let mut frames = alloc::vec::Vec::new();
        for _ in 0..100 {
            let f = arena.pmm.alloc_frame();
            assert!(f.is_valid(), "allocation within capacity should succeed");
            assert!(!frames.contains(&f), "no duplicate allocations");
            frames.push(f);
        }
        for f in &frames {
            arena.pmm.free_frame(*f).expect("freeing allocated frame");
        }
        assert_eq!(arena.pmm.get_info().free_frames, before);
    }

    #[test]
    fn test_alloc_returns_zeroed_frame() {
        let arena = TestArena::new(8);
        let f = arena.pmm.alloc_frame();
        // Dirty the frame, free it, and check the next allocation is clean.
        // SAFETY: The frame belongs to the arena buffer.
        unsafe { *arena.frame_ptr(f) = 0xAB };
        arena.pmm.free_frame(f).expect("free succeeds");
        let g = arena.pmm.alloc_frame();
        // SAFETY: As above.
        assert_eq!(unsafe { *arena.frame_ptr(g) }, 0);
    }

    #[test]
    fn test_double_free_detected() {
        let arena = TestArena::new(8);
        let f = arena.pmm.alloc_frame();
        arena.pmm.free_frame(f).expect("first free succeeds");
        assert_eq!(
            arena.pmm.free_frame(f),
            Err(KernelError::DoubleFree { frame: f.as_u64() })
        );
    }

    #[test]
    fn test_refcounted_sharing() {
        let arena = TestArena::new(8);
        let f = arena.pmm.alloc_frame();
        assert_eq!(arena.pmm.frame_refcount(f), Ok(1));

        arena.pmm.frame_ref_inc(f).expect("ref inc");
        assert_eq!(arena.pmm.frame_refcount(f), Ok(2));

        // First free drops the count but keeps the frame.
        let free_before = arena.pmm.get_info().free_frames;
        arena.pmm.free_frame(f).expect("shared free succeeds");
        assert_eq!(arena.pmm.get_info().free_frames, free_before);
        assert_eq!(arena.pmm.frame_refcount(f), Ok(1));

        // Second free returns it to the bitmap.
        arena.pmm.free_frame(f).expect("final free succeeds");
        assert_eq!(arena.pmm.get_info().free_frames, free_before + 1);
    }

    #[test]
    fn test_ref_dec_never_frees() {
        let arena = TestArena::new(8);
        let f = arena.pmm.alloc_frame();
        let free_before = arena.pmm.get_info().free_frames;
        assert_eq!(arena.pmm.frame_ref_dec(f), Ok(0));
        // Bitmap untouched even at refcount 0; free_frame closes accounting.
        assert_eq!(arena.pmm.get_info().free_frames, free_before);
        arena.pmm.free_frame(f).expect("closing free succeeds");
        assert_eq!(arena.pmm.get_info().free_frames, free_before + 1);
    }

    #[test]
    fn test_protected_frames() {
        let arena = TestArena::new(8);
        let f = arena.pmm.alloc_frame();
        arena.pmm.protect_frame(f).expect("protect");
        assert!(arena.pmm.is_protected(f));

        // Protected frames refuse free and are skipped by the allocator.
        assert!(arena.pmm.free_frame(f).is_err());
        for _ in 0..arena.pmm.get_info().free_frames {
            let g = arena.pmm.alloc_frame();
            assert_ne!(g, f);
        }

        // Protection is refcounted; unprotect never frees.
        arena.pmm.protect_frame(f).expect("second protect");
        arena.pmm.unprotect_frame(f).expect("first unprotect");
        assert!(arena.pmm.is_protected(f));
        arena.pmm.unprotect_frame(f).expect("second unprotect");
        assert!(!arena.pmm.is_protected(f));
        assert_eq!(arena.pmm.frame_refcount(f), Ok(1));
    }

    #[test]
    fn test_contiguous_allocation() {
        let arena = TestArena::new(64);
        let run = arena.pmm.alloc_frames(8);
        assert!(run.is_valid());
        assert!(run.is_page_aligned());
        // All 8 frames are used and individually freeable.
        for i in 0..8 {
            let f = run.offset(i * PAGE_SIZE as u64);
            assert_eq!(arena.pmm.frame_refcount(f), Ok(1));
        }
        arena.pmm.free_frames(run, 8).expect("free run");
    }

    #[test]
    fn test_exhaustion_returns_invalid() {
        let arena = TestArena::new(4);
        let mut allocated = 0;
        loop {
            let f = arena.pmm.alloc_frame();
            if !f.is_valid() {
                break;
            }
            allocated += 1;
            assert!(allocated <= 4, "cannot allocate more than capacity");
        }
        assert_eq!(arena.pmm.get_info().free_frames, 0);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let arena = TestArena::new(8);
        assert!(matches!(
            arena.pmm.free_frame(PhysAddr::new(0x123)),
            Err(KernelError::InvalidAddress { .. })
        ));
        assert!(matches!(
            arena.pmm.free_frame(PhysAddr::new(1 << 40)),
            Err(KernelError::InvalidAddress { .. })
        ));
    }
}
