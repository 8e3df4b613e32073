//! Virtual memory manager
//!
//! Address-space lifecycle, mapping, and copy-on-write fork on top of the
//! generic walker. The kernel-facing entry points near the bottom resolve
//! the active codec and table source and serialize everything under the
//! single VMM lock; the `*_in` cores above them are generic over codec and
//! source so the exact production logic also runs in host tests.
//!
//! Lock ordering: the VMM lock is acquired before any PMM operation (the
//! walker allocates tables through the PMM while the VMM lock is held).

use core::ops::Range;
use core::ptr;

use crate::error::{KernelError, KernelResult};
use crate::hal::PageFaultInfo;
use crate::sync::IrqMutex;

use super::pmm::{FrameAllocator, FRAME_ALLOCATOR};
use super::pte::PteCodec;
use super::walker::{TableSource, Walker};
use super::{AddrSpace, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};

/// Signal numbers surfaced to the task layer on unresolvable user faults.
pub mod signal {
    pub const SIGILL: u32 = 4;
    pub const SIGTRAP: u32 = 5;
    pub const SIGBUS: u32 = 7;
    pub const SIGSEGV: u32 = 11;
}

// ---------------------------------------------------------------------------
// Generic address-space operations
//
// Everything here is pure page-table and refcount manipulation; no TLB
// traffic and no globals. The kernel wrappers and the host tests are the two
// instantiations.
// ---------------------------------------------------------------------------

/// Outcome of a COW fault resolution, for the caller's TLB and logging
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowResolution {
    /// Refcount was 1: the page became private by restoring WRITE.
    MadePrivate,
    /// Refcount was 0 (anomalous): WRITE restored, logged.
    Restored,
    /// Refcount was >1: contents copied into a fresh frame.
    Copied { new_frame: PhysAddr },
}

/// Create a fresh root seeded with the kernel half of `master`.
///
/// The new root frame is protected; on architectures sharing kernel-half
/// top entries, every kernel table the root now references gains a
/// protection reference as well.
pub fn create_space_in<C: PteCodec, S: TableSource>(
    pmm: &FrameAllocator,
    source: &S,
    master: PhysAddr,
) -> KernelResult<AddrSpace> {
    let root = source.alloc_table()?;
    pmm.protect_frame(root)?;

    let walker: Walker<C, S> = Walker::new(root, source);
    walker.adopt_kernel_half(master);
    protect_kernel_tables::<C, S>(pmm, &walker, true);

    Ok(AddrSpace::new(root))
}

/// Clone `src` into a new space with copy-on-write user mappings.
///
/// Writable leaves in `src` are downgraded to read-only+COW (the caller
/// must flush the TLB if `src` is active), leaf frames are shared with
/// incremented refcounts, and intermediate tables are always private to the
/// child. On failure everything the clone built is rolled back; the COW
/// downgrades in `src` remain, which is harmless by design.
pub fn clone_space_in<C: PteCodec, S: TableSource>(
    pmm: &FrameAllocator,
    source: &S,
    src: PhysAddr,
) -> KernelResult<AddrSpace> {
    let root = source.alloc_table()?;
    let walker: Walker<C, S> = Walker::new(root, source);
    walker.adopt_kernel_half(src);

    let mut on_share = |frame: PhysAddr| {
        let _ = pmm.frame_ref_inc(frame);
    };
    let mut on_unshare = |frame: PhysAddr| {
        let _ = pmm.frame_ref_dec(frame);
    };
    if let Err(e) = walker.clone_user_half(src, &mut on_share, &mut on_unshare) {
        source.free_table(root);
        return Err(e);
    }

    pmm.protect_frame(root)?;
    protect_kernel_tables::<C, S>(pmm, &walker, true);
    Ok(AddrSpace::new(root))
}

/// Destroy a space: release user leaf references, free user intermediate
/// tables, drop kernel-table protections, unregister and free the root.
/// The caller has already checked the space is not active.
pub fn destroy_space_in<C: PteCodec, S: TableSource>(
    pmm: &FrameAllocator,
    source: &S,
    root: PhysAddr,
) -> KernelResult<()> {
    let walker: Walker<C, S> = Walker::new(root, source);

    let mut on_leaf = |frame: PhysAddr| {
        // Shared frames survive: the bitmap bit clears only when the last
        // reference goes away.
        if pmm.frame_ref_dec(frame).unwrap_or(0) == 0 {
            let _ = pmm.free_frame(frame);
        }
    };
    walker.teardown_user_half(&mut on_leaf);

    protect_kernel_tables::<C, S>(pmm, &walker, false);
    pmm.unprotect_frame(root)?;
    source.free_table(root);
    Ok(())
}

/// Add or drop one protection reference on every kernel table referenced
/// from the root's kernel-half top entries.
fn protect_kernel_tables<C: PteCodec, S: TableSource>(
    pmm: &FrameAllocator,
    walker: &Walker<C, S>,
    protect: bool,
) {
    if !C::KERNEL_SHARED_TOP {
        return;
    }
    for idx in C::USER_TOP_ENTRIES..C::GEOMETRY.entries_per_table() {
        let raw = walker.top_entry(idx);
        if !C::is_present(raw) {
            continue;
        }
        let table = C::addr_of(raw);
        if protect {
            let _ = pmm.protect_frame(table);
        } else {
            let _ = pmm.unprotect_frame(table);
        }
    }
}

/// Lazy kernel-entry sync: if the master directory has a present top-level
/// entry for `vaddr` and `current` does not, copy it over. Returns whether
/// a copy happened; `false` means the fault is real.
pub fn kernel_fault_sync_in<C: PteCodec, S: TableSource>(
    source: &S,
    master: PhysAddr,
    current: PhysAddr,
    vaddr: VirtAddr,
) -> bool {
    if !C::KERNEL_SHARED_TOP || master == current {
        return false;
    }
    let top = C::GEOMETRY.levels - 1;
    let idx = C::GEOMETRY.index_of(vaddr.as_u64(), top);
    if idx < C::USER_TOP_ENTRIES {
        return false;
    }
    let master_walker: Walker<C, S> = Walker::new(master, source);
    let cur_walker: Walker<C, S> = Walker::new(current, source);
    let master_raw = master_walker.top_entry(idx);
    if !C::is_present(master_raw) || C::is_present(cur_walker.top_entry(idx)) {
        return false;
    }
    cur_walker.set_top_entry(idx, master_raw);
    true
}

/// Resolve a write fault on a COW page in the space rooted at `root`.
///
/// The three-branch policy: refcount 0 is anomalous but repaired in place,
/// refcount 1 regains WRITE without copying, refcount >1 copies into a
/// fresh frame and drops one reference on the old one.
pub fn cow_fault_in<C: PteCodec, S: TableSource>(
    pmm: &FrameAllocator,
    source: &S,
    root: PhysAddr,
    vaddr: VirtAddr,
) -> KernelResult<CowResolution> {
    let walker: Walker<C, S> = Walker::new(root, source);
    let page = vaddr.align_down();
    let (old_frame, flags) = walker.query(page).ok_or(KernelError::UserFault {
        signal: signal::SIGSEGV,
        addr: vaddr.as_u64(),
    })?;
    if !flags.contains(PageFlags::COW) {
        // Write fault on a genuinely read-only page.
        return Err(KernelError::UserFault {
            signal: signal::SIGSEGV,
            addr: vaddr.as_u64(),
        });
    }

    match pmm.frame_refcount(old_frame)? {
        0 => {
            log::warn!(
                "vmm: COW page {:#x} backed by refcount-0 frame {:#x}",
                page.as_u64(),
                old_frame.as_u64()
            );
            walker.protect(page, PageFlags::WRITE, PageFlags::COW)?;
            Ok(CowResolution::Restored)
        }
        1 => {
            walker.protect(page, PageFlags::WRITE, PageFlags::COW)?;
            Ok(CowResolution::MadePrivate)
        }
        _ => {
            let new_frame = pmm.alloc_frame();
            if !new_frame.is_valid() {
                return Err(KernelError::OutOfMemory { requested: 1 });
            }
            // SAFETY: Both frames are RAM covered by the source's linear
            // translation; the new frame is exclusively ours.
            unsafe {
                ptr::copy_nonoverlapping(
                    source.table_ptr(old_frame),
                    source.table_ptr(new_frame),
                    PAGE_SIZE,
                );
            }
            let new_flags = (flags | PageFlags::WRITE) - PageFlags::COW;
            walker.rewrite_leaf(page, new_frame, new_flags)?;
            let _ = pmm.frame_ref_dec(old_frame);
            Ok(CowResolution::Copied { new_frame })
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel-facing state and wrappers
// ---------------------------------------------------------------------------

/// Active architecture's PTE codec.
#[cfg(target_arch = "x86_64")]
pub type ActiveCodec = super::pte::X86_64Codec;
#[cfg(target_arch = "x86")]
pub type ActiveCodec = super::pte::X86Codec;
#[cfg(target_arch = "aarch64")]
pub type ActiveCodec = super::pte::A64Codec;

/// Table source backed by the global PMM and the kernel linear map.
/// `protect_new` pins freshly allocated tables (kernel page tables).
pub struct KernelTables {
    protect_new: bool,
}

impl KernelTables {
    const fn user() -> Self {
        Self { protect_new: false }
    }

    const fn kernel() -> Self {
        Self { protect_new: true }
    }
}

impl TableSource for KernelTables {
    fn alloc_table(&self) -> KernelResult<PhysAddr> {
        let frame = FRAME_ALLOCATOR.alloc_frame();
        if !frame.is_valid() {
            return Err(KernelError::OutOfMemory { requested: 1 });
        }
        if self.protect_new {
            FRAME_ALLOCATOR.protect_frame(frame)?;
        }
        Ok(frame)
    }

    fn free_table(&self, paddr: PhysAddr) {
        if self.protect_new {
            let _ = FRAME_ALLOCATOR.unprotect_frame(paddr);
        }
        let _ = FRAME_ALLOCATOR.free_frame(paddr);
    }

    fn table_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        phys_to_virt(paddr).as_u64() as *mut u8
    }
}

/// Translate a physical address through the kernel linear map.
pub fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
    VirtAddr::new(crate::arch::mmu::KERNEL_BASE + paddr.as_u64())
}

/// Whether `vaddr` is a kernel-space address.
pub fn is_kernel_addr(vaddr: VirtAddr) -> bool {
    vaddr.as_u64() >= crate::arch::mmu::KERNEL_BASE
}

struct VmmInner {
    initialized: bool,
    /// Root of the currently active space.
    current: PhysAddr,
    /// Master kernel directory: the template whose kernel half seeds every
    /// new space (the TTBR1 tree on AArch64).
    master: PhysAddr,
    /// Bump pointer inside the MMIO window.
    mmio_next: u64,
}

static VMM: IrqMutex<VmmInner> = IrqMutex::new(VmmInner {
    initialized: false,
    current: PhysAddr::INVALID,
    master: PhysAddr::INVALID,
    mmio_next: 0,
});

fn resolve(inner: &VmmInner, space: AddrSpace) -> KernelResult<PhysAddr> {
    if space == AddrSpace::CURRENT {
        return Ok(inner.current);
    }
    if !space.is_handle() {
        return Err(KernelError::InvalidArgument {
            name: "address space handle",
        });
    }
    Ok(space.root())
}

/// Root that kernel-space mappings go into for a given space: the shared
/// per-space root on the x86 family, the single TTBR1 tree on AArch64.
fn kernel_root_of<C: PteCodec>(inner: &VmmInner, resolved: PhysAddr) -> PhysAddr {
    if C::KERNEL_SHARED_TOP {
        resolved
    } else {
        inner.master
    }
}

/// Adopt the boot page tables, extend the kernel linear map over all usable
/// RAM up to the architecture ceiling, and declare the result the master
/// kernel directory.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    use crate::arch::mmu;

    let boot_root = mmu::current_root();
    FRAME_ALLOCATOR.protect_frame(boot_root)?;

    let kernel_root = if ActiveCodec::KERNEL_SHARED_TOP {
        boot_root
    } else {
        let r = mmu::kernel_root();
        FRAME_ALLOCATOR.protect_frame(r)?;
        r
    };

    {
        let mut inner = VMM.lock();
        inner.current = boot_root;
        inner.master = kernel_root;
        inner.mmio_next = mmu::MMIO_BASE;
        inner.initialized = true;
    }

    // Extend the linear map to cover all frames the PMM manages, stopping
    // at the architecture's linear-map ceiling.
    let total = FRAME_ALLOCATOR.get_info().total_frames * PAGE_SIZE as u64;
    let limit = total.min(mmu::LINEAR_CEILING);
    let source = KernelTables::kernel();
    let walker: Walker<ActiveCodec, _> = Walker::new(kernel_root, &source);
    let mut paddr = 0u64;
    while paddr < limit {
        let v = phys_to_virt(PhysAddr::new(paddr));
        if walker.query(v).is_none() {
            walker.map(v, PhysAddr::new(paddr), PageFlags::KERNEL_DATA)?;
        }
        paddr += PAGE_SIZE as u64;
    }
    crate::hal::mmu_flush_tlb_all();

    log::info!(
        "vmm: linear map extended to {} MiB, master root {:#x}",
        limit / (1024 * 1024),
        kernel_root.as_u64()
    );
    Ok(())
}

/// Map one page in the given space. Flushes the TLB for active spaces and
/// mirrors new kernel top-level entries into the master directory.
pub fn map_page_in(
    space: AddrSpace,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: PageFlags,
) -> KernelResult<()> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let resolved = resolve(&inner, space)?;
    let kernel = is_kernel_addr(vaddr);
    let root = if kernel {
        kernel_root_of::<ActiveCodec>(&inner, resolved)
    } else {
        resolved
    };
    let source = if kernel {
        KernelTables::kernel()
    } else {
        KernelTables::user()
    };
    let walker: Walker<ActiveCodec, _> = Walker::new(root, &source);
    let outcome = walker.map(vaddr, paddr, flags)?;

    // A new kernel top-level entry must reach the master directory so that
    // peer spaces can lazy-sync it on their first touch.
    if kernel && outcome.top_entry_created && ActiveCodec::KERNEL_SHARED_TOP && root != inner.master
    {
        let top = ActiveCodec::GEOMETRY.levels - 1;
        let idx = ActiveCodec::GEOMETRY.index_of(vaddr.as_u64(), top);
        let master_walker: Walker<ActiveCodec, _> = Walker::new(inner.master, &source);
        master_walker.set_top_entry(idx, walker.top_entry(idx));
    }

    if space == AddrSpace::CURRENT || resolved == inner.current || kernel {
        if outcome.top_entry_created {
            crate::hal::mmu_flush_tlb_all();
        } else {
            crate::hal::mmu_flush_tlb(vaddr);
        }
    }
    Ok(())
}

/// Map one page in the current space.
pub fn map_page(vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) -> KernelResult<()> {
    map_page_in(AddrSpace::CURRENT, vaddr, paddr, flags)
}

/// Remove one mapping; returns the old frame or [`PhysAddr::INVALID`].
pub fn unmap_page_in(space: AddrSpace, vaddr: VirtAddr) -> KernelResult<PhysAddr> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let resolved = resolve(&inner, space)?;
    let kernel = is_kernel_addr(vaddr);
    let root = if kernel {
        kernel_root_of::<ActiveCodec>(&inner, resolved)
    } else {
        resolved
    };
    let source = if kernel {
        KernelTables::kernel()
    } else {
        KernelTables::user()
    };
    let walker: Walker<ActiveCodec, _> = Walker::new(root, &source);
    let old = walker.unmap(vaddr);
    if space == AddrSpace::CURRENT || resolved == inner.current || kernel {
        crate::hal::mmu_flush_tlb(vaddr);
    }
    Ok(old)
}

/// Remove one mapping from the current space.
pub fn unmap_page(vaddr: VirtAddr) -> KernelResult<PhysAddr> {
    unmap_page_in(AddrSpace::CURRENT, vaddr)
}

/// Bit-level flag modify of an existing mapping.
pub fn protect_page_in(
    space: AddrSpace,
    vaddr: VirtAddr,
    set: PageFlags,
    clear: PageFlags,
) -> KernelResult<()> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let resolved = resolve(&inner, space)?;
    let kernel = is_kernel_addr(vaddr);
    let root = if kernel {
        kernel_root_of::<ActiveCodec>(&inner, resolved)
    } else {
        resolved
    };
    let source = KernelTables::user();
    let walker: Walker<ActiveCodec, _> = Walker::new(root, &source);
    walker.protect(vaddr.align_down(), set, clear)?;
    if space == AddrSpace::CURRENT || resolved == inner.current || kernel {
        crate::hal::mmu_flush_tlb(vaddr);
    }
    Ok(())
}

/// Read-only lookup in the given space.
pub fn query_page(space: AddrSpace, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    let inner = VMM.lock();
    if !inner.initialized {
        return None;
    }
    let resolved = resolve(&inner, space).ok()?;
    let root = if is_kernel_addr(vaddr) {
        kernel_root_of::<ActiveCodec>(&inner, resolved)
    } else {
        resolved
    };
    let source = KernelTables::user();
    let walker: Walker<ActiveCodec, _> = Walker::new(root, &source);
    walker.query(vaddr.align_down())
}

/// Translate a virtual address (any alignment) to its physical address.
pub fn virt_to_phys(space: AddrSpace, vaddr: VirtAddr) -> Option<PhysAddr> {
    let (frame, _) = query_page(space, vaddr)?;
    Some(frame.offset(vaddr.page_offset()))
}

/// Create a fresh address space seeded with the master kernel half.
pub fn create_space() -> KernelResult<AddrSpace> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let source = KernelTables::user();
    create_space_in::<ActiveCodec, _>(&FRAME_ALLOCATOR, &source, inner.master)
}

/// COW-clone an address space. If the source is the active space a full
/// TLB flush publishes the revoked write permissions.
pub fn clone_space(src: AddrSpace) -> KernelResult<AddrSpace> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let src_root = resolve(&inner, src)?;
    let source = KernelTables::user();
    let child = clone_space_in::<ActiveCodec, _>(&FRAME_ALLOCATOR, &source, src_root)?;
    if src_root == inner.current {
        crate::hal::mmu_flush_tlb_all();
    }
    Ok(child)
}

/// Destroy an address space. Refuses the active space, the master kernel
/// root, and any space the task pool still references.
pub fn destroy_space(space: AddrSpace) -> KernelResult<()> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let root = resolve(&inner, space)?;
    if root == inner.current || root == inner.master {
        return Err(KernelError::ResourceBusy {
            what: "active address space",
        });
    }
    if crate::sched::task_pool_references_space(space) {
        return Err(KernelError::ResourceBusy {
            what: "address space in use by task pool",
        });
    }
    let source = KernelTables::user();
    destroy_space_in::<ActiveCodec, _>(&FRAME_ALLOCATOR, &source, root)
}

/// Load a new address space into the page-table base register.
pub fn switch_space(space: AddrSpace) -> KernelResult<()> {
    let mut inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let root = resolve(&inner, space)?;
    if root == inner.current {
        return Ok(());
    }
    crate::hal::mmu_switch_root(root);
    inner.current = root;
    Ok(())
}

/// The root of the currently active address space.
pub fn current_space() -> AddrSpace {
    let inner = VMM.lock();
    AddrSpace::new(inner.current)
}

// ---------------------------------------------------------------------------
// Page-fault resolution
// ---------------------------------------------------------------------------

/// Resolve a page fault or report why it cannot be resolved.
///
/// Kernel-space faults from kernel mode try the lazy master-directory sync;
/// present+write user faults try the COW path; everything else surfaces as
/// a fatal signal for the task layer (or a kernel panic upstream).
pub fn handle_page_fault(info: &PageFaultInfo) -> KernelResult<()> {
    let vaddr = VirtAddr::new(info.fault_addr);
    if is_kernel_addr(vaddr) && !info.is_user {
        return handle_kernel_page_fault(vaddr);
    }
    if info.is_present && info.is_write {
        return handle_cow_page_fault(vaddr);
    }
    Err(KernelError::UserFault {
        signal: if info.is_exec {
            signal::SIGSEGV
        } else if info.is_reserved {
            signal::SIGBUS
        } else {
            signal::SIGSEGV
        },
        addr: info.fault_addr,
    })
}

/// Lazy sync of a kernel top-level entry from the master directory.
pub fn handle_kernel_page_fault(vaddr: VirtAddr) -> KernelResult<()> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let source = KernelTables::kernel();
    if kernel_fault_sync_in::<ActiveCodec, _>(&source, inner.master, inner.current, vaddr) {
        crate::hal::mmu_flush_tlb(vaddr);
        Ok(())
    } else {
        Err(KernelError::NotMapped {
            addr: vaddr.as_u64(),
        })
    }
}

/// Resolve a write to a COW page in the current space.
pub fn handle_cow_page_fault(vaddr: VirtAddr) -> KernelResult<()> {
    let inner = VMM.lock();
    if !inner.initialized {
        return Err(KernelError::NotInitialized { subsystem: "vmm" });
    }
    let source = KernelTables::user();
    let _resolution =
        cow_fault_in::<ActiveCodec, _>(&FRAME_ALLOCATOR, &source, inner.current, vaddr)?;
    crate::hal::mmu_flush_tlb(vaddr.align_down());
    Ok(())
}

// ---------------------------------------------------------------------------
// MMIO window
// ---------------------------------------------------------------------------

/// Map a physical MMIO range into the kernel MMIO window with
/// `PRESENT|WRITE|NOCACHE`. Returns the virtual address of `paddr`
/// (original in-page offset preserved).
pub fn map_mmio(paddr: PhysAddr, size: usize) -> KernelResult<VirtAddr> {
    map_mmio_with(paddr, size, PageFlags::MMIO)
}

/// Flags for a framebuffer mapping: write-combining when the platform's
/// memory attribute tables provide it, uncached otherwise.
pub fn framebuffer_flags(write_combining: bool) -> PageFlags {
    if write_combining {
        PageFlags::PRESENT | PageFlags::WRITE | PageFlags::WRITECOMB
    } else {
        PageFlags::MMIO
    }
}

/// Map a framebuffer, preferring write-combining, falling back to uncached.
pub fn map_framebuffer(paddr: PhysAddr, size: usize) -> KernelResult<VirtAddr> {
    let flags = framebuffer_flags(crate::hal::write_combining_available());
    map_mmio_with(paddr, size, flags)
}

fn map_mmio_with(paddr: PhysAddr, size: usize, flags: PageFlags) -> KernelResult<VirtAddr> {
    if size == 0 {
        return Err(KernelError::InvalidArgument { name: "size" });
    }
    let offset = paddr.as_u64() & (PAGE_SIZE as u64 - 1);
    let base_phys = paddr.align_down();
    let pages = (size as u64 + offset).div_ceil(PAGE_SIZE as u64);

    let base_virt = {
        let mut inner = VMM.lock();
        if !inner.initialized {
            return Err(KernelError::NotInitialized { subsystem: "vmm" });
        }
        let base = inner.mmio_next;
        let end = base + pages * PAGE_SIZE as u64;
        if end > crate::arch::mmu::MMIO_BASE + crate::arch::mmu::MMIO_WINDOW_SIZE {
            return Err(KernelError::ResourceExhausted {
                resource: "MMIO window",
            });
        }
        inner.mmio_next = end;
        base
    };

    for i in 0..pages {
        map_page(
            VirtAddr::new(base_virt + i * PAGE_SIZE as u64),
            base_phys.offset(i * PAGE_SIZE as u64),
            flags,
        )?;
    }
    Ok(VirtAddr::new(base_virt + offset))
}

/// Tear down an MMIO mapping established by [`map_mmio`]. The virtual
/// window itself is bump-allocated and not recycled.
pub fn unmap_mmio(vaddr: VirtAddr, size: usize) -> KernelResult<()> {
    let base = vaddr.align_down();
    let pages = (size as u64 + vaddr.page_offset()).div_ceil(PAGE_SIZE as u64);
    for i in 0..pages {
        let _ = unmap_page(VirtAddr::new(base.as_u64() + i * PAGE_SIZE as u64))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Print the user-half mappings of a space as contiguous runs.
pub fn dump_user_mappings(space: AddrSpace) {
    let inner = VMM.lock();
    if !inner.initialized {
        return;
    }
    let Ok(root) = resolve(&inner, space) else {
        return;
    };
    let source = KernelTables::user();
    let walker: Walker<ActiveCodec, _> = Walker::new(root, &source);
    crate::kprintln!("user mappings of space {:#x}:", root.as_u64());
    dump_runs(&walker, 0..ActiveCodec::USER_TOP_ENTRIES);
}

/// Print the kernel-half mappings of the master directory.
pub fn dump_kernel_mappings() {
    let inner = VMM.lock();
    if !inner.initialized {
        return;
    }
    let source = KernelTables::user();
    let walker: Walker<ActiveCodec, _> = Walker::new(inner.master, &source);
    crate::kprintln!("kernel mappings (master {:#x}):", inner.master.as_u64());
    let range: Range<usize> = if ActiveCodec::KERNEL_SHARED_TOP {
        ActiveCodec::USER_TOP_ENTRIES..ActiveCodec::GEOMETRY.entries_per_table()
    } else {
        0..ActiveCodec::GEOMETRY.entries_per_table()
    };
    dump_runs(&walker, range);
}

fn dump_runs<S: TableSource>(walker: &Walker<ActiveCodec, S>, range: Range<usize>) {
    let mut run: Option<(u64, u64, u64, PageFlags)> = None;
    let mut flush = |r: &mut Option<(u64, u64, u64, PageFlags)>| {
        if let Some((v0, v1, p0, flags)) = r.take() {
            crate::kprintln!(
                "  {:#014x}..{:#014x} -> {:#010x} {:?}",
                v0,
                v1 + PAGE_SIZE as u64,
                p0,
                flags
            );
        }
    };
    walker.visit_leaves(range, &mut |v, raw| {
        let p = ActiveCodec::addr_of(raw).as_u64();
        let flags = ActiveCodec::decode(raw);
        match run {
            Some((v0, v1, p0, f))
                if v.as_u64() == v1 + PAGE_SIZE as u64
                    && p == p0 + (v.as_u64() - v0)
                    && f == flags =>
            {
                run = Some((v0, v.as_u64(), p0, f));
            }
            _ => {
                flush(&mut run);
                run = Some((v.as_u64(), v.as_u64(), p, flags));
            }
        }
    });
    flush(&mut run);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::pte::X86_64Codec;
    use crate::mm::testutil::{FailingSource, TestArena};

    type C = X86_64Codec;

    /// Build a "master" root carrying one kernel-half top entry so that
    /// create/clone have something to seed from.
    fn master_with_kernel_entry(arena: &TestArena) -> (PhysAddr, usize) {
        let master = arena.alloc_table().expect("master root");
        let ktable = arena.alloc_table().expect("kernel table");
        let w: Walker<C, _> = Walker::new(master, arena);
        let idx = C::USER_TOP_ENTRIES;
        w.set_top_entry(idx, <C as PteCodec>::table(ktable));
        (master, idx)
    }

    fn user_page(arena: &TestArena, root: PhysAddr, va: u64) -> PhysAddr {
        let frame = arena.pmm.alloc_frame();
        let w: Walker<C, _> = Walker::new(root, arena);
        w.map(
            VirtAddr::new(va),
            frame,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER,
        )
        .expect("user map");
        frame
    }

    #[test]
    fn test_create_then_destroy_leaks_nothing() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let before = arena.pmm.get_info().free_frames;

        let space = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("create");
        assert!(arena.pmm.is_protected(space.root()));

        destroy_space_in::<C, _>(&arena.pmm, &arena, space.root()).expect("destroy");
        assert_eq!(arena.pmm.get_info().free_frames, before);
        assert!(!arena.pmm.is_protected(space.root()));
    }

    #[test]
    fn test_create_space_seeds_kernel_half() {
        let arena = TestArena::new(128);
        let (master, kidx) = master_with_kernel_entry(&arena);
        let space = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("create");

        let mw: Walker<C, _> = Walker::new(master, &arena);
        let sw: Walker<C, _> = Walker::new(space.root(), &arena);
        assert_eq!(sw.top_entry(kidx), mw.top_entry(kidx));
        // The referenced kernel table is pinned.
        assert!(arena.pmm.is_protected(<C as PteCodec>::addr_of(mw.top_entry(kidx))));

        destroy_space_in::<C, _>(&arena.pmm, &arena, space.root()).expect("destroy");
    }

    #[test]
    fn test_cow_clone_shares_frames_readonly() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let parent = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("parent");
        let frame = user_page(&arena, parent.root(), 0x1000);

        let child = clone_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("clone");

        let pw: Walker<C, _> = Walker::new(parent.root(), &arena);
        let cw: Walker<C, _> = Walker::new(child.root(), &arena);
        let (pp, pf) = pw.query(VirtAddr::new(0x1000)).expect("parent mapping");
        let (cp, cf) = cw.query(VirtAddr::new(0x1000)).expect("child mapping");

        assert_eq!(pp, frame);
        assert_eq!(cp, frame);
        assert!(pf.contains(PageFlags::COW) && !pf.contains(PageFlags::WRITE));
        assert!(cf.contains(PageFlags::COW) && !cf.contains(PageFlags::WRITE));
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(2));

        // Destroying both frees the frame exactly once.
        let free_before = arena.pmm.get_info().free_frames;
        destroy_space_in::<C, _>(&arena.pmm, &arena, child.root()).expect("destroy child");
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(1));
        destroy_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("destroy parent");
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(0));
        assert!(arena.pmm.get_info().free_frames > free_before);
    }

    #[test]
    fn test_cow_fault_with_two_references_copies() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let parent = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("parent");
        let frame = user_page(&arena, parent.root(), 0x1000);

        // Write a marker into the shared page before the clone.
        // SAFETY: Arena frame.
        unsafe { *arena.frame_ptr(frame) = 0x5A };

        let child = clone_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("clone");

        let res = cow_fault_in::<C, _>(&arena.pmm, &arena, parent.root(), VirtAddr::new(0x1234))
            .expect("cow fault resolves");
        let CowResolution::Copied { new_frame } = res else {
            panic!("refcount 2 must copy, got {:?}", res);
        };

        // Parent now maps a private, writable copy with identical contents.
        let pw: Walker<C, _> = Walker::new(parent.root(), &arena);
        let (pp, pf) = pw.query(VirtAddr::new(0x1000)).expect("parent mapping");
        assert_eq!(pp, new_frame);
        assert!(pf.contains(PageFlags::WRITE) && !pf.contains(PageFlags::COW));
        // SAFETY: Arena frames.
        assert_eq!(unsafe { *arena.frame_ptr(new_frame) }, 0x5A);

        // Child still maps the old frame, now single-referenced.
        let cw: Walker<C, _> = Walker::new(child.root(), &arena);
        let (cp, cf) = cw.query(VirtAddr::new(0x1000)).expect("child mapping");
        assert_eq!(cp, frame);
        assert!(cf.contains(PageFlags::COW));
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(1));

        destroy_space_in::<C, _>(&arena.pmm, &arena, child.root()).expect("destroy child");
        destroy_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("destroy parent");
    }

    #[test]
    fn test_cow_fault_with_single_reference_restores_write() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let parent = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("parent");
        let frame = user_page(&arena, parent.root(), 0x1000);

        let child = clone_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("clone");
        destroy_space_in::<C, _>(&arena.pmm, &arena, child.root()).expect("destroy child");
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(1));

        let free_before = arena.pmm.get_info().free_frames;
        let res = cow_fault_in::<C, _>(&arena.pmm, &arena, parent.root(), VirtAddr::new(0x1000))
            .expect("cow fault resolves");
        assert_eq!(res, CowResolution::MadePrivate);
        // No allocation happened.
        assert_eq!(arena.pmm.get_info().free_frames, free_before);

        let pw: Walker<C, _> = Walker::new(parent.root(), &arena);
        let (pp, pf) = pw.query(VirtAddr::new(0x1000)).expect("parent mapping");
        assert_eq!(pp, frame);
        assert!(pf.contains(PageFlags::WRITE) && !pf.contains(PageFlags::COW));

        destroy_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("destroy parent");
    }

    #[test]
    fn test_cow_fault_on_plain_readonly_page_is_fatal() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let parent = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("parent");
        let frame = arena.pmm.alloc_frame();
        let w: Walker<C, _> = Walker::new(parent.root(), &arena);
        w.map(
            VirtAddr::new(0x2000),
            frame,
            PageFlags::PRESENT | PageFlags::USER,
        )
        .expect("read-only map");

        assert!(matches!(
            cow_fault_in::<C, _>(&arena.pmm, &arena, parent.root(), VirtAddr::new(0x2000)),
            Err(KernelError::UserFault {
                signal: signal::SIGSEGV,
                ..
            })
        ));
    }

    #[test]
    fn test_kernel_fault_lazy_sync() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let space = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("space");

        // A kernel mapping added to the master after the space was created:
        // new top-level entry at a previously empty kernel slot.
        let mw: Walker<C, _> = Walker::new(master, &arena);
        let kframe = arena.pmm.alloc_frame();
        let kva = VirtAddr::new(0xFFFF_9000_0000_0000);
        mw.map(kva, kframe, PageFlags::KERNEL_DATA).expect("master map");

        let sw: Walker<C, _> = Walker::new(space.root(), &arena);
        assert!(sw.query(kva).is_none(), "space lags behind the master");

        assert!(kernel_fault_sync_in::<C, _>(&arena, master, space.root(), kva));
        assert_eq!(
            sw.query(kva).map(|(p, _)| p),
            Some(kframe),
            "after sync the space maps the kernel page identically"
        );

        // Second fault at the same address finds the entry present.
        assert!(!kernel_fault_sync_in::<C, _>(&arena, master, space.root(), kva));

        // A fault with no master entry is real.
        assert!(!kernel_fault_sync_in::<C, _>(
            &arena,
            master,
            space.root(),
            VirtAddr::new(0xFFFF_A000_0000_0000)
        ));
    }

    #[test]
    fn test_clone_rollback_on_allocation_failure() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let parent = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("parent");
        // Two pages in different 1 GiB regions force several intermediate
        // tables in the clone.
        let f1 = user_page(&arena, parent.root(), 0x1000);
        let _f2 = user_page(&arena, parent.root(), 0x8000_0000);

        let free_before = arena.pmm.get_info().free_frames;
        // Budget of 3 tables: enough for the child root and part of the
        // first subtree, not for the whole clone.
        let failing = FailingSource::new(&arena, 3);
        let err = clone_space_in::<C, _>(&arena.pmm, &failing, parent.root());
        assert!(err.is_err(), "clone must fail under the allocation budget");

        // Rollback: no leaked tables, no leaked refcounts.
        assert_eq!(arena.pmm.get_info().free_frames, free_before);
        assert_eq!(arena.pmm.frame_refcount(f1), Ok(1));

        // The parent is left working: its pages may have been COW-marked,
        // and a write fault simply restores WRITE.
        let pw: Walker<C, _> = Walker::new(parent.root(), &arena);
        let (_, pf) = pw.query(VirtAddr::new(0x1000)).expect("parent intact");
        if pf.contains(PageFlags::COW) {
            let res =
                cow_fault_in::<C, _>(&arena.pmm, &arena, parent.root(), VirtAddr::new(0x1000))
                    .expect("restore write");
            assert_eq!(res, CowResolution::MadePrivate);
        }

        destroy_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("destroy parent");
    }

    #[test]
    fn test_framebuffer_flag_fallback() {
        let with_wc = framebuffer_flags(true);
        assert!(with_wc.contains(PageFlags::WRITECOMB));
        assert!(!with_wc.contains(PageFlags::NOCACHE));

        let without_wc = framebuffer_flags(false);
        assert_eq!(
            without_wc,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::NOCACHE
        );
    }

    #[test]
    fn test_refcount_matches_pte_references_after_fork() {
        let arena = TestArena::new(128);
        let (master, _) = master_with_kernel_entry(&arena);
        let parent = create_space_in::<C, _>(&arena.pmm, &arena, master).expect("parent");
        let frame = user_page(&arena, parent.root(), 0x1000);

        let c1 = clone_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("clone 1");
        let c2 = clone_space_in::<C, _>(&arena.pmm, &arena, parent.root()).expect("clone 2");

        // Three spaces reference the frame; count the PTEs that point at it.
        let mut ptes = 0;
        for root in [parent.root(), c1.root(), c2.root()] {
            let w: Walker<C, _> = Walker::new(root, &arena);
            w.visit_leaves(0..C::USER_TOP_ENTRIES, &mut |_, raw| {
                if <C as PteCodec>::addr_of(raw) == frame {
                    ptes += 1;
                }
            });
        }
        assert_eq!(ptes, 3);
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(3));

        for space in [c1, c2, parent] {
            destroy_space_in::<C, _>(&arena.pmm, &arena, space.root()).expect("destroy");
        }
        assert_eq!(arena.pmm.frame_refcount(frame), Ok(0));
    }
}
