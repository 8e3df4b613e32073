//! Generic page-table walker
//!
//! Walks and edits a page-table hierarchy described by a [`PteCodec`]. Table
//! frames are obtained and translated through a [`TableSource`], which is the
//! PMM plus the kernel linear map on target and a heap arena in host tests.
//!
//! The walker itself takes no locks and performs raw table stores; the VMM
//! serializes every walker operation under its single lock. TLB maintenance
//! is the caller's job.

use core::marker::PhantomData;
use core::ops::Range;
use core::ptr;

use crate::error::{KernelError, KernelResult};

use super::pte::PteCodec;
use super::{PageFlags, PhysAddr, VirtAddr};

/// Provider of page-table frames and of the mapping that makes them
/// dereferenceable.
pub trait TableSource {
    /// Allocate a zeroed page-table frame.
    fn alloc_table(&self) -> KernelResult<PhysAddr>;
    /// Release a page-table frame.
    fn free_table(&self, paddr: PhysAddr);
    /// Translate a table's physical address to a dereferenceable pointer.
    fn table_ptr(&self, paddr: PhysAddr) -> *mut u8;
}

/// What [`Walker::map`] did besides installing the leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapOutcome {
    /// A new top-level entry was installed. The VMM mirrors such entries
    /// into the master kernel directory for kernel-space addresses.
    pub top_entry_created: bool,
}

/// A view over one page-table hierarchy rooted at `root`.
pub struct Walker<'a, C: PteCodec, S: TableSource> {
    root: PhysAddr,
    source: &'a S,
    _codec: PhantomData<C>,
}

impl<'a, C: PteCodec, S: TableSource> Walker<'a, C, S> {
    pub fn new(root: PhysAddr, source: &'a S) -> Self {
        Self {
            root,
            source,
            _codec: PhantomData,
        }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    #[inline]
    fn read(&self, table: PhysAddr, index: usize) -> u64 {
        let base = self.source.table_ptr(table);
        // SAFETY: `table` designates a live table frame and `index` is below
        // the geometry's entry count; volatile because the MMU reads the
        // same memory.
        unsafe {
            match C::GEOMETRY.entry_bytes {
                4 => ptr::read_volatile((base as *const u32).add(index)) as u64,
                _ => ptr::read_volatile((base as *const u64).add(index)),
            }
        }
    }

    #[inline]
    fn write(&self, table: PhysAddr, index: usize, raw: u64) {
        let base = self.source.table_ptr(table);
        // SAFETY: As in `read`; a single volatile store keeps the entry
        // update atomic with respect to the MMU.
        unsafe {
            match C::GEOMETRY.entry_bytes {
                4 => ptr::write_volatile((base as *mut u32).add(index), raw as u32),
                _ => ptr::write_volatile((base as *mut u64).add(index), raw),
            }
        }
    }

    /// Descend to the leaf table covering `vaddr`, optionally allocating
    /// missing intermediate tables. Returns the leaf table and whether a new
    /// top-level entry was installed.
    fn leaf_table(&self, vaddr: u64, create: bool) -> KernelResult<(PhysAddr, bool)> {
        let g = C::GEOMETRY;
        let mut table = self.root;
        let mut top_created = false;
        for level in (1..g.levels).rev() {
            let idx = g.index_of(vaddr, level);
            let raw = self.read(table, idx);
            if C::is_present(raw) {
                if C::is_large(raw) {
                    return Err(KernelError::CorruptionDetected {
                        subsystem: "vmm",
                        detail: "large mapping in 4K walk",
                    });
                }
                table = C::addr_of(raw);
            } else if create {
                let new = self.source.alloc_table()?;
                self.write(table, idx, C::table(new));
                if level == g.levels - 1 {
                    top_created = true;
                }
                table = new;
            } else {
                return Err(KernelError::NotMapped { addr: vaddr });
            }
        }
        Ok((table, top_created))
    }

    /// Install `vaddr -> paddr` with `flags`. Overwrites any existing
    /// mapping by design; the caller flushes the TLB.
    pub fn map(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<MapOutcome> {
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return Err(KernelError::InvalidAddress {
                addr: vaddr.as_u64(),
            });
        }
        let (leaf, top_entry_created) = self.leaf_table(vaddr.as_u64(), true)?;
        let idx = C::GEOMETRY.index_of(vaddr.as_u64(), 0);
        self.write(leaf, idx, C::leaf(paddr, flags | PageFlags::PRESENT));
        Ok(MapOutcome { top_entry_created })
    }

    /// Remove the mapping of `vaddr` and return the old frame, or
    /// [`PhysAddr::INVALID`] if nothing was mapped.
    pub fn unmap(&self, vaddr: VirtAddr) -> PhysAddr {
        let g = C::GEOMETRY;
        let Ok((leaf, _)) = self.leaf_table(vaddr.as_u64(), false) else {
            return PhysAddr::INVALID;
        };
        let idx = g.index_of(vaddr.as_u64(), 0);
        let raw = self.read(leaf, idx);
        if !C::is_present(raw) {
            return PhysAddr::INVALID;
        }
        self.write(leaf, idx, 0);

        // On the 2-level layout an emptiness check is one cache line away,
        // so empty leaf tables are reclaimed eagerly.
        // TODO(x86-64): reclaim empty intermediate tables on the 4-level
        // layouts as well; today they are only freed by address-space
        // teardown.
        if g.levels == 2 {
            let empty = (0..g.entries_per_table()).all(|i| !C::is_present(self.read(leaf, i)));
            if empty {
                let top_idx = g.index_of(vaddr.as_u64(), 1);
                self.write(self.root, top_idx, 0);
                self.source.free_table(leaf);
            }
        }
        C::addr_of(raw)
    }

    /// Read-only lookup.
    pub fn query(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let (leaf, _) = self.leaf_table(vaddr.as_u64(), false).ok()?;
        let raw = self.read(leaf, C::GEOMETRY.index_of(vaddr.as_u64(), 0));
        if C::is_present(raw) {
            Some((C::addr_of(raw), C::decode(raw)))
        } else {
            None
        }
    }

    /// Bit-level modify of an existing mapping's flags.
    pub fn protect(
        &self,
        vaddr: VirtAddr,
        set: PageFlags,
        clear: PageFlags,
    ) -> KernelResult<()> {
        let (leaf, _) = self.leaf_table(vaddr.as_u64(), false)?;
        let idx = C::GEOMETRY.index_of(vaddr.as_u64(), 0);
        let raw = self.read(leaf, idx);
        if !C::is_present(raw) {
            return Err(KernelError::NotMapped {
                addr: vaddr.as_u64(),
            });
        }
        let flags = (C::decode(raw) | set) - clear;
        self.write(leaf, idx, C::leaf(C::addr_of(raw), flags));
        Ok(())
    }

    /// Atomically rewrite an existing leaf to a new frame and flags.
    /// Used by COW resolution; fails if the address is not mapped.
    pub fn rewrite_leaf(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let (leaf, _) = self.leaf_table(vaddr.as_u64(), false)?;
        let idx = C::GEOMETRY.index_of(vaddr.as_u64(), 0);
        if !C::is_present(self.read(leaf, idx)) {
            return Err(KernelError::NotMapped {
                addr: vaddr.as_u64(),
            });
        }
        self.write(leaf, idx, C::leaf(paddr, flags | PageFlags::PRESENT));
        Ok(())
    }

    /// Raw top-level entry access, for kernel-directory mirroring.
    pub fn top_entry(&self, index: usize) -> u64 {
        self.read(self.root, index)
    }

    pub fn set_top_entry(&self, index: usize, raw: u64) {
        self.write(self.root, index, raw);
    }

    /// Copy the kernel-half top-level entries from `src` into this root.
    /// No-op on architectures with a separate kernel root.
    pub fn adopt_kernel_half(&self, src: PhysAddr) {
        if !C::KERNEL_SHARED_TOP {
            return;
        }
        for idx in C::USER_TOP_ENTRIES..C::GEOMETRY.entries_per_table() {
            self.write(self.root, idx, self.read(src, idx));
        }
    }

    /// Clone the user half of `src` into this (empty) root, sharing leaf
    /// frames copy-on-write: writable leaves in `src` are downgraded to
    /// read-only + COW before being copied, and `on_share` runs for every
    /// shared frame (refcount increment).
    ///
    /// Intermediate tables are never shared. On failure the partially built
    /// user half is torn down again with `on_unshare` applied to every frame
    /// that `on_share` saw; the COW downgrades in `src` are left in place,
    /// which is safe (the next parent write takes the single-reference COW
    /// path and restores WRITE).
    pub fn clone_user_half(
        &self,
        src: PhysAddr,
        on_share: &mut dyn FnMut(PhysAddr),
        on_unshare: &mut dyn FnMut(PhysAddr),
    ) -> KernelResult<()> {
        let g = C::GEOMETRY;
        for idx in 0..C::USER_TOP_ENTRIES {
            let raw = self.read(src, idx);
            if !C::is_present(raw) {
                continue;
            }
            match self.clone_subtree(C::addr_of(raw), g.levels - 2, on_share, on_unshare) {
                Ok(sub) => self.write(self.root, idx, C::table(sub)),
                Err(e) => {
                    // The failing subtree unwound itself; unwind the top
                    // entries that were completed before it.
                    self.teardown_user_half(on_unshare);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn clone_subtree(
        &self,
        src_table: PhysAddr,
        level: usize,
        on_share: &mut dyn FnMut(PhysAddr),
        on_unshare: &mut dyn FnMut(PhysAddr),
    ) -> KernelResult<PhysAddr> {
        let g = C::GEOMETRY;
        let new = self.source.alloc_table()?;
        for idx in 0..g.entries_per_table() {
            let raw = self.read(src_table, idx);
            if !C::is_present(raw) {
                continue;
            }
            if level == 0 {
                let flags = C::decode(raw);
                let shared = if flags.contains(PageFlags::WRITE) {
                    let downgraded =
                        C::leaf(C::addr_of(raw), (flags - PageFlags::WRITE) | PageFlags::COW);
                    self.write(src_table, idx, downgraded);
                    downgraded
                } else {
                    raw
                };
                self.write(new, idx, shared);
                on_share(C::addr_of(raw));
            } else {
                if C::is_large(raw) {
                    self.teardown_subtree(new, level, on_unshare);
                    return Err(KernelError::CorruptionDetected {
                        subsystem: "vmm",
                        detail: "large mapping in user clone",
                    });
                }
                match self.clone_subtree(C::addr_of(raw), level - 1, on_share, on_unshare) {
                    Ok(sub) => self.write(new, idx, C::table(sub)),
                    Err(e) => {
                        // Unwind everything this subtree accumulated,
                        // refcounts included, before propagating.
                        self.teardown_subtree(new, level, on_unshare);
                        return Err(e);
                    }
                }
            }
        }
        Ok(new)
    }

    /// Free every user intermediate table and clear the user top-level
    /// entries, invoking `on_leaf` for each mapped leaf frame.
    pub fn teardown_user_half(&self, on_leaf: &mut dyn FnMut(PhysAddr)) {
        let g = C::GEOMETRY;
        for idx in 0..C::USER_TOP_ENTRIES {
            let raw = self.read(self.root, idx);
            if !C::is_present(raw) {
                continue;
            }
            self.teardown_subtree(C::addr_of(raw), g.levels - 2, on_leaf);
            self.write(self.root, idx, 0);
        }
    }

    fn teardown_subtree(&self, table: PhysAddr, level: usize, on_leaf: &mut dyn FnMut(PhysAddr)) {
        let g = C::GEOMETRY;
        for idx in 0..g.entries_per_table() {
            let raw = self.read(table, idx);
            if !C::is_present(raw) {
                continue;
            }
            if level == 0 {
                on_leaf(C::addr_of(raw));
            } else if !C::is_large(raw) {
                self.teardown_subtree(C::addr_of(raw), level - 1, on_leaf);
            }
        }
        self.source.free_table(table);
    }

    /// Visit every present leaf under the given top-level entry range.
    /// The callback receives the (sign-extended) virtual address and the raw
    /// entry.
    pub fn visit_leaves(&self, top_range: Range<usize>, f: &mut dyn FnMut(VirtAddr, u64)) {
        let g = C::GEOMETRY;
        let top = g.levels - 1;
        for idx in top_range {
            let raw = self.read(self.root, idx);
            if !C::is_present(raw) || C::is_large(raw) {
                continue;
            }
            let base = sign_extend(
                (idx as u64) << g.shifts[top],
                g.shifts[top] + g.index_bits,
                g.levels,
            );
            self.visit_subtree(C::addr_of(raw), top - 1, base, f);
        }
    }

    fn visit_subtree(
        &self,
        table: PhysAddr,
        level: usize,
        base: u64,
        f: &mut dyn FnMut(VirtAddr, u64),
    ) {
        let g = C::GEOMETRY;
        for idx in 0..g.entries_per_table() {
            let raw = self.read(table, idx);
            if !C::is_present(raw) {
                continue;
            }
            let va = base + ((idx as u64) << g.shifts[level]);
            if level == 0 {
                f(VirtAddr::new(va), raw);
            } else if !C::is_large(raw) {
                self.visit_subtree(C::addr_of(raw), level - 1, va, f);
            }
        }
    }
}

/// Canonicalize a partially-built virtual address. Only the 4-level layouts
/// use the upper-half sign extension; 32-bit addresses pass through.
fn sign_extend(va: u64, va_bits: u32, levels: usize) -> u64 {
    if levels < 4 || va & (1 << (va_bits - 1)) == 0 {
        va
    } else {
        va | !((1u64 << va_bits) - 1)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::pte::{X86Codec, X86_64Codec};
    use crate::mm::testutil::TestArena;
    use crate::mm::PAGE_SIZE;

    fn new_root(arena: &TestArena) -> PhysAddr {
        arena.alloc_table().expect("root table allocation")
    }

    #[test]
    fn test_map_query_unmap_roundtrip() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86_64Codec, _> = Walker::new(root, &arena);

        let frame = arena.pmm.alloc_frame();
        let cases = [
            PageFlags::PRESENT | PageFlags::WRITE,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::EXEC,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::NOCACHE,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::WRITECOMB,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::COW,
        ];
        for flags in cases {
            let v = VirtAddr::new(0x40_0000);
            w.map(v, frame, flags).expect("map succeeds");
            let (p, got) = w.query(v).expect("mapped address queries");
            assert_eq!(p, frame);
            assert!(got.contains(flags), "{:?} missing from {:?}", flags, got);

            assert_eq!(w.unmap(v), frame);
            assert!(w.query(v).is_none(), "unmapped address must not query");
            assert_eq!(w.unmap(v), PhysAddr::INVALID);
        }
    }

    #[test]
    fn test_map_overwrites_by_design() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86_64Codec, _> = Walker::new(root, &arena);

        let f1 = arena.pmm.alloc_frame();
        let f2 = arena.pmm.alloc_frame();
        let v = VirtAddr::new(0x1000);
        w.map(v, f1, PageFlags::KERNEL_DATA).expect("first map");
        w.map(v, f2, PageFlags::KERNEL_DATA).expect("overwriting map");
        assert_eq!(w.query(v).map(|(p, _)| p), Some(f2));
    }

    #[test]
    fn test_intermediate_tables_allocated_lazily() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86_64Codec, _> = Walker::new(root, &arena);
        let frame = arena.pmm.alloc_frame();

        let free_before = arena.pmm.get_info().free_frames;
        let outcome = w
            .map(VirtAddr::new(0x2000_0000), frame, PageFlags::KERNEL_DATA)
            .expect("map");
        assert!(outcome.top_entry_created);
        // Three intermediate tables for a fresh 4-level path.
        assert_eq!(arena.pmm.get_info().free_frames, free_before - 3);

        // A second page in the same leaf table needs no new tables.
        let outcome = w
            .map(VirtAddr::new(0x2000_1000), frame, PageFlags::KERNEL_DATA)
            .expect("map sibling");
        assert!(!outcome.top_entry_created);
        assert_eq!(arena.pmm.get_info().free_frames, free_before - 3);
    }

    #[test]
    fn test_protect_modifies_flags_in_place() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86_64Codec, _> = Walker::new(root, &arena);
        let frame = arena.pmm.alloc_frame();
        let v = VirtAddr::new(0x7000);

        w.map(v, frame, PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER)
            .expect("map");
        w.protect(v, PageFlags::COW, PageFlags::WRITE).expect("protect");

        let (p, flags) = w.query(v).expect("still mapped");
        assert_eq!(p, frame);
        assert!(flags.contains(PageFlags::COW));
        assert!(!flags.contains(PageFlags::WRITE));
        assert!(flags.contains(PageFlags::USER));

        assert!(matches!(
            w.protect(VirtAddr::new(0xdead_000), PageFlags::COW, PageFlags::empty()),
            Err(KernelError::NotMapped { .. })
        ));
    }

    #[test]
    fn test_two_level_walk_and_leaf_table_reclaim() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86Codec, _> = Walker::new(root, &arena);
        let frame = arena.pmm.alloc_frame();
        let v = VirtAddr::new(0x0080_3000);

        let free_before = arena.pmm.get_info().free_frames;
        w.map(v, frame, PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER)
            .expect("map");
        assert_eq!(arena.pmm.get_info().free_frames, free_before - 1);
        assert_eq!(w.query(v).map(|(p, _)| p), Some(frame));

        // Unmapping the only entry frees the leaf table on 2-level layouts.
        assert_eq!(w.unmap(v), frame);
        assert_eq!(arena.pmm.get_info().free_frames, free_before);
        assert!(w.query(v).is_none());
    }

    #[test]
    fn test_visit_leaves_enumerates_mappings() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86_64Codec, _> = Walker::new(root, &arena);
        let frame = arena.pmm.alloc_frame();

        let addrs = [0x1000u64, 0x3000, 0x20_0000, 0x4000_0000];
        for &a in &addrs {
            w.map(VirtAddr::new(a), frame, PageFlags::KERNEL_DATA)
                .expect("map");
        }
        let mut seen = alloc::vec::Vec::new();
        w.visit_leaves(0..X86_64Codec::USER_TOP_ENTRIES, &mut |v, raw| {
            assert!(X86_64Codec::is_present(raw));
            seen.push(v.as_u64());
        });
        seen.sort_unstable();
        assert_eq!(seen, addrs);
    }

    #[test]
    fn test_teardown_user_half_releases_tables() {
        let arena = TestArena::new(64);
        let root = new_root(&arena);
        let w: Walker<X86_64Codec, _> = Walker::new(root, &arena);
        let frame = arena.pmm.alloc_frame();
        let free_before = arena.pmm.get_info().free_frames;

        w.map(VirtAddr::new(0x1000), frame, PageFlags::KERNEL_DATA)
            .expect("map");
        w.map(VirtAddr::new(0x8000_0000), frame, PageFlags::KERNEL_DATA)
            .expect("map");

        let mut leaves = 0;
        w.teardown_user_half(&mut |p| {
            assert_eq!(p, frame);
            leaves += 1;
        });
        assert_eq!(leaves, 2);
        assert_eq!(arena.pmm.get_info().free_frames, free_before);
        assert!(w.query(VirtAddr::new(0x1000)).is_none());
    }
}
