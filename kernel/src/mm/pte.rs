//! Page-table entry codecs
//!
//! Each supported architecture gets a [`PteCodec`]: the table geometry
//! (levels, shifts, entries per table) plus the translation between the
//! neutral [`PageFlags`] and the hardware PTE bits. The codecs are pure bit
//! arithmetic and are compiled on every target, which keeps the generic
//! walker testable off-target.
//!
//! The COW marker always lives in a software-available bit: bit 9 on the x86
//! family (first OS-available bit), bit 55 on AArch64 (first software-defined
//! descriptor bit).

use super::{PageFlags, PhysAddr};

/// Shape of a page-table hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct TableGeometry {
    /// Number of translation levels (2 on 32-bit x86, 4 elsewhere).
    pub levels: usize,
    /// Bytes per entry (4 on 32-bit x86, 8 elsewhere).
    pub entry_bytes: usize,
    /// Index width per level (10 on 32-bit x86, 9 elsewhere).
    pub index_bits: u32,
    /// Virtual-address shift per level, leaf level first. Unused slots are 0.
    pub shifts: [u32; 4],
}

impl TableGeometry {
    pub const fn entries_per_table(&self) -> usize {
        1 << self.index_bits
    }

    /// Table index of `vaddr` at `level` (0 = leaf level).
    pub const fn index_of(&self, vaddr: u64, level: usize) -> usize {
        ((vaddr >> self.shifts[level]) & ((1 << self.index_bits) - 1)) as usize
    }

    /// Span of virtual address covered by one entry at `level`.
    pub const fn entry_span(&self, level: usize) -> u64 {
        1u64 << self.shifts[level]
    }
}

/// Hardware encoding of one architecture's page-table entries.
///
/// Implemented by zero-sized marker types; everything is associated consts
/// and pure functions so the walker can be generic over the codec.
pub trait PteCodec {
    const GEOMETRY: TableGeometry;

    /// Mask extracting the physical address from a raw entry.
    const ADDR_MASK: u64;

    /// Number of top-level entries that belong to user space. Entries at and
    /// above this index are kernel-half (shared across address spaces). On
    /// architectures with a separate kernel root (AArch64 TTBR1) this is the
    /// full table and [`Self::KERNEL_SHARED_TOP`] is false.
    const USER_TOP_ENTRIES: usize;

    /// Whether the kernel half shares top-level entries with user space in
    /// the same root table (x86 family) rather than using a separate root.
    const KERNEL_SHARED_TOP: bool;

    /// Encode neutral flags into raw PTE bits (leaf entries).
    fn encode(flags: PageFlags) -> u64;

    /// Decode raw PTE bits back into neutral flags.
    fn decode(raw: u64) -> PageFlags;

    /// Raw leaf entry mapping `addr` with `flags`.
    fn leaf(addr: PhysAddr, flags: PageFlags) -> u64 {
        (addr.as_u64() & Self::ADDR_MASK) | Self::encode(flags)
    }

    /// Raw intermediate entry pointing at the next-level table at `addr`.
    /// Permissive at non-leaf levels; leaf entries enforce access rights.
    fn table(addr: PhysAddr) -> u64;

    /// Physical address referenced by a raw entry.
    fn addr_of(raw: u64) -> PhysAddr {
        PhysAddr::new(raw & Self::ADDR_MASK)
    }

    fn is_present(raw: u64) -> bool;

    /// Whether a present non-leaf entry is a large/block mapping rather than
    /// a pointer to the next table. The walker only ever installs 4 KiB
    /// mappings; this detects foreign entries inherited from boot firmware.
    fn is_large(raw: u64) -> bool;
}

// ---------------------------------------------------------------------------
// x86-64: 4-level long mode paging
// ---------------------------------------------------------------------------

/// x86-64 long-mode PTE format.
pub struct X86_64Codec;

mod x86_64_bits {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const PWT: u64 = 1 << 3;
    pub const PCD: u64 = 1 << 4;
    pub const ACCESSED: u64 = 1 << 5;
    pub const DIRTY: u64 = 1 << 6;
    pub const PAT: u64 = 1 << 7;
    pub const COW: u64 = 1 << 9;
    pub const NX: u64 = 1 << 63;
}

impl PteCodec for X86_64Codec {
    const GEOMETRY: TableGeometry = TableGeometry {
        levels: 4,
        entry_bytes: 8,
        index_bits: 9,
        shifts: [12, 21, 30, 39],
    };

    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    // Kernel half starts at 0xFFFF_8000_0000_0000 -> PML4 index 256.
    const USER_TOP_ENTRIES: usize = 256;
    const KERNEL_SHARED_TOP: bool = true;

    fn encode(flags: PageFlags) -> u64 {
        use x86_64_bits as b;
        let mut raw = 0;
        if flags.contains(PageFlags::PRESENT) {
            raw |= b::PRESENT;
        }
        if flags.contains(PageFlags::WRITE) {
            raw |= b::WRITE;
        }
        if flags.contains(PageFlags::USER) {
            raw |= b::USER;
        }
        if !flags.contains(PageFlags::EXEC) {
            raw |= b::NX;
        }
        if flags.contains(PageFlags::NOCACHE) {
            raw |= b::PCD;
        }
        if flags.contains(PageFlags::WRITECOMB) {
            // PAT entry 5 (PAT=1, PCD=0, PWT=1), programmed to WC at cpu init.
            raw |= b::PAT | b::PWT;
        }
        if flags.contains(PageFlags::COW) {
            raw |= b::COW;
        }
        if flags.contains(PageFlags::DIRTY) {
            raw |= b::DIRTY;
        }
        if flags.contains(PageFlags::ACCESSED) {
            raw |= b::ACCESSED;
        }
        raw
    }

    fn decode(raw: u64) -> PageFlags {
        use x86_64_bits as b;
        let mut flags = PageFlags::empty();
        if raw & b::PRESENT == 0 {
            return flags;
        }
        flags |= PageFlags::PRESENT;
        if raw & b::WRITE != 0 {
            flags |= PageFlags::WRITE;
        }
        if raw & b::USER != 0 {
            flags |= PageFlags::USER;
        }
        if raw & b::NX == 0 {
            flags |= PageFlags::EXEC;
        }
        if raw & b::PCD != 0 {
            flags |= PageFlags::NOCACHE;
        }
        if raw & b::PAT != 0 && raw & b::PCD == 0 {
            flags |= PageFlags::WRITECOMB;
        }
        if raw & b::COW != 0 {
            flags |= PageFlags::COW;
        }
        if raw & b::DIRTY != 0 {
            flags |= PageFlags::DIRTY;
        }
        if raw & b::ACCESSED != 0 {
            flags |= PageFlags::ACCESSED;
        }
        flags
    }

    fn table(addr: PhysAddr) -> u64 {
        use x86_64_bits as b;
        (addr.as_u64() & Self::ADDR_MASK) | b::PRESENT | b::WRITE | b::USER
    }

    fn is_present(raw: u64) -> bool {
        raw & x86_64_bits::PRESENT != 0
    }

    fn is_large(raw: u64) -> bool {
        // PS bit; only meaningful at non-leaf levels, where the walker
        // checks it.
        raw & x86_64_bits::PAT != 0
    }
}

// ---------------------------------------------------------------------------
// 32-bit x86: 2-level paging, no PAE
// ---------------------------------------------------------------------------

/// 32-bit x86 PTE format (2-level, 1024 entries per table).
///
/// Without PAE there is no NX bit: every present page is executable, so the
/// `EXEC` flag round-trips as always-set on present entries.
pub struct X86Codec;

impl PteCodec for X86Codec {
    const GEOMETRY: TableGeometry = TableGeometry {
        levels: 2,
        entry_bytes: 4,
        index_bits: 10,
        shifts: [12, 22, 0, 0],
    };

    const ADDR_MASK: u64 = 0xFFFF_F000;

    // Kernel half starts at 0xC000_0000 -> page-directory index 768.
    const USER_TOP_ENTRIES: usize = 768;
    const KERNEL_SHARED_TOP: bool = true;

    fn encode(flags: PageFlags) -> u64 {
        use x86_64_bits as b;
        let mut raw = 0;
        if flags.contains(PageFlags::PRESENT) {
            raw |= b::PRESENT;
        }
        if flags.contains(PageFlags::WRITE) {
            raw |= b::WRITE;
        }
        if flags.contains(PageFlags::USER) {
            raw |= b::USER;
        }
        if flags.contains(PageFlags::NOCACHE) {
            raw |= b::PCD;
        }
        if flags.contains(PageFlags::WRITECOMB) {
            raw |= b::PAT | b::PWT;
        }
        if flags.contains(PageFlags::COW) {
            raw |= b::COW;
        }
        if flags.contains(PageFlags::DIRTY) {
            raw |= b::DIRTY;
        }
        if flags.contains(PageFlags::ACCESSED) {
            raw |= b::ACCESSED;
        }
        raw
    }

    fn decode(raw: u64) -> PageFlags {
        use x86_64_bits as b;
        let mut flags = PageFlags::empty();
        if raw & b::PRESENT == 0 {
            return flags;
        }
        // No NX without PAE.
        flags |= PageFlags::PRESENT | PageFlags::EXEC;
        if raw & b::WRITE != 0 {
            flags |= PageFlags::WRITE;
        }
        if raw & b::USER != 0 {
            flags |= PageFlags::USER;
        }
        if raw & b::PCD != 0 {
            flags |= PageFlags::NOCACHE;
        }
        if raw & b::PAT != 0 && raw & b::PCD == 0 {
            flags |= PageFlags::WRITECOMB;
        }
        if raw & b::COW != 0 {
            flags |= PageFlags::COW;
        }
        if raw & b::DIRTY != 0 {
            flags |= PageFlags::DIRTY;
        }
        if raw & b::ACCESSED != 0 {
            flags |= PageFlags::ACCESSED;
        }
        flags
    }

    fn table(addr: PhysAddr) -> u64 {
        use x86_64_bits as b;
        (addr.as_u64() & Self::ADDR_MASK) | b::PRESENT | b::WRITE | b::USER
    }

    fn is_present(raw: u64) -> bool {
        raw & x86_64_bits::PRESENT != 0
    }

    fn is_large(raw: u64) -> bool {
        raw & x86_64_bits::PAT != 0
    }
}

// ---------------------------------------------------------------------------
// AArch64: 4-level, 4 KiB granule, separate TTBR1 kernel root
// ---------------------------------------------------------------------------

/// AArch64 stage-1 descriptor format (4 KiB granule).
///
/// MAIR attribute indices are fixed at CPU init: 0 = normal write-back,
/// 1 = Device-nGnRnE, 2 = normal non-cacheable (the write-combining
/// analogue).
pub struct A64Codec;

mod a64_bits {
    pub const VALID: u64 = 1 << 0;
    /// Page (level 3) or table (levels 0-2) descriptor.
    pub const PAGE: u64 = 1 << 1;
    pub const ATTR_SHIFT: u32 = 2;
    pub const ATTR_MASK: u64 = 0b111 << 2;
    pub const ATTR_DEVICE: u64 = 1 << 2;
    pub const ATTR_NC: u64 = 2 << 2;
    /// AP[1]: accessible from EL0.
    pub const AP_EL0: u64 = 1 << 6;
    /// AP[2]: read-only.
    pub const AP_RO: u64 = 1 << 7;
    /// SH[1:0] = 0b11: inner shareable.
    pub const SH_INNER: u64 = 0b11 << 8;
    /// Access flag; we never take access-flag faults.
    pub const AF: u64 = 1 << 10;
    pub const PXN: u64 = 1 << 53;
    pub const UXN: u64 = 1 << 54;
    pub const COW: u64 = 1 << 55;
    pub const DIRTY: u64 = 1 << 56;
}

impl PteCodec for A64Codec {
    const GEOMETRY: TableGeometry = TableGeometry {
        levels: 4,
        entry_bytes: 8,
        index_bits: 9,
        shifts: [12, 21, 30, 39],
    };

    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    // TTBR0 roots are entirely user space; the kernel half lives in the
    // TTBR1 tree, so nothing is shared inside a user root.
    const USER_TOP_ENTRIES: usize = 512;
    const KERNEL_SHARED_TOP: bool = false;

    fn encode(flags: PageFlags) -> u64 {
        use a64_bits as b;
        let mut raw = 0;
        if flags.contains(PageFlags::PRESENT) {
            raw |= b::VALID | b::PAGE | b::AF;
        }
        if !flags.contains(PageFlags::WRITE) {
            raw |= b::AP_RO;
        }
        if flags.contains(PageFlags::USER) {
            raw |= b::AP_EL0;
        }
        if flags.contains(PageFlags::EXEC) {
            // Executable from exactly one privilege level.
            if flags.contains(PageFlags::USER) {
                raw |= b::PXN;
            } else {
                raw |= b::UXN;
            }
        } else {
            raw |= b::UXN | b::PXN;
        }
        if flags.contains(PageFlags::NOCACHE) {
            raw |= b::ATTR_DEVICE;
        } else if flags.contains(PageFlags::WRITECOMB) {
            raw |= b::ATTR_NC | b::SH_INNER;
        } else {
            // Attribute index 0: normal write-back, inner shareable.
            raw |= b::SH_INNER;
        }
        if flags.contains(PageFlags::COW) {
            raw |= b::COW;
        }
        if flags.contains(PageFlags::DIRTY) {
            raw |= b::DIRTY;
        }
        if flags.contains(PageFlags::ACCESSED) {
            raw |= b::AF;
        }
        raw
    }

    fn decode(raw: u64) -> PageFlags {
        use a64_bits as b;
        let mut flags = PageFlags::empty();
        if raw & b::VALID == 0 {
            return flags;
        }
        flags |= PageFlags::PRESENT;
        if raw & b::AP_RO == 0 {
            flags |= PageFlags::WRITE;
        }
        if raw & b::AP_EL0 != 0 {
            flags |= PageFlags::USER;
        }
        let user = raw & b::AP_EL0 != 0;
        let xn = if user { b::UXN } else { b::PXN };
        if raw & xn == 0 {
            flags |= PageFlags::EXEC;
        }
        match raw & b::ATTR_MASK {
            b::ATTR_DEVICE => flags |= PageFlags::NOCACHE,
            b::ATTR_NC => flags |= PageFlags::WRITECOMB,
            _ => {}
        }
        if raw & b::COW != 0 {
            flags |= PageFlags::COW;
        }
        if raw & b::DIRTY != 0 {
            flags |= PageFlags::DIRTY;
        }
        if raw & b::AF != 0 {
            flags |= PageFlags::ACCESSED;
        }
        flags
    }

    fn table(addr: PhysAddr) -> u64 {
        use a64_bits as b;
        (addr.as_u64() & Self::ADDR_MASK) | b::VALID | b::PAGE
    }

    fn is_present(raw: u64) -> bool {
        raw & a64_bits::VALID != 0
    }

    fn is_large(raw: u64) -> bool {
        // Block descriptor: valid with the table/page bit clear.
        raw & (a64_bits::VALID | a64_bits::PAGE) == a64_bits::VALID
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn roundtrip<C: PteCodec>(flags: PageFlags) -> PageFlags {
        C::decode(C::encode(flags))
    }

    #[test]
    fn test_x86_64_roundtrip() {
        for flags in [
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::ACCESSED,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::EXEC,
            PageFlags::PRESENT | PageFlags::COW | PageFlags::USER,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::NOCACHE,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::WRITECOMB,
            PageFlags::PRESENT | PageFlags::DIRTY | PageFlags::WRITE,
        ] {
            assert_eq!(roundtrip::<X86_64Codec>(flags), flags, "flags {:?}", flags);
        }
    }

    #[test]
    fn test_a64_roundtrip() {
        // PRESENT implies AF on AArch64, so ACCESSED is always part of the
        // decoded set for a present page.
        for flags in [
            PageFlags::PRESENT | PageFlags::WRITE,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::EXEC,
            PageFlags::PRESENT | PageFlags::COW | PageFlags::USER,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::NOCACHE,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::WRITECOMB,
        ] {
            assert_eq!(
                roundtrip::<A64Codec>(flags),
                flags | PageFlags::ACCESSED,
                "flags {:?}",
                flags
            );
        }
    }

    #[test]
    fn test_x86_roundtrip_no_nx() {
        // 32-bit x86 cannot express no-execute: present pages decode EXEC.
        let flags = PageFlags::PRESENT | PageFlags::WRITE;
        assert_eq!(
            roundtrip::<X86Codec>(flags),
            flags | PageFlags::EXEC
        );
    }

    #[test]
    fn test_cow_is_software_bit() {
        // The COW marker must not collide with any hardware-meaningful bit:
        // adding it never changes the other decoded flags.
        let base = PageFlags::PRESENT | PageFlags::USER;
        for (enc, dec) in [
            (
                X86_64Codec::encode(base | PageFlags::COW),
                X86_64Codec::decode as fn(u64) -> PageFlags,
            ),
            (
                A64Codec::encode(base | PageFlags::COW),
                A64Codec::decode as fn(u64) -> PageFlags,
            ),
            (
                X86Codec::encode(base | PageFlags::COW),
                X86Codec::decode as fn(u64) -> PageFlags,
            ),
        ] {
            let decoded = dec(enc);
            assert!(decoded.contains(PageFlags::COW));
            assert!(decoded.contains(base));
        }
    }

    #[test]
    fn test_addr_extraction() {
        let addr = PhysAddr::new(0x1234_5000);
        let raw = X86_64Codec::leaf(addr, PageFlags::PRESENT | PageFlags::WRITE);
        assert_eq!(X86_64Codec::addr_of(raw), addr);
        let raw = A64Codec::table(addr);
        assert_eq!(A64Codec::addr_of(raw), addr);
        assert!(A64Codec::is_present(raw));
    }

    #[test]
    fn test_geometry_indexing() {
        let g = X86_64Codec::GEOMETRY;
        let v = 0xFFFF_8000_0012_3000u64;
        assert_eq!(g.index_of(v, 3), 256);
        assert_eq!(g.index_of(0x0000_0000_0040_0000, 1), 2);
        let g32 = X86Codec::GEOMETRY;
        assert_eq!(g32.index_of(0xC000_0000, 1), 768);
        assert_eq!(g32.entries_per_table(), 1024);
    }
}
