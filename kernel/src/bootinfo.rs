//! Boot-info adapter
//!
//! Normalizes the memory map handed over by the bootloader -- BIOS E820,
//! Multiboot(2) tag soup, or a flattened device tree -- into one [`BootInfo`]
//! record that feeds the PMM. Everything is stored inline in fixed-capacity
//! arrays so the record can be built before any allocator exists.

use crate::error::{KernelError, KernelResult};

/// Maximum number of normalized memory regions.
pub const MAX_REGIONS: usize = 32;

/// Maximum number of boot modules (initrd, user init image, ...).
pub const MAX_MODULES: usize = 8;

/// Maximum stored command-line length; longer lines are truncated.
pub const MAX_CMDLINE: usize = 128;

/// Which handover protocol produced this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootProtocol {
    /// Legacy BIOS with an E820 map.
    Bios,
    /// Multiboot 1.
    Multiboot,
    /// Multiboot 2.
    Multiboot2,
    /// Flattened device tree (AArch64 virt machine).
    DeviceTree,
}

/// Memory region classification after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Usable RAM.
    Usable,
    /// Reserved by firmware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Known-bad memory.
    BadMemory,
    /// Kernel image and boot modules.
    KernelAndModules,
    /// Unrecognized firmware type code.
    Unknown(u32),
}

/// One normalized memory region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }

    pub const fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Framebuffer description, when the bootloader provides one.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
}

/// A module loaded by the bootloader, identified by its physical extent.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub start: u64,
    pub end: u64,
}

/// The single record the rest of the kernel consumes.
pub struct BootInfo {
    pub protocol: BootProtocol,
    /// Sum of all usable region lengths.
    pub total_memory: u64,
    regions: [MemoryRegion; MAX_REGIONS],
    region_count: usize,
    cmdline: [u8; MAX_CMDLINE],
    cmdline_len: usize,
    pub framebuffer: Option<FramebufferInfo>,
    modules: [BootModule; MAX_MODULES],
    module_count: usize,
    /// Physical address of the raw bootloader structure, for collaborators
    /// that need protocol-specific data (e.g. the device-tree parser).
    pub arch_blob: u64,
}

impl BootInfo {
    pub const fn empty(protocol: BootProtocol) -> Self {
        Self {
            protocol,
            total_memory: 0,
            regions: [MemoryRegion::new(0, 0, RegionKind::Reserved); MAX_REGIONS],
            region_count: 0,
            cmdline: [0; MAX_CMDLINE],
            cmdline_len: 0,
            framebuffer: None,
            modules: [BootModule { start: 0, end: 0 }; MAX_MODULES],
            module_count: 0,
            arch_blob: 0,
        }
    }

    /// Append a region, accumulating `total_memory` for usable ones.
    /// Zero-length regions are dropped silently.
    pub fn add_region(&mut self, region: MemoryRegion) -> KernelResult<()> {
        if region.length == 0 {
            return Ok(());
        }
        if self.region_count == MAX_REGIONS {
            return Err(KernelError::ResourceExhausted {
                resource: "boot memory regions",
            });
        }
        self.regions[self.region_count] = region;
        self.region_count += 1;
        if region.is_usable() {
            self.total_memory += region.length;
        }
        Ok(())
    }

    pub fn add_module(&mut self, module: BootModule) -> KernelResult<()> {
        if self.module_count == MAX_MODULES {
            return Err(KernelError::ResourceExhausted {
                resource: "boot modules",
            });
        }
        self.modules[self.module_count] = module;
        self.module_count += 1;
        Ok(())
    }

    pub fn set_cmdline(&mut self, cmdline: &str) {
        let bytes = cmdline.as_bytes();
        let len = bytes.len().min(MAX_CMDLINE);
        self.cmdline[..len].copy_from_slice(&bytes[..len]);
        self.cmdline_len = len;
    }

    pub fn cmdline(&self) -> Option<&str> {
        if self.cmdline_len == 0 {
            None
        } else {
            core::str::from_utf8(&self.cmdline[..self.cmdline_len]).ok()
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.region_count]
    }

    pub fn modules(&self) -> &[BootModule] {
        &self.modules[..self.module_count]
    }

    pub fn usable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions().iter().filter(|r| r.is_usable())
    }

    /// Exclusive upper bound of usable RAM; sizes the PMM bitmap.
    pub fn highest_usable_addr(&self) -> u64 {
        self.usable_regions().map(|r| r.end()).max().unwrap_or(0)
    }
}

/// Map a BIOS E820 type code onto a [`RegionKind`].
fn classify_e820(typ: u32) -> RegionKind {
    match typ {
        1 => RegionKind::Usable,
        2 => RegionKind::Reserved,
        3 => RegionKind::AcpiReclaimable,
        4 => RegionKind::AcpiNvs,
        5 => RegionKind::BadMemory,
        other => RegionKind::Unknown(other),
    }
}

/// Build a record from an E820-style `(base, length, type)` table.
///
/// Used for both raw BIOS handover and the Multiboot memory-map tag, which
/// carries the same type codes.
pub fn from_e820(
    protocol: BootProtocol,
    entries: &[(u64, u64, u32)],
) -> KernelResult<BootInfo> {
    let mut info = BootInfo::empty(protocol);
    for &(base, length, typ) in entries {
        info.add_region(MemoryRegion::new(base, length, classify_e820(typ)))?;
    }
    Ok(info)
}

/// Build a record from a flattened device tree blob.
///
/// Reads the `/memory` nodes for RAM regions and `/chosen` for the command
/// line. The blob itself is registered as a reserved region so the PMM never
/// hands out the frames it occupies.
#[cfg(target_arch = "aarch64")]
pub fn from_dtb(dtb_phys: u64) -> KernelResult<BootInfo> {
    // SAFETY: The boot protocol guarantees a valid DTB at the address handed
    // over in x0; it is covered by the boot identity mapping at this point.
    let tree = unsafe { fdt::Fdt::from_ptr(dtb_phys as *const u8) }
        .map_err(|_| KernelError::InvalidAddress { addr: dtb_phys })?;

    let mut info = BootInfo::empty(BootProtocol::DeviceTree);
    info.arch_blob = dtb_phys;

    for region in tree.memory().regions() {
        let length = region.size.unwrap_or(0) as u64;
        info.add_region(MemoryRegion::new(
            region.starting_address as u64,
            length,
            RegionKind::Usable,
        ))?;
    }

    info.add_region(MemoryRegion::new(
        dtb_phys,
        tree.total_size() as u64,
        RegionKind::KernelAndModules,
    ))?;

    if let Some(chosen) = tree.chosen().bootargs() {
        info.set_cmdline(chosen);
    }

    Ok(info)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_e820_classification() {
        let info = from_e820(
            BootProtocol::Bios,
            &[
                (0x0, 0x9_F000, 1),
                (0x9_F000, 0x1000, 2),
                (0x10_0000, 0x7FF0_0000, 1),
                (0xFFF0_0000, 0x10_0000, 3),
            ],
        )
        .expect("4 regions fit the fixed capacity");

        assert_eq!(info.regions().len(), 4);
        assert_eq!(info.total_memory, 0x9_F000 + 0x7FF0_0000);
        assert_eq!(info.highest_usable_addr(), 0x8000_0000);
        assert_eq!(info.regions()[3].kind, RegionKind::AcpiReclaimable);
    }

    #[test]
    fn test_zero_length_regions_dropped() {
        let info = from_e820(BootProtocol::Bios, &[(0x1000, 0, 1), (0x2000, 0x1000, 1)])
            .expect("regions fit");
        assert_eq!(info.regions().len(), 1);
        assert_eq!(info.total_memory, 0x1000);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let info =
            from_e820(BootProtocol::Multiboot, &[(0, 0x1000, 42)]).expect("region fits");
        assert_eq!(info.regions()[0].kind, RegionKind::Unknown(42));
        assert_eq!(info.total_memory, 0);
    }

    #[test]
    fn test_region_capacity() {
        let mut info = BootInfo::empty(BootProtocol::Bios);
        for i in 0..MAX_REGIONS {
            info.add_region(MemoryRegion::new(
                i as u64 * 0x1000,
                0x1000,
                RegionKind::Usable,
            ))
            .expect("within capacity");
        }
        let overflow = info.add_region(MemoryRegion::new(0, 0x1000, RegionKind::Usable));
        assert!(overflow.is_err());
    }

    #[test]
    fn test_cmdline_truncation() {
        let mut info = BootInfo::empty(BootProtocol::Multiboot2);
        let long = "x".repeat(MAX_CMDLINE + 10);
        info.set_cmdline(&long);
        assert_eq!(info.cmdline().map(str::len), Some(MAX_CMDLINE));
    }
}
