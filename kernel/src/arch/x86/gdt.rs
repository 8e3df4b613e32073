//! 32-bit GDT and TSS, built by hand.
//!
//! Layout: null, kernel code (0x08), kernel data (0x10), user code
//! (0x1B), user data (0x23), TSS (0x28). The TSS carries SS0:ESP0 for
//! ring transitions.

use core::cell::UnsafeCell;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x18 | 3;
pub const USER_DS: u16 = 0x20 | 3;
const TSS_SEL: u16 = 0x28;

#[repr(C, packed)]
struct Tss {
    link: u32,
    esp0: u32,
    ss0: u32,
    _unused: [u32; 23],
}

struct SyncCell<T>(UnsafeCell<T>);

// SAFETY: Mutated only during single-CPU init and via word-sized ESP0
// stores; the CPU reads the fields afresh on each transition.
unsafe impl<T> Sync for SyncCell<T> {}

static TSS: SyncCell<Tss> = SyncCell(UnsafeCell::new(Tss {
    link: 0,
    esp0: 0,
    ss0: KERNEL_DS as u32,
    _unused: [0; 23],
}));

/// Flat 4 GiB segments: code/data for rings 0 and 3 plus the TSS slot
/// (patched with the TSS base at init).
static GDT: SyncCell<[u64; 6]> = SyncCell(UnsafeCell::new([
    0,
    0x00CF_9A00_0000_FFFF,
    0x00CF_9200_0000_FFFF,
    0x00CF_FA00_0000_FFFF,
    0x00CF_F200_0000_FFFF,
    0,
]));

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let mut desc = 0u64;
    desc |= (limit & 0xFFFF) as u64;
    desc |= ((base & 0xFF_FFFF) as u64) << 16;
    desc |= 0x89u64 << 40; // present, type 9 (available 32-bit TSS)
    desc |= (((limit >> 16) & 0xF) as u64) << 48;
    desc |= ((base >> 24) as u64) << 56;
    desc
}

pub fn init() {
    // SAFETY: Single-CPU init; patches the TSS slot, loads the GDT,
    // reloads the segment registers with a far return, and loads TR.
    unsafe {
        let tss_base = TSS.0.get() as u32;
        (*GDT.0.get())[5] = tss_descriptor(tss_base, core::mem::size_of::<Tss>() as u32 - 1);

        let gdtr = DescriptorPointer {
            limit: (core::mem::size_of::<[u64; 6]>() - 1) as u16,
            base: GDT.0.get() as u32,
        };
        core::arch::asm!(
            "lgdt [{gdtr}]",
            "mov ds, {sel:e}",
            "mov es, {sel:e}",
            "mov fs, {sel:e}",
            "mov gs, {sel:e}",
            "mov ss, {sel:e}",
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "ltr {tr:x}",
            gdtr = in(reg) &gdtr,
            sel = in(reg) KERNEL_DS as u32,
            cs = const KERNEL_CS as i32,
            tmp = out(reg) _,
            tr = in(reg) TSS_SEL as u32,
        );
    }
}

/// Install the kernel stack used on ring 3 to ring 0 transitions.
pub fn set_kernel_stack(top: u32) {
    // SAFETY: Word-sized store; the CPU reads ESP0 at transition time.
    unsafe { (*TSS.0.get()).esp0 = top };
}
