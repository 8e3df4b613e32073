//! GDT and TSS: kernel/user segments, the double-fault IST stack, and the
//! kernel stack used on privilege transitions.

use core::cell::UnsafeCell;

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct Stack(UnsafeCell<[u8; STACK_SIZE]>);

// SAFETY: Only the CPU writes here, and only while handling a double
// fault; the kernel merely takes the address.
unsafe impl Sync for Stack {}

static DOUBLE_FAULT_STACK: Stack = Stack(UnsafeCell::new([0; STACK_SIZE]));

/// The TSS needs a stable 'static address for the GDT descriptor while
/// staying writable (RSP0 changes per task). Individual field stores are
/// word-sized; the CPU reads the fields afresh on each transition.
struct SyncTss(UnsafeCell<TaskStateSegment>);

// SAFETY: Mutation is limited to single u64 field stores from one CPU;
// the descriptor base never changes.
unsafe impl Sync for SyncTss {}

static TSS: SyncTss = SyncTss(UnsafeCell::new(TaskStateSegment::new()));

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        // SAFETY: TSS is a static, so the reference is 'static; only field
        // values are mutated later, never the address.
        let tss = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

pub fn init() {
    // SAFETY: Single-CPU early boot; nothing else touches the TSS yet.
    unsafe {
        (*TSS.0.get()).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::new(DOUBLE_FAULT_STACK.0.get() as u64 + STACK_SIZE as u64);
    }
    GDT.0.load();
    // SAFETY: The selectors come from the GDT just loaded.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Install the kernel stack the CPU switches to on user-to-kernel
/// transitions (RSP0). Called before dropping to user mode.
pub fn set_kernel_stack(top: u64) {
    // SAFETY: Aligned u64 store into a static; the CPU reads RSP0 only at
    // transition time.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
