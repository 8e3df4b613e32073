//! AArch64 exception entry
//!
//! A 16-entry EL1 vector table; every entry saves the full register state
//! into a [`RegFrame`] on the EL1 stack and calls the neutral dispatcher
//! with its class and source. The syndrome and fault address are read from
//! ESR_EL1/FAR_EL1 by the handlers rather than stored in the frame.

use crate::trap::{SyncKind, TrapClass, TrapSource};

/// Saved register state, layout matched byte-for-byte by the assembly
/// below: x0-x30, then SP_EL0, ELR_EL1, SPSR_EL1.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegFrame {
    pub x: [u64; 31],
    pub sp_el0: u64,
    pub elr: u64,
    pub spsr: u64,
}

/// Stack bytes the entry macro reserves; must stay 16-byte aligned.
pub const FRAME_SIZE: usize = 272;

const _: () = assert!(core::mem::size_of::<RegFrame>() == FRAME_SIZE);
const _: () = assert!(FRAME_SIZE % 16 == 0);

impl RegFrame {
    pub fn pc(&self) -> u64 {
        self.elr
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.elr = pc;
    }

    pub fn user_sp(&self) -> u64 {
        self.sp_el0
    }

    pub fn came_from_user(&self) -> bool {
        // SPSR.M[3:0] = 0b0000: EL0t.
        self.spsr & 0xF == 0
    }

    /// System-call number and arguments per the SVC ABI: x8 = number,
    /// arguments in x0-x5.
    pub fn syscall_number(&self) -> u64 {
        self.x[8]
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [self.x[0], self.x[1], self.x[2], self.x[3], self.x[4], self.x[5]]
    }

    /// Leave the saved PC on the instruction after the trap. SVC already
    /// left ELR_EL1 at the following instruction; nothing to do.
    pub fn advance_syscall_pc(&mut self) {}

    /// Write the return value into the argument-0 slot.
    pub fn set_syscall_return(&mut self, value: u64) {
        self.x[0] = value;
    }

    pub fn sync_kind(&self) -> SyncKind {
        let esr: u64;
        // SAFETY: ESR_EL1 still holds the syndrome of this exception; no
        // nested exception can have replaced it before dispatch.
        unsafe { core::arch::asm!("mrs {}, ESR_EL1", out(reg) esr) };
        match (esr >> 26) & 0x3F {
            0x15 => SyncKind::Syscall,
            0x20 | 0x21 | 0x24 | 0x25 => SyncKind::PageFault { raw_error: esr },
            0x22 | 0x26 => SyncKind::Alignment,
            0x3C => SyncKind::Breakpoint,
            _ => SyncKind::Unknown { code: esr },
        }
    }

    /// IRQ identification is the GIC's job on this architecture.
    pub fn irq_number(&self) -> Option<u32> {
        None
    }

    pub fn dump(&self) {
        crate::kprintln!(
            "elr={:#018x} spsr={:#018x} sp_el0={:#018x}",
            self.elr,
            self.spsr,
            self.sp_el0
        );
        for pair in (0..30).step_by(2) {
            crate::kprintln!(
                "x{:<2}={:#018x} x{:<2}={:#018x}",
                pair,
                self.x[pair],
                pair + 1,
                self.x[pair + 1]
            );
        }
        crate::kprintln!("x30={:#018x}", self.x[30]);
    }
}

// Vector table. Classes: 0 = Sync, 1 = IRQ, 2 = FIQ, 3 = SError.
// Sources: 0 = current EL with SP_EL0, 1 = current EL with SP_ELx,
// 2 = lower EL AArch64, 3 = lower EL AArch32.
core::arch::global_asm!(
    r#"
.macro trap_frame_entry class, source
    sub  sp, sp, #272
    stp  x0, x1,   [sp, #0]
    stp  x2, x3,   [sp, #16]
    stp  x4, x5,   [sp, #32]
    stp  x6, x7,   [sp, #48]
    stp  x8, x9,   [sp, #64]
    stp  x10, x11, [sp, #80]
    stp  x12, x13, [sp, #96]
    stp  x14, x15, [sp, #112]
    stp  x16, x17, [sp, #128]
    stp  x18, x19, [sp, #144]
    stp  x20, x21, [sp, #160]
    stp  x22, x23, [sp, #176]
    stp  x24, x25, [sp, #192]
    stp  x26, x27, [sp, #208]
    stp  x28, x29, [sp, #224]
    str  x30,      [sp, #240]
    mrs  x9, SP_EL0
    mrs  x10, ELR_EL1
    mrs  x11, SPSR_EL1
    str  x9,       [sp, #248]
    stp  x10, x11, [sp, #256]
    mov  x0, sp
    mov  x1, #\class
    mov  x2, #\source
    bl   aarch64_trap_dispatch
    ldr  x9,       [sp, #248]
    ldp  x10, x11, [sp, #256]
    msr  SP_EL0, x9
    msr  ELR_EL1, x10
    msr  SPSR_EL1, x11
    ldp  x0, x1,   [sp, #0]
    ldp  x2, x3,   [sp, #16]
    ldp  x4, x5,   [sp, #32]
    ldp  x6, x7,   [sp, #48]
    ldp  x8, x9,   [sp, #64]
    ldp  x10, x11, [sp, #80]
    ldp  x12, x13, [sp, #96]
    ldp  x14, x15, [sp, #112]
    ldp  x16, x17, [sp, #128]
    ldp  x18, x19, [sp, #144]
    ldp  x20, x21, [sp, #160]
    ldp  x22, x23, [sp, #176]
    ldp  x24, x25, [sp, #192]
    ldp  x26, x27, [sp, #208]
    ldp  x28, x29, [sp, #224]
    ldr  x30,      [sp, #240]
    add  sp, sp, #272
    eret
.endm

// A slot is 0x80 bytes; the save path does not fit, so every slot is a
// single branch to an out-of-line handler.
.section .text.vectors
.balign 2048
.global __exception_vectors
__exception_vectors:
    /* Current EL with SP_EL0 */
    b __trap_sync_sp0
    .balign 0x80
    b __trap_irq_sp0
    .balign 0x80
    b __trap_fiq_sp0
    .balign 0x80
    b __trap_serror_sp0
    .balign 0x80
    /* Current EL with SP_ELx */
    b __trap_sync_el1
    .balign 0x80
    b __trap_irq_el1
    .balign 0x80
    b __trap_fiq_el1
    .balign 0x80
    b __trap_serror_el1
    .balign 0x80
    /* Lower EL, AArch64 */
    b __trap_sync_el0
    .balign 0x80
    b __trap_irq_el0
    .balign 0x80
    b __trap_fiq_el0
    .balign 0x80
    b __trap_serror_el0
    .balign 0x80
    /* Lower EL, AArch32 */
    b __trap_sync_a32
    .balign 0x80
    b __trap_irq_a32
    .balign 0x80
    b __trap_fiq_a32
    .balign 0x80
    b __trap_serror_a32
    .balign 0x80

.section .text
__trap_sync_sp0:   trap_frame_entry 0, 0
__trap_irq_sp0:    trap_frame_entry 1, 0
__trap_fiq_sp0:    trap_frame_entry 2, 0
__trap_serror_sp0: trap_frame_entry 3, 0
__trap_sync_el1:   trap_frame_entry 0, 1
__trap_irq_el1:    trap_frame_entry 1, 1
__trap_fiq_el1:    trap_frame_entry 2, 1
__trap_serror_el1: trap_frame_entry 3, 1
__trap_sync_el0:   trap_frame_entry 0, 2
__trap_irq_el0:    trap_frame_entry 1, 2
__trap_fiq_el0:    trap_frame_entry 2, 2
__trap_serror_el0: trap_frame_entry 3, 2
__trap_sync_a32:   trap_frame_entry 0, 3
__trap_irq_a32:    trap_frame_entry 1, 3
__trap_fiq_a32:    trap_frame_entry 2, 3
__trap_serror_a32: trap_frame_entry 3, 3
"#
);

extern "C" {
    static __exception_vectors: u8;
}

/// Install the vector table. Interrupts stay masked.
pub fn init() {
    // SAFETY: Only the address of the table is taken; it is 2 KiB aligned
    // and fully populated by the assembly above.
    unsafe {
        let vbar = core::ptr::addr_of!(__exception_vectors) as u64;
        core::arch::asm!("msr VBAR_EL1, {}", "isb", in(reg) vbar);
    }
}

/// Entry from the vector macro.
#[no_mangle]
extern "C" fn aarch64_trap_dispatch(frame: &mut RegFrame, class: u64, source: u64) {
    let class = match class {
        0 => TrapClass::Sync,
        1 => TrapClass::Irq,
        2 => TrapClass::Fiq,
        _ => TrapClass::SError,
    };
    let source = match source {
        0 => TrapSource::KernelSp0,
        1 => TrapSource::Kernel,
        3 => TrapSource::UserAArch32,
        _ => TrapSource::User,
    };
    crate::trap::trap_handler(frame, class, source);
}
