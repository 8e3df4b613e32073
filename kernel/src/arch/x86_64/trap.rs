//! x86-64 trap entry
//!
//! Every vector funnels through a stub that normalizes the stack to a full
//! [`RegFrame`] (error-code-less vectors push a dummy 0) and jumps to the
//! common save path, which calls the neutral dispatcher with the frame.
//! In long mode the CPU pushes SS:RSP unconditionally, so the frame layout
//! is identical for kernel- and user-mode traps.

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::PrivilegeLevel;

use crate::trap::{SyncKind, TrapClass, TrapSource};

/// Software interrupt vector for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// First vector the PIC delivers external interrupts on.
pub const IRQ_BASE: u8 = 32;

/// Saved register state, layout matched byte-for-byte by the assembly
/// below: 15 general-purpose registers pushed by the stub, vector and
/// error code, then the five-word hardware frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Stack bytes the stub and hardware produce together.
pub const FRAME_SIZE: usize = 176;

const _: () = assert!(core::mem::size_of::<RegFrame>() == FRAME_SIZE);

impl RegFrame {
    pub fn pc(&self) -> u64 {
        self.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }

    pub fn user_sp(&self) -> u64 {
        self.rsp
    }

    pub fn came_from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// System-call number and arguments per the int 0x80 ABI:
    /// rax = number, args in rdi, rsi, rdx, r10, r8, r9.
    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    /// Leave the saved PC on the instruction after the trap. The INT gate
    /// already saved the address following `int 0x80`; an entry style that
    /// left RIP on the trap instruction would add its length here.
    pub fn advance_syscall_pc(&mut self) {}

    /// Write the syscall return value into the argument-0 register slot.
    pub fn set_syscall_return(&mut self, value: u64) {
        self.rax = value;
    }

    pub fn sync_kind(&self) -> SyncKind {
        match self.vector {
            3 => SyncKind::Breakpoint,
            14 => SyncKind::PageFault {
                raw_error: self.error_code,
            },
            17 => SyncKind::Alignment,
            v if v == SYSCALL_VECTOR as u64 => SyncKind::Syscall,
            v => SyncKind::Unknown { code: v },
        }
    }

    /// Physical IRQ line for external-interrupt vectors.
    pub fn irq_number(&self) -> Option<u32> {
        let v = self.vector;
        if (IRQ_BASE as u64..IRQ_BASE as u64 + 16).contains(&v) {
            Some((v - IRQ_BASE as u64) as u32)
        } else {
            None
        }
    }

    pub fn dump(&self) {
        crate::kprintln!(
            "rip={:#018x} cs={:#06x} rflags={:#018x} rsp={:#018x} ss={:#06x}",
            self.rip,
            self.cs,
            self.rflags,
            self.rsp,
            self.ss
        );
        crate::kprintln!(
            "vec={:#x} err={:#x} rax={:#018x} rbx={:#018x} rcx={:#018x}",
            self.vector,
            self.error_code,
            self.rax,
            self.rbx,
            self.rcx
        );
        crate::kprintln!(
            "rdx={:#018x} rsi={:#018x} rdi={:#018x} rbp={:#018x}",
            self.rdx,
            self.rsi,
            self.rdi,
            self.rbp
        );
        crate::kprintln!(
            "r8={:#018x} r9={:#018x} r10={:#018x} r11={:#018x}",
            self.r8,
            self.r9,
            self.r10,
            self.r11
        );
        crate::kprintln!(
            "r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
            self.r12,
            self.r13,
            self.r14,
            self.r15
        );
    }
}

// Stub generation. Vectors 8, 10-14, 17, 21, 29 and 30 push a hardware
// error code; the rest get a dummy 0 so the frame is uniform. The stub
// table at the end gives Rust the entry addresses without naming each
// stub individually.
macro_rules! trap_stub {
    ($vec:literal, err) => {
        concat!(
            "__trap_stub_",
            $vec,
            ":\n",
            "    push ",
            $vec,
            "\n",
            "    jmp __trap_common\n",
        )
    };
    ($vec:literal) => {
        concat!(
            "__trap_stub_",
            $vec,
            ":\n",
            "    push 0\n",
            "    push ",
            $vec,
            "\n",
            "    jmp __trap_common\n",
        )
    };
}

core::arch::global_asm!(concat!(
    ".section .text\n",
    trap_stub!(0),
    trap_stub!(1),
    trap_stub!(2),
    trap_stub!(3),
    trap_stub!(4),
    trap_stub!(5),
    trap_stub!(6),
    trap_stub!(7),
    trap_stub!(8, err),
    trap_stub!(9),
    trap_stub!(10, err),
    trap_stub!(11, err),
    trap_stub!(12, err),
    trap_stub!(13, err),
    trap_stub!(14, err),
    trap_stub!(15),
    trap_stub!(16),
    trap_stub!(17, err),
    trap_stub!(18),
    trap_stub!(19),
    trap_stub!(20),
    trap_stub!(21, err),
    trap_stub!(22),
    trap_stub!(23),
    trap_stub!(24),
    trap_stub!(25),
    trap_stub!(26),
    trap_stub!(27),
    trap_stub!(28),
    trap_stub!(29, err),
    trap_stub!(30, err),
    trap_stub!(31),
    trap_stub!(32),
    trap_stub!(33),
    trap_stub!(34),
    trap_stub!(35),
    trap_stub!(36),
    trap_stub!(37),
    trap_stub!(38),
    trap_stub!(39),
    trap_stub!(40),
    trap_stub!(41),
    trap_stub!(42),
    trap_stub!(43),
    trap_stub!(44),
    trap_stub!(45),
    trap_stub!(46),
    trap_stub!(47),
    trap_stub!(128),
    "__trap_common:\n",
    "    push r15\n",
    "    push r14\n",
    "    push r13\n",
    "    push r12\n",
    "    push r11\n",
    "    push r10\n",
    "    push r9\n",
    "    push r8\n",
    "    push rbp\n",
    "    push rdi\n",
    "    push rsi\n",
    "    push rdx\n",
    "    push rcx\n",
    "    push rbx\n",
    "    push rax\n",
    "    cld\n",
    "    mov rdi, rsp\n",
    "    call x86_64_trap_dispatch\n",
    "    pop rax\n",
    "    pop rbx\n",
    "    pop rcx\n",
    "    pop rdx\n",
    "    pop rsi\n",
    "    pop rdi\n",
    "    pop rbp\n",
    "    pop r8\n",
    "    pop r9\n",
    "    pop r10\n",
    "    pop r11\n",
    "    pop r12\n",
    "    pop r13\n",
    "    pop r14\n",
    "    pop r15\n",
    "    add rsp, 16\n",
    "    iretq\n",
    ".section .rodata\n",
    ".balign 8\n",
    ".global __trap_stub_table\n",
    "__trap_stub_table:\n",
    "    .quad __trap_stub_0,  __trap_stub_1,  __trap_stub_2,  __trap_stub_3\n",
    "    .quad __trap_stub_4,  __trap_stub_5,  __trap_stub_6,  __trap_stub_7\n",
    "    .quad __trap_stub_8,  __trap_stub_9,  __trap_stub_10, __trap_stub_11\n",
    "    .quad __trap_stub_12, __trap_stub_13, __trap_stub_14, __trap_stub_15\n",
    "    .quad __trap_stub_16, __trap_stub_17, __trap_stub_18, __trap_stub_19\n",
    "    .quad __trap_stub_20, __trap_stub_21, __trap_stub_22, __trap_stub_23\n",
    "    .quad __trap_stub_24, __trap_stub_25, __trap_stub_26, __trap_stub_27\n",
    "    .quad __trap_stub_28, __trap_stub_29, __trap_stub_30, __trap_stub_31\n",
    "    .quad __trap_stub_32, __trap_stub_33, __trap_stub_34, __trap_stub_35\n",
    "    .quad __trap_stub_36, __trap_stub_37, __trap_stub_38, __trap_stub_39\n",
    "    .quad __trap_stub_40, __trap_stub_41, __trap_stub_42, __trap_stub_43\n",
    "    .quad __trap_stub_44, __trap_stub_45, __trap_stub_46, __trap_stub_47\n",
    "    .quad __trap_stub_128\n",
    ".section .text\n",
));

extern "C" {
    static __trap_stub_table: [u64; 49];
}

fn stub(vector: u8) -> x86_64::VirtAddr {
    let index = if vector == SYSCALL_VECTOR { 48 } else { vector as usize };
    // SAFETY: The table is defined in the assembly above with 49 entries.
    x86_64::VirtAddr::new(unsafe { __trap_stub_table[index] })
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: Every address comes from the stub table; each stub ends
        // in iretq with the stack it was entered with.
        unsafe {
            idt.divide_error.set_handler_addr(stub(0));
            idt.debug.set_handler_addr(stub(1));
            idt.non_maskable_interrupt.set_handler_addr(stub(2));
            idt.breakpoint.set_handler_addr(stub(3));
            idt.overflow.set_handler_addr(stub(4));
            idt.bound_range_exceeded.set_handler_addr(stub(5));
            idt.invalid_opcode.set_handler_addr(stub(6));
            idt.device_not_available.set_handler_addr(stub(7));
            idt.double_fault
                .set_handler_addr(stub(8))
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
            idt.invalid_tss.set_handler_addr(stub(10));
            idt.segment_not_present.set_handler_addr(stub(11));
            idt.stack_segment_fault.set_handler_addr(stub(12));
            idt.general_protection_fault.set_handler_addr(stub(13));
            idt.page_fault.set_handler_addr(stub(14));
            idt.x87_floating_point.set_handler_addr(stub(16));
            idt.alignment_check.set_handler_addr(stub(17));
            idt.machine_check.set_handler_addr(stub(18));
            idt.simd_floating_point.set_handler_addr(stub(19));
            for vector in IRQ_BASE..IRQ_BASE + 16 {
                idt[vector].set_handler_addr(stub(vector));
            }
            idt[SYSCALL_VECTOR]
                .set_handler_addr(stub(SYSCALL_VECTOR))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

/// Load the GDT/TSS and the IDT. Interrupts stay masked.
pub fn init() {
    super::gdt::init();
    IDT.load();
}

/// Entry from the common assembly path.
#[no_mangle]
extern "C" fn x86_64_trap_dispatch(frame: &mut RegFrame) {
    let class = if frame.irq_number().is_some() {
        TrapClass::Irq
    } else {
        TrapClass::Sync
    };
    let source = if frame.came_from_user() {
        TrapSource::User
    } else {
        TrapSource::Kernel
    };
    crate::trap::trap_handler(frame, class, source);
}
