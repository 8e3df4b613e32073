//! 32-bit x86 trap entry
//!
//! Stubs normalize the stack (dummy error code where the CPU pushes none),
//! save segments and general-purpose registers into a [`RegFrame`], load
//! kernel data segments, and call the neutral dispatcher. Unlike long
//! mode, the CPU pushes SS:ESP only on privilege transitions: the last two
//! frame words are valid for user-mode traps only.

use core::cell::UnsafeCell;

use crate::trap::{SyncKind, TrapClass, TrapSource};

/// Software interrupt vector for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// First vector the PIC delivers external interrupts on.
pub const IRQ_BASE: u8 = 32;

/// Saved register state. Segments and GPRs are pushed by the stub;
/// `esp_dummy` is pushad's snapshot of the pre-pushad ESP and is ignored
/// on restore.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Valid only when the trap came from ring 3.
    pub useresp: u32,
    /// Valid only when the trap came from ring 3.
    pub ss: u32,
}

/// Frame bytes including the two user-mode-only words.
pub const FRAME_SIZE: usize = 76;

const _: () = assert!(core::mem::size_of::<RegFrame>() == FRAME_SIZE);

impl RegFrame {
    pub fn pc(&self) -> u64 {
        self.eip as u64
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.eip = pc as u32;
    }

    pub fn user_sp(&self) -> u64 {
        self.useresp as u64
    }

    pub fn came_from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// System-call number and arguments per the int 0x80 ABI:
    /// eax = number, args in ebx, ecx, edx, esi, edi, ebp.
    pub fn syscall_number(&self) -> u64 {
        self.eax as u64
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [
            self.ebx as u64,
            self.ecx as u64,
            self.edx as u64,
            self.esi as u64,
            self.edi as u64,
            self.ebp as u64,
        ]
    }

    /// Leave the saved PC on the instruction after the trap. The INT gate
    /// already saved the address following `int 0x80`; an entry style that
    /// left EIP on the trap instruction would add its length here.
    pub fn advance_syscall_pc(&mut self) {}

    /// Write the syscall return value into the argument-0 register slot.
    pub fn set_syscall_return(&mut self, value: u64) {
        self.eax = value as u32;
    }

    pub fn sync_kind(&self) -> SyncKind {
        match self.vector {
            3 => SyncKind::Breakpoint,
            14 => SyncKind::PageFault {
                raw_error: self.error_code as u64,
            },
            17 => SyncKind::Alignment,
            v if v == SYSCALL_VECTOR as u32 => SyncKind::Syscall,
            v => SyncKind::Unknown { code: v as u64 },
        }
    }

    pub fn irq_number(&self) -> Option<u32> {
        let v = self.vector;
        if (IRQ_BASE as u32..IRQ_BASE as u32 + 16).contains(&v) {
            Some(v - IRQ_BASE as u32)
        } else {
            None
        }
    }

    pub fn dump(&self) {
        crate::kprintln!(
            "eip={:#010x} cs={:#06x} eflags={:#010x} vec={:#x} err={:#x}",
            self.eip,
            self.cs,
            self.eflags,
            self.vector,
            self.error_code
        );
        crate::kprintln!(
            "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
            self.eax,
            self.ebx,
            self.ecx,
            self.edx
        );
        crate::kprintln!(
            "esi={:#010x} edi={:#010x} ebp={:#010x} ds={:#06x}",
            self.esi,
            self.edi,
            self.ebp,
            self.ds
        );
        if self.came_from_user() {
            crate::kprintln!("useresp={:#010x} ss={:#06x}", self.useresp, self.ss);
        }
    }
}

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
    "    pushad\n",
    "    push ds\n",
    "    push es\n",
    "    push fs\n",
    "    push gs\n",
    "    mov ax, 0x10\n",
    "    mov ds, ax\n",
    "    mov es, ax\n",
    "    mov fs, ax\n",
    "    mov gs, ax\n",
    "    cld\n",
    "    push esp\n",
    "    call x86_trap_dispatch\n",
    "    add esp, 4\n",
    "    pop gs\n",
    "    pop fs\n",
    "    pop es\n",
    "    pop ds\n",
    "    popad\n",
    "    add esp, 8\n",
    "    iretd\n",
    ".section .rodata\n",
    ".balign 4\n",
    ".global __trap_stub_table\n",
    "__trap_stub_table:\n",
    "    .long __trap_stub_0,  __trap_stub_1,  __trap_stub_2,  __trap_stub_3\n",
    "    .long __trap_stub_4,  __trap_stub_5,  __trap_stub_6,  __trap_stub_7\n",
    "    .long __trap_stub_8,  __trap_stub_9,  __trap_stub_10, __trap_stub_11\n",
    "    .long __trap_stub_12, __trap_stub_13, __trap_stub_14, __trap_stub_15\n",
    "    .long __trap_stub_16, __trap_stub_17, __trap_stub_18, __trap_stub_19\n",
    "    .long __trap_stub_20, __trap_stub_21, __trap_stub_22, __trap_stub_23\n",
    "    .long __trap_stub_24, __trap_stub_25, __trap_stub_26, __trap_stub_27\n",
    "    .long __trap_stub_28, __trap_stub_29, __trap_stub_30, __trap_stub_31\n",
    "    .long __trap_stub_32, __trap_stub_33, __trap_stub_34, __trap_stub_35\n",
    "    .long __trap_stub_36, __trap_stub_37, __trap_stub_38, __trap_stub_39\n",
    "    .long __trap_stub_40, __trap_stub_41, __trap_stub_42, __trap_stub_43\n",
    "    .long __trap_stub_44, __trap_stub_45, __trap_stub_46, __trap_stub_47\n",
    "    .long __trap_stub_128\n",
    ".section .text\n",
));

extern "C" {
    static __trap_stub_table: [u32; 49];
}

#[repr(C, align(8))]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn set(&mut self, handler: u32, dpl: u8) {
        self.offset_low = (handler & 0xFFFF) as u16;
        self.selector = super::gdt::KERNEL_CS;
        self.zero = 0;
        // Present 32-bit interrupt gate; IF is cleared on entry.
        self.type_attr = 0x8E | (dpl << 5);
        self.offset_high = (handler >> 16) as u16;
    }
}

struct SyncIdt(UnsafeCell<[IdtEntry; 256]>);

// SAFETY: Written once during single-CPU init, read only by the CPU.
unsafe impl Sync for SyncIdt {}

static IDT: SyncIdt = SyncIdt(UnsafeCell::new(
    [const { IdtEntry::missing() }; 256],
));

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Load the GDT/TSS and build and load the IDT. Interrupts stay masked.
pub fn init() {
    super::gdt::init();
    // SAFETY: Single-CPU init; the stub table is defined in the assembly
    // above with 49 entries.
    unsafe {
        let idt = &mut *IDT.0.get();
        for vector in 0..48 {
            idt[vector].set(__trap_stub_table[vector], 0);
        }
        idt[SYSCALL_VECTOR as usize].set(__trap_stub_table[48], 3);

        let idtr = DescriptorPointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: IDT.0.get() as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &idtr);
    }
}

/// Entry from the common assembly path.
#[no_mangle]
extern "C" fn x86_trap_dispatch(frame: &mut RegFrame) {
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
