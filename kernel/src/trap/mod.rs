//! Trap and exception core
//!
//! The per-arch entry stubs save a full [`RegFrame`] and funnel every trap
//! into [`trap_handler`], which classifies it and either resumes the
//! interrupted context, terminates the faulting user task, or panics with
//! a register dump. The frame type itself is per-arch; the accessors the
//! dispatcher needs (PC, syscall registers, dump) are uniform.

use crate::hal;
use crate::mm::vmm;
use crate::mm::vmm::signal::{SIGBUS, SIGSEGV, SIGTRAP};

pub use crate::arch::trap::{RegFrame, FRAME_SIZE};

/// Exception class, from the vector that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapClass {
    /// Synchronous: faults, traps, system calls.
    Sync,
    /// Asynchronous interrupt request.
    Irq,
    /// Fast interrupt (AArch64 only).
    Fiq,
    /// System error / machine check.
    SError,
}

/// Where the exception came from: privilege level and, on AArch64, which
/// stack pointer was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapSource {
    /// Kernel mode on the early/SP0 stack.
    KernelSp0,
    /// Kernel mode.
    Kernel,
    /// User mode.
    User,
    /// 32-bit user mode (AArch64 only); unsupported.
    UserAArch32,
}

impl TrapSource {
    pub fn is_user(self) -> bool {
        matches!(self, TrapSource::User | TrapSource::UserAArch32)
    }
}

/// Decoded synchronous exception cause, produced per-arch from the vector
/// number or syndrome register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Syscall,
    PageFault { raw_error: u64 },
    Breakpoint,
    Alignment,
    Unknown { code: u64 },
}

/// Install the vector table and interrupt controller. Interrupts remain
/// masked until the first `interrupt_enable`.
pub fn init() {
    hal::interrupt_init();
    log::info!("trap: vectors installed");
}

/// Single dispatcher, called from the per-arch assembly stubs.
///
/// Returning resumes the interrupted context from the (possibly modified)
/// frame; the paths that must not resume diverge.
pub fn trap_handler(frame: &mut RegFrame, class: TrapClass, source: TrapSource) {
    match class {
        TrapClass::Sync => handle_sync(frame, source),
        TrapClass::Irq => crate::irq::dispatch(frame.irq_number()),
        TrapClass::Fiq => {
            // No FIQ users yet; note it and resume.
            log::warn!("trap: ignoring FIQ");
        }
        TrapClass::SError => {
            frame.dump();
            panic!("unrecoverable system error");
        }
    }
}

fn handle_sync(frame: &mut RegFrame, source: TrapSource) {
    match frame.sync_kind() {
        SyncKind::Syscall => handle_syscall(frame, source),
        SyncKind::PageFault { raw_error } => handle_page_fault(frame, source, raw_error),
        SyncKind::Alignment => {
            let pc = frame.pc();
            if source.is_user() {
                terminate_user_process(frame, SIGBUS, pc);
            }
            frame.dump();
            panic!("kernel alignment fault at {:#x}", pc);
        }
        SyncKind::Breakpoint => {
            let pc = frame.pc();
            crate::kprintln!("breakpoint at {:#x}", pc);
            frame.dump();
            if source.is_user() {
                terminate_user_process(frame, SIGTRAP, pc);
            }
            // A kernel breakpoint means a debug build went wrong; hold the
            // CPU with interrupts serviceable for post-mortem pokes.
            loop {
                hal::cpu_halt();
            }
        }
        SyncKind::Unknown { code } => {
            frame.dump();
            panic!("unknown exception {:#x} at {:#x}", code, frame.pc());
        }
    }
}

/// Marshal syscall arguments out of the frame and the return value back
/// into the argument-0 slot.
///
/// The saved PC must end up on the instruction after the trap before the
/// frame is resumed; `advance_syscall_pc` is the per-architecture step
/// that establishes this on entry styles whose hardware leaves the PC on
/// the trap instruction itself.
fn handle_syscall(frame: &mut RegFrame, source: TrapSource) {
    frame.advance_syscall_pc();
    match hal::syscall_handler() {
        Some(handler) => {
            let ret = handler(frame.syscall_number(), &frame.syscall_args());
            frame.set_syscall_return(ret);
        }
        None => {
            log::warn!(
                "trap: syscall {} with no handler registered",
                frame.syscall_number()
            );
            if source.is_user() {
                // -ENOSYS by convention.
                frame.set_syscall_return(-38i64 as u64);
            }
        }
    }
}

fn handle_page_fault(frame: &mut RegFrame, source: TrapSource, raw_error: u64) {
    let info = hal::mmu_parse_fault(raw_error);
    match vmm::handle_page_fault(&info) {
        Ok(()) => {} // resolved; retry the faulting access
        Err(err) => {
            if source.is_user() {
                let signal = match err {
                    crate::error::KernelError::UserFault { signal, .. } => signal,
                    _ => SIGSEGV,
                };
                terminate_user_process(frame, signal, info.fault_addr);
            }
            frame.dump();
            panic!(
                "kernel page fault at {:#x} (pc {:#x}): {}",
                info.fault_addr,
                frame.pc(),
                err
            );
        }
    }
}

/// Kill the current task over an unresolvable fault: record
/// `128 + signal` as the exit code and hand control to the task layer.
/// If the task layer cannot switch away, the CPU parks.
pub fn terminate_user_process(frame: &mut RegFrame, signal: u32, fault_addr: u64) -> ! {
    log::error!(
        "trap: terminating user task with signal {} (fault addr {:#x}, pc {:#x})",
        signal,
        fault_addr,
        frame.pc()
    );
    frame.dump();
    crate::sched::terminate_current_with_signal(signal);
    crate::sched::task_exit(128 + signal)
}
