//! Task-layer hooks
//!
//! The scheduler and process model live outside the memory/trap core; this
//! module is the narrow surface the core calls through: the current task,
//! signal termination, and the "is this address space still referenced"
//! check used by `destroy_space`.

use crate::mm::AddrSpace;
use crate::sync::IrqMutex;

/// State the trap core needs to know about a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Terminated by a signal; the exit code records `128 + signal`.
    Terminated,
}

/// Minimal task record; the full process model belongs to the task layer.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub id: u64,
    pub space: AddrSpace,
    pub state: TaskState,
    pub exit_code: u32,
}

static CURRENT: IrqMutex<Option<Task>> = IrqMutex::new(None);

/// Install the task about to enter user mode.
pub fn set_current(id: u64, space: AddrSpace) {
    *CURRENT.lock() = Some(Task {
        id,
        space,
        state: TaskState::Running,
        exit_code: 0,
    });
}

/// The currently running task, if user execution has started.
pub fn current_task() -> Option<Task> {
    *CURRENT.lock()
}

/// Whether any live task still uses `space`; consulted by
/// `destroy_space` before tearing a space down.
pub fn task_pool_references_space(space: AddrSpace) -> bool {
    CURRENT
        .lock()
        .map(|t| t.state == TaskState::Running && t.space == space)
        .unwrap_or(false)
}

/// Mark the current task terminated by `signal`, recording `128 + signal`
/// as its exit code, and notify the task layer.
pub fn terminate_current_with_signal(signal: u32) {
    let mut current = CURRENT.lock();
    match current.as_mut() {
        Some(task) => {
            task.state = TaskState::Terminated;
            task.exit_code = 128 + signal;
            log::info!(
                "sched: task {} terminated by signal {} (exit code {})",
                task.id,
                signal,
                task.exit_code
            );
        }
        None => log::error!("sched: signal {} with no current task", signal),
    }
}

/// Hand the CPU back after the current task is gone. With no scheduler in
/// the core, this parks the CPU; the external task layer replaces it.
pub fn task_exit(code: u32) -> ! {
    log::info!("sched: task exit with code {}", code);
    loop {
        crate::hal::cpu_halt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PhysAddr;

    #[test]
    fn test_signal_termination_records_exit_code() {
        let space = AddrSpace::new(PhysAddr::new(0x1000));
        set_current(7, space);
        assert!(task_pool_references_space(space));

        terminate_current_with_signal(11);
        let task = current_task().expect("task still recorded");
        assert_eq!(task.state, TaskState::Terminated);
        assert_eq!(task.exit_code, 128 + 11);
        // A terminated task no longer pins its address space.
        assert!(!task_pool_references_space(space));
    }
}
