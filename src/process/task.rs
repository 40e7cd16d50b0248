//! Task: a single schedulable thread of execution.
//!
//! A task always belongs to exactly one [`Process`](super::Process) and
//! carries its own trap frame, stacks, and wait state; the process it
//! belongs to owns the address space, heap, and file descriptor table that
//! its tasks share.

use crate::arch::x86_64::trapframe::{TrapFrame, Vm86State};
use crate::cap::SecurityLevel;
use crate::mm::AddressRange;
use crate::process::wait::Waiter;
use crate::process::ProcessId;
use alloc::string::String;

pub type TaskId = u32;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, sitting in a ready queue.
    Ready,
    /// Currently executing on some core.
    Running,
    /// Blocked on a [`Waiter`].
    Waiting,
    /// Exited; resources not yet reclaimed by `reap_dead`.
    Dead,
}

/// A single schedulable task.
pub struct Task {
    pub id: TaskId,
    pub process: ProcessId,
    pub security_level: SecurityLevel,
    pub state: TaskState,
    pub trap_frame: TrapFrame,
    /// Range of this task's user-mode stack within its process's address
    /// space.
    pub user_stack: AddressRange,
    /// Top of this task's kernel stack, used while it runs in kernel mode.
    pub kernel_stack_top: u64,
    /// Registers captured for an outstanding VM86 call, if any.
    pub vm86: Option<Vm86State>,
    /// What this task is blocked on, mirrored from `state == Waiting`.
    pub current_wait: Option<Waiter>,
    /// Exit code, valid once `state == Dead`.
    pub exit_code: i32,
    pub name: String,
}

impl Task {
    pub fn new(
        id: TaskId,
        process: ProcessId,
        security_level: SecurityLevel,
        trap_frame: TrapFrame,
        user_stack: AddressRange,
        kernel_stack_top: u64,
        name: String,
    ) -> Self {
        Self {
            id,
            process,
            security_level,
            state: TaskState::Ready,
            trap_frame,
            user_stack,
            kernel_stack_top,
            vm86: None,
            current_wait: None,
            exit_code: 0,
            name,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == TaskState::Dead
    }

    /// Mark the task dead with the given exit code. Does not remove it from
    /// any table; `scheduler::reap_dead` does that once it is safe to.
    pub fn mark_dead(&mut self, exit_code: i32) {
        self.state = TaskState::Dead;
        self.exit_code = exit_code;
        self.current_wait = None;
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("process", &self.process)
            .field("state", &self.state)
            .field("name", &self.name)
            .finish()
    }
}
