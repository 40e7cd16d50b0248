//! Task and process tables.
//!
//! A [`Process`] owns an address space, heap, and file descriptors; a
//! [`Task`] is one schedulable thread within a process and carries its own
//! trap frame and stacks. Both live in their own kernel-wide [`IdTable`],
//! referencing each other by id rather than by direct pointer so neither
//! needs to outlive the other's lock.

pub mod current;
pub mod pid;
pub mod process;
pub mod scheduler;
pub mod task;
pub mod wait;

pub use pid::IdTable;
pub use process::{FileTable, Process, ProcessId, TlsImage};
pub use task::{Task, TaskId, TaskState};

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    static ref TASKS: Mutex<IdTable<Task>> = Mutex::new(IdTable::new());
    static ref PROCESSES: Mutex<IdTable<Process>> = Mutex::new(IdTable::new());
    /// Names reserved for well-known system tasks (the idle task, init, the
    /// page-fault-handling supervisor), so other subsystems can find them
    /// without wiring a task id through every call site that needs one.
    static ref WELL_KNOWN: Mutex<Vec<(&'static str, TaskId)>> = Mutex::new(Vec::new());
}

pub fn current_task_id() -> TaskId {
    current::current_task_id()
}

pub fn current_pid() -> ProcessId {
    with_task(current_task_id(), |t| t.process).unwrap_or(0)
}

/// Insert a freshly built task into the task table, returning its id. The
/// builder is called with a placeholder id of 0; the real id is stamped in
/// afterward since `IdTable::insert` only hands it back once the value is
/// already stored.
pub fn spawn_task(task: impl FnOnce(TaskId) -> Task) -> Option<TaskId> {
    let mut tasks = TASKS.lock();
    let id = tasks.insert(task(0))?;
    if let Some(t) = tasks.get_mut(id) {
        t.id = id;
    }
    Some(id)
}

pub fn insert_process(process: impl FnOnce(ProcessId) -> Process) -> Option<ProcessId> {
    let mut processes = PROCESSES.lock();
    let id = processes.insert(process(0))?;
    if let Some(p) = processes.get_mut(id) {
        p.id = id;
    }
    Some(id)
}

pub fn with_task<R>(id: TaskId, f: impl FnOnce(&Task) -> R) -> Option<R> {
    TASKS.lock().get(id).map(f)
}

pub fn with_task_mut<R>(id: TaskId, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    TASKS.lock().get_mut(id).map(f)
}

pub fn with_process<R>(id: ProcessId, f: impl FnOnce(&Process) -> R) -> Option<R> {
    PROCESSES.lock().get(id).map(f)
}

pub fn with_process_mut<R>(id: ProcessId, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    PROCESSES.lock().get_mut(id).map(f)
}

pub fn remove_task(id: TaskId) -> Option<Task> {
    TASKS.lock().remove(id)
}

pub fn task_ids() -> Vec<TaskId> {
    TASKS.lock().iter_ids().collect()
}

pub fn register_well_known(name: &'static str, task: TaskId) {
    let mut table = WELL_KNOWN.lock();
    if let Some(entry) = table.iter_mut().find(|(n, _)| *n == name) {
        entry.1 = task;
    } else {
        table.push((name, task));
    }
}

pub fn lookup_well_known(name: &str) -> Option<TaskId> {
    WELL_KNOWN.lock().iter().find(|(n, _)| *n == name).map(|(_, id)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_lookup_round_trips() {
        register_well_known("idle", 99);
        assert_eq!(lookup_well_known("idle"), Some(99));
        assert_eq!(lookup_well_known("missing"), None);
    }
}
