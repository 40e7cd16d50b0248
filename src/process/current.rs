//! Pointer to the task currently running on this core.
//!
//! A single global atomic is enough for now: the scheduler is not yet
//! per-core aware beyond a fixed core count, so every core shares one
//! "current task" slot during early bring-up. Per-core storage (see
//! [`crate::arch::x86_64::percpu`]) is the natural upgrade once real SMP
//! scheduling lands.

use crate::process::TaskId;
use core::sync::atomic::{AtomicU32, Ordering};

static CURRENT_TASK: AtomicU32 = AtomicU32::new(0);

pub fn current_task_id() -> TaskId {
    CURRENT_TASK.load(Ordering::Acquire)
}

pub fn set_current_task_id(id: TaskId) {
    CURRENT_TASK.store(id, Ordering::Release);
}
