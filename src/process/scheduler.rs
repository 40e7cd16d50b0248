//! Per-core round-robin scheduler.
//!
//! Each core owns a ready queue; a task never migrates between cores once
//! enqueued. A task normally joins the tail of its queue, but one woken by
//! an incoming message is pushed to the head so request/reply IPC doesn't
//! wait behind a full timeslice of unrelated work.

use crate::process::wait::{Decision, WaitContext, Waiter};
use crate::process::{self, Task, TaskId, TaskState};
use alloc::collections::VecDeque;
use core::arch::asm;
use lazy_static::lazy_static;
use spin::Mutex;

/// Ceiling on cores this build schedules across. Bumping this is cheap;
/// wiring real per-core topology discovery through here is not done yet.
pub const MAX_CORES: usize = 32;

/// Timer ticks a task runs before `timer_tick` preempts it.
const TIMESLICE_TICKS: u32 = 10;

struct CoreState {
    ready: VecDeque<TaskId>,
    ticks_left: u32,
}

impl CoreState {
    const fn new() -> Self {
        Self { ready: VecDeque::new(), ticks_left: TIMESLICE_TICKS }
    }
}

lazy_static! {
    static ref CORES: [Mutex<CoreState>; MAX_CORES] = core::array::from_fn(|_| Mutex::new(CoreState::new()));
}

/// Queue a task to run. `boost` pushes it to the front of the queue instead
/// of the back, for a task just woken by a message it was blocked on.
pub fn enqueue_ready(core: usize, task: TaskId, boost: bool) {
    process::with_task_mut(task, |t| t.state = TaskState::Ready);
    let mut state = CORES[core % MAX_CORES].lock();
    if boost {
        state.ready.push_front(task);
    } else {
        state.ready.push_back(task);
    }
}

/// Pop the next runnable task for `core`, if any.
pub fn pick_next(core: usize) -> Option<TaskId> {
    let mut state = CORES[core % MAX_CORES].lock();
    let next = state.ready.pop_front()?;
    state.ticks_left = TIMESLICE_TICKS;
    drop(state);
    process::with_task_mut(next, |t| t.state = TaskState::Running);
    process::current::set_current_task_id(next);
    Some(next)
}

/// Called from the timer IRQ handler. Decrements the running task's
/// timeslice and, once exhausted, requeues it behind whatever else is ready.
pub fn timer_tick(core: usize) {
    let mut state = CORES[core % MAX_CORES].lock();
    if state.ticks_left > 1 {
        state.ticks_left -= 1;
        return;
    }
    state.ticks_left = TIMESLICE_TICKS;
    drop(state);

    let current = process::current_task_id();
    if current != 0 {
        enqueue_ready(core, current, false);
    }
}

/// Voluntarily give up the core until the next tick finds something to run.
pub fn yield_now() {
    unsafe {
        asm!("hlt");
    }
}

/// Attach `waiter` to the current task and move it to `Waiting`. The task
/// leaves the ready queue implicitly: `pick_next` never sees it again until
/// `try_resolve_all` re-enqueues it.
pub fn block_current(waiter: Waiter) {
    let current = process::current_task_id();
    process::with_task_mut(current, |t| {
        t.state = TaskState::Waiting;
        t.current_wait = Some(waiter);
    });
}

/// Remove every dead task from the task table. Safe to call from idle time;
/// a task that dies mid-timeslice simply never gets re-enqueued, so by the
/// time this runs it has no references left on any ready queue.
pub fn reap_dead() {
    for id in process::task_ids() {
        let dead = process::with_task(id, Task::is_dead).unwrap_or(false);
        if dead {
            process::remove_task(id);
        }
    }
}

/// Periodic sweep: check every waiting task's [`Waiter`] against `ctx` and
/// wake (re-enqueue) the ones that resolved. `core` is where a woken task
/// lands; callers that track per-task affinity should call this once per
/// core with that core's own context.
pub fn try_resolve_all(core: usize, ctx: &WaitContext) {
    for id in process::task_ids() {
        let resolution = process::with_task_mut(id, |t| {
            if t.state != TaskState::Waiting {
                return None;
            }
            let waiter = t.current_wait?;
            match waiter.resolve(ctx) {
                Decision::StillWaiting => None,
                Decision::Resolved(value) => {
                    t.current_wait = None;
                    t.trap_frame.set_syscall_return_value(value);
                    Some(())
                }
            }
        });
        if matches!(resolution, Some(Some(()))) {
            enqueue_ready(core, id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_pick_round_trip() {
        enqueue_ready(0, 7, false);
        assert_eq!(pick_next(0), Some(7));
        assert_eq!(pick_next(0), None);
    }

    #[test]
    fn boosted_task_jumps_queue() {
        enqueue_ready(1, 1, false);
        enqueue_ready(1, 2, false);
        enqueue_ready(1, 3, true);
        assert_eq!(pick_next(1), Some(3));
        assert_eq!(pick_next(1), Some(1));
        assert_eq!(pick_next(1), Some(2));
    }
}
