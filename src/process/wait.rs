//! Blocking conditions a task can be parked on, and their resolution.
//!
//! A task blocks by attaching a [`Waiter`] to itself (`Task::current_wait`)
//! and moving to `TaskState::Waiting`. The scheduler's periodic sweep calls
//! [`Waiter::resolve`] against the current [`WaitContext`] for every waiting
//! task; a [`Decision::Resolved`] wakes it with that value as its wait
//! return value. Resolution must be idempotent: a timer tick or IRQ that
//! outlives the task it would have woken is simply a no-op on the next call.

use crate::ipc::ChannelId;
use crate::process::TaskId;

/// Snapshot of state a waiter checks itself against. Built by the scheduler
/// sweep from whatever subsystem owns the condition being waited on, so
/// `resolve` itself never reaches across modules.
pub struct WaitContext {
    pub now_ticks: u64,
    /// `Some(exit_code)` if the joined task has died.
    pub joined_exit_code: Option<i32>,
    /// Current value at the watched address, for `AtomicWait`.
    pub atomic_value: Option<u64>,
    /// Whether the watched IRQ line has fired since the waiter was armed.
    pub irq_fired: bool,
    /// Whether a message is now available on the watched channel.
    pub channel_ready: bool,
}

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy)]
pub enum Waiter {
    /// Asleep until the tick counter reaches `wake_at_ticks`.
    Sleep { wake_at_ticks: u64 },
    /// Blocked until `target` dies; resolves to its exit code.
    Join { target: TaskId },
    /// Blocked until the word at `addr` no longer equals `expected`.
    AtomicWait { addr: u64, expected: u64 },
    /// Blocked until IRQ line `line` fires.
    Irq { line: u8 },
    /// Blocked until a message is ready to receive on `channel`.
    ReceiveMessage { channel: ChannelId },
    /// Blocked until there is room to send on `channel`.
    SendMessage { channel: ChannelId },
    /// Blocked on the completion of an outstanding VM86 call.
    Vm86Call { vector: u8 },
    /// Blocked on activity against file descriptor `fd`.
    FileWait { fd: u32 },
}

/// Outcome of checking a [`Waiter`] against a [`WaitContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    StillWaiting,
    /// Woken, with the value the blocking syscall should return.
    Resolved(i64),
}

impl Waiter {
    /// Check whether this waiter's condition now holds. Never has side
    /// effects on `ctx`, and may be called any number of times on a waiter
    /// whose condition already resolved in the past without changing the
    /// answer.
    pub fn resolve(&self, ctx: &WaitContext) -> Decision {
        match *self {
            Waiter::Sleep { wake_at_ticks } => {
                if ctx.now_ticks >= wake_at_ticks {
                    Decision::Resolved(0)
                } else {
                    Decision::StillWaiting
                }
            }
            Waiter::Join { .. } => match ctx.joined_exit_code {
                Some(code) => Decision::Resolved(code as i64),
                None => Decision::StillWaiting,
            },
            Waiter::AtomicWait { expected, .. } => match ctx.atomic_value {
                Some(v) if v != expected => Decision::Resolved(0),
                _ => Decision::StillWaiting,
            },
            Waiter::Irq { .. } => {
                if ctx.irq_fired {
                    Decision::Resolved(0)
                } else {
                    Decision::StillWaiting
                }
            }
            Waiter::ReceiveMessage { .. } | Waiter::SendMessage { .. } => {
                if ctx.channel_ready {
                    Decision::Resolved(0)
                } else {
                    Decision::StillWaiting
                }
            }
            Waiter::Vm86Call { .. } | Waiter::FileWait { .. } => {
                if ctx.channel_ready {
                    Decision::Resolved(0)
                } else {
                    Decision::StillWaiting
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_ctx() -> WaitContext {
        WaitContext {
            now_ticks: 0,
            joined_exit_code: None,
            atomic_value: None,
            irq_fired: false,
            channel_ready: false,
        }
    }

    #[test]
    fn sleep_resolves_once_deadline_passes() {
        let w = Waiter::Sleep { wake_at_ticks: 10 };
        let mut ctx = empty_ctx();
        ctx.now_ticks = 5;
        assert_eq!(w.resolve(&ctx), Decision::StillWaiting);
        ctx.now_ticks = 10;
        assert_eq!(w.resolve(&ctx), Decision::Resolved(0));
    }

    #[test]
    fn join_resolves_with_exit_code() {
        let w = Waiter::Join { target: 7 };
        let mut ctx = empty_ctx();
        assert_eq!(w.resolve(&ctx), Decision::StillWaiting);
        ctx.joined_exit_code = Some(42);
        assert_eq!(w.resolve(&ctx), Decision::Resolved(42));
    }

    #[test]
    fn atomic_wait_resolves_on_change() {
        let w = Waiter::AtomicWait { addr: 0x1000, expected: 1 };
        let mut ctx = empty_ctx();
        ctx.atomic_value = Some(1);
        assert_eq!(w.resolve(&ctx), Decision::StillWaiting);
        ctx.atomic_value = Some(2);
        assert_eq!(w.resolve(&ctx), Decision::Resolved(0));
    }

    #[test]
    fn resolved_decision_is_idempotent() {
        let w = Waiter::Irq { line: 1 };
        let mut ctx = empty_ctx();
        ctx.irq_fired = true;
        assert_eq!(w.resolve(&ctx), Decision::Resolved(0));
        assert_eq!(w.resolve(&ctx), Decision::Resolved(0));
    }
}
