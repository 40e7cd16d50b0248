//! Message-passing channels between tasks.
//!
//! A [`Channel`] is a bounded, per-receiver mailbox: any task holding a
//! [`ChannelId`] may `send` into it, but only its owner calls `receive`.
//! Both directions can block: `send` waits for room via
//! [`crate::process::wait::Waiter::SendMessage`], `receive` waits for a
//! message via `Waiter::ReceiveMessage`. `transaction` lets a receiver pull
//! only the next message tagged with a given id out of order, for a
//! request/reply pattern layered over an otherwise FIFO mailbox.

use crate::lib::error::{Errno, Result};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

pub type ChannelId = u32;

/// Maximum bytes carried by a single message.
pub const MAX_MESSAGE_LEN: usize = 4096;
/// Maximum messages a channel will queue before `send` must block or fail.
pub const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct Message {
    pub sender: u32,
    /// Caller-chosen tag used by `transaction` to pick a reply out of order;
    /// zero for an untagged message.
    pub transaction: u32,
    pub length: usize,
    pub bytes: Vec<u8>,
}

impl Message {
    pub fn new(sender: u32, transaction: u32, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(Errno::EMSGSIZE);
        }
        let length = bytes.len();
        Ok(Self { sender, transaction, length, bytes })
    }
}

/// A bounded FIFO mailbox. Exceeding `CHANNEL_CAPACITY` fails a non-blocking
/// send with `Errno::EAGAIN`; the caller is expected to retry after
/// attaching a `Waiter::SendMessage`.
pub struct Channel {
    id: ChannelId,
    owner: u32,
    queue: VecDeque<Message>,
}

impl Channel {
    fn new(id: ChannelId, owner: u32) -> Self {
        Self { id, owner, queue: VecDeque::with_capacity(CHANNEL_CAPACITY) }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= CHANNEL_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue a message without blocking. `Err(Errno::EAGAIN)` if full.
    pub fn try_send(&mut self, message: Message) -> Result<()> {
        if self.is_full() {
            return Err(Errno::EAGAIN);
        }
        self.queue.push_back(message);
        Ok(())
    }

    /// Dequeue the oldest message without blocking. `Err(Errno::EAGAIN)` if
    /// empty.
    pub fn try_receive(&mut self) -> Result<Message> {
        self.queue.pop_front().ok_or(Errno::EAGAIN)
    }

    /// Dequeue the first message tagged `transaction`, regardless of queue
    /// position, leaving the rest of the queue order intact.
    pub fn try_receive_transaction(&mut self, transaction: u32) -> Result<Message> {
        let pos = self
            .queue
            .iter()
            .position(|m| m.transaction == transaction)
            .ok_or(Errno::EAGAIN)?;
        Ok(self.queue.remove(pos).expect("position just found"))
    }
}

struct Registry {
    channels: Vec<Option<Channel>>,
    next_id: u32,
}

impl Registry {
    const fn new() -> Self {
        Self { channels: Vec::new(), next_id: 1 }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// Create a new channel owned by `owner`, returning its id.
pub fn create(owner: u32) -> ChannelId {
    let mut reg = REGISTRY.lock();
    let id = reg.next_id;
    reg.next_id += 1;
    reg.channels.push(Some(Channel::new(id, owner)));
    id
}

pub fn destroy(id: ChannelId) {
    let mut reg = REGISTRY.lock();
    if let Some(slot) = reg.channels.get_mut(id as usize - 1) {
        *slot = None;
    }
}

fn with_channel<R>(id: ChannelId, f: impl FnOnce(&mut Channel) -> Result<R>) -> Result<R> {
    let mut reg = REGISTRY.lock();
    let index = (id as usize).checked_sub(1).ok_or(Errno::ENOENT)?;
    let slot = reg.channels.get_mut(index).ok_or(Errno::ENOENT)?;
    let channel = slot.as_mut().ok_or(Errno::ENOENT)?;
    f(channel)
}

/// Non-blocking send. Callers that need to block attach
/// `Waiter::SendMessage { channel }` and retry on wake.
pub fn try_send(channel: ChannelId, message: Message) -> Result<()> {
    with_channel(channel, |c| c.try_send(message))
}

/// Non-blocking receive. Callers that need to block attach
/// `Waiter::ReceiveMessage { channel }` and retry on wake.
pub fn try_receive(channel: ChannelId) -> Result<Message> {
    with_channel(channel, |c| c.try_receive())
}

pub fn try_receive_transaction(channel: ChannelId, transaction: u32) -> Result<Message> {
    with_channel(channel, |c| c.try_receive_transaction(transaction))
}

/// Whether a blocked receiver on `channel` should be woken.
pub fn has_pending(channel: ChannelId) -> bool {
    with_channel(channel, |c| Ok(!c.is_empty())).unwrap_or(false)
}

/// Whether a blocked sender on `channel` should be woken.
pub fn has_room(channel: ChannelId) -> bool {
    with_channel(channel, |c| Ok(!c.is_full())).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn send_then_receive_round_trips() {
        let ch = create(1);
        let msg = Message::new(1, 0, vec![1, 2, 3]).unwrap();
        try_send(ch, msg).unwrap();
        let got = try_receive(ch).unwrap();
        assert_eq!(got.bytes, vec![1, 2, 3]);
        destroy(ch);
    }

    #[test]
    fn receive_on_empty_channel_fails() {
        let ch = create(1);
        assert_eq!(try_receive(ch), Err(Errno::EAGAIN));
        destroy(ch);
    }

    #[test]
    fn transaction_receive_skips_ahead() {
        let ch = create(1);
        try_send(ch, Message::new(1, 10, vec![0]).unwrap()).unwrap();
        try_send(ch, Message::new(1, 20, vec![1]).unwrap()).unwrap();
        let got = try_receive_transaction(ch, 20).unwrap();
        assert_eq!(got.transaction, 20);
        let got = try_receive(ch).unwrap();
        assert_eq!(got.transaction, 10);
        destroy(ch);
    }

    #[test]
    fn message_over_limit_rejected() {
        let bytes = vec![0u8; MAX_MESSAGE_LEN + 1];
        assert_eq!(Message::new(1, 0, bytes).unwrap_err(), Errno::EMSGSIZE);
    }
}
