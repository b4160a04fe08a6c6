//! Message queues of a connection.
//!
//! The outgoing queue is the worst-case buffer: the socket buffer is the
//! primary one, and sends go through here only when the transport pushes
//! back. It is bounded, and its head slot additionally records how many
//! bytes of the head message have already reached the transport.

use std::collections::VecDeque;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::protocol::{RQUEUE_MAX, WQUEUE_MAX};

/// Bounded FIFO of messages waiting to be written.
pub(crate) struct WriteQueue {
    messages: VecDeque<Message>,
    /// Bytes of the head message already written.
    windex: usize,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            // One slot is always available so a partial direct write can be
            // recorded without allocating.
            messages: VecDeque::with_capacity(1),
            windex: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    /// Append a message at the tail.
    pub(crate) fn push(&mut self, m: Message) -> Result<()> {
        if self.messages.len() >= WQUEUE_MAX {
            return Err(Error::new(ErrorKind::QueueFull));
        }

        self.messages.push_back(m);
        Ok(())
    }

    /// Record a partially written message as the new head. Only valid on an
    /// empty queue, which always has room for it.
    pub(crate) fn push_partial(&mut self, m: Message, windex: usize) {
        debug_assert!(self.messages.is_empty());
        self.messages.push_front(m);
        self.windex = windex;
    }

    pub(crate) fn head(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub(crate) fn windex(&self) -> usize {
        self.windex
    }

    pub(crate) fn set_windex(&mut self, windex: usize) {
        self.windex = windex;
    }

    /// Drop the fully written head message.
    pub(crate) fn pop_head(&mut self) -> Option<Message> {
        self.windex = 0;
        self.messages.pop_front()
    }
}

/// FIFO of received messages waiting to be dispatched. Grows on demand up
/// to a fixed bound.
pub(crate) struct ReadQueue {
    messages: VecDeque<Message>,
}

impl ReadQueue {
    pub(crate) fn new() -> Self {
        Self {
            messages: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.messages.len() >= RQUEUE_MAX
    }

    pub(crate) fn push(&mut self, m: Message) -> Result<()> {
        if self.is_full() {
            return Err(Error::new(ErrorKind::QueueFull));
        }

        self.messages.push_back(m);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadQueue, WriteQueue};
    use crate::message::Message;
    use crate::protocol::{RQUEUE_MAX, WQUEUE_MAX};

    fn message() -> Message {
        Message::signal("/", "Changed")
    }

    #[test]
    fn test_write_queue_bounded() {
        let mut q = WriteQueue::new();

        for _ in 0..WQUEUE_MAX {
            q.push(message()).unwrap();
        }

        assert!(q.push(message()).is_err());
        assert_eq!(q.len(), WQUEUE_MAX);
    }

    #[test]
    fn test_write_queue_partial_bookkeeping() {
        let mut q = WriteQueue::new();

        q.push_partial(message(), 17);
        assert_eq!(q.windex(), 17);

        q.set_windex(40);
        assert_eq!(q.windex(), 40);

        assert!(q.pop_head().is_some());
        assert_eq!(q.windex(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_read_queue_bounded() {
        let mut q = ReadQueue::new();

        for _ in 0..RQUEUE_MAX {
            q.push(message()).unwrap();
        }

        assert!(q.is_full());
        assert!(q.push(message()).is_err());

        assert!(q.pop().is_some());
        assert!(!q.is_full());
    }
}
