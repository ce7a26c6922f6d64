//! Bounded outbound queue for messages produced while offline.
//!
//! Insertion never blocks: once full, new messages are rejected with a
//! capacity error and the caller logs the drop. Entries keep their enqueue
//! time so flush logs can report how long a message waited.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::error::RelayError;
use crate::message::Message;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message: Message,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity.min(1024)), capacity }
    }

    /// Append at the back.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Capacity`] (and drops `message`) when full.
    pub fn push(&mut self, message: Message) -> Result<(), RelayError> {
        if self.entries.len() >= self.capacity {
            return Err(RelayError::Capacity { capacity: self.capacity });
        }
        self.entries.push_back(QueueEntry { message, enqueued_at: Instant::now() });
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Put a message whose send failed back at the head. If that overflows
    /// the queue, the oldest entry is evicted and returned.
    pub fn requeue_front(&mut self, entry: QueueEntry) -> Option<QueueEntry> {
        self.entries.push_front(entry);
        if self.entries.len() > self.capacity {
            return self.entries.pop_front();
        }
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod tests;
