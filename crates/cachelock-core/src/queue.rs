//! FIFO wait queue of clients contending for one lock

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::ClientId;

/// Clients waiting for a lock, in arrival order.
///
/// Append-only at the tail, consumed only from the head. The same client may
/// appear more than once if it issues `acquire` twice before being granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitQueue {
    entries: VecDeque<ClientId>,
}

impl WaitQueue {
    /// Create a new empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of waiting clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a client at the tail
    pub fn enqueue(&mut self, client: ClientId) {
        self.entries.push_back(client);
    }

    /// Remove and return the head
    pub fn dequeue(&mut self) -> Option<ClientId> {
        self.entries.pop_front()
    }

    /// Peek at the head
    #[must_use]
    pub fn front(&self) -> Option<&ClientId> {
        self.entries.front()
    }

    /// Check whether `client` is currently the head
    #[must_use]
    pub fn is_head(&self, client: &ClientId) -> bool {
        self.front() == Some(client)
    }

    /// Iterate from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &ClientId> {
        self.entries.iter()
    }
}
