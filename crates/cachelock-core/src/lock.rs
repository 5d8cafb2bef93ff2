//! Lock records and their state

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::{ClientId, LockId, WaitQueue};

/// Server-side state of one lock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockState {
    /// No owner, empty queue
    #[default]
    Free,
    /// Single owner, empty queue
    Locked,
    /// Single owner, non-empty queue, revoke issued to the owner
    LockedAndWait,
    /// No owner, non-empty queue; the head is entitled to claim next
    Ordered,
}

impl LockState {
    /// Whether a client currently holds the lock in this state
    #[must_use]
    pub const fn is_held(self) -> bool {
        matches!(self, Self::Locked | Self::LockedAndWait)
    }
}

/// A broken record invariant, reported by [`LockRecord::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("lock {lock} in state {state} has no owner")]
    MissingOwner { lock: LockId, state: LockState },

    #[error("lock {lock} in state {state} has owner {owner}")]
    UnexpectedOwner {
        lock: LockId,
        state: LockState,
        owner: ClientId,
    },

    #[error("lock {lock} in state {state} has {waiters} waiter(s)")]
    UnexpectedWaiters {
        lock: LockId,
        state: LockState,
        waiters: usize,
    },

    #[error("lock {lock} in state {state} has an empty wait queue")]
    EmptyQueue { lock: LockId, state: LockState },
}

/// One lock's bookkeeping, owned by the lock table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    id: LockId,
    pub(crate) state: LockState,
    pub(crate) owner: Option<ClientId>,
    pub(crate) waiters: WaitQueue,
}

impl LockRecord {
    /// Create a free record
    #[must_use]
    pub fn new(id: LockId) -> Self {
        Self {
            id,
            state: LockState::Free,
            owner: None,
            waiters: WaitQueue::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> LockId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> LockState {
        self.state
    }

    #[must_use]
    pub const fn owner(&self) -> Option<&ClientId> {
        self.owner.as_ref()
    }

    #[must_use]
    pub const fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    /// Check the record against the per-state owner and queue rules.
    ///
    /// Owner is present iff the lock is held; the queue is empty when the lock
    /// is free or plainly locked, and non-empty when waiting or ordered.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let lock = self.id;
        let state = self.state;

        match (&self.owner, state.is_held()) {
            (None, true) => return Err(InvariantViolation::MissingOwner { lock, state }),
            (Some(owner), false) => {
                return Err(InvariantViolation::UnexpectedOwner {
                    lock,
                    state,
                    owner: owner.clone(),
                })
            }
            _ => {}
        }

        match state {
            LockState::Free | LockState::Locked if !self.waiters.is_empty() => {
                Err(InvariantViolation::UnexpectedWaiters {
                    lock,
                    state,
                    waiters: self.waiters.len(),
                })
            }
            LockState::LockedAndWait | LockState::Ordered if self.waiters.is_empty() => {
                Err(InvariantViolation::EmptyQueue { lock, state })
            }
            _ => Ok(()),
        }
    }

    /// Serialisable copy of the record
    #[must_use]
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            lock: self.id,
            state: self.state,
            owner: self.owner.clone(),
            waiters: self.waiters.iter().cloned().collect(),
        }
    }
}

/// Point-in-time view of a lock record, returned by `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub lock: LockId,
    pub state: LockState,
    pub owner: Option<ClientId>,
    pub waiters: Vec<ClientId>,
}
