//! The lock table: every lock record the server has seen.
//!
//! The table does no locking of its own. The server keeps it behind its single
//! exclusive section and only touches it from there.

use std::collections::{hash_map::Entry, HashMap};

use crate::{LockId, LockRecord};

/// Mapping from lock identifier to lock record.
///
/// Records are created lazily on first `acquire` and never evicted.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    locks: HashMap<LockId, LockRecord>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the record for `id`, inserting a free one if it is unseen.
    ///
    /// The flag is `true` when the record was created by this call.
    pub fn get_or_create(&mut self, id: LockId) -> (&mut LockRecord, bool) {
        match self.locks.entry(id) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => (entry.insert(LockRecord::new(id)), true),
        }
    }

    #[must_use]
    pub fn get(&self, id: LockId) -> Option<&LockRecord> {
        self.locks.get(&id)
    }

    pub fn get_mut(&mut self, id: LockId) -> Option<&mut LockRecord> {
        self.locks.get_mut(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockRecord> {
        self.locks.values()
    }
}
