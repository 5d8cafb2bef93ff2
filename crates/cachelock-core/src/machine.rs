//! Per-lock transition logic for `acquire` and `release`.
//!
//! These functions run inside the server's exclusive section. They mutate the
//! table and describe, but never perform, the callback that must follow. The
//! caller unlocks the table and only then dispatches [`Outcome::callback`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Callback, ClientId, LockId, LockState, LockTable, Status};

/// Whether `release` checks the caller against the current owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleasePolicy {
    /// Any client may release any lock
    Trusting,
    /// Releases from a non-owner are refused with [`Status::NotOwner`]
    #[default]
    VerifyOwner,
}

/// What the server does when a queued head claims an ordered lock and other
/// clients are still queued behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffPolicy {
    /// Revoke from the new owner right away so the rest of the queue drains
    #[default]
    Revoke,
    /// Grant only; the new owner keeps the lock until it releases on its own
    Silent,
}

/// Knobs that change transition side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy {
    pub release: ReleasePolicy,
    pub handoff: HandoffPolicy,
}

/// A protocol or bookkeeping anomaly found during a transition.
///
/// None of these abort the operation; the server logs them and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("free lock {lock} has {waiters} queued client(s)")]
    FreeWithWaiters { lock: LockId, waiters: usize },

    #[error("released lock {lock} still has {waiters} queued client(s)")]
    LockedWithWaiters { lock: LockId, waiters: usize },

    #[error("lock {lock} is held in state {state} but has no owner")]
    MissingOwner { lock: LockId, state: LockState },

    #[error("lock {lock} is waiting but its queue is empty")]
    EmptyQueue { lock: LockId },

    #[error("{client} released lock {lock}, which was never acquired")]
    ReleaseUnknown { lock: LockId, client: ClientId },

    #[error("{client} released free lock {lock}")]
    ReleaseFree { lock: LockId, client: ClientId },

    #[error("{client} released ordered lock {lock}, which has no holder")]
    ReleaseOrdered { lock: LockId, client: ClientId },

    #[error("{client} released lock {lock} held by {owner}")]
    NotOwner {
        lock: LockId,
        client: ClientId,
        owner: ClientId,
    },
}

impl Anomaly {
    /// Misbehaving-peer anomalies, as opposed to broken server bookkeeping.
    #[must_use]
    pub const fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Self::ReleaseUnknown { .. }
                | Self::ReleaseFree { .. }
                | Self::ReleaseOrdered { .. }
                | Self::NotOwner { .. }
        )
    }
}

/// Result of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Reply for the calling client
    pub status: Status,
    /// State after the transition; `None` if no record exists
    pub state: Option<LockState>,
    /// Callback to place once the exclusive section is released
    pub callback: Option<Callback>,
    pub anomaly: Option<Anomaly>,
}

impl Outcome {
    fn new(status: Status, state: Option<LockState>) -> Self {
        Self {
            status,
            state,
            callback: None,
            anomaly: None,
        }
    }

    fn with_callback(mut self, callback: Option<Callback>) -> Self {
        self.callback = callback;
        self
    }

    fn with_anomaly(mut self, anomaly: Option<Anomaly>) -> Self {
        self.anomaly = anomaly;
        self
    }
}

/// Decide an `acquire` request.
///
/// | state | result |
/// |---|---|
/// | unseen / free | grant, `Locked` |
/// | locked | queue caller, `LockedAndWait`, revoke previous owner |
/// | locked and wait | queue caller |
/// | ordered, caller is head | grant to caller |
/// | ordered, caller is not head | queue caller |
pub fn acquire(
    table: &mut LockTable,
    lock: LockId,
    client: &ClientId,
    policy: Policy,
) -> Outcome {
    let (record, _created) = table.get_or_create(lock);

    match record.state {
        LockState::Free => {
            let anomaly = (!record.waiters.is_empty()).then(|| Anomaly::FreeWithWaiters {
                lock,
                waiters: record.waiters.len(),
            });
            record.owner = Some(client.clone());
            record.state = LockState::Locked;
            Outcome::new(Status::Ok, Some(record.state)).with_anomaly(anomaly)
        }
        LockState::Locked => {
            record.waiters.enqueue(client.clone());
            record.state = LockState::LockedAndWait;
            let outcome = Outcome::new(Status::Retry, Some(record.state));
            match record.owner.clone() {
                Some(owner) => outcome.with_callback(Some(Callback::revoke(lock, owner))),
                None => outcome.with_anomaly(Some(Anomaly::MissingOwner {
                    lock,
                    state: LockState::Locked,
                })),
            }
        }
        LockState::Ordered if record.waiters.is_head(client) => {
            record.waiters.dequeue();
            record.owner = Some(client.clone());
            let callback = if record.waiters.is_empty() {
                record.state = LockState::Locked;
                None
            } else {
                record.state = LockState::LockedAndWait;
                (policy.handoff == HandoffPolicy::Revoke)
                    .then(|| Callback::revoke(lock, client.clone()))
            };
            Outcome::new(Status::Ok, Some(record.state)).with_callback(callback)
        }
        LockState::LockedAndWait | LockState::Ordered => {
            record.waiters.enqueue(client.clone());
            Outcome::new(Status::Retry, Some(record.state))
        }
    }
}

/// Decide a `release` request.
///
/// Releasing an unseen, free, or ordered lock is reported as an anomaly and
/// still answered `Ok`. Releasing a waited-on lock moves it to `Ordered` and
/// asks for a retry callback to the head of the queue.
pub fn release(
    table: &mut LockTable,
    lock: LockId,
    client: &ClientId,
    policy: Policy,
) -> Outcome {
    let Some(record) = table.get_mut(lock) else {
        return Outcome::new(Status::Ok, None).with_anomaly(Some(Anomaly::ReleaseUnknown {
            lock,
            client: client.clone(),
        }));
    };

    match record.state {
        LockState::Free => Outcome::new(Status::Ok, Some(record.state)).with_anomaly(Some(
            Anomaly::ReleaseFree {
                lock,
                client: client.clone(),
            },
        )),
        LockState::Ordered => Outcome::new(Status::Ok, Some(record.state)).with_anomaly(Some(
            Anomaly::ReleaseOrdered {
                lock,
                client: client.clone(),
            },
        )),
        LockState::Locked | LockState::LockedAndWait => {
            if policy.release == ReleasePolicy::VerifyOwner {
                if let Some(owner) = record.owner.as_ref().filter(|owner| *owner != client) {
                    return Outcome::new(Status::NotOwner, Some(record.state)).with_anomaly(Some(
                        Anomaly::NotOwner {
                            lock,
                            client: client.clone(),
                            owner: owner.clone(),
                        },
                    ));
                }
            }

            record.owner = None;
            if record.state == LockState::Locked {
                record.state = LockState::Free;
                let anomaly = (!record.waiters.is_empty()).then(|| Anomaly::LockedWithWaiters {
                    lock,
                    waiters: record.waiters.len(),
                });
                return Outcome::new(Status::Ok, Some(record.state)).with_anomaly(anomaly);
            }

            match record.waiters.front().cloned() {
                Some(head) => {
                    record.state = LockState::Ordered;
                    Outcome::new(Status::Ok, Some(record.state))
                        .with_callback(Some(Callback::retry(lock, head)))
                }
                None => {
                    record.state = LockState::Free;
                    Outcome::new(Status::Ok, Some(record.state))
                        .with_anomaly(Some(Anomaly::EmptyQueue { lock }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::CallbackKind;

    fn client(name: &str) -> ClientId {
        ClientId::parse(name).unwrap_or_else(|e| panic!("bad test client id: {e}"))
    }

    fn lock(id: u64) -> LockId {
        LockId::new(id)
    }

    fn snapshot(table: &LockTable, id: u64) -> (LockState, Option<ClientId>, Vec<ClientId>) {
        let record = table
            .get(lock(id))
            .unwrap_or_else(|| panic!("lock {id} missing"));
        (
            record.state(),
            record.owner().cloned(),
            record.waiters().iter().cloned().collect(),
        )
    }

    #[test]
    fn test_first_acquire_grants() {
        let mut table = LockTable::new();
        let outcome = acquire(&mut table, lock(5), &client("A"), Policy::default());

        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.callback, None);
        assert_eq!(
            snapshot(&table, 5),
            (LockState::Locked, Some(client("A")), vec![])
        );
    }

    #[test]
    fn test_revoke_retry_handoff() {
        let mut table = LockTable::new();
        let policy = Policy::default();
        acquire(&mut table, lock(5), &client("A"), policy);

        let contended = acquire(&mut table, lock(5), &client("B"), policy);
        assert_eq!(contended.status, Status::Retry);
        assert_eq!(contended.callback, Some(Callback::revoke(lock(5), client("A"))));
        assert_eq!(
            snapshot(&table, 5),
            (LockState::LockedAndWait, Some(client("A")), vec![client("B")])
        );

        let released = release(&mut table, lock(5), &client("A"), policy);
        assert_eq!(released.status, Status::Ok);
        assert_eq!(released.callback, Some(Callback::retry(lock(5), client("B"))));
        assert_eq!(
            snapshot(&table, 5),
            (LockState::Ordered, None, vec![client("B")])
        );

        let claimed = acquire(&mut table, lock(5), &client("B"), policy);
        assert_eq!(claimed.status, Status::Ok);
        assert_eq!(claimed.callback, None);
        assert_eq!(
            snapshot(&table, 5),
            (LockState::Locked, Some(client("B")), vec![])
        );
    }

    #[test]
    fn test_release_unseen_lock_creates_nothing() {
        let mut table = LockTable::new();
        let outcome = release(&mut table, lock(7), &client("X"), Policy::default());

        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.state, None);
        assert!(matches!(outcome.anomaly, Some(Anomaly::ReleaseUnknown { .. })));
        assert!(table.get(lock(7)).is_none());
    }

    #[test]
    fn test_second_waiter_gets_no_extra_revoke() {
        let mut table = LockTable::new();
        let policy = Policy::default();
        acquire(&mut table, lock(5), &client("A"), policy);
        acquire(&mut table, lock(5), &client("B"), policy);

        let outcome = acquire(&mut table, lock(5), &client("C"), policy);
        assert_eq!(outcome.status, Status::Retry);
        assert_eq!(outcome.callback, None);
        assert_eq!(
            snapshot(&table, 5),
            (
                LockState::LockedAndWait,
                Some(client("A")),
                vec![client("B"), client("C")]
            )
        );
    }

    #[test]
    fn test_ordered_lock_refuses_latecomer() {
        let mut table = LockTable::new();
        let policy = Policy::default();
        acquire(&mut table, lock(1), &client("A"), policy);
        acquire(&mut table, lock(1), &client("B"), policy);
        release(&mut table, lock(1), &client("A"), policy);

        let late = acquire(&mut table, lock(1), &client("C"), policy);
        assert_eq!(late.status, Status::Retry);
        assert_eq!(late.callback, None);

        let head = acquire(&mut table, lock(1), &client("B"), policy);
        assert_eq!(head.status, Status::Ok);
        assert_eq!(head.state, Some(LockState::LockedAndWait));
        assert_eq!(head.callback, Some(Callback::revoke(lock(1), client("B"))));
        assert_eq!(
            snapshot(&table, 1),
            (LockState::LockedAndWait, Some(client("B")), vec![client("C")])
        );
    }

    #[test]
    fn test_silent_handoff_skips_revoke() {
        let mut table = LockTable::new();
        let policy = Policy {
            handoff: HandoffPolicy::Silent,
            ..Policy::default()
        };
        acquire(&mut table, lock(1), &client("A"), policy);
        acquire(&mut table, lock(1), &client("B"), policy);
        acquire(&mut table, lock(1), &client("C"), policy);
        release(&mut table, lock(1), &client("A"), policy);

        let head = acquire(&mut table, lock(1), &client("B"), policy);
        assert_eq!(head.status, Status::Ok);
        assert_eq!(head.callback, None);
    }

    #[test]
    fn test_release_free_and_ordered_are_anomalies() {
        let mut table = LockTable::new();
        let policy = Policy::default();
        acquire(&mut table, lock(2), &client("A"), policy);
        release(&mut table, lock(2), &client("A"), policy);

        let free = release(&mut table, lock(2), &client("A"), policy);
        assert_eq!(free.status, Status::Ok);
        assert!(matches!(free.anomaly, Some(Anomaly::ReleaseFree { .. })));

        acquire(&mut table, lock(2), &client("A"), policy);
        acquire(&mut table, lock(2), &client("B"), policy);
        release(&mut table, lock(2), &client("A"), policy);
        let ordered = release(&mut table, lock(2), &client("A"), policy);
        assert_eq!(ordered.status, Status::Ok);
        assert!(matches!(ordered.anomaly, Some(Anomaly::ReleaseOrdered { .. })));
        assert_eq!(ordered.callback, None);
        assert_eq!(ordered.state, Some(LockState::Ordered));
    }

    #[test]
    fn test_release_by_non_owner() {
        let mut verified = LockTable::new();
        let strict = Policy::default();
        acquire(&mut verified, lock(4), &client("A"), strict);
        let refused = release(&mut verified, lock(4), &client("Z"), strict);
        assert_eq!(refused.status, Status::NotOwner);
        assert!(matches!(refused.anomaly, Some(Anomaly::NotOwner { .. })));
        assert_eq!(
            snapshot(&verified, 4),
            (LockState::Locked, Some(client("A")), vec![])
        );

        let mut trusting = LockTable::new();
        let lax = Policy {
            release: ReleasePolicy::Trusting,
            ..Policy::default()
        };
        acquire(&mut trusting, lock(4), &client("A"), lax);
        let accepted = release(&mut trusting, lock(4), &client("Z"), lax);
        assert_eq!(accepted.status, Status::Ok);
        assert_eq!(snapshot(&trusting, 4), (LockState::Free, None, vec![]));
    }

    #[test]
    fn test_free_lock_with_stale_queue_is_reported() {
        let mut table = LockTable::new();
        let (record, _) = table.get_or_create(lock(8));
        record.waiters.enqueue(client("ghost"));

        let outcome = acquire(&mut table, lock(8), &client("A"), Policy::default());
        assert_eq!(outcome.status, Status::Ok);
        assert!(matches!(
            outcome.anomaly,
            Some(Anomaly::FreeWithWaiters { waiters: 1, .. })
        ));
    }

    #[test]
    fn test_waiters_are_served_in_arrival_order() {
        let mut table = LockTable::new();
        let policy = Policy::default();
        let names = ["A", "B", "C", "D"];
        for name in names {
            acquire(&mut table, lock(3), &client(name), policy);
        }

        let mut granted = vec![client("A")];
        let mut holder = client("A");
        while let Some(callback) = release(&mut table, lock(3), &holder, policy).callback {
            assert_eq!(callback.kind, CallbackKind::Retry);
            let outcome = acquire(&mut table, lock(3), &callback.target, policy);
            assert_eq!(outcome.status, Status::Ok);
            holder = callback.target;
            granted.push(holder.clone());
        }

        let expected: Vec<ClientId> = names.iter().map(|n| client(n)).collect();
        assert_eq!(granted, expected);
        assert_eq!(snapshot(&table, 3), (LockState::Free, None, vec![]));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u64, usize),
        Release(u64, usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3u64, 0..4usize).prop_map(|(l, c)| Op::Acquire(l, c)),
            (0..3u64, 0..4usize).prop_map(|(l, c)| Op::Release(l, c)),
        ]
    }

    fn policy_strategy() -> impl Strategy<Value = Policy> {
        (any::<bool>(), any::<bool>()).prop_map(|(verify, revoke)| Policy {
            release: if verify {
                ReleasePolicy::VerifyOwner
            } else {
                ReleasePolicy::Trusting
            },
            handoff: if revoke {
                HandoffPolicy::Revoke
            } else {
                HandoffPolicy::Silent
            },
        })
    }

    proptest! {
        /// Property: record invariants hold after any sequence of requests
        #[test]
        fn prop_invariants_hold(ops in prop::collection::vec(op_strategy(), 0..64), policy in policy_strategy()) {
            let clients: Vec<ClientId> = ["c0", "c1", "c2", "c3"].iter().map(|n| client(n)).collect();
            let mut table = LockTable::new();

            for op in ops {
                match op {
                    Op::Acquire(l, c) => { acquire(&mut table, lock(l), &clients[c], policy); }
                    Op::Release(l, c) => { release(&mut table, lock(l), &clients[c], policy); }
                }
                for record in table.iter() {
                    prop_assert_eq!(record.check_invariants(), Ok(()));
                }
            }
        }

        /// Property: a revoke targets the owner at the time of the request, and
        /// only the locked -> locked-and-wait transition (or a handoff) emits one
        #[test]
        fn prop_revoke_targets_owner(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let clients: Vec<ClientId> = ["c0", "c1", "c2", "c3"].iter().map(|n| client(n)).collect();
            let mut table = LockTable::new();
            let policy = Policy::default();

            for op in ops {
                if let Op::Acquire(l, c) = op {
                    let before = table.get(lock(l)).map(|r| (r.state(), r.owner().cloned()));
                    let outcome = acquire(&mut table, lock(l), &clients[c], policy);
                    if let Some(callback) = outcome.callback {
                        prop_assert_eq!(callback.kind, CallbackKind::Revoke);
                        match before {
                            Some((LockState::Locked, owner)) => {
                                prop_assert_eq!(Some(callback.target), owner);
                            }
                            Some((LockState::Ordered, _)) => {
                                prop_assert_eq!(&callback.target, &clients[c]);
                            }
                            other => prop_assert!(false, "unexpected revoke from {:?}", other),
                        }
                    }
                } else if let Op::Release(l, c) = op {
                    let head = table.get(lock(l)).and_then(|r| r.waiters().front().cloned());
                    let outcome = release(&mut table, lock(l), &clients[c], policy);
                    if let Some(callback) = outcome.callback {
                        prop_assert_eq!(callback.kind, CallbackKind::Retry);
                        prop_assert_eq!(Some(callback.target), head);
                    }
                }
            }
        }
    }
}
