//! Outbound `revoke` / `retry` delivery.
//!
//! The dispatcher is only ever called after the lock table has been unlocked.
//! A failed delivery is logged and reported; the transition that produced the
//! callback stays committed.

use std::time::Duration;

use async_trait::async_trait;

use crate::{Callback, CallbackRequest, ClientId, Result, Status};

/// Capability to reach a client by identifier.
///
/// `Err` means the client could not be reached at all; `Ok` with a non-`Ok`
/// status means it was reached and declined.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn call(&self, target: &ClientId, request: CallbackRequest) -> Result<Status>;
}

/// How hard the dispatcher tries before giving up on a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackPolicy {
    /// Total attempts, at least one. One means a single best-effort call.
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(50),
        }
    }
}

/// What happened to one dispatched callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: bool,
    pub attempts: u32,
}

/// Places callbacks through a [`ClientRegistry`].
#[derive(Debug)]
pub struct CallbackDispatcher<R> {
    registry: R,
    policy: CallbackPolicy,
}

impl<R: ClientRegistry> CallbackDispatcher<R> {
    pub const fn new(registry: R, policy: CallbackPolicy) -> Self {
        Self { registry, policy }
    }

    pub const fn registry(&self) -> &R {
        &self.registry
    }

    pub const fn policy(&self) -> CallbackPolicy {
        self.policy
    }

    /// Deliver `callback`, retrying per policy.
    pub async fn dispatch(&self, callback: &Callback) -> DeliveryReport {
        let attempts = self.policy.attempts.max(1);
        let request = callback.request();

        for attempt in 1..=attempts {
            if attempt > 1 && !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff).await;
            }

            match self.registry.call(&callback.target, request).await {
                Ok(Status::Ok) => {
                    tracing::debug!(
                        kind = %callback.kind,
                        lock = %callback.lock,
                        target = %callback.target,
                        attempt,
                        "callback delivered"
                    );
                    return DeliveryReport {
                        delivered: true,
                        attempts: attempt,
                    };
                }
                Ok(status) => tracing::warn!(
                    kind = %callback.kind,
                    lock = %callback.lock,
                    target = %callback.target,
                    attempt,
                    %status,
                    "callback rejected"
                ),
                Err(e) => tracing::warn!(
                    kind = %callback.kind,
                    lock = %callback.lock,
                    target = %callback.target,
                    attempt,
                    error = %e,
                    "callback failed"
                ),
            }
        }

        tracing::error!(
            kind = %callback.kind,
            lock = %callback.lock,
            target = %callback.target,
            attempts,
            "giving up on callback; lock stays in its new state"
        );
        DeliveryReport {
            delivered: false,
            attempts,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory registry used by unit tests.

    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use super::*;
    use crate::Error;

    /// Records every call; replies from a per-client script, default `Ok`.
    #[derive(Debug, Default)]
    pub struct RecordingRegistry {
        calls: Mutex<Vec<(ClientId, CallbackRequest)>>,
        script: Mutex<HashMap<ClientId, VecDeque<Result<Status>>>>,
    }

    impl RecordingRegistry {
        pub fn script(&self, target: &ClientId, replies: Vec<Result<Status>>) {
            self.script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(target.clone(), replies.into());
        }

        pub fn calls(&self) -> Vec<(ClientId, CallbackRequest)> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        pub fn unreachable() -> Result<Status> {
            Err(Error::unreachable("test", "connection refused"))
        }
    }

    #[async_trait]
    impl ClientRegistry for RecordingRegistry {
        async fn call(&self, target: &ClientId, request: CallbackRequest) -> Result<Status> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((target.clone(), request));
            self.script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get_mut(target)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(Status::Ok))
        }
    }
}
