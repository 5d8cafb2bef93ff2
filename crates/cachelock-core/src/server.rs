//! The lock server: table, grant counter, and callback dispatch.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use crate::{
    machine::{self, Anomaly, Outcome, Policy},
    CallbackDispatcher, ClientId, ClientRegistry, LockId, LockSnapshot, LockTable, ServerReply,
    ServerRequest, Status,
};

/// Central lock authority.
///
/// All table access happens under one server-wide mutex. Decisions are made
/// while holding it; callbacks are placed only after the guard is dropped.
pub struct LockServer<R> {
    table: Mutex<LockTable>,
    grants: AtomicU64,
    undelivered: AtomicU64,
    dispatcher: CallbackDispatcher<R>,
    policy: Policy,
}

impl<R: ClientRegistry> LockServer<R> {
    pub fn new(dispatcher: CallbackDispatcher<R>, policy: Policy) -> Self {
        Self {
            table: Mutex::new(LockTable::new()),
            grants: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
            dispatcher,
            policy,
        }
    }

    pub const fn dispatcher(&self) -> &CallbackDispatcher<R> {
        &self.dispatcher
    }

    // A panic while holding the table cannot leave a record half-written
    // (every transition assigns whole fields), so poisoning is ignored.
    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle `acquire(lock, client)`.
    pub async fn acquire(&self, lock: LockId, client: ClientId) -> Status {
        let outcome = {
            let mut table = self.table();
            machine::acquire(&mut table, lock, &client, self.policy)
        };

        if outcome.status.is_ok() {
            self.grants.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(
            %lock,
            %client,
            status = %outcome.status,
            state = ?outcome.state,
            "acquire"
        );
        self.finish(outcome).await
    }

    /// Handle `release(lock, client)`.
    pub async fn release(&self, lock: LockId, client: ClientId) -> Status {
        let outcome = {
            let mut table = self.table();
            machine::release(&mut table, lock, &client, self.policy)
        };

        tracing::debug!(
            %lock,
            %client,
            status = %outcome.status,
            state = ?outcome.state,
            "release"
        );
        self.finish(outcome).await
    }

    /// Grants issued since start, across all locks. The lock argument is unused.
    pub fn stat(&self, lock: LockId) -> u64 {
        let grants = self.grants.load(Ordering::Relaxed);
        tracing::debug!(%lock, grants, "stat");
        grants
    }

    /// Callbacks given up on since start.
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    /// Copy of one record, if it exists.
    pub fn inspect(&self, lock: LockId) -> Option<LockSnapshot> {
        self.table().get(lock).map(crate::LockRecord::snapshot)
    }

    /// Dispatch one decoded wire request.
    pub async fn handle(&self, request: ServerRequest) -> ServerReply {
        match request {
            ServerRequest::Acquire { lock, client } => ServerReply::Status {
                status: self.acquire(lock, client).await,
            },
            ServerRequest::Release { lock, client } => ServerReply::Status {
                status: self.release(lock, client).await,
            },
            ServerRequest::Stat { lock } => ServerReply::Stat {
                grants: self.stat(lock),
            },
            ServerRequest::Inspect { lock } => ServerReply::Inspect {
                snapshot: self.inspect(lock),
            },
        }
    }

    // Runs with the table unlocked.
    async fn finish(&self, outcome: Outcome) -> Status {
        if let Some(anomaly) = &outcome.anomaly {
            log_anomaly(anomaly);
        }
        if let Some(callback) = &outcome.callback {
            let report = self.dispatcher.dispatch(callback).await;
            if !report.delivered {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(
                kind = %callback.kind,
                lock = %callback.lock,
                target = %callback.target,
                delivered = report.delivered,
                attempts = report.attempts,
                "callback dispatched"
            );
        }
        outcome.status
    }
}

fn log_anomaly(anomaly: &Anomaly) {
    if anomaly.is_client_fault() {
        tracing::warn!(%anomaly, "protocol violation");
    } else {
        tracing::error!(%anomaly, "lock invariant violated");
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        callback::testing::RecordingRegistry, CallbackPolicy, CallbackRequest, LockState,
    };

    fn client(name: &str) -> ClientId {
        ClientId::parse(name).unwrap_or_else(|e| panic!("bad test client id: {e}"))
    }

    fn server() -> LockServer<RecordingRegistry> {
        LockServer::new(
            CallbackDispatcher::new(RecordingRegistry::default(), CallbackPolicy::default()),
            Policy::default(),
        )
    }

    fn calls(server: &LockServer<RecordingRegistry>) -> Vec<(ClientId, CallbackRequest)> {
        server.dispatcher().registry().calls()
    }

    #[tokio::test]
    async fn test_revoke_retry_scenario() {
        let server = server();
        let lock = LockId::new(5);

        assert_eq!(server.acquire(lock, client("A")).await, Status::Ok);
        assert!(calls(&server).is_empty());

        assert_eq!(server.acquire(lock, client("B")).await, Status::Retry);
        assert_eq!(
            calls(&server),
            vec![(client("A"), CallbackRequest::Revoke { lock })]
        );

        assert_eq!(server.release(lock, client("A")).await, Status::Ok);
        assert_eq!(
            calls(&server)[1],
            (client("B"), CallbackRequest::Retry { lock })
        );
        let snapshot = server.inspect(lock);
        assert_eq!(snapshot.map(|s| s.state), Some(LockState::Ordered));

        assert_eq!(server.acquire(lock, client("B")).await, Status::Ok);
        assert_eq!(calls(&server).len(), 2);
        assert_eq!(server.stat(lock), 2);
    }

    #[tokio::test]
    async fn test_failed_revoke_keeps_transition() {
        let server = server();
        let lock = LockId::new(6);
        server
            .dispatcher()
            .registry()
            .script(&client("A"), vec![RecordingRegistry::unreachable()]);

        server.acquire(lock, client("A")).await;
        assert_eq!(server.acquire(lock, client("B")).await, Status::Retry);

        let snapshot = server.inspect(lock);
        assert_eq!(snapshot.map(|s| s.state), Some(LockState::LockedAndWait));
        assert_eq!(server.undelivered(), 1);
    }

    #[tokio::test]
    async fn test_failed_retry_leaves_lock_ordered() {
        let server = server();
        let lock = LockId::new(14);
        server
            .dispatcher()
            .registry()
            .script(&client("B"), vec![RecordingRegistry::unreachable()]);

        server.acquire(lock, client("A")).await;
        server.acquire(lock, client("B")).await;
        assert_eq!(server.release(lock, client("A")).await, Status::Ok);

        let snapshot = server
            .inspect(lock)
            .unwrap_or_else(|| panic!("record missing"));
        assert_eq!(snapshot.state, LockState::Ordered);
        assert_eq!(snapshot.owner, None);
        assert_eq!(snapshot.waiters, vec![client("B")]);
        assert_eq!(server.undelivered(), 1);

        // The head can still claim the lock on its own.
        assert_eq!(server.acquire(lock, client("B")).await, Status::Ok);
        assert_eq!(server.stat(lock), 2);
    }

    #[tokio::test]
    async fn test_non_owner_release_of_contended_lock_is_refused() {
        let server = server();
        let lock = LockId::new(15);
        server.acquire(lock, client("A")).await;
        server.acquire(lock, client("B")).await;

        assert_eq!(server.release(lock, client("B")).await, Status::NotOwner);

        let snapshot = server
            .inspect(lock)
            .unwrap_or_else(|| panic!("record missing"));
        assert_eq!(snapshot.state, LockState::LockedAndWait);
        assert_eq!(snapshot.owner, Some(client("A")));
        assert_eq!(snapshot.waiters, vec![client("B")]);
        // Only the revoke from the contended acquire; no retry.
        assert_eq!(
            calls(&server),
            vec![(client("A"), CallbackRequest::Revoke { lock })]
        );
    }

    #[tokio::test]
    async fn test_release_unknown_lock_returns_ok() {
        let server = server();
        assert_eq!(server.release(LockId::new(7), client("X")).await, Status::Ok);
        assert_eq!(server.inspect(LockId::new(7)), None);
        assert!(calls(&server).is_empty());
    }

    #[tokio::test]
    async fn test_stat_is_global_and_read_only() {
        let server = server();
        server.acquire(LockId::new(1), client("A")).await;
        server.acquire(LockId::new(2), client("A")).await;
        server.acquire(LockId::new(2), client("B")).await;

        assert_eq!(server.stat(LockId::new(1)), 2);
        assert_eq!(server.stat(LockId::new(99)), 2);
        assert_eq!(server.stat(LockId::new(99)), 2);
        assert_eq!(server.inspect(LockId::new(99)), None);
    }

    #[tokio::test]
    async fn test_handle_routes_requests() {
        let server = server();
        let lock = LockId::new(3);

        let reply = server
            .handle(ServerRequest::Acquire {
                lock,
                client: client("A"),
            })
            .await;
        assert_eq!(reply, ServerReply::Status { status: Status::Ok });

        let reply = server.handle(ServerRequest::Stat { lock }).await;
        assert_eq!(reply, ServerReply::Stat { grants: 1 });

        let reply = server.handle(ServerRequest::Inspect { lock }).await;
        assert!(matches!(
            reply,
            ServerReply::Inspect { snapshot: Some(ref s) } if s.owner == Some(client("A"))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_grants_once() {
        let server = Arc::new(server());
        let lock = LockId::new(11);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.acquire(lock, client(&format!("c{i}"))).await })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap_or(Status::Error) == Status::Ok {
                granted += 1;
            }
        }

        assert_eq!(granted, 1);
        assert_eq!(server.stat(lock), 1);
        let snapshot = server.inspect(lock).unwrap_or_else(|| panic!("record missing"));
        assert_eq!(snapshot.state, LockState::LockedAndWait);
        assert_eq!(snapshot.waiters.len(), 7);
        // Exactly one revoke, to whoever won.
        let revokes = calls(&server);
        assert_eq!(revokes.len(), 1);
        assert_eq!(Some(&revokes[0].0), snapshot.owner.as_ref());
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_table() {
        use async_trait::async_trait;

        struct SlowRegistry;

        #[async_trait]
        impl ClientRegistry for SlowRegistry {
            async fn call(
                &self,
                _target: &ClientId,
                _request: CallbackRequest,
            ) -> crate::Result<Status> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Status::Ok)
            }
        }

        let server = Arc::new(LockServer::new(
            CallbackDispatcher::new(SlowRegistry, CallbackPolicy::default()),
            Policy::default(),
        ));
        let lock = LockId::new(12);
        server.acquire(lock, client("A")).await;

        let stuck = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.acquire(lock, client("B")).await })
        };
        tokio::task::yield_now().await;

        let other = tokio::time::timeout(
            Duration::from_secs(5),
            server.acquire(LockId::new(13), client("C")),
        )
        .await;
        assert_eq!(other.ok(), Some(Status::Ok));
        assert!(server.inspect(lock).is_some());
        stuck.abort();
    }
}
