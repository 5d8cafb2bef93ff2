//! Caching lock client.
//!
//! Keeps a lock after local use until the server revokes it, so repeated
//! acquire/release by the same process costs no round trips. The client also
//! runs the listener that receives `revoke` and `retry` callbacks; its
//! [`ClientId`] is that listener's address.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use cachelock_core::{
    CallbackReply, CallbackRequest, ClientId, LockId, ServerReply, ServerRequest, Status,
};
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    error::{Error, Result},
    transport::{bind, serve, RpcConnection, Service},
};

/// Local view of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalState {
    /// Not held by this client
    #[default]
    Unheld,
    /// Held from the server, not in use locally
    Free,
    /// Held and in use by a local task
    Locked,
    /// Acquire request in flight
    Acquiring,
    /// Being handed back to the server
    Releasing,
}

#[derive(Debug, Default)]
struct LocalLock {
    state: LocalState,
    /// Server asked for the lock back; return it on next local release
    revoke_pending: bool,
    /// Server said this client is next in line
    retry_pending: bool,
    /// Local `acquire` calls currently parked on this lock
    wanted: usize,
    /// Why the last server-side acquire failed, for the next parked caller
    failure: Option<Error>,
}

/// Client side of the caching lock protocol.
///
/// Server round trips run in tasks owned by the client, so a caller that
/// stops waiting (a dropped `acquire` future, say) never leaves a lock
/// half-acquired or half-returned.
pub struct LockClient {
    id: ClientId,
    server: RpcConnection,
    locks: Mutex<HashMap<LockId, LocalLock>>,
    changed: Notify,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl LockClient {
    /// Connect to `server_addr` and start a callback listener on `callback_addr`.
    ///
    /// Use port 0 to let the OS pick; the bound address becomes the client ID.
    pub async fn connect(server_addr: &str, callback_addr: &str) -> Result<Arc<Self>> {
        let (listener, local) = bind(callback_addr).await?;
        let id = ClientId::parse(local.to_string())?;
        let server = RpcConnection::connect(server_addr).await?;

        let client = Arc::new(Self {
            id,
            server,
            locks: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            listener: Mutex::new(None),
        });

        let callbacks = Arc::new(CallbackHandler {
            client: Arc::downgrade(&client),
        });
        *client.listener_slot() = Some(tokio::spawn(serve(listener, callbacks)));

        tracing::info!(client = %client.id, server = %server_addr, "lock client started");
        Ok(client)
    }

    #[must_use]
    pub const fn id(&self) -> &ClientId {
        &self.id
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<LockId, LocalLock>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Local state of `lock`, for diagnostics and tests.
    pub fn state(&self, lock: LockId) -> LocalState {
        self.locks().get(&lock).map_or(LocalState::Unheld, |l| l.state)
    }

    /// Acquire `lock` for a local task, waiting as long as it takes.
    ///
    /// Dropping the returned future only stops the wait. A request already
    /// sent to the server runs on; its grant is cached for the next caller,
    /// or handed back if the server revokes it first.
    pub async fn acquire(self: &Arc<Self>, lock: LockId) -> Result<()> {
        let _interest = Interest::register(self, lock);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut locks = self.locks();
                let entry = locks.entry(lock).or_default();
                match entry.state {
                    LocalState::Free => {
                        entry.state = LocalState::Locked;
                        tracing::debug!(%lock, "cached grant");
                        return Ok(());
                    }
                    LocalState::Unheld => {
                        if let Some(error) = entry.failure.take() {
                            return Err(error);
                        }
                        entry.state = LocalState::Acquiring;
                        entry.retry_pending = false;
                        let client = Arc::clone(self);
                        tokio::spawn(async move { client.fetch(lock).await });
                    }
                    LocalState::Locked | LocalState::Acquiring | LocalState::Releasing => {}
                }
            }

            notified.await;
        }
    }

    // Runs in its own task until the server grants or refuses.
    async fn fetch(self: Arc<Self>, lock: LockId) {
        loop {
            let reply = self
                .server
                .call::<_, ServerReply>(&ServerRequest::Acquire {
                    lock,
                    client: self.id.clone(),
                })
                .await;

            match reply.map(|r| r.status()) {
                Ok(Status::Ok) => {
                    self.granted(lock);
                    return;
                }
                Ok(Status::Retry) => {
                    tracing::debug!(%lock, "queued, waiting for retry");
                    self.wait_for_retry(lock).await;
                }
                Ok(status) => {
                    self.failed(
                        lock,
                        Error::Refused {
                            op: "acquire",
                            lock,
                            status,
                        },
                    );
                    return;
                }
                Err(e) => {
                    self.failed(lock, e.into());
                    return;
                }
            }
        }
    }

    async fn wait_for_retry(&self, lock: LockId) {
        {
            // Not the owner, so any revoke seen so far was stale.
            let mut locks = self.locks();
            if let Some(entry) = locks.get_mut(&lock) {
                entry.revoke_pending = false;
            }
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut locks = self.locks();
                let entry = locks.entry(lock).or_default();
                if entry.retry_pending {
                    entry.retry_pending = false;
                    return;
                }
            }

            notified.await;
        }
    }

    fn granted(self: &Arc<Self>, lock: LockId) {
        self.locks().entry(lock).or_default().state = LocalState::Free;
        tracing::debug!(%lock, "granted by server");
        self.changed.notify_waiters();
        self.settle(lock);
    }

    fn failed(&self, lock: LockId, error: Error) {
        tracing::warn!(%lock, error = %error, "acquire failed");
        {
            let mut locks = self.locks();
            let entry = locks.entry(lock).or_default();
            entry.state = LocalState::Unheld;
            entry.revoke_pending = false;
            if entry.wanted > 0 {
                entry.failure = Some(error);
            }
        }
        self.changed.notify_waiters();
    }

    /// Return a revoked lock once nothing local is in or waiting for it.
    fn settle(self: &Arc<Self>, lock: LockId) {
        {
            let mut locks = self.locks();
            let Some(entry) = locks.get_mut(&lock) else {
                return;
            };
            if entry.state != LocalState::Free || !entry.revoke_pending || entry.wanted > 0 {
                return;
            }
            entry.state = LocalState::Releasing;
        }

        tracing::debug!(%lock, "revoked while idle, returning");
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.return_to_server(lock).await {
                tracing::warn!(%lock, error = %e, "failed to return revoked lock");
            }
        });
    }

    /// Release `lock` after local use.
    ///
    /// The lock stays cached unless the server has asked for it back.
    pub async fn release(self: &Arc<Self>, lock: LockId) -> Result<()> {
        let give_back = {
            let mut locks = self.locks();
            let entry = locks
                .get_mut(&lock)
                .filter(|entry| entry.state == LocalState::Locked)
                .ok_or(Error::NotHeld(lock))?;

            if entry.revoke_pending {
                entry.state = LocalState::Releasing;
                true
            } else {
                entry.state = LocalState::Free;
                false
            }
        };

        if give_back {
            self.spawn_return(lock).await?
        } else {
            self.changed.notify_waiters();
            Ok(())
        }
    }

    /// Hand every cached, unused lock back to the server.
    ///
    /// Call before the process goes away; otherwise the server keeps sending
    /// revokes to a listener that no longer exists.
    pub async fn return_cached(self: &Arc<Self>) -> Result<()> {
        let cached: Vec<LockId> = {
            let mut locks = self.locks();
            locks
                .iter_mut()
                .filter(|(_, entry)| entry.state == LocalState::Free)
                .map(|(lock, entry)| {
                    entry.state = LocalState::Releasing;
                    *lock
                })
                .collect()
        };
        let returns: Vec<_> = cached
            .into_iter()
            .map(|lock| self.spawn_return(lock))
            .collect();

        for handle in returns {
            handle.await??;
        }
        Ok(())
    }

    fn spawn_return(self: &Arc<Self>, lock: LockId) -> JoinHandle<Result<()>> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.return_to_server(lock).await })
    }

    async fn return_to_server(&self, lock: LockId) -> Result<()> {
        let reply = self
            .server
            .call::<_, ServerReply>(&ServerRequest::Release {
                lock,
                client: self.id.clone(),
            })
            .await;

        {
            let mut locks = self.locks();
            let entry = locks.entry(lock).or_default();
            entry.state = LocalState::Unheld;
            entry.revoke_pending = false;
        }
        self.changed.notify_waiters();

        match reply?.status() {
            Status::Ok => {
                tracing::debug!(%lock, "returned to server");
                Ok(())
            }
            status => Err(Error::Refused {
                op: "release",
                lock,
                status,
            }),
        }
    }

    fn on_revoke(self: &Arc<Self>, lock: LockId) {
        {
            let mut locks = self.locks();
            let entry = locks.entry(lock).or_default();
            match entry.state {
                LocalState::Free | LocalState::Locked | LocalState::Acquiring => {
                    entry.revoke_pending = true;
                    tracing::debug!(%lock, state = ?entry.state, "revoke noted");
                }
                state @ (LocalState::Unheld | LocalState::Releasing) => {
                    tracing::debug!(%lock, ?state, "stale revoke ignored");
                    return;
                }
            }
        }
        self.settle(lock);
    }

    fn on_retry(&self, lock: LockId) {
        self.locks().entry(lock).or_default().retry_pending = true;
        self.changed.notify_waiters();
        tracing::debug!(%lock, "retry received");
    }

    /// Grant count reported by the server.
    pub async fn stat(&self, lock: LockId) -> Result<u64> {
        match self
            .server
            .call::<_, ServerReply>(&ServerRequest::Stat { lock })
            .await?
        {
            ServerReply::Stat { grants } => Ok(grants),
            other => Err(Error::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Stop the callback listener. Cached locks are not returned.
    pub fn shutdown(&self) {
        if let Some(task) = self.listener_slot().take() {
            task.abort();
        }
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Counts one parked `acquire` for as long as it is alive.
struct Interest<'a> {
    client: &'a Arc<LockClient>,
    lock: LockId,
}

impl<'a> Interest<'a> {
    fn register(client: &'a Arc<LockClient>, lock: LockId) -> Self {
        client.locks().entry(lock).or_default().wanted += 1;
        Self { client, lock }
    }
}

impl Drop for Interest<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.client.locks().get_mut(&self.lock) {
            entry.wanted = entry.wanted.saturating_sub(1);
            if entry.wanted == 0 {
                entry.failure = None;
            }
        }
        self.client.settle(self.lock);
    }
}

/// Receives callbacks for one [`LockClient`].
struct CallbackHandler {
    client: Weak<LockClient>,
}

#[async_trait]
impl Service for CallbackHandler {
    type Request = CallbackRequest;
    type Reply = CallbackReply;

    async fn call(&self, request: CallbackRequest) -> CallbackReply {
        let Some(client) = self.client.upgrade() else {
            return CallbackReply {
                status: Status::Error,
            };
        };

        match request {
            CallbackRequest::Revoke { lock } => client.on_revoke(lock),
            CallbackRequest::Retry { lock } => client.on_retry(lock),
        }
        CallbackReply { status: Status::Ok }
    }

    fn reject(&self, _message: String) -> CallbackReply {
        CallbackReply {
            status: Status::Error,
        }
    }
}
