//! TCP implementation of the server's callback capability.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use cachelock_core::{
    CallbackReply, CallbackRequest, ClientId, ClientRegistry, Error, Result, Status,
};
use tokio::{sync::Mutex, time::Instant};

use crate::transport::RpcConnection;

const MAX_CACHED: usize = 256;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Cached {
    conn: Arc<RpcConnection>,
    last_used: Instant,
}

/// Reaches clients at the address their [`ClientId`] names.
///
/// Connections are cached per client and reused. A connection that fails
/// mid-call is dropped so the next callback reconnects. Short-lived clients
/// go away without telling the server, so the cache is bounded and entries
/// idle past a timeout are closed when a new client is added.
pub struct TcpClientRegistry {
    connections: Mutex<HashMap<ClientId, Cached>>,
    max_cached: usize,
    idle_timeout: Duration,
}

impl Default for TcpClientRegistry {
    fn default() -> Self {
        Self::with_limits(MAX_CACHED, IDLE_TIMEOUT)
    }
}

impl TcpClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limits(max_cached: usize, idle_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_cached: max_cached.max(1),
            idle_timeout,
        }
    }

    async fn connection(&self, target: &ClientId) -> Result<Arc<RpcConnection>> {
        if let Some(cached) = self.connections.lock().await.get_mut(target) {
            cached.last_used = Instant::now();
            return Ok(Arc::clone(&cached.conn));
        }

        // Connect without holding the map so one dead client cannot stall
        // callbacks to the others.
        let conn = Arc::new(RpcConnection::connect(target.as_str()).await?);
        let mut connections = self.connections.lock().await;
        self.evict(&mut connections);
        let cached = connections.entry(target.clone()).or_insert_with(|| Cached {
            conn,
            last_used: Instant::now(),
        });
        Ok(Arc::clone(&cached.conn))
    }

    fn evict(&self, connections: &mut HashMap<ClientId, Cached>) {
        let now = Instant::now();
        connections.retain(|client, cached| {
            let keep = now.duration_since(cached.last_used) < self.idle_timeout;
            if !keep {
                tracing::debug!(%client, "closing idle callback connection");
            }
            keep
        });

        while connections.len() >= self.max_cached {
            let Some(oldest) = connections
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(client, _)| client.clone())
            else {
                break;
            };
            tracing::debug!(client = %oldest, "callback connection cache full, closing oldest");
            connections.remove(&oldest);
        }
    }

    async fn forget(&self, target: &ClientId, conn: &Arc<RpcConnection>) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(target)
            .is_some_and(|cached| Arc::ptr_eq(&cached.conn, conn))
        {
            connections.remove(target);
        }
    }

    #[cfg(test)]
    async fn cached(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[async_trait]
impl ClientRegistry for TcpClientRegistry {
    async fn call(&self, target: &ClientId, request: CallbackRequest) -> Result<Status> {
        let conn = self.connection(target).await?;

        match conn.call::<_, CallbackReply>(&request).await {
            Ok(reply) => Ok(reply.status),
            Err(e) => {
                self.forget(target, &conn).await;
                Err(Error::unreachable(target.as_str(), e))
            }
        }
    }
}
