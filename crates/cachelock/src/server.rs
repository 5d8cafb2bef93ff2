//! Lock server over TCP.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use cachelock_core::{
    CallbackDispatcher, ClientRegistry, Config, LockServer, ServerReply, ServerRequest,
};
use tokio::task::JoinHandle;

use crate::{
    registry::TcpClientRegistry,
    transport::{bind, serve, Service},
};

pub type TcpLockServer = LockServer<TcpClientRegistry>;

#[async_trait]
impl<R: ClientRegistry + 'static> Service for LockServer<R> {
    type Request = ServerRequest;
    type Reply = ServerReply;

    async fn call(&self, request: ServerRequest) -> ServerReply {
        self.handle(request).await
    }

    fn reject(&self, message: String) -> ServerReply {
        ServerReply::Error { message }
    }
}

/// Build a server whose callbacks go out over TCP.
pub fn build(config: &Config) -> TcpLockServer {
    LockServer::new(
        CallbackDispatcher::new(TcpClientRegistry::new(), config.callback_policy()),
        config.policy(),
    )
}

/// Bind `config.server.listen` and serve in the background.
///
/// Returns the bound address (useful with port 0), the server, and the
/// accept-loop task, which runs until aborted.
pub async fn spawn(
    config: &Config,
) -> cachelock_core::Result<(SocketAddr, Arc<TcpLockServer>, JoinHandle<()>)> {
    let (listener, addr) = bind(&config.server.listen).await?;
    let server = Arc::new(build(config));

    let task = tokio::spawn(serve(listener, Arc::clone(&server)));

    tracing::info!(
        %addr,
        callback_attempts = config.callback.attempts,
        verify_release_owner = config.server.verify_release_owner,
        "lock server listening"
    );
    Ok((addr, server, task))
}
