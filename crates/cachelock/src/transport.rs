//! Line-delimited JSON over TCP.
//!
//! Used in both directions: clients call the lock server, and the lock server
//! calls back into each client's callback listener.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use cachelock_core::{decode_frame, encode_frame, Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::Mutex,
};

/// Request handler behind a listener.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Reply: Serialize + Send;

    async fn call(&self, request: Self::Request) -> Self::Reply;

    /// Reply sent for a line that does not parse.
    fn reject(&self, message: String) -> Self::Reply;
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections forever, one task per connection.
///
/// Accept errors are logged and never end the loop.
pub async fn serve<S: Service>(listener: TcpListener, service: Arc<S>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                if let Some(pause) = accept_backoff(&e) {
                    tokio::time::sleep(pause).await;
                }
                continue;
            }
        };
        tracing::debug!(%peer, "connection accepted");

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            match serve_connection(stream, service).await {
                Ok(()) => tracing::debug!(%peer, "connection closed"),
                Err(e) => tracing::debug!(%peer, error = %e, "connection dropped"),
            }
        });
    }
}

// A failed handshake only affects that peer. Anything else (running out of
// file descriptors, typically) repeats immediately unless we pause.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

async fn serve_connection<S: Service>(stream: TcpStream, service: Arc<S>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match decode_frame::<S::Request>(&line) {
            Ok(request) => service.call(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request");
                service.reject(e.to_string())
            }
        };
        writer.write_all(encode_frame(&reply)?.as_bytes()).await?;
    }

    Ok(())
}

struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Channel {
    async fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::unreachable(addr, e))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn round_trip<Req, Reply>(&mut self, peer: &str, request: &Req) -> Result<Reply>
    where
        Req: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        self.writer
            .write_all(encode_frame(request)?.as_bytes())
            .await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(Error::Protocol(format!(
                "{peer} closed the connection before replying"
            )));
        }
        decode_frame(&line)
    }
}

/// A connected peer, called one request at a time.
///
/// The stream is checked out for the length of each call and only put back
/// after a complete reply. A call that fails or is dropped part way leaves
/// no stream behind, and the next call reconnects rather than reading a
/// stale reply.
pub struct RpcConnection {
    peer: String,
    channel: Mutex<Option<Channel>>,
}

impl RpcConnection {
    pub async fn connect(addr: &str) -> Result<Self> {
        let channel = Channel::open(addr).await?;
        Ok(Self {
            peer: addr.to_string(),
            channel: Mutex::new(Some(channel)),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one request and wait for its reply.
    pub async fn call<Req, Reply>(&self, request: &Req) -> Result<Reply>
    where
        Req: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        let mut slot = self.channel.lock().await;
        let mut channel = match slot.take() {
            Some(channel) => channel,
            None => {
                tracing::debug!(peer = %self.peer, "reconnecting");
                Channel::open(&self.peer).await?
            }
        };

        let reply = channel.round_trip(&self.peer, request).await?;
        *slot = Some(channel);
        Ok(reply)
    }
}

/// Bind a listener, returning it with its resolved local address.
pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::IoError(format!("Failed to bind {addr}: {e}")))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}
