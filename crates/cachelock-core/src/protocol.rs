//! Wire protocol shared by the server, its clients, and the callback path.
//!
//! Every message is one JSON object on one line. Each request line gets
//! exactly one reply line on the same connection.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::Display;

use crate::{ClientId, LockId, LockSnapshot, Result};

/// Reply status for lock and callback RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// Granted, released, or callback accepted
    Ok,
    /// Queued; wait for a `retry` callback and re-issue `acquire`
    Retry,
    /// Release refused: the caller does not hold the lock
    NotOwner,
    /// Transport-level failure; never produced by the state machine
    Error,
}

impl Status {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Client-to-server requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerRequest {
    Acquire { lock: LockId, client: ClientId },
    Release { lock: LockId, client: ClientId },
    Stat { lock: LockId },
    Inspect { lock: LockId },
}

/// Server-to-client replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ServerReply {
    Status { status: Status },
    Stat { grants: u64 },
    Inspect { snapshot: Option<LockSnapshot> },
    Error { message: String },
}

impl ServerReply {
    /// Status carried by the reply. Stat and inspect replies count as `Ok`.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::Status { status } => *status,
            Self::Stat { .. } | Self::Inspect { .. } => Status::Ok,
            Self::Error { .. } => Status::Error,
        }
    }
}

/// Server-to-client callback requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CallbackRequest {
    /// Give the lock back as soon as local use ends
    Revoke { lock: LockId },
    /// Re-issue `acquire`; you are at the head of the queue
    Retry { lock: LockId },
}

impl CallbackRequest {
    #[must_use]
    pub const fn lock(self) -> LockId {
        match self {
            Self::Revoke { lock } | Self::Retry { lock } => lock,
        }
    }

    #[must_use]
    pub const fn kind(self) -> CallbackKind {
        match self {
            Self::Revoke { .. } => CallbackKind::Revoke,
            Self::Retry { .. } => CallbackKind::Retry,
        }
    }
}

/// Reply to a [`CallbackRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallbackKind {
    Revoke,
    Retry,
}

/// An outbound callback decided inside the critical section.
///
/// Holds owned copies of everything needed to place the call, so the table
/// can be unlocked before any network I/O happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub kind: CallbackKind,
    pub lock: LockId,
    pub target: ClientId,
}

impl Callback {
    #[must_use]
    pub fn revoke(lock: LockId, target: ClientId) -> Self {
        Self {
            kind: CallbackKind::Revoke,
            lock,
            target,
        }
    }

    #[must_use]
    pub fn retry(lock: LockId, target: ClientId) -> Self {
        Self {
            kind: CallbackKind::Retry,
            lock,
            target,
        }
    }

    #[must_use]
    pub const fn request(&self) -> CallbackRequest {
        match self.kind {
            CallbackKind::Revoke => CallbackRequest::Revoke { lock: self.lock },
            CallbackKind::Retry => CallbackRequest::Retry { lock: self.lock },
        }
    }
}

/// Serialise a message as one newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame (surrounding whitespace ignored).
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}
