use cachelock_core::{LockId, Status};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] cachelock_core::Error),

    #[error("Server refused {op} on lock {lock}: {status}")]
    Refused {
        op: &'static str,
        lock: LockId,
        status: Status,
    },

    #[error("Lock {0} is not held by this client")]
    NotHeld(LockId),

    #[error("Background lock task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Unexpected reply from server: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, Error>;
