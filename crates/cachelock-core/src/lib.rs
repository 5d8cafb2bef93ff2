//! cachelock-core - Caching lock service core
//!
//! This crate provides:
//! - Lock and client identifiers
//! - Lock records, the lock table, and the per-lock state machine
//! - The wire protocol and the revoke/retry callback dispatcher
//! - The async lock server and its configuration
//! - The extent store interface used alongside the lock service

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod callback;
pub mod config;
pub mod error;
pub mod extent;
pub mod ids;
pub mod lock;
pub mod machine;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod table;

pub use callback::{CallbackDispatcher, CallbackPolicy, ClientRegistry, DeliveryReport};
pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use extent::{ExtentAttr, ExtentId, ExtentStore, MemoryExtentStore};
pub use ids::{ClientId, LockId};
pub use lock::{InvariantViolation, LockRecord, LockSnapshot, LockState};
pub use machine::{Anomaly, HandoffPolicy, Policy, ReleasePolicy};
pub use protocol::{
    decode_frame, encode_frame, Callback, CallbackKind, CallbackReply, CallbackRequest,
    ServerReply, ServerRequest, Status,
};
pub use queue::WaitQueue;
pub use server::LockServer;
pub use table::LockTable;
