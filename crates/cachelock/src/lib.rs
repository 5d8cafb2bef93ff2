//! cachelock - caching distributed lock service
//!
//! TCP server, caching client and command-line front end built on
//! `cachelock-core`.

pub mod cli;
pub mod client;
pub mod error;
pub mod registry;
pub mod server;
pub mod transport;

pub use client::{LocalState, LockClient};
pub use error::{Error, Result};
