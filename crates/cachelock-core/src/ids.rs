//! Lock and client identifiers.
//!
//! The lock table treats a client ID as an opaque string and only compares
//! it. The TCP transport gives it a second job: it is the address of the
//! client's callback listener, and the server dials it to deliver `revoke`
//! and `retry`. That is why [`ClientId::parse`] rejects whitespace, control
//! characters and oversized values that no socket address could contain.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum allowed length for a client identifier, in bytes.
const MAX_CLIENT_ID_LENGTH: usize = 256;

/// Opaque integer naming a distinct lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(u64);

impl LockId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for LockId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| Error::Validation(format!("Invalid lock id '{s}': {e}")))
    }
}

/// Validated client identifier.
///
/// Over TCP this is the address the client listens on for `revoke` and
/// `retry` callbacks, so the server can reach it by identifier alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Parse and validate a client ID.
    ///
    /// Rejects empty identifiers, identifiers longer than 256 bytes, and any
    /// whitespace or control characters.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();

        if s.trim().is_empty() {
            return Err(Error::Validation("Client ID cannot be empty".to_string()));
        }

        if s.len() > MAX_CLIENT_ID_LENGTH {
            return Err(Error::Validation(format!(
                "Client ID exceeds maximum length of {MAX_CLIENT_ID_LENGTH} bytes"
            )));
        }

        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::Validation(format!(
                "Client ID '{}' contains whitespace or control characters",
                s.escape_debug()
            )));
        }

        Ok(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(serde::de::Error::custom)
    }
}
