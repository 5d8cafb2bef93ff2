//! Server configuration loading
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: ~/.config/cachelock/config.toml
//! 3. Explicit config file (`--config`)
//! 4. Environment variables: `CACHELOCK_*`
//! 5. CLI flags (applied by the binary)
//!
//! # Example Config
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7400"
//! verify_release_owner = true
//! handoff = "revoke"
//!
//! [callback]
//! attempts = 1
//! backoff_ms = 50
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    machine::{HandoffPolicy, Policy, ReleasePolicy},
    CallbackPolicy, Error, Result,
};

const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576; // 1 MB
const MAX_BACKOFF_MS: u64 = 60_000;

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub callback: CallbackConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the lock server listens on
    pub listen: String,
    /// Refuse `release` from clients that do not hold the lock
    pub verify_release_owner: bool,
    /// Revoke from a queued head as soon as it claims a still-contended lock
    pub handoff: HandoffPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Delivery attempts per revoke/retry, at least one
    pub attempts: u32,
    /// Pause between attempts, in milliseconds
    pub backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
            verify_release_owner: true,
            handoff: HandoffPolicy::Revoke,
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 50,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PARTIAL CONFIG STRUCTURES (explicit-key merge semantics)
// ═══════════════════════════════════════════════════════════════════════════

/// Partial configuration with `Option<T>` fields.
///
/// Only keys present in a file are `Some`, so a file that sets one key does
/// not reset the others to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(default)]
    pub server: Option<PartialServerConfig>,
    #[serde(default)]
    pub callback: Option<PartialCallbackConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialServerConfig {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub verify_release_owner: Option<bool>,
    #[serde(default)]
    pub handoff: Option<HandoffPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialCallbackConfig {
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

impl ServerConfig {
    fn merge_partial(&mut self, partial: PartialServerConfig) {
        if let Some(listen) = partial.listen {
            self.listen = listen;
        }
        if let Some(verify) = partial.verify_release_owner {
            self.verify_release_owner = verify;
        }
        if let Some(handoff) = partial.handoff {
            self.handoff = handoff;
        }
    }
}

impl CallbackConfig {
    fn merge_partial(&mut self, partial: PartialCallbackConfig) {
        if let Some(attempts) = partial.attempts {
            self.attempts = attempts;
        }
        if let Some(backoff_ms) = partial.backoff_ms {
            self.backoff_ms = backoff_ms;
        }
    }
}

impl Config {
    /// Overlay explicitly-set keys from `partial`.
    pub fn merge_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server.merge_partial(server);
        }
        if let Some(callback) = partial.callback {
            self.callback.merge_partial(callback);
        }
    }

    /// Apply `CACHELOCK_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    pub fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("CACHELOCK_LISTEN") {
            self.server.listen = value;
        }

        if let Ok(value) = std::env::var("CACHELOCK_VERIFY_RELEASE_OWNER") {
            self.server.verify_release_owner = value.parse().map_err(|e| {
                Error::InvalidConfig(format!("Invalid CACHELOCK_VERIFY_RELEASE_OWNER value: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("CACHELOCK_CALLBACK_ATTEMPTS") {
            self.callback.attempts = value.parse().map_err(|e| {
                Error::InvalidConfig(format!("Invalid CACHELOCK_CALLBACK_ATTEMPTS value: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("CACHELOCK_CALLBACK_BACKOFF_MS") {
            self.callback.backoff_ms = value.parse().map_err(|e| {
                Error::InvalidConfig(format!("Invalid CACHELOCK_CALLBACK_BACKOFF_MS value: {e}"))
            })?;
        }

        Ok(())
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.callback.attempts == 0 {
            return Err(Error::InvalidConfig(
                "callback.attempts must be at least 1".to_string(),
            ));
        }

        if self.callback.backoff_ms > MAX_BACKOFF_MS {
            return Err(Error::InvalidConfig(format!(
                "callback.backoff_ms must be at most {MAX_BACKOFF_MS}, got {}",
                self.callback.backoff_ms
            )));
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            Error::InvalidConfig(format!(
                "Invalid server.listen address '{}': {e}",
                self.server.listen
            ))
        })
    }

    #[must_use]
    pub const fn callback_policy(&self) -> CallbackPolicy {
        CallbackPolicy {
            attempts: self.callback.attempts,
            backoff: Duration::from_millis(self.callback.backoff_ms),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> Policy {
        Policy {
            release: if self.server.verify_release_owner {
                ReleasePolicy::VerifyOwner
            } else {
                ReleasePolicy::Trusting
            },
            handoff: self.server.handoff,
        }
    }
}

/// Load configuration from all sources
///
/// `explicit` must exist if given; the global file is skipped when missing.
///
/// # Errors
///
/// Returns error if:
/// - A config file is malformed TOML or has unknown keys
/// - An explicit config file cannot be read
/// - Config values fail validation
pub async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    // 1. Start with built-in defaults
    let mut config = Config::default();

    // 2. Load global config if exists (try-load pattern eliminates TOCTTOU race)
    if let Some(global_path) = global_config_path() {
        match load_partial_toml_file(&global_path).await {
            Ok(global) => config.merge_partial(global),
            Err(Error::IoError(_)) => {
                // Config file doesn't exist - skip silently
            }
            Err(e) => return Err(e),
        }
    }

    // 3. Explicit file must be readable
    if let Some(path) = explicit {
        config.merge_partial(load_partial_toml_file(path).await?);
    }

    // 4. Apply environment variable overrides
    config.apply_env_vars()?;

    // 5. Validate
    config.validate()?;

    Ok(config)
}

/// Get path to global config file
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cachelock")
        .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
}

/// Load a TOML file into a `PartialConfig`
///
/// # Errors
///
/// Returns error if:
/// - File cannot be read or is larger than 1 MB
/// - TOML is malformed
/// - Unknown configuration keys are present (typos will be rejected)
pub async fn load_partial_toml_file(path: &Path) -> Result<PartialConfig> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        Error::IoError(format!(
            "Failed to read config file metadata {}: {e}",
            path.display()
        ))
    })?;

    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(Error::InvalidConfig(format!(
            "Config file {} exceeds maximum size of {MAX_CONFIG_FILE_SIZE} bytes",
            path.display()
        )));
    }

    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::IoError(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    toml::from_str(&content)
        .map_err(|e| Error::ParseError(format!("Failed to parse config: {}: {e}", path.display())))
}
