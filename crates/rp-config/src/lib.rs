// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and validation for the driver portal.
//!
//! Settings are loaded from a TOML file, validated into hard errors and
//! advisory [`ConfigWarning`]s, and handed to the session explicitly.
//! Nothing here is ambient: there is no global config, no environment
//! sniffing at call sites, no persisted browser-style key/value bag.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use rp_retry::RetryPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    Parse {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    Validation {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Retry base delay of zero: every retry fires immediately.
    ZeroRetryDelay,
    /// The gateway timeout is unusually large.
    LargeTimeout {
        /// Configured timeout in milliseconds.
        ms: u64,
    },
    /// Retries are disabled entirely.
    RetriesDisabled,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroRetryDelay => {
                write!(f, "retry base_delay_ms is 0; retries will hammer the store")
            }
            ConfigWarning::LargeTimeout { ms } => {
                write!(f, "gateway request_timeout_ms is unusually large ({ms}ms)")
            }
            ConfigWarning::RetriesDisabled => {
                write!(f, "retry max_attempts is 0; transient failures surface immediately")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level portal configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PortalConfig {
    /// Remote store connection settings.
    pub gateway: GatewaySettings,
    /// Fetch retry settings.
    pub retry: RetrySettings,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

/// Remote store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewaySettings {
    /// Per-request deadline in milliseconds.
    pub request_timeout_ms: u64,

    /// Application name sent with every store request.
    pub application_name: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            application_name: "ridepilot-portal".into(),
        }
    }
}

/// Fetch retry settings; converted to an [`RetryPolicy`] for the
/// session's controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetrySettings {
    /// Base backoff delay in milliseconds (the n-th retry waits n times
    /// this long).
    pub base_delay_ms: u64,

    /// Maximum automatic retries per failure streak.
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 3,
        }
    }
}

impl RetrySettings {
    /// The retry controller's policy equivalent of these settings.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timeouts above this generate a [`ConfigWarning::LargeTimeout`].
const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 120_000;

/// Hard cap on configured retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

/// Load a [`PortalConfig`] from an optional TOML file path.
///
/// `None` yields the defaults.
pub fn load(path: Option<&Path>) -> Result<PortalConfig, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            from_toml_str(&content)
        }
        None => Ok(PortalConfig::default()),
    }
}

/// Parse a TOML string into a [`PortalConfig`].
pub fn from_toml_str(content: &str) -> Result<PortalConfig, ConfigError> {
    toml::from_str::<PortalConfig>(content).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero timeout, out-of-range attempt counts, empty
/// application name) come back as [`ConfigError::Validation`]; soft
/// issues come back as warnings.
pub fn validate(config: &PortalConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.gateway.request_timeout_ms == 0 {
        errors.push("gateway.request_timeout_ms must be positive".into());
    } else if config.gateway.request_timeout_ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout {
            ms: config.gateway.request_timeout_ms,
        });
    }

    if config.gateway.application_name.trim().is_empty() {
        errors.push("gateway.application_name must not be empty".into());
    }

    if config.retry.max_attempts > MAX_RETRY_ATTEMPTS {
        errors.push(format!(
            "retry.max_attempts must be at most {MAX_RETRY_ATTEMPTS}, got {}",
            config.retry.max_attempts
        ));
    } else if config.retry.max_attempts == 0 {
        warnings.push(ConfigWarning::RetriesDisabled);
    }

    if config.retry.base_delay_ms == 0 && config.retry.max_attempts > 0 {
        warnings.push(ConfigWarning::ZeroRetryDelay);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::Validation { reasons: errors })
    }
}
