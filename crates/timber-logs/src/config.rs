//! Shipper configuration.
//!
//! Settings can come from a TOML file; command-line flags are layered on top
//! by the binary. Every field has a default so an empty file is valid.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LogError, Result};
use crate::forwarder::ForwarderConfig;

/// Where raw log lines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Standard input.
    #[default]
    Stdin,
    /// `journalctl` following a syslog identifier.
    Journald,
}

impl SourceType {
    /// Returns the configuration spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Journald => "journald",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdin" => Ok(Self::Stdin),
            "journald" => Ok(Self::Journald),
            other => Err(LogError::Config(format!(
                "unknown logger source type '{other}', expected stdin or journald"
            ))),
        }
    }
}

/// Top-level shipper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShipperConfig {
    /// Line source.
    pub source_type: SourceType,
    /// Syslog identifier followed in journald mode.
    pub journald_tag: String,
    /// Collector `host:port`; no forwarding when unset.
    pub tcp_out_url: Option<String>,
    /// Consecutive failed writes before the forwarder backs off.
    pub retry_limit: u32,
    /// Forwarding queue capacity.
    pub queue_capacity: usize,
    /// Per-write deadline in seconds.
    pub write_timeout_secs: u64,
    /// Backoff after the retry limit in seconds.
    pub backoff_secs: u64,
    /// Idle window before a trailing record is flushed, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        let forwarder = ForwarderConfig::default();
        Self {
            source_type: SourceType::Stdin,
            journald_tag: "postgres".to_string(),
            tcp_out_url: None,
            retry_limit: forwarder.retry_limit,
            queue_capacity: forwarder.queue_capacity,
            write_timeout_secs: forwarder.write_timeout.as_secs(),
            backoff_secs: forwarder.backoff.as_secs(),
            idle_timeout_ms: 1000,
        }
    }
}

impl ShipperConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LogError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| LogError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.source_type == SourceType::Journald && self.journald_tag.trim().is_empty() {
            return Err(LogError::Config(
                "journald_tag cannot be empty in journald mode".to_string(),
            ));
        }

        if let Some(url) = &self.tcp_out_url {
            validate_endpoint(url)?;
        }

        if self.queue_capacity == 0 {
            return Err(LogError::Config(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.write_timeout_secs == 0 {
            return Err(LogError::Config(
                "write_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.idle_timeout_ms == 0 {
            return Err(LogError::Config(
                "idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Idle window for the reassembler.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Forwarder tunables derived from this configuration.
    #[must_use]
    pub fn forwarder(&self) -> ForwarderConfig {
        ForwarderConfig {
            queue_capacity: self.queue_capacity,
            retry_limit: self.retry_limit,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            backoff: Duration::from_secs(self.backoff_secs),
            ..ForwarderConfig::default()
        }
    }
}

/// Checks that `url` looks like `host:port`.
fn validate_endpoint(url: &str) -> Result<()> {
    let Some((host, port)) = url.rsplit_once(':') else {
        return Err(LogError::Config(format!(
            "tcp_out_url '{url}' must be of the form host:port"
        )));
    };

    if host.is_empty() {
        return Err(LogError::Config(format!(
            "tcp_out_url '{url}' is missing a host"
        )));
    }

    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(LogError::Config(format!(
            "tcp_out_url '{url}' has an invalid port"
        ))),
    }
}
