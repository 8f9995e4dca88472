//! Master configuration.
//!
//! [`MasterConfig`] carries everything the master needs that can be written
//! down in a file: the gateway address, connection mode, timeouts and retry
//! budget. Runtime collaborators (tokio handle, diagnostic sink, codec) are
//! supplied through [`crate::master::MasterBuilder`] instead.
//!
//! # Sources
//!
//! Resolution order used by [`MasterConfig::from_env`]:
//! 1. Built-in defaults (port 502, 500ms timeout, 2 retries, persistent)
//! 2. `TCPRTU_HOST`, `TCPRTU_PORT`, `TCPRTU_KEEP_ALIVE`, `TCPRTU_TIMEOUT_MS`,
//!    `TCPRTU_RETRIES` environment variables
//!
//! A JSON document can be loaded with [`MasterConfig::from_json`]; missing
//! fields take their defaults.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffPolicy;

/// Default TCP port of a gateway.
pub const DEFAULT_PORT: u16 = 502;

/// Default connect/read timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Default number of connection retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 2;

/// Errors found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("gateway host is empty")]
    EmptyHost,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("retry pause start ({start}ms) exceeds retry pause max ({max}ms)")]
    BackoffOrder { start: u64, max: u64 },

    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Network address of the serial-to-TCP gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpParameters {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for IpParameters {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl IpParameters {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve the host into candidate socket addresses.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", self),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for IpParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for [`crate::TcpRtuMaster`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Gateway address.
    pub target: IpParameters,
    /// Persistent connection (`true`) or one connection per request (`false`).
    pub keep_alive: bool,
    /// Connect timeout and per-exchange read timeout.
    pub timeout_ms: u64,
    /// Connection retries after the first attempt.
    pub retries: u32,
    /// Delay before the first connection retry.
    pub retry_pause_start_ms: u64,
    /// Cap on the delay between connection retries.
    pub retry_pause_max_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            target: IpParameters::default(),
            keep_alive: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            retry_pause_start_ms: crate::backoff::RETRY_PAUSE_START.as_millis() as u64,
            retry_pause_max_ms: crate::backoff::RETRY_PAUSE_MAX.as_millis() as u64,
        }
    }
}

impl MasterConfig {
    /// Defaults pointed at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            target: IpParameters::new(host, port),
            ..Self::default()
        }
    }

    /// Set the connection mode.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the connect/read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the connection retry budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Connect/read timeout as a `Duration`.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff policy for connection retries.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.retry_pause_start_ms),
            Duration::from_millis(self.retry_pause_max_ms),
            self.retries,
        )
    }

    /// Check the configuration for values the master cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.retry_pause_start_ms > self.retry_pause_max_ms {
            return Err(ConfigError::BackoffOrder {
                start: self.retry_pause_start_ms,
                max: self.retry_pause_max_ms,
            });
        }
        Ok(())
    }

    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: MasterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TCPRTU_*` environment variables onto `self`.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.overlay(|var| std::env::var(var).ok())
    }

    fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(host) = lookup("TCPRTU_HOST") {
            self.target.host = host;
        }
        if let Some(port) = lookup("TCPRTU_PORT") {
            self.target.port = parse_var("TCPRTU_PORT", &port)?;
        }
        if let Some(keep_alive) = lookup("TCPRTU_KEEP_ALIVE") {
            self.keep_alive = match keep_alive.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "TCPRTU_KEEP_ALIVE",
                        value: keep_alive,
                    })
                }
            };
        }
        if let Some(timeout) = lookup("TCPRTU_TIMEOUT_MS") {
            self.timeout_ms = parse_var("TCPRTU_TIMEOUT_MS", &timeout)?;
        }
        if let Some(retries) = lookup("TCPRTU_RETRIES") {
            self.retries = parse_var("TCPRTU_RETRIES", &retries)?;
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}
