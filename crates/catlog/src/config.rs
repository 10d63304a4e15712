// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_LEVEL, DEFAULT_PORT, DEFAULT_RETRY_INTERVAL, DEFAULT_SEND_TIMEOUT,
};
use crate::errors::RelayError;

/// Address of the remote collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// A port of 0 selects [`DEFAULT_PORT`].
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: if port == 0 { DEFAULT_PORT } else { port },
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Values the collaborator reads and updates at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub endpoint: Endpoint,
    /// Verbosity level requested from the host. Not interpreted by the relay.
    pub level: u16,
}

/// Configuration for the capture buffer and streaming worker
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Collector the worker connects to
    pub endpoint: Endpoint,
    /// Verbosity level handed back through [`Settings`]
    pub level: u16,
    /// Ring buffer size in bytes, one of which is never used
    pub buffer_capacity: usize,
    /// Largest chunk drained from the buffer per send
    pub chunk_size: usize,
    /// Pause between connection attempts
    pub retry_interval: Duration,
    /// Close the connection after this long without new data
    pub idle_timeout: Duration,
    /// Bound on each connect and write
    pub send_timeout: Duration,
    /// Delay before the worker starts draining
    pub startup_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            level: DEFAULT_LEVEL,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            startup_delay: Duration::ZERO,
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, RelayError> {
        let defaults = Self::default();

        let host = env::var("CATLOG_HOST")
            .map(|val| val.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = parse_var("CATLOG_PORT")?.unwrap_or(DEFAULT_PORT);
        let level = parse_var("CATLOG_LEVEL")?.unwrap_or(defaults.level);
        let buffer_capacity =
            parse_var("CATLOG_BUFFER_SIZE")?.unwrap_or(defaults.buffer_capacity);
        let startup_delay = parse_var("CATLOG_STARTUP_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.startup_delay);

        let config = Self {
            endpoint: Endpoint::new(host, port),
            level,
            buffer_capacity,
            startup_delay,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "collector host cannot be empty".to_string(),
            ));
        }

        if self.buffer_capacity < 2 {
            return Err(RelayError::InvalidConfig(format!(
                "buffer capacity must be greater than 1, got {}",
                self.buffer_capacity
            )));
        }

        if self.chunk_size == 0 {
            return Err(RelayError::InvalidConfig(
                "chunk size must be greater than 0".to_string(),
            ));
        }

        if self.retry_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "retry interval must be greater than 0".to_string(),
            ));
        }

        if self.idle_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "idle timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            endpoint: self.endpoint.clone(),
            level: self.level,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, RelayError> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RelayError::InvalidConfig(format!("{name} has an invalid value '{val}'"))),
        Err(_) => Ok(None),
    }
}
