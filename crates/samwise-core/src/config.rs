// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon configuration: the enumerated option table, decoded from TOML via
//! `serde`, with a `ConfigBuilder` for programmatic construction (tests,
//! embedders) matching the teacher crates' config pattern.

pub mod units;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("config.backends must name at least one backend")]
    NoBackends,

    #[error("backend name {0:?} is used more than once")]
    DuplicateBackendName(String),
}

/// Which BBW implementation a backend entry uses. Only `Rmq` exists today;
/// kept as an enum so adding a second transport is additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Rmq,
}

/// One configured downstream broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub heartbeat_s: u16,
    /// Reconnect attempts; `-1` means unbounded.
    pub tries: i32,
    #[serde(deserialize_with = "units::deserialize_duration_ms")]
    pub interval_ms: u64,
    /// Bound on the backend's inbound command queue; once full, newly
    /// dispatched publishes are shed rather than blocking the dispatcher
    /// reactor (spec §5 backpressure SHOULD) — BUF's retry timer recovers
    /// them.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

/// Buffer (BUF/PKV) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub home: PathBuf,
    pub file: PathBuf,
    /// Initial `tries` attached to every saved message.
    pub retry_count: i32,
    /// Resend timer period, in milliseconds.
    #[serde(deserialize_with = "units::deserialize_duration_ms")]
    pub retry_interval_ms: u64,
    /// Minimum record age, in milliseconds, before it's resend-eligible.
    #[serde(deserialize_with = "units::deserialize_duration_ms")]
    pub retry_threshold_ms: u64,
    /// Ceiling on the PKV's memory-mapped data file.
    #[serde(
        default = "default_map_size_bytes",
        deserialize_with = "units::deserialize_size_bytes"
    )]
    pub map_size_bytes: u64,
}

fn default_map_size_bytes() -> u64 {
    1 << 30
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("./samwise-data"),
            file: PathBuf::from("buffer"),
            retry_count: 5,
            retry_interval_ms: 5_000,
            retry_threshold_ms: 10_000,
            map_size_bytes: default_map_size_bytes(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: String,
    pub backend_type: BackendType,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Admin/observability TCP surface (§6.5), disabled if absent.
    #[serde(default)]
    pub admin_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:9081".to_string(),
            backend_type: BackendType::Rmq,
            backends: Vec::new(),
            buffer: BufferConfig::default(),
            admin_endpoint: Some("127.0.0.1:9082".to_string()),
        }
    }
}

impl Config {
    /// Read and parse a TOML config file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what `serde` enforces: at least one
    /// backend, and unique backend names (DISP indexes backends by name for
    /// RPC targeting).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackendName(backend.name.clone()));
            }
        }
        Ok(())
    }

    /// Start a builder for programmatic construction (tests, embedders).
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Fluent builder for [`Config`], mirroring the teacher crates' config
/// builders.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    endpoint: Option<String>,
    backend_type: Option<BackendType>,
    backends: Vec<BackendConfig>,
    buffer: Option<BufferConfig>,
    admin_endpoint: Option<Option<String>>,
}

impl ConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn backend_type(mut self, backend_type: BackendType) -> Self {
        self.backend_type = Some(backend_type);
        self
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn admin_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.admin_endpoint = Some(endpoint);
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            endpoint: self.endpoint.unwrap_or(defaults.endpoint),
            backend_type: self.backend_type.unwrap_or(defaults.backend_type),
            backends: if self.backends.is_empty() {
                defaults.backends
            } else {
                self.backends
            },
            buffer: self.buffer.unwrap_or(defaults.buffer),
            admin_endpoint: self.admin_endpoint.unwrap_or(defaults.admin_endpoint),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            pass: "guest".to_string(),
            heartbeat_s: 30,
            tries: -1,
            interval_ms: 5_000,
            queue_capacity: 1024,
        }
    }

    #[test]
    fn builder_rejects_empty_backend_list() {
        let err = Config::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::NoBackends));
    }

    #[test]
    fn builder_rejects_duplicate_backend_names() {
        let err = Config::builder()
            .backend(backend("b1"))
            .backend(backend("b1"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateBackendName(name) if name == "b1"));
    }

    #[test]
    fn builder_produces_a_valid_config() {
        let config = Config::builder().backend(backend("b1")).build().unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.endpoint, "127.0.0.1:9081");
    }

    #[test]
    fn toml_roundtrips_through_serde() {
        let toml_text = r#"
            endpoint = "0.0.0.0:9081"
            backend_type = "rmq"

            [[backends]]
            name = "primary"
            host = "broker.internal"
            port = 5672
            user = "samwise"
            pass = "secret"
            heartbeat_s = 30
            tries = -1
            interval_ms = 5000

            [buffer]
            home = "/var/lib/samwise"
            file = "buffer"
            retry_count = 5
            retry_interval_ms = 5000
            retry_threshold_ms = 10000
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.backends[0].name, "primary");
        assert_eq!(config.backends[0].queue_capacity, 1024);
        assert_eq!(config.buffer.map_size_bytes, 1 << 30);
    }

    #[test]
    fn buffer_map_size_accepts_a_size_suffixed_string() {
        let toml_text = r#"
            endpoint = "0.0.0.0:9081"
            backend_type = "rmq"

            [[backends]]
            name = "primary"
            host = "broker.internal"
            port = 5672
            user = "samwise"
            pass = "secret"
            heartbeat_s = 30
            tries = -1
            interval_ms = 5000

            [buffer]
            home = "/var/lib/samwise"
            file = "buffer"
            retry_count = 5
            retry_interval_ms = 5000
            retry_threshold_ms = 10000
            map_size_bytes = "2g"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.buffer.map_size_bytes, 2 << 30);
    }

    #[test]
    fn duration_keys_accept_suffixed_strings() {
        let toml_text = r#"
            endpoint = "0.0.0.0:9081"
            backend_type = "rmq"

            [[backends]]
            name = "primary"
            host = "broker.internal"
            port = 5672
            user = "samwise"
            pass = "secret"
            heartbeat_s = 30
            tries = -1
            interval_ms = "5s"

            [buffer]
            home = "/var/lib/samwise"
            file = "buffer"
            retry_count = 5
            retry_interval_ms = "5s"
            retry_threshold_ms = "10s"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.backends[0].interval_ms, 5_000);
        assert_eq!(config.buffer.retry_interval_ms, 5_000);
        assert_eq!(config.buffer.retry_threshold_ms, 10_000);
    }
}
