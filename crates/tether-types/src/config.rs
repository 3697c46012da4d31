//! Transport configuration, loaded from `~/.tether/config.toml` with defaults.
//!
//! Every field has a default, so a partial file (or none at all) yields a
//! usable configuration. [`RpcConfig::validate`] rejects values the transport
//! cannot run with.

use crate::error::{RpcError, RpcResult};
use crate::message::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Frame header size; a frame can never be smaller than this.
const MIN_FRAME_SIZE: usize = 16;

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Client side: emit a ping after this many seconds without outbound traffic.
    pub write_idle_secs: u64,
    /// Server side: flag the peer after this many seconds without inbound traffic.
    pub read_idle_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_idle_secs: 3,
            read_idle_secs: 10,
        }
    }
}

/// Reconnect watchdog policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base delay; attempt `n` waits `base * 2^n`.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
    /// Consecutive failures after which the endpoint is evicted.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 600_000,
            max_attempts: 12,
        }
    }
}

/// Top-level transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Discovery service host.
    pub discovery_host: String,
    /// Discovery service port.
    pub discovery_port: u16,
    /// Discovery group; only services in the same group see each other.
    pub discovery_group: String,
    /// Address this process advertises when publishing services.
    pub provider_host: String,
    /// Local listening port for the transport server.
    pub provider_port: u16,
    /// Default serializer name for outgoing requests.
    pub serializer: String,
    /// Default compressor name for outgoing requests.
    pub compressor: String,
    /// Largest accepted frame, header included.
    pub max_frame_size: usize,
    /// Bound on a blocking first-time connect.
    pub connect_timeout_ms: u64,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect watchdog policy.
    pub reconnect: ReconnectConfig,
    /// Concurrent dispatch limit on the server; 0 means twice the CPU count.
    pub worker_threads: usize,
    /// Close a server connection after each response is written.
    pub close_after_response: bool,
    /// Service key → `host:port` list for the in-memory discovery backend.
    pub static_endpoints: BTreeMap<String, Vec<String>>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            discovery_host: "localhost".to_string(),
            discovery_port: 8848,
            discovery_group: crate::message::DEFAULT_GROUP.to_string(),
            provider_host: "127.0.0.1".to_string(),
            provider_port: 13567,
            serializer: "msgpack".to_string(),
            compressor: "gzip".to_string(),
            max_frame_size: 8 * 1024 * 1024,
            connect_timeout_ms: 5_000,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            worker_threads: 0,
            close_after_response: false,
            static_endpoints: BTreeMap::new(),
        }
    }
}

impl RpcConfig {
    /// Check the values the transport depends on.
    pub fn validate(&self) -> RpcResult<()> {
        if self.discovery_group.trim().is_empty() {
            return Err(RpcError::Config("discovery_group must not be empty".into()));
        }
        if self.discovery_port == 0 {
            return Err(RpcError::Config("discovery_port must not be 0".into()));
        }
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(RpcError::Config(format!(
                "max_frame_size must be at least {MIN_FRAME_SIZE} bytes"
            )));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(RpcError::Config(
                "max_frame_size must fit the 4-byte length field".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(RpcError::Config("reconnect.max_attempts must be > 0".into()));
        }
        for (key, addrs) in &self.static_endpoints {
            for addr in addrs {
                addr.parse::<Endpoint>()
                    .map_err(|e| RpcError::Config(format!("static_endpoints.{key}: {e}")))?;
            }
        }
        Ok(())
    }

    /// Endpoint advertised for services published by this process.
    pub fn provider_endpoint(&self) -> Endpoint {
        Endpoint::new(self.provider_host.clone(), self.provider_port)
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Effective dispatch concurrency.
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8)
    }
}

/// Default config location: `~/.tether/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
        .join("config.toml")
}

/// Load configuration from a TOML file, falling back to defaults.
///
/// A missing, unreadable or malformed file is logged and replaced by
/// [`RpcConfig::default`].
pub fn load_config(path: Option<&Path>) -> RpcConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RpcConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<RpcConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                RpcConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            RpcConfig::default()
        }
    }
}
