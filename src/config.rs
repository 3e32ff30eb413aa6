//! Relay configuration management
//!
//! All policy constants live here so deployments (and tests) can tune them.
//! The two environment variables that matter in production are
//! `OPENCODE_URL` and `DOCKER_HOST`; everything else has defaults matching
//! the container topology.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Engine (OpenCode) connection settings
    pub engine: EngineConfig,

    /// Docker socket-proxy settings for gateway management
    pub docker: DockerConfig,

    /// Filesystem locations written by the materializers
    pub paths: MaterializePaths,

    /// Debounce windows, watchdog cadence, and retry policies
    pub timing: TimingConfig,
}

impl RelayConfig {
    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OPENCODE_URL") {
            if !url.is_empty() {
                config.engine.url = url;
            }
        }
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if !host.is_empty() {
                config.docker.host = host;
            }
        }
        config
    }
}

/// Engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the engine HTTP API
    pub url: String,

    /// Working directory passed when creating a session
    pub session_directory: String,

    /// Agent profile passed when creating a session
    pub session_agent: String,

    /// Timeout for engine POSTs (prompt, session create, permission reply)
    pub post_timeout_ms: u64,

    /// Timeout for engine GETs (session liveness probe)
    pub get_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: "http://opencode:3000".to_string(),
            session_directory: "/workspace".to_string(),
            session_agent: "poco".to_string(),
            post_timeout_ms: 10_000,
            get_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn post_timeout(&self) -> Duration {
        Duration::from_millis(self.post_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }
}

/// Docker socket-proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker API endpoint, `tcp://host:port`
    pub host: String,

    /// Name of the MCP gateway container to restart on catalog changes
    pub gateway_container: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: "tcp://docker-socket-proxy:2375".to_string(),
            gateway_container: "mcp-gateway".to_string(),
        }
    }
}

/// Filesystem locations the materializers write to.
///
/// Each is a mounted volume in production; tests point them at a tempdir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializePaths {
    /// Directory holding `authorized_keys` for the sandbox sshd
    pub ssh_keys_dir: PathBuf,

    /// Full path of the rendered MCP gateway catalog
    pub mcp_config_path: PathBuf,

    /// Sandbox workspace root (`.opencode/` subtrees live under it)
    pub workspace_dir: PathBuf,

    /// Store for non-initial agent bundles
    pub agent_store_dir: PathBuf,
}

impl Default for MaterializePaths {
    fn default() -> Self {
        Self {
            ssh_keys_dir: PathBuf::from("/ssh_keys"),
            mcp_config_path: PathBuf::from("/mcp_config/docker-mcp.yaml"),
            workspace_dir: PathBuf::from("/workspace"),
            agent_store_dir: PathBuf::from("/workspace/sandbox/caoc/agent_store"),
        }
    }
}

/// Debounce windows, watchdog cadence, and retry policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Debounce before a buffered snapshot is broadcast to UI clients
    pub broadcast_debounce_ms: u64,

    /// Debounce before a buffered snapshot is written to the store
    pub store_debounce_ms: u64,

    /// How long completed-message tracking state is kept for late arrivals
    pub completed_gc_ms: u64,

    /// Watchdog tick interval
    pub watchdog_interval_ms: u64,

    /// Heartbeat silence after which the engine is considered offline
    pub heartbeat_timeout_ms: u64,

    /// Keepalive interval on outbound UI streams
    pub keepalive_secs: u64,

    /// Delay before reconnecting a dropped engine event stream
    pub reconnect_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            broadcast_debounce_ms: 20,
            store_debounce_ms: 1_000,
            completed_gc_ms: 30_000,
            watchdog_interval_ms: 20_000,
            heartbeat_timeout_ms: 45_000,
            keepalive_secs: 15,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl TimingConfig {
    pub fn broadcast_debounce(&self) -> Duration {
        Duration::from_millis(self.broadcast_debounce_ms)
    }

    pub fn store_debounce(&self) -> Duration {
        Duration::from_millis(self.store_debounce_ms)
    }

    pub fn completed_gc(&self) -> Duration {
        Duration::from_millis(self.completed_gc_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_container_topology() {
        let config = RelayConfig::default();
        assert_eq!(config.engine.url, "http://opencode:3000");
        assert_eq!(config.docker.host, "tcp://docker-socket-proxy:2375");
        assert_eq!(config.timing.broadcast_debounce_ms, 20);
        assert_eq!(config.timing.store_debounce_ms, 1_000);
        assert_eq!(config.timing.heartbeat_timeout_ms, 45_000);
        assert_eq!(
            config.paths.mcp_config_path,
            PathBuf::from("/mcp_config/docker-mcp.yaml")
        );
    }

    #[test]
    fn test_timing_conversions() {
        let timing = TimingConfig::default();
        assert_eq!(timing.broadcast_debounce(), Duration::from_millis(20));
        assert_eq!(timing.keepalive(), Duration::from_secs(15));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = RelayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.engine.url, config.engine.url);
        assert_eq!(parsed.timing.completed_gc_ms, config.timing.completed_gc_ms);
    }
}
