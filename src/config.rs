//! Recognized configuration options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::PeerTimeoutPolicy;
use crate::core::identity::{InvalidId, PeerId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidEndpoint(#[from] InvalidId),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    #[default]
    File,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Endpoint of the discovery server (server mode).
    pub server: Option<String>,
    /// Directory of the peers file (file mode).
    pub directory: Option<PathBuf>,
    /// Wipe stale discovery state at startup.
    pub clear: bool,
    /// File-lock wait ceiling.
    pub timeout_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::File,
            server: None,
            directory: None,
            clear: false,
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    /// Tracing filter directive, e.g. "info" or "swarmtable=debug".
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: None,
        }
    }
}

/// Stress-test parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GrindConfig {
    pub processes: usize,
    pub cycles: usize,
}

impl Default for GrindConfig {
    fn default() -> Self {
        Self {
            processes: 2,
            cycles: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    /// Override LAN auto-detection of the announced address.
    pub announce_ip: Option<String>,
    /// Consensus chunks instead of legacy chunks.
    pub use_raft: bool,
    /// Legacy-chunk reaction to an unreachable swarm peer.
    pub legacy_peer_timeout: PeerTimeoutPolicy,
    /// Inject artificial RTT (tests).
    pub simulated_lag_ms: u64,
    /// Emit a stack trace on every commit.
    pub blame_commit: bool,
    pub grind: GrindConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            announce_ip: None,
            use_raft: false,
            legacy_peer_timeout: PeerTimeoutPolicy::default(),
            simulated_lag_ms: 0,
            blame_commit: false,
            grind: GrindConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The endpoint this peer announces, `announce_ip` overriding the
    /// loopback default.
    pub fn local_endpoint(&self, port: u16) -> Result<PeerId, ConfigError> {
        let host = self.announce_ip.as_deref().unwrap_or("127.0.0.1");
        Ok(PeerId::parse(format!("{host}:{port}"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_legacy_file_discovery() {
        let config = Config::default();
        assert!(!config.use_raft);
        assert_eq!(config.discovery.mode, DiscoveryMode::File);
        assert_eq!(config.legacy_peer_timeout, PeerTimeoutPolicy::Abort);
    }

    #[test]
    fn parses_flags_from_json() {
        let raw = r#"{
            "use_raft": true,
            "announce_ip": "10.1.2.3",
            "simulated_lag_ms": 5,
            "legacy_peer_timeout": "drop_peer",
            "grind": {"processes": 4, "cycles": 100}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert!(config.use_raft);
        assert_eq!(config.simulated_lag_ms, 5);
        assert_eq!(config.legacy_peer_timeout, PeerTimeoutPolicy::DropPeer);
        assert_eq!(config.grind.processes, 4);
        assert_eq!(
            config.local_endpoint(4000).unwrap().as_str(),
            "10.1.2.3:4000"
        );
    }
}
