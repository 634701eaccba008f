//! # Configuration
//!
//! Typed configuration for a node. Values come from a JSON config file
//! (path chosen by `PAN_CONFIG`, default `config.json5`) with env-var
//! overrides for the bind addresses. Every field has a default, so an
//! absent file yields a runnable node.
//!
//! JSON5 niceties (comments, trailing commas) are handled by the external
//! config tooling that produces the file; this loader reads the plain
//! JSON subset.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::spam::SpamConfig;

/// Environment variable selecting the config file path.
pub const CONFIG_ENV: &str = "PAN_CONFIG";

/// Default config file path.
pub const DEFAULT_CONFIG_FILE: &str = "config.json5";

/// Override for the agent bind address.
pub const AGENT_BIND_ENV: &str = "PAN_AGENT_BIND";

/// Override for the peer bind address.
pub const PEER_BIND_ENV: &str = "PAN_PEER_BIND";

// ============================================================================
// Sections
// ============================================================================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSection,
    pub agents: AgentSection,
    pub peers: PeerSection,
    pub spam: SpamConfig,
    pub auth: AuthSection,
    pub trust: TrustSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Stable textual identifier to derive the node id from, when no
    /// persisted id exists yet.
    pub node_identifier: Option<String>,
    /// Node id persist file. `None` disables persistence.
    pub persist_node_id_file: Option<PathBuf>,
    /// Treat a corrupt persist file as fatal instead of regenerating.
    pub crash_on_corrupt: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_identifier: None,
            persist_node_id_file: Some(PathBuf::from(crate::identity::DEFAULT_PERSIST_FILE)),
            crash_on_corrupt: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub bind: SocketAddr,
    pub connect_timeout_ms: u64,
    pub resume_grace_ms: u64,
    pub max_errors_before_disconnect: u32,
    pub error_reset_window_ms: u64,
    pub allow_untrusted_agents: bool,
    pub trusted_issuers_file: PathBuf,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5295".parse().expect("default agent bind"),
            connect_timeout_ms: 3_000,
            resume_grace_ms: 120_000,
            max_errors_before_disconnect: 10,
            error_reset_window_ms: 300_000,
            allow_untrusted_agents: false,
            trusted_issuers_file: PathBuf::from("trusted_agents.json"),
        }
    }
}

impl AgentSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn resume_grace(&self) -> Duration {
        Duration::from_millis(self.resume_grace_ms)
    }

    pub fn error_reset_window(&self) -> Duration {
        Duration::from_millis(self.error_reset_window_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    pub bind: SocketAddr,
    pub handshake_timeout_ms: u64,
    pub trusted_issuers_file: PathBuf,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5874".parse().expect("default peer bind"),
            handshake_timeout_ms: 5_000,
            trusted_issuers_file: PathBuf::from("trusted_peers.json"),
        }
    }
}

impl PeerSection {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub order: Vec<String>,
    pub timeout_ms: u64,
    pub max_tries: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            order: vec!["local".to_string()],
            timeout_ms: 3_000,
            max_tries: 3,
        }
    }
}

impl AuthSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSection {
    pub cache_ttl_ms: u64,
}

impl Default for TrustSection {
    fn default() -> Self {
        Self { cache_ttl_ms: 30_000 }
    }
}

impl TrustSection {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load the config from the `PAN_CONFIG` path (default `config.json5`),
/// then apply env-var overrides. A missing file yields the defaults; a
/// file that exists but does not parse is an error.
pub fn load() -> anyhow::Result<Config> {
    let path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = load_from(&path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

/// `PAN_AGENT_BIND` / `PAN_PEER_BIND` override the configured binds.
pub fn apply_env_overrides(config: &mut Config) {
    for (var, slot) in [
        (AGENT_BIND_ENV, &mut config.agents.bind),
        (PEER_BIND_ENV, &mut config.peers.bind),
    ] {
        if let Ok(raw) = std::env::var(var) {
            match raw.parse::<SocketAddr>() {
                Ok(addr) => *slot = addr,
                Err(_) => warn!(var, value = %raw, "ignoring unparseable bind override"),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
