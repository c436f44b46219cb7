//! Configuration system for Strand.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STRAND_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/strand/config.toml
//!   3. ~/.config/strand/config.toml

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firewall::{Firewall, FirewallError, FirewallRuleData};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StrandConfig {
    pub node: NodeConfig,
    /// Inbound TCP backends.
    pub listeners: Vec<ListenerConfig>,
    /// Outbound TCP backends.
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID. Empty = derive from $HOSTNAME.
    pub id: String,
    /// Hop budget given to locally originated messages.
    pub max_forwarding_hops: u8,
    /// Periodic routing update flood interval.
    pub route_update_interval_ms: u64,
    /// Periodic service advertisement interval.
    pub service_ad_interval_ms: u64,
    /// Links silent for longer than this are dropped.
    /// 0 = twice the route update interval plus one second.
    pub max_idle_connection_timeout_ms: u64,
    /// If set, only these node IDs may establish links.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_peers: Option<Vec<String>>,
    /// Ordered firewall rules, as records or compact strings.
    pub firewall_rules: Vec<FirewallRuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind: String,
    pub cost: f64,
    /// Per-remote-node cost overrides.
    pub node_cost: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_peers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub address: String,
    pub cost: f64,
    /// Reconnect after the link drops.
    pub redial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_peers: Option<Vec<String>>,
}

/// A firewall rule in either of its accepted shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FirewallRuleSpec {
    /// `"FromNode=foo, ToService=control: drop"`
    Compact(String),
    Record(FirewallRuleData),
}

impl FirewallRuleSpec {
    pub fn to_data(&self) -> Result<FirewallRuleData, FirewallError> {
        match self {
            FirewallRuleSpec::Compact(s) => s.parse(),
            FirewallRuleSpec::Record(d) => Ok(d.clone()),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_FORWARDING_HOPS: u8 = 30;
pub const DEFAULT_ROUTE_UPDATE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_SERVICE_AD_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_LINK_COST: f64 = 1.0;

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            max_forwarding_hops: DEFAULT_MAX_FORWARDING_HOPS,
            route_update_interval_ms: DEFAULT_ROUTE_UPDATE_INTERVAL_MS,
            service_ad_interval_ms: DEFAULT_SERVICE_AD_INTERVAL_MS,
            max_idle_connection_timeout_ms: 0,
            allowed_peers: None,
            firewall_rules: Vec::new(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2222".to_string(),
            cost: DEFAULT_LINK_COST,
            node_cost: BTreeMap::new(),
            allowed_peers: None,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            cost: DEFAULT_LINK_COST,
            redial: true,
            allowed_peers: None,
        }
    }
}

impl NodeConfig {
    /// A config for node `id` with every other field defaulted.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn route_update_interval(&self) -> Duration {
        Duration::from_millis(self.route_update_interval_ms)
    }

    pub fn service_ad_interval(&self) -> Duration {
        Duration::from_millis(self.service_ad_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        if self.max_idle_connection_timeout_ms == 0 {
            self.route_update_interval() * 2 + Duration::from_secs(1)
        } else {
            Duration::from_millis(self.max_idle_connection_timeout_ms)
        }
    }

    /// Compile the configured firewall rules, in order.
    pub fn firewall(&self) -> Result<Firewall, FirewallError> {
        let data = self
            .firewall_rules
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                spec.to_data().map_err(|e| FirewallError::Rule {
                    index,
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Firewall::compile(&data)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("strand")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid firewall configuration: {0}")]
    Firewall(#[from] FirewallError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StrandConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StrandConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STRAND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StrandConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.firewall()?;
        if self.node.max_forwarding_hops == 0 {
            return Err(ConfigError::Invalid("max_forwarding_hops must be positive".into()));
        }
        if self.node.route_update_interval_ms == 0 || self.node.service_ad_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        let costs = self
            .listeners
            .iter()
            .flat_map(|l| std::iter::once(l.cost).chain(l.node_cost.values().copied()))
            .chain(self.peers.iter().map(|p| p.cost));
        for cost in costs {
            if !(cost.is_finite() && cost > 0.0) {
                return Err(ConfigError::Invalid(format!("link cost {cost} must be positive")));
            }
        }
        if self.peers.iter().any(|p| p.address.is_empty()) {
            return Err(ConfigError::Invalid("peer address must not be empty".into()));
        }
        Ok(())
    }

    /// Apply STRAND_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STRAND_NODE__ID") {
            self.node.id = v;
        }
        if let Ok(v) = std::env::var("STRAND_NODE__MAX_FORWARDING_HOPS") {
            if let Ok(h) = v.parse() {
                self.node.max_forwarding_hops = h;
            }
        }
        if let Ok(v) = std::env::var("STRAND_NODE__ROUTE_UPDATE_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.node.route_update_interval_ms = ms;
            }
        }
    }
}
