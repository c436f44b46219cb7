//! Backend contract: how transports plug into the mesh.
//!
//! A backend produces sessions. A session is a bidirectional,
//! message-oriented pipe to exactly one remote node: every `send` arrives
//! as exactly one `recv` on the other side. Reconnection is the backend's
//! business; the engine runs one link per session until it fails.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use strand_core::config::{ListenerConfig, PeerConfig};

use crate::shutdown::Shutdown;

pub mod external;
pub mod inmem;

pub use external::{ExternalBackend, FramedSession, MAX_FRAME_LEN};
pub use inmem::{InMemoryBackend, InMemorySession};

#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn send(&self, frame: Bytes) -> io::Result<()>;
    async fn recv(&self) -> io::Result<Bytes>;
    async fn close(&self) -> io::Result<()>;
}

/// Sessions produced by a running backend.
pub type SessionReceiver = mpsc::Receiver<Arc<dyn BackendSession>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Start producing sessions. The returned channel closes when the
    /// backend stops; backends should stop on `shutdown`.
    async fn start(&self, shutdown: Shutdown) -> io::Result<SessionReceiver>;
}

/// Per-backend link policy.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Cost of links made through this backend.
    pub cost: f64,
    /// Cost overrides for specific remote nodes.
    pub node_cost: HashMap<String, f64>,
    /// If set, only these nodes may link through this backend. Takes
    /// precedence over the node-wide list.
    pub allowed_peers: Option<Vec<String>>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            cost: 1.0,
            node_cost: HashMap::new(),
            allowed_peers: None,
        }
    }
}

impl BackendOptions {
    pub fn with_cost(cost: f64) -> Self {
        Self {
            cost,
            ..Self::default()
        }
    }

    pub fn cost_for(&self, node: &str) -> f64 {
        self.node_cost.get(node).copied().unwrap_or(self.cost)
    }
}

impl From<&ListenerConfig> for BackendOptions {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            cost: config.cost,
            node_cost: config.node_cost.clone().into_iter().collect(),
            allowed_peers: config.allowed_peers.clone(),
        }
    }
}

impl From<&PeerConfig> for BackendOptions {
    fn from(config: &PeerConfig) -> Self {
        Self {
            cost: config.cost,
            node_cost: HashMap::new(),
            allowed_peers: config.allowed_peers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_cost_overrides_backend_cost() {
        let mut opts = BackendOptions::with_cost(2.0);
        opts.node_cost.insert("far".into(), 9.0);
        assert_eq!(opts.cost_for("far"), 9.0);
        assert_eq!(opts.cost_for("near"), 2.0);
    }

    #[test]
    fn listener_config_maps_to_backend_options() {
        let config = ListenerConfig {
            bind: "127.0.0.1:0".into(),
            cost: 2.5,
            node_cost: std::collections::BTreeMap::from([("far".to_string(), 7.0)]),
            allowed_peers: Some(vec!["far".into()]),
        };
        let opts = BackendOptions::from(&config);
        assert_eq!(opts.cost_for("far"), 7.0);
        assert_eq!(opts.cost_for("near"), 2.5);
        assert_eq!(opts.allowed_peers, Some(vec!["far".to_string()]));
    }
}
