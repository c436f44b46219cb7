//! Name registry: maps wire node hashes back to node names.
//!
//! Every node name the engine learns (its own, link peers, routing update
//! originators and their neighbors, message destinations) is registered
//! here before any frame mentioning it is decoded.

use std::sync::Arc;

use dashmap::DashMap;
use strand_core::addr::{name_hash, NodeHash};

#[derive(Debug, Clone, Default)]
pub struct NameRegistry {
    names: Arc<DashMap<NodeHash, String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` and return its hash. Registering twice is a no-op.
    pub fn register(&self, name: &str) -> NodeHash {
        let hash = name_hash(name);
        let entry = self.names.entry(hash).or_insert_with(|| name.to_string());
        if entry.value() != name {
            tracing::warn!(
                hash = format_args!("{hash:016x}"),
                existing = %entry.value(),
                name,
                "node name hash collision"
            );
        }
        hash
    }

    pub fn resolve(&self, hash: NodeHash) -> Option<String> {
        self.names.get(&hash).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_names_resolve() {
        let reg = NameRegistry::new();
        let h = reg.register("node-a");
        assert_eq!(reg.resolve(h).as_deref(), Some("node-a"));
        assert_eq!(reg.register("node-a"), h);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_hash_does_not_resolve() {
        let reg = NameRegistry::new();
        assert!(reg.resolve(name_hash("nobody")).is_none());
    }

    #[test]
    fn clones_share_state() {
        let a = NameRegistry::new();
        let b = a.clone();
        let h = a.register("shared");
        assert_eq!(b.resolve(h).as_deref(), Some("shared"));
    }
}
