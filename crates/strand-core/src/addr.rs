//! Mesh addressing.
//!
//! Node and service names are free-form strings at the API surface. On the
//! wire, node names travel as a 64-bit BLAKE3-derived hash and service names
//! as 8 null-padded bytes. The reverse mapping for node hashes lives in the
//! engine's name registry; this module only defines the forward direction.

use std::fmt;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Hashed node name as carried in data frame headers.
pub type NodeHash = u64;

/// Maximum length of a service name, in bytes.
pub const MAX_SERVICE_LEN: usize = 8;

/// Compute the wire hash of a node name.
///
/// The first 8 bytes of the BLAKE3 digest, read big-endian. The mapping
/// must never change for a given name: every node in a mesh has to agree.
pub fn name_hash(name: &str) -> NodeHash {
    let digest = blake3::hash(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

/// A random 8-character alphanumeric service name for ephemeral listeners.
pub fn random_service_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MAX_SERVICE_LEN)
        .map(char::from)
        .collect()
}

/// A `(node, service)` endpoint in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr {
    pub node: String,
    pub service: String,
}

impl Addr {
    pub fn new(node: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid mesh address {0:?}: expected node:service")]
pub struct ParseAddrError(pub String);

impl FromStr for Addr {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((node, service)) if !node.is_empty() => Ok(Addr::new(node, service)),
            _ => Err(ParseAddrError(s.to_string())),
        }
    }
}
