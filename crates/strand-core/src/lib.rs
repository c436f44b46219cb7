//! strand-core: wire format, addressing, routing math, firewall rules and
//! configuration. Pure data and algorithms; no I/O, no runtime.
//! The engine in strand-net and the daemon both depend on this crate.

pub mod addr;
pub mod config;
pub mod firewall;
pub mod routing;
pub mod wire;

pub use addr::{name_hash, Addr, NodeHash};
pub use firewall::{FirewallResult, FirewallRule, FirewallRuleData, Firewall};
pub use routing::{ConnectionGraph, RoutingTable};
pub use wire::{Frame, MessageData, MessageType, Problem, RoutingUpdate, WireError};
