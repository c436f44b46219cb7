//! Strand integration test harness.
//!
//! Every test builds a small mesh of in-process nodes joined by in-memory
//! backend pairs, so nothing here needs the network or elevated
//! privileges:
//!
//!   cargo test --test integration

use std::time::Duration;

use anyhow::{bail, Result};
use strand_core::config::NodeConfig;
use strand_net::backend::InMemoryBackend;
use strand_net::{BackendOptions, Node};

mod diagnostics;
mod messaging;
mod routing;
mod streams;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a mesh gets to settle before a test gives up.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Node config with a short route update interval.
pub fn config(id: &str) -> NodeConfig {
    let mut config = NodeConfig::with_id(id);
    config.route_update_interval_ms = 500;
    config
}

pub fn node(id: &str) -> Node {
    Node::new(config(id)).expect("node starts")
}

/// Join two nodes with an in-memory link of the given cost.
pub async fn link(a: &Node, b: &Node, cost: f64) -> Result<()> {
    let (left, right) = InMemoryBackend::pair();
    a.add_backend(left, BackendOptions::with_cost(cost)).await?;
    b.add_backend(right, BackendOptions::with_cost(cost)).await?;
    Ok(())
}

/// Poll `check` until it holds or `SETTLE` runs out.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Wait until `node` routes to `target` through `via`.
pub async fn wait_for_route(node: &Node, target: &str, via: &str) -> Result<()> {
    wait_for(&format!("{} -> {target} via {via}", node.id()), || {
        node.routing_table().get(target).map(String::as_str) == Some(via)
    })
    .await
}

/// A line of nodes, each linked to the next with cost 1, fully converged.
pub async fn chain(ids: &[&str]) -> Result<Vec<Node>> {
    let nodes: Vec<Node> = ids.iter().map(|id| node(id)).collect();
    for pair in nodes.windows(2) {
        link(&pair[0], &pair[1], 1.0).await?;
    }
    let first = &nodes[0];
    let last = &nodes[nodes.len() - 1];
    if nodes.len() > 1 {
        wait_for_route(first, last.id(), nodes[1].id()).await?;
        wait_for_route(last, first.id(), nodes[nodes.len() - 2].id()).await?;
    }
    Ok(nodes)
}

pub fn shutdown_all(nodes: &[Node]) {
    for node in nodes {
        node.shutdown();
    }
}
