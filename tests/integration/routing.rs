//! Route discovery, re-routing and link admission.

use std::time::Duration;

use anyhow::Result;

use strand_net::Node;

use crate::*;

/// Routes propagate down a chain and every node learns the whole graph.
#[tokio::test]
async fn test_chain_converges() -> Result<()> {
    let nodes = chain(&["r-a", "r-b", "r-c", "r-d"]).await?;
    let a = &nodes[0];

    assert_eq!(a.routing_table().get("r-c").map(String::as_str), Some("r-b"));
    assert_eq!(a.routing_table().get("r-d").map(String::as_str), Some("r-b"));
    wait_for("r-c to route both ways", || {
        let table = nodes[2].routing_table();
        table.get("r-a").map(String::as_str) == Some("r-b")
            && table.get("r-d").map(String::as_str) == Some("r-d")
    })
    .await?;

    let status = a.status();
    assert_eq!(status.node_id, "r-a");
    assert_eq!(status.connections.len(), 1);
    assert_eq!(status.connections[0].node_id, "r-b");
    assert!(status.known_connection_costs.contains_key("r-d"));

    let json = serde_json::to_value(&status)?;
    assert_eq!(json["node_id"], "r-a");
    assert_eq!(json["routing_table"]["r-d"], "r-b");

    shutdown_all(&nodes);
    Ok(())
}

/// The cheaper two-hop path wins over an expensive direct link, and the
/// direct link takes over once the middle node goes away.
#[tokio::test]
async fn test_reroute_after_link_loss() -> Result<()> {
    let a = node("x-a");
    let b = node("x-b");
    let c = node("x-c");
    link(&a, &b, 1.0).await?;
    link(&b, &c, 1.0).await?;
    link(&a, &c, 10.0).await?;

    wait_for_route(&a, "x-c", "x-b").await?;
    wait_for_route(&c, "x-a", "x-b").await?;

    b.shutdown();
    b.wait().await;

    wait_for_route(&a, "x-c", "x-c").await?;
    wait_for_route(&c, "x-a", "x-c").await?;
    wait_for("x-b to drop out of x-a's table", || {
        !a.routing_table().contains_key("x-b")
    })
    .await?;

    shutdown_all(&[a, c]);
    Ok(())
}

/// A node refuses links from peers missing from its allow list.
#[tokio::test]
async fn test_allowed_peers_rejects_unlisted_node() -> Result<()> {
    let mut strict_config = config("strict");
    strict_config.allowed_peers = Some(vec!["friend".to_string()]);
    let strict = Node::new(strict_config)?;
    let friend = node("friend");
    let stranger = node("stranger");

    link(&strict, &friend, 1.0).await?;
    link(&strict, &stranger, 1.0).await?;

    wait_for_route(&strict, "friend", "friend").await?;
    wait_for_route(&friend, "strict", "strict").await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!strict.routing_table().contains_key("stranger"));
    assert!(!stranger.routing_table().contains_key("strict"));
    assert!(!friend.routing_table().contains_key("stranger"));
    assert!(strict
        .status()
        .connections
        .iter()
        .all(|c| c.node_id != "stranger"));

    shutdown_all(&[strict, friend, stranger]);
    Ok(())
}
