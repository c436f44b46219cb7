//! Ping and traceroute through a chain.

use anyhow::{Context, Result};

use strand_core::Problem;
use strand_net::NetError;

use crate::*;

#[tokio::test]
async fn test_ping_across_chain() -> Result<()> {
    let nodes = chain(&["p-a", "p-b", "p-c"]).await?;

    let pong = nodes[0].ping("p-c", 5).await?;
    assert_eq!(pong.remote, "p-c");

    let err = nodes[0].ping("p-c", 1).await.unwrap_err();
    assert_eq!(err.remote.as_deref(), Some("p-b"));
    assert!(matches!(
        err.source,
        NetError::Unreachable(Problem::ExpiredInTransit)
    ));

    shutdown_all(&nodes);
    Ok(())
}

#[tokio::test]
async fn test_traceroute_lists_every_hop() -> Result<()> {
    let nodes = chain(&["q-a", "q-b", "q-c"]).await?;

    let mut results = nodes[0].traceroute("q-c");
    let mut hops = Vec::new();
    while let Some(result) = results.recv().await {
        hops.push(result);
    }

    let from: Vec<_> = hops.iter().map(|h| h.from.as_deref()).collect();
    assert_eq!(from, vec![Some("q-a"), Some("q-b"), Some("q-c")]);
    let last = hops.last().context("no hops")?;
    assert!(last.err.is_none());
    assert!(hops[..2].iter().all(|h| matches!(
        h.err,
        Some(NetError::Unreachable(Problem::ExpiredInTransit))
    )));

    shutdown_all(&nodes);
    Ok(())
}
