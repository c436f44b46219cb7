//! Datagrams, firewall verdicts and service advertisements across nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};

use strand_core::config::FirewallRuleSpec;
use strand_core::wire::ConnType;
use strand_core::{Addr, FirewallResult, MessageData, Problem};
use strand_net::backend::ExternalBackend;
use strand_net::{BackendOptions, Node};

use crate::*;

/// A datagram crosses two forwarding hops and the reply comes back.
#[tokio::test]
async fn test_datagram_round_trip_over_chain() -> Result<()> {
    let nodes = chain(&["m-a", "m-b", "m-c"]).await?;
    let (a, c) = (&nodes[0], &nodes[2]);

    let server = c.listen_packet("echo")?;
    let client = a.listen_packet("")?;
    client
        .send_to(&b"hello mesh"[..], &Addr::new("m-c", "echo"))
        .await?;

    let (data, from) = tokio::time::timeout(SETTLE, server.recv_from()).await??;
    assert_eq!(&data[..], b"hello mesh");
    assert_eq!(from, client.local_addr());
    server.send_to(data, &from).await?;

    let (reply, from) = tokio::time::timeout(SETTLE, client.recv_from()).await??;
    assert_eq!(&reply[..], b"hello mesh");
    assert_eq!(from, Addr::new("m-c", "echo"));

    shutdown_all(&nodes);
    Ok(())
}

/// A reject rule on the far node produces exactly one unreachable report
/// for the sender, naming the node that applied it.
#[tokio::test]
async fn test_firewall_reject_reports_once() -> Result<()> {
    let a = node("f-a");
    let mut guarded_config = config("f-b");
    guarded_config.firewall_rules = vec![FirewallRuleSpec::Compact(
        "ToService=secret: reject".to_string(),
    )];
    let b = Node::new(guarded_config)?;
    link(&a, &b, 1.0).await?;
    wait_for_route(&a, "f-b", "f-b").await?;

    let _secret = b.listen_packet("secret")?;
    let open = b.listen_packet("open")?;
    let client = a.listen_packet("")?;
    let mut unreachable = client.subscribe_unreachable();

    client.send_to(&b"knock"[..], &Addr::new("f-b", "secret")).await?;
    let note = tokio::time::timeout(SETTLE, unreachable.recv())
        .await?
        .context("node went away")?;
    assert_eq!(note.message.problem, Problem::Rejected);
    assert_eq!(note.message.to_service, "secret");
    assert_eq!(note.received_from_node, "f-b");
    assert!(
        tokio::time::timeout(Duration::from_millis(300), unreachable.recv())
            .await
            .is_err(),
        "second unreachable report"
    );

    client.send_to(&b"hi"[..], &Addr::new("f-b", "open")).await?;
    let (data, _) = tokio::time::timeout(SETTLE, open.recv_from()).await??;
    assert_eq!(&data[..], b"hi");

    shutdown_all(&[a, b]);
    Ok(())
}

/// A message to a service nobody listens on comes back as unknown.
#[tokio::test]
async fn test_unknown_remote_service_is_reported() -> Result<()> {
    let nodes = chain(&["u-a", "u-b"]).await?;
    let client = nodes[0].listen_packet("")?;
    let mut unreachable = client.subscribe_unreachable();

    client.send_to(&b"?"[..], &Addr::new("u-b", "nobody")).await?;
    let note = tokio::time::timeout(SETTLE, unreachable.recv())
        .await?
        .context("node went away")?;
    assert_eq!(note.message.problem, Problem::ServiceUnknown);
    assert_eq!(note.received_from_node, "u-b");

    shutdown_all(&nodes);
    Ok(())
}

/// Advertisements flood to every node and withdrawals follow them.
#[tokio::test]
async fn test_advertisements_propagate_and_withdraw() -> Result<()> {
    let nodes = chain(&["s-a", "s-b", "s-c"]).await?;
    let (a, c) = (&nodes[0], &nodes[2]);

    let tags = BTreeMap::from([("kind".to_string(), "demo".to_string())]);
    let pc = c.listen_packet_and_advertise("demo", tags.clone())?;

    wait_for("advertisement at s-a", || a.get_service_info("s-c", "demo").is_some()).await?;
    let ad = a.get_service_info("s-c", "demo").context("advertisement vanished")?;
    assert_eq!(ad.conn_type, ConnType::Datagram);
    assert_eq!(ad.tags, tags);
    assert!(a
        .status()
        .advertisements
        .iter()
        .any(|ad| ad.node_id == "s-c" && ad.service == "demo"));

    pc.close();
    wait_for("withdrawal at s-a", || a.get_service_info("s-c", "demo").is_none()).await?;

    shutdown_all(&nodes);
    Ok(())
}

/// A payload filter on the receiving node stops "bad" and lets "good"
/// through untouched; the sender hears about "bad" exactly once.
#[tokio::test]
async fn test_payload_filter_rejects_bad_payload() -> Result<()> {
    let nodes = chain(&["g-a", "g-b"]).await?;
    let (a, b) = (&nodes[0], &nodes[1]);
    b.add_firewall_rule(|m: &MessageData| {
        if m.data.as_ref() == b"bad" {
            FirewallResult::Reject
        } else {
            FirewallResult::Continue
        }
    });

    let server = b.listen_packet("inbox")?;
    let client = a.listen_packet("")?;
    let mut unreachable = client.subscribe_unreachable();
    let inbox = Addr::new("g-b", "inbox");

    client.send_to(&b"bad"[..], &inbox).await?;
    client.send_to(&b"good"[..], &inbox).await?;

    let (data, _) = tokio::time::timeout(SETTLE, server.recv_from()).await??;
    assert_eq!(&data[..], b"good");
    let note = tokio::time::timeout(SETTLE, unreachable.recv())
        .await?
        .context("node went away")?;
    assert_eq!(note.message.problem, Problem::Rejected);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), unreachable.recv())
            .await
            .is_err(),
        "second unreachable report"
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(100), server.recv_from())
            .await
            .is_err(),
        "rejected payload was delivered"
    );

    shutdown_all(&nodes);
    Ok(())
}

/// Nodes joined by an externally fed byte-stream pair behave like any
/// other link.
#[tokio::test]
async fn test_external_backend_over_socket_pair() -> Result<()> {
    let a = node("e-a");
    let b = node("e-b");
    let left = ExternalBackend::new();
    let right = ExternalBackend::new();
    a.add_backend(left.clone(), BackendOptions::with_cost(2.0)).await?;
    b.add_backend(right.clone(), BackendOptions::with_cost(2.0)).await?;

    let (x, y) = tokio::io::duplex(64 * 1024);
    let session = left.new_connection(x).await?;
    right.new_connection(y).await?;

    wait_for_route(&a, "e-b", "e-b").await?;
    wait_for_route(&b, "e-a", "e-a").await?;
    assert_eq!(a.status().connections[0].cost, 2.0);

    b.shutdown();
    tokio::time::timeout(SETTLE, session.closed()).await?;
    wait_for("e-b to drop out of e-a's table", || {
        !a.routing_table().contains_key("e-b")
    })
    .await?;

    a.shutdown();
    Ok(())
}
