//! strandd: mesh node daemon.

use std::time::Duration;

use anyhow::{Context, Result};

use strand_core::config::StrandConfig;
use strand_net::{BackendOptions, Node};

mod tcp;

use tcp::{TcpDialerBackend, TcpListenerBackend};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StrandConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = StrandConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StrandConfig::default()
    });
    if config.node.id.is_empty() {
        config.node.id = std::env::var("HOSTNAME").unwrap_or_else(|_| "strand".to_string());
    }
    config.validate().context("invalid configuration")?;

    let node = Node::new(config.node.clone()).context("failed to create node")?;
    tracing::info!(node_id = node.id(), epoch = node.epoch(), "strandd starting");

    // Backends
    for listener in &config.listeners {
        let backend = TcpListenerBackend::bind(&listener.bind)
            .await
            .with_context(|| format!("failed to bind {}", listener.bind))?;
        tracing::info!(addr = %backend.local_addr(), cost = listener.cost, "listener bound");
        node.add_backend(backend, BackendOptions::from(listener)).await?;
    }
    for peer in &config.peers {
        let backend = TcpDialerBackend::new(peer.address.clone(), peer.redial);
        node.add_backend(backend, BackendOptions::from(peer)).await?;
        tracing::info!(address = %peer.address, redial = peer.redial, "peer configured");
    }

    // Ctrl-C
    {
        let node = node.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            node.shutdown();
        });
    }

    // Periodic status
    {
        let node = node.clone();
        let mut shutdown = node.shutdown_signal();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {}
                }
                let status = node.status();
                match serde_json::to_string(&status) {
                    Ok(json) => tracing::info!(
                        connections = status.connections.len(),
                        routes = status.routing_table.len(),
                        status = %json,
                        "node status"
                    ),
                    Err(e) => tracing::warn!(error = %e, "failed to encode status"),
                }
            }
        });
    }

    node.wait().await;
    tracing::info!("shutting down");
    Ok(())
}
