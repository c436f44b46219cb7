//! Link protocol: one task per backend session.
//!
//! Until the remote's first routing update arrives the link re-announces
//! our own update once a second. The first update names the remote and,
//! if admission passes, establishes the link: it is registered with the
//! node, its edges enter the graph, and floods are scheduled. From then on
//! every frame goes through the node. Dropping the registration undoes
//! all of that, so every exit path cleans up the same way.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use strand_core::wire::{Frame, MessageData, RejectFrame, RoutingUpdate, WireError};

use crate::backend::{BackendOptions, BackendSession};
use crate::node::{
    LinkHandle, NodeInner, AD_FLOOD_DELAY, LINK_QUEUE_DEPTH, TABLE_UPDATE_DELAY,
};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_ANNOUNCE_ATTEMPTS: u32 = 10;
const READ_QUEUE_DEPTH: usize = 64;

/// Why a link ended.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("initial connection failed")]
    InitialConnectionFailed,

    #[error("remote node ID changed unexpectedly from {expected} to {got}")]
    RemoteIdChanged { expected: String, got: String },

    #[error("we disagree about the connection cost")]
    CostMismatch,

    #[error("remote node no longer lists us as a connection")]
    NoLongerListed,

    #[error("rejected by remote node {node:?}: {reason}")]
    RejectedByRemote { node: String, reason: String },

    #[error("peer {0} is not allowed to connect")]
    NotAllowed(String),

    #[error("already linked to {0}")]
    Duplicate(String),

    #[error("remote claims an empty or conflicting node id {0:?}")]
    BadRemoteId(String),

    #[error("no frames for {0:?}")]
    Idle(Duration),

    #[error("session closed")]
    SessionClosed,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Task plumbing ─────────────────────────────────────────────────────────────

struct AbortOnDrop(Vec<JoinHandle<()>>);

impl AbortOnDrop {
    fn abort(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Node-side registration of an established link.
struct Registration {
    inner: Arc<NodeInner>,
    remote: String,
    link_id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let inner = &self.inner;
        let removed = {
            let mut links = inner.links.write();
            if links
                .get(&self.remote)
                .is_some_and(|l| l.link_id == self.link_id)
            {
                links.remove(&self.remote);
                true
            } else {
                false
            }
        };
        if !removed {
            return;
        }
        {
            let mut known = inner.known.write();
            known.graph.remove_edge(&inner.id, &self.remote);
            known.graph.remove_edge(&self.remote, &inner.id);
        }
        inner.route_flood.request(Duration::ZERO);
        inner.table_update.request(TABLE_UPDATE_DELAY);
        tracing::info!(remote = %self.remote, "link down");
    }
}

struct Established {
    remote: String,
    cost: f64,
    listed_us: bool,
    last_checked: (u64, u64),
    last_received: Arc<Mutex<Instant>>,
    _registration: Registration,
}

struct Link {
    inner: Arc<NodeInner>,
    session: Arc<dyn BackendSession>,
    opts: Arc<BackendOptions>,
    write_tx: mpsc::Sender<Bytes>,
    err_tx: mpsc::Sender<LinkError>,
    announcer: AbortOnDrop,
    _io: AbortOnDrop,
    established: Option<Established>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Run the link protocol over `session` until it fails or the node stops.
pub(crate) async fn run_link(
    inner: Arc<NodeInner>,
    session: Arc<dyn BackendSession>,
    opts: Arc<BackendOptions>,
) {
    let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_DEPTH);
    let (write_tx, write_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
    let (err_tx, err_rx) = mpsc::channel(4);

    let io = AbortOnDrop(vec![
        tokio::spawn(read_loop(session.clone(), read_tx, err_tx.clone())),
        tokio::spawn(write_loop(session.clone(), write_rx, err_tx.clone())),
    ]);
    let announcer = AbortOnDrop(vec![tokio::spawn(announce_loop(
        inner.clone(),
        write_tx.clone(),
        err_tx.clone(),
    ))]);

    let mut link = Link {
        inner,
        session: session.clone(),
        opts,
        write_tx,
        err_tx,
        announcer,
        _io: io,
        established: None,
    };
    let result = link.run(read_rx, err_rx).await;
    let remote = link.established.as_ref().map(|e| e.remote.clone());
    match (&result, remote.as_deref()) {
        (Ok(()), Some(remote)) => tracing::debug!(remote, "link closed"),
        (Ok(()), None) => tracing::debug!("unestablished link closed"),
        (Err(e), Some(remote)) => tracing::warn!(remote, error = %e, "link failed"),
        (Err(e), None) => tracing::warn!(error = %e, "link failed before establishing"),
    }
    drop(link);
    if let Err(e) = session.close().await {
        tracing::trace!(error = %e, "session close failed");
    }
}

async fn read_loop(
    session: Arc<dyn BackendSession>,
    read_tx: mpsc::Sender<Bytes>,
    err_tx: mpsc::Sender<LinkError>,
) {
    loop {
        match session.recv().await {
            Ok(frame) => {
                if read_tx.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = err_tx.send(LinkError::Io(e)).await;
                return;
            }
        }
    }
}

async fn write_loop(
    session: Arc<dyn BackendSession>,
    mut write_rx: mpsc::Receiver<Bytes>,
    err_tx: mpsc::Sender<LinkError>,
) {
    while let Some(frame) = write_rx.recv().await {
        if let Err(e) = session.send(frame).await {
            let _ = err_tx.send(LinkError::Io(e)).await;
            return;
        }
    }
}

async fn announce_loop(
    inner: Arc<NodeInner>,
    write_tx: mpsc::Sender<Bytes>,
    err_tx: mpsc::Sender<LinkError>,
) {
    for attempt in 1..=MAX_ANNOUNCE_ATTEMPTS {
        match Frame::Route(inner.make_routing_update()).encode() {
            Ok(frame) => {
                if write_tx.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode announcement"),
        }
        tracing::trace!(attempt, "announced routing update on new link");
        tokio::time::sleep(ANNOUNCE_INTERVAL).await;
    }
    let _ = err_tx.send(LinkError::InitialConnectionFailed).await;
}

// ── Protocol ──────────────────────────────────────────────────────────────────

impl Link {
    async fn run(
        &mut self,
        mut read_rx: mpsc::Receiver<Bytes>,
        mut err_rx: mpsc::Receiver<LinkError>,
    ) -> Result<(), LinkError> {
        let mut shutdown = self.inner.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                err = err_rx.recv() => return Err(err.unwrap_or(LinkError::SessionClosed)),
                frame = read_rx.recv() => {
                    let frame = frame.ok_or(LinkError::SessionClosed)?;
                    self.handle_frame(frame).await?;
                }
            }
        }
    }

    async fn handle_frame(&mut self, raw: Bytes) -> Result<(), LinkError> {
        if let Some(est) = &self.established {
            *est.last_received.lock() = Instant::now();
        }
        let frame = Frame::decode(raw)?;

        let Some(remote) = self.established.as_ref().map(|e| e.remote.clone()) else {
            return match frame {
                Frame::Route(update) => {
                    self.establish(&update.forwarding_node).await?;
                    self.handle_route(update).await
                }
                Frame::Reject(reject) => Err(LinkError::RejectedByRemote {
                    node: reject.node_id,
                    reason: reject.reason,
                }),
                other => {
                    tracing::trace!(kind = ?other.message_type(), "frame before link established");
                    Ok(())
                }
            };
        };

        match frame {
            Frame::Data(raw) => {
                self.handle_data(raw).await;
                Ok(())
            }
            Frame::Route(update) => self.handle_route(update).await,
            Frame::ServiceAdvertisement(ad) => {
                self.inner.handle_advertisement(ad, &remote);
                Ok(())
            }
            Frame::Reject(reject) => Err(LinkError::RejectedByRemote {
                node: remote,
                reason: reject.reason,
            }),
        }
    }

    async fn establish(&mut self, remote: &str) -> Result<(), LinkError> {
        if remote.is_empty() || remote == self.inner.id {
            self.reject("node id conflict").await;
            return Err(LinkError::BadRemoteId(remote.to_string()));
        }
        let allowed = self
            .opts
            .allowed_peers
            .as_ref()
            .or(self.inner.config.allowed_peers.as_ref());
        if let Some(allowed) = allowed {
            if !allowed.iter().any(|p| p == remote) {
                self.reject("not allowed").await;
                return Err(LinkError::NotAllowed(remote.to_string()));
            }
        }

        let inner = self.inner.clone();
        let cost = self.opts.cost_for(remote);
        let link_id = inner.next_id();
        let last_received = Arc::new(Mutex::new(Instant::now()));
        let inserted = {
            let mut links = inner.links.write();
            if links.contains_key(remote) {
                false
            } else {
                links.insert(
                    remote.to_string(),
                    LinkHandle {
                        link_id,
                        cost,
                        write_tx: self.write_tx.clone(),
                        kill_tx: self.err_tx.clone(),
                        last_received: last_received.clone(),
                    },
                );
                true
            }
        };
        if !inserted {
            self.reject("duplicate connection").await;
            return Err(LinkError::Duplicate(remote.to_string()));
        }

        self.announcer.abort();
        inner.names.register(remote);
        {
            let mut known = inner.known.write();
            known.graph.set_edge(&inner.id, remote, cost);
            known.graph.set_edge(remote, &inner.id, cost);
        }
        inner.route_flood.request(Duration::ZERO);
        inner.table_update.request(TABLE_UPDATE_DELAY);
        inner.ad_flood.request(AD_FLOOD_DELAY);
        tracing::info!(remote, cost, "link established");

        self.established = Some(Established {
            remote: remote.to_string(),
            cost,
            listed_us: false,
            last_checked: (0, 0),
            last_received,
            _registration: Registration {
                inner,
                remote: remote.to_string(),
                link_id,
            },
        });
        Ok(())
    }

    async fn handle_route(&mut self, update: RoutingUpdate) -> Result<(), LinkError> {
        let local_id = self.inner.id.clone();
        let Some(est) = self.established.as_mut() else {
            return Err(LinkError::SessionClosed);
        };
        if update.forwarding_node != est.remote {
            let err = LinkError::RemoteIdChanged {
                expected: est.remote.clone(),
                got: update.forwarding_node,
            };
            self.reject("remote id changed").await;
            return Err(err);
        }

        let version = (update.update_epoch, update.update_sequence);
        let mut mismatch = false;
        let mut dropped_us = false;
        if update.node_id == est.remote && version > est.last_checked {
            est.last_checked = version;
            match update.connections.get(&local_id) {
                Some(&cost) if (cost - est.cost).abs() > f64::EPSILON => {
                    tracing::warn!(
                        remote = %est.remote,
                        ours = est.cost,
                        theirs = cost,
                        "link cost mismatch"
                    );
                    mismatch = true;
                }
                Some(_) => est.listed_us = true,
                None if est.listed_us => dropped_us = true,
                None => {}
            }
        }
        let remote = est.remote.clone();
        if dropped_us {
            self.reject("no longer listed").await;
            return Err(LinkError::NoLongerListed);
        }
        if mismatch {
            self.reject("cost mismatch").await;
            return Err(LinkError::CostMismatch);
        }

        self.inner.handle_routing_update(update, &remote);
        Ok(())
    }

    async fn handle_data(&self, raw: Bytes) {
        let names = &self.inner.names;
        match MessageData::decode(&raw, |hash| names.resolve(hash)) {
            Ok(md) => {
                if let Err(e) = self.inner.handle_message_data(md).await {
                    tracing::debug!(error = %e, "failed to route data message");
                }
            }
            Err(e) => tracing::debug!(error = %e, "dropping undecodable data frame"),
        }
    }

    /// Tell the remote why we are closing, bypassing the write queue.
    async fn reject(&self, reason: &str) {
        let frame = Frame::Reject(RejectFrame {
            node_id: self.inner.id.clone(),
            reason: reason.to_string(),
        });
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.session.send(bytes).await {
                    tracing::trace!(error = %e, "failed to send reject");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode reject"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemorySession;
    use crate::node::Node;
    use strand_core::config::NodeConfig;

    /// Drive a link by hand from the remote side of an in-memory session.
    async fn raw_link(config: NodeConfig, opts: BackendOptions) -> (Node, InMemorySession) {
        let node = Node::new(config).unwrap();
        let (ours, theirs) = InMemorySession::pair();
        tokio::spawn(run_link(
            node.inner.clone(),
            Arc::new(ours),
            Arc::new(opts),
        ));
        (node, theirs)
    }

    fn local() -> NodeConfig {
        NodeConfig::with_id("local")
    }

    fn update(node: &str, seq: u64, connections: &[(&str, f64)]) -> Bytes {
        Frame::Route(RoutingUpdate {
            node_id: node.into(),
            update_id: format!("{node}-{seq}"),
            update_epoch: 1,
            update_sequence: seq,
            connections: connections
                .iter()
                .map(|(n, c)| (n.to_string(), *c))
                .collect(),
            forwarding_node: node.into(),
        })
        .encode()
        .unwrap()
    }

    async fn next_frame(session: &InMemorySession) -> Frame {
        let raw = tokio::time::timeout(Duration::from_secs(2), session.recv())
            .await
            .expect("no frame")
            .expect("session closed");
        Frame::decode(raw).unwrap()
    }

    async fn wait_closed(session: &InMemorySession) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link did not close");
    }

    /// Skip routing chatter until the reject arrives.
    async fn expect_reject(session: &InMemorySession) -> RejectFrame {
        loop {
            match next_frame(session).await {
                Frame::Reject(r) => return r,
                Frame::Route(_) | Frame::ServiceAdvertisement(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn new_link_announces_itself() {
        let (_node, remote) = raw_link(local(), BackendOptions::default()).await;
        match next_frame(&remote).await {
            Frame::Route(u) => {
                assert_eq!(u.node_id, "local");
                assert_eq!(u.forwarding_node, "local");
            }
            other => panic!("expected a routing update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_update_establishes_the_link() {
        let (node, remote) = raw_link(local(), BackendOptions::with_cost(2.5)).await;
        remote.send(update("far", 1, &[])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while node.status().connections.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link never established");
        let status = node.status();
        assert_eq!(status.connections[0].node_id, "far");
        assert_eq!(status.connections[0].cost, 2.5);
        assert_eq!(status.known_connection_costs["local"]["far"], 2.5);
    }

    #[tokio::test]
    async fn peer_outside_allow_list_is_rejected() {
        let mut opts = BackendOptions::default();
        opts.allowed_peers = Some(vec!["friend".into()]);
        let (node, remote) = raw_link(local(), opts).await;
        remote.send(update("stranger", 1, &[])).await.unwrap();
        loop {
            match next_frame(&remote).await {
                Frame::Reject(r) => {
                    assert_eq!(r.node_id, "local");
                    break;
                }
                Frame::Route(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        wait_closed(&remote).await;
        assert!(node.status().connections.is_empty());
    }

    #[tokio::test]
    async fn remote_claiming_our_id_is_rejected() {
        let (node, remote) = raw_link(local(), BackendOptions::default()).await;
        remote.send(update("local", 1, &[])).await.unwrap();
        wait_closed(&remote).await;
        assert!(node.status().connections.is_empty());
    }

    #[tokio::test]
    async fn cost_disagreement_tears_the_link_down() {
        let (node, remote) = raw_link(local(), BackendOptions::with_cost(1.0)).await;
        remote.send(update("far", 1, &[])).await.unwrap();
        remote.send(update("far", 2, &[("local", 3.0)])).await.unwrap();
        wait_closed(&remote).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(node.status().connections.is_empty());
    }

    #[tokio::test]
    async fn dropping_us_from_connections_tears_the_link_down() {
        let (node, remote) = raw_link(local(), BackendOptions::default()).await;
        remote.send(update("far", 1, &[("local", 1.0)])).await.unwrap();
        remote.send(update("far", 2, &[])).await.unwrap();
        let reject = expect_reject(&remote).await;
        assert_eq!(reject.node_id, "local");
        assert_eq!(reject.reason, "no longer listed");
        wait_closed(&remote).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(node.status().connections.is_empty());
        let costs = node.status().known_connection_costs;
        assert_eq!(costs.get("local").and_then(|m| m.get("far")), None);
    }

    #[tokio::test]
    async fn forwarding_node_must_stay_the_same() {
        let (_node, remote) = raw_link(local(), BackendOptions::default()).await;
        remote.send(update("far", 1, &[])).await.unwrap();
        remote.send(update("imposter", 1, &[])).await.unwrap();
        assert_eq!(expect_reject(&remote).await.reason, "remote id changed");
        wait_closed(&remote).await;
    }

    #[tokio::test]
    async fn silent_link_is_aged_out() {
        let mut config = NodeConfig::with_id("local");
        config.max_idle_connection_timeout_ms = 200;
        let (node, remote) = raw_link(config, BackendOptions::default()).await;
        remote.send(update("far", 1, &[])).await.unwrap();
        wait_closed(&remote).await;
        assert!(node.status().connections.is_empty());
    }
}
