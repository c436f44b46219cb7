//! The mesh node: shared state, routing, and message dispatch.
//!
//! Everything mutable lives in `NodeInner` behind one `Arc`. Periodic work
//! (route floods, table recomputes, advertisement floods, link aging) runs
//! in tasks holding only a `Weak` reference; link tasks hold a strong one
//! and stop on shutdown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use strand_core::addr::{Addr, MAX_SERVICE_LEN};
use strand_core::config::NodeConfig;
use strand_core::firewall::{Firewall, FirewallAction, FirewallRule};
use strand_core::routing::{ConnectionGraph, RoutingTable};
use strand_core::wire::{
    AdvertisementFrame, ConnType, Frame, MessageData, Problem, RoutingUpdate,
    ServiceAdvertisement, UnreachableMessage, PING_SERVICE, UNREACH_SERVICE,
};

use crate::ads::{unix_millis, AdTable};
use crate::backend::{Backend, BackendOptions};
use crate::error::NetError;
use crate::link::{self, LinkError};
use crate::names::NameRegistry;
use crate::packet::{PacketConn, UnreachableNotification};
use crate::shutdown::Shutdown;
use crate::tick::{self, TickReceiver, Ticker};
use crate::tls::TlsRegistry;

pub(crate) const TABLE_UPDATE_DELAY: Duration = Duration::from_millis(250);
pub(crate) const AD_FLOOD_DELAY: Duration = Duration::from_millis(100);
const TABLE_UPDATE_PERIOD: Duration = Duration::from_secs(3600);
const SEEN_UPDATE_RETENTION: Duration = Duration::from_secs(3600);
const SEEN_UPDATE_SWEEP: Duration = Duration::from_secs(60);
const UNREACHABLE_CHANNEL_DEPTH: usize = 256;
pub(crate) const LINK_QUEUE_DEPTH: usize = 128;
pub(crate) const LISTENER_QUEUE_DEPTH: usize = 256;

// ── Shared state ──────────────────────────────────────────────────────────────

/// An established link, as the rest of the node sees it.
pub(crate) struct LinkHandle {
    pub link_id: u64,
    pub cost: f64,
    pub write_tx: mpsc::Sender<Bytes>,
    pub kill_tx: mpsc::Sender<LinkError>,
    pub last_received: Arc<Mutex<Instant>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NodeInfo {
    pub epoch: u64,
    pub sequence: u64,
}

#[derive(Debug, Default)]
pub(crate) struct KnownState {
    pub graph: ConnectionGraph,
    pub node_info: HashMap<String, NodeInfo>,
}

/// A datagram waiting in a listener's queue.
#[derive(Debug)]
pub(crate) struct Datagram {
    pub from: Addr,
    pub data: Bytes,
}

pub(crate) struct ListenerEntry {
    pub reg_id: u64,
    pub tx: mpsc::Sender<Datagram>,
}

pub(crate) struct NodeInner {
    pub(crate) id: String,
    pub(crate) epoch: u64,
    sequence: AtomicU64,
    next_id: AtomicU64,
    pub(crate) config: NodeConfig,
    pub(crate) names: NameRegistry,
    pub(crate) links: RwLock<HashMap<String, LinkHandle>>,
    pub(crate) known: RwLock<KnownState>,
    pub(crate) routing: watch::Sender<Arc<RoutingTable>>,
    seen_updates: DashMap<String, Instant>,
    pub(crate) listeners: DashMap<String, ListenerEntry>,
    pub(crate) ads: AdTable,
    firewall: RwLock<Firewall>,
    pub(crate) unreachable_tx: broadcast::Sender<UnreachableNotification>,
    pub(crate) route_flood: Ticker,
    pub(crate) table_update: Ticker,
    pub(crate) ad_flood: Ticker,
    pub(crate) tls: TlsRegistry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Outcome of routing one message.
enum Dispatch {
    Done,
    Forward {
        next_hop: String,
        tx: mpsc::Sender<Bytes>,
        frame: Bytes,
    },
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub node_id: String,
    pub cost: f64,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub node_id: String,
    pub connections: Vec<ConnectionStatus>,
    pub routing_table: BTreeMap<String, String>,
    pub advertisements: Vec<ServiceAdvertisement>,
    pub known_connection_costs: BTreeMap<String, BTreeMap<String, f64>>,
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// Handle to a running mesh node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Start a node. Must be called inside a tokio runtime.
    pub fn new(config: NodeConfig) -> Result<Self, NetError> {
        if config.id.is_empty() {
            return Err(NetError::EmptyNodeId);
        }
        let firewall = config.firewall()?;

        let (route_flood, route_rx) = tick::channel();
        let (table_update, table_rx) = tick::channel();
        let (ad_flood, ad_rx) = tick::channel();
        let (routing, _) = watch::channel(Arc::new(RoutingTable::new()));
        let (unreachable_tx, _) = broadcast::channel(UNREACHABLE_CHANNEL_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);

        let names = NameRegistry::new();
        names.register(&config.id);

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let inner = Arc::new(NodeInner {
            id: config.id.clone(),
            epoch,
            sequence: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            config,
            names,
            links: RwLock::new(HashMap::new()),
            known: RwLock::new(KnownState::default()),
            routing,
            seen_updates: DashMap::new(),
            listeners: DashMap::new(),
            ads: AdTable::new(),
            firewall: RwLock::new(firewall),
            unreachable_tx,
            route_flood,
            table_update,
            ad_flood,
            tls: TlsRegistry::default(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        spawn_ticker(&inner, route_rx, inner.config.route_update_interval(), |n| {
            n.flood_own_update()
        });
        spawn_ticker(&inner, table_rx, TABLE_UPDATE_PERIOD, |n| n.update_routing_table());
        spawn_ticker(&inner, ad_rx, inner.config.service_ad_interval(), |n| {
            n.flood_advertisements()
        });
        let housekeeping = tokio::spawn(housekeeping(
            Arc::downgrade(&inner),
            inner.shutdown_signal(),
            inner.config.idle_timeout(),
        ));
        inner.track(housekeeping);

        tracing::info!(
            node = %inner.id,
            max_hops = inner.config.max_forwarding_hops,
            route_interval_ms = inner.config.route_update_interval_ms,
            "node started"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Start a backend and run a link for every session it produces.
    pub async fn add_backend(
        &self,
        backend: impl Backend + 'static,
        options: BackendOptions,
    ) -> Result<(), NetError> {
        let mut sessions = backend.start(self.inner.shutdown_signal()).await?;
        let options = Arc::new(options);
        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown_signal();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("backend session loop shutting down");
                        return;
                    }
                    session = sessions.recv() => {
                        let Some(session) = session else {
                            tracing::debug!("backend stopped producing sessions");
                            return;
                        };
                        let Some(inner) = weak.upgrade() else { return };
                        let link_task =
                            tokio::spawn(link::run_link(inner.clone(), session, options.clone()));
                        inner.track(link_task);
                    }
                }
            }
        });
        self.inner.track(task);
        Ok(())
    }

    /// Append a rule after the configured ones.
    pub fn add_firewall_rule(&self, rule: impl FirewallRule + 'static) {
        self.inner.firewall.write().push(rule);
    }

    /// Append every rule of `rules`, in order.
    pub fn add_firewall_rules(&self, rules: &Firewall) {
        self.inner.firewall.write().extend(rules);
    }

    /// Bind a datagram endpoint. An empty name picks a random free one.
    pub fn listen_packet(&self, service: &str) -> Result<PacketConn, NetError> {
        self.inner.bind_packet_conn(service)
    }

    /// Bind a datagram endpoint and advertise it to the mesh.
    pub fn listen_packet_and_advertise(
        &self,
        service: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<PacketConn, NetError> {
        let pc = self.inner.bind_packet_conn(service)?;
        pc.advertise(ConnType::Datagram, tags);
        Ok(pc)
    }

    /// Send one datagram from `from_service` on this node.
    pub async fn send_message(
        &self,
        from_service: &str,
        to: &Addr,
        data: impl Into<Bytes>,
    ) -> Result<(), NetError> {
        self.inner
            .send_message(from_service, to, self.inner.config.max_forwarding_hops, data.into())
            .await
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.inner.routing.borrow().clone()
    }

    /// Receiver that sees every routing table recompute.
    pub fn subscribe_routing_updates(&self) -> watch::Receiver<Arc<RoutingTable>> {
        self.inner.routing.subscribe()
    }

    /// Latest advertisement of `service` by `node`.
    pub fn get_service_info(&self, node: &str, service: &str) -> Option<ServiceAdvertisement> {
        if node == self.inner.id {
            return self
                .inner
                .ads
                .local_ads(&self.inner.id, unix_millis())
                .into_iter()
                .find(|ad| ad.service == service);
        }
        self.inner.ads.get(node, service)
    }

    pub fn status(&self) -> Status {
        let inner = &self.inner;
        let mut connections: Vec<_> = inner
            .links
            .read()
            .iter()
            .map(|(node_id, link)| ConnectionStatus {
                node_id: node_id.clone(),
                cost: link.cost,
            })
            .collect();
        connections.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let mut advertisements = inner.ads.local_ads(&inner.id, unix_millis());
        advertisements.extend(inner.ads.remote_ads());
        Status {
            node_id: inner.id.clone(),
            connections,
            routing_table: (**inner.routing.borrow()).clone(),
            advertisements,
            known_connection_costs: inner.known.read().graph.snapshot(),
        }
    }

    /// Signal every task of this node to stop.
    pub fn shutdown(&self) {
        if !self.inner.shutdown_tx.send_replace(true) {
            tracing::info!(node = %self.inner.id, "node shutting down");
        }
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.inner.shutdown_signal()
    }

    /// Wait until every task of this node has finished.
    pub async fn wait(&self) {
        loop {
            let pending = std::mem::take(&mut *self.inner.tasks.lock());
            if pending.is_empty() {
                return;
            }
            for task in pending {
                let _ = task.await;
            }
        }
    }
}

fn spawn_ticker(
    inner: &Arc<NodeInner>,
    requests: TickReceiver,
    period: Duration,
    action: fn(&Arc<NodeInner>),
) {
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(tick::run(requests, period, inner.shutdown_signal(), move || {
        match weak.upgrade() {
            Some(inner) => {
                action(&inner);
                true
            }
            None => false,
        }
    }));
    inner.track(task);
}

async fn housekeeping(weak: Weak<NodeInner>, mut shutdown: Shutdown, idle: Duration) {
    let scan = (idle / 4).clamp(Duration::from_millis(50), Duration::from_secs(5));
    let mut aging = tokio::time::interval(scan);
    let mut sweep = tokio::time::interval(SEEN_UPDATE_SWEEP);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("housekeeping shutting down");
                return;
            }
            _ = aging.tick() => {
                let Some(inner) = weak.upgrade() else { return };
                inner.expire_idle_links(idle);
            }
            _ = sweep.tick() => {
                let Some(inner) = weak.upgrade() else { return };
                inner.sweep_seen_updates();
            }
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

impl NodeInner {
    pub(crate) fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.shutdown_tx.subscribe())
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn expire_idle_links(&self, idle: Duration) {
        for (remote, link) in self.links.read().iter() {
            let silent = link.last_received.lock().elapsed();
            if silent > idle {
                tracing::warn!(
                    remote = %remote,
                    silent_ms = silent.as_millis() as u64,
                    "link idle, dropping"
                );
                let _ = link.kill_tx.try_send(LinkError::Idle(silent));
            }
        }
    }

    fn sweep_seen_updates(&self) {
        let before = self.seen_updates.len();
        self.seen_updates
            .retain(|_, seen| seen.elapsed() < SEEN_UPDATE_RETENTION);
        let swept = before.saturating_sub(self.seen_updates.len());
        if swept > 0 {
            tracing::trace!(swept, "forgot old routing update ids");
        }
    }

    // ── Routing updates ───────────────────────────────────────────────────────

    pub(crate) fn make_routing_update(&self) -> RoutingUpdate {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let connections = self
            .links
            .read()
            .iter()
            .map(|(node, link)| (node.clone(), link.cost))
            .collect();
        RoutingUpdate {
            node_id: self.id.clone(),
            update_id: hex::encode(rand::random::<[u8; 8]>()),
            update_epoch: self.epoch,
            update_sequence: sequence,
            connections,
            forwarding_node: self.id.clone(),
        }
    }

    fn flood_own_update(&self) {
        let update = self.make_routing_update();
        tracing::trace!(
            seq = update.update_sequence,
            connections = update.connections.len(),
            "flooding routing update"
        );
        self.flood(&Frame::Route(update), None);
    }

    /// Queue `frame` on every link except `except`.
    pub(crate) fn flood(&self, frame: &Frame, except: Option<&str>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode flood frame");
                return;
            }
        };
        let targets: Vec<_> = self
            .links
            .read()
            .iter()
            .filter(|(node, _)| Some(node.as_str()) != except)
            .map(|(node, link)| (node.clone(), link.write_tx.clone()))
            .collect();
        for (node, tx) in targets {
            let frame = bytes.clone();
            tokio::spawn(async move {
                if tx.send(frame).await.is_err() {
                    tracing::trace!(remote = %node, "flood target link closed");
                }
            });
        }
    }

    /// Apply a routing update received over the link to `received_from`.
    pub(crate) fn handle_routing_update(&self, update: RoutingUpdate, received_from: &str) {
        if update.node_id.is_empty() || update.node_id == self.id {
            return;
        }
        match self.seen_updates.entry(update.update_id.clone()) {
            Entry::Occupied(_) => {
                tracing::trace!(update_id = %update.update_id, "duplicate routing update");
                return;
            }
            Entry::Vacant(v) => {
                v.insert(Instant::now());
            }
        }

        self.names.register(&update.node_id);
        for neighbor in update.connections.keys() {
            self.names.register(neighbor);
        }

        let (known_before, changed) = {
            let mut known = self.known.write();
            let prior = known.node_info.get(&update.node_id).copied();
            let last = prior.unwrap_or_default();
            if (update.update_epoch, update.update_sequence) <= (last.epoch, last.sequence) {
                tracing::trace!(
                    node = %update.node_id,
                    seq = update.update_sequence,
                    "stale routing update"
                );
                return;
            }
            known.node_info.insert(
                update.node_id.clone(),
                NodeInfo {
                    epoch: update.update_epoch,
                    sequence: update.update_sequence,
                },
            );
            let changed =
                known
                    .graph
                    .replace_node(&update.node_id, update.connections.clone(), &self.id);
            (prior.is_some(), changed)
        };

        if !known_before {
            tracing::info!(node = %update.node_id, "discovered node");
            self.route_flood.request(Duration::ZERO);
        }
        if changed {
            self.table_update.request(TABLE_UPDATE_DELAY);
        }
        tracing::debug!(
            node = %update.node_id,
            seq = update.update_sequence,
            via = %received_from,
            changed,
            "accepted routing update"
        );

        let mut forwarded = update;
        forwarded.forwarding_node = self.id.clone();
        self.flood(&Frame::Route(forwarded), Some(received_from));
    }

    pub(crate) fn update_routing_table(&self) {
        let (table, known_nodes) = {
            let known = self.known.read();
            let table = known.graph.routing_table(&self.id);
            let nodes: HashSet<String> = known.node_info.keys().cloned().collect();
            (table, nodes)
        };
        self.ads
            .prune(|node| table.contains_key(node) || !known_nodes.contains(node));
        tracing::debug!(routes = table.len(), "routing table updated");
        self.routing.send_replace(Arc::new(table));
    }

    // ── Advertisements ────────────────────────────────────────────────────────

    fn flood_advertisements(&self) {
        let now = unix_millis();
        for ad in self.ads.local_ads(&self.id, now) {
            self.flood(
                &Frame::ServiceAdvertisement(AdvertisementFrame { ad, cancel: false }),
                None,
            );
        }
    }

    pub(crate) fn handle_advertisement(&self, frame: AdvertisementFrame, received_from: &str) {
        if frame.ad.node_id == self.id {
            return;
        }
        if self.ads.merge(&frame) {
            tracing::debug!(
                node = %frame.ad.node_id,
                service = %frame.ad.service,
                cancel = frame.cancel,
                "advertisement updated"
            );
            self.flood(&Frame::ServiceAdvertisement(frame), Some(received_from));
        }
    }

    pub(crate) fn advertise(
        &self,
        service: &str,
        conn_type: ConnType,
        tags: BTreeMap<String, String>,
    ) {
        self.ads.add_local(service, conn_type, tags);
        self.ad_flood.request(AD_FLOOD_DELAY);
    }

    pub(crate) fn withdraw(&self, service: &str) {
        if let Some(ad) = self.ads.remove_local(&self.id, service, unix_millis()) {
            tracing::debug!(service, "withdrawing advertisement");
            self.flood(
                &Frame::ServiceAdvertisement(AdvertisementFrame { ad, cancel: true }),
                None,
            );
        }
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub(crate) async fn send_message(
        self: &Arc<Self>,
        from_service: &str,
        to: &Addr,
        hops_to_live: u8,
        data: Bytes,
    ) -> Result<(), NetError> {
        for service in [from_service, to.service.as_str()] {
            if service.len() > MAX_SERVICE_LEN {
                return Err(NetError::ServiceNameTooLong(service.to_string()));
            }
        }
        if from_service == PING_SERVICE || from_service == UNREACH_SERVICE {
            return Err(NetError::ReservedService(from_service.to_string()));
        }
        self.names.register(&to.node);
        let md = MessageData {
            from_node: self.id.clone(),
            from_service: from_service.to_string(),
            to_node: to.node.clone(),
            to_service: to.service.clone(),
            hops_to_live,
            data,
        };
        self.handle_message_data(md).await
    }

    /// Route one message: deliver it here or queue it on the next hop.
    pub(crate) async fn handle_message_data(
        self: &Arc<Self>,
        md: MessageData,
    ) -> Result<(), NetError> {
        match self.dispatch(md)? {
            Dispatch::Done => Ok(()),
            Dispatch::Forward { next_hop, tx, frame } => tx
                .send(frame)
                .await
                .map_err(|_| NetError::LinkClosed(next_hop)),
        }
    }

    /// Like `handle_message_data`, for engine-generated messages. Routing
    /// happens in its own task, so a reply never re-enters the dispatch
    /// that produced it.
    fn send_detached(self: &Arc<Self>, md: MessageData) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.handle_message_data(md).await {
                tracing::debug!(error = %e, "failed to send engine message");
            }
        });
    }

    fn dispatch(self: &Arc<Self>, md: MessageData) -> Result<Dispatch, NetError> {
        let action = self.firewall.read().evaluate(&md);
        match action {
            FirewallAction::Accept => {}
            FirewallAction::Drop => {
                tracing::trace!(
                    from = %md.from_node,
                    to = %md.to_node,
                    service = %md.to_service,
                    "firewall dropped message"
                );
                return Ok(Dispatch::Done);
            }
            FirewallAction::Reject => {
                tracing::debug!(
                    from = %md.from_node,
                    to = %md.to_node,
                    service = %md.to_service,
                    "firewall rejected message"
                );
                self.send_unreachable(&md, Problem::Rejected);
                return Ok(Dispatch::Done);
            }
        }

        if md.to_node == self.id {
            self.deliver_local(md)?;
            return Ok(Dispatch::Done);
        }
        self.forward(md)
    }

    fn deliver_local(self: &Arc<Self>, md: MessageData) -> Result<(), NetError> {
        match md.to_service.as_str() {
            PING_SERVICE if md.from_service == PING_SERVICE => {
                tracing::trace!(from = %md.from_node, "ignoring ping sent from a ping service");
                Ok(())
            }
            PING_SERVICE => {
                let reply = MessageData {
                    from_node: self.id.clone(),
                    from_service: PING_SERVICE.to_string(),
                    to_node: md.from_node,
                    to_service: md.from_service,
                    hops_to_live: self.config.max_forwarding_hops,
                    data: md.data,
                };
                self.send_detached(reply);
                Ok(())
            }
            UNREACH_SERVICE => {
                match serde_json::from_slice::<UnreachableMessage>(&md.data) {
                    Ok(message) => {
                        tracing::debug!(
                            reporter = %md.from_node,
                            problem = %message.problem,
                            to = %message.to_node,
                            "received unreachable notification"
                        );
                        let _ = self.unreachable_tx.send(UnreachableNotification {
                            message,
                            received_from_node: md.from_node,
                        });
                    }
                    Err(e) => tracing::debug!(
                        from = %md.from_node,
                        error = %e,
                        "malformed unreachable message"
                    ),
                }
                Ok(())
            }
            service => {
                let tx = self.listeners.get(service).map(|e| e.tx.clone());
                match tx {
                    Some(tx) => {
                        let datagram = Datagram {
                            from: Addr::new(md.from_node, md.from_service),
                            data: md.data,
                        };
                        if let Err(TrySendError::Full(_)) = tx.try_send(datagram) {
                            tracing::debug!(service, "listener queue full, dropping datagram");
                        }
                        Ok(())
                    }
                    None if md.from_node == self.id => {
                        Err(NetError::Unreachable(Problem::ServiceUnknown))
                    }
                    None => {
                        self.send_unreachable(&md, Problem::ServiceUnknown);
                        Ok(())
                    }
                }
            }
        }
    }

    fn forward(self: &Arc<Self>, mut md: MessageData) -> Result<Dispatch, NetError> {
        if md.hops_to_live == 0 {
            tracing::debug!(
                from = %md.from_node,
                to = %md.to_node,
                "message expired in transit"
            );
            self.send_unreachable(&md, Problem::ExpiredInTransit);
            return Ok(Dispatch::Done);
        }
        md.hops_to_live -= 1;

        let next_hop = self.routing.borrow().get(&md.to_node).cloned();
        let tx = next_hop
            .as_ref()
            .and_then(|hop| self.links.read().get(hop).map(|l| l.write_tx.clone()));
        let (Some(next_hop), Some(tx)) = (next_hop, tx) else {
            if md.from_node == self.id {
                return Err(NetError::NoRoute(md.to_node));
            }
            tracing::debug!(from = %md.from_node, to = %md.to_node, "no route for message");
            self.send_unreachable(&md, Problem::NoRoute);
            return Ok(Dispatch::Done);
        };

        tracing::trace!(
            to = %md.to_node,
            via = %next_hop,
            hops_left = md.hops_to_live,
            "forwarding message"
        );
        let frame = md.encode()?;
        Ok(Dispatch::Forward { next_hop, tx, frame })
    }

    /// Tell the sender of `about` that it failed. Never answers a message
    /// that was itself an unreachable notice.
    fn send_unreachable(self: &Arc<Self>, about: &MessageData, problem: Problem) {
        if about.from_service == UNREACH_SERVICE {
            return;
        }
        let payload = match serde_json::to_vec(&UnreachableMessage::about(about, problem)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode unreachable message");
                return;
            }
        };
        let md = MessageData {
            from_node: self.id.clone(),
            from_service: UNREACH_SERVICE.to_string(),
            to_node: about.from_node.clone(),
            to_service: UNREACH_SERVICE.to_string(),
            hops_to_live: self.config.max_forwarding_hops,
            data: Bytes::from(payload),
        };
        self.send_detached(md);
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
