//! Datagram endpoints.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use strand_core::addr::{random_service_name, Addr, MAX_SERVICE_LEN};
use strand_core::wire::{ConnType, UnreachableMessage, RESERVED_SERVICES};

use crate::error::NetError;
use crate::node::{Datagram, ListenerEntry, NodeInner, LISTENER_QUEUE_DEPTH};

/// An unreachable report as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct UnreachableNotification {
    /// Describes the message that failed.
    pub message: UnreachableMessage,
    /// The node that gave up on it.
    pub received_from_node: String,
}

/// A bound `(node, service)` datagram endpoint.
///
/// Delivery is best effort: datagrams can be dropped by a full queue, a
/// firewall, or a missing route. Closing (or dropping) the endpoint frees
/// the service name and withdraws its advertisement.
pub struct PacketConn {
    inner: Arc<NodeInner>,
    service: String,
    reg_id: u64,
    rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    hops_to_live: AtomicU8,
    advertised: AtomicBool,
    closed: AtomicBool,
    read_deadline: Mutex<Option<Instant>>,
}

impl NodeInner {
    pub(crate) fn bind_packet_conn(
        self: &Arc<Self>,
        service: &str,
    ) -> Result<PacketConn, NetError> {
        if service.len() > MAX_SERVICE_LEN {
            return Err(NetError::ServiceNameTooLong(service.to_string()));
        }
        if RESERVED_SERVICES.contains(&service) {
            return Err(NetError::ReservedService(service.to_string()));
        }
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        let reg_id = self.next_id();
        let entry = ListenerEntry { reg_id, tx };

        let service = if service.is_empty() {
            loop {
                let candidate = random_service_name();
                if let Entry::Vacant(v) = self.listeners.entry(candidate.clone()) {
                    v.insert(entry);
                    break candidate;
                }
            }
        } else {
            match self.listeners.entry(service.to_string()) {
                Entry::Occupied(_) => return Err(NetError::ServiceInUse(service.to_string())),
                Entry::Vacant(v) => {
                    v.insert(entry);
                }
            }
            service.to_string()
        };
        tracing::debug!(service = %service, "packet conn bound");

        Ok(PacketConn {
            inner: self.clone(),
            service,
            reg_id,
            rx: tokio::sync::Mutex::new(rx),
            hops_to_live: AtomicU8::new(self.config.max_forwarding_hops),
            advertised: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_deadline: Mutex::new(None),
        })
    }
}

impl PacketConn {
    pub fn local_addr(&self) -> Addr {
        Addr::new(self.inner.id.clone(), self.service.clone())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receive the next datagram and its sender.
    pub async fn recv_from(&self) -> Result<(Bytes, Addr), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let mut shutdown = self.inner.shutdown_signal();
        let deadline = *self.read_deadline.lock();
        let mut rx = self.rx.lock().await;
        let next = async {
            tokio::select! {
                datagram = rx.recv() => datagram.ok_or(NetError::Closed),
                _ = shutdown.recv() => Err(NetError::ShuttingDown),
            }
        };
        let datagram = match deadline {
            Some(at) => tokio::time::timeout_at(at, next)
                .await
                .map_err(|_| NetError::Timeout)??,
            None => next.await?,
        };
        Ok((datagram.data, datagram.from))
    }

    /// Send one datagram to `to`.
    pub async fn send_to(&self, data: impl Into<Bytes>, to: &Addr) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        self.inner
            .send_message(&self.service, to, self.hops_to_live(), data.into())
            .await
    }

    pub fn hops_to_live(&self) -> u8 {
        self.hops_to_live.load(Ordering::Relaxed)
    }

    /// Hop budget stamped on datagrams sent from here.
    pub fn set_hops_to_live(&self, hops: u8) {
        self.hops_to_live.store(hops, Ordering::Relaxed);
    }

    /// `None` clears the deadline.
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        *self.read_deadline.lock() = at;
    }

    /// Unreachable reports about messages this endpoint sent.
    pub fn subscribe_unreachable(&self) -> UnreachableSubscription {
        UnreachableSubscription {
            rx: self.inner.unreachable_tx.subscribe(),
            node: self.inner.id.clone(),
            service: self.service.clone(),
        }
    }

    pub(crate) fn advertise(&self, conn_type: ConnType, tags: BTreeMap<String, String>) {
        self.advertised.store(true, Ordering::Release);
        self.inner.advertise(&self.service, conn_type, tags);
    }

    /// Release the service name. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .listeners
            .remove_if(&self.service, |_, entry| entry.reg_id == self.reg_id);
        if self.advertised.load(Ordering::Acquire) {
            self.inner.withdraw(&self.service);
        }
        tracing::debug!(service = %self.service, "packet conn closed");
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Unreachable reports filtered to one endpoint.
pub struct UnreachableSubscription {
    rx: broadcast::Receiver<UnreachableNotification>,
    node: String,
    service: String,
}

impl UnreachableSubscription {
    /// Next report about a message sent from this endpoint. `None` once the
    /// node is gone.
    pub async fn recv(&mut self) -> Option<UnreachableNotification> {
        loop {
            match self.rx.recv().await {
                Ok(n)
                    if n.message.from_node == self.node
                        && n.message.from_service == self.service =>
                {
                    return Some(n)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "unreachable subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use std::time::Duration;
    use strand_core::config::NodeConfig;

    fn node(id: &str) -> Node {
        Node::new(NodeConfig::with_id(id)).unwrap()
    }

    #[tokio::test]
    async fn service_name_rules() {
        let n = node("n");
        assert!(matches!(
            n.listen_packet("ninechars"),
            Err(NetError::ServiceNameTooLong(_))
        ));
        assert!(matches!(n.listen_packet("ping"), Err(NetError::ReservedService(_))));
        assert!(matches!(n.listen_packet("unreach"), Err(NetError::ReservedService(_))));
        let _held = n.listen_packet("eightchr").unwrap();
        assert!(matches!(n.listen_packet("eightchr"), Err(NetError::ServiceInUse(_))));
    }

    #[tokio::test]
    async fn ephemeral_names_are_unique() {
        let n = node("n");
        let a = n.listen_packet("").unwrap();
        let b = n.listen_packet("").unwrap();
        assert_eq!(a.service().len(), MAX_SERVICE_LEN);
        assert_ne!(a.service(), b.service());
    }

    #[tokio::test]
    async fn close_frees_the_name() {
        let n = node("n");
        let pc = n.listen_packet("svc").unwrap();
        pc.close();
        pc.close();
        assert!(pc.recv_from().await.is_err());
        assert!(pc.send_to(&b"x"[..], &Addr::new("n", "svc")).await.is_err());
        let again = n.listen_packet("svc").unwrap();
        drop(pc);
        // the old handle must not evict the new registration
        n.send_message("me", &Addr::new("n", "svc"), &b"still here"[..])
            .await
            .unwrap();
        let (data, _) = again.recv_from().await.unwrap();
        assert_eq!(&data[..], b"still here");
    }

    #[tokio::test]
    async fn read_deadline_times_out() {
        let n = node("n");
        let pc = n.listen_packet("slow").unwrap();
        pc.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        assert!(matches!(pc.recv_from().await, Err(NetError::Timeout)));
        pc.set_read_deadline(None);
    }

    #[tokio::test]
    async fn recv_stops_on_shutdown() {
        let n = node("n");
        let pc = n.listen_packet("svc").unwrap();
        let waiting = tokio::spawn(async move { pc.recv_from().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        n.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetError::ShuttingDown)));
    }

    #[tokio::test]
    async fn advertised_endpoint_is_visible_until_closed() {
        let n = node("n");
        let tags = BTreeMap::from([("role".to_string(), "test".to_string())]);
        let pc = n.listen_packet_and_advertise("adv", tags.clone()).unwrap();
        let ad = n.get_service_info("n", "adv").unwrap();
        assert_eq!(ad.conn_type, ConnType::Datagram);
        assert_eq!(ad.tags, tags);
        pc.close();
        assert!(n.get_service_info("n", "adv").is_none());
    }
}
