//! Service advertisement table.
//!
//! Local advertisements are what this node floods on every ad tick.
//! Remote advertisements are kept per node and per service; a newer
//! timestamp replaces, a cancellation at least as new removes.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use strand_core::wire::{AdvertisementFrame, ConnType, ServiceAdvertisement};

#[derive(Debug, Clone)]
struct LocalAd {
    conn_type: ConnType,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct AdTable {
    local: DashMap<String, LocalAd>,
    remote: RwLock<HashMap<String, HashMap<String, ServiceAdvertisement>>>,
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl AdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local(&self, service: &str, conn_type: ConnType, tags: BTreeMap<String, String>) {
        self.local
            .insert(service.to_string(), LocalAd { conn_type, tags });
    }

    /// Remove a local advertisement, returning the cancellation to flood.
    pub fn remove_local(
        &self,
        node_id: &str,
        service: &str,
        now: u64,
    ) -> Option<ServiceAdvertisement> {
        self.local.remove(service).map(|(service, ad)| ServiceAdvertisement {
            node_id: node_id.to_string(),
            service,
            time: now,
            conn_type: ad.conn_type,
            tags: ad.tags,
        })
    }

    /// Current local advertisements, stamped with `now`.
    pub fn local_ads(&self, node_id: &str, now: u64) -> Vec<ServiceAdvertisement> {
        self.local
            .iter()
            .map(|e| ServiceAdvertisement {
                node_id: node_id.to_string(),
                service: e.key().clone(),
                time: now,
                conn_type: e.value().conn_type,
                tags: e.value().tags.clone(),
            })
            .collect()
    }

    /// Apply a received advertisement. Returns whether the table changed,
    /// which is also whether the frame should be reflooded.
    pub fn merge(&self, frame: &AdvertisementFrame) -> bool {
        let ad = &frame.ad;
        let mut remote = self.remote.write();
        let services = remote.entry(ad.node_id.clone()).or_default();
        let existing_time = services.get(&ad.service).map(|e| e.time);
        if frame.cancel {
            match existing_time {
                Some(t) if ad.time >= t => {
                    services.remove(&ad.service);
                    if services.is_empty() {
                        remote.remove(&ad.node_id);
                    }
                    true
                }
                _ => false,
            }
        } else {
            match existing_time {
                Some(t) if ad.time <= t => false,
                _ => {
                    services.insert(ad.service.clone(), ad.clone());
                    true
                }
            }
        }
    }

    /// Drop every remote advertisement whose node fails `keep`.
    pub fn prune(&self, keep: impl Fn(&str) -> bool) {
        self.remote.write().retain(|node, _| {
            let kept = keep(node);
            if !kept {
                tracing::debug!(node = %node, "dropping advertisements of unreachable node");
            }
            kept
        });
    }

    pub fn get(&self, node_id: &str, service: &str) -> Option<ServiceAdvertisement> {
        self.remote
            .read()
            .get(node_id)
            .and_then(|s| s.get(service))
            .cloned()
    }

    pub fn remote_ads(&self) -> Vec<ServiceAdvertisement> {
        let mut ads: Vec<_> = self
            .remote
            .read()
            .values()
            .flat_map(|s| s.values().cloned())
            .collect();
        ads.sort_by(|a, b| (&a.node_id, &a.service).cmp(&(&b.node_id, &b.service)));
        ads
    }
}
