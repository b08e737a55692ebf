use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use codec::NodeAddress;
use parking_lot::RwLock;

use crate::{Error, cluster::AsyncMultiMap};

/// The subscriber set of one address, as seen at lookup time.
///
/// `choose` provides the fair selection point-to-point routing needs; the
/// cursor lives in the registry client, so fairness carries across
/// lookups of the same address.
pub struct Subscribers {
    nodes: Vec<NodeAddress>,
    cursor: Arc<AtomicUsize>,
}

impl Subscribers {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeAddress> {
        self.nodes.iter()
    }

    /// Round-robin over the current membership of the set.
    pub fn choose(&self) -> Option<&NodeAddress> {
        if self.nodes.is_empty() {
            return None;
        }

        Some(&self.nodes[self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len()])
    }
}

/// Thin adapter between handler registration and the replicated
/// subscription map.
///
/// Only the first non-reply, non-local handler of an address publishes an
/// entry; reply addresses are one-shot local tokens and local-only
/// handlers must never receive cross-node traffic.
pub struct SubscriptionRegistry {
    node: NodeAddress,
    subs: Arc<dyn AsyncMultiMap>,
    cursors: RwLock<AHashMap<String, Arc<AtomicUsize>>>,
}

impl SubscriptionRegistry {
    pub fn new(node: NodeAddress, subs: Arc<dyn AsyncMultiMap>) -> Self {
        Self {
            node,
            subs,
            cursors: RwLock::new(AHashMap::new()),
        }
    }

    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    pub async fn add_registration(
        &self,
        address: &str,
        new_address: bool,
        reply: bool,
        local_only: bool,
    ) -> Result<(), Error> {
        if new_address && !reply && !local_only {
            self.subs.add(address, self.node.clone()).await?;
        }

        Ok(())
    }

    pub async fn remove_registration(&self, address: &str, last: bool) -> Result<(), Error> {
        if !last {
            return Ok(());
        }

        if !self.subs.remove(address, &self.node).await? {
            return Err(Error::SubNotFound);
        }

        Ok(())
    }

    /// Cleanup after a crashed peer. Failures are logged, the crash path
    /// has nobody to report to.
    pub async fn node_crashed(&self, peer: &NodeAddress) {
        if let Err(e) = self.subs.remove_all_for_value(peer).await {
            log::warn!("subscription cleanup failed: peer={peer}, err={e}");
        }
    }

    pub async fn lookup(&self, address: &str) -> Result<Subscribers, Error> {
        let nodes = self.subs.get(address).await?;
        let cursor = self
            .cursors
            .write()
            .entry(address.to_string())
            .or_default()
            .clone();

        Ok(Subscribers { nodes, cursor })
    }
}
