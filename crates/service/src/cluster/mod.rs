use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use codec::NodeAddress;
use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::Error;

/// Name of the replicated multi-map holding the subscription registry.
pub const SUBS_MAP_NAME: &str = "__vertx.subs";

/// Key of the node identity entry in a node's HA metadata.
pub const HA_SERVER_ID_KEY: &str = "server_id";

/// Build the HA metadata a node publishes at startup: the public address
/// under the `server_id` key, as `{"host", "port"}`.
pub fn node_info(node: &NodeAddress) -> Value {
    json!({ "server_id": node })
}

/// Reconstruct a peer's NodeAddress from its HA metadata.
pub fn server_id(info: &Value) -> Option<NodeAddress> {
    serde_json::from_value(info.get(HA_SERVER_ID_KEY)?.clone()).ok()
}

/// A replicated key to set-of-nodes store owned by the cluster service.
///
/// All access is asynchronous; implementations are expected to resolve
/// membership conflicts themselves. `remove` reports whether an entry was
/// found, which the registry client turns into its registration-symmetry
/// signal.
#[async_trait]
pub trait AsyncMultiMap: Send + Sync {
    async fn add(&self, key: &str, value: NodeAddress) -> Result<(), Error>;
    async fn remove(&self, key: &str, value: &NodeAddress) -> Result<bool, Error>;
    async fn remove_all_for_value(&self, value: &NodeAddress) -> Result<(), Error>;
    async fn get(&self, key: &str) -> Result<Vec<NodeAddress>, Error>;
}

pub type CrashHandler = Box<dyn Fn(&Value) + Send + Sync>;

/// The cluster membership service a node runs against.
#[async_trait]
pub trait ClusterManager: Send + Sync + 'static {
    /// Acquire a named replicated multi-map.
    async fn multi_map(&self, name: &str) -> Result<Arc<dyn AsyncMultiMap>, Error>;

    /// Publish this node's HA metadata.
    async fn publish_node_info(&self, info: Value) -> Result<(), Error>;

    /// Install a handler fired with the HA metadata of a crashed node.
    fn on_node_crashed(&self, handler: CrashHandler);
}

/// In-process cluster backing: every node joined to the same instance
/// shares its maps and membership events. Backs single-process clusters
/// and the end-to-end tests.
#[derive(Default)]
pub struct MemoryCluster {
    maps: RwLock<AHashMap<String, Arc<MemoryMultiMap>>>,
    nodes: RwLock<Vec<Value>>,
    crash_handlers: RwLock<Vec<CrashHandler>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire the node-crashed event for a member, as the HA manager would
    /// after losing contact with it.
    pub fn simulate_crash(&self, info: &Value) {
        self.nodes.write().retain(|it| it != info);

        for handler in self.crash_handlers.read().iter() {
            handler(info);
        }
    }
}

#[async_trait]
impl ClusterManager for MemoryCluster {
    async fn multi_map(&self, name: &str) -> Result<Arc<dyn AsyncMultiMap>, Error> {
        Ok(self
            .maps
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryMultiMap::default()))
            .clone())
    }

    async fn publish_node_info(&self, info: Value) -> Result<(), Error> {
        self.nodes.write().push(info);
        Ok(())
    }

    fn on_node_crashed(&self, handler: CrashHandler) {
        self.crash_handlers.write().push(handler);
    }
}

#[derive(Default)]
pub struct MemoryMultiMap {
    entries: RwLock<AHashMap<String, Vec<NodeAddress>>>,
}

#[async_trait]
impl AsyncMultiMap for MemoryMultiMap {
    async fn add(&self, key: &str, value: NodeAddress) -> Result<(), Error> {
        let mut entries = self.entries.write();
        let nodes = entries.entry(key.to_string()).or_default();
        if !nodes.contains(&value) {
            nodes.push(value);
        }

        Ok(())
    }

    async fn remove(&self, key: &str, value: &NodeAddress) -> Result<bool, Error> {
        let mut entries = self.entries.write();
        let Some(nodes) = entries.get_mut(key) else {
            return Ok(false);
        };

        let Some(index) = nodes.iter().position(|it| it == value) else {
            return Ok(false);
        };

        nodes.remove(index);
        if nodes.is_empty() {
            entries.remove(key);
        }

        Ok(true)
    }

    async fn remove_all_for_value(&self, value: &NodeAddress) -> Result<(), Error> {
        let mut entries = self.entries.write();
        for nodes in entries.values_mut() {
            nodes.retain(|it| it != value);
        }

        entries.retain(|_, nodes| !nodes.is_empty());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<NodeAddress>, Error> {
        Ok(self.entries.read().get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_round_trip() {
        let node = NodeAddress::new("ext.example", 54321);
        assert_eq!(server_id(&node_info(&node)), Some(node));
        assert_eq!(server_id(&json!({})), None);
    }

    #[test]
    fn crash_removes_every_entry_for_the_peer() {
        let cluster = MemoryCluster::new();
        let map = pollster::block_on(cluster.multi_map(SUBS_MAP_NAME)).unwrap();

        let a = NodeAddress::new("a", 1000);
        let b = NodeAddress::new("b", 1001);

        pollster::block_on(map.add("svc", a.clone())).unwrap();
        pollster::block_on(map.add("svc", b.clone())).unwrap();
        pollster::block_on(map.add("topic", b.clone())).unwrap();

        {
            let map = map.clone();
            let b = b.clone();
            cluster.on_node_crashed(Box::new(move |info| {
                assert_eq!(server_id(info).as_ref(), Some(&b));
                pollster::block_on(map.remove_all_for_value(&b)).unwrap();
            }));
        }

        cluster.simulate_crash(&node_info(&b));

        assert_eq!(pollster::block_on(map.get("svc")).unwrap(), vec![a]);
        assert!(pollster::block_on(map.get("topic")).unwrap().is_empty());
    }
}
