use std::sync::Arc;

use codec::{NodeAddress, message::ClusteredMessage};

use crate::registry::SubscriptionRegistry;

/// Where an outgoing message goes. The transport owner executes this; the
/// router itself never touches a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Deliver on the local bus only. The bus discards the message when
    /// nobody listens.
    Local,
    /// Write to each target peer; deliver locally too when `local` is
    /// set. Targets never contain this node.
    Remote {
        targets: Vec<NodeAddress>,
        local: bool,
    },
    /// The lookup failed, the message is discarded.
    Drop,
}

/// Routing policy of the clustered bus.
pub struct Router {
    node: NodeAddress,
    registry: Arc<SubscriptionRegistry>,
}

impl Router {
    pub fn new(node: NodeAddress, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { node, registry }
    }

    /// Decide between local and remote dispatch for a user-submitted
    /// message.
    ///
    /// Point-to-point picks one subscriber node fairly and delivers
    /// either locally or remotely, never both. Publish fans out to every
    /// subscriber node once, with this node dispatched locally when it
    /// appears in the set. A message decoded from the wire is never
    /// clustered again.
    pub async fn route(&self, message: &ClusteredMessage) -> RouteOutcome {
        if message.from_wire {
            return RouteOutcome::Local;
        }

        let subscribers = match self.registry.lookup(&message.address).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                log::warn!(
                    "subscriber lookup failed: address={}, err={e}",
                    message.address
                );

                return RouteOutcome::Drop;
            }
        };

        // No remote subscribers: the local bus is the only destination.
        if subscribers.is_empty() {
            return RouteOutcome::Local;
        }

        if message.send {
            match subscribers.choose() {
                Some(target) if *target == self.node => RouteOutcome::Local,
                Some(target) => RouteOutcome::Remote {
                    targets: vec![target.clone()],
                    local: false,
                },
                None => RouteOutcome::Local,
            }
        } else {
            let mut local = false;
            let mut targets = Vec::with_capacity(subscribers.len());
            for target in subscribers.iter() {
                if *target == self.node {
                    local = true;
                } else {
                    targets.push(target.clone());
                }
            }

            if targets.is_empty() {
                RouteOutcome::Local
            } else {
                RouteOutcome::Remote { targets, local }
            }
        }
    }

    /// Reply routing: the target is the original sender's address carried
    /// on the message, the registry is not consulted. Reply addresses are
    /// one-shot tokens that were never advertised.
    pub fn route_reply(&self, target: &NodeAddress) -> RouteOutcome {
        if *target == self.node {
            RouteOutcome::Local
        } else {
            RouteOutcome::Remote {
                targets: vec![target.clone()],
                local: false,
            }
        }
    }
}

/// A fresh reply address: 128 bits from the system CSPRNG, hex encoded.
/// Unguessability is the only access control on replies.
pub fn reply_address() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use codec::BodyCodec;
    use pollster::block_on;

    use super::*;
    use crate::cluster::{AsyncMultiMap, MemoryMultiMap};

    fn setup() -> (Router, Arc<MemoryMultiMap>, NodeAddress) {
        let node = NodeAddress::new("10.0.0.1", 1000);
        let subs = Arc::new(MemoryMultiMap::default());
        let registry = Arc::new(SubscriptionRegistry::new(node.clone(), subs.clone()));

        (Router::new(node.clone(), registry), subs, node)
    }

    fn message(address: &str, send: bool, sender: &NodeAddress) -> ClusteredMessage {
        ClusteredMessage {
            sender: sender.clone(),
            address: address.to_string(),
            reply_address: None,
            headers: Vec::new(),
            codec: BodyCodec::Raw,
            body: Bytes::new(),
            send,
            from_wire: false,
        }
    }

    #[test]
    fn empty_subscriber_set_stays_local() {
        let (router, _, node) = setup();

        assert_eq!(
            block_on(router.route(&message("svc", true, &node))),
            RouteOutcome::Local
        );
    }

    #[test]
    fn wire_messages_are_never_clustered_again() {
        let (router, subs, node) = setup();
        block_on(subs.add("svc", NodeAddress::new("10.0.0.2", 1001))).unwrap();

        let mut message = message("svc", false, &node);
        message.from_wire = true;
        assert_eq!(block_on(router.route(&message)), RouteOutcome::Local);
    }

    #[test]
    fn point_to_point_alternates_between_self_and_peer() {
        let (router, subs, node) = setup();
        let peer = NodeAddress::new("10.0.0.2", 1001);

        block_on(subs.add("svc", node.clone())).unwrap();
        block_on(subs.add("svc", peer.clone())).unwrap();

        let mut locals = 0;
        let mut remotes = 0;
        for _ in 0..10 {
            match block_on(router.route(&message("svc", true, &node))) {
                RouteOutcome::Local => locals += 1,
                RouteOutcome::Remote { targets, local } => {
                    assert_eq!(targets, vec![peer.clone()]);
                    assert!(!local);
                    remotes += 1;
                }
                RouteOutcome::Drop => unreachable!(),
            }
        }

        assert_eq!(locals, 5);
        assert_eq!(remotes, 5);
    }

    #[test]
    fn publish_fans_out_once_per_node_with_self_local() {
        let (router, subs, node) = setup();
        let b = NodeAddress::new("10.0.0.2", 1001);
        let c = NodeAddress::new("10.0.0.3", 1002);

        block_on(subs.add("topic", node.clone())).unwrap();
        block_on(subs.add("topic", b.clone())).unwrap();
        block_on(subs.add("topic", c.clone())).unwrap();

        match block_on(router.route(&message("topic", false, &node))) {
            RouteOutcome::Remote { targets, local } => {
                assert!(local);
                assert_eq!(targets.len(), 2);
                assert!(targets.contains(&b) && targets.contains(&c));
                assert!(!targets.contains(&node));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // Subscriber set of `{self}` only: no wire traffic at all.
        block_on(subs.remove("topic", &b)).unwrap();
        block_on(subs.remove("topic", &c)).unwrap();
        assert_eq!(
            block_on(router.route(&message("topic", false, &node))),
            RouteOutcome::Local
        );
    }

    #[test]
    fn replies_bypass_the_registry() {
        let (router, _, node) = setup();
        let peer = NodeAddress::new("10.0.0.2", 1001);

        assert_eq!(router.route_reply(&node), RouteOutcome::Local);
        assert_eq!(
            router.route_reply(&peer),
            RouteOutcome::Remote {
                targets: vec![peer],
                local: false,
            }
        );
    }

    #[test]
    fn reply_addresses_are_distinct() {
        let first = reply_address();
        let second = reply_address();

        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }
}
