pub mod bus;
pub mod cluster;
pub mod registry;
pub mod routing;

use std::sync::Arc;

use codec::{NodeAddress, message::ClusteredMessage};

use self::{
    bus::LocalBus,
    cluster::AsyncMultiMap,
    registry::SubscriptionRegistry,
    routing::{RouteOutcome, Router},
};

#[derive(Debug)]
pub enum Error {
    /// A registration was withdrawn that the replicated registry had no
    /// entry for. Surfaced to the caller as a registration-symmetry
    /// signal.
    SubNotFound,
    Cluster(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Event sink of the clustered bus core.
///
/// The transport owner implements this to observe registrations, routing
/// decisions and membership changes, typically for logging and metrics.
pub trait ServiceHandler: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn on_registered(&self, address: &str, new_address: bool) {}

    #[allow(unused_variables)]
    fn on_unregistered(&self, address: &str, last: bool) {}

    /// A user-submitted message left the router. `local` and `remote`
    /// describe where it was dispatched; a publish may set both.
    #[allow(unused_variables)]
    fn on_message_sent(&self, address: &str, publish: bool, local: bool, remote: bool) {}

    #[allow(unused_variables)]
    fn on_message_received(&self, address: &str, from_wire: bool) {}

    /// The registry lookup failed and the message was discarded.
    #[allow(unused_variables)]
    fn on_message_dropped(&self, address: &str) {}

    #[allow(unused_variables)]
    fn on_node_crashed(&self, node: &NodeAddress) {}
}

pub struct ServiceOptions<T> {
    /// The public address this node advertises to its peers.
    pub node: NodeAddress,
    pub handler: T,
}

/// The clustered overlay core: local bus, subscription registry client and
/// router, bound to one node identity. I/O free, the owner executes the
/// routing outcomes it returns.
pub struct Service<T> {
    node: NodeAddress,
    bus: LocalBus,
    registry: Arc<SubscriptionRegistry>,
    router: Router,
    handler: T,
}

impl<T> Service<T>
where
    T: ServiceHandler,
{
    /// Create the service over an already-acquired replicated
    /// subscription map.
    pub fn new(options: ServiceOptions<T>, subs: Arc<dyn AsyncMultiMap>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(options.node.clone(), subs));

        Self {
            router: Router::new(options.node.clone(), registry.clone()),
            handler: options.handler,
            node: options.node,
            bus: LocalBus::default(),
            registry,
        }
    }

    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Register a handler and, when it is the first non-reply, non-local
    /// handler for the address, advertise the address cluster-wide.
    ///
    /// A failed advertisement rolls the local registration back.
    pub async fn register(
        &self,
        address: &str,
        local_only: bool,
        reply: bool,
        handler: bus::MessageHandler,
    ) -> Result<u64, Error> {
        let outcome = self.bus.register(address, local_only, reply, handler);

        if let Err(e) = self
            .registry
            .add_registration(address, outcome.new_address, reply, local_only)
            .await
        {
            self.bus.unregister(address, outcome.id);
            return Err(e);
        }

        self.handler.on_registered(address, outcome.new_address);
        Ok(outcome.id)
    }

    /// Remove a handler, withdrawing the cluster-wide advertisement when
    /// it was the last non-local holder of the address.
    pub async fn unregister(&self, address: &str, id: u64) -> Result<(), Error> {
        let outcome = self.bus.unregister(address, id);
        if !outcome.found {
            return Err(Error::SubNotFound);
        }

        self.registry
            .remove_registration(address, outcome.last)
            .await?;

        self.handler.on_unregistered(address, outcome.last);
        Ok(())
    }

    /// Decide where an outgoing message goes and account for it.
    pub async fn route(&self, message: &ClusteredMessage) -> RouteOutcome {
        let outcome = self.router.route(message).await;

        let publish = !message.send;
        match &outcome {
            RouteOutcome::Local => {
                self.handler
                    .on_message_sent(&message.address, publish, true, false)
            }
            RouteOutcome::Remote { local, .. } => {
                self.handler
                    .on_message_sent(&message.address, publish, *local, true)
            }
            RouteOutcome::Drop => self.handler.on_message_dropped(&message.address),
        }

        outcome
    }

    /// Replies bypass the registry, the target is the original sender.
    pub fn route_reply(&self, target: &NodeAddress) -> RouteOutcome {
        self.router.route_reply(target)
    }

    /// Hand a message to the local bus. Both locally routed messages and
    /// wire arrivals end up here.
    pub fn deliver_local(&self, message: &ClusteredMessage) -> usize {
        self.handler
            .on_message_received(&message.address, message.from_wire);

        self.bus.dispatch(message)
    }

    /// Drop every registry entry owned by a crashed peer.
    pub async fn node_crashed(&self, peer: &NodeAddress) {
        self.registry.node_crashed(peer).await;
        self.handler.on_node_crashed(peer);
    }
}
