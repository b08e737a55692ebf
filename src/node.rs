use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use codec::{BodyCodec, NodeAddress, framing::frame, message::ClusteredMessage};
use parking_lot::Mutex;
use service::{
    Service, ServiceHandler, ServiceOptions,
    cluster::{self, ClusterManager, SUBS_MAP_NAME},
    routing::{self, RouteOutcome},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    config::Config,
    server::{
        self,
        connection::{ConnectionOptions, Connections},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
}

enum SendContext {
    Route(ClusteredMessage),
    /// Replies carry their target explicitly, the registry is not
    /// consulted for them.
    Reply {
        message: ClusteredMessage,
        target: NodeAddress,
    },
}

/// A handler registration. Dropping it does nothing; `unregister`
/// withdraws the cluster-wide advertisement when this was the last
/// non-local holder of the address.
pub struct Consumer<T> {
    service: Arc<Service<T>>,
    address: String,
    id: u64,
}

impl<T> Consumer<T>
where
    T: ServiceHandler,
{
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn unregister(self) -> Result<()> {
        self.service.unregister(&self.address, self.id).await?;
        Ok(())
    }
}

/// One member of the clustered event bus.
///
/// Owns the peer server, the outbound connection fabric and the sentinel
/// dispatcher that serialises every outgoing message, preserving
/// per-source submission order across the asynchronous registry lookup.
pub struct Node<T> {
    id: NodeAddress,
    state: Arc<Mutex<NodeState>>,
    service: Arc<Service<T>>,
    connections: Connections,
    server: server::Server,
    dispatcher: JoinHandle<()>,
    sender: mpsc::UnboundedSender<SendContext>,
}

impl<T> Node<T>
where
    T: ServiceHandler,
{
    /// Start a node: acquire the replicated subscription map, bind the
    /// peer server, resolve and announce the public address, install the
    /// crash handler. Any step's failure fails the startup with its
    /// cause.
    pub async fn start(
        config: &Config,
        cluster_manager: Arc<dyn ClusterManager>,
        handler: T,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(NodeState::Init));
        *state.lock() = NodeState::Starting;

        let subs = cluster_manager.multi_map(SUBS_MAP_NAME).await?;
        let (listener, local_addr) = server::bind(&config.cluster.listen()).await?;

        let id = config.cluster.public_address(local_addr.port());
        let service = Arc::new(Service::new(
            ServiceOptions {
                node: id.clone(),
                handler,
            },
            subs,
        ));

        let server = server::serve(listener, local_addr, service.clone());

        let connections = Connections::new(
            id.clone(),
            ConnectionOptions {
                ping_interval: Duration::from_secs(config.cluster.ping_interval),
                connect_timeout: Duration::from_secs(config.cluster.connect_timeout),
                max_pending: config.cluster.max_pending,
            },
        );

        cluster_manager
            .publish_node_info(cluster::node_info(&id))
            .await?;

        {
            let service = service.clone();
            let connections = connections.clone();
            let runtime = tokio::runtime::Handle::current();

            cluster_manager.on_node_crashed(Box::new(move |info| {
                let Some(peer) = cluster::server_id(info) else {
                    log::warn!("crashed node has no server id: info={info}");
                    return;
                };

                let service = service.clone();
                let connections = connections.clone();
                runtime.spawn(async move {
                    connections.close(&peer);
                    service.node_crashed(&peer).await;
                });
            }));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(
            service.clone(),
            connections.clone(),
            receiver,
        ));

        *state.lock() = NodeState::Running;
        log::info!("cluster node running: node={id}, listen={local_addr}");

        Ok(Self {
            id,
            state,
            service,
            connections,
            server,
            dispatcher,
            sender,
        })
    }

    /// The public address this node advertises, resolved at startup.
    pub fn id(&self) -> &NodeAddress {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Number of live outbound peer connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register a handler visible to the whole cluster.
    pub async fn consumer<F>(&self, address: &str, handler: F) -> Result<Consumer<T>>
    where
        F: Fn(ClusteredMessage) + Send + Sync + 'static,
    {
        self.register(address, false, handler).await
    }

    /// Register a handler that only ever receives node-local traffic.
    pub async fn local_consumer<F>(&self, address: &str, handler: F) -> Result<Consumer<T>>
    where
        F: Fn(ClusteredMessage) + Send + Sync + 'static,
    {
        self.register(address, true, handler).await
    }

    async fn register<F>(&self, address: &str, local_only: bool, handler: F) -> Result<Consumer<T>>
    where
        F: Fn(ClusteredMessage) + Send + Sync + 'static,
    {
        self.ensure_running()?;

        let id = self
            .service
            .register(address, local_only, false, Arc::new(handler))
            .await?;

        Ok(Consumer {
            service: self.service.clone(),
            address: address.to_string(),
            id,
        })
    }

    /// Point-to-point: delivered to exactly one handler registered for
    /// the address anywhere in the cluster.
    pub fn send(&self, address: &str, codec: BodyCodec, body: Bytes) -> Result<()> {
        self.submit(SendContext::Route(self.message(address, codec, body, true, None)))
    }

    /// Publish: delivered to every subscriber node once.
    pub fn publish(&self, address: &str, codec: BodyCodec, body: Bytes) -> Result<()> {
        self.submit(SendContext::Route(self.message(address, codec, body, false, None)))
    }

    /// Point-to-point send that waits for one reply.
    ///
    /// The reply handler lives at a fresh unguessable address that is
    /// never advertised and drops out after the first delivery. There is
    /// no intrinsic timeout, callers bound the wait themselves.
    pub async fn request(
        &self,
        address: &str,
        codec: BodyCodec,
        body: Bytes,
    ) -> Result<ClusteredMessage> {
        self.ensure_running()?;

        let reply_address = routing::reply_address();
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));

        self.service
            .register(
                &reply_address,
                false,
                true,
                Arc::new(move |message| {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(message);
                    }
                }),
            )
            .await?;

        self.submit(SendContext::Route(self.message(
            address,
            codec,
            body,
            true,
            Some(reply_address),
        )))?;

        rx.await.map_err(|_| anyhow!("reply channel closed"))
    }

    /// Answer a delivered message. Routed straight to the sender node,
    /// the registry is not consulted.
    pub fn reply(&self, to: &ClusteredMessage, codec: BodyCodec, body: Bytes) -> Result<()> {
        let Some(reply_address) = &to.reply_address else {
            bail!("message has no reply address");
        };

        self.submit(SendContext::Reply {
            message: self.message(reply_address, codec, body, true, None),
            target: to.sender.clone(),
        })
    }

    fn message(
        &self,
        address: &str,
        codec: BodyCodec,
        body: Bytes,
        send: bool,
        reply_address: Option<String>,
    ) -> ClusteredMessage {
        ClusteredMessage {
            sender: self.id.clone(),
            address: address.to_string(),
            reply_address,
            headers: Vec::new(),
            codec,
            body,
            send,
            from_wire: false,
        }
    }

    fn submit(&self, context: SendContext) -> Result<()> {
        self.ensure_running()?;

        self.sender
            .send(context)
            .map_err(|_| anyhow!("dispatcher is gone"))
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Running {
            bail!("node is not running: state={state:?}");
        }

        Ok(())
    }

    /// Stop the node: the local bus first, then the peer server, then
    /// every outbound connection.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != NodeState::Running {
                return Ok(());
            }

            *state = NodeState::Stopping;
        }

        self.service.bus().clear();
        self.server.close();
        self.dispatcher.abort();
        self.connections.close_all();

        *self.state.lock() = NodeState::Stopped;
        log::info!("cluster node stopped: node={}", self.id);

        Ok(())
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        self.server.close();
        self.dispatcher.abort();
    }
}

/// The sentinel dispatch loop.
///
/// Every outgoing message of the node passes through here one at a time,
/// so messages submitted in order towards one peer hit its write queue in
/// that order, even though the registry lookup in between suspends.
async fn dispatch_loop<T>(
    service: Arc<Service<T>>,
    connections: Connections,
    mut receiver: mpsc::UnboundedReceiver<SendContext>,
) where
    T: ServiceHandler,
{
    while let Some(context) = receiver.recv().await {
        match context {
            SendContext::Route(message) => match service.route(&message).await {
                RouteOutcome::Local => {
                    service.deliver_local(&message);
                }
                RouteOutcome::Remote { targets, local } => {
                    let record = frame(&message.encode());
                    for target in &targets {
                        connections.send(target, record.clone());
                    }

                    if local {
                        service.deliver_local(&message);
                    }
                }
                RouteOutcome::Drop => {}
            },
            SendContext::Reply { message, target } => match service.route_reply(&target) {
                RouteOutcome::Local => {
                    service.deliver_local(&message);
                }
                RouteOutcome::Remote { targets, .. } => {
                    let record = frame(&message.encode());
                    for target in &targets {
                        connections.send(target, record.clone());
                    }
                }
                RouteOutcome::Drop => {}
            },
        }
    }
}
