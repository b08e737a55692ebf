pub mod config;
pub mod node;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use service::cluster::MemoryCluster;

use self::{config::Config, node::Node, observer::Observer, statistics::Statistics};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "bus-server.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests use the bus-server crate and
/// start a node directly, a function is opened to replace the main
/// function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();

    // A standalone process forms a cluster of one; joining an external
    // membership service is a matter of passing its ClusterManager to
    // Node::start instead.
    let node = Node::start(
        &config,
        MemoryCluster::new(),
        Observer::new(statistics.clone()),
    )
    .await?;

    log::info!("{} running: node={}", SOFTWARE, node.id());

    // The node is non-blocking after it runs and needs to be kept from
    // exiting immediately.
    std::future::pending::<()>().await;

    Ok(())
}
