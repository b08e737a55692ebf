use codec::NodeAddress;
use service::ServiceHandler;

use crate::statistics::{Statistics, Stats};

/// Event sink of the node: turns the service-level events into log lines
/// and statistics.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl ServiceHandler for Observer {
    fn on_registered(&self, address: &str, new_address: bool) {
        log::info!("handler registered: address={address:?}, first={new_address}");

        if new_address {
            self.statistics.register(address);
        }
    }

    fn on_unregistered(&self, address: &str, last: bool) {
        log::info!("handler unregistered: address={address:?}, last={last}");

        if last {
            self.statistics.unregister(address);
        }
    }

    fn on_message_sent(&self, address: &str, publish: bool, local: bool, remote: bool) {
        log::debug!(
            "message sent: address={address:?}, publish={publish}, local={local}, remote={remote}"
        );

        let mut reports = Vec::with_capacity(2);
        if local {
            reports.push(if publish {
                Stats::PublishLocal(1)
            } else {
                Stats::SendLocal(1)
            });
        }

        if remote {
            reports.push(if publish {
                Stats::PublishRemote(1)
            } else {
                Stats::SendRemote(1)
            });
        }

        self.statistics.add(address, &reports);
    }

    fn on_message_received(&self, address: &str, from_wire: bool) {
        log::debug!("message received: address={address:?}, from_wire={from_wire}");

        self.statistics.add(
            address,
            &[if from_wire {
                Stats::ReceivedWire(1)
            } else {
                Stats::Received(1)
            }],
        );
    }

    fn on_message_dropped(&self, address: &str) {
        log::warn!("message dropped: address={address:?}");

        self.statistics.add(address, &[Stats::Dropped(1)]);
    }

    fn on_node_crashed(&self, node: &NodeAddress) {
        log::warn!("cluster node crashed: node={node}");
    }
}
