use std::sync::{Arc, Mutex};

use anyhow::Result;
use bus_server_service::{
    Error, Service, ServiceHandler, ServiceOptions,
    cluster::{ClusterManager, MemoryCluster, SUBS_MAP_NAME},
    routing::RouteOutcome,
};
use bytes::Bytes;
use codec::{BodyCodec, NodeAddress, message::ClusteredMessage};
use pollster::block_on;

#[derive(Default, Clone)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.0.lock().unwrap())
    }
}

impl ServiceHandler for Events {
    fn on_registered(&self, address: &str, new_address: bool) {
        self.0
            .lock()
            .unwrap()
            .push(format!("registered {address} {new_address}"));
    }

    fn on_unregistered(&self, address: &str, last: bool) {
        self.0
            .lock()
            .unwrap()
            .push(format!("unregistered {address} {last}"));
    }

    fn on_message_sent(&self, address: &str, publish: bool, local: bool, remote: bool) {
        self.0
            .lock()
            .unwrap()
            .push(format!("sent {address} {publish} {local} {remote}"));
    }
}

fn service(events: Events) -> Service<Events> {
    let cluster = MemoryCluster::new();
    let subs = block_on(cluster.multi_map(SUBS_MAP_NAME)).unwrap();

    Service::new(
        ServiceOptions {
            node: NodeAddress::new("127.0.0.1", 1000),
            handler: events,
        },
        subs,
    )
}

fn message(address: &str, send: bool) -> ClusteredMessage {
    ClusteredMessage {
        sender: NodeAddress::new("127.0.0.1", 1000),
        address: address.to_string(),
        reply_address: None,
        headers: Vec::new(),
        codec: BodyCodec::Text,
        body: Bytes::from_static(b"payload"),
        send,
        from_wire: false,
    }
}

#[test]
fn registration_advertises_and_withdraws() -> Result<()> {
    let events = Events::default();
    let service = service(events.clone());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let id = {
        let delivered = delivered.clone();
        block_on(service.register(
            "svc",
            false,
            false,
            Arc::new(move |message| delivered.lock().unwrap().push(message)),
        ))?
    };

    assert_eq!(events.take(), vec!["registered svc true"]);

    // The only subscriber is this node, so routing stays local and the
    // bus delivers to the handler.
    assert_eq!(block_on(service.route(&message("svc", true))), RouteOutcome::Local);
    assert_eq!(service.deliver_local(&message("svc", true)), 1);
    assert_eq!(delivered.lock().unwrap().len(), 1);

    block_on(service.unregister("svc", id))?;
    assert_eq!(
        events.take(),
        vec!["sent svc false true false", "unregistered svc true"]
    );

    assert!(matches!(
        block_on(service.unregister("svc", id)),
        Err(Error::SubNotFound)
    ));

    Ok(())
}

#[test]
fn reply_consumers_never_reach_the_registry() -> Result<()> {
    let service = service(Events::default());

    block_on(service.register("reply-token", false, true, Arc::new(|_| {})))?;
    assert!(block_on(service.registry().lookup("reply-token"))?.is_empty());

    // Reply routing never consults the registry at all.
    let peer = NodeAddress::new("10.0.0.2", 1001);
    assert_eq!(
        service.route_reply(&peer),
        RouteOutcome::Remote {
            targets: vec![peer],
            local: false,
        }
    );

    Ok(())
}
