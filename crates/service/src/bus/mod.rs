use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use ahash::AHashMap;
use codec::message::ClusteredMessage;
use parking_lot::RwLock;

pub type MessageHandler = Arc<dyn Fn(ClusteredMessage) + Send + Sync>;

pub struct RegistrationOutcome {
    pub id: u64,
    /// No handler existed for the address before this one.
    pub new_address: bool,
}

pub struct RemovalOutcome {
    pub found: bool,
    /// The removed handler was the last non-local, non-reply holder of
    /// the address.
    pub last: bool,
}

struct Registration {
    id: u64,
    local_only: bool,
    reply: bool,
    handler: MessageHandler,
}

impl Registration {
    /// Whether this handler participates in the cluster-wide registry.
    fn advertised(&self) -> bool {
        !self.local_only && !self.reply
    }
}

#[derive(Default)]
struct Handlers {
    list: Vec<Registration>,
    cursor: AtomicUsize,
}

/// The node-local dispatch table the clustered overlay federates.
///
/// Point-to-point delivery picks one handler round-robin, publish invokes
/// every handler. Reply registrations are one-shot and drop out of the
/// table on first delivery.
#[derive(Default)]
pub struct LocalBus {
    handlers: RwLock<AHashMap<String, Handlers>>,
    next_id: AtomicU64,
}

impl LocalBus {
    pub fn register(
        &self,
        address: &str,
        local_only: bool,
        reply: bool,
        handler: MessageHandler,
    ) -> RegistrationOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut handlers = self.handlers.write();
        let new_address = !handlers.contains_key(address);
        handlers
            .entry(address.to_string())
            .or_default()
            .list
            .push(Registration {
                id,
                local_only,
                reply,
                handler,
            });

        RegistrationOutcome { id, new_address }
    }

    pub fn unregister(&self, address: &str, id: u64) -> RemovalOutcome {
        let mut handlers = self.handlers.write();
        let Some(entry) = handlers.get_mut(address) else {
            return RemovalOutcome {
                found: false,
                last: false,
            };
        };

        let Some(index) = entry.list.iter().position(|it| it.id == id) else {
            return RemovalOutcome {
                found: false,
                last: false,
            };
        };

        let removed = entry.list.remove(index);
        let last = removed.advertised() && !entry.list.iter().any(|it| it.advertised());
        if entry.list.is_empty() {
            handlers.remove(address);
        }

        RemovalOutcome { found: true, last }
    }

    /// Deliver a message to the handlers registered at its address.
    ///
    /// Returns how many handlers were invoked; zero when nobody listens,
    /// in which case the message is silently discarded.
    pub fn dispatch(&self, message: &ClusteredMessage) -> usize {
        let mut consumed = Vec::new();
        let targets: Vec<MessageHandler> = {
            let handlers = self.handlers.read();
            let Some(entry) = handlers.get(&message.address) else {
                return 0;
            };

            if message.send {
                let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % entry.list.len();
                let target = &entry.list[index];
                if target.reply {
                    consumed.push(target.id);
                }

                vec![target.handler.clone()]
            } else {
                let mut targets = Vec::with_capacity(entry.list.len());
                for it in &entry.list {
                    if it.reply {
                        consumed.push(it.id);
                    }

                    targets.push(it.handler.clone());
                }

                targets
            }
        };

        for id in consumed {
            self.unregister(&message.address, id);
        }

        for target in &targets {
            target(message.clone());
        }

        targets.len()
    }

    /// Drop every registration. Part of node shutdown, the local bus
    /// stops before the transport does.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn handler_count(&self, address: &str) -> usize {
        self.handlers
            .read()
            .get(address)
            .map(|it| it.list.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use codec::{BodyCodec, NodeAddress};

    use super::*;

    fn message(address: &str, send: bool) -> ClusteredMessage {
        ClusteredMessage {
            sender: NodeAddress::new("127.0.0.1", 1000),
            address: address.to_string(),
            reply_address: None,
            headers: Vec::new(),
            codec: BodyCodec::Raw,
            body: Bytes::new(),
            send,
            from_wire: false,
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> MessageHandler {
        let counter = counter.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn send_picks_one_handler_publish_hits_all() {
        let bus = LocalBus::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(bus.register("svc", false, false, counting(&first)).new_address);
        assert!(!bus.register("svc", false, false, counting(&second)).new_address);

        for _ in 0..4 {
            assert_eq!(bus.dispatch(&message("svc", true)), 1);
        }

        // Round-robin across the two registrations.
        assert_eq!(first.load(Ordering::Relaxed), 2);
        assert_eq!(second.load(Ordering::Relaxed), 2);

        assert_eq!(bus.dispatch(&message("svc", false)), 2);
        assert_eq!(bus.dispatch(&message("nowhere", false)), 0);
    }

    #[test]
    fn reply_registrations_are_one_shot() {
        let bus = LocalBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.register("reply-token", false, true, counting(&hits));
        assert_eq!(bus.dispatch(&message("reply-token", true)), 1);
        assert_eq!(bus.dispatch(&message("reply-token", true)), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn last_advertised_holder_is_reported() {
        let bus = LocalBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let normal = bus.register("svc", false, false, counting(&hits)).id;
        let local = bus.register("svc", true, false, counting(&hits)).id;

        let outcome = bus.unregister("svc", normal);
        assert!(outcome.found && outcome.last);

        // The local-only handler never advertised, so its removal is not
        // a registry withdrawal either.
        let outcome = bus.unregister("svc", local);
        assert!(outcome.found && !outcome.last);

        let outcome = bus.unregister("svc", local);
        assert!(!outcome.found);
    }
}
