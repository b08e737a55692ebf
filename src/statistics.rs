use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed to the statistics table.
///
/// Sent messages are dimensioned by delivery side: a publish may count on
/// both sides, a point-to-point send on exactly one.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    SendLocal(usize),
    SendRemote(usize),
    PublishLocal(usize),
    PublishRemote(usize),
    Received(usize),
    ReceivedWire(usize),
    Dropped(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// One bucket of counters, either the totals or a watched address.
#[derive(Default, Debug, PartialEq)]
pub struct Counts<T> {
    pub send_local: T,
    pub send_remote: T,
    pub publish_local: T,
    pub publish_remote: T,
    pub received: T,
    pub received_wire: T,
    pub dropped: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use bus_server::statistics::*;
    ///
    /// let counts = Counts::<Count>::default();
    ///
    /// counts.add(&Stats::SendLocal(1));
    /// assert_eq!(counts.send_local.get(), 1);
    ///
    /// counts.add(&Stats::ReceivedWire(2));
    /// assert_eq!(counts.received_wire.get(), 2);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::SendLocal(v) => self.send_local.add(*v),
            Stats::SendRemote(v) => self.send_remote.add(*v),
            Stats::PublishLocal(v) => self.publish_local.add(*v),
            Stats::PublishRemote(v) => self.publish_remote.add(*v),
            Stats::Received(v) => self.received.add(*v),
            Stats::ReceivedWire(v) => self.received_wire.add(*v),
            Stats::Dropped(v) => self.dropped.add(*v),
        }
    }

    fn snapshot(&self) -> Counts<usize> {
        Counts {
            send_local: self.send_local.get(),
            send_remote: self.send_remote.get(),
            publish_local: self.publish_local.get(),
            publish_remote: self.publish_remote.get(),
            received: self.received.get(),
            received_wire: self.received_wire.get(),
            dropped: self.dropped.get(),
        }
    }
}

#[derive(Default)]
struct Inner {
    totals: Counts<Count>,
    table: RwLock<AHashMap<String, Counts<Count>>>,
}

/// Message statistics of one node.
///
/// Totals are always counted; per-address buckets exist only for
/// addresses placed on the watch list, which the observer does for every
/// address with a registered handler.
#[derive(Default, Clone)]
pub struct Statistics(Arc<Inner>);

impl Statistics {
    /// Add an address to the watch list.
    ///
    /// # Example
    ///
    /// ```
    /// use bus_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.register("orders.created");
    /// assert!(statistics.get("orders.created").is_some());
    /// ```
    pub fn register(&self, address: &str) {
        self.0
            .table
            .write()
            .insert(address.to_string(), Counts::default());
    }

    /// Remove an address from the watch list.
    pub fn unregister(&self, address: &str) {
        self.0.table.write().remove(address);
    }

    pub fn add(&self, address: &str, reports: &[Stats]) {
        for report in reports {
            self.0.totals.add(report);
        }

        if let Some(counts) = self.0.table.read().get(address) {
            for report in reports {
                counts.add(report);
            }
        }
    }

    /// Snapshot of one watched address.
    ///
    /// # Example
    ///
    /// ```
    /// use bus_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    /// statistics.register("svc");
    ///
    /// statistics.add("svc", &[Stats::SendRemote(1)]);
    /// assert_eq!(statistics.get("svc").unwrap().send_remote, 1);
    ///
    /// // Not watched: counted in the totals only.
    /// statistics.add("other", &[Stats::SendLocal(1)]);
    /// assert_eq!(statistics.totals().send_local, 1);
    /// assert!(statistics.get("other").is_none());
    /// ```
    pub fn get(&self, address: &str) -> Option<Counts<usize>> {
        self.0.table.read().get(address).map(Counts::snapshot)
    }

    pub fn totals(&self) -> Counts<usize> {
        self.0.totals.snapshot()
    }
}
