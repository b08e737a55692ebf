use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use bytes::Bytes;
use codec::{NodeAddress, framing::frame, message::ClusteredMessage};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Notify, mpsc, mpsc::error::TrySendError},
    time::{interval, timeout},
};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub max_pending: usize,
}

enum State {
    /// The socket is not up yet; writes pile up here in submission order.
    Connecting { pending: VecDeque<Bytes> },
    Ready { sender: mpsc::Sender<Bytes> },
    /// Terminal. A closed holder is evicted from the connections map, the
    /// next send to the peer starts a fresh one.
    Closed,
}

/// Outbound connection state of one peer.
pub struct ConnectionHolder {
    peer: NodeAddress,
    state: Mutex<State>,
    awaiting_pong: AtomicBool,
    closed: Notify,
}

impl ConnectionHolder {
    fn new(peer: NodeAddress) -> Self {
        Self {
            peer,
            state: Mutex::new(State::Connecting {
                pending: VecDeque::new(),
            }),
            awaiting_pong: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    /// Enqueue an encoded record towards the peer.
    ///
    /// Returns `false` when the holder is already closed; the caller lost
    /// a race against eviction and retries through a fresh lookup. A full
    /// queue drops the record, delivery is best-effort.
    fn write_message(&self, record: Bytes, max_pending: usize) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            State::Connecting { pending } => {
                if pending.len() >= max_pending {
                    log::warn!("write queue full, message dropped: peer={}", self.peer);
                } else {
                    pending.push_back(record);
                }

                true
            }
            State::Ready { sender } => match sender.try_send(record) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!("write queue full, message dropped: peer={}", self.peer);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
            State::Closed => false,
        }
    }

    fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), State::Closed)
    }
}

/// Outbound side of the transport fabric.
///
/// One holder per peer, created lazily on the first send and reused
/// across addresses. The map invariant is one live holder per peer: a
/// creation race is resolved by the map insert under the write lock, and
/// a close removes the holder under the same guard before a replacement
/// may appear.
#[derive(Clone)]
pub struct Connections {
    node: NodeAddress,
    options: ConnectionOptions,
    map: Arc<RwLock<AHashMap<NodeAddress, Arc<ConnectionHolder>>>>,
}

impl Connections {
    pub fn new(node: NodeAddress, options: ConnectionOptions) -> Self {
        Self {
            node,
            options,
            map: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    /// Queue a framed record towards a peer, connecting first if no
    /// holder exists yet.
    pub fn send(&self, peer: &NodeAddress, record: Bytes) {
        debug_assert_ne!(peer, &self.node);

        loop {
            let (holder, created) = {
                let mut map = self.map.write();
                match map.get(peer) {
                    Some(holder) => (holder.clone(), false),
                    None => {
                        let holder = Arc::new(ConnectionHolder::new(peer.clone()));
                        map.insert(peer.clone(), holder.clone());
                        (holder, true)
                    }
                }
            };

            if created {
                tokio::spawn(self.clone().connect(holder.clone()));
            }

            if holder.write_message(record.clone(), self.options.max_pending) {
                return;
            }

            // The holder closed between lookup and write. Make sure it is
            // gone from the map and start over with a fresh one.
            self.evict(&holder);
        }
    }

    /// Close the holder of one peer, if any. Used when the cluster
    /// reports the peer dead.
    pub fn close(&self, peer: &NodeAddress) {
        let holder = self.map.read().get(peer).cloned();
        if let Some(holder) = holder {
            self.close_holder(&holder);
        }
    }

    /// Part of node shutdown: close every holder, keep going regardless
    /// of individual outcomes.
    pub fn close_all(&self) {
        let holders: Vec<_> = self.map.read().values().cloned().collect();
        for holder in holders {
            self.close_holder(&holder);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    async fn connect(self, holder: Arc<ConnectionHolder>) {
        let peer = holder.peer.clone();

        let stream = match timeout(
            self.options.connect_timeout,
            TcpStream::connect((peer.host.as_str(), peer.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::warn!("peer connect failed: peer={peer}, err={e}");
                self.close_holder(&holder);
                return;
            }
            Err(_) => {
                log::warn!("peer connect timeout: peer={peer}");
                self.close_holder(&holder);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::error!("peer socket set nodelay failed!: peer={peer}, err={e}");
        }

        let (mut reader, mut writer) = stream.into_split();
        let (sender, mut receiver) = mpsc::channel(self.options.max_pending.max(1));

        {
            let mut state = holder.state.lock();
            match std::mem::replace(&mut *state, State::Closed) {
                State::Connecting { mut pending } => {
                    // The channel capacity matches the pending bound, the
                    // drain cannot overflow it.
                    for record in pending.drain(..) {
                        let _ = sender.try_send(record);
                    }

                    *state = State::Ready {
                        sender: sender.clone(),
                    };
                }
                // Closed while the connect was in flight; leave it so.
                _ => return,
            }
        }

        log::info!("peer connected: peer={peer}, node={}", self.node);

        {
            let connections = self.clone();
            let holder = holder.clone();
            tokio::spawn(async move {
                while let Some(record) = receiver.recv().await {
                    if writer.write_all(&record).await.is_err() {
                        connections.close_holder(&holder);
                        break;
                    }
                }
            });
        }

        let ping = frame(&ClusteredMessage::ping(self.node.clone()).encode());
        let mut ticker = interval(self.options.ping_interval);
        let mut buffer = [0u8; 64];

        // Outbound sockets are write-mostly: the only expected inbound
        // bytes are PONG acknowledgements, and anything received counts
        // as one.
        loop {
            tokio::select! {
                result = reader.read(&mut buffer) => match result {
                    Ok(0) | Err(_) => {
                        self.close_holder(&holder);
                        break;
                    }
                    Ok(_) => holder.awaiting_pong.store(false, Ordering::Relaxed),
                },
                _ = ticker.tick() => {
                    if holder.awaiting_pong.swap(true, Ordering::Relaxed) {
                        log::warn!("peer ping timeout: peer={peer}");
                        self.close_holder(&holder);
                        break;
                    }

                    if sender.try_send(ping.clone()).is_err() {
                        self.close_holder(&holder);
                        break;
                    }
                }
                _ = holder.closed.notified() => break,
            }

            if holder.is_closed() {
                break;
            }
        }
    }

    fn close_holder(&self, holder: &Arc<ConnectionHolder>) {
        {
            let mut state = holder.state.lock();
            if matches!(*state, State::Closed) {
                return;
            }

            if let State::Connecting { pending } = std::mem::replace(&mut *state, State::Closed) {
                if !pending.is_empty() {
                    log::warn!(
                        "dropping pending messages: peer={}, count={}",
                        holder.peer,
                        pending.len()
                    );
                }
            }
        }

        self.evict(holder);
        holder.closed.notify_waiters();

        log::info!("peer connection closed: peer={}", holder.peer);
    }

    fn evict(&self, holder: &Arc<ConnectionHolder>) {
        let mut map = self.map.write();
        if let Some(current) = map.get(&holder.peer) {
            if Arc::ptr_eq(current, holder) {
                map.remove(&holder.peer);
            }
        }
    }
}
