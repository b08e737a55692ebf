pub mod connection;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use codec::{PONG, framing::Framer, message::ClusteredMessage};
use service::{Service, ServiceHandler};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};

/// Bind the peer listener.
///
/// A wildcard port is resolved here; the caller derives the advertised
/// address from the returned local address.
pub async fn bind(listen: &str) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;

    Ok((listener, local_addr))
}

/// The running peer server. Closing it stops the accept loop and tears
/// down every accepted socket.
pub struct Server {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Accept loop of the peer server.
///
/// Every accepted socket gets its own framer and task; decoded PINGs are
/// answered inline with the PONG byte, everything else is injected into
/// the local bus. The server never writes anything but PONG.
pub fn serve<T>(listener: TcpListener, local_addr: SocketAddr, service: Arc<Service<T>>) -> Server
where
    T: ServiceHandler,
{
    let (shutdown, closing) = watch::channel(false);

    let task = tokio::spawn(async move {
        while let Ok((socket, address)) = listener.accept().await {
            log::info!("peer socket accept: addr={address:?}, interface={local_addr:?}");

            // Any received record should be dispatched as soon as
            // possible, disable the Nagle algorithm.
            if let Err(e) = socket.set_nodelay(true) {
                log::error!("peer socket set nodelay failed!: addr={address}, err={e}");
            }

            let service = service.clone();
            let mut closing = closing.clone();
            tokio::spawn(async move {
                if let Err(e) = handle(socket, &service, &mut closing).await {
                    log::warn!("peer socket error: addr={address:?}, err={e}");
                }

                log::info!("peer socket disconnect: addr={address:?}");
            });
        }

        log::error!("peer server close: interface={local_addr:?}");
    });

    Server {
        local_addr,
        task,
        shutdown,
    }
}

async fn handle<T>(
    mut socket: TcpStream,
    service: &Service<T>,
    closing: &mut watch::Receiver<bool>,
) -> Result<()>
where
    T: ServiceHandler,
{
    let mut framer = Framer::default();
    let mut buffer = [0u8; 4096];

    loop {
        let size = tokio::select! {
            result = socket.read(&mut buffer) => result?,
            _ = closing.changed() => return Ok(()),
        };

        // When the received size is 0, the socket has been closed.
        if size == 0 {
            return Ok(());
        }

        framer.extend(&buffer[..size]);
        while let Some(record) = framer.next_record()? {
            let message = ClusteredMessage::decode(&record)?;
            if message.is_ping() {
                socket.write_all(&[PONG]).await?;
            } else {
                service.deliver_local(&message);
            }
        }
    }
}
