use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::socket::LetterSocket;

/// Accept loop feeding inbound connections into a socket. Thin adapter around a tokio
///  [TcpListener]; applications that accept connections themselves can bypass it and call
///  [LetterSocket::accept_incoming] directly.
pub struct Listener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(socket: Arc<LetterSocket>, bind_addr: SocketAddr) -> anyhow::Result<Listener> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening for letters on {:?}", local_addr);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        debug!("accepted connection from {:?}", remote_addr);
                        socket.accept_incoming(stream, remote_addr);
                    }
                    Err(e) => {
                        warn!("error accepting a connection on {:?}: {}", local_addr, e);
                    }
                }
            }
        });

        Ok(Listener {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shut_down(&self) {
        self.accept_task.abort();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
