//! TCP accept loop.
//!
//! An [`AcceptLoop`] owns one bound listener and forwards every accepted
//! connection to the service over a channel. It never handles connections
//! itself, so the service decides which config snapshot each one gets.
//!
//! A reload that changes the listen address binds the new loop before
//! closing the old one. Connections already handed off keep running.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Pause after a failed accept before trying again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accepted connection, with the peer's address.
pub type Accepted = (TcpStream, SocketAddr);

/// A running accept loop on one listen address.
#[derive(Debug)]
pub struct AcceptLoop {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl AcceptLoop {
    /// Bind `addr` and start accepting, sending each connection to `handoff`.
    pub async fn bind(addr: &str, handoff: mpsc::UnboundedSender<Accepted>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Listener bound");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(listener, handoff, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            handle,
        })
    }

    /// Address actually bound, with any port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and release the listen socket.
    ///
    /// Returns once the loop has exited and the socket is closed, so the same
    /// address can be bound again right away.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            error!(error = %e, "Accept loop panicked");
        }
        info!(bind_addr = %self.local_addr, "Listener closed");
    }
}

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    listener: TcpListener,
    handoff: mpsc::UnboundedSender<Accepted>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    if handoff.send((stream, peer)).is_err() {
                        debug!("Service gone, stopping accept loop");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_accepted_connections_are_handed_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept = AcceptLoop::bind("127.0.0.1:0", tx).await.unwrap();

        let mut client = TcpStream::connect(accept.local_addr()).await.unwrap();
        let (mut server, peer) = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accept.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_address() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let accept = AcceptLoop::bind("127.0.0.1:0", tx.clone()).await.unwrap();
        let addr = accept.local_addr();

        timeout(TEST_TIMEOUT, accept.close()).await.unwrap();

        let rebound = AcceptLoop::bind(&addr.to_string(), tx).await.unwrap();
        assert_eq!(rebound.local_addr(), addr);
        rebound.close().await;
    }

    #[tokio::test]
    async fn test_close_keeps_handed_off_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept = AcceptLoop::bind("127.0.0.1:0", tx).await.unwrap();

        let mut client = TcpStream::connect(accept.local_addr()).await.unwrap();
        let (mut server, _) = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();

        accept.close().await;

        server.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_loop_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let accept = AcceptLoop::bind("127.0.0.1:0", tx).await.unwrap();
        drop(rx);

        let _client = TcpStream::connect(accept.local_addr()).await.unwrap();
        // The send fails and the loop exits on its own; close still returns.
        timeout(TEST_TIMEOUT, accept.close()).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = AcceptLoop::bind("127.0.0.1:0", tx.clone()).await.unwrap();

        let err = AcceptLoop::bind(&first.local_addr().to_string(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        first.close().await;
    }
}
