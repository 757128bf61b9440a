//! One client connection, from SOCKS handshake to close.
//!
//! Sequence:
//! 1. SOCKS handshake (destination host and port)
//! 2. One read of the client's first payload (TLS ClientHello, HTTP request)
//! 3. Routing decision on that payload
//! 4. Outbound connection: direct, or through the relay
//! 5. Replay of the payload onto the outbound connection
//! 6. Bidirectional copy until either side finishes
//!
//! Both connections are owned here and dropped, closing them, whichever way
//! the session ends.

use std::io;
use std::sync::Arc;

use starmer_socks::{self as socks, RelayClient, SocksError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::router::{PatternRouter, Route, HELLO_CAPTURE_SIZE};
use crate::config::Config;

/// Session-scoped failures. None of them affect other sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[source] SocksError),

    #[error("client closed before sending a payload")]
    NoHello,

    #[error("reading client payload: {0}")]
    Hello(#[source] io::Error),

    #[error("relay dial to {target} failed: {source}")]
    Relay {
        target: String,
        #[source]
        source: SocksError,
    },

    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("forwarding: {0}")]
    Forward(#[source] io::Error),
}

impl SessionError {
    /// Returns true for ordinary peer closure, which is not worth a warning.
    pub fn is_benign(&self) -> bool {
        match self {
            SessionError::Handshake(e) => e.is_benign(),
            SessionError::NoHello => true,
            SessionError::Hello(e) | SessionError::Forward(e) => socks::is_closed(e),
            SessionError::Relay { .. } | SessionError::Dial { .. } => false,
        }
    }
}

/// Which half of the pump finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

/// Summary of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub target: String,
    pub route: Route,
    /// Direction whose end closed the session.
    pub finished: Direction,
    /// Bytes that direction moved, not counting the replayed payload.
    pub bytes: u64,
}

/// Handle one accepted connection under a config snapshot.
pub async fn run(mut client: TcpStream, config: Arc<Config>) -> Result<Transfer, SessionError> {
    let handshake = socks::accept(&mut client)
        .await
        .map_err(SessionError::Handshake)?;
    let target = handshake.target();

    let hello = read_hello(&mut client).await?;
    let verdict = PatternRouter::new(&config.pattern).classify(hello);

    let mut upstream = match verdict.route {
        Route::ViaRelay => {
            info!(target = %target, "tunnel");
            RelayClient::new(config.relay_addr.as_str())
                .connect(&handshake.host, handshake.port)
                .await
                .map_err(|source| SessionError::Relay {
                    target: target.clone(),
                    source,
                })?
        }
        Route::Direct => {
            info!(target = %target, "fwd");
            TcpStream::connect((handshake.host.as_str(), handshake.port))
                .await
                .map_err(|source| SessionError::Dial {
                    target: target.clone(),
                    source,
                })?
        }
    };

    upstream
        .write_all(&verdict.hello)
        .await
        .map_err(SessionError::Forward)?;

    let (finished, bytes) = proxy_bidirectional(&mut client, &mut upstream).await?;

    debug!(target = %target, ?finished, bytes, "Session closed");

    Ok(Transfer {
        target,
        route: verdict.route,
        finished,
        bytes,
    })
}

/// Single read of whatever the client sends first, up to the capture size.
async fn read_hello(client: &mut TcpStream) -> Result<Vec<u8>, SessionError> {
    let mut buf = vec![0u8; HELLO_CAPTURE_SIZE];
    let n = client.read(&mut buf).await.map_err(SessionError::Hello)?;
    if n == 0 {
        return Err(SessionError::NoHello);
    }
    buf.truncate(n);
    Ok(buf)
}

/// Copy in both directions until one of them reaches end of stream or fails.
///
/// The other direction is abandoned; dropping the streams afterwards closes
/// both connections, which the peers observe as end of stream.
async fn proxy_bidirectional(
    client: &mut TcpStream,
    target: &mut TcpStream,
) -> Result<(Direction, u64), SessionError> {
    let (mut client_read, mut client_write) = client.split();
    let (mut target_read, mut target_write) = target.split();

    let (finished, result) = tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut target_write) => (Direction::ClientToTarget, r),
        r = tokio::io::copy(&mut target_read, &mut client_write) => (Direction::TargetToClient, r),
    };

    let bytes = result.map_err(SessionError::Forward)?;
    Ok((finished, bytes))
}
