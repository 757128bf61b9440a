//! Minimal SOCKS5 client for opening streams through a relay.
//!
//! Exchange:
//! - greeting: version 5, one method, no authentication
//! - method selection from the relay, ignored
//! - CONNECT request: version, command, reserved, address type, address, port
//! - reply from the relay, consumed but not judged; a refusing relay closes
//!   the stream and the session ends on its own

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::error::SocksError;
use crate::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, METHOD_NO_AUTH, SOCKS5_VERSION};

/// Host dialed through the relay by [`RelayClient::probe`].
pub const PROBE_HOST: &str = "example.org";

/// Port dialed through the relay by [`RelayClient::probe`].
pub const PROBE_PORT: u16 = 443;

/// Destination as it goes on the wire in a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// Classify `host` for a CONNECT request.
    ///
    /// Literal addresses are sent as-is. Names are resolved locally first
    /// and the first IPv4 result is sent; only when that yields nothing is
    /// the name handed to the relay to resolve.
    pub async fn resolve(host: &str, port: u16) -> Self {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return ip.into();
        }

        match lookup_host((host, port)).await {
            Ok(addrs) => {
                let v4 = addrs.into_iter().find_map(|addr| match addr.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                });
                if let Some(v4) = v4 {
                    return TargetAddr::Ipv4(v4);
                }
            }
            Err(e) => {
                debug!(host = %host, error = %e, "Local resolution failed, relay will resolve");
            }
        }

        TargetAddr::Domain(host.to_string())
    }

    /// Append address type, address and port to `buf`.
    pub fn encode(&self, port: u16, buf: &mut Vec<u8>) -> Result<(), SocksError> {
        match self {
            TargetAddr::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            TargetAddr::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            TargetAddr::Domain(name) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| SocksError::DomainTooLong(name.len()))?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }
}

impl From<IpAddr> for TargetAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => TargetAddr::Ipv4(v4),
            IpAddr::V6(v6) => TargetAddr::Ipv6(v6),
        }
    }
}

/// SOCKS5 client bound to one relay address.
#[derive(Debug, Clone)]
pub struct RelayClient {
    relay: String,
}

impl RelayClient {
    /// Create a client for the relay at `relay` (`host:port`).
    pub fn new(relay: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
        }
    }

    /// Relay address this client dials.
    pub fn relay_addr(&self) -> &str {
        &self.relay
    }

    /// Open a stream to `host:port` through the relay.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, SocksError> {
        let target = TargetAddr::resolve(host, port).await;

        let mut stream =
            TcpStream::connect(self.relay.as_str())
                .await
                .map_err(|source| SocksError::RelayUnreachable {
                    relay: self.relay.clone(),
                    source,
                })?;

        negotiate(&mut stream, &target, port).await?;

        debug!(relay = %self.relay, target = ?target, port, "Relay stream established");
        Ok(stream)
    }

    /// Check the relay works by opening (and dropping) a stream to a
    /// well-known host through it.
    pub async fn probe(&self) -> Result<(), SocksError> {
        self.connect(PROBE_HOST, PROBE_PORT).await.map(drop)
    }
}

/// Run the client side of a SOCKS5 CONNECT over an open stream.
pub async fn negotiate<S>(stream: &mut S, target: &TargetAddr, port: u16) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    target.encode(port, &mut request)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    read_reply(stream).await
}

/// Consume the relay's reply, bound address included.
async fn read_reply<R>(reader: &mut R) -> Result<(), SocksError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let [_ver, rep, _rsv, atyp] = header;

    let addr_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(reader.read_u8().await?),
        _ => {
            debug!(rep, atyp, "Relay reply with unknown address type");
            return Ok(());
        }
    };

    let mut bound = [0u8; 255 + 2];
    reader.read_exact(&mut bound[..addr_len + 2]).await?;

    if rep != 0 {
        debug!(rep, "Relay refused CONNECT");
    }

    Ok(())
}
