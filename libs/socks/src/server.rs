//! Server side of the SOCKS CONNECT handshake.
//!
//! SOCKS4:
//! - byte 0: version (0x04)
//! - byte 1: command (0x01 = CONNECT)
//! - bytes 2-3: destination port
//! - bytes 4-7: destination IPv4 (0.0.0.1 = SOCKS4a, domain follows)
//! - variable: NUL-terminated user id
//! - variable: NUL-terminated domain (SOCKS4a only)
//!
//! SOCKS5 (as spoken by the clients this proxy serves):
//! - byte 0: version (0x05)
//! - bytes 1-2: method count (16 bits, clamped to 1..=255)
//! - variable: methods, discarded
//! - 4 bytes: version, command, reserved, address type (IPv4 only)
//! - bytes: IPv4 address (4) and port (2)

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::SocksError;
use crate::{hexdump, ATYP_IPV4, CMD_CONNECT, METHOD_NO_AUTH, SOCKS4_VERSION, SOCKS5_VERSION};

/// SOCKS4 "request granted".
pub const SOCKS4_GRANTED: [u8; 8] = [0x00, 0x5A, 0, 0, 0, 0, 0, 0];

/// SOCKS5 method selection: no authentication.
pub const SOCKS5_NO_AUTH: [u8; 2] = [SOCKS5_VERSION, METHOD_NO_AUTH];

/// SOCKS5 "succeeded", bound to 0.0.0.0:0.
pub const SOCKS5_GRANTED: [u8; 10] = [SOCKS5_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Destination IP a SOCKS4a client sends when a domain name follows.
const SOCKS4A_MARKER: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

/// Longest user id or domain accepted in a SOCKS4/4a request.
const MAX_FIELD_LEN: usize = 255;

/// How much to drain from a client speaking an unknown protocol.
const MAX_DRAIN: usize = 0xFFFF;

/// Protocol variant a client used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V4a,
    V5,
}

/// Outcome of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: SocksVersion,
    /// Destination host: a dotted IPv4 address, or the SOCKS4a domain verbatim.
    pub host: String,
    pub port: u16,
    /// Bytes sent to the client to grant the request.
    pub reply: &'static [u8],
}

impl Handshake {
    /// `host:port` suitable for dialing.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Run the server side of one handshake and grant the request.
///
/// Reads exactly the handshake bytes, nothing more. On any failure no
/// "granted" reply is written and the caller is expected to drop the stream.
pub async fn accept<S>(stream: &mut S) -> Result<Handshake, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;

    let handshake = match version {
        SOCKS4_VERSION => accept_v4(stream).await?,
        SOCKS5_VERSION => accept_v5(stream).await?,
        other => return Err(reject(stream, other).await),
    };

    stream.write_all(handshake.reply).await?;
    stream.flush().await?;

    debug!(
        version = ?handshake.version,
        target = %handshake.target(),
        "Handshake complete"
    );

    Ok(handshake)
}

async fn accept_v4<S>(stream: &mut S) -> Result<Handshake, SocksError>
where
    S: AsyncRead + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;

    if command != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(command));
    }

    // User id, unused
    read_nul_terminated(stream).await?;

    let ip = Ipv4Addr::from(ip);
    if ip == SOCKS4A_MARKER {
        let domain = read_nul_terminated(stream).await?;
        let host = String::from_utf8(domain).map_err(|_| SocksError::InvalidDomain)?;
        return Ok(Handshake {
            version: SocksVersion::V4a,
            host,
            port,
            reply: &SOCKS4_GRANTED,
        });
    }

    Ok(Handshake {
        version: SocksVersion::V4,
        host: ip.to_string(),
        port,
        reply: &SOCKS4_GRANTED,
    })
}

async fn accept_v5<S>(stream: &mut S) -> Result<Handshake, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 16-bit count for compatibility with deployed clients; RFC 1928 says 8.
    let count = stream.read_u16().await?;
    if count > 0 {
        let mut methods = [0u8; 255];
        let n = usize::from(count.clamp(1, 255));
        stream.read_exact(&mut methods[..n]).await?;
    }

    stream.write_all(&SOCKS5_NO_AUTH).await?;
    stream.flush().await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [ver, cmd, _rsv, atyp] = header;
    debug!(ver, cmd, atyp, "SOCKS5 request");

    if atyp != ATYP_IPV4 {
        return Err(SocksError::UnsupportedAddressType(atyp));
    }

    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    let port = stream.read_u16().await?;

    Ok(Handshake {
        version: SocksVersion::V5,
        host: Ipv4Addr::from(ip).to_string(),
        port,
        reply: &SOCKS5_GRANTED,
    })
}

/// Drain what the client sent for the log, then refuse without replying.
async fn reject<S>(stream: &mut S, version: u8) -> SocksError
where
    S: AsyncRead + Unpin,
{
    let mut trailing = vec![0u8; MAX_DRAIN];
    let n = stream.read(&mut trailing).await.unwrap_or(0);
    trailing.truncate(n);

    debug!(version, bytes = n, "Unknown protocol:\n{}", hexdump(&trailing));

    SocksError::UnsupportedVersion { version, trailing }
}

async fn read_nul_terminated<R>(reader: &mut R) -> Result<Vec<u8>, SocksError>
where
    R: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        match reader.read_u8().await? {
            0 => return Ok(field),
            _ if field.len() == MAX_FIELD_LEN => {
                return Err(SocksError::FieldTooLong { max: MAX_FIELD_LEN })
            }
            b => field.push(b),
        }
    }
}
