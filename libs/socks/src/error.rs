//! Error types for the SOCKS wire protocol.

use std::io;

use thiserror::Error;

/// SOCKS handshake and relay errors.
#[derive(Debug, Error)]
pub enum SocksError {
    /// Client spoke a protocol version we do not serve.
    #[error("unsupported SOCKS version {version}")]
    UnsupportedVersion {
        version: u8,
        /// Whatever the client sent after the version byte (up to 64 KiB).
        trailing: Vec<u8>,
    },

    /// Anything but CONNECT.
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),

    /// SOCKS5 request with an address type other than IPv4.
    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),

    /// NUL-terminated field longer than the protocol allows.
    #[error("NUL-terminated field exceeds {max} bytes")]
    FieldTooLong { max: usize },

    /// SOCKS4a domain that is not valid UTF-8.
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,

    /// Domain cannot be length-prefixed with a single byte.
    #[error("domain name too long for SOCKS5: {0} bytes")]
    DomainTooLong(usize),

    /// Could not open a TCP connection to the relay.
    #[error("relay {relay} unreachable: {source}")]
    RelayUnreachable {
        relay: String,
        #[source]
        source: io::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    /// Returns true if the peer simply went away mid-handshake.
    pub fn is_benign(&self) -> bool {
        matches!(self, SocksError::Io(e) if crate::is_closed(e))
    }
}
