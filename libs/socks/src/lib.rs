//! SOCKS wire protocol for starmer.
//!
//! This library provides:
//! - The server side of the SOCKS4, SOCKS4a and SOCKS5 CONNECT handshakes
//! - A minimal SOCKS5 client for opening streams through a relay
//! - Helpers for classifying ordinary stream termination
//!
//! All multi-byte fields are big-endian and read or written one field at a
//! time, so nothing is consumed from a client socket past the end of its
//! handshake.

use std::fmt::Write as _;
use std::io;

mod client;
mod error;
mod server;

pub use client::{RelayClient, TargetAddr, PROBE_HOST, PROBE_PORT};
pub use error::SocksError;
pub use server::{accept, Handshake, SocksVersion};

/// SOCKS4 protocol version byte.
pub const SOCKS4_VERSION: u8 = 0x04;

/// SOCKS5 protocol version byte.
pub const SOCKS5_VERSION: u8 = 0x05;

/// CONNECT command (both SOCKS4 and SOCKS5).
pub const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 "no authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// SOCKS5 address types.
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Whether an I/O error is an ordinary end of stream rather than a fault.
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Render bytes for diagnostics, 8 per line: hex, then the printable text.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(8) {
        let hex = chunk
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        let text: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        let _ = writeln!(out, "{hex:<25}{text}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_lines() {
        let dump = hexdump(b"GET / HTTP/1.1\r\n");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "47 45 54 20 2F 20 48 54  GET / HT");
        assert_eq!(lines[1], "54 50 2F 31 2E 31 0D 0A  TP/1.1..");
    }

    #[test]
    fn test_hexdump_short_line_is_padded() {
        let dump = hexdump(&[0x06, 0x41]);
        assert_eq!(dump, format!("{:<25}{}\n", "06 41", ".A"));
    }

    #[test]
    fn test_hexdump_empty() {
        assert_eq!(hexdump(&[]), "");
    }

    #[test]
    fn test_is_closed() {
        assert!(is_closed(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_closed(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_closed(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_closed(&io::Error::other("boom")));
    }
}
