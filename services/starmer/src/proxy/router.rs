//! Routing decisions from the client's first payload.
//!
//! Only TLS handshakes (record type 0x16) and HTTP `GET`/`POST` requests are
//! inspected; they are the payloads that name their destination (SNI or
//! Host header) in cleartext. The pattern is matched against the raw bytes
//! of the whole payload rather than a parsed field, so it may match anywhere
//! in the ClientHello or request head.

use regex::bytes::Regex;

/// Most bytes captured from the client for inspection. Whatever the client
/// sent beyond this stays on the socket and is forwarded by the pump.
pub const HELLO_CAPTURE_SIZE: usize = 10_000;

/// TLS record type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// Where a connection goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Dial the destination directly.
    Direct,
    /// Tunnel through the SOCKS5 relay.
    ViaRelay,
}

/// A routing decision together with the payload that produced it.
///
/// The payload has already been consumed from the client and must be
/// replayed onto whichever connection is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub route: Route,
    pub hello: Vec<u8>,
}

/// Classifies client payloads against the configured pattern.
#[derive(Debug, Clone, Copy)]
pub struct PatternRouter<'a> {
    pattern: &'a Regex,
}

impl<'a> PatternRouter<'a> {
    pub fn new(pattern: &'a Regex) -> Self {
        Self { pattern }
    }

    /// Whether `hello` is a payload worth matching.
    pub fn is_inspectable(hello: &[u8]) -> bool {
        hello.first() == Some(&TLS_HANDSHAKE)
            || hello.starts_with(b"GET")
            || hello.starts_with(b"POST")
    }

    pub fn route(&self, hello: &[u8]) -> Route {
        if Self::is_inspectable(hello) && self.pattern.is_match(hello) {
            Route::ViaRelay
        } else {
            Route::Direct
        }
    }

    pub fn classify(&self, hello: Vec<u8>) -> Verdict {
        Verdict {
            route: self.route(&hello),
            hello,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // A minimal TLS 1.2 ClientHello with SNI "example.com"
    const EXAMPLE_CLIENT_HELLO: &[u8] = &[
        // TLS record header
        0x16, // Handshake
        0x03, 0x01, // TLS 1.0 (for compatibility)
        0x00, 0x5f, // Record length: 95 bytes
        // Handshake header
        0x01, // ClientHello
        0x00, 0x00, 0x5b, // Length: 91 bytes
        // Client version
        0x03, 0x03, // TLS 1.2
        // Random (32 bytes)
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, // Session ID length
        0x00, // Cipher suites length
        0x00, 0x02, // Cipher suite
        0x00, 0x2f, // TLS_RSA_WITH_AES_128_CBC_SHA
        // Compression methods
        0x01, 0x00, // null compression
        // Extensions length
        0x00, 0x28, // 40 bytes
        // SNI extension
        0x00, 0x00, // type: SNI
        0x00, 0x10, // length: 16 bytes
        0x00, 0x0e, // list length: 14 bytes
        0x00, // name type: hostname
        0x00, 0x0b, // name length: 11 bytes
        b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
        // Padding to match declared length
        0x00, 0x15, // padding extension
        0x00, 0x10, // length
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    fn pattern(src: &str) -> Regex {
        Regex::new(src).unwrap()
    }

    #[test]
    fn test_tls_sni_match_goes_via_relay() {
        let re = pattern(r"example\.com");
        let router = PatternRouter::new(&re);
        assert_eq!(router.route(EXAMPLE_CLIENT_HELLO), Route::ViaRelay);
    }

    #[test]
    fn test_tls_without_match_goes_direct() {
        let re = pattern(r"other\.org");
        let router = PatternRouter::new(&re);
        assert_eq!(router.route(EXAMPLE_CLIENT_HELLO), Route::Direct);
    }

    #[rstest]
    #[case(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Route::ViaRelay)]
    #[case(b"POST /upload HTTP/1.1\r\nHost: example.com\r\n\r\n", Route::ViaRelay)]
    #[case(b"GET / HTTP/1.1\r\nHost: other.com\r\n\r\n", Route::Direct)]
    #[case(b"PUT / HTTP/1.1\r\nHost: example.com\r\n\r\n", Route::Direct)]
    #[case(b"SSH-2.0-OpenSSH_9.6 example.com\r\n", Route::Direct)]
    #[case(b"\x17\x03\x03example.com", Route::Direct)]
    #[case(b"get / HTTP/1.1\r\nHost: example.com\r\n\r\n", Route::Direct)]
    #[case(b"", Route::Direct)]
    fn test_route_by_prefix(#[case] hello: &[u8], #[case] expected: Route) {
        let re = pattern(r"example\.com");
        assert_eq!(PatternRouter::new(&re).route(hello), expected);
    }

    #[rstest]
    #[case(b"\x16")]
    #[case(b"GET")]
    #[case(b"POST")]
    #[case(b"\x16\x03\x01\x00\x05\x01\x00\x00\x01\x00")]
    fn test_match_all_routes_every_inspectable_hello(#[case] hello: &[u8]) {
        let re = pattern("");
        assert_eq!(PatternRouter::new(&re).route(hello), Route::ViaRelay);
    }

    #[test]
    fn test_uninspectable_ignores_pattern() {
        let re = pattern("");
        let router = PatternRouter::new(&re);
        assert_eq!(router.route(b"\x00\x01binary"), Route::Direct);
        assert_eq!(router.route(b"CONNECT example.com:443"), Route::Direct);
    }

    #[test]
    fn test_pattern_matches_anywhere_in_buffer() {
        let mut hello = b"GET / HTTP/1.1\r\n".to_vec();
        hello.extend(std::iter::repeat(b'x').take(5000));
        hello.extend_from_slice(b"\r\nCookie: sci-hub\r\n\r\n");

        let re = pattern(r"sci-?hub");
        assert_eq!(PatternRouter::new(&re).route(&hello), Route::ViaRelay);
    }

    #[test]
    fn test_classify_keeps_hello() {
        let re = pattern(r"example\.com");
        let verdict = PatternRouter::new(&re).classify(EXAMPLE_CLIENT_HELLO.to_vec());
        assert_eq!(verdict.route, Route::ViaRelay);
        assert_eq!(verdict.hello, EXAMPLE_CLIENT_HELLO);
    }
}
