//! SOCKS front end and forwarding.
//!
//! ```text
//! Client -> AcceptLoop -> Service -> session: SOCKS handshake -> hello -> PatternRouter
//!                                                                        |         |
//!                                                                     Direct    ViaRelay
//!                                                                        |         |
//!                                                                     target   RelayClient -> target
//! ```

mod listener;
mod router;
pub mod session;

pub use listener::{AcceptLoop, Accepted, ACCEPT_RETRY_DELAY};
pub use router::{PatternRouter, Route, Verdict, HELLO_CAPTURE_SIZE};
pub use session::{Direction, SessionError, Transfer};
