//! Reconnecting transports for monitoring connections.
//!
//! Each logical connection owns a [`ReconnectBackoff`]. A disconnect bumps
//! its failure counter and yields the delay before the next attempt; once the
//! counter passes the ceiling the connection gives up with
//! [`TransportError::RetriesExhausted`].
//!
//! [`run_connection`] drives a [`Connector`] on a single-threaded reactor:
//! reconnects are timers, never blocked threads, so many connections can
//! share one `LocalSet`.

mod backoff;
mod connection;
mod error;
mod tcp;

pub use backoff::{ReconnectBackoff, DEFAULT_SCHEDULE, MAX_RETRIES};
pub use connection::{run_connection, spawn_connection, Closed, Connector};
pub use error::TransportError;
pub use tcp::TcpConnector;
