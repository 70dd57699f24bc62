//! Host-side communication with compile workers.

pub mod transport;

#[cfg(test)]
pub use transport::{MockBehavior, MockTransport};
pub use transport::{TcpTransport, Transport, TransportError, PROBE_READ_TIMEOUT};
