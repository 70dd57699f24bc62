//! ccfarm wire protocol
//!
//! Defines the framed JSON messages exchanged between the coordinator and
//! compile workers. Every message is an 8-byte big-endian length prefix
//! followed by exactly that many bytes of JSON.

pub mod b64;
pub mod error;
pub mod frame;
pub mod ops;
pub mod request;
pub mod response;

pub use error::{FailureKind, ProtocolError};
pub use frame::{read_frame, read_message, write_frame, write_message, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use ops::{ProbeResponse, Request};
pub use request::CompileRequest;
pub use response::CompileResponse;

/// Default TCP port a worker listens on.
pub const DEFAULT_PORT: u16 = 5555;

/// Protocol version reported in probe responses.
pub const PROTOCOL_VERSION: u32 = 1;

/// Crate version string reported by workers.
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");
