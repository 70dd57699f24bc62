//! Error types for the wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Why a compile request did not produce an object file.
///
/// These codes are stable; the coordinator's fallback policy depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The logical compiler has no resolvable toolchain on the worker.
    CompilerNotFound,
    /// The request itself was unusable (bad file names, missing fields).
    InvalidRequest,
    /// The compiler ran and exited nonzero.
    CompileFailed,
    /// The compiler exceeded the worker's wall-clock limit.
    Timeout,
    /// The compiler exited zero but produced no output file.
    MissingOutput,
    /// The worker could not set up or observe the compilation.
    Internal,
}

impl FailureKind {
    /// Failures that are legitimate compiler diagnostics and must reach the
    /// build tool unchanged.
    pub fn is_execution(self) -> bool {
        matches!(self, Self::CompileFailed | Self::Timeout | Self::MissingOutput)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompilerNotFound => write!(f, "compiler_not_found"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::CompileFailed => write!(f, "compile_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::MissingOutput => write!(f, "missing_output"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Transport-level protocol violations.
///
/// Any of these terminates the connection. None of them is an application
/// error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl ProtocolError {
    /// Whether the failure was a socket timeout rather than a bad message.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Io(e) => matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            _ => false,
        }
    }
}
