//! Compile response payload.

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Outcome of one compile request.
///
/// `object` is present iff `success`; `error` and `failure` are present iff
/// not `success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResponse {
    pub success: bool,
    /// Object file bytes.
    #[serde(default, with = "crate::b64::option", skip_serializing_if = "Option::is_none")]
    pub object: Option<Vec<u8>>,
    /// Captured compiler standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured compiler standard error (warnings on success).
    #[serde(default)]
    pub stderr: String,
    /// Human-readable failure summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Compiler exit status, when the compiler ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl CompileResponse {
    /// Create a success response.
    pub fn success(object: Vec<u8>, stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            object: Some(object),
            stdout,
            stderr,
            error: None,
            failure: None,
            exit_code: Some(0),
        }
    }

    /// Create a failure response with no captured output.
    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            object: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            failure: Some(kind),
            exit_code: None,
        }
    }

    /// Attach captured output to a failure.
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Attach the compiler's exit status.
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Failure kind, treating a failure without one as `Internal`.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.success {
            None
        } else {
            Some(self.failure.unwrap_or(FailureKind::Internal))
        }
    }

    /// Whether this is a legitimate compiler result (success or diagnostic)
    /// that must be handed back to the build tool as-is.
    pub fn is_final(&self) -> bool {
        self.failure_kind().map_or(true, FailureKind::is_execution)
    }
}
