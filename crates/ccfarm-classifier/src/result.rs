//! Classifier result types.

use serde::{Deserialize, Serialize};

/// Machine-readable rejection reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "detail")]
pub enum RejectionReason {
    /// Parse error in argv.
    #[serde(rename = "PARSE_ERROR")]
    ParseError(String),

    /// `-c` is absent, so this is a link or a combined compile-and-link.
    #[serde(rename = "NOT_COMPILE_ONLY")]
    NotCompileOnly,

    /// No input has a known source extension.
    #[serde(rename = "NO_SOURCE")]
    NoSource,

    /// More than one source input.
    #[serde(rename = "MULTIPLE_SOURCES")]
    MultipleSources(Vec<String>),

    /// A positional input that is not a source (object, archive, assembly).
    #[serde(rename = "UNSUPPORTED_INPUT")]
    UnsupportedInput(String),

    /// Flag selects a non-object output mode, or is configured local-only.
    #[serde(rename = "DENIED_FLAG")]
    DeniedFlag(String),

    /// Source read from standard input.
    #[serde(rename = "STDIN_SOURCE")]
    StdinSource,

    /// Object written to standard output.
    #[serde(rename = "STDOUT_OUTPUT")]
    StdoutOutput,
}

impl RejectionReason {
    /// Get a machine-readable string representation.
    pub fn to_code(&self) -> String {
        match self {
            RejectionReason::ParseError(e) => format!("PARSE_ERROR:{}", e),
            RejectionReason::NotCompileOnly => "NOT_COMPILE_ONLY".to_string(),
            RejectionReason::NoSource => "NO_SOURCE".to_string(),
            RejectionReason::MultipleSources(s) => format!("MULTIPLE_SOURCES:{}", s.join(",")),
            RejectionReason::UnsupportedInput(i) => format!("UNSUPPORTED_INPUT:{}", i),
            RejectionReason::DeniedFlag(f) => format!("DENIED_FLAG:{}", f),
            RejectionReason::StdinSource => "STDIN_SOURCE".to_string(),
            RejectionReason::StdoutOutput => "STDOUT_OUTPUT".to_string(),
        }
    }
}

/// A remote-eligible compile, split into the parts the wire format carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileInvocation {
    /// Source path as written on the command line.
    pub source: String,

    /// Object path, defaulted to `<source stem>.o` in the working directory.
    pub output: String,

    /// Every argument except `-c`, `-o <output>` and the source, in order.
    pub args: Vec<String>,
}

/// Result of classifying a compiler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierResult {
    /// Whether the invocation may be compiled remotely.
    pub accepted: bool,

    /// The split invocation. None when rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<CompileInvocation>,

    /// Machine-readable rejection reasons.
    #[serde(default)]
    pub rejection_reasons: Vec<RejectionReason>,
}

impl ClassifierResult {
    /// Create an accepted result.
    pub fn accepted(invocation: CompileInvocation) -> Self {
        Self {
            accepted: true,
            invocation: Some(invocation),
            rejection_reasons: Vec::new(),
        }
    }

    /// Create a rejected result.
    pub fn rejected(rejection_reasons: Vec<RejectionReason>) -> Self {
        Self {
            accepted: false,
            invocation: None,
            rejection_reasons,
        }
    }

    /// Get rejection reasons as machine-readable strings.
    pub fn rejection_reason_codes(&self) -> Vec<String> {
        self.rejection_reasons.iter().map(|r| r.to_code()).collect()
    }
}
