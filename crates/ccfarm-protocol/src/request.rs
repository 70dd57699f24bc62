//! Compile request payload.

use serde::{Deserialize, Serialize};

/// A single compile job as sent to a worker.
///
/// `args` never contains `-c`, `-o` or the source path; the worker appends
/// those itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Correlation id for logs on both sides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Logical compiler name, e.g. "gcc" or "g++".
    pub compiler: String,
    /// Ordered compiler flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// File name the source is written under on the worker.
    pub source_name: String,
    /// Raw source bytes. Never interpreted by the dispatch layer.
    #[serde(with = "crate::b64")]
    pub source: Vec<u8>,
    /// File name the compiler writes its object to.
    pub output_name: String,
}

impl CompileRequest {
    /// Build a request with the object name derived from the source name.
    pub fn new(compiler: impl Into<String>, source_name: impl Into<String>, source: Vec<u8>) -> Self {
        let source_name = source_name.into();
        let output_name = object_name_for(&source_name);
        Self {
            job_id: None,
            compiler: compiler.into(),
            args: Vec::new(),
            source_name,
            source,
            output_name,
        }
    }

    /// Set the compiler flags.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the correlation id.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Override the output file name.
    pub fn with_output_name(mut self, output_name: impl Into<String>) -> Self {
        self.output_name = output_name.into();
        self
    }

    /// Job id for logging, or "-" when the coordinator did not set one.
    pub fn job_label(&self) -> &str {
        self.job_id.as_deref().unwrap_or("-")
    }
}

/// `foo.cpp` -> `foo.o`; names without an extension get `.o` appended.
pub fn object_name_for(source_name: &str) -> String {
    match source_name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}.o", &source_name[..dot]),
        _ => format!("{}.o", source_name),
    }
}
