//! Classifier configuration types.

use serde::{Deserialize, Serialize};

/// Source extensions recognised by default.
pub const DEFAULT_SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "c++", "m", "mm", "C"];

/// Mode flags that never go remote: they ask for something other than an
/// object file.
pub const DEFAULT_DENIED_FLAGS: &[&str] = &["-E", "-S", "-M", "-MM"];

/// Configuration for the classifier.
///
/// Extensions are matched case-sensitively, so `.C` (C++) and `.c` (C) are
/// distinct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// File extensions (without the dot) treated as compilable sources.
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,

    /// Flags that force a local compile.
    #[serde(default = "default_denied_flags")]
    pub denied_flags: Vec<String>,

    /// Extra flags that force a local compile, on top of `denied_flags`.
    #[serde(default)]
    pub local_only_flags: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            source_extensions: default_source_extensions(),
            denied_flags: default_denied_flags(),
            local_only_flags: Vec::new(),
        }
    }
}

impl ClassifierConfig {
    /// Whether `path` ends in a known source extension.
    pub fn is_source(&self, path: &str) -> bool {
        match source_extension(path) {
            Some(ext) => self.source_extensions.iter().any(|e| e == ext),
            None => false,
        }
    }

    /// Whether `flag` forces a local compile.
    pub fn is_denied(&self, flag: &str) -> bool {
        self.denied_flags.iter().any(|f| f == flag) || self.local_only_flags.iter().any(|f| f == flag)
    }
}

/// Extension of the final path component, if any.
pub(crate) fn source_extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < file.len() => Some(&file[dot + 1..]),
        _ => None,
    }
}

fn default_source_extensions() -> Vec<String> {
    DEFAULT_SOURCE_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

fn default_denied_flags() -> Vec<String> {
    DEFAULT_DENIED_FLAGS.iter().map(|s| s.to_string()).collect()
}
