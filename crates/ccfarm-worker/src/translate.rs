//! Absolute-path rewriting for compiler arguments.
//!
//! The coordinator's build tree is mirrored on each worker under a different
//! root. Include and library paths in the forwarded flags still carry the
//! coordinator's prefix; this module swaps it for the local one.

use serde::{Deserialize, Serialize};

/// Flags that carry a path glued to the flag itself (`-I/usr/include`).
///
/// Longer markers first so `-isystem` is not mistaken for something shorter.
const PATH_FLAG_PREFIXES: &[&str] = &[
    "--sysroot=",
    "-idirafter",
    "-isystem",
    "-imacros",
    "-include",
    "-iquote",
    "-I",
    "-F",
    "-L",
];

/// One prefix rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
}

impl PathMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Ordered list of prefix rewrites. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    mappings: Vec<PathMapping>,
}

impl PathTranslator {
    pub fn new(mappings: Vec<PathMapping>) -> Self {
        Self { mappings }
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Translate a single argument.
    pub fn translate(&self, arg: &str) -> String {
        if self.mappings.is_empty() {
            return arg.to_string();
        }

        if arg.starts_with('/') {
            return self.rewrite(arg).unwrap_or_else(|| arg.to_string());
        }

        for flag in PATH_FLAG_PREFIXES {
            if let Some(path) = arg.strip_prefix(flag) {
                if path.starts_with('/') {
                    if let Some(rewritten) = self.rewrite(path) {
                        return format!("{}{}", flag, rewritten);
                    }
                }
                break;
            }
        }

        arg.to_string()
    }

    /// Translate every argument, preserving order.
    pub fn translate_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|arg| self.translate(arg)).collect()
    }

    fn rewrite(&self, path: &str) -> Option<String> {
        self.mappings.iter().find_map(|mapping| {
            path.strip_prefix(mapping.from.as_str())
                .map(|rest| format!("{}{}", mapping.to, rest))
        })
    }
}
