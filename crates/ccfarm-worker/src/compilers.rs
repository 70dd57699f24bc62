//! Logical compiler resolution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Immutable map from logical compiler name to candidate binaries.
///
/// Only names present in the table can run; the request never supplies a
/// path of its own.
#[derive(Debug, Clone, Default)]
pub struct CompilerTable {
    entries: BTreeMap<String, Vec<PathBuf>>,
}

impl CompilerTable {
    pub fn new(entries: BTreeMap<String, Vec<PathBuf>>) -> Self {
        Self { entries }
    }

    /// First candidate for `name` that exists as a file.
    pub fn resolve(&self, name: &str) -> Option<&Path> {
        self.entries
            .get(name)?
            .iter()
            .map(PathBuf::as_path)
            .find(|path| path.is_file())
    }

    /// Names that currently resolve, sorted.
    pub fn available(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|name| self.resolve(name).is_some())
            .cloned()
            .collect()
    }
}
