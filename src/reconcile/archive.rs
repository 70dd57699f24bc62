//! Generated-artifact scan and canonical archive
//!
//! Walks the build root for files matching the artifact patterns and packs
//! them into one tar with normalized headers (sorted paths, mtime 0,
//! uid/gid 0, mode 0644 or 0755), so identical inputs give identical bytes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tar::{Builder, Header};
use tracing::warn;
use walkdir::WalkDir;

use super::ReconcileError;

/// Compiled artifact patterns.
#[derive(Debug, Clone)]
pub struct ArtifactPatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

impl ArtifactPatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ReconcileError> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            builder.add(Glob::new(pattern)?);
            kept.push(pattern.to_string());
        }
        Ok(Self {
            patterns: kept,
            set: builder.build()?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Match against a path relative to the build root. `*.inc` matches at
    /// any depth.
    pub fn is_match(&self, rel_path: &Path) -> bool {
        self.set.is_match(rel_path)
            || rel_path
                .file_name()
                .map(|name| self.set.is_match(Path::new(name)))
                .unwrap_or(false)
    }
}

/// One tick's archive.
#[derive(Debug, Clone)]
pub struct GeneratedArchive {
    pub bytes: Vec<u8>,
    /// Paths relative to the build root, sorted
    pub files: Vec<PathBuf>,
    /// Lowercase hex SHA-256 of `bytes`
    pub digest: String,
}

impl GeneratedArchive {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Matching files under `root`, relative and sorted.
///
/// Entries that cannot be read (a directory removed mid-build, a permission
/// error) are logged and skipped. Only an unreadable root fails the scan.
pub fn scan(root: &Path, patterns: &ArtifactPatterns) -> Result<Vec<PathBuf>, ReconcileError> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if patterns.is_match(rel) {
            found.push(rel.to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

/// Scan `root` and pack the matches.
pub fn build_archive(root: &Path, patterns: &ArtifactPatterns) -> Result<GeneratedArchive, ReconcileError> {
    let files = scan(root, patterns)?;

    // Read everything first so a file vanishing mid-tick is skipped, not fatal.
    let mut contents: BTreeMap<PathBuf, (Vec<u8>, bool)> = BTreeMap::new();
    for rel in &files {
        let full = root.join(rel);
        match fs::read(&full) {
            Ok(data) => {
                contents.insert(rel.clone(), (data, is_executable(&full)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(ReconcileError::Io { path: full, source }),
        }
    }

    let mut bytes = Vec::new();
    {
        let mut builder = Builder::new(&mut bytes);
        for (rel, (data, executable)) in &contents {
            let mut header = Header::new_gnu();
            header.set_path(rel).map_err(ReconcileError::Archive)?;
            header.set_size(data.len() as u64);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(if *executable { 0o755 } else { 0o644 });
            header.set_cksum();
            builder.append(&header, data.as_slice()).map_err(ReconcileError::Archive)?;
        }
        builder.finish().map_err(ReconcileError::Archive)?;
    }

    let digest = hex::encode(Sha256::digest(&bytes));
    Ok(GeneratedArchive {
        bytes,
        files: contents.into_keys().collect(),
        digest,
    })
}

/// Unpack an archive into `dir`, creating it if needed.
pub fn extract_into(archive: &[u8], dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(std::io::Cursor::new(archive));
    archive.set_preserve_mtime(false);
    archive.unpack(dir)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
