//! Artifact reconciler
//!
//! Keeps generated build inputs (headers, `.inc`/`.def` tables) present on
//! every worker's mirror of the build tree. Each tick scans the build root,
//! packs every match into one archive and pushes it to all workers at once.
//! A worker that fails or times out misses that tick only.

pub mod archive;
pub mod push;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use archive::{build_archive, extract_into, scan, ArtifactPatterns, GeneratedArchive};
pub use push::{ArchivePusher, DirectoryPusher, PushError, SshPusher, REMOTE_ARCHIVE_PATH};

use crate::config::ReconcileSettings;
use crate::inventory::WorkerEntry;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid artifact pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("scan failed: {0}")]
    Scan(#[from] walkdir::Error),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Archive(std::io::Error),
}

/// Result of one push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushOutcome {
    Delivered,
    /// Archive unchanged since the last delivery
    Unchanged,
    Failed { error: String },
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub files: usize,
    pub archive_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub pushes: Vec<(String, PushOutcome)>,
    pub elapsed_ms: u64,
}

impl TickReport {
    pub fn delivered(&self) -> Vec<&str> {
        self.with_outcome(|o| *o == PushOutcome::Delivered)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_outcome(|o| matches!(o, PushOutcome::Failed { .. }))
    }

    fn with_outcome(&self, pred: impl Fn(&PushOutcome) -> bool) -> Vec<&str> {
        self.pushes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Periodic fan-out of generated artifacts.
pub struct Reconciler {
    build_root: PathBuf,
    patterns: ArtifactPatterns,
    workers: Vec<WorkerEntry>,
    pusher: Arc<dyn ArchivePusher>,
    push_timeout: Duration,
    skip_unchanged: bool,
    delivered: Mutex<HashMap<String, String>>,
}

impl Reconciler {
    pub fn new(
        build_root: impl Into<PathBuf>,
        patterns: ArtifactPatterns,
        workers: Vec<WorkerEntry>,
        pusher: Arc<dyn ArchivePusher>,
    ) -> Self {
        Self {
            build_root: build_root.into(),
            patterns,
            workers,
            pusher,
            push_timeout: Duration::from_secs(60),
            skip_unchanged: false,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Build from `[reconcile]` settings.
    pub fn from_settings(
        build_root: impl Into<PathBuf>,
        settings: &ReconcileSettings,
        workers: Vec<WorkerEntry>,
        pusher: Arc<dyn ArchivePusher>,
    ) -> Result<Self, ReconcileError> {
        let patterns = ArtifactPatterns::new(settings.patterns.as_slice())?;
        Ok(Self::new(build_root, patterns, workers, pusher)
            .with_push_timeout(settings.push_timeout())
            .with_skip_unchanged(settings.skip_unchanged))
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    pub fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Scan, pack and push once. Push failures are reported, not returned.
    pub fn tick(&self) -> Result<TickReport, ReconcileError> {
        let start = Instant::now();
        let archive = build_archive(&self.build_root, &self.patterns)?;
        let mut report = TickReport {
            files: archive.files.len(),
            archive_bytes: archive.len(),
            ..TickReport::default()
        };

        if archive.is_empty() {
            debug!(root = %self.build_root.display(), "no generated artifacts");
            report.elapsed_ms = start.elapsed().as_millis() as u64;
            return Ok(report);
        }
        report.digest = Some(archive.digest.clone());

        let last_delivered = self.delivered.lock().map(|d| d.clone()).unwrap_or_default();

        let pushes: Vec<(String, PushOutcome)> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|worker| {
                    let archive = &archive;
                    let unchanged =
                        self.skip_unchanged && last_delivered.get(&worker.name) == Some(&archive.digest);
                    scope.spawn(move || {
                        if unchanged {
                            return PushOutcome::Unchanged;
                        }
                        match self.pusher.push(worker, archive, self.push_timeout) {
                            Ok(()) => PushOutcome::Delivered,
                            Err(e) => PushOutcome::Failed { error: e.to_string() },
                        }
                    })
                })
                .collect();

            self.workers
                .iter()
                .zip(handles)
                .map(|(worker, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| PushOutcome::Failed {
                        error: "push thread panicked".to_string(),
                    });
                    (worker.name.clone(), outcome)
                })
                .collect()
        });

        if let Ok(mut delivered) = self.delivered.lock() {
            for (name, outcome) in &pushes {
                if *outcome == PushOutcome::Delivered {
                    delivered.insert(name.clone(), archive.digest.clone());
                }
            }
        }

        for (name, outcome) in &pushes {
            match outcome {
                PushOutcome::Delivered => debug!(worker = %name, "artifacts delivered"),
                PushOutcome::Unchanged => debug!(worker = %name, "artifacts unchanged, skipped"),
                PushOutcome::Failed { error } => warn!(worker = %name, %error, "artifact push failed"),
            }
        }

        report.pushes = pushes;
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            files = report.files,
            bytes = report.archive_bytes,
            delivered = report.delivered().len(),
            failed = report.failed().len(),
            elapsed_ms = report.elapsed_ms,
            "reconcile tick"
        );
        Ok(report)
    }

    /// Tick every `interval` until `stop` is set. Tick errors are logged.
    pub fn run(&self, interval: Duration, stop: &AtomicBool) {
        info!(root = %self.build_root.display(), workers = self.workers.len(), ?interval, "reconciler started");
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.tick() {
                warn!(error = %e, "reconcile tick failed");
            }
            sleep_unless_stopped(interval, stop);
        }
        info!("reconciler stopped");
    }
}

fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingPusher {
        pushes: AtomicUsize,
    }

    impl ArchivePusher for CountingPusher {
        fn push(&self, _worker: &WorkerEntry, _archive: &GeneratedArchive, _timeout: Duration) -> Result<(), PushError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn patterns() -> ArtifactPatterns {
        ArtifactPatterns::new(&["*.inc"]).unwrap()
    }

    fn workers() -> Vec<WorkerEntry> {
        vec![WorkerEntry::new("a", "a.local", 5555), WorkerEntry::new("b", "b.local", 5555)]
    }

    #[test]
    fn test_empty_set_pushes_nothing() {
        let root = TempDir::new().unwrap();
        let pusher = Arc::new(CountingPusher::default());
        let reconciler = Reconciler::new(root.path(), patterns(), workers(), pusher.clone());
        let report = reconciler.tick().unwrap();
        assert_eq!(report.files, 0);
        assert!(report.pushes.is_empty());
        assert_eq!(pusher.pushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_full_set_every_tick_by_default() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("x.inc"), "Z").unwrap();
        let pusher = Arc::new(CountingPusher::default());
        let reconciler = Reconciler::new(root.path(), patterns(), workers(), pusher.clone());
        reconciler.tick().unwrap();
        reconciler.tick().unwrap();
        assert_eq!(pusher.pushes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_skip_unchanged() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("x.inc"), "Z").unwrap();
        let pusher = Arc::new(CountingPusher::default());
        let reconciler =
            Reconciler::new(root.path(), patterns(), workers(), pusher.clone()).with_skip_unchanged(true);

        reconciler.tick().unwrap();
        let second = reconciler.tick().unwrap();
        assert_eq!(pusher.pushes.load(Ordering::SeqCst), 2);
        assert!(second.pushes.iter().all(|(_, o)| *o == PushOutcome::Unchanged));

        fs::write(root.path().join("x.inc"), "Y").unwrap();
        reconciler.tick().unwrap();
        assert_eq!(pusher.pushes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_run_stops_on_flag() {
        let root = TempDir::new().unwrap();
        let reconciler = Reconciler::new(root.path(), patterns(), workers(), Arc::new(CountingPusher::default()));
        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| reconciler.run(Duration::from_secs(30), &stop));
            std::thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::SeqCst);
        });
    }
}
