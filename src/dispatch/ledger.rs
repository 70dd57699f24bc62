//! File-backed worker book shared between wrapper processes
//!
//! `<state_dir>/ledger.json`, read and rewritten under an exclusive
//! `flock` on `<state_dir>/ledger.lock`. Each wrapper process spawned by a
//! parallel build sees the others' leases and liveness marks.
//!
//! Leases held by processes that no longer exist are pruned on every
//! access. Liveness marks expire: `available` after the probe TTL and
//! `unreachable` after the unreachable TTL, returning to `unknown`.
//! Probe capacity and job history never expire.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::book::{choose, elapsed_ms, BookError, Lease, Liveness, WorkerBook, WorkerStatus};
use super::lock::LedgerLock;
use super::selection::{Capacity, Scoring};
use crate::inventory::WorkerEntry;

const LEDGER_FILENAME: &str = "ledger.json";
const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ledger {
    version: u32,
    #[serde(default)]
    workers: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerEntry {
    #[serde(default)]
    liveness: Liveness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    leases: Vec<LeaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capacity: Option<Capacity>,
    #[serde(default)]
    jobs: u64,
    #[serde(default)]
    busy_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    id: String,
    pid: u32,
    claimed_at: DateTime<Utc>,
}

/// Expiry settings for liveness marks.
#[derive(Debug, Clone, Copy)]
pub struct LedgerTtl {
    pub available: Duration,
    pub unreachable: Duration,
}

impl Default for LedgerTtl {
    fn default() -> Self {
        Self {
            available: Duration::from_secs(300),
            unreachable: Duration::from_secs(600),
        }
    }
}

impl LedgerEntry {
    fn effective_liveness(&self, ttl: &LedgerTtl, now: DateTime<Utc>) -> Liveness {
        let limit = match self.liveness {
            Liveness::Unknown => return Liveness::Unknown,
            Liveness::Available => ttl.available,
            Liveness::Unreachable => ttl.unreachable,
        };
        match self.marked_at {
            Some(at) => {
                let age = (now - at).to_std().unwrap_or(Duration::ZERO);
                if age > limit {
                    Liveness::Unknown
                } else {
                    self.liveness
                }
            }
            None => Liveness::Unknown,
        }
    }

    fn status(&self, ttl: &LedgerTtl, now: DateTime<Utc>) -> WorkerStatus {
        WorkerStatus {
            liveness: self.effective_liveness(ttl, now),
            outstanding: self.leases.len() as u32,
            capacity: self.capacity,
            jobs: self.jobs,
            busy_ms: self.busy_ms,
        }
    }
}

/// Worker book persisted in a locked JSON ledger.
#[derive(Debug, Clone)]
pub struct LedgerBook {
    dir: PathBuf,
    ttl: LedgerTtl,
    lock_timeout: Duration,
}

impl LedgerBook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: LedgerTtl::default(),
            lock_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_ttl(mut self, ttl: LedgerTtl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILENAME)
    }

    /// Run `f` on the ledger under the lock, then persist it.
    fn update<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> Result<T, BookError> {
        let _lock = LedgerLock::acquire(&self.dir, self.lock_timeout)?;
        let path = self.ledger_path();
        let mut ledger = read_ledger(&path)?;
        prune_dead_leases(&mut ledger);
        let result = f(&mut ledger);
        write_ledger(&path, &ledger)?;
        Ok(result)
    }
}

impl WorkerBook for LedgerBook {
    fn status(&self, worker: &str) -> Result<WorkerStatus, BookError> {
        let ttl = self.ttl;
        self.update(|ledger| {
            ledger
                .workers
                .get(worker)
                .map(|entry| entry.status(&ttl, Utc::now()))
                .unwrap_or_default()
        })
    }

    fn mark(&self, worker: &str, liveness: Liveness) -> Result<(), BookError> {
        self.update(|ledger| {
            let entry = ledger.workers.entry(worker.to_string()).or_default();
            entry.liveness = liveness;
            entry.marked_at = Some(Utc::now());
        })
    }

    fn record_capacity(&self, worker: &str, capacity: Capacity) -> Result<(), BookError> {
        self.update(|ledger| {
            ledger.workers.entry(worker.to_string()).or_default().capacity = Some(capacity);
        })
    }

    fn record_job(&self, worker: &str, elapsed: Duration) -> Result<(), BookError> {
        self.update(|ledger| {
            let entry = ledger.workers.entry(worker.to_string()).or_default();
            entry.jobs += 1;
            entry.busy_ms = entry.busy_ms.saturating_add(elapsed_ms(elapsed));
        })
    }

    fn claim(
        &self,
        workers: &[WorkerEntry],
        exclude: &HashSet<String>,
        scoring: Scoring,
    ) -> Result<Option<Lease>, BookError> {
        let ttl = self.ttl;
        self.update(|ledger| {
            let now = Utc::now();
            let chosen = choose(workers, exclude, scoring, |name| {
                ledger
                    .workers
                    .get(name)
                    .map(|entry| entry.status(&ttl, now))
                    .unwrap_or_default()
            })
            .map(|w| w.name.clone());

            chosen.map(|name| {
                let lease = Lease::new(name.clone());
                ledger.workers.entry(name).or_default().leases.push(LeaseRecord {
                    id: lease.id.clone(),
                    pid: std::process::id(),
                    claimed_at: now,
                });
                lease
            })
        })
    }

    fn release(&self, lease: &Lease) -> Result<(), BookError> {
        self.update(|ledger| {
            if let Some(entry) = ledger.workers.get_mut(&lease.worker) {
                entry.leases.retain(|record| record.id != lease.id);
            }
        })
    }
}

fn read_ledger(path: &Path) -> Result<Ledger, BookError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Ledger {
                version: LEDGER_VERSION,
                ..Ledger::default()
            })
        }
        Err(source) => {
            return Err(BookError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_slice::<Ledger>(&bytes) {
        Ok(ledger) if ledger.version == LEDGER_VERSION => Ok(ledger),
        Ok(ledger) => {
            warn!(path = %path.display(), version = ledger.version, "unsupported ledger version, starting fresh");
            Ok(Ledger {
                version: LEDGER_VERSION,
                ..Ledger::default()
            })
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt ledger, starting fresh");
            Ok(Ledger {
                version: LEDGER_VERSION,
                ..Ledger::default()
            })
        }
    }
}

fn write_ledger(path: &Path, ledger: &Ledger) -> Result<(), BookError> {
    let io_err = |source| BookError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(ledger).map_err(|e| io_err(e.into()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

fn prune_dead_leases(ledger: &mut Ledger) {
    for (name, entry) in ledger.workers.iter_mut() {
        let before = entry.leases.len();
        entry.leases.retain(|record| process_alive(record.pid));
        let pruned = before - entry.leases.len();
        if pruned > 0 {
            debug!(worker = %name, pruned, "pruned leases of exited processes");
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
