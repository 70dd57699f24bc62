//! Worker book: liveness, load and job history per worker
//!
//! `claim` picks the best available worker and records the lease in one
//! step, so concurrent claimers see each other's load.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lock::LockError;
use super::selection::{self, Candidate, Capacity, Scoring};
use crate::inventory::WorkerEntry;

/// Liveness state of a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Not probed yet, or the last mark expired
    #[default]
    Unknown,
    /// Probed successfully
    Available,
    /// Failed a probe or a job at the transport level
    Unreachable,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Available => write!(f, "available"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub liveness: Liveness,
    pub outstanding: u32,
    /// From the last successful probe
    pub capacity: Option<Capacity>,
    /// Jobs the worker answered with a final result
    pub jobs: u64,
    /// Total wall time of those jobs
    pub busy_ms: u64,
}

impl WorkerStatus {
    pub fn average_job_time(&self) -> Option<Duration> {
        (self.jobs > 0).then(|| Duration::from_millis(self.busy_ms / self.jobs))
    }

    fn add_job(&mut self, elapsed: Duration) {
        self.jobs += 1;
        self.busy_ms = self.busy_ms.saturating_add(elapsed_ms(elapsed));
    }
}

pub(crate) fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// A claimed slot on a worker. Must be released when the job ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub worker: String,
    pub id: String,
}

impl Lease {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            id: ulid::Ulid::new().to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BookError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker book poisoned")]
    Poisoned,
}

/// Shared record of worker liveness and load.
pub trait WorkerBook: Send + Sync {
    fn status(&self, worker: &str) -> Result<WorkerStatus, BookError>;

    fn mark(&self, worker: &str, liveness: Liveness) -> Result<(), BookError>;

    fn record_capacity(&self, worker: &str, capacity: Capacity) -> Result<(), BookError>;

    /// Count one finished job and its wall time.
    fn record_job(&self, worker: &str, elapsed: Duration) -> Result<(), BookError>;

    /// Select the best available worker not in `exclude` and lease it.
    fn claim(
        &self,
        workers: &[WorkerEntry],
        exclude: &HashSet<String>,
        scoring: Scoring,
    ) -> Result<Option<Lease>, BookError>;

    fn release(&self, lease: &Lease) -> Result<(), BookError>;
}

/// Choose among `workers` given a status lookup.
pub(crate) fn choose<'a, F>(
    workers: &'a [WorkerEntry],
    exclude: &HashSet<String>,
    scoring: Scoring,
    status: F,
) -> Option<&'a WorkerEntry>
where
    F: Fn(&str) -> WorkerStatus,
{
    let candidates: Vec<Candidate<'a>> = workers
        .iter()
        .filter(|w| !exclude.contains(&w.name))
        .filter_map(|w| {
            let s = status(&w.name);
            (s.liveness == Liveness::Available).then(|| Candidate::new(w, s.outstanding).with_capacity(s.capacity))
        })
        .collect();
    selection::select(&candidates, scoring)
}

/// In-process worker book. Marks never expire.
#[derive(Debug, Default)]
pub struct MemoryBook {
    state: Mutex<HashMap<String, WorkerStatus>>,
}

impl MemoryBook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerBook for MemoryBook {
    fn status(&self, worker: &str) -> Result<WorkerStatus, BookError> {
        let state = self.state.lock().map_err(|_| BookError::Poisoned)?;
        Ok(state.get(worker).copied().unwrap_or_default())
    }

    fn mark(&self, worker: &str, liveness: Liveness) -> Result<(), BookError> {
        let mut state = self.state.lock().map_err(|_| BookError::Poisoned)?;
        state.entry(worker.to_string()).or_default().liveness = liveness;
        Ok(())
    }

    fn record_capacity(&self, worker: &str, capacity: Capacity) -> Result<(), BookError> {
        let mut state = self.state.lock().map_err(|_| BookError::Poisoned)?;
        state.entry(worker.to_string()).or_default().capacity = Some(capacity);
        Ok(())
    }

    fn record_job(&self, worker: &str, elapsed: Duration) -> Result<(), BookError> {
        let mut state = self.state.lock().map_err(|_| BookError::Poisoned)?;
        state.entry(worker.to_string()).or_default().add_job(elapsed);
        Ok(())
    }

    fn claim(
        &self,
        workers: &[WorkerEntry],
        exclude: &HashSet<String>,
        scoring: Scoring,
    ) -> Result<Option<Lease>, BookError> {
        let mut state = self.state.lock().map_err(|_| BookError::Poisoned)?;
        let chosen = choose(workers, exclude, scoring, |name| state.get(name).copied().unwrap_or_default())
            .map(|w| w.name.clone());
        Ok(chosen.map(|name| {
            state.entry(name.clone()).or_default().outstanding += 1;
            Lease::new(name)
        }))
    }

    fn release(&self, lease: &Lease) -> Result<(), BookError> {
        let mut state = self.state.lock().map_err(|_| BookError::Poisoned)?;
        if let Some(status) = state.get_mut(&lease.worker) {
            status.outstanding = status.outstanding.saturating_sub(1);
        }
        Ok(())
    }
}
