//! Probe operation types.
//!
//! A probe asks a worker what it can do right now. The coordinator uses it to
//! move workers out of the `unknown` state and for `ccfarm workers probe`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker self-description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub hostname: String,
    /// Machine architecture as reported by `uname -m`.
    pub arch: String,
    pub cpus: u32,
    /// One-minute load average; zero where the platform has none.
    #[serde(default)]
    pub load_average: f64,
    /// Logical compiler names that resolve to an existing binary.
    pub compilers: Vec<String>,
    pub protocol_version: u32,
    pub worker_version: String,
    pub active_connections: u32,
    pub max_connections: u32,
    pub created_at: DateTime<Utc>,
}

impl ProbeResponse {
    /// Whether the worker can currently take another connection.
    pub fn has_capacity(&self) -> bool {
        self.active_connections < self.max_connections
    }
}
