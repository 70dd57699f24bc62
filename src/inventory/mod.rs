//! Worker Inventory
//!
//! The set of compile workers the coordinator may dispatch to. Entries come
//! from `[[worker]]` tables in `ccfarm.toml` or, when set, from
//! `CCFARM_HOSTS`.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Worker inventory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerInventory {
    /// List of workers
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerEntry>,
}

/// A single worker entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    /// Unique identifier for this worker (must be unique across inventory)
    pub name: String,

    /// Hostname or IP address
    pub host: String,

    /// Compile port (default: 5555)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Static capability weight; higher gets more jobs (default: 1.0)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// SSH user for artifact sync (default: current user)
    #[serde(default)]
    pub user: Option<String>,

    /// SSH port for artifact sync (default: 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Directory on the worker that mirrors the coordinator's build root
    #[serde(default)]
    pub mirror_root: Option<String>,
}

fn default_port() -> u16 {
    ccfarm_protocol::DEFAULT_PORT
}

fn default_weight() -> f64 {
    1.0
}

fn default_ssh_port() -> u16 {
    22
}

/// Errors that can occur when loading or validating worker inventory
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate worker name: '{0}'")]
    DuplicateName(String),

    #[error("Worker '{name}': missing required field '{field}'")]
    MissingField { name: String, field: String },

    #[error("Worker '{name}': invalid value for '{field}': {reason}")]
    InvalidValue {
        name: String,
        field: String,
        reason: String,
    },

    #[error("Invalid host list entry '{0}'")]
    InvalidHostSpec(String),
}

impl WorkerInventory {
    /// Build from entries, validating them.
    pub fn new(workers: Vec<WorkerEntry>) -> Result<Self, InventoryError> {
        let inventory = Self { workers };
        inventory.validate()?;
        Ok(inventory)
    }

    /// Parse worker inventory from TOML string
    pub fn parse(content: &str) -> Result<Self, InventoryError> {
        let inventory: WorkerInventory = toml::from_str(content)?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Parse a comma-separated `host[:port]` list. Every entry gets weight
    /// 1.0 and is named after its spec.
    pub fn from_host_list(list: &str) -> Result<Self, InventoryError> {
        let workers = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(WorkerEntry::from_host_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(workers)
    }

    /// Validate the inventory
    fn validate(&self) -> Result<(), InventoryError> {
        let mut seen_names = HashSet::new();
        for worker in &self.workers {
            if !seen_names.insert(&worker.name) {
                return Err(InventoryError::DuplicateName(worker.name.clone()));
            }
        }

        for worker in &self.workers {
            worker.validate()?;
        }

        Ok(())
    }

    /// Get a worker by name
    pub fn get(&self, name: &str) -> Option<&WorkerEntry> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Check if inventory is empty
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Get the number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }
}

impl WorkerEntry {
    /// Entry with defaults for everything but name and address.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            user: None,
            ssh_port: default_ssh_port(),
            mirror_root: None,
        }
    }

    /// Set the capability weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6
    /// address.
    pub fn from_host_spec(spec: &str) -> Result<Self, InventoryError> {
        let invalid = || InventoryError::InvalidHostSpec(spec.to_string());
        let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());

        let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            match after {
                "" => (host, default_port()),
                _ => (host, parse_port(after.strip_prefix(':').ok_or_else(invalid)?)?),
            }
        } else if spec.matches(':').count() > 1 {
            (spec, default_port())
        } else {
            match spec.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (spec, default_port()),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(spec, host, port))
    }

    /// `host:port` for connecting, bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `user@host` (or just `host`) for ssh.
    pub fn ssh_destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Validate the worker entry
    fn validate(&self) -> Result<(), InventoryError> {
        if self.name.is_empty() {
            return Err(InventoryError::MissingField {
                name: "(unnamed)".to_string(),
                field: "name".to_string(),
            });
        }

        if self.host.is_empty() {
            return Err(InventoryError::MissingField {
                name: self.name.clone(),
                field: "host".to_string(),
            });
        }

        if self.port == 0 {
            return Err(InventoryError::InvalidValue {
                name: self.name.clone(),
                field: "port".to_string(),
                reason: "port cannot be 0".to_string(),
            });
        }

        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(InventoryError::InvalidValue {
                name: self.name.clone(),
                field: "weight".to_string(),
                reason: format!("weight must be positive, got {}", self.weight),
            });
        }

        if matches!(&self.user, Some(user) if user.is_empty()) {
            return Err(InventoryError::InvalidValue {
                name: self.name.clone(),
                field: "user".to_string(),
                reason: "user cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for WorkerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}, weight {})", self.name, self.host, self.port, self.weight)
    }
}
