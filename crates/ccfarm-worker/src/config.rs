//! Worker configuration.
//!
//! Loaded once at startup from a TOML file, adjusted by command-line flags,
//! then shared read-only by every connection.
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 5555
//! max_connections = 16
//! compile_timeout_seconds = 300
//!
//! [compilers]
//! gcc = ["/usr/local/bin/gcc-13", "/usr/bin/gcc"]
//!
//! [[path_translation]]
//! from = "/Users/alice/src/"
//! to = "/home/build/src/"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compilers::CompilerTable;
use crate::translate::{PathMapping, PathTranslator};

/// Errors loading worker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address to listen on.
    pub bind: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Maximum concurrently served connections.
    pub max_connections: u32,
    /// Wall-clock limit for one compiler run.
    pub compile_timeout_seconds: u64,
    /// Socket read/write timeout per connection.
    pub io_timeout_seconds: u64,
    /// Grace period between SIGTERM and SIGKILL for a timed-out compiler.
    pub termination_grace_seconds: u64,
    /// Directory that holds per-job scratch directories.
    pub scratch_root: PathBuf,
    /// Logical compiler name to ordered candidate paths.
    pub compilers: BTreeMap<String, Vec<PathBuf>>,
    /// Prefix rewrites for absolute paths in compiler arguments.
    pub path_translation: Vec<PathMapping>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: ccfarm_protocol::DEFAULT_PORT,
            max_connections: default_max_connections(),
            compile_timeout_seconds: 300,
            io_timeout_seconds: 60,
            termination_grace_seconds: 5,
            scratch_root: std::env::temp_dir(),
            compilers: default_compilers(),
            path_translation: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits and tables for values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.compile_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("compile_timeout_seconds must be at least 1".into()));
        }
        if self.io_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("io_timeout_seconds must be at least 1".into()));
        }
        for (name, candidates) in &self.compilers {
            if candidates.is_empty() {
                return Err(ConfigError::Invalid(format!("compiler '{}' has no candidate paths", name)));
            }
        }
        for mapping in &self.path_translation {
            if !mapping.from.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "path_translation 'from' must be absolute: {}",
                    mapping.from
                )));
            }
        }
        Ok(())
    }

    /// `bind:port` for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_seconds)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_seconds)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }

    /// Build the compiler lookup table.
    pub fn compiler_table(&self) -> CompilerTable {
        CompilerTable::new(self.compilers.clone())
    }

    /// Build the argument translator.
    pub fn translator(&self) -> PathTranslator {
        PathTranslator::new(self.path_translation.clone())
    }
}

/// Logical CPU count, at least 1.
pub fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn default_max_connections() -> u32 {
    cpu_count() * 2
}

fn default_compilers() -> BTreeMap<String, Vec<PathBuf>> {
    let mut table = BTreeMap::new();
    for name in ["cc", "c++", "gcc", "g++", "clang", "clang++"] {
        table.insert(
            name.to_string(),
            vec![
                PathBuf::from(format!("/usr/local/bin/{}", name)),
                PathBuf::from(format!("/usr/bin/{}", name)),
            ],
        );
    }
    table
}
