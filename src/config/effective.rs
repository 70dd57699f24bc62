//! Effective coordinator configuration
//!
//! Built from four layers: built-in defaults, the TOML file, `CCFARM_*`
//! environment overrides and command-line flags. The result records which
//! sources contributed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ccfarm_classifier::ClassifierConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::defaults::BuiltinDefaults;
use super::env::EnvOverrides;
use super::merge::{merge_layers, toml_to_json};
use crate::dispatch::selection::Scoring;
use crate::inventory::{InventoryError, WorkerEntry, WorkerInventory};

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (file layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (file layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Errors building the effective configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// `[coordinator]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub fallback: bool,
    pub disabled: bool,
    pub verbose: bool,
    /// Logical compiler override.
    #[serde(default)]
    pub compiler: Option<String>,
    #[serde(default)]
    pub scoring: Scoring,
    pub connect_timeout_seconds: u64,
    pub compile_timeout_seconds: u64,
    pub read_margin_seconds: u64,
    /// Directory holding the shared worker ledger.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    pub probe_ttl_seconds: u64,
    pub unreachable_ttl_seconds: u64,
    pub lock_timeout_seconds: u64,
    /// Logical compiler name to local binary, for fallback compiles.
    #[serde(default)]
    pub local_compilers: BTreeMap<String, PathBuf>,
}

impl DispatchSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// How long to wait for a worker's answer.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_seconds + self.read_margin_seconds)
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_seconds)
    }

    pub fn unreachable_ttl(&self) -> Duration {
        Duration::from_secs(self.unreachable_ttl_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Configured state directory, or `$TMPDIR/ccfarm-<uid>`.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!("ccfarm-{}", user_id())),
        }
    }
}

/// `[reconcile]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Build tree to scan; the current directory when unset.
    #[serde(default)]
    pub build_root: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub interval_seconds: u64,
    pub push_timeout_seconds: u64,
    pub skip_unchanged: bool,
    /// Mirror root for workers that do not set their own.
    #[serde(default)]
    pub mirror_root: Option<String>,
}

impl ReconcileSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_seconds)
    }
}

/// Fully merged coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub coordinator: DispatchSettings,
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerEntry>,

    /// Contributing sources in precedence order
    #[serde(skip)]
    pub sources: Vec<ConfigSource>,
}

impl CoordinatorConfig {
    /// Built-in defaults only.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::build(None, &EnvOverrides::default(), None)
    }

    /// Load using the file named by `CCFARM_CONFIG` or the default location.
    pub fn load(env: &EnvOverrides, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        match &env.config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.clone()));
                }
                Self::build(Some(path), env, cli_overrides)
            }
            None => {
                let path = default_config_path();
                let path = path.as_deref().filter(|p| p.exists());
                Self::build(path, env, cli_overrides)
            }
        }
    }

    /// Merge layers and validate.
    pub fn build(
        file: Option<&Path>,
        env: &EnvOverrides,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = file {
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        layers.push(env.to_value()?);
        sources.push(ConfigSource {
            origin: ConfigOrigin::Env,
            path: None,
            digest: None,
        });

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let mut config: CoordinatorConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.sources = sources;
        config.validate()?;
        Ok(config)
    }

    /// Validated inventory.
    pub fn inventory(&self) -> Result<WorkerInventory, ConfigError> {
        Ok(WorkerInventory::new(self.workers.clone())?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        WorkerInventory::new(self.workers.clone())?;
        if self.coordinator.connect_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("connect_timeout_seconds must be at least 1".into()));
        }
        if self.reconcile.interval_seconds == 0 {
            return Err(ConfigError::Invalid("reconcile interval_seconds must be at least 1".into()));
        }
        if self.reconcile.patterns.is_empty() {
            return Err(ConfigError::Invalid("reconcile patterns cannot be empty".into()));
        }
        Ok(())
    }
}

/// `~/.config/ccfarm/ccfarm.toml`
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/ccfarm/ccfarm.toml"))
}

/// Load and parse a TOML file, returning the value and digest
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let digest = hex::encode(Sha256::digest(&bytes));

    let contents = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    let toml_value: toml::Value = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok((toml_to_json(toml_value), digest))
}

#[cfg(unix)]
fn user_id() -> String {
    nix::unistd::getuid().to_string()
}

#[cfg(not(unix))]
fn user_id() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| "user".to_string())
}
