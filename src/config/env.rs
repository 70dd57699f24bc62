//! Environment overrides (layer 3)
//!
//! Reads the `CCFARM_*` variables. Parsing takes an explicit variable list so
//! tests never touch the process environment.

use std::path::PathBuf;

use serde_json::{json, Map, Value};

use crate::inventory::{InventoryError, WorkerInventory};

pub const ENV_HOSTS: &str = "CCFARM_HOSTS";
pub const ENV_FALLBACK: &str = "CCFARM_FALLBACK";
pub const ENV_VERBOSE: &str = "CCFARM_VERBOSE";
pub const ENV_DISABLED: &str = "CCFARM_DISABLED";
pub const ENV_COMPILER: &str = "CCFARM_COMPILER";
pub const ENV_CONFIG: &str = "CCFARM_CONFIG";
pub const ENV_STATE_DIR: &str = "CCFARM_STATE_DIR";

/// Values taken from `CCFARM_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub hosts: Option<String>,
    pub fallback: Option<bool>,
    pub verbose: Option<bool>,
    pub disabled: Option<bool>,
    pub compiler: Option<String>,
    pub config_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl EnvOverrides {
    /// Read from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Read from an explicit list of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut overrides = Self::default();
        for (key, value) in vars {
            let value: String = value.into();
            match key.as_ref() {
                ENV_HOSTS => overrides.hosts = Some(value),
                ENV_FALLBACK => overrides.fallback = Some(!is_falsy(&value)),
                ENV_VERBOSE => overrides.verbose = Some(is_truthy(&value)),
                ENV_DISABLED => overrides.disabled = Some(is_truthy(&value)),
                ENV_COMPILER if !value.is_empty() => overrides.compiler = Some(value),
                ENV_CONFIG if !value.is_empty() => overrides.config_path = Some(PathBuf::from(value)),
                ENV_STATE_DIR if !value.is_empty() => overrides.state_dir = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        overrides
    }

    /// Whether verbose logging was requested.
    pub fn is_verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }

    /// Convert to a JSON layer for merging.
    pub fn to_value(&self) -> Result<Value, InventoryError> {
        let mut coordinator = Map::new();
        if let Some(fallback) = self.fallback {
            coordinator.insert("fallback".into(), json!(fallback));
        }
        if let Some(verbose) = self.verbose {
            coordinator.insert("verbose".into(), json!(verbose));
        }
        if let Some(disabled) = self.disabled {
            coordinator.insert("disabled".into(), json!(disabled));
        }
        if let Some(compiler) = &self.compiler {
            coordinator.insert("compiler".into(), json!(compiler));
        }
        if let Some(dir) = &self.state_dir {
            coordinator.insert("state_dir".into(), json!(dir));
        }

        let mut layer = Map::new();
        layer.insert("coordinator".into(), Value::Object(coordinator));

        if let Some(hosts) = self.hosts.as_deref().filter(|h| !h.trim().is_empty()) {
            let inventory = WorkerInventory::from_host_list(hosts)?;
            layer.insert(
                "worker".into(),
                serde_json::to_value(&inventory.workers).unwrap_or(Value::Array(Vec::new())),
            );
        }

        Ok(Value::Object(layer))
    }
}

fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn is_truthy(value: &str) -> bool {
    !value.trim().is_empty() && !is_falsy(value)
}
