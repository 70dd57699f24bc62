//! Configuration merge system
//!
//! Implements the 4-layer configuration merge:
//! 1. Built-in defaults
//! 2. Coordinator file (`CCFARM_CONFIG` or ~/.config/ccfarm/ccfarm.toml)
//! 3. `CCFARM_*` environment variables
//! 4. CLI flags

mod defaults;
mod effective;
mod env;
mod merge;

pub use defaults::{BuiltinDefaults, DEFAULT_PATTERNS};
pub use effective::{
    default_config_path, ConfigError, ConfigOrigin, ConfigSource, CoordinatorConfig, DispatchSettings,
    ReconcileSettings,
};
pub use env::{
    EnvOverrides, ENV_COMPILER, ENV_CONFIG, ENV_DISABLED, ENV_FALLBACK, ENV_HOSTS, ENV_STATE_DIR, ENV_VERBOSE,
};
pub use merge::{deep_merge, merge_layers, toml_to_json};
