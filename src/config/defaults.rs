//! Built-in defaults (layer 1)
//!
//! Hardcoded defaults for all configuration values.

use serde::{Deserialize, Serialize};

/// Default generated-artifact patterns.
pub const DEFAULT_PATTERNS: &[&str] = &["*.inc", "*.def", "*.h", "*.hpp", "*.gen"];

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Fall back to a local compile when no worker can take the job
    pub fallback: bool,

    /// TCP connect timeout in seconds
    pub connect_timeout_seconds: u64,

    /// Worker-side compile limit the coordinator waits for, in seconds
    pub compile_timeout_seconds: u64,

    /// Extra read time on top of the compile limit, in seconds
    pub read_margin_seconds: u64,

    /// How long a successful probe keeps a worker `available`
    pub probe_ttl_seconds: u64,

    /// How long a failure keeps a worker `unreachable`
    pub unreachable_ttl_seconds: u64,

    /// Maximum wait for the shared ledger lock
    pub lock_timeout_seconds: u64,

    /// Reconciler tick interval in seconds
    pub reconcile_interval_seconds: u64,

    /// Per-worker push timeout in seconds
    pub push_timeout_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            fallback: true,
            connect_timeout_seconds: 2,
            compile_timeout_seconds: 300,
            read_margin_seconds: 30,
            probe_ttl_seconds: 300,
            unreachable_ttl_seconds: 600,
            lock_timeout_seconds: 10,
            reconcile_interval_seconds: 5,
            push_timeout_seconds: 60,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "coordinator": {
                "fallback": self.fallback,
                "disabled": false,
                "verbose": false,
                "scoring": "weight",
                "connect_timeout_seconds": self.connect_timeout_seconds,
                "compile_timeout_seconds": self.compile_timeout_seconds,
                "read_margin_seconds": self.read_margin_seconds,
                "probe_ttl_seconds": self.probe_ttl_seconds,
                "unreachable_ttl_seconds": self.unreachable_ttl_seconds,
                "lock_timeout_seconds": self.lock_timeout_seconds,
                "local_compilers": {}
            },
            "reconcile": {
                "patterns": DEFAULT_PATTERNS,
                "interval_seconds": self.reconcile_interval_seconds,
                "push_timeout_seconds": self.push_timeout_seconds,
                "skip_unchanged": false
            },
            "classifier": {},
            "worker": []
        })
    }
}
