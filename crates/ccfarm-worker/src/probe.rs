//! Probe operation handler.
//!
//! Reports what this worker can compile and how busy it is.

use std::process::Command;

use ccfarm_protocol::{ProbeResponse, PROTOCOL_VERSION, WORKER_VERSION};
use chrono::Utc;

use crate::compilers::CompilerTable;
use crate::config::cpu_count;

/// Host facts that do not change while the worker runs.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    pub arch: String,
    pub cpus: u32,
}

impl HostInfo {
    /// Collect host facts, falling back to compile-time values.
    pub fn detect() -> Self {
        Self {
            hostname: get_hostname(),
            arch: get_architecture(),
            cpus: cpu_count(),
        }
    }
}

/// Build a probe response for the current moment.
pub fn handle(host: &HostInfo, compilers: &CompilerTable, active: u32, max: u32) -> ProbeResponse {
    ProbeResponse {
        hostname: host.hostname.clone(),
        arch: host.arch.clone(),
        cpus: host.cpus,
        load_average: load_average(),
        compilers: compilers.available(),
        protocol_version: PROTOCOL_VERSION,
        worker_version: WORKER_VERSION.to_string(),
        active_connections: active,
        max_connections: max,
        created_at: Utc::now(),
    }
}

/// One-minute load average.
#[cfg(unix)]
pub fn load_average() -> f64 {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds three doubles and we ask for one.
    let filled = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
    if filled >= 1 {
        loads[0]
    } else {
        0.0
    }
}

#[cfg(not(unix))]
pub fn load_average() -> f64 {
    0.0
}

fn get_hostname() -> String {
    run_command("hostname", &[])
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Get machine architecture.
fn get_architecture() -> String {
    run_command("uname", &["-m"])
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| std::env::consts::ARCH.to_string())
}

/// Run a command and return its stdout.
fn run_command(cmd: &str, args: &[&str]) -> Result<String, std::io::Error> {
    let output = Command::new(cmd).args(args).output()?;

    if output.status.success() {
        String::from_utf8(output.stdout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("command failed: {:?}", output.status.code()),
        ))
    }
}
