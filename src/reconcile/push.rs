//! Archive delivery to workers
//!
//! `SshPusher` runs one `ssh` per worker that stores the archive at
//! `~/.ccfarm/generated.tar` and extracts it into the worker's mirror root.
//! `DirectoryPusher` extracts into a local directory instead.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use super::archive::{extract_into, GeneratedArchive};
use crate::inventory::WorkerEntry;

/// Home-relative path of the stored archive on each worker.
pub const REMOTE_ARCHIVE_PATH: &str = ".ccfarm/generated.tar";

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("no mirror root configured for worker {0}")]
    NoMirror(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("push timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote command exited with {status}: {stderr}")]
    Remote { status: String, stderr: String },

    #[error("extract into {path} failed: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivers an archive to one worker.
pub trait ArchivePusher: Send + Sync {
    fn push(&self, worker: &WorkerEntry, archive: &GeneratedArchive, timeout: Duration) -> Result<(), PushError>;
}

/// Pushes over `ssh`.
#[derive(Debug, Clone)]
pub struct SshPusher {
    program: String,
    default_mirror_root: Option<String>,
    connect_timeout: Duration,
}

impl SshPusher {
    /// `default_mirror_root` applies to workers without their own.
    pub fn new(default_mirror_root: Option<String>) -> Self {
        Self {
            program: "ssh".to_string(),
            default_mirror_root,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn mirror_root<'a>(&'a self, worker: &'a WorkerEntry) -> Option<&'a str> {
        worker
            .mirror_root
            .as_deref()
            .or(self.default_mirror_root.as_deref())
    }

    /// Arguments for one push.
    pub fn build_args(&self, worker: &WorkerEntry, mirror_root: &str) -> Vec<String> {
        let root = shell_quote(mirror_root);
        let script = format!(
            "mkdir -p ~/.ccfarm && cat > ~/{archive} && mkdir -p {root} && tar -xf ~/{archive} -C {root}",
            archive = REMOTE_ARCHIVE_PATH,
            root = root,
        );
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            worker.ssh_port.to_string(),
            worker.ssh_destination(),
            script,
        ]
    }
}

impl ArchivePusher for SshPusher {
    fn push(&self, worker: &WorkerEntry, archive: &GeneratedArchive, timeout: Duration) -> Result<(), PushError> {
        let mirror_root = self
            .mirror_root(worker)
            .ok_or_else(|| PushError::NoMirror(worker.name.clone()))?;
        let args = self.build_args(worker, mirror_root);
        debug!(worker = %worker.name, bytes = archive.len(), "pushing archive over ssh");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PushError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        run_with_input(&mut child, &archive.bytes, timeout)
    }
}

/// Feed `input` to the child's stdin and wait up to `timeout`.
fn run_with_input(child: &mut Child, input: &[u8], timeout: Duration) -> Result<(), PushError> {
    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        })
    });

    let status = std::thread::scope(|scope| {
        if let Some(mut stdin) = child.stdin.take() {
            scope.spawn(move || {
                // A broken pipe surfaces through the exit status.
                let _ = stdin.write_all(input);
            });
        }
        wait_with_deadline(child, timeout)
    });

    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    match status? {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(PushError::Remote {
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }),
        None => Err(PushError::Timeout(timeout)),
    }
}

/// `None` on timeout, after killing the child.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Extracts into each worker's `mirror_root`, read as a local path.
#[derive(Debug, Clone, Default)]
pub struct DirectoryPusher;

impl DirectoryPusher {
    pub fn new() -> Self {
        Self
    }
}

impl ArchivePusher for DirectoryPusher {
    fn push(&self, worker: &WorkerEntry, archive: &GeneratedArchive, _timeout: Duration) -> Result<(), PushError> {
        let root = worker
            .mirror_root
            .as_deref()
            .ok_or_else(|| PushError::NoMirror(worker.name.clone()))?;
        let dir = Path::new(root);
        extract_into(&archive.bytes, dir).map_err(|source| PushError::Extract {
            path: dir.to_path_buf(),
            source,
        })
    }
}
