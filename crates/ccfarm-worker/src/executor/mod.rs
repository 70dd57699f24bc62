//! Compile executor for the ccfarm worker.
//!
//! Runs one compile request to completion:
//! - Validating the requested file names
//! - Resolving the logical compiler against the configured table
//! - Writing the source into a fresh scratch directory
//! - Running the compiler there with a wall-clock limit
//! - Reading back the object file
//!
//! The scratch directory is a [`tempfile::TempDir`], so it is removed on
//! every exit path.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ccfarm_protocol::{CompileRequest, CompileResponse, FailureKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compilers::CompilerTable;
use crate::config::WorkerConfig;
use crate::translate::PathTranslator;

/// Environment variable allowlist - only these reach the compiler.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "TMPDIR",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "USER",
    "LOGNAME",
    "SOURCE_DATE_EPOCH",
];

/// Errors that stop the executor before it can classify the compile.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to create scratch directory under {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("compiler failed to start: {0}")]
    SpawnFailed(String),
}

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Configuration for compile execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory holding per-job scratch directories.
    pub scratch_root: PathBuf,
    /// Wall-clock limit for the compiler process.
    pub compile_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub termination_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            compile_timeout: Duration::from_secs(300),
            termination_grace: Duration::from_secs(5),
        }
    }
}

impl From<&WorkerConfig> for ExecutorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            scratch_root: config.scratch_root.clone(),
            compile_timeout: config.compile_timeout(),
            termination_grace: config.termination_grace(),
        }
    }
}

/// How the compiler process ended.
#[derive(Debug)]
struct ProcessOutcome {
    status: Option<ExitStatus>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

/// Compile executor.
///
/// Holds only immutable tables, so one instance serves every connection.
#[derive(Debug)]
pub struct Executor {
    config: ExecutorConfig,
    compilers: CompilerTable,
    translator: PathTranslator,
    spawned: AtomicU64,
}

impl Executor {
    pub fn new(config: ExecutorConfig, compilers: CompilerTable, translator: PathTranslator) -> Self {
        Self {
            config,
            compilers,
            translator,
            spawned: AtomicU64::new(0),
        }
    }

    /// Build from a full worker configuration.
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self::new(config.into(), config.compiler_table(), config.translator())
    }

    pub fn compilers(&self) -> &CompilerTable {
        &self.compilers
    }

    /// Number of compiler processes started so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Execute a compile request. Never fails: setup errors become
    /// `internal` responses.
    pub fn execute(&self, request: &CompileRequest) -> CompileResponse {
        let job_id = request.job_label();

        if let Err(message) = validate_file_name(&request.source_name)
            .and_then(|_| validate_file_name(&request.output_name))
        {
            warn!(job_id, "{}", message);
            return CompileResponse::failure(FailureKind::InvalidRequest, message);
        }
        if request.source_name == request.output_name {
            return CompileResponse::failure(
                FailureKind::InvalidRequest,
                "source_name and output_name must differ",
            );
        }

        let compiler = match self.compilers.resolve(&request.compiler) {
            Some(path) => path.to_path_buf(),
            None => {
                warn!(job_id, compiler = %request.compiler, "compiler not found");
                return CompileResponse::failure(
                    FailureKind::CompilerNotFound,
                    format!("compiler not found: {}", request.compiler),
                );
            }
        };

        match self.run_job(request, &compiler) {
            Ok(response) => response,
            Err(e) => {
                warn!(job_id, error = %e, "compile setup failed");
                CompileResponse::failure(FailureKind::Internal, e.to_string())
            }
        }
    }

    fn run_job(&self, request: &CompileRequest, compiler: &Path) -> ExecutorResult<CompileResponse> {
        let job_id = request.job_label();
        let scratch = tempfile::Builder::new()
            .prefix("ccfarm-")
            .tempdir_in(&self.config.scratch_root)
            .map_err(|source| ExecutorError::Scratch {
                path: self.config.scratch_root.clone(),
                source,
            })?;

        fs::write(scratch.path().join(&request.source_name), &request.source)?;

        let args = self.build_args(request);
        debug!(job_id, compiler = %compiler.display(), ?args, "running compiler");

        let start = Instant::now();
        let outcome = self.run_compiler(compiler, &args, scratch.path())?;
        let elapsed = start.elapsed();

        let stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();

        if outcome.timed_out {
            warn!(job_id, elapsed_ms = elapsed.as_millis() as u64, "compiler timed out");
            return Ok(CompileResponse::failure(
                FailureKind::Timeout,
                format!(
                    "compiler exceeded {}s limit",
                    self.config.compile_timeout.as_secs()
                ),
            )
            .with_output(stdout, stderr));
        }

        let exit_code = outcome.status.and_then(|s| s.code());
        let succeeded = outcome.status.map_or(false, |s| s.success());
        if !succeeded {
            info!(job_id, ?exit_code, "compile failed");
            return Ok(CompileResponse::failure(
                FailureKind::CompileFailed,
                describe_status(outcome.status),
            )
            .with_output(stdout, stderr)
            .with_exit_code(Some(exit_code.unwrap_or(1))));
        }

        let object_path = scratch.path().join(&request.output_name);
        match fs::read(&object_path) {
            Ok(object) => {
                info!(
                    job_id,
                    bytes = object.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "compile succeeded"
                );
                Ok(CompileResponse::success(object, stdout, stderr))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(job_id, "compiler exited 0 without writing {}", request.output_name);
                Ok(CompileResponse::failure(
                    FailureKind::MissingOutput,
                    format!("compiler produced no {}", request.output_name),
                )
                .with_output(stdout, stderr)
                .with_exit_code(Some(0)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Translated flags followed by `-c <source> -o <output>`, both relative
    /// to the scratch directory.
    fn build_args(&self, request: &CompileRequest) -> Vec<String> {
        let mut args = self.translator.translate_all(&request.args);
        args.push("-c".to_string());
        args.push(request.source_name.clone());
        args.push("-o".to_string());
        args.push(request.output_name.clone());
        args
    }

    fn run_compiler(&self, compiler: &Path, args: &[String], work_dir: &Path) -> ExecutorResult<ProcessOutcome> {
        let mut command = Command::new(compiler);
        command
            .args(args)
            .current_dir(work_dir)
            .env_clear()
            .envs(allowed_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so a timeout also reaches cc1/as children.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("{}: {}", compiler.display(), e)))?;
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let stdout_handle = drain(child.stdout.take());
        let stderr_handle = drain(child.stderr.take());

        let deadline = Instant::now() + self.config.compile_timeout;
        let mut timed_out = false;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None if Instant::now() >= deadline => {
                    timed_out = true;
                    break self.terminate_child(&mut child)?;
                }
                None => std::thread::sleep(Duration::from_millis(20)),
            }
        };

        Ok(ProcessOutcome {
            status,
            stdout: join_drain(stdout_handle),
            stderr: join_drain(stderr_handle),
            timed_out,
        })
    }

    /// Terminate a child process gracefully then forcefully.
    fn terminate_child(&self, child: &mut Child) -> ExecutorResult<Option<ExitStatus>> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(child.id() as i32);
            let _ = signal::killpg(pgid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < self.config.termination_grace {
            if let Some(status) = child.try_wait()? {
                kill_group(child);
                return Ok(Some(status));
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        kill_group(child);
        let _ = child.kill();
        Ok(child.wait().ok())
    }
}

/// SIGKILL anything left in the child's process group.
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let _ = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn allowed_env() -> Vec<(String, String)> {
    ENV_ALLOWLIST
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

fn describe_status(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => match status.code() {
            Some(code) => format!("compiler exited with status {}", code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return format!("compiler killed by signal {}", signal);
                    }
                }
                "compiler terminated abnormally".to_string()
            }
        },
        None => "compiler status unavailable".to_string(),
    }
}

/// A plain file name: no separators, not `.` or `..`, not empty.
fn validate_file_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(format!("invalid file name: {:?}", name));
    }
    Ok(())
}
