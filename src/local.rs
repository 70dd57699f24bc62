//! Local compilation
//!
//! Runs the real compiler on the coordinator with the original argument
//! vector, used for rejected invocations and for fallback.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

/// A compiler invocation to run locally, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInvocation {
    /// Logical compiler name
    pub compiler: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Result of a local compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl LocalOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can compile on this machine.
pub trait LocalCompiler: Send + Sync {
    fn compile(&self, invocation: &LocalInvocation) -> io::Result<LocalOutput>;
}

/// Spawns the compiler as a child process.
///
/// Logical names resolve through the configured table, falling back to a
/// `PATH` lookup of the name itself.
#[derive(Debug, Clone, Default)]
pub struct ProcessCompiler {
    paths: BTreeMap<String, PathBuf>,
}

impl ProcessCompiler {
    pub fn new(paths: BTreeMap<String, PathBuf>) -> Self {
        Self { paths }
    }

    pub fn program_for(&self, compiler: &str) -> PathBuf {
        self.paths
            .get(compiler)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(compiler))
    }
}

impl LocalCompiler for ProcessCompiler {
    fn compile(&self, invocation: &LocalInvocation) -> io::Result<LocalOutput> {
        let program = self.program_for(&invocation.compiler);
        debug!(program = %program.display(), args = ?invocation.args, "compiling locally");

        let output = Command::new(&program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .output()?;

        Ok(LocalOutput {
            exit_code: output.status.code().unwrap_or(1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
