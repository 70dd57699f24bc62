//! Compiler wrapper
//!
//! Stands in for `gcc`/`g++`/`clang` in a build. Single-source compiles go
//! to the farm; anything else runs locally with the original arguments.
//!
//! Dependency-file flags (`-MD`, `-MF`, ...) never leave this machine. The
//! worker compiles without them and a local `-M` pass writes the depfile
//! where the build tool expects it.

use std::fs;
use std::path::{Path, PathBuf};

use ccfarm_classifier::{classify, ClassifierConfig};
use ccfarm_protocol::{CompileRequest, CompileResponse, FailureKind};
use tracing::debug;

use crate::dispatch::{DispatchFault, DispatchOutcome, Dispatcher, Job, LocalReason};
use crate::local::{LocalCompiler, LocalInvocation};

/// Program-name prefix for wrapper symlinks (`ccfarm-gcc`).
pub const PROGRAM_PREFIX: &str = "ccfarm-";

/// Flags whose value is a path resolved against the working directory.
const PATH_FLAGS: &[&str] = &[
    "-I",
    "-isystem",
    "-iquote",
    "-idirafter",
    "-include",
    "-imacros",
    "-F",
    "-L",
    "--sysroot",
];

/// Dependency flags that take a separate value.
const DEP_VALUE_FLAGS: &[&str] = &["-MF", "-MT", "-MQ"];

#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    #[error("cannot read source {path}: {source}")]
    ReadSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write object {path}: {source}")]
    WriteObject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot generate dependencies: {0}")]
    Dependencies(#[source] std::io::Error),

    #[error(transparent)]
    Dispatch(#[from] DispatchFault),
}

/// What the build tool sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrapperOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Logical compiler from the program name, unless overridden.
///
/// `ccfarm-g++` -> `g++`; a bare `ccfarm` or unknown name gives `gcc`.
pub fn logical_compiler(program: &str, override_name: Option<&str>) -> String {
    if let Some(name) = override_name.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let base = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match base.strip_prefix(PROGRAM_PREFIX) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "gcc".to_string(),
    }
}

/// Make relative path-valued flags absolute against `cwd`.
pub fn absolutize_paths(args: &[String], cwd: &Path) -> Vec<String> {
    let absolute = |value: &str| -> String {
        if value.is_empty() || Path::new(value).is_absolute() {
            value.to_string()
        } else {
            cwd.join(value).to_string_lossy().into_owned()
        }
    };

    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if PATH_FLAGS.contains(&arg.as_str()) {
            out.push(arg.clone());
            if let Some(value) = iter.next() {
                out.push(absolute(value));
            }
            continue;
        }

        if let Some(value) = arg.strip_prefix("--sysroot=") {
            out.push(format!("--sysroot={}", absolute(value)));
            continue;
        }

        // Longest prefix first so `-isystem` is not read as `-i` + `system`.
        let joined = PATH_FLAGS
            .iter()
            .filter(|flag| !flag.starts_with("--"))
            .filter(|flag| arg.len() > flag.len() && arg.starts_with(**flag))
            .max_by_key(|flag| flag.len());
        match joined {
            Some(flag) => out.push(format!("{}{}", flag, absolute(&arg[flag.len()..]))),
            None => out.push(arg.clone()),
        }
    }
    out
}

/// Dependency output requested on a compile command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepRequest {
    /// `-MMD`: leave out system headers
    pub user_only: bool,
    /// `-MF` target, if given
    pub file: Option<String>,
    /// `-MT`/`-MQ` flags with their values, in order
    pub targets: Vec<(String, String)>,
    /// `-MP`
    pub phony: bool,
    /// `-MG`
    pub missing_generated: bool,
}

impl DepRequest {
    /// Depfile path: `-MF` if given, else the output with a `.d` suffix.
    pub fn depfile(&self, output: &str) -> String {
        match &self.file {
            Some(file) => file.clone(),
            None => Path::new(output).with_extension("d").to_string_lossy().into_owned(),
        }
    }

    /// Arguments for a dependency-only run producing the same depfile.
    pub fn local_args(&self, flags: &[String], source: &str, output: &str) -> Vec<String> {
        let mut args = flags.to_vec();
        args.push(if self.user_only { "-MM" } else { "-M" }.to_string());
        args.push("-MF".to_string());
        args.push(self.depfile(output));
        if self.targets.is_empty() {
            args.push("-MT".to_string());
            args.push(output.to_string());
        }
        for (flag, value) in &self.targets {
            args.push(flag.clone());
            args.push(value.clone());
        }
        if self.phony {
            args.push("-MP".to_string());
        }
        if self.missing_generated {
            args.push("-MG".to_string());
        }
        args.push(source.to_string());
        args
    }

    fn record(&mut self, flag: &str, value: String) {
        if flag == "-MF" {
            self.file = Some(value);
        } else {
            self.targets.push((flag.to_string(), value));
        }
    }
}

/// Split dependency-file flags out of `args`.
///
/// Returns the remaining flags and the dependency request, `None` when the
/// command line asks for no depfile. `-MF`/`-MT` alone, without `-MD` or
/// `-MMD`, produce nothing under `-c` and are dropped.
pub fn split_dep_flags(args: &[String]) -> (Vec<String>, Option<DepRequest>) {
    let mut rest = Vec::with_capacity(args.len());
    let mut dep = DepRequest::default();
    let mut wanted = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-MD" => wanted = true,
            "-MMD" => {
                wanted = true;
                dep.user_only = true;
            }
            "-MP" => dep.phony = true,
            "-MG" => dep.missing_generated = true,
            flag if DEP_VALUE_FLAGS.contains(&flag) => {
                if let Some(value) = iter.next() {
                    dep.record(flag, value.clone());
                }
            }
            other => {
                if let Some(flag) = DEP_VALUE_FLAGS.iter().find(|f| other.len() > 3 && other.starts_with(**f)) {
                    dep.record(flag, other[flag.len()..].to_string());
                } else if let Some((user_only, file)) = preprocessor_depfile(other) {
                    wanted = true;
                    dep.user_only = user_only;
                    dep.file = Some(file);
                } else {
                    rest.push(arg.clone());
                }
            }
        }
    }

    (rest, wanted.then_some(dep))
}

/// `-Wp,-MD,path` and `-Wp,-MMD,path`.
fn preprocessor_depfile(arg: &str) -> Option<(bool, String)> {
    let rest = arg.strip_prefix("-Wp,")?;
    if let Some(path) = rest.strip_prefix("-MD,") {
        return Some((false, path.to_string()));
    }
    rest.strip_prefix("-MMD,").map(|path| (true, path.to_string()))
}

/// Runs one compiler invocation.
pub struct Wrapper {
    dispatcher: Dispatcher,
    classifier: ClassifierConfig,
}

impl Wrapper {
    pub fn new(dispatcher: Dispatcher, classifier: ClassifierConfig) -> Self {
        Self { dispatcher, classifier }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Compile `argv` as `compiler` would in `cwd`.
    pub fn run(&self, compiler: &str, argv: &[String], cwd: &Path) -> Result<WrapperOutput, WrapperError> {
        let local = LocalInvocation {
            compiler: compiler.to_string(),
            args: argv.to_vec(),
            cwd: cwd.to_path_buf(),
        };

        let classified = classify(argv, &self.classifier);
        let Some(invocation) = classified.invocation else {
            debug!(reasons = ?classified.rejection_reasons, "not distributable");
            let outcome = self.dispatcher.compile_local(&local, LocalReason::NotDistributable)?;
            return finish(outcome, cwd);
        };

        let source_path = cwd.join(&invocation.source);
        let source = fs::read(&source_path).map_err(|source| WrapperError::ReadSource {
            path: source_path.clone(),
            source,
        })?;
        let source_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| invocation.source.clone());

        let (flags, deps) = split_dep_flags(&invocation.args);
        let mut args = absolutize_paths(&flags, cwd);
        if let Some(dir) = source_path.parent() {
            args.push("-iquote".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }

        let request = CompileRequest::new(compiler, source_name, source)
            .with_args(args)
            .with_job_id(ulid::Ulid::new().to_string());
        debug!(job_id = request.job_label(), source = %invocation.source, output = %invocation.output, "dispatching");

        let outcome = self.dispatcher.dispatch(&Job { request, local })?;
        let remote = matches!(outcome, DispatchOutcome::Remote { .. });
        let output = finish(outcome, &cwd.join(&invocation.output))?;

        // Local runs used the full command line and wrote their own depfile.
        match deps {
            Some(deps) if remote && output.exit_code == 0 => {
                let dep_run = LocalInvocation {
                    compiler: compiler.to_string(),
                    args: deps.local_args(&flags, &invocation.source, &invocation.output),
                    cwd: cwd.to_path_buf(),
                };
                debug!(depfile = %deps.depfile(&invocation.output), "generating dependencies locally");
                let generated = self
                    .dispatcher
                    .local_compiler()
                    .compile(&dep_run)
                    .map_err(WrapperError::Dependencies)?;
                if generated.success() {
                    return Ok(output);
                }
                let mut stderr = output.stderr;
                stderr.extend_from_slice(&generated.stderr);
                Ok(WrapperOutput {
                    exit_code: generated.exit_code,
                    stdout: output.stdout,
                    stderr,
                })
            }
            _ => Ok(output),
        }
    }
}

/// Turn a dispatch outcome into what the build tool sees. Remote objects are
/// written to `object_path`.
fn finish(outcome: DispatchOutcome, object_path: &Path) -> Result<WrapperOutput, WrapperError> {
    match outcome {
        DispatchOutcome::Local { output, .. } => Ok(WrapperOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        DispatchOutcome::Remote { worker, response } => {
            debug!(%worker, success = response.success, "remote result");
            remote_output(response, object_path)
        }
    }
}

fn remote_output(response: CompileResponse, object_path: &Path) -> Result<WrapperOutput, WrapperError> {
    if response.success {
        let object = response.object.unwrap_or_default();
        fs::write(object_path, &object).map_err(|source| WrapperError::WriteObject {
            path: object_path.to_path_buf(),
            source,
        })?;
        return Ok(WrapperOutput {
            exit_code: 0,
            stdout: response.stdout.into_bytes(),
            stderr: response.stderr.into_bytes(),
        });
    }

    let mut stderr = response.stderr.into_bytes();
    if response.failure != Some(FailureKind::CompileFailed) {
        if let Some(error) = &response.error {
            stderr.extend_from_slice(format!("ccfarm: {}\n", error).as_bytes());
        }
    }
    Ok(WrapperOutput {
        exit_code: response.exit_code.filter(|code| *code != 0).unwrap_or(1),
        stdout: response.stdout.into_bytes(),
        stderr,
    })
}
