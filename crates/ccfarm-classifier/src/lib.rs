//! Deny-by-default classifier for C/C++ compiler invocations.
//!
//! Decides whether a gcc/clang command line is a single-source compile that
//! can run on another machine, and if so splits it into source, output and
//! the remaining flags. Anything else is compiled locally, verbatim.

mod config;
mod parser;
mod result;

pub use config::{ClassifierConfig, DEFAULT_DENIED_FLAGS, DEFAULT_SOURCE_EXTENSIONS};
pub use parser::{parse_argv, ParsedArgv};
pub use result::{ClassifierResult, CompileInvocation, RejectionReason};

/// Classify a compiler invocation.
///
/// Takes the argv (arguments after the compiler name) and produces a
/// [`ClassifierResult`]. All applicable rejection reasons are reported, not
/// just the first.
pub fn classify(argv: &[String], config: &ClassifierConfig) -> ClassifierResult {
    let parsed = match parse_argv(argv) {
        Ok(p) => p,
        Err(e) => return ClassifierResult::rejected(vec![RejectionReason::ParseError(e)]),
    };

    let mut rejection_reasons: Vec<RejectionReason> = Vec::new();

    if !parsed.compile_only {
        rejection_reasons.push(RejectionReason::NotCompileOnly);
    }

    for flag in &parsed.flags {
        if config.is_denied(flag) {
            rejection_reasons.push(RejectionReason::DeniedFlag(flag.clone()));
        }
    }

    if parsed.output.as_deref() == Some("-") {
        rejection_reasons.push(RejectionReason::StdoutOutput);
    }

    let mut sources: Vec<String> = Vec::new();
    for input in &parsed.inputs {
        if input == "-" {
            rejection_reasons.push(RejectionReason::StdinSource);
        } else if config.is_source(input) {
            sources.push(input.clone());
        } else {
            rejection_reasons.push(RejectionReason::UnsupportedInput(input.clone()));
        }
    }

    match sources.len() {
        0 if !parsed.inputs.iter().any(|i| i == "-") => rejection_reasons.push(RejectionReason::NoSource),
        0 | 1 => {}
        _ => rejection_reasons.push(RejectionReason::MultipleSources(sources.clone())),
    }

    if !rejection_reasons.is_empty() {
        return ClassifierResult::rejected(rejection_reasons);
    }

    let source = sources.remove(0);
    let output = parsed
        .output
        .clone()
        .unwrap_or_else(|| default_output(&source));

    ClassifierResult::accepted(CompileInvocation {
        source,
        output,
        args: parsed.flags,
    })
}

/// `src/foo.cpp` -> `foo.o`, matching where the compiler itself would put it.
pub fn default_output(source: &str) -> String {
    let file = source.rsplit('/').next().unwrap_or(source);
    match config::source_extension(file) {
        Some(ext) => format!("{}.o", &file[..file.len() - ext.len() - 1]),
        None => format!("{}.o", file),
    }
}
