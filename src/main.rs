//! ccfarm CLI
//!
//! Entry point for the `ccfarm` command-line tool. When invoked through a
//! `ccfarm-<compiler>` symlink it acts as that compiler directly.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ccfarm::config::{ConfigError, CoordinatorConfig, EnvOverrides};
use ccfarm::dispatch::Dispatcher;
use ccfarm::local::{LocalInvocation, ProcessCompiler};
use ccfarm::reconcile::{Reconciler, SshPusher};
use ccfarm::wrapper::{logical_compiler, Wrapper, WrapperOutput, PROGRAM_PREFIX};
use ccfarm::{classifier, LocalCompiler};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ccfarm")]
#[command(about = "Distributed C/C++ compile farm", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile through the farm as the given logical compiler
    Wrap {
        /// Logical compiler name (gcc, g++, clang, ...)
        compiler: String,

        /// Compiler arguments (after --)
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Explain whether a command line would be distributed
    Explain {
        /// Output in human-readable format instead of JSON
        #[arg(long)]
        human: bool,

        /// Compiler arguments (after --)
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Worker management commands
    Workers {
        #[command(subcommand)]
        action: WorkersCommands,
    },

    /// Push generated artifacts to every worker
    Sync {
        /// Run one tick and exit
        #[arg(long)]
        once: bool,

        /// Build tree to scan (default: configured root or current directory)
        #[arg(long)]
        build_root: Option<PathBuf>,

        /// Seconds between ticks
        #[arg(long)]
        interval: Option<u64>,

        /// Output tick reports in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WorkersCommands {
    /// List configured workers with their recorded state
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Probe every worker now and record the result
    Probe {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let mut argv = std::env::args();
    let program = argv.next().unwrap_or_default();
    let is_wrapper = Path::new(&program)
        .file_name()
        .map(|name| name.to_string_lossy().starts_with(PROGRAM_PREFIX))
        .unwrap_or(false);
    if is_wrapper {
        return run_as_compiler(&program, argv.collect());
    }

    let cli = Cli::parse();
    let env = EnvOverrides::from_env();
    let cli_layer = match &cli.command {
        Commands::Sync {
            build_root, interval, ..
        } => sync_overrides(build_root.as_deref(), *interval),
        _ => None,
    };
    let config = CoordinatorConfig::load(&env, cli_layer);
    let quiet = matches!(cli.command, Commands::Wrap { .. });
    init_tracing(&env, config.as_ref().ok(), quiet);

    match cli.command {
        Commands::Wrap { compiler, args } => run_wrap(config, &compiler, args),
        Commands::Explain { human, args } => with_config(config, |c| run_explain(c, human, &args)),
        Commands::Workers { action } => match action {
            WorkersCommands::List { json } => with_config(config, |c| run_workers_list(c, json)),
            WorkersCommands::Probe { json } => with_config(config, |c| run_workers_probe(c, json)),
        },
        Commands::Sync { once, json, .. } => with_config(config, |c| run_sync(c, once, json)),
    }
}

/// Wrapper invocations log at `warn` so build output stays clean.
///
/// `verbose` comes from the merged configuration; when it could not be
/// loaded the environment alone decides.
fn init_tracing(env: &EnvOverrides, config: Option<&CoordinatorConfig>, quiet: bool) {
    let verbose = config.map_or_else(|| env.is_verbose(), |c| c.coordinator.verbose);
    let default = match (verbose, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Some(config) = config {
        for source in &config.sources {
            debug!(origin = ?source.origin, path = ?source.path, digest = ?source.digest, "config source");
        }
    }
}

fn with_config(
    config: Result<CoordinatorConfig, ConfigError>,
    run: impl FnOnce(&CoordinatorConfig) -> ExitCode,
) -> ExitCode {
    match config {
        Ok(config) => run(&config),
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_as_compiler(program: &str, args: Vec<String>) -> ExitCode {
    let env = EnvOverrides::from_env();
    let config = CoordinatorConfig::load(&env, None);
    init_tracing(&env, config.as_ref().ok(), true);
    let compiler = match &config {
        Ok(config) => logical_compiler(program, config.coordinator.compiler.as_deref()),
        Err(_) => logical_compiler(program, env.compiler.as_deref()),
    };
    run_wrap(config, &compiler, args)
}

fn run_wrap(config: Result<CoordinatorConfig, ConfigError>, compiler: &str, args: Vec<String>) -> ExitCode {
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("ccfarm: cannot determine working directory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // A broken farm config must not break the build.
            warn!(error = %e, "configuration unusable, compiling locally");
            return compile_locally(compiler, args, cwd);
        }
    };
    let dispatcher = match Dispatcher::from_config(&config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            warn!(error = %e, "inventory unusable, compiling locally");
            return compile_locally(compiler, args, cwd);
        }
    };

    let wrapper = Wrapper::new(dispatcher, config.classifier.clone());
    match wrapper.run(compiler, &args, &cwd) {
        Ok(output) => emit(output),
        Err(e) => {
            eprintln!("ccfarm: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn compile_locally(compiler: &str, args: Vec<String>, cwd: PathBuf) -> ExitCode {
    let invocation = LocalInvocation {
        compiler: compiler.to_string(),
        args,
        cwd,
    };
    match ProcessCompiler::default().compile(&invocation) {
        Ok(output) => emit(WrapperOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Err(e) => {
            eprintln!("ccfarm: cannot run {}: {}", compiler, e);
            ExitCode::FAILURE
        }
    }
}

fn emit(output: WrapperOutput) -> ExitCode {
    let _ = std::io::stdout().write_all(&output.stdout);
    let _ = std::io::stderr().write_all(&output.stderr);
    let _ = std::io::stdout().flush();
    ExitCode::from(u8::try_from(output.exit_code).unwrap_or(1))
}

fn run_explain(config: &CoordinatorConfig, human: bool, args: &[String]) -> ExitCode {
    let result = classifier::classify(args, &config.classifier);

    if human {
        if let Some(invocation) = &result.invocation {
            println!("ACCEPTED: remote compile");
            println!("  source: {}", invocation.source);
            println!("  output: {}", invocation.output);
            println!("  flags:  {}", invocation.args.join(" "));
        } else {
            println!("REJECTED: local compile");
            for code in result.rejection_reason_codes() {
                println!("  - {}", code);
            }
        }
    } else {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    if result.accepted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_workers_list(config: &CoordinatorConfig, json_output: bool) -> ExitCode {
    let dispatcher = match Dispatcher::from_config(config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            eprintln!("Error loading worker inventory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut rows = Vec::new();
    for worker in &dispatcher.inventory().workers {
        let status = match dispatcher.book().status(&worker.name) {
            Ok(status) => status,
            Err(e) => {
                eprintln!("Error reading worker state: {}", e);
                return ExitCode::FAILURE;
            }
        };
        rows.push((worker, status));
    }

    if json_output {
        let output: Vec<serde_json::Value> = rows
            .iter()
            .map(|(w, status)| {
                json!({
                    "name": w.name,
                    "host": w.host,
                    "port": w.port,
                    "weight": w.weight,
                    "liveness": status.liveness,
                    "outstanding": status.outstanding,
                    "cpus": status.capacity.map(|c| c.cpus),
                    "load_average": status.capacity.map(|c| c.load),
                    "jobs": status.jobs,
                    "avg_job_ms": status.average_job_time().map(|d| d.as_millis() as u64),
                })
            })
            .collect();
        return print_json(&output);
    }

    if rows.is_empty() {
        println!("No workers configured.");
        return ExitCode::SUCCESS;
    }
    println!("Configured workers ({} total):\n", rows.len());
    for (worker, status) in rows {
        println!("  {} ({})", worker.name, worker.address());
        println!("    Weight: {}", worker.weight);
        println!("    State: {} ({} outstanding)", status.liveness, status.outstanding);
        if let Some(capacity) = status.capacity {
            println!("    Capacity: {} cpus, load {:.2}", capacity.cpus, capacity.load);
        }
        match status.average_job_time() {
            Some(avg) => println!("    Jobs: {}, avg {:.2}s", status.jobs, avg.as_secs_f64()),
            None => println!("    Jobs: 0"),
        }
        if let Some(root) = &worker.mirror_root {
            println!("    Mirror: {}", root);
        }
        println!();
    }
    ExitCode::SUCCESS
}

fn run_workers_probe(config: &CoordinatorConfig, json_output: bool) -> ExitCode {
    let dispatcher = match Dispatcher::from_config(config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            eprintln!("Error loading worker inventory: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let results = match dispatcher.probe_all() {
        Ok(results) => results,
        Err(e) => {
            eprintln!("Error probing workers: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let all_ok = results.iter().all(|(_, r)| r.is_ok());

    if json_output {
        let output: Vec<serde_json::Value> = results
            .iter()
            .map(|(name, result)| match result {
                Ok(probe) => json!({"name": name, "ok": true, "probe": probe}),
                Err(e) => json!({"name": name, "ok": false, "error": e.to_string()}),
            })
            .collect();
        let code = print_json(&output);
        return if all_ok { code } else { ExitCode::FAILURE };
    }

    for (name, result) in &results {
        match result {
            Ok(probe) => println!(
                "  {}: {} ({} {} cpus, load {:.2}, {} of {} connections busy, compilers: {})",
                name,
                if probe.has_capacity() { "ok" } else { "full" },
                probe.arch,
                probe.cpus,
                probe.load_average,
                probe.active_connections,
                probe.max_connections,
                probe.compilers.join(", ")
            ),
            Err(e) => println!("  {}: unreachable ({})", name, e),
        }
    }
    if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// `sync` flags as a command-line config layer.
fn sync_overrides(build_root: Option<&Path>, interval: Option<u64>) -> Option<serde_json::Value> {
    let mut overrides = serde_json::Map::new();
    if let Some(root) = build_root {
        overrides.insert("build_root".into(), json!(root));
    }
    if let Some(seconds) = interval {
        overrides.insert("interval_seconds".into(), json!(seconds));
    }
    (!overrides.is_empty()).then(|| json!({ "reconcile": overrides }))
}

fn run_sync(config: &CoordinatorConfig, once: bool, json_output: bool) -> ExitCode {
    let settings = &config.reconcile;
    let root = match settings.build_root.clone().map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Error: cannot determine build root: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let pusher = SshPusher::new(settings.mirror_root.clone()).with_connect_timeout(config.coordinator.connect_timeout());
    let reconciler = match Reconciler::from_settings(&root, settings, config.workers.clone(), Arc::new(pusher)) {
        Ok(reconciler) => reconciler,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if once {
        return match reconciler.tick() {
            Ok(report) => {
                if json_output {
                    print_json(&report)
                } else {
                    println!(
                        "{} files, {} bytes: delivered to {}, failed {}",
                        report.files,
                        report.archive_bytes,
                        report.delivered().len(),
                        report.failed().len()
                    );
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("interrupt received");
        handler_stop.store(true, Ordering::SeqCst);
    }) {
        error!("failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    reconciler.run(settings.interval(), &stop);
    ExitCode::SUCCESS
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            ExitCode::FAILURE
        }
    }
}
