//! ccfarm worker entrypoint
//!
//! Usage: ccfarm-worker [--config FILE] [--bind ADDR] [--port PORT]
//!
//! Serves compile requests until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use ccfarm_worker::{Server, WorkerConfig};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ccfarm-worker")]
#[command(about = "Compile worker for the ccfarm build farm")]
#[command(version)]
struct Cli {
    /// Worker configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long, short)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<u32>,

    /// Directory for per-job scratch directories
    #[arg(long)]
    scratch_root: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match WorkerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => WorkerConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }
    if let Some(root) = cli.scratch_root {
        config.scratch_root = root;
    }
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("interrupt received");
        shutdown.store(true, Ordering::SeqCst);
    }) {
        error!("failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    match server.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
