//! ccfarm compile worker
//!
//! Listens on TCP for framed compile requests from the coordinator, runs
//! the requested compiler in a scratch directory and returns the object
//! file with captured diagnostics.
//!
//! This crate can be used in two modes:
//! - **Standalone binary**: `ccfarm-worker`, one per build machine
//! - **In-process library**: integration tests start a [`Server`] on a
//!   loopback port with their own compiler table

pub mod compilers;
pub mod config;
pub mod executor;
pub mod probe;
pub mod server;
pub mod translate;

pub use compilers::CompilerTable;
pub use config::{ConfigError, WorkerConfig};
pub use executor::{Executor, ExecutorConfig, ExecutorError, ExecutorResult, ENV_ALLOWLIST};
pub use probe::HostInfo;
pub use server::{Admission, Server, ServerError, Slot};
pub use translate::{PathMapping, PathTranslator};
