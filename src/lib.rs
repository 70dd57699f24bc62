//! ccfarm - distributed C/C++ compile farm coordinator
//!
//! The coordinator side of the farm: a compiler wrapper that classifies
//! invocations and dispatches single-source compiles to remote workers, plus
//! the reconciler that keeps generated headers in sync on every worker.

pub mod config;
pub mod dispatch;
pub mod host;
pub mod inventory;
pub mod local;
pub mod reconcile;
pub mod wrapper;

pub use ccfarm_classifier as classifier;
pub use ccfarm_protocol as protocol;

pub use config::{ConfigError, CoordinatorConfig, EnvOverrides};
pub use dispatch::{DispatchFault, DispatchOutcome, Dispatcher, Job, LedgerBook, MemoryBook, WorkerBook};
pub use host::{TcpTransport, Transport, TransportError};
pub use inventory::{InventoryError, WorkerEntry, WorkerInventory};
pub use local::{LocalCompiler, LocalInvocation, LocalOutput, ProcessCompiler};
pub use reconcile::{ArchivePusher, DirectoryPusher, Reconciler, SshPusher, TickReport};
pub use wrapper::{logical_compiler, Wrapper, WrapperError, WrapperOutput};
