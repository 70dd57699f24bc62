//! Coordinator dispatcher
//!
//! Sends one compile job to the best available worker, retrying elsewhere on
//! transport and resolution failures and falling back to a local compile
//! when the farm cannot take the job.
//!
//! Failure handling:
//! - transport error: worker marked `unreachable`, next worker tried
//! - resolution failure (`compiler_not_found`, `invalid_request`,
//!   `internal`): next worker tried, worker stays in rotation
//! - execution failure (`compile_failed`, `timeout`, `missing_output`):
//!   returned as-is, never retried
//! - worker book failure (ledger I/O, lock timeout): local compile when
//!   fallback is on

pub mod book;
pub mod ledger;
pub mod lock;
pub mod selection;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use ccfarm_protocol::{CompileRequest, CompileResponse, FailureKind, ProbeResponse};
use tracing::{debug, info, warn};

pub use book::{BookError, Lease, Liveness, MemoryBook, WorkerBook, WorkerStatus};
pub use ledger::{LedgerBook, LedgerTtl};
pub use lock::{LedgerLock, LockError};
pub use selection::{Capacity, Scoring};

use crate::config::CoordinatorConfig;
use crate::host::{TcpTransport, Transport, TransportError};
use crate::inventory::{WorkerEntry, WorkerInventory};
use crate::local::{LocalCompiler, LocalInvocation, LocalOutput, ProcessCompiler};

/// One compile job: the remote form plus the verbatim local form.
#[derive(Debug, Clone)]
pub struct Job {
    pub request: CompileRequest,
    pub local: LocalInvocation,
}

/// Why a job ran locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReason {
    /// The invocation is not a single-source compile
    NotDistributable,
    /// Distribution switched off
    Disabled,
    /// No worker was available when the job arrived
    NoWorkers,
    /// Every available worker failed the job
    Exhausted,
    /// The shared worker book could not be read or updated
    StateUnavailable,
}

impl std::fmt::Display for LocalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDistributable => write!(f, "not a distributable compile"),
            Self::Disabled => write!(f, "distribution disabled"),
            Self::NoWorkers => write!(f, "no worker available"),
            Self::Exhausted => write!(f, "all workers failed"),
            Self::StateUnavailable => write!(f, "worker state unavailable"),
        }
    }
}

/// Where a job ended up.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// A worker answered with success or an execution failure.
    Remote { worker: String, response: CompileResponse },
    /// The job ran on this machine.
    Local { reason: LocalReason, output: LocalOutput },
}

/// Dispatch failures surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchFault {
    #[error("worker {worker}: {source}")]
    Transport {
        worker: String,
        #[source]
        source: TransportError,
    },

    #[error("worker {worker} rejected job ({kind}): {message}")]
    Resolution {
        worker: String,
        kind: FailureKind,
        message: String,
    },

    #[error("worker book: {0}")]
    Book(#[from] BookError),

    #[error("local compile failed to start: {0}")]
    Local(#[from] std::io::Error),
}

/// Fallback, enablement and scoring switches.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub fallback: bool,
    pub disabled: bool,
    pub scoring: Scoring,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            fallback: true,
            disabled: false,
            scoring: Scoring::Weight,
        }
    }
}

/// Routes compile jobs to workers.
pub struct Dispatcher {
    inventory: WorkerInventory,
    transport: Arc<dyn Transport>,
    book: Arc<dyn WorkerBook>,
    local: Arc<dyn LocalCompiler>,
    policy: DispatchPolicy,
}

/// Releases its lease when dropped.
struct Claim<'a> {
    book: &'a dyn WorkerBook,
    lease: Lease,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.book.release(&self.lease) {
            warn!(worker = %self.lease.worker, error = %e, "failed to release lease");
        }
    }
}

impl Dispatcher {
    pub fn new(
        inventory: WorkerInventory,
        transport: Arc<dyn Transport>,
        book: Arc<dyn WorkerBook>,
        local: Arc<dyn LocalCompiler>,
    ) -> Self {
        Self {
            inventory,
            transport,
            book,
            local,
            policy: DispatchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Production wiring: TCP transport, shared ledger, process compiler.
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self, crate::config::ConfigError> {
        let settings = &config.coordinator;
        let transport = TcpTransport::new(settings.connect_timeout(), settings.read_timeout());
        let book = LedgerBook::new(settings.state_dir())
            .with_ttl(LedgerTtl {
                available: settings.probe_ttl(),
                unreachable: settings.unreachable_ttl(),
            })
            .with_lock_timeout(settings.lock_timeout());
        let local = ProcessCompiler::new(settings.local_compilers.clone());

        Ok(Self::new(config.inventory()?, Arc::new(transport), Arc::new(book), Arc::new(local)).with_policy(
            DispatchPolicy {
                fallback: settings.fallback,
                disabled: settings.disabled,
                scoring: settings.scoring,
            },
        ))
    }

    pub fn inventory(&self) -> &WorkerInventory {
        &self.inventory
    }

    pub fn book(&self) -> &dyn WorkerBook {
        self.book.as_ref()
    }

    pub fn local_compiler(&self) -> &dyn LocalCompiler {
        self.local.as_ref()
    }

    /// Run a job locally without consulting the farm.
    pub fn compile_local(&self, invocation: &LocalInvocation, reason: LocalReason) -> Result<DispatchOutcome, DispatchFault> {
        info!(compiler = %invocation.compiler, %reason, "compiling locally");
        let output = self.local.compile(invocation)?;
        Ok(DispatchOutcome::Local { reason, output })
    }

    /// Probe every worker whose liveness is `unknown`, in parallel.
    pub fn probe_unknown(&self) -> Result<(), DispatchFault> {
        let mut unknown = Vec::new();
        for worker in &self.inventory.workers {
            if self.book.status(&worker.name)?.liveness == Liveness::Unknown {
                unknown.push(worker);
            }
        }
        if !unknown.is_empty() {
            self.probe_and_mark(&unknown)?;
        }
        Ok(())
    }

    /// Probe every worker regardless of state and record the results.
    pub fn probe_all(&self) -> Result<Vec<(String, Result<ProbeResponse, TransportError>)>, DispatchFault> {
        let workers: Vec<&WorkerEntry> = self.inventory.workers.iter().collect();
        self.probe_and_mark(&workers)
    }

    fn probe_and_mark(
        &self,
        workers: &[&WorkerEntry],
    ) -> Result<Vec<(String, Result<ProbeResponse, TransportError>)>, DispatchFault> {
        let results: Vec<(String, Result<ProbeResponse, TransportError>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = workers
                .iter()
                .map(|worker| {
                    let transport = &self.transport;
                    scope.spawn(move || transport.probe(worker))
                })
                .collect();
            workers
                .iter()
                .zip(handles)
                .map(|(worker, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(TransportError::Resolve(format!("probe of {} panicked", worker.address())))
                    });
                    (worker.name.clone(), result)
                })
                .collect()
        });

        for (name, result) in &results {
            match result {
                Ok(probe) => {
                    debug!(
                        worker = %name,
                        cpus = probe.cpus,
                        load = probe.load_average,
                        compilers = ?probe.compilers,
                        "probe ok"
                    );
                    self.book.record_capacity(
                        name,
                        Capacity {
                            cpus: probe.cpus,
                            load: probe.load_average,
                        },
                    )?;
                    self.book.mark(name, Liveness::Available)?;
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "probe failed");
                    self.book.mark(name, Liveness::Unreachable)?;
                }
            }
        }
        Ok(results)
    }

    /// Dispatch one job.
    pub fn dispatch(&self, job: &Job) -> Result<DispatchOutcome, DispatchFault> {
        if self.policy.disabled {
            return self.compile_local(&job.local, LocalReason::Disabled);
        }
        if self.inventory.is_empty() {
            return self.compile_local(&job.local, LocalReason::NoWorkers);
        }

        match self.dispatch_remote(job) {
            Err(DispatchFault::Book(e)) if self.policy.fallback => {
                warn!(error = %e, "worker book unusable, compiling locally");
                self.compile_local(&job.local, LocalReason::StateUnavailable)
            }
            other => other,
        }
    }

    fn dispatch_remote(&self, job: &Job) -> Result<DispatchOutcome, DispatchFault> {
        self.probe_unknown()?;

        let job_id = job.request.job_label();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_fault: Option<DispatchFault> = None;

        loop {
            let Some(lease) = self.book.claim(&self.inventory.workers, &excluded, self.policy.scoring)? else {
                break;
            };
            let claim = Claim {
                book: self.book.as_ref(),
                lease,
            };
            let worker_name = claim.lease.worker.clone();
            excluded.insert(worker_name.clone());

            let Some(worker) = self.inventory.get(&worker_name) else {
                continue;
            };

            debug!(job_id, worker = %worker_name, "sending job");
            let started = Instant::now();
            let result = self.transport.compile(worker, &job.request);
            drop(claim);

            match result {
                Ok(response) if response.is_final() => {
                    if let Err(e) = self.book.record_job(&worker_name, started.elapsed()) {
                        warn!(job_id, worker = %worker_name, error = %e, "failed to record job");
                    }
                    if response.success {
                        debug!(job_id, worker = %worker_name, "remote compile succeeded");
                    } else {
                        debug!(job_id, worker = %worker_name, kind = ?response.failure, "remote compile failed");
                    }
                    return Ok(DispatchOutcome::Remote {
                        worker: worker_name,
                        response,
                    });
                }
                Ok(response) => {
                    let kind = response.failure_kind().unwrap_or(FailureKind::Internal);
                    let message = response.error.clone().unwrap_or_default();
                    warn!(job_id, worker = %worker_name, %kind, %message, "worker could not run job");
                    last_fault = Some(DispatchFault::Resolution {
                        worker: worker_name,
                        kind,
                        message,
                    });
                }
                Err(source) => {
                    warn!(job_id, worker = %worker_name, error = %source, "transport failure, marking unreachable");
                    self.book.mark(&worker_name, Liveness::Unreachable)?;
                    last_fault = Some(DispatchFault::Transport {
                        worker: worker_name,
                        source,
                    });
                }
            }
        }

        match last_fault {
            None => self.compile_local(&job.local, LocalReason::NoWorkers),
            Some(_) if self.policy.fallback => self.compile_local(&job.local, LocalReason::Exhausted),
            Some(fault) => Err(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockBehavior, MockTransport};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingCompiler {
        calls: Mutex<u32>,
    }

    impl LocalCompiler for CountingCompiler {
        fn compile(&self, _invocation: &LocalInvocation) -> std::io::Result<LocalOutput> {
            *self.calls.lock().unwrap() += 1;
            Ok(LocalOutput::default())
        }
    }

    fn job() -> Job {
        Job {
            request: CompileRequest::new("gcc", "a.c", b"int x;".to_vec()),
            local: LocalInvocation {
                compiler: "gcc".into(),
                args: vec!["-c".into(), "a.c".into()],
                cwd: PathBuf::from("/tmp"),
            },
        }
    }

    fn ok_response() -> CompileResponse {
        CompileResponse::success(b"OBJ".to_vec(), String::new(), String::new())
    }

    fn setup(transport: MockTransport, policy: DispatchPolicy) -> (Dispatcher, Arc<MockTransport>, Arc<CountingCompiler>) {
        let inventory = WorkerInventory::new(vec![
            WorkerEntry::new("a", "a.local", 5555).with_weight(10.0),
            WorkerEntry::new("b", "b.local", 5555).with_weight(2.0),
        ])
        .unwrap();
        let transport = Arc::new(transport);
        let local = Arc::new(CountingCompiler::default());
        let dispatcher = Dispatcher::new(inventory, transport.clone(), Arc::new(MemoryBook::new()), local.clone())
            .with_policy(policy);
        (dispatcher, transport, local)
    }

    #[test]
    fn test_disabled_goes_local() {
        let (dispatcher, transport, local) = setup(
            MockTransport::new(),
            DispatchPolicy {
                disabled: true,
                ..DispatchPolicy::default()
            },
        );
        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Local { reason: LocalReason::Disabled, .. }));
        assert!(transport.calls().is_empty());
        assert_eq!(*local.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_higher_weight_selected() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::Respond(ok_response()))
            .with("b", MockBehavior::Respond(ok_response()));
        let (dispatcher, transport, _) = setup(transport, DispatchPolicy::default());
        match dispatcher.dispatch(&job()).unwrap() {
            DispatchOutcome::Remote { worker, response } => {
                assert_eq!(worker, "a");
                assert_eq!(response.object.as_deref(), Some(&b"OBJ"[..]));
            }
            other => panic!("expected remote, got {other:?}"),
        }
        assert_eq!(transport.compile_count("b"), 0);
        let status = dispatcher.book().status("a").unwrap();
        assert_eq!(status.outstanding, 0);
        assert_eq!(status.jobs, 1);
        assert_eq!(status.capacity, Some(Capacity { cpus: 4, load: 0.5 }));
    }

    #[test]
    fn test_transport_failure_demotes_and_retries() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::DropCompile)
            .with("b", MockBehavior::Respond(ok_response()));
        let (dispatcher, transport, _) = setup(transport, DispatchPolicy::default());

        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Remote { ref worker, .. } if worker == "b"));
        assert_eq!(dispatcher.book().status("a").unwrap().liveness, Liveness::Unreachable);

        dispatcher.dispatch(&job()).unwrap();
        assert_eq!(transport.compile_count("a"), 1);
        assert_eq!(transport.compile_count("b"), 2);
    }

    #[test]
    fn test_resolution_failure_moves_on_without_demotion() {
        let transport = MockTransport::new()
            .with(
                "a",
                MockBehavior::Respond(CompileResponse::failure(FailureKind::CompilerNotFound, "compiler not found: gcc")),
            )
            .with("b", MockBehavior::Respond(ok_response()));
        let (dispatcher, _, _) = setup(transport, DispatchPolicy::default());

        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Remote { ref worker, .. } if worker == "b"));
        assert_eq!(dispatcher.book().status("a").unwrap().liveness, Liveness::Available);
    }

    #[test]
    fn test_execution_failure_not_retried() {
        let failure = CompileResponse::failure(FailureKind::CompileFailed, "compiler exited with status 1")
            .with_output(String::new(), "a.c:1: error\n".into())
            .with_exit_code(Some(1));
        let transport = MockTransport::new()
            .with("a", MockBehavior::Respond(failure.clone()))
            .with("b", MockBehavior::Respond(ok_response()));
        let (dispatcher, transport, local) = setup(transport, DispatchPolicy::default());

        match dispatcher.dispatch(&job()).unwrap() {
            DispatchOutcome::Remote { worker, response } => {
                assert_eq!(worker, "a");
                assert_eq!(response, failure);
            }
            other => panic!("expected remote, got {other:?}"),
        }
        assert_eq!(transport.compile_count("b"), 0);
        assert_eq!(*local.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_exhausted_falls_back() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::DropCompile)
            .with("b", MockBehavior::DropCompile);
        let (dispatcher, _, local) = setup(transport, DispatchPolicy::default());
        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Local { reason: LocalReason::Exhausted, .. }));
        assert_eq!(*local.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_exhausted_without_fallback_surfaces_last_error() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::DropCompile)
            .with("b", MockBehavior::DropCompile);
        let (dispatcher, _, local) = setup(
            transport,
            DispatchPolicy {
                fallback: false,
                ..DispatchPolicy::default()
            },
        );
        let err = dispatcher.dispatch(&job()).unwrap_err();
        assert!(matches!(err, DispatchFault::Transport { ref worker, .. } if worker == "b"));
        assert_eq!(*local.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_all_unreachable_compiles_locally() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::Unreachable)
            .with("b", MockBehavior::Unreachable);
        let (dispatcher, transport, _) = setup(transport, DispatchPolicy::default());
        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Local { reason: LocalReason::NoWorkers, .. }));
        assert_eq!(transport.compile_count("a") + transport.compile_count("b"), 0);
    }

    /// Book whose every operation fails, as with an unwritable state dir.
    struct BrokenBook;

    impl WorkerBook for BrokenBook {
        fn status(&self, _worker: &str) -> Result<WorkerStatus, BookError> {
            Err(BookError::Poisoned)
        }
        fn mark(&self, _worker: &str, _liveness: Liveness) -> Result<(), BookError> {
            Err(BookError::Poisoned)
        }
        fn record_capacity(&self, _worker: &str, _capacity: Capacity) -> Result<(), BookError> {
            Err(BookError::Poisoned)
        }
        fn record_job(&self, _worker: &str, _elapsed: Duration) -> Result<(), BookError> {
            Err(BookError::Poisoned)
        }
        fn claim(
            &self,
            _workers: &[WorkerEntry],
            _exclude: &HashSet<String>,
            _scoring: Scoring,
        ) -> Result<Option<Lease>, BookError> {
            Err(BookError::Poisoned)
        }
        fn release(&self, _lease: &Lease) -> Result<(), BookError> {
            Err(BookError::Poisoned)
        }
    }

    fn broken_book_dispatcher(fallback: bool) -> (Dispatcher, Arc<CountingCompiler>) {
        let inventory = WorkerInventory::new(vec![WorkerEntry::new("a", "a.local", 5555)]).unwrap();
        let transport = Arc::new(MockTransport::new().with("a", MockBehavior::Respond(ok_response())));
        let local = Arc::new(CountingCompiler::default());
        let dispatcher = Dispatcher::new(inventory, transport, Arc::new(BrokenBook), local.clone()).with_policy(
            DispatchPolicy {
                fallback,
                ..DispatchPolicy::default()
            },
        );
        (dispatcher, local)
    }

    #[test]
    fn test_broken_book_falls_back_to_local() {
        let (dispatcher, local) = broken_book_dispatcher(true);
        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Local {
                reason: LocalReason::StateUnavailable,
                ..
            }
        ));
        assert_eq!(*local.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_broken_book_without_fallback_is_fault() {
        let (dispatcher, local) = broken_book_dispatcher(false);
        let err = dispatcher.dispatch(&job()).unwrap_err();
        assert!(matches!(err, DispatchFault::Book(BookError::Poisoned)), "{err}");
        assert_eq!(*local.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_load_aware_policy_uses_reported_capacity() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::Respond(ok_response()))
            .with("b", MockBehavior::Respond(ok_response()))
            .with_capacity("a", Capacity { cpus: 1, load: 12.0 })
            .with_capacity("b", Capacity { cpus: 8, load: 0.0 });
        let (dispatcher, transport, _) = setup(
            transport,
            DispatchPolicy {
                scoring: Scoring::LoadAware,
                ..DispatchPolicy::default()
            },
        );
        // a: 10*1/13, b: 2*8/1
        let outcome = dispatcher.dispatch(&job()).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Remote { ref worker, .. } if worker == "b"));
        assert_eq!(transport.compile_count("a"), 0);
    }
}
