//! TCP front end for the worker.
//!
//! One connection carries one request and one response. The accept loop only
//! takes a connection once an admission slot is free, so at most
//! `max_connections` compiles run at a time and the rest wait in the listen
//! backlog.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ccfarm_protocol::{read_frame, write_message, ProtocolError, Request, MAX_FRAME_LEN};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::probe::{self, HostInfo};

/// How often the accept loop re-checks the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Counting semaphore bounding in-flight connections.
#[derive(Debug)]
pub struct Admission {
    active: Mutex<u32>,
    freed: Condvar,
    limit: u32,
}

impl Admission {
    pub fn new(limit: u32) -> Self {
        Self {
            active: Mutex::new(0),
            freed: Condvar::new(),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Connections currently holding a slot.
    pub fn active(&self) -> u32 {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout` for a free slot.
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<Slot> {
        let guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let (mut active, _) = self
            .freed
            .wait_timeout_while(guard, timeout, |active| *active >= self.limit)
            .unwrap_or_else(|e| e.into_inner());
        if *active >= self.limit {
            return None;
        }
        *active += 1;
        Some(Slot {
            admission: Arc::clone(self),
        })
    }

    /// Wait up to `timeout` for every slot to be released.
    pub fn drain(&self, timeout: Duration) -> bool {
        let guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let (active, _) = self
            .freed
            .wait_timeout_while(guard, timeout, |active| *active > 0)
            .unwrap_or_else(|e| e.into_inner());
        *active == 0
    }

    fn release(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *active = active.saturating_sub(1);
        self.freed.notify_all();
    }
}

/// A held admission slot, released on drop.
#[derive(Debug)]
pub struct Slot {
    admission: Arc<Admission>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.admission.release();
    }
}

/// State shared by every connection thread.
#[derive(Debug)]
struct Shared {
    executor: Executor,
    admission: Arc<Admission>,
    host: HostInfo,
    io_timeout: Duration,
}

/// A bound worker server.
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl Server {
    /// Bind the configured address.
    pub fn bind(config: &WorkerConfig) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind { addr, source })?;
        Self::from_listener(listener, config)
    }

    /// Wrap an already-bound listener.
    pub fn from_listener(listener: TcpListener, config: &WorkerConfig) -> Result<Self, ServerError> {
        listener.set_nonblocking(true)?;
        let shared = Shared {
            executor: Executor::from_worker_config(config),
            admission: Arc::new(Admission::new(config.max_connections)),
            host: HostInfo::detect(),
            io_timeout: config.io_timeout(),
        };
        Ok(Self {
            listener,
            shared: Arc::new(shared),
            shutdown: Arc::new(AtomicBool::new(false)),
            drain_timeout: config.compile_timeout() + config.termination_grace() + config.io_timeout(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Setting this flag makes [`Server::serve`] return.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Accept connections until the shutdown flag is set, then wait for
    /// in-flight connections to finish.
    pub fn serve(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            max_connections = self.shared.admission.limit(),
            compilers = ?self.shared.executor.compilers().available(),
            "worker listening"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(slot) = self.shared.admission.acquire_timeout(POLL_INTERVAL) else {
                continue;
            };

            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer, slot),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drop(slot);
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    drop(slot);
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }

        info!(active = self.shared.admission.active(), "shutting down");
        if !self.shared.admission.drain(self.drain_timeout) {
            warn!(active = self.shared.admission.active(), "connections still running at exit");
        }
        info!(compiles = self.shared.executor.spawn_count(), "worker stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, slot: Slot) {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || {
                let _slot = slot;
                if let Err(e) = handle_connection(&shared, stream, peer) {
                    if e.is_timeout() {
                        warn!(%peer, "connection timed out");
                    } else {
                        debug!(%peer, error = %e, "connection closed");
                    }
                }
            });
        if let Err(e) = spawned {
            error!(%peer, error = %e, "failed to spawn connection thread");
        }
    }
}

/// Read one request, answer it, close.
fn handle_connection(shared: &Shared, mut stream: TcpStream, peer: SocketAddr) -> Result<(), ProtocolError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(shared.io_timeout))?;
    stream.set_write_timeout(Some(shared.io_timeout))?;

    let payload = read_frame(&mut stream, MAX_FRAME_LEN)?;
    let request = Request::from_payload(&payload)?;
    debug!(%peer, op = request.op_name(), bytes = payload.len(), "request received");

    match request {
        Request::Compile(compile) => {
            let start = Instant::now();
            let response = shared.executor.execute(&compile);
            debug!(
                %peer,
                job_id = compile.job_label(),
                success = response.success,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "sending response"
            );
            write_message(&mut stream, &response)?;
        }
        Request::Probe => {
            let response = probe::handle(
                &shared.host,
                shared.executor.compilers(),
                shared.admission.active(),
                shared.admission.limit(),
            );
            write_message(&mut stream, &response)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_limits_slots() {
        let admission = Arc::new(Admission::new(2));
        let a = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        let _b = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(admission.active(), 2);
        assert!(admission.acquire_timeout(Duration::from_millis(10)).is_none());
        drop(a);
        assert_eq!(admission.active(), 1);
        assert!(admission.acquire_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let admission = Arc::new(Admission::new(1));
        let held = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        let waiter = {
            let admission = Arc::clone(&admission);
            std::thread::spawn(move || admission.acquire_timeout(Duration::from_secs(5)).is_some())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_drain_waits_for_release() {
        let admission = Arc::new(Admission::new(1));
        let held = admission.acquire_timeout(Duration::from_millis(10)).unwrap();
        assert!(!admission.drain(Duration::from_millis(20)));
        drop(held);
        assert!(admission.drain(Duration::from_millis(20)));
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        assert_eq!(Admission::new(0).limit(), 1);
    }
}
