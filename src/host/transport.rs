//! Transport layer for worker communication
//!
//! Abstracts the TCP connection for testability. Provides:
//! - Transport trait: one request, one response per connection
//! - TcpTransport: framed JSON over TCP for production
//! - MockTransport: scripted in-process workers for unit tests

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::time::Duration;

use ccfarm_protocol::{
    read_message, write_message, CompileRequest, CompileResponse, ProbeResponse, ProtocolError, Request,
};
use tracing::debug;

use crate::inventory::WorkerEntry;

/// Read timeout for probe responses.
pub const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport trait for worker communication
pub trait Transport: Send + Sync {
    /// Send a compile job and wait for the worker's answer.
    fn compile(&self, worker: &WorkerEntry, request: &CompileRequest) -> Result<CompileResponse, TransportError>;

    /// Ask a worker for its capabilities.
    fn probe(&self, worker: &WorkerEntry) -> Result<ProbeResponse, TransportError>;
}

/// Transport errors. Any of these demotes the worker.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("resolving {addr} took longer than {timeout:?}")]
    ResolveTimeout { addr: String, timeout: Duration },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no response from {addr} within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("protocol error talking to {addr}: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: ProtocolError,
    },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ResolveTimeout { .. } => true,
            Self::Connect { source, .. } => {
                matches!(source.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}

/// TCP transport for production use
///
/// Opens a fresh connection per request: one frame out, one frame back.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

/// Resolve `addr` with `lookup` on a helper thread, giving up after
/// `timeout`. A lookup still running at the deadline is abandoned.
pub(crate) fn resolve_with<F>(addr: &str, timeout: Duration, lookup: F) -> Result<Vec<SocketAddr>, TransportError>
where
    F: FnOnce(&str) -> io::Result<Vec<SocketAddr>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let target = addr.to_string();
    std::thread::spawn(move || {
        let _ = tx.send(lookup(&target));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(addrs)) if !addrs.is_empty() => Ok(addrs),
        Ok(_) => Err(TransportError::Resolve(addr.to_string())),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(TransportError::ResolveTimeout {
            addr: addr.to_string(),
            timeout,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Resolve(addr.to_string())),
    }
}

fn system_lookup(addr: &str) -> io::Result<Vec<SocketAddr>> {
    Ok(addr.to_socket_addrs()?.collect())
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    fn connect(&self, worker: &WorkerEntry, read_timeout: Duration) -> Result<TcpStream, TransportError> {
        let addr = worker.address();
        let candidates = match addr.parse::<SocketAddr>() {
            Ok(literal) => vec![literal],
            Err(_) => resolve_with(&addr, self.connect_timeout, system_lookup)?,
        };

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.connect_timeout) {
                Ok(stream) => {
                    let configure = |stream: &TcpStream| -> io::Result<()> {
                        stream.set_read_timeout(Some(read_timeout))?;
                        stream.set_write_timeout(Some(read_timeout))?;
                        stream.set_nodelay(true)
                    };
                    configure(&stream).map_err(|source| TransportError::Connect {
                        addr: addr.clone(),
                        source,
                    })?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(worker = %worker.name, %candidate, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::Connect {
            addr,
            source: last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")),
        })
    }

    fn round_trip<T: serde::de::DeserializeOwned>(
        &self,
        worker: &WorkerEntry,
        request: &Request,
        read_timeout: Duration,
    ) -> Result<T, TransportError> {
        let addr = worker.address();
        let protocol = |source: ProtocolError| {
            if source.is_timeout() {
                TransportError::Timeout {
                    addr: addr.clone(),
                    timeout: read_timeout,
                }
            } else {
                TransportError::Protocol {
                    addr: addr.clone(),
                    source,
                }
            }
        };

        let mut stream = self.connect(worker, read_timeout)?;
        let value = request.to_value().map_err(&protocol)?;
        write_message(&mut stream, &value).map_err(&protocol)?;
        read_message(&mut stream).map_err(&protocol)
    }
}

impl Transport for TcpTransport {
    fn compile(&self, worker: &WorkerEntry, request: &CompileRequest) -> Result<CompileResponse, TransportError> {
        self.round_trip(worker, &Request::Compile(request.clone()), self.read_timeout)
    }

    fn probe(&self, worker: &WorkerEntry) -> Result<ProbeResponse, TransportError> {
        self.round_trip(worker, &Request::Probe, PROBE_READ_TIMEOUT)
    }
}


#[cfg(test)]
pub use mock::{MockBehavior, MockTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn worker_at(addr: SocketAddr) -> WorkerEntry {
        WorkerEntry::new("w", addr.ip().to_string(), addr.port())
    }

    #[test]
    fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_secs(1), Duration::from_secs(1));
        let err = transport.probe(&worker_at(addr)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let transport = TcpTransport::new(Duration::from_secs(1), Duration::from_millis(200));
        let request = CompileRequest::new("gcc", "a.c", b"int x;".to_vec());
        let err = transport.compile(&worker_at(addr), &request).unwrap_err();
        assert!(err.is_timeout(), "{err}");
        handle.join().unwrap();
    }

    #[test]
    fn test_early_close_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: serde_json::Value = read_message(&mut stream).unwrap();
        });

        let transport = TcpTransport::new(Duration::from_secs(1), Duration::from_secs(2));
        let err = transport.probe(&worker_at(addr)).unwrap_err();
        assert!(matches!(err, TransportError::Protocol { .. }), "{err}");
        handle.join().unwrap();
    }

    #[test]
    fn test_hung_lookup_times_out() {
        let started = std::time::Instant::now();
        let err = resolve_with("slow.example:5555", Duration::from_millis(100), |_| {
            std::thread::sleep(Duration::from_secs(2));
            Ok(Vec::new())
        })
        .unwrap_err();
        assert!(matches!(err, TransportError::ResolveTimeout { .. }), "{err}");
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_failed_lookup_is_resolve_error() {
        let err = resolve_with("nowhere.invalid:5555", Duration::from_secs(1), |_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such host"))
        })
        .unwrap_err();
        assert!(matches!(err, TransportError::Resolve(ref addr) if addr == "nowhere.invalid:5555"));
    }

    #[test]
    fn test_ipv6_loopback_worker_reachable() {
        let Ok(listener) = TcpListener::bind("[::1]:0") else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: serde_json::Value = read_message(&mut stream).unwrap();
        });

        let transport = TcpTransport::new(Duration::from_secs(1), Duration::from_secs(2));
        let worker = WorkerEntry::new("v6", "::1", addr.port());
        let err = transport.probe(&worker).unwrap_err();
        // Connected and sent; the peer hung up without answering.
        assert!(matches!(err, TransportError::Protocol { .. }), "{err}");
        handle.join().unwrap();
    }

    #[test]
    fn test_mock_records_calls() {
        let transport = MockTransport::new()
            .with("a", MockBehavior::Respond(CompileResponse::success(b"obj".to_vec(), String::new(), String::new())))
            .with("b", MockBehavior::Unreachable);
        let a = WorkerEntry::new("a", "a.example", 5555);
        let b = WorkerEntry::new("b", "b.example", 5555);

        assert!(transport.probe(&a).is_ok());
        assert!(transport.probe(&b).is_err());
        let request = CompileRequest::new("gcc", "a.c", Vec::new());
        assert!(transport.compile(&a, &request).unwrap().success);
        assert_eq!(transport.compile_count("a"), 1);
        assert_eq!(transport.calls().len(), 3);
    }
}
