//! Shared fixtures for worker integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ccfarm_worker::{Server, ServerError, WorkerConfig};

/// A stand-in for gcc. Parses `-c`/`-o`, echoes its argv on stdout and
/// writes `OBJ:` followed by the source text. Marker strings in the source
/// select failure modes.
pub const FAKE_COMPILER: &str = r#"#!/bin/sh
echo "ARGS: $*"
out=""
src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -*) shift ;;
    *) src="$1"; shift ;;
  esac
done
if grep -q SYNTAX_ERROR "$src"; then
  echo "$src:1:1: error: expected ';' before '}' token" >&2
  exit 1
fi
if grep -q SLEEP_FOREVER "$src"; then
  sleep 30
fi
if grep -q NO_OUTPUT "$src"; then
  exit 0
fi
if grep -q WARN_ME "$src"; then
  echo "$src:1:1: warning: unused variable" >&2
fi
printf 'OBJ:' > "$out"
cat "$src" >> "$out"
"#;

/// Write the fake compiler into `dir` and return its path.
pub fn install_fake_compiler(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-cc");
    fs::write(&path, FAKE_COMPILER).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Compiler table mapping `gcc` to the fake compiler.
pub fn fake_table(compiler: &Path) -> BTreeMap<String, Vec<PathBuf>> {
    let mut table = BTreeMap::new();
    table.insert("gcc".to_string(), vec![compiler.to_path_buf()]);
    table
}

/// Worker config with a fake `gcc`, scratch under `scratch`, short timeouts.
pub fn test_config(compiler: &Path, scratch: &Path) -> WorkerConfig {
    WorkerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        max_connections: 4,
        compile_timeout_seconds: 10,
        io_timeout_seconds: 5,
        termination_grace_seconds: 1,
        scratch_root: scratch.to_path_buf(),
        compilers: fake_table(compiler),
        path_translation: Vec::new(),
    }
}

/// A server running on a loopback port in a background thread.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    pub fn start(config: &WorkerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = Server::from_listener(listener, config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || server.serve());
        Self {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop accepting and wait for the accept loop to return.
    pub fn stop(mut self) -> Result<(), ServerError> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Number of entries in a directory.
pub fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}
