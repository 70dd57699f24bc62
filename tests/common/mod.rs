//! Shared fixtures for coordinator integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ccfarm::dispatch::{DispatchPolicy, MemoryBook};
use ccfarm::WorkerBook;
use ccfarm::{Dispatcher, ProcessCompiler, TcpTransport, WorkerEntry, WorkerInventory};
use ccfarm_worker::{Server, ServerError, WorkerConfig};

/// Stand-in for gcc. Writes `<tag>:` plus the source text to the `-o`
/// target; a source containing `SYNTAX_ERROR` fails with a diagnostic.
///
/// Dependency flags behave like gcc's: `-MD`/`-MMD` write `<target>: <src>`
/// to the `-MF` file (default: output with `.d`), `-M`/`-MM` write only
/// that rule. A depfile in a missing directory is a fatal error.
pub fn fake_compiler_script(tag: &str) -> String {
    format!(
        r#"#!/bin/sh
out=""
src=""
dep=""
target=""
mode=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -MF) dep="$2"; shift 2 ;;
    -MT|-MQ) target="$2"; shift 2 ;;
    -M|-MM) mode="deps-only"; shift ;;
    -MD|-MMD) mode="${{mode:-deps}}"; shift ;;
    -I|-iquote|-isystem|-include) shift 2 ;;
    -*) shift ;;
    *) src="$1"; shift ;;
  esac
done
if [ -n "$mode" ]; then
  [ -n "$target" ] || target="$out"
  [ -n "$dep" ] || dep="${{out%.*}}.d"
  if ! printf '%s: %s\n' "$target" "$src" 2>/dev/null > "$dep"; then
    echo "{tag}: fatal error: opening dependency file $dep: No such file or directory" >&2
    exit 1
  fi
  [ "$mode" = "deps-only" ] && exit 0
fi
if grep -q SYNTAX_ERROR "$src"; then
  echo "$src:1:1: error: expected ';' before '}}' token" >&2
  exit 1
fi
printf '{tag}:' > "$out"
cat "$src" >> "$out"
"#
    )
}

/// Install a fake compiler named `name` in `dir`.
pub fn install_fake_compiler(dir: &Path, name: &str, tag: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, fake_compiler_script(tag)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A compile worker on a loopback port, served from a background thread.
pub struct TestWorker {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    _handle: JoinHandle<Result<(), ServerError>>,
    _scratch: tempfile::TempDir,
}

impl TestWorker {
    /// Start a worker whose `gcc` is `compiler`.
    pub fn start(compiler: &Path) -> Self {
        let scratch = tempfile::TempDir::new().unwrap();
        let mut compilers = BTreeMap::new();
        compilers.insert("gcc".to_string(), vec![compiler.to_path_buf()]);
        let config = WorkerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 4,
            compile_timeout_seconds: 10,
            io_timeout_seconds: 5,
            termination_grace_seconds: 1,
            scratch_root: scratch.path().to_path_buf(),
            compilers,
            path_translation: Vec::new(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = Server::from_listener(listener, &config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || server.serve());
        Self {
            addr,
            shutdown,
            _handle: handle,
            _scratch: scratch,
        }
    }

    pub fn entry(&self, name: &str) -> WorkerEntry {
        WorkerEntry::new(name, self.addr.ip().to_string(), self.addr.port())
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// A loopback port with nothing listening on it.
pub fn dead_entry(name: &str) -> WorkerEntry {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    WorkerEntry::new(name, "127.0.0.1", port)
}

/// Dispatcher over real TCP with an in-memory book. Local compiles use
/// `local_gcc` for `gcc`.
pub fn dispatcher(workers: Vec<WorkerEntry>, local_gcc: &Path, fallback: bool) -> Dispatcher {
    dispatcher_with_book(workers, local_gcc, fallback, Arc::new(MemoryBook::new()))
}

/// [`dispatcher`] over the given worker book.
pub fn dispatcher_with_book(
    workers: Vec<WorkerEntry>,
    local_gcc: &Path,
    fallback: bool,
    book: Arc<dyn WorkerBook>,
) -> Dispatcher {
    let inventory = WorkerInventory::new(workers).unwrap();
    let transport = TcpTransport::new(Duration::from_secs(2), Duration::from_secs(15));
    let mut local = BTreeMap::new();
    local.insert("gcc".to_string(), local_gcc.to_path_buf());
    Dispatcher::new(
        inventory,
        Arc::new(transport),
        book,
        Arc::new(ProcessCompiler::new(local)),
    )
    .with_policy(DispatchPolicy {
        fallback,
        ..DispatchPolicy::default()
    })
}

pub fn argv(s: &str) -> Vec<String> {
    s.split_whitespace().map(String::from).collect()
}
