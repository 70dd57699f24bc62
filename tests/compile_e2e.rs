//! Wrapper to worker over loopback TCP.

#![cfg(unix)]

mod common;

use std::fs;
use std::sync::Arc;

use ccfarm::classifier::ClassifierConfig;
use ccfarm::dispatch::Liveness;
use ccfarm::{DispatchFault, LedgerBook, Wrapper, WrapperError};
use tempfile::TempDir;

use common::{argv, dead_entry, dispatcher, dispatcher_with_book, install_fake_compiler, TestWorker};

struct Fixture {
    _tools: TempDir,
    build: TempDir,
    local_gcc: std::path::PathBuf,
    remote_gcc: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let tools = TempDir::new().unwrap();
    let build = TempDir::new().unwrap();
    let local_gcc = install_fake_compiler(tools.path(), "local-gcc", "LOCAL");
    let remote_gcc = install_fake_compiler(tools.path(), "remote-gcc", "REMOTE");
    Fixture {
        _tools: tools,
        build,
        local_gcc,
        remote_gcc,
    }
}

#[test]
fn test_remote_compile_writes_object() {
    let f = fixture();
    fs::write(f.build.path().join("hello.c"), "int hello;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, true),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("-c -O2 hello.c -o hello.o"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 0, "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(f.build.path().join("hello.o")).unwrap(), b"REMOTE:int hello;");
    let status = wrapper.dispatcher().book().status("w1").unwrap();
    assert_eq!(status.liveness, Liveness::Available);
    assert_eq!(status.outstanding, 0);
}

#[test]
fn test_default_output_name() {
    let f = fixture();
    fs::create_dir_all(f.build.path().join("src")).unwrap();
    fs::write(f.build.path().join("src/util.c"), "int util;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, true),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("-c src/util.c"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(fs::read(f.build.path().join("util.o")).unwrap(), b"REMOTE:int util;");
}

#[test]
fn test_compile_error_returned_verbatim() {
    let f = fixture();
    fs::write(f.build.path().join("bad.c"), "SYNTAX_ERROR").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, true),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("-c bad.c -o bad.o"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 1);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: expected ';'"), "{stderr}");
    assert!(!stderr.contains("ccfarm:"), "{stderr}");
    assert!(!f.build.path().join("bad.o").exists());
}

#[test]
fn test_link_runs_locally() {
    let f = fixture();
    fs::write(f.build.path().join("main.c"), "int main;").unwrap();
    let wrapper = Wrapper::new(
        dispatcher(vec![dead_entry("w1")], &f.local_gcc, true),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("main.c -o app"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(fs::read(f.build.path().join("app")).unwrap(), b"LOCAL:int main;");
}

#[test]
fn test_unreachable_worker_falls_back_to_local() {
    let f = fixture();
    fs::write(f.build.path().join("a.c"), "int a;").unwrap();
    let wrapper = Wrapper::new(
        dispatcher(vec![dead_entry("down")], &f.local_gcc, true),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("-c a.c -o a.o"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 0);
    assert_eq!(fs::read(f.build.path().join("a.o")).unwrap(), b"LOCAL:int a;");
    let status = wrapper.dispatcher().book().status("down").unwrap();
    assert_eq!(status.liveness, Liveness::Unreachable);
}

#[test]
fn test_live_worker_preferred_over_dead_one() {
    let f = fixture();
    fs::write(f.build.path().join("b.c"), "int b;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![dead_entry("down"), worker.entry("up")], &f.local_gcc, false),
        ClassifierConfig::default(),
    );

    for _ in 0..3 {
        let output = wrapper.run("gcc", &argv("-c b.c -o b.o"), f.build.path()).unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(fs::read(f.build.path().join("b.o")).unwrap(), b"REMOTE:int b;");
    }
}

#[test]
fn test_missing_source_is_an_error() {
    let f = fixture();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, true),
        ClassifierConfig::default(),
    );

    let err = wrapper.run("gcc", &argv("-c nothere.c"), f.build.path()).unwrap_err();
    assert!(matches!(err, WrapperError::ReadSource { .. }), "{err}");
}

#[test]
fn test_unknown_compiler_without_fallback_is_resolution_fault() {
    let f = fixture();
    fs::write(f.build.path().join("c.c"), "int c;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, false),
        ClassifierConfig::default(),
    );

    let err = wrapper.run("clang", &argv("-c c.c -o c.o"), f.build.path()).unwrap_err();
    assert!(
        matches!(err, WrapperError::Dispatch(DispatchFault::Resolution { .. })),
        "{err}"
    );
    // Resolution failures do not demote the worker.
    let status = wrapper.dispatcher().book().status("w1").unwrap();
    assert_eq!(status.liveness, Liveness::Available);
}

#[test]
fn test_automake_depfile_written_locally() {
    let f = fixture();
    fs::create_dir_all(f.build.path().join(".deps")).unwrap();
    fs::write(f.build.path().join("a.c"), "int a;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, false),
        ClassifierConfig::default(),
    );

    let output = wrapper
        .run("gcc", &argv("-c -MT a.o -MD -MP -MF .deps/a.Tpo a.c -o a.o"), f.build.path())
        .unwrap();

    assert_eq!(output.exit_code, 0, "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(f.build.path().join("a.o")).unwrap(), b"REMOTE:int a;");
    assert_eq!(
        fs::read_to_string(f.build.path().join(".deps/a.Tpo")).unwrap(),
        "a.o: a.c\n"
    );
    assert_eq!(wrapper.dispatcher().book().status("w1").unwrap().jobs, 1);
}

#[test]
fn test_mmd_depfile_defaults_next_to_object() {
    let f = fixture();
    fs::create_dir_all(f.build.path().join("obj")).unwrap();
    fs::write(f.build.path().join("b.c"), "int b;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, false),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("-c -MMD b.c -o obj/b.o"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 0, "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(f.build.path().join("obj/b.o")).unwrap(), b"REMOTE:int b;");
    assert_eq!(fs::read_to_string(f.build.path().join("obj/b.d")).unwrap(), "obj/b.o: b.c\n");
}

#[test]
fn test_depfile_failure_reported_after_remote_success() {
    let f = fixture();
    fs::write(f.build.path().join("c.c"), "int c;").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher(vec![worker.entry("w1")], &f.local_gcc, false),
        ClassifierConfig::default(),
    );

    // .deps/ was never created, so the local dependency pass fails.
    let output = wrapper
        .run("gcc", &argv("-c -MD -MF .deps/c.Tpo c.c -o c.o"), f.build.path())
        .unwrap();

    assert_eq!(output.exit_code, 1);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("LOCAL: fatal error: opening dependency file .deps/c.Tpo"), "{stderr}");
}

#[test]
fn test_unusable_state_dir_compiles_locally() {
    let f = fixture();
    fs::write(f.build.path().join("d.c"), "int d;").unwrap();
    let blocker = f.build.path().join("not-a-dir");
    fs::write(&blocker, "regular file").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher_with_book(
            vec![worker.entry("w1")],
            &f.local_gcc,
            true,
            Arc::new(LedgerBook::new(blocker.join("state"))),
        ),
        ClassifierConfig::default(),
    );

    let output = wrapper.run("gcc", &argv("-c d.c -o d.o"), f.build.path()).unwrap();

    assert_eq!(output.exit_code, 0, "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(f.build.path().join("d.o")).unwrap(), b"LOCAL:int d;");
}

#[test]
fn test_unusable_state_dir_without_fallback_is_book_fault() {
    let f = fixture();
    fs::write(f.build.path().join("e.c"), "int e;").unwrap();
    let blocker = f.build.path().join("not-a-dir");
    fs::write(&blocker, "regular file").unwrap();
    let worker = TestWorker::start(&f.remote_gcc);
    let wrapper = Wrapper::new(
        dispatcher_with_book(
            vec![worker.entry("w1")],
            &f.local_gcc,
            false,
            Arc::new(LedgerBook::new(blocker.join("state"))),
        ),
        ClassifierConfig::default(),
    );

    let err = wrapper.run("gcc", &argv("-c e.c -o e.o"), f.build.path()).unwrap_err();
    assert!(matches!(err, WrapperError::Dispatch(DispatchFault::Book(_))), "{err}");
    assert!(!f.build.path().join("e.o").exists());
}
