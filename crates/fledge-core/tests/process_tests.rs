//! Integration tests for the Process lifecycle on Unix.
//!
//! These spawn real children through `/bin/sh` and verify the full
//! start → collect → join flow, including termination, stdin feeding and
//! the state-machine preconditions.

#![cfg(unix)]

use fledge::{ExitReason, Process, StartParams, Status};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Shared byte sink suitable for an output callback.
fn sink() -> (Arc<Mutex<Vec<u8>>>, impl FnMut(&[u8]) + Send + 'static) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = buffer.clone();
    (buffer, move |chunk: &[u8]| {
        writer.lock().unwrap().extend_from_slice(chunk)
    })
}

fn shell(script: &str) -> StartParams {
    StartParams::new("/bin/sh").arg("-c").arg(script)
}

/// Drive collection until the child has exited.
fn run_to_end(process: &mut Process) {
    while process.status() == Status::Running {
        process.collect_outputs().expect("collect_outputs failed");
    }
}

#[test]
fn test_hello_stdout() {
    let (stdout, on_stdout) = sink();
    let (stderr, on_stderr) = sink();

    let mut process = Process::new();
    process.on_stdout(on_stdout);
    process.on_stderr(on_stderr);

    process.start(shell("echo hello")).unwrap();
    assert_eq!(process.status(), Status::Running);
    run_to_end(&mut process);

    let result = process.join(false).unwrap();
    assert_eq!(result.reason, ExitReason::Exit);
    assert_eq!(result.code, 0);
    assert_eq!(stdout.lock().unwrap().as_slice(), b"hello\n");
    assert!(stderr.lock().unwrap().is_empty());
}

#[test]
fn test_exit_code_is_reported() {
    let mut process = Process::new();
    process.start(shell("exit 3")).unwrap();
    run_to_end(&mut process);

    let result = process.join(false).unwrap();
    assert_eq!(result.reason, ExitReason::Exit);
    assert_eq!(result.code, 3);
    assert!(!result.success());
}

#[test]
fn test_force_join_kills_signal_ignoring_child() {
    let mut process = Process::new();
    // The child shrugs off SIGTERM; only SIGKILL can take it down.
    process.start(shell("trap '' TERM; sleep 30")).unwrap();

    let result = process.join(true).unwrap();
    assert_eq!(result.reason, ExitReason::Signal);
    assert_eq!(result.code, libc::SIGKILL);
    assert_eq!(process.status(), Status::Joined);
}

#[test]
fn test_empty_argv_fails_and_leaves_process_usable() {
    let mut process = Process::new();
    let err = process.start(StartParams::from_argv(vec![])).unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(process.status(), Status::Init);
    assert_eq!(process.pid(), None);

    // The failed start had no side effects; a valid start still works.
    process.start(shell("exit 0")).unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());
}

#[test]
fn test_stdin_echoes_back() {
    let payload = b"round and round the data goes\n";
    let (stdout, on_stdout) = sink();

    let mut process = Process::new();
    process.on_stdout(on_stdout);
    process.start(StartParams::new("/bin/cat")).unwrap();

    let mut stdin = process.take_stdin().expect("stdin is held after start");
    stdin.write_all(payload).unwrap();
    drop(stdin); // EOF lets cat finish

    run_to_end(&mut process);
    let result = process.join(false).unwrap();

    assert!(result.success());
    assert_eq!(stdout.lock().unwrap().as_slice(), payload);
}

#[test]
fn test_take_stdin_transfers_ownership_once() {
    let mut process = Process::new();
    process.start(StartParams::new("/bin/cat")).unwrap();

    assert!(process.take_stdin().is_some());
    assert!(process.take_stdin().is_none());
    assert!(process.stdin_mut().is_none());

    run_to_end(&mut process);
    process.join(false).unwrap();
}

#[test]
fn test_exec_failure_surfaces_as_exit_code() {
    let mut process = Process::new();
    process
        .start(StartParams::new("/nonexistent/fledge-test-binary"))
        .unwrap();
    run_to_end(&mut process);

    let result = process.join(false).unwrap();
    assert_eq!(result.reason, ExitReason::Exit);
    assert_eq!(result.code, 127);
}

#[test]
fn test_workdir_is_applied() {
    let dir = tempfile::TempDir::new().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let (stdout, on_stdout) = sink();
    let mut process = Process::new();
    process.on_stdout(on_stdout);
    process.start(shell("pwd").workdir(dir.path())).unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());

    let printed = String::from_utf8(stdout.lock().unwrap().clone()).unwrap();
    let printed = std::path::Path::new(printed.trim_end())
        .canonicalize()
        .unwrap();
    assert_eq!(printed, expected);
}

#[test]
fn test_explicit_env_is_applied() {
    let (stdout, on_stdout) = sink();
    let mut process = Process::new();
    process.on_stdout(on_stdout);
    process
        .start(shell("echo \"$FLEDGE_MARKER\"").env("FLEDGE_MARKER", "nest"))
        .unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());

    assert_eq!(stdout.lock().unwrap().as_slice(), b"nest\n");
}

#[test]
fn test_stderr_routes_to_its_own_callback() {
    let (stdout, on_stdout) = sink();
    let (stderr, on_stderr) = sink();

    let mut process = Process::new();
    process.on_stdout(on_stdout);
    process.on_stderr(on_stderr);
    process
        .start(shell("echo to-out; echo to-err >&2"))
        .unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());

    assert_eq!(stdout.lock().unwrap().as_slice(), b"to-out\n");
    assert_eq!(stderr.lock().unwrap().as_slice(), b"to-err\n");
}

#[test]
fn test_stream_preserves_byte_order_across_writes() {
    let (stdout, on_stdout) = sink();
    let mut process = Process::new();
    process.on_stdout(on_stdout);
    process
        .start(shell("printf part1; printf part2; printf part3"))
        .unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());

    assert_eq!(stdout.lock().unwrap().as_slice(), b"part1part2part3");
}

#[test]
fn test_child_killed_by_its_own_signal() {
    let mut process = Process::new();
    process.start(shell("kill -9 $$")).unwrap();
    run_to_end(&mut process);

    let result = process.join(false).unwrap();
    assert_eq!(result.reason, ExitReason::Signal);
    assert_eq!(result.code, libc::SIGKILL);
}

#[test]
fn test_missing_callbacks_discard_output() {
    let mut process = Process::new();
    process.start(shell("echo dropped; echo dropped >&2")).unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());
}

#[test]
fn test_pid_is_recorded_and_survives_join() {
    let mut process = Process::new();
    process.start(shell("exit 0")).unwrap();
    let pid = process.pid().expect("pid recorded at start");
    assert!(pid > 0);

    run_to_end(&mut process);
    process.join(false).unwrap();
    assert_eq!(process.pid(), Some(pid));
}

#[test]
fn test_die_with_parent_spawn_succeeds() {
    let mut process = Process::new();
    process
        .start(shell("exit 0").die_with_parent(true))
        .unwrap();
    run_to_end(&mut process);
    assert!(process.join(false).unwrap().success());
}

#[test]
fn test_start_twice_is_rejected() {
    let mut process = Process::new();
    process.start(shell("exit 0")).unwrap();

    let err = process.start(shell("exit 0")).unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(process.status(), Status::Running);

    run_to_end(&mut process);
    process.join(false).unwrap();
}

#[test]
fn test_join_twice_is_rejected() {
    let mut process = Process::new();
    process.start(shell("exit 0")).unwrap();
    run_to_end(&mut process);

    process.join(false).unwrap();
    let err = process.join(false).unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(process.status(), Status::Joined);
}

#[test]
fn test_collect_after_finish_is_rejected() {
    let mut process = Process::new();
    process.start(shell("exit 0")).unwrap();
    run_to_end(&mut process);
    assert_eq!(process.status(), Status::Finished);

    assert!(process.collect_outputs().is_err());
    process.join(false).unwrap();
    assert!(process.collect_outputs().is_err());
}

#[test]
fn test_join_from_running_without_collecting() {
    // Joining straight from Running is legal; undrained output is dropped.
    let mut process = Process::new();
    process.start(shell("echo ignored")).unwrap();
    let result = process.join(false).unwrap();
    assert!(result.success());
}
