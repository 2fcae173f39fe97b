//! Unix process backend: fork/exec spawning and poll-driven collection.
//!
//! Pipes are created with `O_CLOEXEC` so the child leaks nothing across
//! `exec`; the three ends the child needs are `dup2`ed onto fds 0/1/2
//! (which clears close-on-exec on the duplicates). After the fork the
//! parent closes the child-side ends and switches its stdout/stderr read
//! ends to non-blocking, so a `poll(2)` readiness wait followed by
//! read-to-`EAGAIN` loops can drain output without ever blocking past the
//! wait itself.

// This module owns the fork/exec and raw-descriptor boundary.
#![allow(unsafe_code)]

use crate::error::{FledgeError, Result};
use crate::outcome::{ExitReason, ProcessResult};
use crate::params::StartParams;
use crate::process::OutputCallback;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use tracing::{debug, warn};

/// Exit code the child reports when `exec` itself fails. The parent cannot
/// observe the failure directly once past the fork boundary; it surfaces as
/// a normal exit with this code.
const EXEC_FAILED: i32 = 127;
/// Exit code for a pre-exec setup failure in the child (dup2/chdir).
const SETUP_FAILED: i32 = 126;

const READ_CHUNK: usize = 4096;

/// One end of a pipe: a move-only owner of a file descriptor.
///
/// The descriptor is closed exactly once, when the value is dropped.
#[derive(Debug)]
pub struct PipeEnd {
    fd: OwnedFd,
}

impl PipeEnd {
    fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Switch the descriptor to non-blocking mode.
    fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();
        // SAFETY: fd is owned by self and valid for the duration of the call.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above; O_NONBLOCK is a valid status flag.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsFd for PipeEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: fd is owned and open; the buffer pointer and length come
        // from a live mutable slice.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: fd is owned and open; the buffer pointer and length come
        // from a live slice.
        let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // Pipe writes are not buffered in userspace.
        Ok(())
    }
}

/// A unidirectional pipe split into independently owned read and write ends.
#[derive(Debug)]
pub struct PipePair {
    pub read: PipeEnd,
    pub write: PipeEnd,
}

impl PipePair {
    /// Create a pipe with close-on-exec set on both ends.
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        Ok(Self {
            read: PipeEnd::new(read),
            write: PipeEnd::new(write),
        })
    }
}

/// A spawned child process and the pipe ends the parent still owns.
///
/// Dropping this closes every remaining descriptor; the read ends are
/// additionally closed as soon as [`drain`] observes their end-of-stream.
#[derive(Debug)]
pub struct ChildState {
    pid: Pid,
    stdin: Option<PipeEnd>,
    stdout: Option<PipeEnd>,
    stderr: Option<PipeEnd>,
}

impl ChildState {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Borrow the write end of the child's stdin, if still held.
    pub fn stdin_mut(&mut self) -> Option<&mut PipeEnd> {
        self.stdin.as_mut()
    }

    /// Take ownership of the write end of the child's stdin. Dropping the
    /// returned end delivers EOF to the child.
    pub fn take_stdin(&mut self) -> Option<PipeEnd> {
        self.stdin.take()
    }
}

/// Spawn the child with all three standard streams piped.
///
/// On return the parent holds exactly three descriptors for the child:
/// stdin-write, stdout-read and stderr-read (the latter two non-blocking).
/// Every child-side end has been closed in the parent so that end-of-file
/// is observable once the child exits.
pub fn spawn(params: &StartParams) -> Result<ChildState> {
    let program = params.argv[0].clone();
    let argv = to_cstrings(&params.argv)?;
    let env = to_cstrings(&params.env)?;
    let workdir = match &params.workdir {
        Some(dir) => Some(CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
            FledgeError::InvalidParams {
                message: format!("workdir contains a NUL byte: {}", dir.display()),
            }
        })?),
        None => None,
    };

    // Native argv/env: null-terminated pointer arrays, built before the fork
    // so the child performs no allocation between fork and exec.
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let mut env_ptrs: Vec<*const libc::c_char> = env.iter().map(|s| s.as_ptr()).collect();
    env_ptrs.push(std::ptr::null());
    let use_env = !env.is_empty();

    let stdin_pipe = PipePair::new().map_err(|e| FledgeError::pipe("create stdin pipe", e))?;
    let stdout_pipe = PipePair::new().map_err(|e| FledgeError::pipe("create stdout pipe", e))?;
    let stderr_pipe = PipePair::new().map_err(|e| FledgeError::pipe("create stderr pipe", e))?;

    debug!("Spawning child process: {:?}", params.argv);

    // SAFETY: the child branch below only performs async-signal-safe calls
    // (dup2, chdir, prctl, exec, _exit) on data prepared before the fork.
    let fork_result = unsafe { fork() }.map_err(|e| FledgeError::Spawn {
        program: program.clone(),
        source: e.into(),
    })?;

    let pid = match fork_result {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            child_exec(
                &argv_ptrs,
                if use_env { Some(&env_ptrs) } else { None },
                workdir.as_ref().map(|dir| dir.as_ptr()),
                params.die_with_parent,
                stdin_pipe.read.as_raw_fd(),
                stdout_pipe.write.as_raw_fd(),
                stderr_pipe.write.as_raw_fd(),
            );
        }
    };

    // The ends the child duplicated into fds 0/1/2 now belong to it alone;
    // closing them here is what makes EOF observable when the child exits.
    let stdin = stdin_pipe.write;
    let stdout = stdout_pipe.read;
    let stderr = stderr_pipe.read;
    drop(stdin_pipe.read);
    drop(stdout_pipe.write);
    drop(stderr_pipe.write);

    if let Err(e) = stdout
        .set_nonblocking()
        .and_then(|()| stderr.set_nonblocking())
    {
        // The child is already running; reap it before reporting failure so
        // no process or descriptor outlives the failed start.
        warn!("Post-spawn pipe setup failed, killing child {}: {}", pid, e);
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        return Err(FledgeError::pipe("set output pipes non-blocking", e));
    }

    debug!("Spawned child process with PID {}", pid);

    Ok(ChildState {
        pid,
        stdin: Some(stdin),
        stdout: Some(stdout),
        stderr: Some(stderr),
    })
}

/// Child-side half of [`spawn`]: wire the standard streams, apply workdir
/// and the parent-death signal, then exec. Never returns.
fn child_exec(
    argv: &[*const libc::c_char],
    env: Option<&[*const libc::c_char]>,
    workdir: Option<*const libc::c_char>,
    die_with_parent: bool,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
) -> ! {
    // SAFETY: we are in the forked child, single-threaded by definition.
    // Every call below is async-signal-safe and operates on descriptors and
    // pointer arrays prepared by the parent before the fork. dup2 clears
    // close-on-exec on the duplicates, so fds 0/1/2 survive the exec while
    // the O_CLOEXEC originals do not.
    unsafe {
        if libc::dup2(stdin_fd, 0) < 0
            || libc::dup2(stdout_fd, 1) < 0
            || libc::dup2(stderr_fd, 2) < 0
        {
            libc::_exit(SETUP_FAILED);
        }

        if let Some(dir) = workdir {
            if libc::chdir(dir) < 0 {
                libc::_exit(SETUP_FAILED);
            }
        }

        if die_with_parent {
            #[cfg(target_os = "linux")]
            {
                // Best-effort: if the parent is already gone the signal is
                // simply never delivered.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
            }
        }

        match env {
            Some(env) => {
                libc::execve(argv[0], argv.as_ptr(), env.as_ptr());
            }
            None => {
                libc::execv(argv[0], argv.as_ptr());
            }
        }
        // Only reachable if exec failed.
        libc::_exit(EXEC_FAILED);
    }
}

enum StreamState {
    Open,
    Eof,
}

/// Block until stdout or stderr has data or has hung up, then deliver every
/// available chunk. Returns `true` once both streams have reached
/// end-of-stream (their read ends are closed on the spot).
pub fn drain(
    child: &mut ChildState,
    on_stdout: &mut Option<OutputCallback>,
    on_stderr: &mut Option<OutputCallback>,
) -> Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let mut stdout_ready = false;
    let mut stderr_ready = false;
    {
        let mut fds = Vec::with_capacity(2);
        let mut stdout_idx = None;
        let mut stderr_idx = None;
        if let Some(end) = &child.stdout {
            stdout_idx = Some(fds.len());
            fds.push(PollFd::new(end.as_fd(), PollFlags::POLLIN));
        }
        if let Some(end) = &child.stderr {
            stderr_idx = Some(fds.len());
            fds.push(PollFd::new(end.as_fd(), PollFlags::POLLIN));
        }
        if fds.is_empty() {
            return Ok(true);
        }

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(FledgeError::collect("poll on output pipes", e.into()));
                }
            }
        }

        // Any event (data, hang-up, error) means the read loop below will
        // make progress: data first, then a zero-length read at EOF.
        if let Some(i) = stdout_idx {
            stdout_ready = fds[i].revents().is_some_and(|r| !r.is_empty());
        }
        if let Some(i) = stderr_idx {
            stderr_ready = fds[i].revents().is_some_and(|r| !r.is_empty());
        }
    }

    if stdout_ready {
        if let StreamState::Eof = read_available(child.stdout.as_mut().expect("polled"), on_stdout)
            .map_err(|e| FledgeError::collect("read child stdout", e))?
        {
            child.stdout = None;
        }
    }
    if stderr_ready {
        if let StreamState::Eof = read_available(child.stderr.as_mut().expect("polled"), on_stderr)
            .map_err(|e| FledgeError::collect("read child stderr", e))?
        {
            child.stderr = None;
        }
    }

    Ok(child.stdout.is_none() && child.stderr.is_none())
}

/// Read a non-blocking pipe until it would block or reaches end-of-stream,
/// handing each non-empty chunk to the callback as-is.
fn read_available(
    end: &mut PipeEnd,
    callback: &mut Option<OutputCallback>,
) -> io::Result<StreamState> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match end.read(&mut buf) {
            Ok(0) => return Ok(StreamState::Eof),
            Ok(n) => {
                if let Some(cb) = callback {
                    cb(&buf[..n]);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(StreamState::Open),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Reap the child, optionally killing it first.
///
/// `ESRCH` from the kill is treated as success: the process has already
/// exited and only needs reaping.
pub fn wait(child: &mut ChildState, force: bool) -> Result<ProcessResult> {
    if force {
        debug!("Sending SIGKILL to process {}", child.pid);
        match kill(child.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(FledgeError::Kill {
                    pid: child.pid(),
                    source: e.into(),
                });
            }
        }
    }

    let status = loop {
        match waitpid(child.pid, None) {
            Ok(status) => break status,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(FledgeError::Wait {
                    pid: child.pid(),
                    source: e.into(),
                });
            }
        }
    };

    match status {
        WaitStatus::Exited(_, code) => {
            debug!("Process {} exited with code {}", child.pid, code);
            Ok(ProcessResult {
                reason: ExitReason::Exit,
                code,
            })
        }
        WaitStatus::Signaled(_, signal, _) => {
            debug!("Process {} terminated by signal {}", child.pid, signal);
            Ok(ProcessResult {
                reason: ExitReason::Signal,
                code: signal as i32,
            })
        }
        other => Err(FledgeError::Wait {
            pid: child.pid(),
            source: io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected wait status: {other:?}"),
            ),
        }),
    }
}

fn to_cstrings(items: &[String]) -> Result<Vec<CString>> {
    items
        .iter()
        .map(|s| {
            CString::new(s.as_bytes()).map_err(|_| FledgeError::InvalidParams {
                message: format!("string contains a NUL byte: {s:?}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip() {
        let mut pair = PipePair::new().unwrap();
        pair.write.write_all(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let n = pair.read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_pipe_eof_after_writer_drop() {
        let mut pair = PipePair::new().unwrap();
        pair.write.write_all(b"last").unwrap();
        drop(pair.write);

        let mut buf = [0u8; 16];
        let n = pair.read.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"last");
        assert_eq!(pair.read.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_nonblocking_read_on_empty_pipe() {
        let mut pair = PipePair::new().unwrap();
        pair.read.set_nonblocking().unwrap();

        let mut buf = [0u8; 16];
        let err = pair.read.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_spawn_and_wait_true() {
        let params = StartParams::new("/bin/true");
        let mut child = spawn(&params).unwrap();
        let result = wait(&mut child, false).unwrap();
        assert_eq!(result.reason, ExitReason::Exit);
        assert_eq!(result.code, 0);
    }

    #[test]
    fn test_drain_collects_until_eof() {
        let params = StartParams::new("/bin/sh").arg("-c").arg("printf hi");
        let mut child = spawn(&params).unwrap();

        let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = collected.clone();
        let mut on_stdout: Option<OutputCallback> =
            Some(Box::new(move |chunk| sink.lock().unwrap().extend_from_slice(chunk)));
        let mut on_stderr: Option<OutputCallback> = None;

        while !drain(&mut child, &mut on_stdout, &mut on_stderr).unwrap() {}
        let result = wait(&mut child, false).unwrap();

        assert_eq!(result.code, 0);
        assert_eq!(collected.lock().unwrap().as_slice(), b"hi");
    }
}
