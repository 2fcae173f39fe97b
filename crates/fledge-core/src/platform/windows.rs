//! Windows process backend: `CreateProcessW` spawning and reader-thread
//! collection.
//!
//! Anonymous pipes are created inheritable, the parent-kept end is then
//! marked non-inheritable, and the child-side ends are closed in the parent
//! immediately after process creation. That last step is what lets the
//! blocking `ReadFile` loops observe a broken pipe (end-of-stream) the
//! moment the child exits, so the reader threads shut down on their own
//! without any out-of-band wake-up.

// This module owns the Win32 handle and process-creation boundary.
#![allow(unsafe_code)]

use crate::error::{FledgeError, Result};
use crate::outcome::{ExitReason, ProcessResult};
use crate::params::StartParams;
use crate::process::OutputCallback;
use std::io::{self, Read, Write};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    SetHandleInformation, ERROR_ACCESS_DENIED, ERROR_BROKEN_PIPE, HANDLE, HANDLE_FLAG_INHERIT,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject,
    CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
    STARTUPINFOW,
};

/// Exit code used for forced termination. Lies in the NTSTATUS failure
/// range, so the reason mapping below reports it as [`ExitReason::Signal`];
/// `STATUS_CONTROL_C_EXIT` is the conventional "killed" status.
const FORCED_EXIT_STATUS: u32 = 0xC000_013A;

/// Exit statuses at or above this value are crash/kill reports rather than
/// ordinary exit codes.
const NTSTATUS_FAILURE_BASE: u32 = 0xC000_0000;

const READ_CHUNK: usize = 4096;

/// One end of an anonymous pipe: a move-only owner of a Win32 handle.
///
/// The handle is closed exactly once, when the value is dropped.
#[derive(Debug)]
pub struct PipeEnd {
    handle: OwnedHandle,
}

impl PipeEnd {
    /// Wrap a raw handle returned by `CreatePipe`.
    ///
    /// # Safety caller contract
    /// `handle` must be valid, open and exclusively owned by the new value.
    fn from_raw(handle: HANDLE) -> Self {
        // SAFETY: per the contract above, we are the sole owner.
        let handle = unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) };
        Self { handle }
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    /// Exclude this end from handle inheritance so the child only receives
    /// the ends wired into its standard streams.
    fn disinherit(&self) -> io::Result<()> {
        // SAFETY: handle is owned and open.
        let ok = unsafe { SetHandleInformation(self.raw(), HANDLE_FLAG_INHERIT, 0) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n: u32 = 0;
        // SAFETY: handle is owned and open; the buffer pointer and length
        // come from a live mutable slice.
        let ok = unsafe {
            ReadFile(
                self.raw(),
                buf.as_mut_ptr(),
                buf.len() as u32,
                &mut n,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // The writer side is gone: end-of-stream, not a failure.
            if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut n: u32 = 0;
        // SAFETY: handle is owned and open; the buffer pointer and length
        // come from a live slice.
        let ok = unsafe {
            WriteFile(
                self.raw(),
                buf.as_ptr(),
                buf.len() as u32,
                &mut n,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
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
    /// Create an anonymous pipe with both ends initially inheritable.
    pub fn new() -> io::Result<Self> {
        let mut read: HANDLE = std::ptr::null_mut();
        let mut write: HANDLE = std::ptr::null_mut();
        let attrs = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: std::ptr::null_mut(),
            bInheritHandle: 1,
        };
        // SAFETY: out-pointers reference live locals; attrs is fully
        // initialized.
        let ok = unsafe { CreatePipe(&mut read, &mut write, &attrs, 0) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read: PipeEnd::from_raw(read),
            write: PipeEnd::from_raw(write),
        })
    }
}

/// A spawned child process and every handle the parent still owns for it.
///
/// Dropping this closes the process, thread and job handles as well as any
/// remaining pipe ends.
#[derive(Debug)]
pub struct ChildState {
    pid: u32,
    process: OwnedHandle,
    // Primary-thread handle from CreateProcessW; held only so it can be
    // released together with the process handle.
    _thread: OwnedHandle,
    job: Option<OwnedHandle>,
    stdin: Option<PipeEnd>,
    stdout: Option<PipeEnd>,
    stderr: Option<PipeEnd>,
}

impl ChildState {
    pub fn pid(&self) -> u32 {
        self.pid
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
/// On return the parent holds the process/thread handles, the optional job
/// object and exactly three pipe ends: stdin-write, stdout-read and
/// stderr-read. Every child-side end has been closed in the parent so the
/// reader threads observe end-of-stream once the child exits.
pub fn spawn(params: &StartParams) -> Result<ChildState> {
    let program = params.argv[0].clone();

    let stdin_pipe = pipe_for_child(PipeSide::Write)
        .map_err(|e| FledgeError::pipe("create stdin pipe", e))?;
    let stdout_pipe = pipe_for_child(PipeSide::Read)
        .map_err(|e| FledgeError::pipe("create stdout pipe", e))?;
    let stderr_pipe = pipe_for_child(PipeSide::Read)
        .map_err(|e| FledgeError::pipe("create stderr pipe", e))?;

    let mut command_line = build_command_line(&params.argv);
    let env_block = build_env_block(&params.env);
    let workdir: Option<Vec<u16>> = params.workdir.as_ref().map(|dir| {
        let mut wide: Vec<u16> = dir.as_os_str().encode_wide().collect();
        wide.push(0);
        wide
    });

    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = stdin_pipe.read.raw();
    startup.hStdOutput = stdout_pipe.write.raw();
    startup.hStdError = stderr_pipe.write.raw();

    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let mut flags = 0;
    if env_block.is_some() {
        flags |= CREATE_UNICODE_ENVIRONMENT;
    }

    debug!("Spawning child process: {:?}", params.argv);

    // SAFETY: command_line/env_block/workdir are live, null-terminated
    // buffers; startup references pipe ends that stay open across the call.
    let ok = unsafe {
        CreateProcessW(
            std::ptr::null(),
            command_line.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            1,
            flags,
            env_block
                .as_ref()
                .map_or(std::ptr::null(), |b| b.as_ptr().cast()),
            workdir.as_ref().map_or(std::ptr::null(), |w| w.as_ptr()),
            &startup,
            &mut info,
        )
    };
    if ok == 0 {
        return Err(FledgeError::Spawn {
            program,
            source: io::Error::last_os_error(),
        });
    }

    // SAFETY: CreateProcessW succeeded, so both handles are valid and ours.
    let process = unsafe { OwnedHandle::from_raw_handle(info.hProcess as RawHandle) };
    let thread = unsafe { OwnedHandle::from_raw_handle(info.hThread as RawHandle) };
    let pid = info.dwProcessId;

    // The ends the child inherited into its standard streams now belong to
    // it alone; closing them here is what makes end-of-stream observable
    // when the child exits.
    let stdin = stdin_pipe.write;
    let stdout = stdout_pipe.read;
    let stderr = stderr_pipe.read;
    drop(stdin_pipe.read);
    drop(stdout_pipe.write);
    drop(stderr_pipe.write);

    let job = if params.die_with_parent {
        match attach_kill_on_close_job(&process) {
            Ok(job) => Some(job),
            Err(e) => {
                // The child is already running; take it down before
                // reporting the failed start so nothing outlives the error.
                warn!("Job object setup failed, terminating child {}: {}", pid, e);
                // SAFETY: process handle is valid.
                unsafe {
                    TerminateProcess(process.as_raw_handle() as HANDLE, FORCED_EXIT_STATUS);
                    WaitForSingleObject(process.as_raw_handle() as HANDLE, INFINITE);
                }
                return Err(FledgeError::Spawn { program, source: e });
            }
        }
    } else {
        None
    };

    debug!("Spawned child process with PID {}", pid);

    Ok(ChildState {
        pid,
        process,
        _thread: thread,
        job,
        stdin: Some(stdin),
        stdout: Some(stdout),
        stderr: Some(stderr),
    })
}

enum PipeSide {
    Read,
    Write,
}

/// Create a pipe whose child side stays inheritable while the parent-kept
/// end (`parent_keeps`) is excluded from inheritance.
fn pipe_for_child(parent_keeps: PipeSide) -> io::Result<PipePair> {
    let pair = PipePair::new()?;
    match parent_keeps {
        PipeSide::Read => pair.read.disinherit()?,
        PipeSide::Write => pair.write.disinherit()?,
    }
    Ok(pair)
}

/// Create a job object that kills its processes when the last handle to it
/// closes, and assign the child to it. The returned handle is held until
/// join; if this process dies first, the handle closes and the child dies
/// with it.
fn attach_kill_on_close_job(process: &OwnedHandle) -> io::Result<OwnedHandle> {
    // SAFETY: plain creation call with no input structures.
    let raw = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
    if raw.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw was just created and is exclusively ours.
    let job = unsafe { OwnedHandle::from_raw_handle(raw as RawHandle) };

    let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

    // SAFETY: job is a valid job handle; limits is fully initialized and
    // outlives the call.
    let ok = unsafe {
        SetInformationJobObject(
            job.as_raw_handle() as HANDLE,
            JobObjectExtendedLimitInformation,
            std::ptr::addr_of!(limits).cast(),
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both handles are valid.
    let ok = unsafe {
        AssignProcessToJobObject(
            job.as_raw_handle() as HANDLE,
            process.as_raw_handle() as HANDLE,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(job)
}

/// Drain both output streams to end-of-stream and wait for the child to
/// exit, delivering chunks from two scoped reader threads.
///
/// One call runs to completion: the pull contract ("call while running")
/// holds on both platforms, this backend simply finishes in a single call.
/// Callbacks run on the reader threads, hence their `Send` bound.
pub fn drain(
    child: &mut ChildState,
    on_stdout: &mut Option<OutputCallback>,
    on_stderr: &mut Option<OutputCallback>,
) -> Result<bool> {
    let process = child.process.as_raw_handle() as HANDLE;
    let stdout = child.stdout.as_mut();
    let stderr = child.stderr.as_mut();

    let (stdout_res, stderr_res, wait_res) = std::thread::scope(|scope| {
        let stdout_worker = stdout.map(|end| scope.spawn(move || read_to_eof(end, on_stdout)));
        let stderr_worker = stderr.map(|end| scope.spawn(move || read_to_eof(end, on_stderr)));

        // SAFETY: the process handle outlives the scope.
        let waited = unsafe { WaitForSingleObject(process, INFINITE) };
        let wait_res = if waited == WAIT_OBJECT_0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        };

        let join = |worker: Option<std::thread::ScopedJoinHandle<'_, io::Result<()>>>| {
            worker.map_or(Ok(()), |w| {
                w.join().unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::Other,
                        "output reader thread panicked",
                    ))
                })
            })
        };
        (join(stdout_worker), join(stderr_worker), wait_res)
    });

    stdout_res.map_err(|e| FledgeError::collect("read child stdout", e))?;
    stderr_res.map_err(|e| FledgeError::collect("read child stderr", e))?;
    wait_res.map_err(|e| FledgeError::collect("wait for child exit", e))?;

    // Both streams have reached end-of-stream; release the read ends now.
    child.stdout = None;
    child.stderr = None;

    Ok(true)
}

/// Blocking read loop: deliver every non-empty chunk until end-of-stream.
fn read_to_eof(end: &mut PipeEnd, callback: &mut Option<OutputCallback>) -> io::Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match end.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                if let Some(cb) = callback {
                    cb(&buf[..n]);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reap the child, optionally terminating it first.
///
/// Exit statuses in the NTSTATUS failure range (crashes and our own forced
/// termination status) are reported as [`ExitReason::Signal`]; everything
/// else is an ordinary [`ExitReason::Exit`].
pub fn wait(child: &mut ChildState, force: bool) -> Result<ProcessResult> {
    let process = child.process.as_raw_handle() as HANDLE;

    if force {
        debug!("Forcibly terminating process {}", child.pid);
        // SAFETY: process handle is valid.
        let ok = unsafe { TerminateProcess(process, FORCED_EXIT_STATUS) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // Termination of an already-exited process is denied; that is
            // success for our purposes, confirmed by a zero-timeout wait.
            let already_exited = err.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32)
                && unsafe { WaitForSingleObject(process, 0) } != WAIT_TIMEOUT;
            if !already_exited {
                return Err(FledgeError::Kill {
                    pid: child.pid,
                    source: err,
                });
            }
        }
    }

    // SAFETY: process handle is valid.
    let waited = unsafe { WaitForSingleObject(process, INFINITE) };
    if waited != WAIT_OBJECT_0 {
        return Err(FledgeError::Wait {
            pid: child.pid,
            source: io::Error::last_os_error(),
        });
    }

    let mut status: u32 = 0;
    // SAFETY: process handle is valid; status references a live local.
    let ok = unsafe { GetExitCodeProcess(process, &mut status) };
    if ok == 0 {
        return Err(FledgeError::Wait {
            pid: child.pid,
            source: io::Error::last_os_error(),
        });
    }

    let result = if status >= NTSTATUS_FAILURE_BASE {
        debug!("Process {} terminated, status {:#x}", child.pid, status);
        ProcessResult {
            reason: ExitReason::Signal,
            code: status as i32,
        }
    } else {
        debug!("Process {} exited with code {}", child.pid, status);
        ProcessResult {
            reason: ExitReason::Exit,
            code: status as i32,
        }
    };

    // Close the job handle now that the child has exited; kill-on-close has
    // nothing left to kill at this point.
    child.job.take();

    Ok(result)
}

/// Build a null-terminated UTF-16 command line from an argument vector,
/// quoting per the MSVCRT parsing rules so the child's argv round-trips.
fn build_command_line(argv: &[String]) -> Vec<u16> {
    let mut line = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        append_quoted(&mut line, arg);
    }
    let mut wide: Vec<u16> = line.encode_utf16().collect();
    wide.push(0);
    wide
}

fn append_quoted(line: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '"']);
    if !needs_quotes {
        line.push_str(arg);
        return;
    }
    line.push('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        if ch == '\\' {
            backslashes += 1;
        } else if ch == '"' {
            // Backslashes preceding a quote must be doubled, plus one to
            // escape the quote itself.
            line.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
            backslashes = 0;
            line.push('"');
        } else {
            line.extend(std::iter::repeat('\\').take(backslashes));
            backslashes = 0;
            line.push(ch);
        }
    }
    // Backslashes before the closing quote must also be doubled.
    line.extend(std::iter::repeat('\\').take(backslashes * 2));
    line.push('"');
}

/// Build the double-null-terminated UTF-16 environment block, or `None` to
/// inherit the parent environment.
fn build_env_block(env: &[String]) -> Option<Vec<u16>> {
    if env.is_empty() {
        return None;
    }
    let mut block = Vec::new();
    for entry in env {
        block.extend(entry.encode_utf16());
        block.push(0);
    }
    block.push(0);
    Some(block)
}
