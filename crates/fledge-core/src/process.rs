//! The `Process` state machine: the platform-neutral half of the library.
//!
//! All lifecycle preconditions are enforced here, once, above the platform
//! boundary; the backends in [`crate::platform`] only move bytes and
//! handles. Ownership discipline: every descriptor/handle created by
//! `start` is owned by exactly one place at a time (the platform child
//! state, or a caller that took the stdin end), and `join` drops whatever
//! is left, so nothing can leak or be closed twice on any path.

use crate::error::{FledgeError, Result};
use crate::outcome::ProcessResult;
use crate::params::StartParams;
use crate::platform;
use crate::status::Status;
use tracing::debug;

/// Callback invoked with each chunk of child output.
///
/// Chunks are non-empty and delivered in stream order, but their boundaries
/// carry no meaning — they are whatever a single read returned. The
/// invocation thread is unspecified (the calling thread on Unix, a reader
/// thread on Windows), hence the `Send` bound.
pub type OutputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A child process with piped standard streams.
///
/// Lifecycle: construct, [`start`](Process::start), call
/// [`collect_outputs`](Process::collect_outputs) in a loop while
/// [`status`](Process::status) is [`Status::Running`], then
/// [`join`](Process::join) to reap the exit outcome and release every OS
/// handle.
///
/// # Example
///
/// ```rust,no_run
/// use fledge::{Process, StartParams, Status};
///
/// fn main() -> fledge::Result<()> {
///     let mut process = Process::new();
///     process.on_stdout(|chunk| print!("{}", String::from_utf8_lossy(chunk)));
///
///     process.start(StartParams::new("/bin/sh").arg("-c").arg("echo hello"))?;
///     while process.status() == Status::Running {
///         process.collect_outputs()?;
///     }
///     let result = process.join(false)?;
///     println!("child {}", result);
///     Ok(())
/// }
/// ```
#[derive(Default)]
pub struct Process {
    status: Status,
    pid: Option<u32>,
    child: Option<platform::ChildState>,
    on_stdout: Option<OutputCallback>,
    on_stderr: Option<OutputCallback>,
}

impl Process {
    /// Create a process in the [`Status::Init`] state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for chunks of the child's stdout.
    ///
    /// Without a callback, stdout data is read and discarded.
    pub fn on_stdout(&mut self, callback: impl FnMut(&[u8]) + Send + 'static) {
        self.on_stdout = Some(Box::new(callback));
    }

    /// Register a callback for chunks of the child's stderr.
    ///
    /// Without a callback, stderr data is read and discarded.
    pub fn on_stderr(&mut self, callback: impl FnMut(&[u8]) + Send + 'static) {
        self.on_stderr = Some(Box::new(callback));
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Process identifier, recorded by a successful `start` and retained
    /// after `join`.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the child described by `params`.
    ///
    /// Requires state [`Status::Init`]. Parameters are validated before any
    /// OS resource is created; on any failure every resource created by
    /// this call has already been released and the state is still `Init`.
    pub fn start(&mut self, params: StartParams) -> Result<()> {
        if !self.status().can_start() {
            return Err(FledgeError::InvalidState {
                operation: "start",
                status: self.status(),
            });
        }
        params.validate()?;

        let child = platform::spawn(&params)?;
        self.pid = Some(child.pid());
        self.child = Some(child);
        self.status = Status::Running;
        Ok(())
    }

    /// Block once for child output and deliver it to the callbacks.
    ///
    /// Requires state [`Status::Running`]. Blocks until at least one stream
    /// has data or has hung up, then delivers every available chunk. When
    /// both streams reach end-of-stream the state becomes
    /// [`Status::Finished`] and the caller should `join`. On an OS-level
    /// failure the state is unchanged and the call may be retried, but the
    /// process must still be joined eventually.
    pub fn collect_outputs(&mut self) -> Result<()> {
        if !self.status().can_collect() {
            return Err(FledgeError::InvalidState {
                operation: "collect outputs",
                status: self.status(),
            });
        }
        let child = self.child.as_mut().expect("running process has a child");

        if platform::drain(child, &mut self.on_stdout, &mut self.on_stderr)? {
            debug!("Both output streams closed; child has exited");
            self.status = Status::Finished;
        }
        Ok(())
    }

    /// Wait for the child to terminate and release every OS handle.
    ///
    /// Requires state [`Status::Running`] or [`Status::Finished`]. With
    /// `force`, the child is killed first (SIGKILL / forced termination),
    /// so the call returns in bounded time even for a child that ignores
    /// polite signals. Undrained output is discarded. On success the state
    /// becomes [`Status::Joined`] and no further operations are legal.
    pub fn join(&mut self, force: bool) -> Result<ProcessResult> {
        if !self.status().can_join() {
            return Err(FledgeError::InvalidState {
                operation: "join",
                status: self.status(),
            });
        }
        let child = self.child.as_mut().expect("joinable process has a child");

        let result = platform::wait(child, force)?;
        // Dropping the child state closes the process handles and every
        // pipe end not already closed by the collector or taken by the
        // caller.
        self.child = None;
        self.status = Status::Joined;
        debug!("Joined process {:?}: {}", self.pid, result);
        Ok(result)
    }

    /// Borrow the write end of the child's stdin, if the process has been
    /// started and the end has not been taken or closed.
    pub fn stdin_mut(&mut self) -> Option<&mut platform::PipeEnd> {
        self.child.as_mut().and_then(|c| c.stdin_mut())
    }

    /// Take ownership of the write end of the child's stdin.
    ///
    /// Dropping the returned end closes it, delivering EOF to the child —
    /// the usual way to finish feeding input.
    pub fn take_stdin(&mut self) -> Option<platform::PipeEnd> {
        self.child.as_mut().and_then(|c| c.take_stdin())
    }

    /// Close the child's stdin, delivering EOF.
    pub fn close_stdin(&mut self) {
        drop(self.take_stdin());
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("status", &self.status())
            .field("pid", &self.pid)
            .field("has_stdout_callback", &self.on_stdout.is_some())
            .field("has_stderr_callback", &self.on_stderr.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_process_is_init_without_pid() {
        let process = Process::new();
        assert_eq!(process.status(), Status::Init);
        assert_eq!(process.pid(), None);
    }

    #[test]
    fn test_collect_before_start_fails() {
        let mut process = Process::new();
        let err = process.collect_outputs().unwrap_err();
        assert!(matches!(
            err,
            FledgeError::InvalidState {
                operation: "collect outputs",
                status: Status::Init,
            }
        ));
    }

    #[test]
    fn test_join_before_start_fails() {
        let mut process = Process::new();
        let err = process.join(false).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(process.status(), Status::Init);
    }

    #[test]
    fn test_start_with_empty_argv_fails_without_side_effects() {
        let mut process = Process::new();
        let err = process.start(StartParams::from_argv(vec![])).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(process.status(), Status::Init);
        assert_eq!(process.pid(), None);
        assert!(process.stdin_mut().is_none());
    }

    #[test]
    fn test_stdin_absent_before_start() {
        let mut process = Process::new();
        assert!(process.take_stdin().is_none());
    }

    #[test]
    fn test_debug_does_not_require_callbacks() {
        let mut process = Process::new();
        process.on_stdout(|_| {});
        let rendered = format!("{process:?}");
        assert!(rendered.contains("has_stdout_callback: true"));
        assert!(rendered.contains("has_stderr_callback: false"));
    }
}
