//! Termination outcome of a joined child process.

/// How the child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process ran to completion and returned an exit code.
    Exit,
    /// The process was terminated by a signal or a forced kill.
    Signal,
}

/// Result of [`Process::join`](crate::Process::join).
///
/// `code` is the exit code when `reason` is [`ExitReason::Exit`], and the
/// signal number (POSIX) or the raw termination status (Windows) when
/// `reason` is [`ExitReason::Signal`]. The encoding is platform-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub reason: ExitReason,
    pub code: i32,
}

impl ProcessResult {
    /// True if the process exited normally with code 0.
    pub fn success(&self) -> bool {
        self.reason == ExitReason::Exit && self.code == 0
    }
}

impl std::fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            ExitReason::Exit => write!(f, "exited with code {}", self.code),
            ExitReason::Signal => write!(f, "terminated by signal {}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        assert!(ProcessResult {
            reason: ExitReason::Exit,
            code: 0
        }
        .success());
        assert!(!ProcessResult {
            reason: ExitReason::Exit,
            code: 3
        }
        .success());
        assert!(!ProcessResult {
            reason: ExitReason::Signal,
            code: 9
        }
        .success());
    }

    #[test]
    fn test_display() {
        let exited = ProcessResult {
            reason: ExitReason::Exit,
            code: 3,
        };
        assert_eq!(exited.to_string(), "exited with code 3");

        let killed = ProcessResult {
            reason: ExitReason::Signal,
            code: 9,
        };
        assert_eq!(killed.to_string(), "terminated by signal 9");
    }
}
