//! Process lifecycle states.

/// Lifecycle state of a [`Process`](crate::Process).
///
/// States advance strictly forward: `Init → Running → Finished → Joined`,
/// with `Running → Joined` also legal when the caller joins (or kills)
/// before end-of-stream has been observed. Every public operation checks the
/// current state first and fails without side effects if it does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Constructed; `start` has not been called.
    #[default]
    Init,
    /// The child is running (or has exited but end-of-stream has not been
    /// observed yet).
    Running,
    /// Both output streams reached end-of-stream; the child has exited but
    /// has not been reaped.
    Finished,
    /// The exit status has been reaped and every handle released. Terminal.
    Joined,
}

impl Status {
    /// True if `start` may be called in this state.
    pub fn can_start(self) -> bool {
        self == Status::Init
    }

    /// True if `collect_outputs` may be called in this state.
    pub fn can_collect(self) -> bool {
        self == Status::Running
    }

    /// True if `join` may be called in this state.
    pub fn can_join(self) -> bool {
        matches!(self, Status::Running | Status::Finished)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Init => "init",
            Status::Running => "running",
            Status::Finished => "finished",
            Status::Joined => "joined",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_from_init() {
        assert!(Status::Init.can_start());
        assert!(!Status::Running.can_start());
        assert!(!Status::Finished.can_start());
        assert!(!Status::Joined.can_start());
    }

    #[test]
    fn test_collect_only_while_running() {
        assert!(Status::Running.can_collect());
        assert!(!Status::Init.can_collect());
        assert!(!Status::Finished.can_collect());
        assert!(!Status::Joined.can_collect());
    }

    #[test]
    fn test_join_from_running_or_finished() {
        assert!(Status::Running.can_join());
        assert!(Status::Finished.can_join());
        assert!(!Status::Init.can_join());
        assert!(!Status::Joined.can_join());
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Init.to_string(), "init");
        assert_eq!(Status::Joined.to_string(), "joined");
    }
}
