//! Start parameters for spawning a child process.

use crate::error::{FledgeError, Result};
use std::path::{Path, PathBuf};

/// Configuration for spawning a child process.
///
/// `argv[0]` is the program path; it is executed directly, without a PATH
/// search. `env` entries are `KEY=VALUE` strings; an empty `env` means the
/// child inherits the caller's environment. The platform boundary appends
/// the native terminator (trailing null pointer on POSIX, double-NUL block
/// on Windows) when converting, so callers never deal with sentinels.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Argument vector, program path first.
    pub argv: Vec<String>,
    /// Environment as `KEY=VALUE` entries. Empty means inherit.
    pub env: Vec<String>,
    /// Working directory for the child. `None` means inherit.
    pub workdir: Option<PathBuf>,
    /// Terminate the child if this process dies before joining it.
    ///
    /// Best-effort: death-signal on Linux, kill-on-close job object on
    /// Windows, unsupported elsewhere.
    pub die_with_parent: bool,
}

impl StartParams {
    /// Create params for the given program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            ..Self::default()
        }
    }

    /// Create params from a complete argument vector.
    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    ///
    /// Setting any variable switches the child to the explicit environment;
    /// inherited variables must then be passed through by the caller.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add a raw `KEY=VALUE` environment entry.
    pub fn env_entry(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Set the working directory for the child.
    pub fn workdir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Request that the child die when the parent does.
    pub fn die_with_parent(mut self, enabled: bool) -> Self {
        self.die_with_parent = enabled;
        self
    }

    /// Validate the parameters before any OS resource is created.
    ///
    /// Rejects an empty argv and strings the platform spawn call cannot
    /// represent (interior NUL bytes).
    pub(crate) fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(FledgeError::InvalidParams {
                message: "argv is empty".into(),
            });
        }
        for arg in &self.argv {
            if arg.contains('\0') {
                return Err(FledgeError::InvalidParams {
                    message: format!("argv entry contains a NUL byte: {arg:?}"),
                });
            }
        }
        for entry in &self.env {
            if entry.contains('\0') {
                return Err(FledgeError::InvalidParams {
                    message: format!("env entry contains a NUL byte: {entry:?}"),
                });
            }
        }
        Ok(())
    }
}
