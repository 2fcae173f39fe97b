//! Fledge - Cross-platform child process spawning with streaming output.
//!
//! This crate spawns a child process with all three standard streams piped,
//! streams its stdout/stderr to caller-supplied callbacks without losing
//! data or blocking forever, and reaps its termination outcome — with the
//! guarantee that every descriptor and handle is closed exactly once on
//! every success and failure path.
//!
//! The lifecycle is a strict state machine (`Init → Running → Finished →
//! Joined`); see [`Process`] for the operation-by-operation contract. All
//! OS-specific code lives in the `platform` module, with a fork/exec +
//! `poll(2)` backend on Unix and a `CreateProcessW` + reader-thread backend
//! on Windows behind the same interface.
//!
//! # Example
//!
//! ```rust,no_run
//! use fledge::{Process, StartParams, Status};
//!
//! fn main() -> fledge::Result<()> {
//!     let mut process = Process::new();
//!     process.on_stdout(|chunk| print!("{}", String::from_utf8_lossy(chunk)));
//!     process.on_stderr(|chunk| eprint!("{}", String::from_utf8_lossy(chunk)));
//!
//!     process.start(StartParams::new("/bin/ls").arg("-l"))?;
//!     while process.status() == Status::Running {
//!         process.collect_outputs()?;
//!     }
//!     let result = process.join(false)?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod outcome;
pub mod params;
pub mod platform;
pub mod process;
pub mod status;

// Re-export commonly used types
pub use error::{FledgeError, Result};
pub use outcome::{ExitReason, ProcessResult};
pub use params::StartParams;
pub use platform::{PipeEnd, PipePair};
pub use process::{OutputCallback, Process};
pub use status::Status;
