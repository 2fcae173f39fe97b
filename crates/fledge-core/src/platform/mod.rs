//! Platform abstraction layer for process spawning and output collection.
//!
//! This module centralizes all platform-specific code. All `#[cfg]` blocks
//! for OS-specific behavior live here rather than scattered throughout the
//! codebase; the [`Process`](crate::Process) state machine above is shared
//! and never duplicated per platform.
//!
//! # Architecture
//!
//! Each backend exposes the same surface:
//! - `PipeEnd` — move-only owner of one pipe end, closed exactly once
//! - `ChildState` — the spawned child: process identity plus every pipe end
//!   the parent still owns
//! - `spawn` — create the pipes, create the child with its standard streams
//!   redirected, close the child-side ends in the parent
//! - `drain` — block until output or end-of-stream, delivering chunks to the
//!   callbacks; reports when both streams have closed
//! - `wait` — optionally kill, then reap the exit status
//!
//! # Supported Platforms
//!
//! - **Unix**: fork/exec with `poll(2)`-driven collection
//! - **Windows**: `CreateProcessW` with reader-thread collection

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{drain, spawn, wait, ChildState, PipeEnd, PipePair};

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub use windows::{drain, spawn, wait, ChildState, PipeEnd, PipePair};
