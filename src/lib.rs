//! # spawn-sync
//!
//! **Purpose**: Blocking child-process execution with fully captured stdio
//!
//! Spawns a child process, feeds and captures its standard I/O, enforces an
//! optional wall-clock timeout and an optional output-size cap, and returns
//! one aggregate result describing the exit status, terminating signal,
//! captured streams and first fatal error. The entire run is driven by a
//! private single-threaded reactor created inside the call; from the
//! caller's perspective `run` is fully blocking and leaves no handle open
//! behind.
//!
//! ## Features
//!
//! - **Synchronous by design**: one call, one child, one result
//! - **Stdio control**: per-fd slots (ignore, pipe, inherit), including
//!   fds beyond stderr
//! - **Input feeding**: pipe slots can carry an input buffer that is
//!   written in full, then half-closed
//! - **Timeout**: a one-shot kill timer delivers the configured signal and
//!   records `ETIMEDOUT`
//! - **Output cap**: total capture across all streams can be bounded;
//!   exceeding it kills the child
//! - **Error prioritization**: setup/control errors outrank pipe I/O errors
//!
//! ## Usage
//!
//! ```rust,no_run
//! use spawn_sync::{run, RunOptions, StdioSlot};
//!
//! let options = RunOptions::new("/bin/echo")
//!     .args(["echo", "hello"])
//!     .stdio([StdioSlot::ignore(), StdioSlot::capture(), StdioSlot::ignore()]);
//!
//! let result = run(options);
//! assert_eq!(result.status, Some(0));
//! assert_eq!(result.stdout(), Some(&b"hello\n"[..]));
//! ```

#[cfg(not(unix))]
compile_error!("spawn-sync drives stdio through Unix socket pairs and supports Unix targets only");

mod buffer;
pub mod config;
pub mod error;
mod pipe;
mod runner;
mod spawn;

pub use config::{RunOptions, StdioSlot};
pub use error::SpawnError;
pub use runner::RunResult;

// Callers match on these in results, so surface the exact types.
pub use nix::errno::Errno;
pub use nix::sys::signal::Signal;

use runner::Runner;

/// Run a child process to completion and collect its result.
///
/// Never returns an `Err`: every failure, from malformed options to a
/// failed spawn to a timeout, is recorded in the result's `error` field as
/// an errno code, alongside whatever structural fields are still
/// meaningful.
pub fn run(options: RunOptions) -> RunResult {
    Runner::new(options).run()
}
