//! Caller-facing option record
//!
//! `RunOptions` mirrors the external record shape one-to-one: serde uses
//! `camelCase` names (`envPairs`, `maxBuffer`, `killSignal`,
//! `windowsVerbatimArguments`) and stdio slots are tagged by `type`, so a
//! JSON record like `{"type": "pipe", "writable": true}` deserializes
//! directly. Numeric fields are kept wide here and range-checked during
//! parsing; violations are hard errors, never truncation.

use serde::{Deserialize, Serialize};

/// Options for one synchronous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Executable path
    pub file: String,
    /// Full argv; element 0 is by convention the program name
    pub args: Vec<String>,
    /// Working directory (None = inherit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// `KEY=VALUE` environment vector; replaces the inherited environment
    /// entirely when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_pairs: Option<Vec<String>>,
    /// Run the child under this user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    /// Run the child under this group id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<i64>,
    /// Detach the child into its own process group
    #[serde(default)]
    pub detached: bool,
    /// Pass arguments verbatim on Windows; ignored on Unix
    #[serde(default)]
    pub windows_verbatim_arguments: bool,
    /// Wall-clock timeout in milliseconds; 0 or absent = no timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// Byte cap across all captured streams; 0 or absent = unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buffer: Option<i64>,
    /// Signal sent on timeout or overflow; default SIGTERM, must be nonzero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_signal: Option<i32>,
    /// One entry per child fd
    #[serde(default)]
    pub stdio: Vec<StdioSlot>,
}

impl RunOptions {
    /// Start an option record for `file`, with `args` defaulting to
    /// `[file]` per the argv0 convention.
    pub fn new(file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            args: vec![file.clone()],
            file,
            cwd: None,
            env_pairs: None,
            uid: None,
            gid: None,
            detached: false,
            windows_verbatim_arguments: false,
            timeout: None,
            max_buffer: None,
            kill_signal: None,
            stdio: Vec::new(),
        }
    }

    /// Replace the full argv, including element 0.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Replace the child environment with the given `KEY=VALUE` pairs.
    pub fn env_pairs<I, S>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_pairs = Some(pairs.into_iter().map(Into::into).collect());
        self
    }

    /// Set the timeout in milliseconds.
    pub fn timeout_ms(mut self, ms: i64) -> Self {
        self.timeout = Some(ms);
        self
    }

    /// Cap total captured output at `bytes`.
    pub fn max_buffer(mut self, bytes: i64) -> Self {
        self.max_buffer = Some(bytes);
        self
    }

    /// Signal number used for the timeout/overflow kill.
    pub fn kill_signal(mut self, signal: i32) -> Self {
        self.kill_signal = Some(signal);
        self
    }

    /// Detach the child into its own process group.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Set the stdio slot layout.
    pub fn stdio<I>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = StdioSlot>,
    {
        self.stdio = slots.into_iter().collect();
        self
    }
}

/// Configuration of one child fd.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StdioSlot {
    /// The slot is not connected to anything
    Ignore,
    /// A pipe between parent and child. Directions are from the parent's
    /// perspective: `readable` feeds `input` into the child, `writable`
    /// captures the child's output.
    Pipe {
        #[serde(default)]
        readable: bool,
        #[serde(default)]
        writable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Vec<u8>>,
    },
    /// The child inherits the given parent fd
    Inherit { fd: i32 },
}

impl StdioSlot {
    /// An ignored slot.
    pub fn ignore() -> Self {
        StdioSlot::Ignore
    }

    /// A slot that feeds `input` to the child and half-closes.
    pub fn input(bytes: impl Into<Vec<u8>>) -> Self {
        StdioSlot::Pipe {
            readable: true,
            writable: false,
            input: Some(bytes.into()),
        }
    }

    /// A slot that captures the child's output.
    pub fn capture() -> Self {
        StdioSlot::Pipe {
            readable: false,
            writable: true,
            input: None,
        }
    }

    /// A slot inheriting the given parent fd.
    pub fn inherit(fd: i32) -> Self {
        StdioSlot::Inherit { fd }
    }
}
