//! Error types for the synchronous runner

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while turning caller options into a spawn descriptor or
/// while setting up reactor handles.
///
/// The runner never propagates these to the caller directly; it folds them
/// into an errno code stored in its first-wins error slot, mirroring the
/// integer-code contract of the result record.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Malformed or out-of-range caller input
    #[error("invalid option `{field}`: {reason}")]
    InvalidOption {
        field: &'static str,
        reason: String,
    },

    /// Handle or resource setup failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Raw OS-level failure
    #[error("os error: {0}")]
    Os(#[from] Errno),
}

impl SpawnError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SpawnError::InvalidOption {
            field,
            reason: reason.into(),
        }
    }

    /// Collapse to the errno code recorded in the runner's error slot.
    pub fn errno(&self) -> Errno {
        match self {
            SpawnError::InvalidOption { .. } => Errno::EINVAL,
            SpawnError::Io(err) => io_errno(err),
            SpawnError::Os(errno) => *errno,
        }
    }
}

/// Result type for spawn setup operations
pub type Result<T> = std::result::Result<T, SpawnError>;

/// Map an `io::Error` to its underlying errno, defaulting to EIO for
/// synthetic errors that carry no OS code.
pub(crate) fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use nix::libc;

    use super::*;

    #[test]
    fn invalid_option_maps_to_einval() {
        let err = SpawnError::invalid("timeout", "must be non-negative");
        assert_eq!(err.errno(), Errno::EINVAL);
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn io_error_keeps_os_code() {
        let err = SpawnError::from(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.errno(), Errno::ENOENT);
    }

    #[test]
    fn synthetic_io_error_defaults_to_eio() {
        let err = io::Error::new(io::ErrorKind::Other, "no code");
        assert_eq!(io_errno(&err), Errno::EIO);
    }
}
