//! Error taxonomy for cgroup operations
//!
//! Four failure classes cover everything the library can report:
//!
//! - [`CgroupError::Precondition`] - hierarchy not mounted, cgroup missing,
//!   control file missing. Never retried by the library.
//! - [`CgroupError::Io`] - errno-bearing kernel failures (mount, mkdir,
//!   read/write, kill).
//! - [`CgroupError::Parse`] - malformed `/proc` or control-file content.
//! - [`CgroupError::Internal`] - plumbing failures (a spawned task panicked).
//!
//! Timeouts are deliberately NOT errors: the freezer and the empty-watcher
//! resolve `Ok(false)` when they give up, and callers decide whether to
//! restart. Cancellation never produces a value at all - dropping a future
//! terminates the operation silently.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CgroupError>;

/// Errors surfaced by cgroup primitives and the isolation engine.
#[derive(Debug, Error)]
pub enum CgroupError {
    /// A required precondition does not hold (e.g. hierarchy not mounted).
    #[error("{0}")]
    Precondition(String),

    /// A kernel call failed with an errno.
    #[error("failed to {what}: {source}")]
    Io {
        /// What the library was doing, including the path involved.
        what: String,
        #[source]
        source: io::Error,
    },

    /// Content read from `/proc` or a control file could not be parsed.
    #[error("{0}")]
    Parse(String),

    /// A should-not-happen plumbing failure.
    #[error("{0}")]
    Internal(String),
}

impl CgroupError {
    /// Shorthand for building an [`CgroupError::Io`] variant.
    pub(crate) fn io(what: impl Into<String>, source: io::Error) -> Self {
        CgroupError::Io {
            what: what.into(),
            source,
        }
    }

    /// True if this error is an EBUSY from the kernel.
    ///
    /// The memory controller returns EBUSY when asked to shrink a limit below
    /// the cgroup's current RSS; callers report this without failing the
    /// executor.
    pub fn is_busy(&self) -> bool {
        match self {
            CgroupError::Io { source, .. } => source.raw_os_error() == Some(libc::EBUSY),
            _ => false,
        }
    }
}
