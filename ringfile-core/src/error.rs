//! Error types shared by the ring, the providers and the executors.

use nix::errno::Errno;
use std::fmt;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One of the three quantities direct I/O requires to be 512-byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentParam {
    /// The file offset of the read.
    Offset,

    /// The memory address the read lands at.
    BufferAddress,

    /// The number of bytes read.
    BufferLength,
}

impl fmt::Display for AlignmentParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset => write!(f, "offset"),
            Self::BufferAddress => write!(f, "the buffer starting address"),
            Self::BufferLength => write!(f, "the buffer length"),
        }
    }
}

/// Errors returned by rings, providers, executors and file readers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The ring configuration is invalid.
    #[error("invalid ring configuration: {0}")]
    Config(String),

    /// A submission was built with invalid arguments.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// A direct I/O read violates the 512-byte alignment rules.
    #[error("{0} must be aligned on 512 bytes for direct I/O")]
    Misaligned(AlignmentParam),

    /// An operation completed with a negated errno.
    #[error("{op} failed: {}", Errno::from_i32(*.errno))]
    Io {
        /// The operation that failed ("read", "open", ...).
        op: &'static str,
        /// The positive errno value.
        errno: i32,
        /// The file involved, when known.
        path: Option<PathBuf>,
    },

    /// No native I/O provider could be loaded in this process.
    #[error("native I/O provider unavailable: {0}")]
    Unavailable(String),

    /// The ring was used after being closed.
    #[error("ring is closed")]
    RingClosed,

    /// The executor was used after being closed, or stopped before a
    /// submission could complete.
    #[error("I/O executor has been closed")]
    ExecutorClosed,

    /// An unexpected condition that is not worth retrying.
    #[error("fatal I/O error: {0}")]
    Fatal(String),

    /// An operating system error outside of ring completions.
    #[error(transparent)]
    Os(#[from] std::io::Error),
}

impl Error {
    /// Builds an [`Error::Io`] from a positive errno value.
    pub fn io(op: &'static str, errno: i32) -> Self {
        Self::Io {
            op,
            errno,
            path: None,
        }
    }

    /// Builds an [`Error::Io`] that mentions the file it concerns.
    pub fn io_at(op: &'static str, errno: i32, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            op,
            errno,
            path: Some(path.into()),
        }
    }

    /// The errno carried by an I/O failure, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io { errno, .. } => Some(*errno),
            Self::Os(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error is one of the "not 512-byte aligned" diagnostics.
    pub fn is_misaligned(&self) -> bool {
        matches!(self, Self::Misaligned(_))
    }
}

/// Errno values that describe a problem with the file rather than with the
/// way the ring is being driven.
pub(crate) fn is_file_errno(errno: i32) -> bool {
    matches!(
        errno,
        libc::EIO
            | libc::ENOENT
            | libc::EACCES
            | libc::EPERM
            | libc::EISDIR
            | libc::ENOTDIR
            | libc::ENAMETOOLONG
            | libc::ELOOP
            | libc::EROFS
            | libc::EMFILE
            | libc::ENFILE
            | libc::ENOSPC
            | libc::EINVAL
            | libc::ENXIO
            | libc::ENODEV
    )
}
