#![forbid(unsafe_code)]
//! Error types for the SegFS item layer.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the VFS response path above the item API.

use thiserror::Error;

/// Unified error type for item-layer operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An allocation failed in a collaborator (manifest reader or segment
    /// writer). The cache itself never raises this.
    #[error("out of memory")]
    OutOfMemory,

    #[error("not found")]
    NotFound,

    #[error("item exists")]
    Exists,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A caller-supplied buffer was too small to hold a key. Reserved for
    /// callers that copy keys into fixed buffers.
    #[error("buffer too small")]
    BufferTooSmall,
}

impl SfsError {
    /// Convert this error into a POSIX errno suitable for VFS replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::Invalid(_) => libc::EINVAL,
            Self::Corruption(_) => libc::EIO,
            Self::BufferTooSmall => libc::ENOBUFS,
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
