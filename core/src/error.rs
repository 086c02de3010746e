//! Typed error taxonomy for the session core. Every fallible operation returns
//! one of these variants instead of a string or a boxed `dyn Error`; the
//! connection adapter is the only layer allowed to turn one into prose for a
//! client-facing closure reason.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session id {id:?} is not a valid identifier")]
    InvalidId { id: String },

    #[error("session {id} not found")]
    NotFound { id: String },

    #[error("session {id} already exists")]
    AlreadyExists { id: String },

    #[error("session {id} already has an attached connection")]
    AttachConflict { id: String },

    #[error("state file {path:?} is corrupted: {reason}")]
    CorruptedState { path: PathBuf, reason: String },

    #[error("permission denied accessing {path:?}")]
    PermissionDenied { path: PathBuf },

    #[error("disk full while writing {path:?}")]
    DiskFull { path: PathBuf },

    #[error("out of memory allocating {context}")]
    MemoryExhausted { context: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Build an I/O error, classifying the underlying `std::io::ErrorKind`
    /// into the more specific taxonomy members where the OS tells us enough
    /// to do so (permission denied, disk full); anything else falls back to
    /// the generic `Io` variant with the path attached for diagnostics.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => SessionError::PermissionDenied { path },
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                SessionError::DiskFull { path }
            }
            _ => SessionError::Io { path, source },
        }
    }
}
