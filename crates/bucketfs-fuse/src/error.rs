use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("No such entry: {path}")]
    NotFound { path: String },

    #[error("Access denied: {msg}")]
    AccessDenied { msg: String },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Remote store busy: {msg}")]
    Busy { msg: String },

    #[error("I/O error: {msg}")]
    Io { msg: String },

    #[error("Out of buffer memory")]
    OutOfMemory,

    #[error("Operation not supported: {op}")]
    NotSupported { op: String },

    #[error("Bad file handle: {fh}")]
    BadHandle { fh: u64 },

    #[error("Not a directory: {path}")]
    NotDirectory { path: String },

    #[error("Is a directory: {path}")]
    IsDirectory { path: String },
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NotFound { .. } => ENOENT,
            FsError::AccessDenied { .. } => EACCES,
            FsError::InvalidArgument { .. } => EINVAL,
            FsError::Busy { .. } => EAGAIN,
            FsError::Io { .. } => EIO,
            FsError::OutOfMemory => ENOMEM,
            FsError::NotSupported { .. } => ENOSYS,
            FsError::BadHandle { .. } => EBADF,
            FsError::NotDirectory { .. } => ENOTDIR,
            FsError::IsDirectory { .. } => EISDIR,
        }
    }

    pub fn not_supported(op: &str) -> Self {
        FsError::NotSupported { op: op.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }

    /// Transient failures the kernel is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Busy { .. } | FsError::Io { .. })
    }

    // When several racing probes fail, a not-found is the least informative
    // answer: anything else says the probe could not be answered at all.
    fn relevance(&self) -> u8 {
        match self {
            FsError::NotFound { .. } => 0,
            FsError::Busy { .. } | FsError::Io { .. } => 1,
            _ => 2,
        }
    }

    /// Picks the error worth reporting out of two failed attempts.
    pub fn most_relevant(self, other: FsError) -> FsError {
        if other.relevance() > self.relevance() {
            other
        } else {
            self
        }
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { key } => FsError::NotFound { path: key },
            StoreError::AccessDenied { msg } => FsError::AccessDenied { msg },
            StoreError::InvalidRequest { msg } => FsError::InvalidArgument { msg },
            StoreError::RateLimited { msg } => FsError::Busy { msg },
            StoreError::Transport { msg } => FsError::Io { msg },
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::from(StoreError::from(e))
    }
}
