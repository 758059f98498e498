use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// loamdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The write could not proceed right now and should be retried by the
    /// caller. Raised instead of sleeping when throttling has no budget.
    Busy,
    /// A snapshot-isolated update lost to a newer committed write. The
    /// operation must be retried under a fresh snapshot.
    Conflict,
    /// The configuration was rejected at open.
    Config(String),
    /// On-disk state failed validation: bad magic, checksum mismatch, or a
    /// missing file for a chunk that must exist.
    Corruption(String),
    /// An IO error.
    Io(String),
    /// The requested key does not exist (or is deleted).
    NotFound,
    /// A write was attempted on a sealed chunk or a merge cursor.
    ReadOnly,
    /// The tree or manager is shutting down; the operation was abandoned.
    Shutdown,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Busy => write!(f, "busy, retry the operation"),
            Error::Conflict => write!(f, "write conflict, retry under a new snapshot"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption detected: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotFound => write!(f, "not found"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Shutdown => write!(f, "shutting down"),
        }
    }
}

/// A loamdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
