use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrganizerError>;

#[derive(Error, Debug)]
pub enum OrganizerError {
    #[error("Undo is not enabled for the last run")]
    UndoNotEnabled,

    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Nothing to redo")]
    NothingToRedo,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Output root is busy: {0}")]
    Busy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Taxonomy error: {0}")]
    Taxonomy(#[from] sift_taxonomy::TaxonomyError),

    #[error("{0}")]
    Other(String),
}

/// Structured kind of a per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PermissionDenied,
    NotFound,
    DiskFull,
    AlreadyExists,
    Timeout,
    Cancelled,
    Other,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::DiskFull => "disk_full",
            Self::AlreadyExists => "already_exists",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        if is_disk_full(err) {
            return Self::DiskFull;
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Other,
        }
    }
}

/// One file operation that did not complete. The batch carries on past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: FailureKind,
    pub reason: String,
    pub retryable: bool,
}

impl OperationFailure {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind,
            reason: reason.into(),
            retryable: matches!(kind, FailureKind::Timeout),
        }
    }

    pub fn from_io(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        context: &str,
        err: &io::Error,
    ) -> Self {
        let kind = FailureKind::from_io(err);
        let mut failure = Self::new(source, destination, kind, format!("{context}: {err}"));
        failure.retryable = kind == FailureKind::Timeout
            || matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            );
        failure
    }
}

#[cfg(unix)]
const ENOSPC: i32 = 28;
#[cfg(windows)]
const ENOSPC: i32 = 112;
#[cfg(not(any(unix, windows)))]
const ENOSPC: i32 = -1;

fn is_disk_full(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENOSPC)
}

#[cfg(unix)]
const EXDEV: i32 = 18;
#[cfg(windows)]
const EXDEV: i32 = 17;
#[cfg(not(any(unix, windows)))]
const EXDEV: i32 = -1;

/// Rename failed because source and destination live on different volumes.
pub(crate) fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(EXDEV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_failure_kinds() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(FailureKind::from_io(&denied), FailureKind::PermissionDenied);
        let gone = io::Error::new(io::ErrorKind::NotFound, "gone");
        let failure = OperationFailure::from_io("/a", "/b", "move", &gone);
        assert_eq!(failure.kind, FailureKind::NotFound);
        assert!(!failure.retryable);
        assert!(failure.reason.starts_with("move: "));
    }

    #[test]
    fn timeouts_are_retryable() {
        let failure = OperationFailure::new("/a", "/b", FailureKind::Timeout, "slow disk");
        assert!(failure.retryable);
        assert_eq!(failure.kind.as_str(), "timeout");
    }
}
