//! Content-scanner collaborator: turns a directory tree into sorted
//! [`ScannedFile`](sift_protocol::ScannedFile) batches.
//!
//! Hidden files, gitignored paths, the `.sift` state directory and any
//! excluded output root are skipped.

mod error;
mod scanner;

pub use error::{Result, ScannerError};
pub use scanner::{
    into_batches, FileScanner, ScanOptions, ScanSummary, DEFAULT_MAX_FILE_SIZE_BYTES,
};
