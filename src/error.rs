//! # Error Kinds
//!
//! Errors propagate as `eyre::Report` throughout the crate. Most are plain
//! contextual reports, but two situations need to be distinguishable by
//! callers without string matching:
//!
//! - **Invalid data**: the file is not a database, or its entire trailer
//!   chain is unrecoverable. Opening should fail loudly and the caller may
//!   want to treat this differently from a transient I/O problem.
//! - **Internal errors**: invariant violations that indicate a bug rather
//!   than a bad file.
//!
//! Syscall failures (seek, truncate, write) are wrapped `std::io::Error`
//! values and can be downcast to that type directly.
//!
//! ```ignore
//! match db_result {
//!     Err(e) if matches!(e.downcast_ref(), Some(StoreError::InvalidData(_))) => {
//!         // corrupt or foreign file
//!     }
//!     ...
//! }
//! ```
//!
//! Recoverable anomalies (a torn tail trailer, a non-aligned file size, a
//! failed fsync) are *not* errors; they are reported through
//! `tracing::warn!` and the operation continues.

use std::fmt;

/// A typed error raised through `eyre::Report` so callers can downcast to
/// distinguish data corruption from I/O failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The file is not a database file or is damaged beyond recovery.
    InvalidData(String),
    /// An internal invariant was violated.
    Internal(String),
}

impl StoreError {
    /// Builds an `InvalidData` report.
    pub fn invalid_data(message: impl Into<String>) -> eyre::Report {
        eyre::Report::new(StoreError::InvalidData(message.into()))
    }

    /// Builds an `Internal` report.
    pub fn internal(message: impl Into<String>) -> eyre::Report {
        eyre::Report::new(StoreError::Internal(message.into()))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidData(msg) => write!(f, "{}", msg),
            StoreError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_data_is_downcastable() {
        let report = StoreError::invalid_data("Not a DB file (too small)");
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(err, StoreError::InvalidData(_)));
        assert_eq!(report.to_string(), "Not a DB file (too small)");
    }

    #[test]
    fn internal_errors_are_prefixed() {
        let report = StoreError::internal("count drifted");
        assert_eq!(report.to_string(), "internal error: count drifted");
    }
}
