//! Definitions of errors that the delta engine can encounter

use std::str::Utf8Error;

use strum::AsRefStr;

use crate::Version;

/// A [`std::result::Result`] that has the engine [`Error`] as the error variant
pub type DeltaResult<T, E = Error> = std::result::Result<T, E>;

/// Subcode attached to [`Error::ChangeDataCapture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CdcErrorKind {
    /// The requested version range is empty, reversed, or beyond the table head
    InvalidVersionRange,
    /// The requested timestamp range is reversed or matches no commit
    InvalidTimeRange,
    /// The table root has no `_delta_log`
    TableNotFound,
    /// `delta.enableChangeDataFeed` is not set on the table
    CdcNotEnabled,
    /// Underlying storage failed while reading change data
    StorageError,
    /// A change-data file could not be decoded
    ParseError,
    /// A write produced zero rows of change data where some were required
    EmptyWrite,
}

/// All the types of errors the engine can run into.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error surfaced by the underlying object store.
    #[error("Storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// A storage failure that did not originate in the object_store crate
    /// (timeouts, size mismatches, corrupt payloads).
    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    /// A path that should exist does not.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// A conditional write observed a different version than the caller expected.
    #[error("Version mismatch for {path}: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        path: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// A commit lost the race for its log version and the conflict could not be
    /// resolved by rebasing.
    #[error("Concurrent commit conflict: expected version {expected}, actual {actual}")]
    Concurrency { expected: Version, actual: Version },

    /// Change-data-capture failures, qualified by a [`CdcErrorKind`] subcode.
    #[error("Change data capture error ({kind}): {message}")]
    ChangeDataCapture { kind: CdcErrorKind, message: String },

    /// Actions, schemas, rows, or partition values that fail validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// S3-specific configuration or credential failures.
    #[error("S3 error: {0}")]
    S3(String),

    /// An error performing operations on parquet data
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// An error performing operations on arrow data
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// An error encoding or decoding JSON
    #[error("Json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line in the log contained an action we do not recognize
    #[error("Unrecognized log action: {0}")]
    UnrecognizedAction(String),

    /// An invalid URL was provided
    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The storage scheme of a table root is not supported by this build
    #[error("Unsupported storage scheme: {0}")]
    UnsupportedScheme(String),

    /// Data in the log or a deletion vector failed a structural check
    #[error("Invalid deletion vector: {0}")]
    InvalidDeletionVector(String),

    /// Non-utf8 bytes where text was required
    #[error("Invalid utf8: {0}")]
    Utf8(#[from] Utf8Error),

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// A catch-all for errors with no dedicated variant
    #[error("Generic delta engine error: {0}")]
    Generic(String),
}

impl Error {
    pub fn generic(msg: impl ToString) -> Self {
        Self::Generic(msg.to_string())
    }

    pub fn validation(msg: impl ToString) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn storage(msg: impl ToString, retryable: bool) -> Self {
        Self::Storage {
            message: msg.to_string(),
            retryable,
        }
    }

    pub fn file_not_found(path: impl ToString) -> Self {
        Self::FileNotFound(path.to_string())
    }

    pub fn cdc(kind: CdcErrorKind, msg: impl ToString) -> Self {
        Self::ChangeDataCapture {
            kind,
            message: msg.to_string(),
        }
    }

    pub fn invalid_deletion_vector(msg: impl ToString) -> Self {
        Self::InvalidDeletionVector(msg.to_string())
    }

    /// Whether a failed operation may be re-attempted as-is. The retry wrapper
    /// in [`crate::retry`] also re-attempts [`Error::Concurrency`] since the
    /// commit protocol resolves those conflicts by rebasing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ObjectStore(err) => !matches!(err, object_store::Error::NotFound { .. }),
            Self::Storage { retryable, .. } => *retryable,
            Self::Concurrency { .. } => true,
            Self::ChangeDataCapture { kind, .. } => matches!(kind, CdcErrorKind::StorageError),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::storage("socket reset", true).is_retryable());
        assert!(!Error::storage("checksum mismatch", false).is_retryable());
        assert!(Error::Concurrency {
            expected: 3,
            actual: 5
        }
        .is_retryable());
        assert!(!Error::validation("bad partition value").is_retryable());
        assert!(!Error::FileNotFound("part-0.parquet".into()).is_retryable());
        assert!(Error::cdc(CdcErrorKind::StorageError, "flaky read").is_retryable());
        assert!(!Error::cdc(CdcErrorKind::InvalidVersionRange, "2..1").is_retryable());
    }

    #[test]
    fn cdc_subcode_rendering() {
        let err = Error::cdc(CdcErrorKind::CdcNotEnabled, "enable delta.enableChangeDataFeed");
        assert!(err.to_string().contains("cdc-not-enabled"));
    }
}
