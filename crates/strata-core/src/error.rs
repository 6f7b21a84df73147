//! Error types and result aliases for strata.
//!
//! Errors follow the pipeline's failure taxonomy: transient I/O, corrupt
//! columnar files, and races with concurrent writers are distinct variants so
//! callers can decide whether to skip, quarantine, or retry.

use std::path::{Path, PathBuf};

/// The result type used throughout strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in strata operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A filesystem operation failed.
    #[error("io error: {message}")]
    Io {
        /// Description of the failed operation.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Encoding or decoding a Parquet artifact failed.
    #[error("parquet error: {message}")]
    Parquet {
        /// Description of the Parquet failure.
        message: String,
    },

    /// A columnar file could not be read and should be quarantined.
    #[error("corrupt file {path}: {message}")]
    Corrupt {
        /// The unreadable file.
        path: PathBuf,
        /// Reader error.
        message: String,
    },

    /// A JSON document could not be serialized or deserialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A concurrent writer was detected under a directory being deleted.
    #[error("write in progress under {path}")]
    WriteInProgress {
        /// The directory that was restored.
        path: PathBuf,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new I/O error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new I/O error with a source cause.
    #[must_use]
    pub fn io_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an I/O error describing `op` on `path`.
    #[must_use]
    pub fn io_at(op: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io_with_source(format!("{op} {}", path.display()), source)
    }

    /// Creates a corruption error for `path`.
    #[must_use]
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error denotes an unreadable columnar file.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_at_keeps_source() {
        let err = Error::io_at(
            "reading",
            Path::new("/tmp/x"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/x"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn corrupt_is_classified() {
        assert!(Error::corrupt("/a.parquet", "bad magic").is_corrupt());
        assert!(!Error::io("x").is_corrupt());
    }
}
