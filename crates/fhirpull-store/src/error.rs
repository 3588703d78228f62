use std::path::PathBuf;

use thiserror::Error;

/// Errors from workspace and NDJSON file handling
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] fhirpull_core::CoreError),

    #[error("Workspace {path} is locked by another process")]
    WorkspaceLocked { path: PathBuf },

    #[error(
        "Sub-export {dir} is in progress with different parameters; \
         finish or remove it, or re-run with matching parameters"
    )]
    InProgressMismatch { dir: PathBuf },

    #[error("Malformed NDJSON at {path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("Invalid workspace layout: {0}")]
    InvalidLayout(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_layout(message: impl Into<String>) -> Self {
        Self::InvalidLayout(message.into())
    }

    /// Parse errors are recoverable: the reader reports them per line and
    /// keeps streaming.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// Convenience result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_is_recoverable() {
        let err = StoreError::Parse {
            path: PathBuf::from("a.ndjson"),
            line: 3,
            message: "bad json".into(),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Malformed NDJSON at a.ndjson:3: bad json");
    }

    #[test]
    fn test_io_error_is_not_recoverable() {
        let err = StoreError::io(
            "w",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_recoverable());
    }
}
