use thiserror::Error;

/// Errors from the acquisition and hydration engines
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Client(#[from] fhirpull_client::ClientError),

    #[error(transparent)]
    Store(#[from] fhirpull_store::StoreError),

    #[error(transparent)]
    Core(#[from] fhirpull_core::CoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bulk export failed: {0}")]
    BulkFailed(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn bulk_failed(message: impl Into<String>) -> Self {
        Self::BulkFailed(message.into())
    }

    /// Whether this error should map to the "unrecoverable server error"
    /// exit code rather than the configuration one.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Client(_) | Self::BulkFailed(_)
        )
    }
}

/// Convenience result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
