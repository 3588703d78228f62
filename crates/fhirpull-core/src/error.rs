use thiserror::Error;

/// Core error types shared across the fhirpull crates
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid FHIR resource type: {0}")]
    InvalidResourceType(String),

    #[error("Invalid FHIR instant: {0}")]
    InvalidInstant(String),

    #[error("Resource is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),
}

impl CoreError {
    /// Create a new InvalidResourceType error
    pub fn invalid_resource_type(resource_type: impl Into<String>) -> Self {
        Self::InvalidResourceType(resource_type.into())
    }

    /// Create a new InvalidInstant error
    pub fn invalid_instant(instant: impl Into<String>) -> Self {
        Self::InvalidInstant(instant.into())
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::invalid_resource_type("bogus");
        assert_eq!(err.to_string(), "Invalid FHIR resource type: bogus");
    }

    #[test]
    fn test_missing_field_error() {
        let err = CoreError::MissingField("resourceType");
        assert_eq!(
            err.to_string(),
            "Resource is missing required field 'resourceType'"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let core_err: CoreError = json_err.into();
        assert!(matches!(core_err, CoreError::JsonError(_)));
    }
}
