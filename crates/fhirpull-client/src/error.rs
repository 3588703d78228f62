use thiserror::Error;

/// Errors produced by the FHIR client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}{}", diagnostics.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Status {
        status: u16,
        url: String,
        diagnostics: Option<String>,
    },

    #[error("Export expired (HTTP 410) at {url}")]
    ExportExpired { url: String },

    #[error("Request to {url} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Token exchange failed with HTTP {status}: {body}")]
    TokenExchange { status: u16, body: String },

    #[error("Malformed server response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn invalid_response(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            url: url.into(),
            message: message.into(),
        }
    }

    /// True for 404 responses, which hydration treats as a soft miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::TokenExchange { status, .. } => Some(*status),
            Self::ExportExpired { .. } => Some(410),
            _ => None,
        }
    }
}

/// Convenience result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
