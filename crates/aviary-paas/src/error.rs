//! Error types for aviary-paas.

/// Result type alias using [`PaasError`].
pub type PaasResult<T> = Result<T, PaasError>;

/// Errors returned by the PaaS API client.
#[derive(Debug, thiserror::Error)]
pub enum PaasError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API rejected the request.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code returned by the platform.
        status: u16,
        /// Error message from the response body, if any.
        message: String,
    },

    /// The credential was rejected by the platform.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The named application does not exist on the platform.
    #[error("application not found: {0}")]
    AppNotFound(String),
}

impl PaasError {
    /// Create an API error from a status code and message.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }
}
