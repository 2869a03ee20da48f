//! Error types for aviary-control.

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The user's coin balance does not cover the requested charge.
    #[error("insufficient balance: {needed} coins needed")]
    InsufficientBalance {
        /// Coins required for the operation.
        needed: i64,
    },

    /// The bot has not been approved for deployment.
    #[error("bot not approved: {0}")]
    BotNotApproved(String),

    /// No deployment account is available in the pool.
    #[error("no deployment capacity available")]
    NoCapacityAvailable,

    /// External PaaS API error.
    #[error("deployment platform error: {0}")]
    Paas(String),

    /// Transactional email API error.
    #[error("mailer error: {0}")]
    Mailer(String),

    /// User not found.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Bot not found.
    #[error("bot not found: {0}")]
    BotNotFound(String),

    /// Deployment not found, or not owned by the caller.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Account not found.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// Malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// The daily claim cooldown has not elapsed.
    #[error("daily claim not available yet, try again in {remaining_minutes} minute(s)")]
    DailyCooldown {
        /// Minutes until the next claim becomes available.
        remaining_minutes: i64,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a PaaS error.
    #[must_use]
    pub fn paas(msg: impl Into<String>) -> Self {
        Self::Paas(msg.into())
    }

    /// Create a mailer error.
    #[must_use]
    pub fn mailer(msg: impl Into<String>) -> Self {
        Self::Mailer(msg.into())
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
