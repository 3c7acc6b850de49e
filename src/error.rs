use thiserror::Error;

/// Main error type for the funding tracker
#[derive(Error, Debug)]
pub enum FundwatchError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Instrument forbidden: {0}")]
    Forbidden(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Pipeline errors
    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Verification query failed: {0}")]
    VerificationInfra(String),

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FundwatchError {
    /// Failures worth retrying on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FundwatchError::Network(_) | FundwatchError::RateLimited(_) | FundwatchError::Http(_)
        )
    }

    /// The instrument should be excluded from all future requests.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FundwatchError::Forbidden(_))
    }
}

/// Result type alias for FundwatchError
pub type Result<T> = std::result::Result<T, FundwatchError>;
