use thiserror::Error;

/// Result type for governance operations
pub type Result<T> = std::result::Result<T, GovernanceError>;

/// Errors that can occur inside the governance layer.
///
/// None of these reach an HTTP client: the limiter and cache layers absorb
/// them and degrade. The only user-visible outcome is a rate limit rejection,
/// see [`crate::middleware::RateLimitRejection`].
#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("Cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid client identity: {0}")]
    InvalidClientIdentity(String),

    #[error("Unknown domain table: {0}")]
    UnknownDomainTable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernanceError {
    /// Whether the error means the networked backend could not be reached.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GovernanceError::BackendUnavailable(_) | GovernanceError::Redis(_)
        )
    }
}

impl From<config::ConfigError> for GovernanceError {
    fn from(err: config::ConfigError) -> Self {
        GovernanceError::Config(err.to_string())
    }
}
