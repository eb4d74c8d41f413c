use thiserror::Error;

/// Errors surfaced by pipeline components.
///
/// Only transient infrastructure failures are retried by the consumer
/// runtime. Data problems, business rejections and idempotency collisions
/// are reported through [`crate::stages::Outcome`] instead of this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Relational store unreachable or a statement failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Migration failure at startup.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stream log (Redis) failure.
    #[error("stream error: {0}")]
    Stream(#[from] redis::RedisError),

    /// Broker API failure. `transient` marks timeouts, 429s and 5xx.
    #[error("broker error: {message}")]
    Broker { message: String, transient: bool },

    /// Stream entry could not be decoded into the expected event.
    #[error("malformed payload: {0}")]
    Payload(String),

    /// Missing or unusable input data (history too short, unknown order).
    #[error("data error: {0}")]
    Data(String),

    /// Invalid configuration or parameter override.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection attempt exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A concurrent writer changed the row this update was computed from.
    #[error("write conflict: {0}")]
    Conflict(String),
}

impl PipelineError {
    pub fn broker_transient(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            transient: true,
        }
    }

    pub fn broker_rejected(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the consumer runtime should retry the entry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) | Self::Stream(_) | Self::Timeout(_) | Self::Conflict(_) => true,
            Self::Broker { transient, .. } => *transient,
            Self::Migration(_)
            | Self::Payload(_)
            | Self::Data(_)
            | Self::Config(_)
            | Self::Serialization(_) => false,
        }
    }
}

impl From<::config::ConfigError> for PipelineError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::broker_transient("503").is_retryable());
        assert!(PipelineError::Timeout("redis".into()).is_retryable());
        assert!(PipelineError::Conflict("ledger moved".into()).is_retryable());
        assert!(!PipelineError::broker_rejected("insufficient buying power").is_retryable());
        assert!(!PipelineError::Payload("missing field".into()).is_retryable());
        assert!(!PipelineError::Data("no bars".into()).is_retryable());
    }
}
