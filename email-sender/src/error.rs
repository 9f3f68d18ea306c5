//! Error types shared across the service.
//!
//! Broker failures are connectivity errors unless they are `Cancelled`, which
//! is the expected outcome of a shutdown and is never logged as an error.

use thiserror::Error;

/// Errors raised while talking to RabbitMQ.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to set QoS: {0}")]
    Qos(#[source] lapin::Error),

    #[error("failed to publish message: {0}")]
    Publish(#[source] lapin::Error),

    #[error("failed to start consumer: {0}")]
    Consume(#[source] lapin::Error),

    #[error("failed to close connection: {0}")]
    Close(#[source] lapin::Error),

    #[error("consumer stream closed by broker")]
    ConsumerClosed,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Whether this error only reports that the caller asked us to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BrokerError::Cancelled)
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Errors raised by the SMTP collaborator.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(BrokerError::Cancelled.is_cancelled());
        assert!(!BrokerError::ConsumerClosed.is_cancelled());
    }

    #[test]
    fn test_config_error_names_key() {
        let err = ConfigError::Missing("EMAIL_HOST".to_string());
        assert_eq!(err.to_string(), "missing required setting EMAIL_HOST");
    }
}
