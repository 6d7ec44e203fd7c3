//! Error types for pg-pubsub

use thiserror::Error;

/// Result type for pg-pubsub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors that can occur while listening, subscribing or publishing
#[derive(Error, Debug)]
pub enum PubSubError {
    /// The dedicated listener connection could not be acquired
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(#[source] sqlx::Error),

    /// Malformed payload handed to publish or received from the transport
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Encoded payload does not fit in a single notification
    #[error("Payload of {size} bytes exceeds the {limit} byte notification limit")]
    OversizedPayload { size: usize, limit: usize },

    /// Insert, update or delete of a listener registry row failed
    #[error("Listener registry {operation} failed: {source}")]
    RegistryWrite {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Configuration sources could not be read or merged
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// The physical listener connection went away under a live subscription
    #[error("Listener connection {listener_id} was lost")]
    ConnectionLost { listener_id: i32 },
}

impl PubSubError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Wrap a failed registry statement
    pub fn registry_write(operation: &'static str, source: sqlx::Error) -> Self {
        Self::RegistryWrite { operation, source }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_)
                | Self::Database(_)
                | Self::RegistryWrite { .. }
                | Self::ConnectionLost { .. }
        )
    }
}
