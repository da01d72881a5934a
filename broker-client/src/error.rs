//! Error types for the broker-client crate.

use crate::types::{ChannelId, ConsumerTag};

/// Errors raised by a broker connection, its channels, or the resources declared on them.
///
/// The type is `Clone` so a single failure can be observed by every task waiting
/// on the same broker operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The connection has not been established (or was closed)
    #[error("Connection is not established")]
    NotConnected,

    /// The connection failed after it was established
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The channel was closed and can no longer be used
    #[error("Channel {0} is closed")]
    ChannelClosed(ChannelId),

    /// Publishing or binding referenced an exchange that was never declared
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consuming referenced a queue that does not exist
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Cancelling referenced an unknown consumer tag
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerTag),

    /// A resource was redeclared with different properties
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// An exclusive queue is owned by another channel
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    /// The operation is not supported by this transport
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The connection URI could not be parsed
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),

    /// The connection URI uses a scheme no transport is registered for
    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    /// A failure injected through the in-process broker's fault hooks
    #[error("Injected failure during {operation}: {reason}")]
    Injected {
        /// The operation that was failed
        operation: String,
        /// Reason supplied by the test
        reason: String,
    },
}

/// Convenience type alias for Results using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let error = ClientError::NotConnected;
        assert_eq!(error.to_string(), "Connection is not established");

        let error = ClientError::ChannelClosed(ChannelId::new(7));
        assert_eq!(error.to_string(), "Channel ch-7 is closed");

        let error = ClientError::ExchangeNotFound("events".to_string());
        assert_eq!(error.to_string(), "Exchange not found: events");

        let error = ClientError::Injected {
            operation: "declare_queue".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Injected failure during declare_queue: boom"
        );
    }

    #[test]
    fn test_client_error_is_clone_and_comparable() {
        let error = ClientError::ResourceLocked("q1".to_string());
        assert_eq!(error.clone(), error);
    }
}
