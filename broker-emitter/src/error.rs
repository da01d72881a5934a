use broker_client::ClientError;
use thiserror::Error;

/// Errors that can occur in the broker emitter
///
/// Cloneable so that one subscription setup failure can be reported to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmitterError {
    /// Invalid or missing configuration, detected at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation that needs the broker ran before `connect()` succeeded
    #[error("Emitter is not connected; call connect() first")]
    NotConnected,

    /// Establishing the broker connection failed
    #[error("Failed to connect to broker: {0}")]
    Connection(#[source] ClientError),

    /// Declaring a broker resource failed
    #[error("Failed to declare {resource}: {source}")]
    Declare {
        resource: String,
        #[source]
        source: ClientError,
    },

    /// Publishing a message failed
    #[error("Failed to publish with routing key {routing_key}: {source}")]
    Publish {
        routing_key: String,
        #[source]
        source: ClientError,
    },

    /// Setting up the broker subscription for an event failed
    #[error("Failed to subscribe to event {event}: {source}")]
    Subscribe {
        event: String,
        #[source]
        source: ClientError,
    },

    /// Tearing down the broker subscription for an event failed
    #[error("Failed to tear down subscription for event {event}: {source}")]
    Teardown {
        event: String,
        #[source]
        source: ClientError,
    },

    /// A local listener panicked while handling a message
    #[error("Listener for event {event} panicked: {message}")]
    ListenerPanicked { event: String, message: String },

    /// The payload could not be serialized
    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    /// Background work was requested outside a Tokio runtime
    #[error("No Tokio runtime available to run subscription work")]
    NoRuntime,

    /// A background subscription task was cancelled or panicked
    #[error("Subscription task failed: {0}")]
    TaskFailed(String),
}

/// Result type for emitter operations
pub type Result<T> = std::result::Result<T, EmitterError>;
