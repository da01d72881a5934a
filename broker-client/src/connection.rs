//! Connection and channel contracts.
//!
//! A [`Connection`] owns the transport to the broker and mints logical
//! [`Channel`]s. Every broker operation (declare, publish, consume, cancel)
//! happens on a channel. Implementations must be `Send + Sync` so the emitter
//! can drive them from spawned tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{ClientError, Result};
use crate::memory::{MemoryBroker, MemoryConnection};
use crate::resources::{Exchange, Queue};
use crate::types::{ChannelId, ConsumerTag, MessageHandler, OutboundMessage};

/// URI scheme served by the in-process broker
pub const MEMORY_SCHEME: &str = "memory";

/// A connection to a message broker.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the transport connection.
    async fn connect(&self) -> Result<()>;

    /// Create a new logical channel on this connection.
    ///
    /// Creation is synchronous; the channel becomes usable once the connection is
    /// established.
    fn channel(&self) -> Arc<dyn Channel>;

    /// Subscribe to connection-level failures that happen after `connect()`.
    fn errors(&self) -> broadcast::Receiver<ClientError>;

    /// Whether the connection is currently established.
    fn is_connected(&self) -> bool;

    /// Close the connection and every channel created on it.
    async fn close(&self) -> Result<()>;
}

/// A lightweight session multiplexed over a [`Connection`].
#[async_trait]
pub trait Channel: Send + Sync {
    /// Identifier of this channel.
    fn id(&self) -> ChannelId;

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;

    /// Declare an exchange. Redeclaring with identical properties is a no-op.
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<()>;

    /// Declare a queue and bind it to its exchange with its routing key.
    async fn declare_queue(&self, queue: &Queue) -> Result<()>;

    /// Publish a message to an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage)
        -> Result<()>;

    /// Start consuming from a queue, invoking `handler` for each delivery.
    async fn consume(&self, queue: &str, no_ack: bool, handler: MessageHandler)
        -> Result<ConsumerTag>;

    /// Stop a consumer started on this channel.
    async fn cancel(&self, tag: &ConsumerTag) -> Result<()>;

    /// Close the channel, stopping its consumers.
    async fn close(&self) -> Result<()>;
}

/// Open a connection for a broker URI.
///
/// `memory://<name>` resolves to the process-wide in-process broker registered
/// under `<name>` (`default` when the host is empty). Other schemes need a
/// transport supplied through a custom [`Connection`] implementation.
pub fn open(uri: &str) -> Result<Arc<dyn Connection>> {
    let parsed = url::Url::parse(uri).map_err(|e| ClientError::InvalidUri(format!("{}: {}", uri, e)))?;

    match parsed.scheme() {
        MEMORY_SCHEME => {
            let name = parsed.host_str().filter(|h| !h.is_empty()).unwrap_or("default");
            tracing::debug!("Opening in-process broker connection '{}'", name);
            Ok(Arc::new(MemoryConnection::new(MemoryBroker::named(name))))
        }
        other => Err(ClientError::UnsupportedScheme(other.to_string())),
    }
}
