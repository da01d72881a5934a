//! # broker-client
//!
//! The broker collaborator contract used by `broker-emitter`.
//!
//! This crate describes what the emitter needs from a message broker without
//! tying it to a wire protocol:
//!
//! - [`Connection`] and [`Channel`]: the transport contract (connect, mint
//!   channels, declare, publish, consume, cancel, close)
//! - [`Exchange`], [`Queue`], [`Producer`], [`Consumer`]: declarative resource
//!   descriptors composed on top of a channel
//! - [`topic`]: routing-key matching with `*` and `#` wildcards
//! - [`memory`]: an in-process topic broker implementing the contract, used for
//!   `memory://` URIs and as the test transport
//!
//! # Example
//!
//! ```rust,no_run
//! use broker_client::{Connection, Exchange, MemoryBroker, MemoryConnection, Producer, PublishOptions};
//!
//! # async fn run() -> broker_client::Result<()> {
//! let connection = MemoryConnection::new(MemoryBroker::new());
//! connection.connect().await?;
//!
//! let producer = Producer::new(connection.channel(), Exchange::topic("events"), None);
//! producer.declare().await?;
//! producer
//!     .route(PublishOptions::new().with_routing_key("orders.created"))
//!     .publish("payload")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod memory;
pub mod resources;
pub mod topic;
pub mod types;

pub use connection::{open, Channel, Connection};
pub use error::{ClientError, Result};
pub use memory::{BrokerStats, MemoryBroker, MemoryChannel, MemoryConnection, Operation};
pub use resources::{Consumer, Exchange, Producer, Queue, Route};
pub use types::{
    ChannelId, ConsumerTag, ExchangeType, Headers, Message, MessageHandler, OutboundMessage,
    PublishOptions,
};
