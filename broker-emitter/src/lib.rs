//! # broker-emitter
//!
//! An event-emitter interface over a topic-exchange message broker.
//!
//! ## Overview
//!
//! Local code listens by event name and emits payloads; the broker carries them
//! between processes. Event names are routing-key patterns, so `orders.#`
//! receives everything emitted under `orders.`.
//!
//! ## Key Features
//!
//! - **Demand-Driven Subscriptions**: a queue, consumer and channel are created
//!   for an event when its first listener is added and released when its last
//!   listener is removed
//! - **Sync Listener API**: `on`, `once` and `remove_listener` return at once;
//!   the returned handles can be awaited for the broker side
//! - **One Subscription Per Event**: concurrent adds and removes never create
//!   duplicate consumers or leak channels
//! - **Isolated Listeners**: a panicking listener is reported, not propagated
//!
//! ## Usage
//!
//! ```rust,no_run
//! use broker_emitter::{Emitter, EmitterConfig, PublishOptions};
//!
//! # async fn run() -> broker_emitter::Result<()> {
//! let emitter = Emitter::new(EmitterConfig::new("events"))?;
//! emitter.connect().await?;
//!
//! let listener = emitter.on("orders.#", |message| {
//!     println!("{}: {:?}", message.routing_key, message.body_str());
//! });
//! let id = listener.await?;
//!
//! emitter.emit("orders.created", "order 42", PublishOptions::new()).await?;
//!
//! emitter.remove_listener("orders.#", id).await?;
//! emitter.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Listener Registry**: event name -> ordered handlers, purely local
//! 2. **Subscription Registry**: event name -> `Pending | Active | TearingDown`
//! 3. **Reconcile Loop**: after every listener change, steps the subscription
//!    entry towards the listener set, waiting on in-flight setup or teardown
//! 4. **Delivery Bridge**: each consumer fans messages out to a snapshot of the
//!    event's listeners

mod bridge;
pub mod completion;
pub mod config;
pub mod emitter;
pub mod error;
pub mod listeners;
pub mod logging;
mod registry;

// Re-export main types for convenience
pub use completion::{Completion, Listener};
pub use config::EmitterConfig;
pub use emitter::{Emitter, JSON_CONTENT_TYPE};
pub use error::{EmitterError, Result};
pub use listeners::{ErrorHandler, Handler, ListenerId};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use registry::SubscriptionStatus;

// Re-export commonly used types from the client crate
pub use broker_client::{ExchangeType, Message, PublishOptions};

/// Convenient imports for applications
pub mod prelude {
    pub use crate::{
        Completion, Emitter, EmitterConfig, EmitterError, ExchangeType, Listener, ListenerId,
        Message, PublishOptions, Result, SubscriptionStatus,
    };
}
