//! Core types shared by connections, channels and resource descriptors.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Message headers, keyed by header name.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Callback invoked by a channel for every message delivered to a consumer.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Identifier of a logical channel on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Create a new ChannelId with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Broker-assigned tag identifying a running consumer.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Create a new consumer tag from a string.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Get the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Routes on exact routing-key equality
    Direct,
    /// Routes every message to every bound queue
    Fanout,
    /// Routes on dot-separated patterns with `*` and `#` wildcards
    #[default]
    Topic,
    /// Routes on header values
    Headers,
}

impl ExchangeType {
    /// The lowercase protocol name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExchangeType {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(ClientError::Unsupported(format!("exchange type '{}'", other))),
        }
    }
}

/// A message as handed to a channel for publishing.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    /// Raw message body
    pub body: Bytes,
    /// Application headers
    pub headers: Headers,
    /// MIME content type of the body, if known
    pub content_type: Option<String>,
    /// Whether the broker should persist the message
    pub persistent: bool,
}

/// A message delivered to a consumer.
///
/// Carries the published body and headers unchanged, plus the envelope fields
/// the broker attaches on delivery.
#[derive(Debug, Clone)]
pub struct Message {
    /// Raw message body
    pub body: Bytes,
    /// Application headers set by the publisher
    pub headers: Headers,
    /// MIME content type of the body, if the publisher set one
    pub content_type: Option<String>,
    /// Whether the message was published as persistent
    pub persistent: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Per-channel delivery sequence number
    pub delivery_tag: u64,
    /// Tag of the consumer that received the message
    pub consumer_tag: ConsumerTag,
}

impl Message {
    /// The body as UTF-8 text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Look up a header value by name.
    pub fn header(&self, name: &str) -> Option<&serde_json::Value> {
        self.headers.get(name)
    }
}

/// Per-publish options passed to [`Producer::route`](crate::Producer::route).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Routing key override; falls back to the producer's routing key
    pub routing_key: Option<String>,
    /// Application headers
    pub headers: Headers,
    /// MIME content type of the body
    pub content_type: Option<String>,
}

impl PublishOptions {
    /// Create empty publish options
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("topic", ExchangeType::Topic)]
    #[case("direct", ExchangeType::Direct)]
    #[case("FANOUT", ExchangeType::Fanout)]
    #[case("headers", ExchangeType::Headers)]
    fn test_exchange_type_parse(#[case] input: &str, #[case] expected: ExchangeType) {
        assert_eq!(input.parse::<ExchangeType>().unwrap(), expected);
        assert_eq!(expected.to_string(), input.to_ascii_lowercase());
    }

    #[test]
    fn test_exchange_type_rejects_unknown() {
        let result = "x-delayed".parse::<ExchangeType>();
        assert!(matches!(result, Err(ClientError::Unsupported(_))));
    }

    #[test]
    fn test_exchange_type_serde_lowercase() {
        let json = serde_json::to_string(&ExchangeType::Topic).unwrap();
        assert_eq!(json, "\"topic\"");
        let parsed: ExchangeType = serde_json::from_str("\"fanout\"").unwrap();
        assert_eq!(parsed, ExchangeType::Fanout);
    }

    #[test]
    fn test_publish_options_builder() {
        let options = PublishOptions::new()
            .with_routing_key("orders.created")
            .with_header("k", "v")
            .with_header("attempt", 2)
            .with_content_type("application/json");

        assert_eq!(options.routing_key.as_deref(), Some("orders.created"));
        assert_eq!(options.headers["k"], serde_json::json!("v"));
        assert_eq!(options.headers["attempt"], serde_json::json!(2));
        assert_eq!(options.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_message_accessors() {
        let mut headers = Headers::new();
        headers.insert("k".to_string(), serde_json::json!("v"));
        let message = Message {
            body: Bytes::from_static(br#"{"id":3}"#),
            headers,
            content_type: None,
            persistent: true,
            exchange: "events".to_string(),
            routing_key: "orders.created".to_string(),
            delivery_tag: 1,
            consumer_tag: ConsumerTag::new("ctag-1"),
        };

        assert_eq!(message.body_str(), Some(r#"{"id":3}"#));
        assert_eq!(message.header("k"), Some(&serde_json::json!("v")));
        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["id"], 3);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ChannelId::new(3).to_string(), "ch-3");
        assert_eq!(ConsumerTag::new("amq.ctag-1").to_string(), "amq.ctag-1");
    }
}
