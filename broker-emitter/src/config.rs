//! Configuration types for the broker-emitter crate
//!
//! `EmitterConfig` names the exchange the emitter publishes to, how it is typed,
//! how queue names are prefixed, and where the broker lives.

use broker_client::ExchangeType;

use crate::error::{EmitterError, Result};

/// Broker URI used when none is configured
pub const DEFAULT_URI: &str = "memory://default";
/// Prefix for the generated emitter name
pub const DEFAULT_NAME_PREFIX: &str = "broker-emitter-";

pub const ENV_URI: &str = "BROKER_EMITTER_URI";
pub const ENV_EXCHANGE: &str = "BROKER_EMITTER_EXCHANGE";
pub const ENV_EXCHANGE_TYPE: &str = "BROKER_EMITTER_EXCHANGE_TYPE";
pub const ENV_NAME_PREFIX: &str = "BROKER_EMITTER_NAME_PREFIX";
pub const ENV_ROUTING_KEY: &str = "BROKER_EMITTER_ROUTING_KEY";

/// Configuration for an [`Emitter`](crate::Emitter)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterConfig {
    /// Broker URI; ignored when an existing connection is supplied
    /// Default: `memory://default`
    pub uri: Option<String>,

    /// Name of the shared exchange (required)
    pub exchange_name: String,

    /// Type of the shared exchange
    /// Default: topic
    pub exchange_type: ExchangeType,

    /// Prefix of the generated emitter name, which namespaces queue names
    /// Default: "broker-emitter-"
    pub name_prefix: String,

    /// Producer's default routing key, used when neither the event nor the
    /// publish options provide one
    pub routing_key: Option<String>,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            uri: None,
            exchange_name: String::new(),
            exchange_type: ExchangeType::Topic,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            routing_key: None,
        }
    }
}

impl EmitterConfig {
    /// Create a configuration for the given exchange with default values
    pub fn new(exchange_name: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `BROKER_EMITTER_*` environment variables
    ///
    /// Unset variables keep their defaults. The exchange name is still required,
    /// so the result should be validated (construction does this).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(uri) = lookup(ENV_URI) {
            config.uri = Some(uri);
        }
        if let Some(exchange) = lookup(ENV_EXCHANGE) {
            config.exchange_name = exchange;
        }
        if let Some(kind) = lookup(ENV_EXCHANGE_TYPE) {
            config.exchange_type = kind.parse().map_err(|_| {
                EmitterError::Configuration(format!("{} has unknown exchange type '{}'", ENV_EXCHANGE_TYPE, kind))
            })?;
        }
        if let Some(prefix) = lookup(ENV_NAME_PREFIX) {
            config.name_prefix = prefix;
        }
        if let Some(routing_key) = lookup(ENV_ROUTING_KEY) {
            config.routing_key = Some(routing_key);
        }

        Ok(config)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.exchange_name.trim().is_empty() {
            return Err(EmitterError::Configuration(
                "exchange name is required".to_string(),
            ));
        }

        if self.name_prefix.is_empty() {
            return Err(EmitterError::Configuration(
                "name prefix must not be empty".to_string(),
            ));
        }

        if let Some(uri) = &self.uri {
            if uri.trim().is_empty() {
                return Err(EmitterError::Configuration(
                    "broker URI must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// The URI to connect to, falling back to [`DEFAULT_URI`]
    pub fn effective_uri(&self) -> &str {
        self.uri.as_deref().unwrap_or(DEFAULT_URI)
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = exchange_type;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EmitterConfig::new("test-ex");
        assert_eq!(config.exchange_name, "test-ex");
        assert_eq!(config.exchange_type, ExchangeType::Topic);
        assert_eq!(config.name_prefix, "broker-emitter-");
        assert_eq!(config.routing_key, None);
        assert_eq!(config.effective_uri(), DEFAULT_URI);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(EmitterConfig::default())]
    #[case(EmitterConfig::new("   "))]
    #[case(EmitterConfig::new("ex").with_name_prefix(""))]
    #[case(EmitterConfig::new("ex").with_uri(""))]
    fn test_config_validation_rejects(#[case] config: EmitterConfig) {
        assert!(matches!(config.validate(), Err(EmitterError::Configuration(_))));
    }

    #[test]
    fn test_builder_pattern() {
        let config = EmitterConfig::new("orders")
            .with_uri("memory://orders")
            .with_exchange_type(ExchangeType::Direct)
            .with_name_prefix("svc-")
            .with_routing_key("orders.default");

        assert_eq!(config.effective_uri(), "memory://orders");
        assert_eq!(config.exchange_type, ExchangeType::Direct);
        assert_eq!(config.name_prefix, "svc-");
        assert_eq!(config.routing_key.as_deref(), Some("orders.default"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_URI, "memory://env"),
            (ENV_EXCHANGE, "env-ex"),
            (ENV_EXCHANGE_TYPE, "fanout"),
            (ENV_NAME_PREFIX, "env-"),
            (ENV_ROUTING_KEY, "env.key"),
        ]
        .into_iter()
        .collect();

        let config = EmitterConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.uri.as_deref(), Some("memory://env"));
        assert_eq!(config.exchange_name, "env-ex");
        assert_eq!(config.exchange_type, ExchangeType::Fanout);
        assert_eq!(config.name_prefix, "env-");
        assert_eq!(config.routing_key.as_deref(), Some("env.key"));
    }

    #[test]
    fn test_from_lookup_defaults_and_bad_type() {
        let config = EmitterConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EmitterConfig::default());

        let result = EmitterConfig::from_lookup(|k| (k == ENV_EXCHANGE_TYPE).then(|| "bogus".to_string()));
        assert!(matches!(result, Err(EmitterError::Configuration(_))));
    }
}
