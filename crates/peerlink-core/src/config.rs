//! Centralized Configuration Management
//!
//! Tunables for the connection manager and the delivery coordinator, with
//! presets for production and tests and a checked builder. Durations are
//! written as milliseconds so configuration files stay flat.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::transport::{ChannelOptions, IceServer};

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for direct channel negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Negotiation attempts per peer before giving up
    pub max_attempts: u32,
    /// Time allowed for one negotiation to reach an open channel
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Answer unsolicited offers without waiting for a local request
    pub auto_accept_offers: bool,
    /// Data channel and connectivity settings
    pub channel: ChannelOptions,
    /// Buffer size for inbound frame subscriptions
    pub inbound_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            connect_timeout: Duration::from_secs(30),
            auto_accept_offers: true,
            channel: ChannelOptions::default(),
            inbound_buffer_size: 128,
        }
    }
}

impl ConnectionConfig {
    /// Short timeouts and no external servers, for in-process tests
    pub fn testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            channel: ChannelOptions {
                ice_servers: Vec::new(),
                ..ChannelOptions::default()
            },
            ..Self::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.channel.ice_servers = servers;
        self
    }
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Configuration for the delivery coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delay between reading a burn-after-reading message and removing it
    #[serde(with = "duration_ms", rename = "burn_delay_ms")]
    pub burn_delay: Duration,
    /// Skip new negotiation when presence says the receiver is offline
    pub eager_fallback_when_absent: bool,
    /// Capacity of the delivery event broadcast
    pub event_buffer_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            burn_delay: Duration::from_secs(1),
            eager_fallback_when_absent: true,
            event_buffer_size: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Unified Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub connection: ConnectionConfig,
    pub delivery: DeliveryConfig,
}

impl PeerlinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> PeerlinkConfigBuilder {
        PeerlinkConfigBuilder::new()
    }

    /// Preset for in-process tests and simulations
    pub fn testing() -> Self {
        Self {
            connection: ConnectionConfig::testing(),
            delivery: DeliveryConfig::default(),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.connection.max_attempts == 0 {
            return Err("Max attempts cannot be zero".into());
        }
        if self.connection.connect_timeout.is_zero() {
            return Err("Connect timeout cannot be zero".into());
        }
        if self.connection.channel.label.is_empty() {
            return Err("Data channel label cannot be empty".into());
        }
        if self.connection.inbound_buffer_size == 0 {
            return Err("Inbound buffer size cannot be zero".into());
        }
        if self
            .connection
            .channel
            .ice_servers
            .iter()
            .any(|server| server.urls.is_empty())
        {
            return Err("ICE server entries need at least one URL".into());
        }
        if self.delivery.event_buffer_size == 0 {
            return Err("Event buffer size cannot be zero".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Configuration Builder
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PeerlinkConfigBuilder {
    config: PeerlinkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid configuration: {message}")]
pub struct ConfigBuilderError {
    pub message: String,
}

impl PeerlinkConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    pub fn delivery(mut self, config: DeliveryConfig) -> Self {
        self.config.delivery = config;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.connection.max_attempts = attempts;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connect_timeout = timeout;
        self
    }

    pub fn burn_delay(mut self, delay: Duration) -> Self {
        self.config.delivery.burn_delay = delay;
        self
    }

    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.config.connection.channel.ice_servers = servers;
        self
    }

    pub fn auto_accept_offers(mut self, enabled: bool) -> Self {
        self.config.connection.auto_accept_offers = enabled;
        self
    }

    pub fn testing(mut self) -> Self {
        self.config = PeerlinkConfig::testing();
        self
    }

    pub fn build(self) -> Result<PeerlinkConfig, ConfigBuilderError> {
        self.config
            .validate()
            .map_err(|message| ConfigBuilderError { message })?;
        Ok(self.config)
    }
}

// ----------------------------------------------------------------------------
// Serde helpers
// ----------------------------------------------------------------------------

mod duration_ms {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
