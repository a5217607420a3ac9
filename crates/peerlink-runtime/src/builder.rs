//! Runtime Builder API
//!
//! Collects configuration and the external collaborators, validates them and
//! produces a `DeliveryCoordinator`. Consumers (CLI, tests) register concrete
//! implementations; nothing here knows which ones.

use crate::managers::{DeliveryCoordinator, DeliveryServices};
use peerlink_core::{
    FallbackStore, KeyDirectory, PeerTransport, PeerlinkConfig, PeerlinkError, PeerlinkResult,
    PresenceFeed, SharedTimeSource, SignalRelay, SystemTimeSource,
};
use std::sync::Arc;
use tracing::info;

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a delivery coordinator and its collaborators
#[derive(Default)]
pub struct RuntimeBuilder {
    config: PeerlinkConfig,
    relay: Option<Arc<dyn SignalRelay>>,
    store: Option<Arc<dyn FallbackStore>>,
    directory: Option<Arc<dyn KeyDirectory>>,
    transport: Option<Arc<dyn PeerTransport>>,
    presence: Option<Arc<dyn PresenceFeed>>,
    time_source: Option<SharedTimeSource>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: PeerlinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_signal_relay(mut self, relay: Arc<dyn SignalRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_fallback_store(mut self, store: Arc<dyn FallbackStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_key_directory(mut self, directory: Arc<dyn KeyDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Optional; without a feed every peer is treated as possibly online
    pub fn with_presence_feed(mut self, presence: Arc<dyn PresenceFeed>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Defaults to the system clock
    pub fn with_time_source(mut self, time_source: SharedTimeSource) -> Self {
        self.time_source = Some(time_source);
        self
    }

    pub fn build(self) -> PeerlinkResult<DeliveryCoordinator> {
        self.config.validate().map_err(PeerlinkError::config_error)?;

        let services = DeliveryServices {
            relay: self.relay.ok_or_else(|| missing("signal relay"))?,
            store: self.store.ok_or_else(|| missing("fallback store"))?,
            directory: self.directory.ok_or_else(|| missing("key directory"))?,
            transport: self.transport.ok_or_else(|| missing("peer transport"))?,
            presence: self.presence,
        };
        let time_source = self
            .time_source
            .unwrap_or_else(|| Arc::new(SystemTimeSource));

        info!(
            "Building delivery coordinator (presence feed: {})",
            services.presence.is_some()
        );
        Ok(DeliveryCoordinator::new(self.config, services, time_source))
    }
}

fn missing(what: &str) -> PeerlinkError {
    PeerlinkError::config_error(format!("no {what} configured"))
}
