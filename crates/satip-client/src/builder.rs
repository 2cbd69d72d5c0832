//! Client builder for configuration.

use std::sync::Arc;

use satip_core::Result;
use satip_discovery::{DiscoveryConfig, SsdpClient};
use satip_rtcp::ListenerConfig;
use satip_rtsp::{SessionConfig, TransportMode};

use crate::{EventHandler, NoOpHandler, SatIpClient};

/// Builder for configuring [`SatIpClient`].
pub struct ClientBuilder {
    discovery_config: DiscoveryConfig,
    session_config: SessionConfig,
    transport_mode: TransportMode,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ClientBuilder {
    /// Create new builder with defaults.
    pub fn new() -> Self {
        Self {
            discovery_config: DiscoveryConfig::default(),
            session_config: SessionConfig::default(),
            transport_mode: TransportMode::Unicast,
            event_handler: None,
        }
    }

    /// Set discovery configuration.
    pub fn discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery_config = config;
        self
    }

    /// Set session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Ask servers for multicast delivery instead of unicast.
    pub fn transport_mode(mut self, mode: TransportMode) -> Self {
        self.transport_mode = mode;
        self
    }

    /// First local RTP port tried for unicast sessions.
    pub fn port_base(mut self, port: u16) -> Self {
        self.session_config.port_base = port;
        self
    }

    /// Set RTCP listener timing.
    pub fn listener_config(mut self, config: ListenerConfig) -> Self {
        self.session_config.listener = config;
        self
    }

    /// Set event handler.
    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<SatIpClient> {
        let discovery = SsdpClient::new(self.discovery_config)?;
        Ok(SatIpClient::with_discovery(
            discovery,
            self.session_config,
            self.transport_mode,
            self.event_handler.unwrap_or_else(|| Arc::new(NoOpHandler)),
        ))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
