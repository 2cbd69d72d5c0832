//! Trait definitions for device discovery (enables mocking in tests).

use std::time::Duration;

use async_trait::async_trait;
use satip_core::{Device, DeviceId, Result};
use tokio_stream::Stream;

/// Event emitted as devices come and go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device was registered.
    Found(Device),
    /// A device announced its departure.
    Lost(DeviceId),
}

impl DiscoveryEvent {
    /// Get the device from a Found event.
    pub fn device(&self) -> Option<&Device> {
        match self {
            DiscoveryEvent::Found(d) => Some(d),
            DiscoveryEvent::Lost(_) => None,
        }
    }

    /// Get the device ID from any event.
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DiscoveryEvent::Found(d) => &d.id,
            DiscoveryEvent::Lost(id) => id,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, DiscoveryEvent::Found(_))
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, DiscoveryEvent::Lost(_))
    }
}

/// Boxed stream of discovery events.
pub type EventStream = Box<dyn Stream<Item = DiscoveryEvent> + Send + Unpin>;

/// Trait for discovery implementations.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait Discovery: Send + Sync {
    /// Start the listeners. Calling it again while running does nothing.
    async fn start(&self) -> Result<()>;

    /// Send M-SEARCH for `target`.
    async fn find_by_type(&self, target: &str) -> Result<()>;

    /// Start, search for the configured target, wait, and return what is known.
    async fn scan(&self, timeout: Duration) -> Result<Vec<Device>>;

    /// Events from now on.
    fn events(&self) -> EventStream;

    /// Registered device with this uuid, if any.
    fn find_by_udn(&self, uuid: &str) -> Option<Device>;

    /// Snapshot of all registered devices.
    fn devices(&self) -> Vec<Device>;

    /// Stop the listeners.
    async fn stop(&self);
}
