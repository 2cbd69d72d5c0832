//! Client events and handlers.

use async_trait::async_trait;
use satip_core::{Device, DeviceId, ReceptionInfo};

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Device discovered.
    DeviceFound(Device),
    /// Device announced its departure.
    DeviceLost(DeviceId),
    /// New reception figures for a tuned device.
    ReceptionChanged { device: DeviceId, info: ReceptionInfo },
    /// A session ended without the caller asking for it.
    SessionClosed { device: DeviceId, reason: String },
}

impl ClientEvent {
    /// The device this event is about.
    pub fn device_id(&self) -> &DeviceId {
        match self {
            ClientEvent::DeviceFound(d) => &d.id,
            ClientEvent::DeviceLost(id) => id,
            ClientEvent::ReceptionChanged { device, .. } => device,
            ClientEvent::SessionClosed { device, .. } => device,
        }
    }
}

/// Handler for client events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called when an event occurs.
    async fn on_event(&self, event: ClientEvent);
}

/// No-op event handler.
pub struct NoOpHandler;

#[async_trait]
impl EventHandler for NoOpHandler {
    async fn on_event(&self, _event: ClientEvent) {}
}

/// Callback-based event handler.
pub struct CallbackHandler<F>
where
    F: Fn(ClientEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(ClientEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> EventHandler for CallbackHandler<F>
where
    F: Fn(ClientEvent) + Send + Sync,
{
    async fn on_event(&self, event: ClientEvent) {
        (self.callback)(event);
    }
}
