//! # satip-client
//!
//! High-level SAT>IP client.
//!
//! This crate provides:
//! - Simple API for discovering tuner servers and tuning them
//! - One managed RTSP session per device, with keep-alive and RTCP telemetry
//! - Events for devices coming and going, reception changes and closed sessions
//!
//! ## Example
//!
//! ```ignore
//! use satip_client::{ClientBuilder, TuningParams};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new().build()?;
//!     let devices = client.discover(Duration::from_secs(3)).await?;
//!
//!     let device = devices.first().ok_or("no tuner found")?;
//!     let params = TuningParams::parse("src=1&freq=11494&pol=h&msys=dvbs2&sr=22000&pids=0");
//!     client.tune(device.id.as_str(), &params).await?;
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod builder;
mod client;
mod events;

pub use builder::ClientBuilder;
pub use client::SatIpClient;
pub use events::{CallbackHandler, ClientEvent, EventHandler, NoOpHandler};

// Re-export commonly used types
pub use satip_core::{
    Channel, Device, DeviceId, Error, Playlist, ReceptionInfo, Result, TuningParams,
};
pub use satip_discovery::{Discovery, DiscoveryConfig};
pub use satip_rtsp::{SessionConfig, SessionDescription, SessionInfo, TransportMode};
