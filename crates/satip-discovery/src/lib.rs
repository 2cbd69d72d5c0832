//! # satip-discovery
//!
//! SSDP discovery of SAT>IP tuner servers.
//!
//! This crate provides:
//! - M-SEARCH and NOTIFY handling over multicast and unicast UDP
//! - UPnP device description parsing, including `X_SATIPCAP` and `X_SATIPM3U`
//! - A registry of known devices with found/lost events
//! - Trait-based design for testing with mocks
//!
//! ## Example
//!
//! ```ignore
//! use satip_discovery::{DiscoveryConfig, SsdpClient};
//! use std::time::Duration;
//!
//! let client = SsdpClient::new(DiscoveryConfig::default())?;
//! for device in client.scan(Duration::from_secs(3)).await? {
//!     println!("Found: {} at {}", device.friendly_name, device.host);
//! }
//! ```

mod client;
pub mod description;
pub mod message;
mod registry;
mod traits;

pub use client::{DiscoveryConfig, SsdpClient};
pub use description::{DescriptionFetcher, DeviceDescription, HttpFetcher, DEFAULT_FETCH_TIMEOUT};
pub use message::{
    extract_uuid, search_request, Announcement, MessageKind, SsdpMessage, SATIP_DEVICE_TYPE,
    SSDP_MULTICAST_ADDR, SSDP_PORT,
};
pub use traits::{Discovery, DiscoveryEvent, EventStream};
