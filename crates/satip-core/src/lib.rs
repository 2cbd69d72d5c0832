//! # satip-core
//!
//! Core types, traits, and error definitions shared across all SAT>IP crates.
//!
//! This crate provides:
//! - Device representation and capability parsing
//! - Tuning parameters and M3U channel lists
//! - Reception info normalization
//! - The injected logging capability
//! - Common error types

pub mod device;
pub mod error;
pub mod log;
pub mod playlist;
pub mod signal;
pub mod tuning;

pub use device::{
    BroadcastStandard, Capabilities, Device, DeviceIcon, DeviceId, TunerCapability,
    DEFAULT_RTSP_PORT,
};
pub use error::{DiscoveryError, Error, ParseError, Result, RtcpError, RtspError};
pub use log::{LogLevel, Logger, MemoryLogger, SharedLogger, TracingLogger};
pub use playlist::{Channel, Playlist};
pub use signal::ReceptionInfo;
pub use tuning::{ModulationSystem, TuningParams};
