//! # satip-rtsp
//!
//! RTSP session control for SAT>IP servers.
//!
//! This crate provides:
//! - RTSP client connection management
//! - Request/response formatting
//! - `Session` and `Transport` header handling
//! - Client port allocation
//! - Session state machine with keep-alive and RTCP telemetry

mod connection;
pub mod headers;
mod keepalive;
pub mod ports;
mod request;
mod response;
mod session;
mod traits;

pub use connection::{RtspConnection, DEFAULT_READ_TIMEOUT};
pub use headers::{PortPair, SessionHeader, TransportInfo, TransportMode, DEFAULT_SESSION_TIMEOUT};
pub use keepalive::{keepalive_period, MIN_KEEPALIVE_PERIOD};
pub use ports::{allocate_port_pair, DEFAULT_PORT_BASE};
pub use request::{RtspMethod, RtspRequest};
pub use response::RtspResponse;
pub use session::{
    RtspSession, SessionConfig, SessionDescription, SessionEvent, SessionInfo, SessionState,
};
pub use traits::RtspTransport;
