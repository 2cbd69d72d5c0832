//! Error types for the SAT>IP client.

use thiserror::Error;

/// Primary error type for all SAT>IP operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("RTSP error: {0}")]
    Rtsp(#[from] RtspError),

    #[error("RTCP error: {0}")]
    Rtcp(#[from] RtcpError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Errors during SSDP discovery and device description retrieval.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Socket setup failed: {0}")]
    Socket(String),

    #[error("Description fetch failed for {location}: {reason}")]
    Description { location: String, reason: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Discovery client stopped")]
    Stopped,
}

/// Errors during RTSP communication.
#[derive(Error, Debug)]
pub enum RtspError {
    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("Session not established")]
    NoSession,

    #[error("Tuning failed: {0}")]
    TuningFailed(String),

    #[error("No free client port pair from {0}")]
    NoFreePorts(u16),
}

/// Errors on the RTCP telemetry channel.
#[derive(Error, Debug)]
pub enum RtcpError {
    #[error("Packet truncated: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Listener bind failed: {0}")]
    Bind(String),
}

/// Parsing errors for text formats.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
