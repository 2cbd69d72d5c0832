//! # satip-rtcp
//!
//! RTCP telemetry for SAT>IP sessions.
//!
//! This crate provides:
//! - Decoding of sender/receiver reports, source descriptions, BYE and APP packets
//! - Tuner status extraction from the SAT>IP `SES1` APP packet
//! - A background listener bound to the negotiated unicast port or multicast group

mod listener;
pub mod packet;

pub use listener::{ListenerConfig, ListenerMode, RtcpEvent, RtcpListener};
pub use packet::{
    decode_all, AppPacket, Bye, ReceiverReport, ReportBlock, RtcpHeader, RtcpPacket, RtcpPackets,
    SdesChunk, SdesItem, SenderReport,
};
