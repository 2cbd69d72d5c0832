//! Client RTP/RTCP port selection.

use std::net::{Ipv4Addr, UdpSocket};

use satip_core::error::{Result, RtspError};

use crate::headers::PortPair;

/// First RTP port tried for unicast sessions.
pub const DEFAULT_PORT_BASE: u16 = 40000;

/// Find the first even port at or above `base` whose pair is free locally.
///
/// Each candidate is probed by binding both UDP ports; the probe sockets are
/// released before returning.
pub fn allocate_port_pair(base: u16) -> Result<PortPair> {
    let start = base.saturating_add(base % 2);
    let mut port = start;
    while port < u16::MAX {
        if pair_is_free(port) {
            return Ok(PortPair::from_rtp(port));
        }
        port = match port.checked_add(2) {
            Some(next) => next,
            None => break,
        };
    }
    Err(RtspError::NoFreePorts(base).into())
}

fn pair_is_free(rtp: u16) -> bool {
    let Ok(_rtp) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtp)) else {
        return false;
    };
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtp + 1)).is_ok()
}
