//! `Session` and `Transport` header handling.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Session lifetime assumed when the server does not send `;timeout=`.
pub const DEFAULT_SESSION_TIMEOUT: u32 = 30;

/// RTP delivery mode requested in SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Unicast,
    Multicast,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Multicast => "multicast",
        }
    }

    /// `Transport` request header value.
    ///
    /// Unicast needs the client RTP/RTCP ports; multicast lets the server
    /// pick the group.
    pub fn request_header(&self, client_ports: Option<PortPair>) -> String {
        match (self, client_ports) {
            (Self::Unicast, Some(ports)) => format!("RTP/AVP;unicast;client_port={}", ports),
            (Self::Unicast, None) => "RTP/AVP;unicast".to_string(),
            (Self::Multicast, _) => "RTP/AVP;multicast".to_string(),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RTP port and its RTCP companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

impl PortPair {
    /// Pair starting at an even RTP port.
    pub fn from_rtp(rtp: u16) -> Self {
        Self {
            rtp,
            rtcp: rtp.saturating_add(1),
        }
    }

    /// Parse `"42000-42001"`. A single port implies RTCP on the next one.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().splitn(2, '-');
        let rtp: u16 = parts.next()?.trim().parse().ok()?;
        let rtcp = match parts.next() {
            Some(p) => p.trim().parse().ok()?,
            None => rtp.checked_add(1)?,
        };
        Some(Self { rtp, rtcp })
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.rtp, self.rtcp)
    }
}

/// Parsed `Session: <id>[;timeout=<secs>]` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: u32,
}

fn session_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([^\s;]+)(?:;\s*timeout\s*=\s*(\d+))?").expect("valid session regex")
    })
}

impl SessionHeader {
    /// Returns `None` when the header carries no session token.
    pub fn parse(value: &str) -> Option<Self> {
        let caps = session_regex().captures(value)?;
        let id = caps.get(1)?.as_str().to_string();
        let timeout = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);
        Some(Self { id, timeout })
    }
}

/// Fields taken from an `RTP/AVP` entry of a `Transport` response header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportInfo {
    pub unicast: Option<bool>,
    pub client_ports: Option<PortPair>,
    pub server_ports: Option<PortPair>,
    pub destination: Option<String>,
    /// Multicast RTP/RTCP ports.
    pub multicast_ports: Option<PortPair>,
    pub ttl: Option<u8>,
    pub source: Option<String>,
}

impl TransportInfo {
    /// Parse the first `RTP/AVP` transport in a comma separated list.
    ///
    /// Returns `None` when no RTP/AVP transport is present. Unknown or
    /// malformed parameters are skipped.
    pub fn parse(header: &str) -> Option<Self> {
        let transport = header
            .split(',')
            .map(str::trim)
            .find(|t| t.starts_with("RTP/AVP"))?;

        let mut info = Self::default();
        for section in transport.split(';').map(str::trim) {
            let (key, value) = match section.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (section, ""),
            };
            match key {
                "unicast" => info.unicast = Some(true),
                "multicast" => info.unicast = Some(false),
                "client_port" => info.client_ports = PortPair::parse(value),
                "server_port" => info.server_ports = PortPair::parse(value),
                "port" => info.multicast_ports = PortPair::parse(value),
                "destination" if !value.is_empty() => info.destination = Some(value.to_string()),
                "source" if !value.is_empty() => info.source = Some(value.to_string()),
                "ttl" => info.ttl = value.parse().ok(),
                _ => {}
            }
        }
        Some(info)
    }
}
