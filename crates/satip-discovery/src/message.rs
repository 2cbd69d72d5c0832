//! SSDP datagram classification and parsing.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use satip_core::DeviceId;

/// SSDP multicast group.
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// SSDP port.
pub const SSDP_PORT: u16 = 1900;

/// Search target and notification type of SAT>IP servers.
pub const SATIP_DEVICE_TYPE: &str = "urn:ses-com:device:SatIPServer:1";

/// Kind of SSDP datagram, taken from its first line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `HTTP/1.1 200 OK`, an answer to M-SEARCH.
    SearchResponse,
    /// `M-SEARCH * HTTP/1.1` from another control point.
    Search,
    /// `NOTIFY * HTTP/1.1`.
    Notify,
}

/// A parsed SSDP datagram. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpMessage {
    pub kind: MessageKind,
    headers: HashMap<String, String>,
}

/// What a datagram means for the device registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// The device is present; its description lives at `location`.
    Alive { id: DeviceId, location: String },
    /// The device is leaving the network.
    ByeBye { id: DeviceId },
}

impl SsdpMessage {
    /// Classify and parse a datagram. Returns `None` for anything that is
    /// not an SSDP search response, search or notification.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
        let first = lines.next()?.trim();

        let kind = if first.starts_with("HTTP/") {
            MessageKind::SearchResponse
        } else if first.starts_with("M-SEARCH * ") {
            MessageKind::Search
        } else if first.starts_with("NOTIFY * ") {
            MessageKind::Notify
        } else {
            return None;
        };

        let mut headers = HashMap::new();
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Some(Self { kind, headers })
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location").filter(|l| !l.is_empty())
    }

    /// Device identity from the `USN` header.
    pub fn uuid(&self) -> Option<DeviceId> {
        self.header("usn").and_then(extract_uuid).map(DeviceId::new)
    }

    /// Interpret the message for devices of type `target`.
    pub fn announcement(&self, target: &str) -> Option<Announcement> {
        match self.kind {
            MessageKind::Search => None,
            MessageKind::Notify => {
                if self.header("nt")? != target {
                    return None;
                }
                let id = self.uuid()?;
                match self.header("nts")? {
                    "ssdp:byebye" => Some(Announcement::ByeBye { id }),
                    "ssdp:alive" => Some(Announcement::Alive {
                        id,
                        location: self.location()?.to_string(),
                    }),
                    _ => None,
                }
            }
            MessageKind::SearchResponse => {
                if self.header("st")? != target {
                    return None;
                }
                Some(Announcement::Alive {
                    id: self.uuid()?,
                    location: self.location()?.to_string(),
                })
            }
        }
    }
}

/// `uuid:` plus everything up to the next `::` or the end of the USN.
pub fn extract_uuid(usn: &str) -> Option<String> {
    let start = usn.find("uuid:")?;
    let rest = &usn[start..];
    let id = match rest[5..].find("::") {
        Some(end) => &rest[..5 + end],
        None => rest,
    };
    let id = id.trim();
    (id.len() > 5).then(|| id.to_string())
}

/// M-SEARCH request for `target`.
pub fn search_request(target: &str, mx: u8) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\r\n",
        SSDP_MULTICAST_ADDR, SSDP_PORT, mx, target
    )
}
