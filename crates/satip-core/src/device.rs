//! Device representation and identification types.

use std::fmt;

/// Default RTSP control port of a SAT>IP server.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Unique device name, the USN uuid including its `uuid:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier without its `uuid:` prefix.
    pub fn bare(&self) -> &str {
        self.0.strip_prefix("uuid:").unwrap_or(&self.0)
    }

    /// Whether two ids name the same device, ignoring the `uuid:` prefix and case.
    pub fn matches(&self, other: &str) -> bool {
        let other = other.strip_prefix("uuid:").unwrap_or(other);
        self.bare().eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Broadcast families a tuner can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastStandard {
    Satellite,
    Cable,
    Terrestrial,
}

/// One `X_SATIPCAP` entry, e.g. `DVBS2-2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerCapability {
    pub standard: BroadcastStandard,
    /// 1 for DVB-x, 2 for DVB-x2.
    pub generation: u8,
    pub tuners: u32,
}

impl TunerCapability {
    /// Parse one `SYSTEM-count` entry. Unknown systems yield `None`.
    pub fn parse(entry: &str) -> Option<Self> {
        let (system, count) = match entry.trim().split_once('-') {
            Some((system, count)) => (system, count.trim().parse().ok()?),
            None => (entry.trim(), 1),
        };
        let (standard, generation) = match system.to_ascii_uppercase().as_str() {
            "DVBS" => (BroadcastStandard::Satellite, 1),
            "DVBS2" => (BroadcastStandard::Satellite, 2),
            "DVBC" => (BroadcastStandard::Cable, 1),
            "DVBC2" => (BroadcastStandard::Cable, 2),
            "DVBT" => (BroadcastStandard::Terrestrial, 1),
            "DVBT2" => (BroadcastStandard::Terrestrial, 2),
            _ => return None,
        };
        Some(Self {
            standard,
            generation,
            tuners: count,
        })
    }
}

/// Parsed SAT>IP capability string.
///
/// A device that publishes no capability element is assumed to support
/// satellite reception.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The raw `X_SATIPCAP` text, if the device published one.
    pub raw: Option<String>,
    pub tuners: Vec<TunerCapability>,
}

impl Capabilities {
    /// Parse a comma-joined capability string such as `DVBS2-2,DVBT-1`.
    pub fn parse(raw: &str) -> Self {
        let tuners = raw.split(',').filter_map(TunerCapability::parse).collect();
        Self {
            raw: Some(raw.trim().to_string()),
            tuners,
        }
    }

    pub fn supports(&self, standard: BroadcastStandard) -> bool {
        if self.raw.is_none() && standard == BroadcastStandard::Satellite {
            return true;
        }
        self.tuners.iter().any(|t| t.standard == standard)
    }

    pub fn supports_satellite(&self) -> bool {
        self.supports(BroadcastStandard::Satellite)
    }

    pub fn supports_cable(&self) -> bool {
        self.supports(BroadcastStandard::Cable)
    }

    pub fn supports_terrestrial(&self) -> bool {
        self.supports(BroadcastStandard::Terrestrial)
    }

    /// Total tuners advertised for a standard.
    pub fn tuner_count(&self, standard: BroadcastStandard) -> u32 {
        self.tuners
            .iter()
            .filter(|t| t.standard == standard)
            .map(|t| t.tuners)
            .sum()
    }
}

/// Icon advertised in a device description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIcon {
    pub mime_type: String,
    /// Absolute URL.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A discovered SAT>IP tuner server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    // --- Identity ---
    pub id: DeviceId,
    pub friendly_name: String,
    /// Host (name or address) taken from the description location.
    pub host: String,
    pub rtsp_port: u16,
    /// URL of the UPnP device description.
    pub location: String,

    // --- Capabilities ---
    pub capabilities: Capabilities,
    /// Channel list published through `X_SATIPM3U`, made absolute.
    pub m3u_url: Option<String>,

    // --- UPnP description ---
    pub device_type: Option<String>,
    pub udn: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub presentation_url: Option<String>,
    pub icons: Vec<DeviceIcon>,
}

impl Device {
    /// Create a device with only its identity known.
    pub fn new(id: DeviceId, host: impl Into<String>, location: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            id,
            friendly_name: host.clone(),
            host,
            rtsp_port: DEFAULT_RTSP_PORT,
            location: location.into(),
            capabilities: Capabilities::default(),
            m3u_url: None,
            device_type: None,
            udn: None,
            manufacturer: None,
            manufacturer_url: None,
            model_description: None,
            model_name: None,
            model_number: None,
            model_url: None,
            serial_number: None,
            presentation_url: None,
            icons: Vec::new(),
        }
    }

    /// `host:port` of the RTSP control endpoint.
    pub fn rtsp_authority(&self) -> String {
        format!("{}:{}", self.host, self.rtsp_port)
    }

    /// Base RTSP URL, `rtsp://host:port/`.
    pub fn rtsp_base_url(&self) -> String {
        format!("rtsp://{}/", self.rtsp_authority())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.friendly_name, self.host, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod device_id {
        use super::*;

        #[test]
        fn bare_strips_prefix() {
            let id = DeviceId::new("uuid:ABC123");
            assert_eq!(id.bare(), "ABC123");
            assert_eq!(id.as_str(), "uuid:ABC123");
        }

        #[test]
        fn matches_with_or_without_prefix() {
            let id = DeviceId::new("uuid:abc123");
            assert!(id.matches("uuid:ABC123"));
            assert!(id.matches("ABC123"));
            assert!(!id.matches("ABC124"));
        }

        #[test]
        fn displays_full_id() {
            assert_eq!(DeviceId::from("uuid:x").to_string(), "uuid:x");
        }
    }

    mod capabilities {
        use super::*;

        #[test]
        fn parses_hybrid_string() {
            let caps = Capabilities::parse("DVBS2-4,DVBT2-2,DVBC-1");
            assert_eq!(caps.tuners.len(), 3);
            assert_eq!(caps.tuner_count(BroadcastStandard::Satellite), 4);
            assert_eq!(caps.tuner_count(BroadcastStandard::Terrestrial), 2);
            assert!(caps.supports_cable());
            assert_eq!(caps.tuners[1].generation, 2);
        }

        #[test]
        fn missing_element_assumes_satellite() {
            let caps = Capabilities::default();
            assert!(caps.supports_satellite());
            assert!(!caps.supports_cable());
            assert!(!caps.supports_terrestrial());
        }

        #[test]
        fn explicit_string_without_satellite() {
            let caps = Capabilities::parse("DVBT-2");
            assert!(!caps.supports_satellite());
            assert!(caps.supports_terrestrial());
        }

        #[test]
        fn ignores_unknown_entries() {
            let caps = Capabilities::parse("DVBS2-2,ATSC-1, dvbc2-1");
            assert_eq!(caps.tuners.len(), 2);
            assert!(caps.supports_cable());
        }

        #[test]
        fn entry_without_count_is_one_tuner() {
            let cap = TunerCapability::parse("DVBS").unwrap();
            assert_eq!(cap.tuners, 1);
            assert!(TunerCapability::parse("DVBS-x").is_none());
        }
    }

    mod device {
        use super::*;

        #[test]
        fn new_uses_defaults() {
            let device = Device::new(
                DeviceId::new("uuid:ABC123"),
                "10.0.0.5",
                "http://10.0.0.5:8080/desc.xml",
            );
            assert_eq!(device.rtsp_port, DEFAULT_RTSP_PORT);
            assert_eq!(device.friendly_name, "10.0.0.5");
            assert_eq!(device.rtsp_authority(), "10.0.0.5:554");
            assert_eq!(device.rtsp_base_url(), "rtsp://10.0.0.5:554/");
            assert!(device.capabilities.supports_satellite());
        }
    }
}
