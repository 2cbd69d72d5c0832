//! UPnP device description retrieval and parsing.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use satip_core::error::{DiscoveryError, ParseError, Result};
use satip_core::{Capabilities, Device, DeviceIcon, DeviceId};
use url::Url;

/// Default timeout for fetching a description document.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fields read from the top-level `<device>` of a description document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub udn: Option<String>,
    pub presentation_url: Option<String>,
    /// `X_SATIPCAP` entries, comma-joined when the element repeats.
    pub satip_cap: Option<String>,
    /// `X_SATIPM3U` as published, usually a path.
    pub satip_m3u: Option<String>,
    /// Icons with their URLs as published.
    pub icons: Vec<DeviceIcon>,
}

impl DeviceDescription {
    /// Parse a description document. Namespace prefixes are ignored, so
    /// `satip:X_SATIPCAP` and `X_SATIPCAP` are read alike. Embedded devices
    /// under `<deviceList>` are skipped.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut description = Self::default();
        let mut path: Vec<String> = Vec::new();
        let mut text = String::new();
        let mut icon: Option<DeviceIcon> = None;
        let mut buf = Vec::new();

        loop {
            match reader
                .read_event_into(&mut buf)
                .map_err(|e| ParseError::InvalidFormat(format!("description XML: {}", e)))?
            {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if name == "icon" && in_top_device(&path, 1) {
                        icon = Some(DeviceIcon::default());
                    }
                    path.push(name);
                    text.clear();
                }
                Event::Text(e) => {
                    let chunk = e
                        .decode()
                        .map_err(|e| ParseError::InvalidFormat(format!("description text: {}", e)))?;
                    text.push_str(&chunk);
                }
                Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e)),
                Event::GeneralRef(e) => {
                    let name = e
                        .decode()
                        .map_err(|e| ParseError::InvalidFormat(format!("description text: {}", e)))?;
                    if let Some(c) = resolve_entity(&name) {
                        text.push(c);
                    }
                }
                Event::End(_) => {
                    let Some(name) = path.pop() else {
                        continue;
                    };
                    let value = std::mem::take(&mut text);
                    let value = value.trim();

                    if in_top_device(&path, 0) {
                        description.set_field(&name, value);
                    } else if in_top_device(&path, 2)
                        && path.last().map(String::as_str) == Some("icon")
                    {
                        if let Some(icon) = icon.as_mut() {
                            set_icon_field(icon, &name, value);
                        }
                    } else if name == "icon" && in_top_device(&path, 1) {
                        if let Some(icon) = icon.take() {
                            if !icon.url.is_empty() {
                                description.icons.push(icon);
                            }
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(description)
    }

    fn set_field(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let value = value.to_string();
        match name {
            "deviceType" => self.device_type = Some(value),
            "friendlyName" => self.friendly_name = Some(value),
            "manufacturer" => self.manufacturer = Some(value),
            "manufacturerURL" => self.manufacturer_url = Some(value),
            "modelDescription" => self.model_description = Some(value),
            "modelName" => self.model_name = Some(value),
            "modelNumber" => self.model_number = Some(value),
            "modelURL" => self.model_url = Some(value),
            "serialNumber" => self.serial_number = Some(value),
            "UDN" => self.udn = Some(value),
            "presentationURL" => self.presentation_url = Some(value),
            "X_SATIPCAP" => {
                self.satip_cap = Some(match self.satip_cap.take() {
                    Some(existing) => format!("{},{}", existing, value),
                    None => value,
                })
            }
            "X_SATIPM3U" => self.satip_m3u = Some(value),
            _ => {}
        }
    }

    /// Copy the description onto `device`, resolving relative URLs against
    /// the device location.
    ///
    /// A missing presentation URL becomes `scheme://host` of the location.
    pub fn apply_to(&self, device: &mut Device) {
        let base = Url::parse(&device.location).ok();

        if let Some(name) = &self.friendly_name {
            device.friendly_name = name.clone();
        }
        device.device_type = self.device_type.clone();
        device.udn = self.udn.clone();
        device.manufacturer = self.manufacturer.clone();
        device.manufacturer_url = self.manufacturer_url.clone();
        device.model_description = self.model_description.clone();
        device.model_name = self.model_name.clone();
        device.model_number = self.model_number.clone();
        device.model_url = self.model_url.clone();
        device.serial_number = self.serial_number.clone();

        device.presentation_url = match (&self.presentation_url, &base) {
            (Some(url), Some(base)) => Some(resolve(base, url)),
            (Some(url), None) => Some(url.clone()),
            (None, Some(base)) => origin_of(base),
            (None, None) => None,
        };

        device.capabilities = match &self.satip_cap {
            Some(raw) => Capabilities::parse(raw),
            None => Capabilities::default(),
        };

        device.m3u_url = match (&self.satip_m3u, &base) {
            (Some(m3u), Some(base)) => Some(resolve(base, m3u)),
            (Some(m3u), None) => Some(m3u.clone()),
            _ => None,
        };

        device.icons = self
            .icons
            .iter()
            .map(|icon| DeviceIcon {
                url: match &base {
                    Some(base) => resolve(base, &icon.url),
                    None => icon.url.clone(),
                },
                ..icon.clone()
            })
            .collect();
    }
}

/// True when `path` is inside the first `<device>` at `extra` levels below it.
fn in_top_device(path: &[String], extra: usize) -> bool {
    if path.iter().filter(|p| *p == "device").count() != 1 {
        return false;
    }
    path.iter()
        .position(|p| p == "device")
        .is_some_and(|position| path.len() == position + 1 + extra)
}

fn set_icon_field(icon: &mut DeviceIcon, name: &str, value: &str) {
    match name {
        "mimetype" => icon.mime_type = value.to_string(),
        "url" => icon.url = value.to_string(),
        "width" => icon.width = value.parse().unwrap_or(0),
        "height" => icon.height = value.parse().unwrap_or(0),
        "depth" => icon.depth = value.parse().unwrap_or(0),
        _ => {}
    }
}

fn resolve_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}

fn resolve(base: &Url, reference: &str) -> String {
    base.join(reference)
        .map(String::from)
        .unwrap_or_else(|_| reference.to_string())
}

fn origin_of(url: &Url) -> Option<String> {
    url.host_str().map(|host| format!("{}://{}", url.scheme(), host))
}

/// Device shell built from an SSDP announcement before its description is known.
pub fn device_from_location(id: DeviceId, location: &str) -> Device {
    let host = Url::parse(location)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_default();
    let mut device = Device::new(id, host, location);
    device.presentation_url = Url::parse(location).ok().and_then(|url| origin_of(&url));
    device
}

/// Source of description documents.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait DescriptionFetcher: Send + Sync {
    /// Fetch the document at `location` as text.
    async fn fetch(&self, location: &str) -> Result<String>;
}

/// Fetches descriptions over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| satip_core::Error::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DescriptionFetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<String> {
        let failed = |reason: String| DiscoveryError::Description {
            location: location.to_string(),
            reason,
        };

        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| failed(e.to_string()))?;
        Ok(response.text().await.map_err(|e| failed(e.to_string()))?)
    }
}
