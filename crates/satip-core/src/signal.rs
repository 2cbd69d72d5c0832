//! Reception quality reported by tuner servers.
//!
//! Both DESCRIBE bodies and RTCP APP packets embed a tuner status string:
//! `;tuner=<id>,<level 0-255>,<lock 0|1>,<quality 0-15>,...`

use std::sync::OnceLock;

use regex::Regex;

/// Highest raw signal level reported by a server.
pub const RAW_LEVEL_MAX: u32 = 255;

/// Highest raw signal quality reported by a server.
pub const RAW_QUALITY_MAX: u32 = 15;

fn tuner_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?is);tuner=\d+,(\d+),(\d+),(\d+),").expect("tuner pattern is valid")
    })
}

/// Normalized reception state of a tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceptionInfo {
    pub locked: bool,
    /// Signal level, 0-100.
    pub level: u8,
    /// Signal quality, 0-100.
    pub quality: u8,
}

impl ReceptionInfo {
    /// Build from raw server values, normalizing to 0-100.
    pub fn from_raw(level: u32, locked: bool, quality: u32) -> Self {
        Self {
            locked,
            level: normalize(level, RAW_LEVEL_MAX),
            quality: normalize(quality, RAW_QUALITY_MAX),
        }
    }

    /// Extract reception info from any text containing a tuner status string.
    ///
    /// Returns `None` when no `;tuner=` block is present.
    pub fn from_tuner_string(text: &str) -> Option<Self> {
        let caps = tuner_pattern().captures(text)?;
        let level: u32 = caps.get(1)?.as_str().parse().ok()?;
        let lock: u32 = caps.get(2)?.as_str().parse().ok()?;
        let quality: u32 = caps.get(3)?.as_str().parse().ok()?;
        Some(Self::from_raw(level, lock == 1, quality))
    }
}

/// Integer scale onto 0-100, rounding down.
fn normalize(raw: u32, max: u32) -> u8 {
    let raw = raw.min(max);
    (raw * 100 / max) as u8
}
