//! Tuning parameters ("services") and their SAT>IP query string form.

use std::fmt;
use std::str::FromStr;

use crate::device::BroadcastStandard;
use crate::error::ParseError;

/// Delivery system named by the `msys` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModulationSystem {
    DvbS,
    DvbS2,
    DvbC,
    DvbC2,
    DvbT,
    DvbT2,
}

impl ModulationSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DvbS => "dvbs",
            Self::DvbS2 => "dvbs2",
            Self::DvbC => "dvbc",
            Self::DvbC2 => "dvbc2",
            Self::DvbT => "dvbt",
            Self::DvbT2 => "dvbt2",
        }
    }

    pub fn standard(&self) -> BroadcastStandard {
        match self {
            Self::DvbS | Self::DvbS2 => BroadcastStandard::Satellite,
            Self::DvbC | Self::DvbC2 => BroadcastStandard::Cable,
            Self::DvbT | Self::DvbT2 => BroadcastStandard::Terrestrial,
        }
    }
}

impl FromStr for ModulationSystem {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dvbs" => Ok(Self::DvbS),
            "dvbs2" => Ok(Self::DvbS2),
            "dvbc" => Ok(Self::DvbC),
            "dvbc2" => Ok(Self::DvbC2),
            "dvbt" => Ok(Self::DvbT),
            "dvbt2" => Ok(Self::DvbT2),
            other => Err(ParseError::InvalidValue(format!("unknown msys: {}", other))),
        }
    }
}

/// Flat set of SAT>IP tuning parameters.
///
/// Values are kept as the server expects them on the wire; an empty value is
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuningParams {
    pub source: Option<String>,
    pub front_end: Option<String>,
    pub frequency: Option<String>,
    pub symbol_rate: Option<String>,
    pub polarization: Option<String>,
    pub roll_off: Option<String>,
    pub modulation_system: Option<String>,
    pub modulation_type: Option<String>,
    pub pilot_tones: Option<String>,
    pub fec: Option<String>,
    pub pids: Option<String>,
    pub bandwidth: Option<String>,
    pub guard_interval: Option<String>,
    pub transmission_mode: Option<String>,
    /// Parameters without a dedicated field, in input order.
    pub extra: Vec<(String, String)>,
}

const DVBS_LAYOUT: &[&str] = &["src", "freq", "pol", "msys", "sr", "fec", "mtype", "pids"];
const DVBS2_LAYOUT: &[&str] = &["src", "freq", "pol", "msys", "sr", "pids"];
const DVBC_LAYOUT: &[&str] = &["freq", "msys", "sr", "mtype", "pids"];
const DVBT_LAYOUT: &[&str] = &["freq", "bw", "msys", "tmode", "mtype", "gi", "fec", "pids"];

/// Canonical key order used when no standard-specific layout applies.
const CANONICAL_KEYS: [&str; 14] = [
    "src", "fe", "freq", "bw", "pol", "ro", "msys", "tmode", "mtype", "plts", "sr", "gi", "fec",
    "pids",
];

impl TuningParams {
    /// Parse a query string, with or without a leading `rtsp://host/?` part.
    pub fn parse(input: &str) -> Self {
        let query = match input.split_once('?') {
            Some((_, q)) => q,
            None => input,
        };
        Self::from_pairs(query.split('&'))
    }

    /// Build from `key=value` fragments. Fragments without `=` are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut params = Self::default();
        for pair in pairs {
            let pair = pair.trim();
            if let Some((key, value)) = pair.split_once('=') {
                params.set(key.trim(), value.trim());
            }
        }
        params
    }

    /// Set a parameter by its wire key.
    pub fn set(&mut self, key: &str, value: &str) {
        let value = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
        let key_lower = key.to_ascii_lowercase();
        match self.slot_mut(&key_lower) {
            Some(slot) => *slot = value,
            None => {
                if let Some(value) = value {
                    self.extra.retain(|(k, _)| k != &key_lower);
                    self.extra.push((key_lower, value));
                }
            }
        }
    }

    /// Get a parameter by its wire key.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key_lower = key.to_ascii_lowercase();
        match self.slot(&key_lower) {
            Some(slot) => slot.as_deref(),
            None => self
                .extra
                .iter()
                .find(|(k, _)| *k == key_lower)
                .map(|(_, v)| v.as_str()),
        }
    }

    fn slot(&self, key: &str) -> Option<&Option<String>> {
        Some(match key {
            "src" => &self.source,
            "fe" => &self.front_end,
            "freq" => &self.frequency,
            "sr" => &self.symbol_rate,
            "pol" => &self.polarization,
            "ro" => &self.roll_off,
            "msys" => &self.modulation_system,
            "mtype" => &self.modulation_type,
            "plts" => &self.pilot_tones,
            "fec" => &self.fec,
            "pids" => &self.pids,
            "bw" => &self.bandwidth,
            "gi" => &self.guard_interval,
            "tmode" => &self.transmission_mode,
            _ => return None,
        })
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut Option<String>> {
        Some(match key {
            "src" => &mut self.source,
            "fe" => &mut self.front_end,
            "freq" => &mut self.frequency,
            "sr" => &mut self.symbol_rate,
            "pol" => &mut self.polarization,
            "ro" => &mut self.roll_off,
            "msys" => &mut self.modulation_system,
            "mtype" => &mut self.modulation_type,
            "plts" => &mut self.pilot_tones,
            "fec" => &mut self.fec,
            "pids" => &mut self.pids,
            "bw" => &mut self.bandwidth,
            "gi" => &mut self.guard_interval,
            "tmode" => &mut self.transmission_mode,
            _ => return None,
        })
    }

    /// The delivery system, if `msys` names a known one.
    pub fn system(&self) -> Option<ModulationSystem> {
        self.modulation_system.as_deref()?.parse().ok()
    }

    /// Keys emitted for a given delivery system, in wire order.
    pub fn layout(system: ModulationSystem) -> &'static [&'static str] {
        match system {
            ModulationSystem::DvbS => DVBS_LAYOUT,
            ModulationSystem::DvbS2 => DVBS2_LAYOUT,
            ModulationSystem::DvbC | ModulationSystem::DvbC2 => DVBC_LAYOUT,
            ModulationSystem::DvbT | ModulationSystem::DvbT2 => DVBT_LAYOUT,
        }
    }

    /// Serialize to the query string sent with SETUP and PLAY.
    ///
    /// Known systems use their fixed layout (absent values become `key=`).
    /// Otherwise every present parameter is written in canonical order.
    pub fn to_query(&self) -> String {
        match self.system() {
            Some(system) => Self::layout(system)
                .iter()
                .map(|key| format!("{}={}", key, self.get(key).unwrap_or("")))
                .collect::<Vec<_>>()
                .join("&"),
            None => CANONICAL_KEYS
                .iter()
                .filter_map(|key| self.get(key).map(|v| format!("{}={}", key, v)))
                .chain(self.extra.iter().map(|(k, v)| format!("{}={}", k, v)))
                .collect::<Vec<_>>()
                .join("&"),
        }
    }
}

impl fmt::Display for TuningParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

impl FromStr for TuningParams {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params = Self::parse(s);
        if params.frequency.is_none() {
            return Err(ParseError::MissingField("freq"));
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parsing {
        use super::*;

        #[test]
        fn parses_bare_query() {
            let params = TuningParams::parse("freq=12344&pol=h&msys=dvbs2&sr=22000");
            assert_eq!(params.frequency.as_deref(), Some("12344"));
            assert_eq!(params.polarization.as_deref(), Some("h"));
            assert_eq!(params.modulation_system.as_deref(), Some("dvbs2"));
            assert_eq!(params.symbol_rate.as_deref(), Some("22000"));
            assert_eq!(params.system(), Some(ModulationSystem::DvbS2));
        }

        #[test]
        fn strips_rtsp_prefix() {
            let params =
                TuningParams::parse("rtsp://192.168.1.20/?src=1&freq=11494&pol=h&msys=dvbs&sr=22000");
            assert_eq!(params.source.as_deref(), Some("1"));
            assert_eq!(params.frequency.as_deref(), Some("11494"));
        }

        #[test]
        fn src_and_sr_do_not_collide() {
            let params = TuningParams::parse("src=1&sr=27500");
            assert_eq!(params.source.as_deref(), Some("1"));
            assert_eq!(params.symbol_rate.as_deref(), Some("27500"));
        }

        #[test]
        fn empty_value_is_absent() {
            let params = TuningParams::parse("src=&freq=10744");
            assert!(params.source.is_none());
        }

        #[test]
        fn unknown_keys_are_kept() {
            let params = TuningParams::parse("freq=474&plp=0&t2id=1");
            assert_eq!(params.get("plp"), Some("0"));
            assert_eq!(params.get("T2ID"), Some("1"));
        }

        #[test]
        fn from_str_requires_frequency() {
            assert!("msys=dvbs2".parse::<TuningParams>().is_err());
            assert!("freq=1".parse::<TuningParams>().is_ok());
        }

        #[test]
        fn modulation_system_from_str() {
            assert_eq!("DVBT2".parse::<ModulationSystem>().unwrap(), ModulationSystem::DvbT2);
            assert!("atsc".parse::<ModulationSystem>().is_err());
            assert_eq!(ModulationSystem::DvbC.standard(), BroadcastStandard::Cable);
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn dvbs2_layout() {
            let params = TuningParams::parse(
                "src=1&freq=11494&pol=h&ro=0.35&msys=dvbs2&mtype=8psk&plts=on&sr=22000&fec=23&pids=0,17,18",
            );
            assert_eq!(
                params.to_query(),
                "src=1&freq=11494&pol=h&msys=dvbs2&sr=22000&pids=0,17,18"
            );
        }

        #[test]
        fn dvbs_layout() {
            let params = TuningParams::parse(
                "src=1&freq=12188&pol=h&msys=dvbs&sr=27500&fec=34&mtype=qpsk&pids=0",
            );
            assert_eq!(
                params.to_query(),
                "src=1&freq=12188&pol=h&msys=dvbs&sr=27500&fec=34&mtype=qpsk&pids=0"
            );
        }

        #[test]
        fn dvbc_layout() {
            let params = TuningParams::parse("freq=346&msys=dvbc&sr=6900&mtype=256qam&pids=0,16");
            assert_eq!(params.to_query(), "freq=346&msys=dvbc&sr=6900&mtype=256qam&pids=0,16");
        }

        #[test]
        fn dvbt2_layout() {
            let params = TuningParams::parse(
                "freq=514&bw=8&msys=dvbt2&tmode=32k&mtype=256qam&gi=1128&fec=23&pids=0",
            );
            assert_eq!(
                params.to_query(),
                "freq=514&bw=8&msys=dvbt2&tmode=32k&mtype=256qam&gi=1128&fec=23&pids=0"
            );
        }

        #[test]
        fn missing_layout_value_is_written_empty() {
            let params = TuningParams::parse("freq=12344&pol=h&msys=dvbs2&sr=22000");
            assert_eq!(
                params.to_query(),
                "src=&freq=12344&pol=h&msys=dvbs2&sr=22000&pids="
            );
        }

        #[test]
        fn unknown_system_writes_everything_present() {
            let params = TuningParams::parse("pids=0&freq=600&plp=1");
            assert_eq!(params.to_query(), "freq=600&pids=0&plp=1");
        }

        #[test]
        fn reparse_preserves_layout_fields() {
            let systems = [
                "src=1&freq=11494&pol=h&msys=dvbs&sr=22000&fec=56&mtype=qpsk&pids=0",
                "src=2&freq=10744&pol=v&msys=dvbs2&sr=22000&pids=0,16",
                "freq=346&msys=dvbc2&sr=6900&mtype=256qam&pids=0",
                "freq=482&bw=8&msys=dvbt&tmode=8k&mtype=64qam&gi=14&fec=23&pids=0",
            ];
            for query in systems {
                let original = TuningParams::parse(query);
                let reparsed = TuningParams::parse(&original.to_query());
                let system = original.system().unwrap();
                for key in TuningParams::layout(system) {
                    assert_eq!(original.get(key), reparsed.get(key), "{} in {}", key, query);
                }
            }
        }
    }
}
