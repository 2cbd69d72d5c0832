//! M3U channel lists.
//!
//! SAT>IP servers and users publish channels as extended M3U:
//!
//! ```text
//! #EXTM3U
//! #EXTINF:0,Das Erste HD
//! rtsp://192.168.1.20/?src=1&freq=11494&pol=h&msys=dvbs2&sr=22000&pids=0,5100
//! ```

use std::path::Path;

use crate::error::Result;
use crate::tuning::TuningParams;

/// A named playlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub params: TuningParams,
}

/// Ordered list of channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    pub channels: Vec<Channel>,
}

impl Playlist {
    /// Parse playlist text. Anything not starting with `#EXTM3U` is empty.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let mut channels = Vec::new();
        match lines.first() {
            Some(first) if first.eq_ignore_ascii_case("#EXTM3U") => {}
            _ => return Self { channels },
        }

        let mut name = String::new();
        let mut i = 1;
        while i < lines.len() {
            let line = lines[i];
            if starts_with_ignore_case(line, "#EXTINF") {
                let fields: Vec<&str> = line.split([':', ',']).collect();
                let mut params = TuningParams::default();
                if fields.len() > 2 {
                    name = fields[2].trim().to_string();
                    if let Some(next) = lines.get(i + 1) {
                        params = TuningParams::parse(next);
                        i += 1;
                    }
                }
                channels.push(Channel {
                    name: name.clone(),
                    params,
                });
            } else if let Some(rest) = line.strip_prefix("# ") {
                name = rest.trim().to_string();
            }
            i += 1;
        }

        Self { channels }
    }

    /// Load and parse a playlist file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Find a channel by case-insensitive name.
    pub fn find(&self, name: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}
