//! RTCP packet decoding (RFC 3550 layouts, SAT>IP APP extension).
//!
//! A datagram carries one or more packets back to back. Each packet starts
//! with a 4-byte common header:
//! - Byte 0: version (2 bits), padding (1 bit), count (5 bits)
//! - Byte 1: packet type
//! - Bytes 2-3: length in 32-bit words minus one (big-endian)

use satip_core::error::{Error, RtcpError, Result};
use satip_core::ReceptionInfo;

/// RTCP packet types.
pub mod packet_types {
    pub const SENDER_REPORT: u8 = 200;
    pub const RECEIVER_REPORT: u8 = 201;
    pub const SOURCE_DESCRIPTION: u8 = 202;
    pub const BYE: u8 = 203;
    pub const APP: u8 = 204;
}

/// APP packet name used by SAT>IP servers for tuner status.
pub const SATIP_APP_NAME: &str = "SES1";

const HEADER_LEN: usize = 4;
const REPORT_BLOCK_LEN: usize = 24;

/// Common RTCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub version: u8,
    pub padding: bool,
    /// Report count, source count or APP subtype depending on the type.
    pub count: u8,
    pub packet_type: u8,
    /// Total packet length in bytes, header included.
    pub length: usize,
}

impl RtcpHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(truncated(0, HEADER_LEN, data.len()));
        }

        Ok(Self {
            version: (data[0] >> 6) & 0x03,
            padding: data[0] & 0x20 != 0,
            count: data[0] & 0x1F,
            packet_type: data[1],
            length: u16::from_be_bytes([data[2], data[3]]) as usize * 4 + 4,
        })
    }
}

/// Reception report block carried by sender and receiver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative number of packets lost.
    pub cumulative_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let block = slice(data, offset, REPORT_BLOCK_LEN)?;
        Ok(Self {
            ssrc: be_u32(block, 0),
            fraction_lost: block[4],
            cumulative_lost: u32::from_be_bytes([0, block[5], block[6], block[7]]),
            highest_sequence: be_u32(block, 8),
            jitter: be_u32(block, 12),
            last_sr: be_u32(block, 16),
            delay_since_last_sr: be_u32(block, 20),
        })
    }
}

/// Sender report (type 200).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub blocks: Vec<ReportBlock>,
}

/// Receiver report (type 201).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub blocks: Vec<ReportBlock>,
    /// Bytes after the report blocks.
    pub profile_extension: Vec<u8>,
}

/// One SDES item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: u8,
    pub text: String,
}

/// One SDES chunk: a source and its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

/// BYE packet (type 203).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

/// Application-defined packet (type 204).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPacket {
    pub subtype: u8,
    pub ssrc: u32,
    pub name: String,
    /// Application data following the name.
    pub data: Vec<u8>,
}

impl AppPacket {
    /// Text payload of the packet.
    ///
    /// `SES1` packets prefix the string with a 16-bit length after two
    /// reserved bytes; other packets are read as plain text.
    pub fn text(&self) -> String {
        if self.name == SATIP_APP_NAME && self.data.len() >= 4 {
            let declared = u16::from_be_bytes([self.data[2], self.data[3]]) as usize;
            let end = (4 + declared).min(self.data.len());
            return String::from_utf8_lossy(&self.data[4..end])
                .trim_end_matches('\0')
                .to_string();
        }
        String::from_utf8_lossy(&self.data)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Reception info from the embedded tuner status string.
    pub fn reception(&self) -> Option<ReceptionInfo> {
        ReceptionInfo::from_tuner_string(&self.text())
    }
}

/// Decoded RTCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Bye(Bye),
    App(AppPacket),
}

impl RtcpPacket {
    pub fn packet_type(&self) -> u8 {
        match self {
            Self::SenderReport(_) => packet_types::SENDER_REPORT,
            Self::ReceiverReport(_) => packet_types::RECEIVER_REPORT,
            Self::SourceDescription(_) => packet_types::SOURCE_DESCRIPTION,
            Self::Bye(_) => packet_types::BYE,
            Self::App(_) => packet_types::APP,
        }
    }

    /// Parse a single packet. `data` must hold exactly the declared length.
    ///
    /// Returns `Ok(None)` for packet types this decoder does not know.
    pub fn parse(header: &RtcpHeader, data: &[u8]) -> Result<Option<Self>> {
        let packet = match header.packet_type {
            packet_types::SENDER_REPORT => Self::SenderReport(parse_sender_report(header, data)?),
            packet_types::RECEIVER_REPORT => {
                Self::ReceiverReport(parse_receiver_report(header, data)?)
            }
            packet_types::SOURCE_DESCRIPTION => {
                Self::SourceDescription(parse_source_description(header, data)?)
            }
            packet_types::BYE => Self::Bye(parse_bye(header, data)?),
            packet_types::APP => Self::App(parse_app(header, data)?),
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }
}

fn parse_sender_report(header: &RtcpHeader, data: &[u8]) -> Result<SenderReport> {
    let fixed = slice(data, 0, 28)?;
    let mut blocks = Vec::with_capacity(header.count as usize);
    for i in 0..header.count as usize {
        blocks.push(ReportBlock::parse(data, 28 + i * REPORT_BLOCK_LEN)?);
    }

    Ok(SenderReport {
        ssrc: be_u32(fixed, 4),
        ntp_timestamp: (be_u32(fixed, 8) as u64) << 32 | be_u32(fixed, 12) as u64,
        rtp_timestamp: be_u32(fixed, 16),
        packet_count: be_u32(fixed, 20),
        octet_count: be_u32(fixed, 24),
        blocks,
    })
}

fn parse_receiver_report(header: &RtcpHeader, data: &[u8]) -> Result<ReceiverReport> {
    let ssrc = be_u32(slice(data, 0, 8)?, 4);
    let mut blocks = Vec::with_capacity(header.count as usize);
    for i in 0..header.count as usize {
        blocks.push(ReportBlock::parse(data, 8 + i * REPORT_BLOCK_LEN)?);
    }
    let extension_start = 8 + blocks.len() * REPORT_BLOCK_LEN;

    Ok(ReceiverReport {
        ssrc,
        blocks,
        profile_extension: data[extension_start..].to_vec(),
    })
}

fn parse_source_description(header: &RtcpHeader, data: &[u8]) -> Result<Vec<SdesChunk>> {
    let mut chunks = Vec::with_capacity(header.count as usize);
    let mut offset = HEADER_LEN;

    for _ in 0..header.count {
        let ssrc = be_u32(slice(data, offset, 4)?, 0);
        offset += 4;

        let mut items = Vec::new();
        loop {
            let item_type = slice(data, offset, 1)?[0];
            if item_type == 0 {
                offset += 1;
                break;
            }
            let len = slice(data, offset + 1, 1)?[0] as usize;
            let text = slice(data, offset + 2, len)?;
            items.push(SdesItem {
                item_type,
                text: String::from_utf8_lossy(text).to_string(),
            });
            offset += 2 + len;
        }

        // Chunks end on a 32-bit boundary.
        offset = (offset + 3) & !3;
        chunks.push(SdesChunk { ssrc, items });
    }

    Ok(chunks)
}

fn parse_bye(header: &RtcpHeader, data: &[u8]) -> Result<Bye> {
    let count = header.count as usize;
    let ids = slice(data, HEADER_LEN, count * 4)?;
    let sources = (0..count).map(|i| be_u32(ids, i * 4)).collect();

    let reason_at = HEADER_LEN + count * 4;
    let reason = match data.get(reason_at) {
        Some(&len) if len > 0 => {
            let text = slice(data, reason_at + 1, len as usize)?;
            Some(String::from_utf8_lossy(text).to_string())
        }
        _ => None,
    };

    Ok(Bye { sources, reason })
}

fn parse_app(header: &RtcpHeader, data: &[u8]) -> Result<AppPacket> {
    let fixed = slice(data, 0, 12)?;
    Ok(AppPacket {
        subtype: header.count,
        ssrc: be_u32(fixed, 4),
        name: String::from_utf8_lossy(&fixed[8..12]).to_string(),
        data: data[12..].to_vec(),
    })
}

/// Iterator over the packets of one datagram.
///
/// A packet whose body is malformed yields an error and the scan moves on
/// to the next packet. A truncated header or a length running past the
/// buffer yields an error and ends the scan.
///
/// [`RtcpPackets::saw_bye`] reports a type-203 header even when its body
/// failed to decode.
pub struct RtcpPackets<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
    saw_bye: bool,
}

impl<'a> RtcpPackets<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            done: false,
            saw_bye: false,
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether a BYE header has been walked so far.
    pub fn saw_bye(&self) -> bool {
        self.saw_bye
    }
}

impl<'a> Iterator for RtcpPackets<'a> {
    type Item = Result<RtcpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.offset >= self.data.len() {
                return None;
            }

            let rest = &self.data[self.offset..];
            let header = match RtcpHeader::parse(rest) {
                Ok(header) => header,
                Err(_) => {
                    self.done = true;
                    return Some(Err(truncated(self.offset, HEADER_LEN, rest.len())));
                }
            };
            self.saw_bye |= header.packet_type == packet_types::BYE;
            if header.length > rest.len() {
                self.done = true;
                return Some(Err(truncated(self.offset, header.length, rest.len())));
            }

            let start = self.offset;
            self.offset += header.length;
            match RtcpPacket::parse(&header, &rest[..header.length]) {
                Ok(Some(packet)) => return Some(Ok(packet)),
                Ok(None) => continue,
                Err(e) => return Some(Err(offset_error(e, start))),
            }
        }
    }
}

/// Decode every packet of a datagram, failing on the first error.
pub fn decode_all(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    RtcpPackets::new(data).collect()
}

fn truncated(offset: usize, needed: usize, available: usize) -> Error {
    RtcpError::Truncated {
        offset,
        needed,
        available,
    }
    .into()
}

/// Shift a packet-relative truncation error to datagram offsets.
fn offset_error(err: Error, base: usize) -> Error {
    match err {
        Error::Rtcp(RtcpError::Truncated {
            offset,
            needed,
            available,
        }) => truncated(base + offset, needed, available),
        other => other,
    }
}

/// Bounds-checked sub-slice.
fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    data.get(offset..offset + len)
        .ok_or_else(|| truncated(offset, len, data.len().saturating_sub(offset)))
}

/// Read a big-endian u32. Callers pass slices already bounds-checked by `slice`.
fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
