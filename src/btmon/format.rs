//! Monitor stream framing and record types
//!
//! The logger relays the BlueZ btmon-compatible monitor format. Every frame is
//! a 6-byte little-endian header followed by an extended header and payload:
//!
//! ```text
//! offset  size  field
//! 0       2     data_len   (counts everything after itself except 2 bytes: opcode..payload)
//! 2       2     opcode
//! 4       1     reserved   (always 0)
//! 5       1     hdr_len    (extended header length)
//! 6       n     extended header fields, n = hdr_len
//! 6+n     m     payload, m = data_len - 4 - hdr_len
//! ```
//!
//! Frames occupy `data_len + 2` bytes on the wire. Extended header fields are
//! a one-byte code followed by its value: code 8 carries a 32-bit timestamp in
//! 1/10000 s ticks, codes 1..=7 carry a one-byte drop count for a
//! [`DropCategory`].

use std::fmt;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 6;
/// Largest accepted `data_len`.
pub const MAX_PACKET_DATA_LENGTH: u16 = 300;
/// Smallest accepted `data_len`.
pub const MIN_PACKET_DATA_LENGTH: u16 = 4;
/// Largest accepted extended header length.
pub const EXT_HDR_MAX: u8 = 24;
/// Highest regular opcode.
pub const MAX_OPCODE: u16 = 20;
/// Timestamp tick frequency in Hz.
pub const TIMESTAMP_FREQUENCY: f64 = 10_000.0;

/// Extended header code of the 32-bit timestamp field.
pub const EXT_TS32: u8 = 8;
/// Lowest drop counter extended header code.
pub const EXT_DROPS_MIN: u8 = 1;
/// Highest drop counter extended header code.
pub const EXT_DROPS_MAX: u8 = 7;

/// Monitor opcodes the bridge knows about.
pub mod opcode {
    pub const NEW_INDEX: u16 = 0;
    pub const DEL_INDEX: u16 = 1;
    pub const COMMAND_PKT: u16 = 2;
    pub const EVENT_PKT: u16 = 3;
    pub const ACL_TX_PKT: u16 = 4;
    pub const ACL_RX_PKT: u16 = 5;
    pub const SCO_TX_PKT: u16 = 6;
    pub const SCO_RX_PKT: u16 = 7;
    pub const OPEN_INDEX: u16 = 8;
    pub const CLOSE_INDEX: u16 = 9;
    pub const INDEX_INFO: u16 = 10;
    pub const VENDOR_DIAG: u16 = 11;
    pub const SYSTEM_NOTE: u16 = 12;
    pub const USER_LOGGING: u16 = 13;
    pub const ISO_TX_PKT: u16 = 18;
    pub const ISO_RX_PKT: u16 = 19;
    pub const NOP: u16 = 255;
}

/// Syslog-style priorities used in user logging records.
pub mod priority {
    pub const EMERG: u8 = 0;
    pub const ALERT: u8 = 1;
    pub const CRIT: u8 = 2;
    pub const ERR: u8 = 3;
    pub const WARNING: u8 = 4;
    pub const NOTICE: u8 = 5;
    pub const INFO: u8 = 6;
    pub const DEBUG: u8 = 7;
}

/// Number of drop counter slots; index 0 is unused.
pub const DROP_SLOTS: usize = EXT_DROPS_MAX as usize + 1;

/// Per-category drop counters indexed by extended header code.
pub type Drops = [u32; DROP_SLOTS];

/// Packet class for which the logger reports dropped packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropCategory {
    Command = 1,
    Event = 2,
    AclRx = 3,
    AclTx = 4,
    ScoRx = 5,
    ScoTx = 6,
    Other = 7,
}

impl DropCategory {
    /// All categories in extended header code order.
    pub const ALL: [DropCategory; 7] = [
        DropCategory::Command,
        DropCategory::Event,
        DropCategory::AclRx,
        DropCategory::AclTx,
        DropCategory::ScoRx,
        DropCategory::ScoTx,
        DropCategory::Other,
    ];

    /// Category for an extended header code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code).checked_sub(1)?).copied()
    }

    /// Extended header code of this category.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Name used in drop log messages.
    pub fn name(self) -> &'static str {
        match self {
            DropCategory::Command => "COMMAND",
            DropCategory::Event => "EVENT",
            DropCategory::AclRx => "ACL_RX",
            DropCategory::AclTx => "ACL_TX",
            DropCategory::ScoRx => "SCO_RX",
            DropCategory::ScoTx => "SCO_TX",
            DropCategory::Other => "OTHER",
        }
    }
}

/// A successfully decoded monitor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub opcode: u16,
    /// Seconds since the logger's epoch.
    pub timestamp: f64,
    /// Drop counters indexed by extended header code, present only when the
    /// header carried at least one drop field.
    pub drops: Option<Drops>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Iterate over the nonzero drop counters in code order.
    pub fn nonzero_drops(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.drops
            .iter()
            .flat_map(|drops| drops.iter().copied().enumerate())
            .filter(|&(_, count)| count > 0)
    }
}

/// A contiguous span of undecodable bytes in absolute stream offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPacket {
    pub start_offset: u64,
    pub end_offset: u64,
}

impl InvalidPacket {
    /// A span that starts (and for now ends) at `offset`.
    pub fn starting_at(offset: u64) -> Self {
        Self { start_offset: offset, end_offset: offset }
    }

    /// Number of corrupted bytes covered.
    pub fn len(&self) -> u64 {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One item produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Packet(Packet),
    Invalid(InvalidPacket),
}

impl From<Packet> for Record {
    fn from(packet: Packet) -> Self {
        Record::Packet(packet)
    }
}

impl From<InvalidPacket> for Record {
    fn from(invalid: InvalidPacket) -> Self {
        Record::Invalid(invalid)
    }
}

/// The fixed part of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub data_len: u16,
    pub opcode: u16,
    pub reserved: u8,
    pub hdr_len: u8,
}

impl FrameHeader {
    /// Read a header from the start of `data` without validating it.
    pub fn read(data: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_SIZE] = data.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self {
            data_len: u16::from_le_bytes([bytes[0], bytes[1]]),
            opcode: u16::from_le_bytes([bytes[2], bytes[3]]),
            reserved: bytes[4],
            hdr_len: bytes[5],
        })
    }

    /// Read a header and return it only if it is structurally valid.
    pub fn read_valid(data: &[u8]) -> Option<Self> {
        Self::read(data).filter(Self::is_valid)
    }

    /// Structural validity check used both for parsing and resynchronization.
    pub fn is_valid(&self) -> bool {
        (MIN_PACKET_DATA_LENGTH..=MAX_PACKET_DATA_LENGTH).contains(&self.data_len)
            && (self.opcode <= MAX_OPCODE || self.opcode == opcode::NOP)
            && self.reserved == 0
            && self.hdr_len <= EXT_HDR_MAX
            && 4 + u16::from(self.hdr_len) <= self.data_len
    }

    /// Bytes the whole frame occupies on the wire.
    pub fn frame_len(&self) -> usize {
        usize::from(self.data_len) + 2
    }

    /// Payload bytes following the extended header.
    pub fn payload_len(&self) -> usize {
        usize::from(self.data_len) - 4 - usize::from(self.hdr_len)
    }
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    InvalidHeader,
    UnknownExtField(u8),
    TruncatedExtField(u8),
    MissingTimestamp,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::InvalidHeader => f.write_str("invalid frame header"),
            Corruption::UnknownExtField(code) => write!(f, "unknown extended header field {}", code),
            Corruption::TruncatedExtField(code) => {
                write!(f, "truncated extended header field {}", code)
            }
            Corruption::MissingTimestamp => f.write_str("missing timestamp field"),
        }
    }
}

/// Decoded extended header fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedHeader {
    pub timestamp: f64,
    pub drops: Option<Drops>,
}

impl ExtendedHeader {
    /// Decode the extended header fields of one frame.
    ///
    /// Repeated drop fields of one category add up; a repeated timestamp
    /// field overrides the earlier one.
    pub fn parse(mut fields: &[u8]) -> Result<Self, Corruption> {
        let mut ticks = None;
        let mut drops: Option<Drops> = None;

        while let Some(&code) = fields.first() {
            match code {
                EXT_TS32 => {
                    let value: [u8; 4] = fields
                        .get(1..5)
                        .and_then(|bytes| bytes.try_into().ok())
                        .ok_or(Corruption::TruncatedExtField(code))?;
                    ticks = Some(u32::from_le_bytes(value));
                    fields = &fields[5..];
                }
                EXT_DROPS_MIN..=EXT_DROPS_MAX => {
                    let count = *fields.get(1).ok_or(Corruption::TruncatedExtField(code))?;
                    let slots = drops.get_or_insert([0; DROP_SLOTS]);
                    slots[usize::from(code)] += u32::from(count);
                    fields = &fields[2..];
                }
                other => return Err(Corruption::UnknownExtField(other)),
            }
        }

        let ticks = ticks.ok_or(Corruption::MissingTimestamp)?;
        Ok(Self { timestamp: ticks_to_seconds(ticks), drops })
    }
}

/// Convert logger timestamp ticks to seconds.
pub fn ticks_to_seconds(ticks: u32) -> f64 {
    f64::from(ticks) / TIMESTAMP_FREQUENCY
}

/// Decode one complete frame from the start of `data`.
///
/// Returns `Ok(None)` when the header is valid but the frame is not complete
/// yet, and the frame length together with the packet otherwise.
pub fn decode_frame(data: &[u8]) -> Result<Option<(Packet, usize)>, Corruption> {
    let header = FrameHeader::read_valid(data).ok_or(Corruption::InvalidHeader)?;
    let frame_len = header.frame_len();
    if data.len() < frame_len {
        return Ok(None);
    }

    let fields_end = HEADER_SIZE + usize::from(header.hdr_len);
    let ext = ExtendedHeader::parse(&data[HEADER_SIZE..fields_end])?;
    let payload = data[fields_end..fields_end + header.payload_len()].to_vec();

    Ok(Some((
        Packet { opcode: header.opcode, timestamp: ext.timestamp, drops: ext.drops, payload },
        frame_len,
    )))
}
