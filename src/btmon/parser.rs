//! Error tolerant monitor stream parser
//!
//! [`BtmonParser`] accepts arbitrarily chunked input and turns it into
//! [`Record`]s. Bytes that cannot be decoded are skipped one at a time until a
//! structurally valid header shows up again; the whole skipped run is reported
//! as a single [`InvalidPacket`].

use tracing::{debug, trace};

use super::format::{FrameHeader, HEADER_SIZE, InvalidPacket, Record, decode_frame};

/// Streaming decoder for the monitor byte stream.
///
/// ```rust
/// use bt_monitor_rtt::btmon::{BtmonParser, Record};
///
/// let mut parser = BtmonParser::new();
/// // data_len=10, opcode=3, reserved=0, hdr_len=5, timestamp 20000 ticks
/// parser.feed(&[10, 0, 3, 0, 0, 5, 8, 0x20, 0x4E, 0, 0, 1, 2, 3, 4]);
///
/// let records = parser.drain();
/// assert_eq!(records.len(), 1);
/// match &records[0] {
///     Record::Packet(packet) => assert_eq!(packet.timestamp, 2.0),
///     Record::Invalid(_) => unreachable!(),
/// }
/// ```
#[derive(Debug, Default)]
pub struct BtmonParser {
    buffer: Vec<u8>,
    total_offset: u64,
    pending: Vec<Record>,
    resyncing: bool,
}

impl BtmonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute stream offset of the first unconsumed byte.
    pub fn total_offset(&self) -> u64 {
        self.total_offset
    }

    /// Number of received bytes still waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the parser is currently skipping over corrupted input.
    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    /// Append `data` and decode as many records as possible.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        let mut offset = 0;
        while self.buffer.len() - offset >= HEADER_SIZE {
            if self.resyncing {
                if FrameHeader::read_valid(&self.buffer[offset..]).is_none() {
                    offset += 1;
                    self.extend_invalid(offset);
                    continue;
                }
                let at = self.absolute(offset);
                debug!(offset = at, "Monitor stream resynchronized");
                if let Some(Record::Invalid(invalid)) = self.pending.last_mut() {
                    invalid.end_offset = at;
                }
                self.resyncing = false;
            }

            match decode_frame(&self.buffer[offset..]) {
                Ok(Some((packet, frame_len))) => {
                    trace!(
                        offset = self.absolute(offset),
                        opcode = packet.opcode,
                        len = packet.payload.len(),
                        "Frame decoded"
                    );
                    self.pending.push(Record::Packet(packet));
                    offset += frame_len;
                }
                Ok(None) => break,
                Err(corruption) => {
                    let at = self.absolute(offset);
                    if !matches!(self.pending.last(), Some(Record::Invalid(_))) {
                        debug!(offset = at, %corruption, "Corrupted monitor stream");
                        self.pending.push(Record::Invalid(InvalidPacket::starting_at(at)));
                    }
                    offset += 1;
                    self.extend_invalid(offset);
                    self.resyncing = true;
                }
            }
        }

        if offset > 0 {
            self.buffer.drain(..offset);
            self.total_offset += offset as u64;
        }
    }

    /// Remove and return every record that will not change anymore.
    ///
    /// A trailing [`InvalidPacket`] stays behind: the corrupted run it
    /// describes may still grow with the next input chunk.
    pub fn drain(&mut self) -> Vec<Record> {
        let keep = usize::from(matches!(self.pending.last(), Some(Record::Invalid(_))));
        let split = self.pending.len() - keep;
        let held = self.pending.split_off(split);
        std::mem::replace(&mut self.pending, held)
    }

    fn absolute(&self, offset: usize) -> u64 {
        self.total_offset + offset as u64
    }

    fn extend_invalid(&mut self, offset: usize) {
        let end = self.absolute(offset);
        if let Some(Record::Invalid(invalid)) = self.pending.last_mut() {
            invalid.end_offset = invalid.end_offset.max(end);
        }
    }
}
