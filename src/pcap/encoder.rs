//! pcap stream encoder
//!
//! Produces a classic little-endian pcap stream with link type 254
//! (`DLT_BLUETOOTH_LINUX_MONITOR`). Each record carries a 4-byte big-endian
//! pseudo header (adapter index, opcode) in front of the monitor payload,
//! which is what the analysis tool's dissector expects for this link type.
//!
//! Besides captured packets the encoder synthesizes `USER_LOGGING` records for
//! drop counters, corrupted input spans and plugin notes, so these show up
//! inline in the capture.

use tracing::trace;

use crate::btmon::format::{DropCategory, InvalidPacket, Packet, Record, opcode, priority};

/// Global header: magic, version 2.4, thiszone 0, sigfigs 0, snaplen 0x40000,
/// link type 254.
pub const GLOBAL_HEADER: [u8; 24] = [
    0xD4, 0xC3, 0xB2, 0xA1, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x04, 0x00, 0xFE, 0x00, 0x00, 0x00,
];

/// Per-record header size.
pub const RECORD_HEADER_SIZE: usize = 16;
/// Size of the adapter index and opcode pseudo header.
pub const PSEUDO_HEADER_SIZE: usize = 4;
/// Adapter index written into every record.
pub const ADAPTER_ID: u16 = 0;

/// Identifier of notes generated by the bridge itself.
pub const PLUGIN_IDENT: &str = "bt_hci_rtt plugin";
/// Prefix of every note generated by the bridge itself.
pub const PLUGIN_NOTE_PREFIX: &str = "CAPTURE PLUGIN NOTE: ";
/// Identifier of system notes converted to log records.
pub const SYSTEM_NOTE_IDENT: &str = "SYSTEM NOTE";

/// Encoder options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcapOptions {
    /// Re-tag `SYSTEM_NOTE` packets as `USER_LOGGING` records.
    pub note_to_log: bool,
}

/// Buffered pcap encoder.
///
/// The global header is queued by the constructor, so the first
/// [`take_output`](Self::take_output) always starts with it.
#[derive(Debug)]
pub struct PcapEncoder {
    options: PcapOptions,
    output: Vec<u8>,
    last_timestamp: f64,
}

impl PcapEncoder {
    pub fn new(options: PcapOptions) -> Self {
        Self { options, output: GLOBAL_HEADER.to_vec(), last_timestamp: 0.0 }
    }

    /// Timestamp of the last captured packet, used for records without one.
    pub fn last_timestamp(&self) -> f64 {
        self.last_timestamp
    }

    /// Queue the encoding of one parser record.
    pub fn generate(&mut self, record: &Record) {
        match record {
            Record::Packet(packet) => self.generate_packet(packet),
            Record::Invalid(invalid) => self.generate_invalid(invalid),
        }
    }

    /// Queue a plugin note at the timestamp of the last captured packet.
    pub fn log_message(&mut self, message: &str) {
        self.generate_plugin_note(self.last_timestamp, message);
    }

    /// Take everything queued so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Whether there is queued output.
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    fn generate_packet(&mut self, packet: &Packet) {
        for (index, count) in packet.nonzero_drops() {
            let name = u8::try_from(index)
                .ok()
                .and_then(DropCategory::from_code)
                .map_or("Some", DropCategory::name);
            self.generate_plugin_note(
                packet.timestamp,
                &format!("{} packets dropped, count {}", name, count),
            );
        }

        if packet.opcode == opcode::SYSTEM_NOTE && self.options.note_to_log {
            let mut payload = log_header(priority::NOTICE, SYSTEM_NOTE_IDENT);
            payload.extend_from_slice(&packet.payload);
            if packet.payload.last() != Some(&0) {
                payload.push(0);
            }
            self.write_record(packet.timestamp, opcode::USER_LOGGING, &payload);
        } else {
            self.write_record(packet.timestamp, packet.opcode, &packet.payload);
        }
        self.last_timestamp = packet.timestamp;
    }

    fn generate_invalid(&mut self, invalid: &InvalidPacket) {
        self.generate_plugin_note(
            self.last_timestamp,
            &format!(
                "Corrupted input detected from offset {} to {}",
                invalid.start_offset, invalid.end_offset
            ),
        );
    }

    fn generate_plugin_note(&mut self, timestamp: f64, message: &str) {
        let mut payload = log_header(priority::EMERG, PLUGIN_IDENT);
        payload.extend_from_slice(PLUGIN_NOTE_PREFIX.as_bytes());
        payload.extend_from_slice(message.as_bytes());
        payload.push(0);
        self.write_record(timestamp, opcode::USER_LOGGING, &payload);
    }

    fn write_record(&mut self, timestamp: f64, opcode: u16, payload: &[u8]) {
        let (sec, usec) = split_timestamp(timestamp);
        let size = (PSEUDO_HEADER_SIZE + payload.len()) as u32;
        trace!(opcode, size, sec, usec, "Encoding pcap record");

        self.output.reserve(RECORD_HEADER_SIZE + size as usize);
        self.output.extend_from_slice(&sec.to_le_bytes());
        self.output.extend_from_slice(&usec.to_le_bytes());
        self.output.extend_from_slice(&size.to_le_bytes());
        self.output.extend_from_slice(&size.to_le_bytes());
        self.output.extend_from_slice(&ADAPTER_ID.to_be_bytes());
        self.output.extend_from_slice(&opcode.to_be_bytes());
        self.output.extend_from_slice(payload);
    }
}

impl Default for PcapEncoder {
    fn default() -> Self {
        Self::new(PcapOptions::default())
    }
}

/// `USER_LOGGING` payload prefix: priority, ident length, NUL-terminated ident.
fn log_header(priority: u8, ident: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ident.len() + 3);
    payload.push(priority);
    payload.push((ident.len() + 1) as u8);
    payload.extend_from_slice(ident.as_bytes());
    payload.push(0);
    payload
}

/// Split seconds into whole seconds and microseconds, both rounded down.
pub fn split_timestamp(timestamp: f64) -> (u32, u32) {
    let sec = timestamp.floor();
    let usec = ((timestamp - sec) * 1_000_000.0).floor();
    (sec as u32, usec as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btmon::format::DROP_SLOTS;
    use crate::test_utils::decode_capture;

    fn packet(opcode: u16, timestamp: f64, payload: &[u8]) -> Packet {
        Packet { opcode, timestamp, drops: None, payload: payload.to_vec() }
    }

    #[test]
    fn global_header_is_emitted_once() {
        let mut encoder = PcapEncoder::default();
        assert_eq!(encoder.take_output(), GLOBAL_HEADER.to_vec());
        assert!(encoder.take_output().is_empty());
        assert!(!encoder.has_output());
    }

    #[test]
    fn packet_record_layout() {
        let mut encoder = PcapEncoder::default();
        encoder.take_output();
        encoder.generate(&Record::Packet(packet(opcode::EVENT_PKT, 2.5, &[0xAA, 0xBB])));

        assert_eq!(
            encoder.take_output(),
            vec![
                2, 0, 0, 0, // sec
                0x20, 0xA1, 0x07, 0, // usec 500000
                6, 0, 0, 0, // captured
                6, 0, 0, 0, // original
                0, 0, // adapter
                0, 3, // opcode
                0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn drops_are_reported_before_packet() {
        let mut drops = [0u32; DROP_SLOTS];
        drops[DropCategory::Event.code() as usize] = 3;
        drops[DropCategory::ScoTx.code() as usize] = 1;
        let mut encoder = PcapEncoder::default();
        encoder.generate(&Record::Packet(Packet { drops: Some(drops), ..packet(2, 7.0, &[1]) }));

        let capture = decode_capture(&encoder.take_output()).unwrap();
        assert_eq!(capture.records.len(), 3);

        let first = capture.records[0].log().unwrap();
        assert_eq!(first.priority, priority::EMERG);
        assert_eq!(first.ident, PLUGIN_IDENT);
        assert_eq!(first.message, "CAPTURE PLUGIN NOTE: EVENT packets dropped, count 3");
        assert_eq!(
            capture.records[1].log().unwrap().message,
            "CAPTURE PLUGIN NOTE: SCO_TX packets dropped, count 1"
        );
        assert_eq!(capture.records[0].ts_sec, 7);
        assert_eq!(capture.records[2].opcode, 2);
    }

    #[test]
    fn invalid_packet_uses_last_timestamp() {
        let mut encoder = PcapEncoder::default();
        encoder.generate(&Record::Invalid(InvalidPacket { start_offset: 0, end_offset: 4 }));
        encoder.generate(&Record::Packet(packet(3, 12.25, &[])));
        encoder.generate(&Record::Invalid(InvalidPacket { start_offset: 20, end_offset: 31 }));

        let capture = decode_capture(&encoder.take_output()).unwrap();
        let records = capture.records;
        assert_eq!(records[0].ts_sec, 0);
        assert_eq!(
            records[0].log().unwrap().message,
            "CAPTURE PLUGIN NOTE: Corrupted input detected from offset 0 to 4"
        );
        assert_eq!((records[2].ts_sec, records[2].ts_usec), (12, 250_000));
        assert!(records[2].log().unwrap().message.ends_with("from offset 20 to 31"));
    }

    #[test]
    fn system_note_is_converted_when_enabled() {
        let mut encoder = PcapEncoder::new(PcapOptions { note_to_log: true });
        encoder.generate(&Record::Packet(packet(opcode::SYSTEM_NOTE, 1.0, b"hello")));
        encoder.generate(&Record::Packet(packet(opcode::SYSTEM_NOTE, 1.0, b"done\0")));

        let capture = decode_capture(&encoder.take_output()).unwrap();
        let first = &capture.records[0];
        assert_eq!(first.opcode, opcode::USER_LOGGING);
        assert_eq!(first.payload, b"\x05\x0cSYSTEM NOTE\0hello\0".to_vec());
        assert_eq!(capture.records[1].payload, b"\x05\x0cSYSTEM NOTE\0done\0".to_vec());
    }

    #[test]
    fn system_note_with_binary_payload_passes_through() {
        let mut encoder = PcapEncoder::new(PcapOptions { note_to_log: true });
        encoder.generate(&Record::Packet(packet(opcode::SYSTEM_NOTE, 1.0, &[0xFF, 0xFE])));

        let capture = decode_capture(&encoder.take_output()).unwrap();
        assert!(capture.records[0].payload.ends_with(&[0xFF, 0xFE, 0]));
    }

    #[test]
    fn system_note_is_kept_when_disabled() {
        let mut encoder = PcapEncoder::default();
        encoder.generate(&Record::Packet(packet(opcode::SYSTEM_NOTE, 1.0, b"hello")));

        let capture = decode_capture(&encoder.take_output()).unwrap();
        assert_eq!(capture.records[0].opcode, opcode::SYSTEM_NOTE);
        assert_eq!(capture.records[0].payload, b"hello".to_vec());
    }

    #[test]
    fn log_message_is_a_plugin_note() {
        let mut encoder = PcapEncoder::default();
        encoder.log_message("JLinkRTTLogger exited unexpectedly.");

        let capture = decode_capture(&encoder.take_output()).unwrap();
        assert_eq!(
            capture.records[0].log().unwrap().message,
            "CAPTURE PLUGIN NOTE: JLinkRTTLogger exited unexpectedly."
        );
    }

    #[test]
    fn timestamp_split_rounds_down() {
        assert_eq!(split_timestamp(0.0), (0, 0));
        assert_eq!(split_timestamp(2.0), (2, 0));
        assert_eq!(split_timestamp(1.999_999_9), (1, 999_999));
        assert_eq!(split_timestamp(12.25), (12, 250_000));
    }
}
