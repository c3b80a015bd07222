//! Test helpers for building monitor frames and reading back capture output
//!
//! Used by unit tests and benchmarks across the crate.

#![cfg(any(test, feature = "benchmark"))]

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::btmon::format::{DropCategory, EXT_TS32, HEADER_SIZE};
use crate::pcap::encoder::{GLOBAL_HEADER, PSEUDO_HEADER_SIZE, RECORD_HEADER_SIZE};
use crate::pipe::Pipe;
use crate::{CaptureError, Result};

/// Builder of one monitor stream frame.
///
/// Extended header fields are written in call order, so tests can produce
/// frames with repeated or missing fields.
#[derive(Debug, Clone)]
pub struct MonitorFrame {
    opcode: u16,
    ext: Vec<u8>,
    payload: Vec<u8>,
}

impl MonitorFrame {
    pub fn new(opcode: u16) -> Self {
        Self { opcode, ext: Vec::new(), payload: Vec::new() }
    }

    /// Append a timestamp field.
    pub fn ticks(mut self, ticks: u32) -> Self {
        self.ext.push(EXT_TS32);
        self.ext.extend_from_slice(&ticks.to_le_bytes());
        self
    }

    /// Append a drop counter field.
    pub fn drop_field(mut self, category: DropCategory, count: u8) -> Self {
        self.ext.push(category.code());
        self.ext.push(count);
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let data_len = (4 + self.ext.len() + self.payload.len()) as u16;
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.ext.len() + self.payload.len());
        frame.extend_from_slice(&data_len.to_le_bytes());
        frame.extend_from_slice(&self.opcode.to_le_bytes());
        frame.push(0);
        frame.push(self.ext.len() as u8);
        frame.extend_from_slice(&self.ext);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Failure to read back a capture stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("capture shorter than the global header")]
    MissingHeader,
    #[error("unexpected global header")]
    BadHeader,
    #[error("record at offset {offset} is truncated")]
    Truncated { offset: usize },
    #[error("record at offset {offset} has mismatched lengths")]
    LengthMismatch { offset: usize },
}

/// A decoded capture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapCapture {
    pub header: [u8; 24],
    pub records: Vec<PcapRecord>,
}

/// One decoded capture record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub captured_len: u32,
    pub original_len: u32,
    pub adapter_id: u16,
    pub opcode: u16,
    pub payload: Vec<u8>,
}

/// Contents of a user logging record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub priority: u8,
    pub ident: String,
    pub message: String,
}

impl PcapRecord {
    /// Decode the payload as a user logging record.
    pub fn log(&self) -> Option<LogRecord> {
        if self.opcode != crate::btmon::opcode::USER_LOGGING {
            return None;
        }
        let (&priority, rest) = self.payload.split_first()?;
        let (&ident_len, rest) = rest.split_first()?;
        let ident_len = ident_len as usize;
        if ident_len == 0 || rest.len() < ident_len || rest[ident_len - 1] != 0 {
            return None;
        }
        let ident = String::from_utf8_lossy(&rest[..ident_len - 1]).into_owned();
        let message = rest[ident_len..].strip_suffix(&[0]).unwrap_or(&rest[ident_len..]);
        Some(LogRecord { priority, ident, message: String::from_utf8_lossy(message).into_owned() })
    }
}

/// Decode a complete capture stream, global header first.
pub fn decode_capture(data: &[u8]) -> std::result::Result<PcapCapture, DecodeError> {
    let header: [u8; 24] = data
        .get(..GLOBAL_HEADER.len())
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::MissingHeader)?;
    if header != GLOBAL_HEADER {
        return Err(DecodeError::BadHeader);
    }

    let mut records = Vec::new();
    let mut offset = GLOBAL_HEADER.len();
    while offset < data.len() {
        let fixed = data
            .get(offset..offset + RECORD_HEADER_SIZE + PSEUDO_HEADER_SIZE)
            .ok_or(DecodeError::Truncated { offset })?;
        let word = |at: usize| u32::from_le_bytes([fixed[at], fixed[at + 1], fixed[at + 2], fixed[at + 3]]);
        let captured_len = word(8);
        let original_len = word(12);
        if captured_len != original_len || (captured_len as usize) < PSEUDO_HEADER_SIZE {
            return Err(DecodeError::LengthMismatch { offset });
        }
        let end = offset + RECORD_HEADER_SIZE + captured_len as usize;
        let payload = data
            .get(offset + RECORD_HEADER_SIZE + PSEUDO_HEADER_SIZE..end)
            .ok_or(DecodeError::Truncated { offset })?;
        records.push(PcapRecord {
            ts_sec: word(0),
            ts_usec: word(4),
            captured_len,
            original_len,
            adapter_id: u16::from_be_bytes([fixed[16], fixed[17]]),
            opcode: u16::from_be_bytes([fixed[18], fixed[19]]),
            payload: payload.to_vec(),
        });
        offset = end;
    }
    Ok(PcapCapture { header, records })
}

/// What the next [`ScriptedPipe::read1`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedRead {
    Data(Vec<u8>),
    Eof,
    Broken,
    Interrupted,
}

#[derive(Debug, Default)]
struct ScriptState {
    name: Option<String>,
    open: bool,
    reads: VecDeque<ScriptedRead>,
    written: Vec<u8>,
    fail_writes: bool,
    unwriteable: bool,
    closes: usize,
    flushes: usize,
}

/// In-memory [`Pipe`] driven by a script of reads.
///
/// Clones share state, so a test keeps one clone to inspect what the code
/// under test wrote. Reads past the end of the script report end of stream.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPipe {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&self, read: ScriptedRead) -> &Self {
        self.state.lock().reads.push_back(read);
        self
    }

    pub fn push_data(&self, data: &[u8]) -> &Self {
        self.push_read(ScriptedRead::Data(data.to_vec()))
    }

    /// Make every following write fail with a broken pipe.
    pub fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    /// Make [`Pipe::writeable`] report a departed reader.
    pub fn set_unwriteable(&self) {
        self.state.lock().unwriteable = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Pipe for ScriptedPipe {
    fn create(&mut self, _write: bool) -> Result<String> {
        let mut state = self.state.lock();
        let name = "scripted".to_string();
        state.name = Some(name.clone());
        Ok(name)
    }

    fn open(&mut self, _write: bool, name: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(name) = name {
            state.name = Some(name.to_string());
        }
        state.open = true;
        Ok(())
    }

    fn name(&self) -> Option<&str> {
        None
    }

    fn is_closed(&self) -> bool {
        !self.state.lock().open
    }

    fn read1(&mut self, max_size: usize) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        match state.reads.pop_front() {
            Some(ScriptedRead::Data(mut data)) => {
                if data.len() > max_size {
                    let rest = data.split_off(max_size);
                    state.reads.push_front(ScriptedRead::Data(rest));
                }
                Ok(Some(data))
            }
            Some(ScriptedRead::Eof) | None => Ok(None),
            Some(ScriptedRead::Broken) => Err(CaptureError::broken_pipe("scripted")),
            Some(ScriptedRead::Interrupted) => Err(CaptureError::pipe_error(
                "read",
                "scripted",
                io::Error::new(io::ErrorKind::Interrupted, "interrupted"),
            )),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(CaptureError::broken_pipe("scripted"));
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn writeable(&self) -> bool {
        !self.state.lock().unwriteable
    }

    fn flush(&mut self) -> Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btmon::opcode;

    #[test]
    fn frame_builder_layout() {
        let frame = MonitorFrame::new(opcode::EVENT_PKT).ticks(20_000).payload(&[0xAA; 4]).encode();
        assert_eq!(frame, vec![10, 0, 3, 0, 0, 5, 8, 0x20, 0x4E, 0, 0, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn decode_rejects_foreign_header() {
        assert_eq!(decode_capture(&[0; 4]), Err(DecodeError::MissingHeader));
        assert_eq!(decode_capture(&[0; 24]), Err(DecodeError::BadHeader));
    }

    #[test]
    fn scripted_pipe_splits_long_reads() {
        let mut pipe = ScriptedPipe::new();
        pipe.push_data(&[1, 2, 3]);
        assert_eq!(pipe.read1(2).unwrap(), Some(vec![1, 2]));
        assert_eq!(pipe.read1(2).unwrap(), Some(vec![3]));
        assert_eq!(pipe.read1(2).unwrap(), None);
    }
}
