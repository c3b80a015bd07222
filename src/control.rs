//! Extcap control pipes.
//!
//! The analysis tool talks to the toolbar controls declared in
//! [`extcap::interfaces`](crate::extcap::interfaces) over two extra pipes.
//! Every message is framed as:
//!
//! ```text
//! 'T' | length: u24 big-endian (payload + 2) | control: u8 | command: u8 | payload
//! ```
//!
//! Both pipes are serviced by detached threads that never touch capture
//! state. Closing control-in is how the tool says the capture is over, so the
//! reader raises [`SignalReason::CaptureStop`] on end of stream.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::thread;
use tracing::{debug, trace, warn};

use crate::signal::{SignalReason, Termination};
use crate::{CaptureError, Result};

/// Sync byte starting every control message.
pub const SYNC: u8 = b'T';
/// Control number of the log button.
pub const LOGGER_BUTTON: u8 = 0;
/// Control number of the help button.
pub const HELP_BUTTON: u8 = 1;
/// Largest payload the 24-bit length field can describe.
pub const MAX_PAYLOAD: usize = (1 << 24) - 1 - 2;

/// Control pipe commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    Initialized = 0,
    Set = 1,
    Add = 2,
    Remove = 3,
    Enable = 4,
    Disable = 5,
    StatusbarMessage = 6,
    InformationMessage = 7,
    WarningMessage = 8,
    ErrorMessage = 9,
}

impl ControlCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ControlCommand::Initialized,
            1 => ControlCommand::Set,
            2 => ControlCommand::Add,
            3 => ControlCommand::Remove,
            4 => ControlCommand::Enable,
            5 => ControlCommand::Disable,
            6 => ControlCommand::StatusbarMessage,
            7 => ControlCommand::InformationMessage,
            8 => ControlCommand::WarningMessage,
            9 => ControlCommand::ErrorMessage,
            _ => return None,
        })
    }
}

/// One framed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub control: u8,
    pub command: ControlCommand,
    pub payload: Vec<u8>,
}

impl ControlMessage {
    pub fn new(control: u8, command: ControlCommand, payload: impl Into<Vec<u8>>) -> Self {
        let mut payload = payload.into();
        payload.truncate(MAX_PAYLOAD);
        Self { control, command, payload }
    }

    /// Append a line to the capture log shown by the log button.
    pub fn log_line(line: &str) -> Self {
        Self::new(LOGGER_BUTTON, ControlCommand::Add, format!("{}\n", line))
    }

    /// Pop up an error message.
    pub fn error(message: &str) -> Self {
        Self::new(LOGGER_BUTTON, ControlCommand::ErrorMessage, message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = (self.payload.len() + 2) as u32;
        let mut frame = Vec::with_capacity(self.payload.len() + 6);
        frame.push(SYNC);
        frame.extend_from_slice(&length.to_be_bytes()[1..]);
        frame.push(self.control);
        frame.push(self.command as u8);
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Read one message. `Ok(None)` at a clean end of stream.
    pub fn read_from(reader: &mut impl Read) -> io::Result<Option<Self>> {
        let mut header = [0u8; 6];
        match reader.read_exact(&mut header[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        reader.read_exact(&mut header[1..])?;
        if header[0] != SYNC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad control sync byte 0x{:02x}", header[0]),
            ));
        }

        let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        if length < 2 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "control message too short"));
        }
        let command = ControlCommand::from_u8(header[5]).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown control command {}", header[5]))
        })?;
        let mut payload = vec![0u8; length - 2];
        reader.read_exact(&mut payload)?;
        Ok(Some(Self { control: header[4], command, payload }))
    }
}

/// The control pipe pair and its service threads.
#[derive(Debug, Default)]
pub struct ControlChannel {
    out: Option<Sender<ControlMessage>>,
}

impl ControlChannel {
    /// Start servicing whichever control pipes were given.
    pub fn start(
        control_in: Option<&Path>,
        control_out: Option<&Path>,
        termination: &Termination,
    ) -> Result<Self> {
        if let Some(path) = control_in {
            let path = path.to_path_buf();
            let termination = termination.clone();
            thread::Builder::new()
                .name("control-in".to_string())
                .spawn(move || read_control_in(&path, &termination))
                .map_err(|e| CaptureError::pipe_error("spawn", "control-in", e))?;
            debug!("Control in thread started");
        }

        let out = match control_out {
            Some(path) => {
                let (tx, rx) = mpsc::channel::<ControlMessage>();
                let path = path.to_path_buf();
                thread::Builder::new()
                    .name("control-out".to_string())
                    .spawn(move || write_control_out(&path, rx))
                    .map_err(|e| CaptureError::pipe_error("spawn", "control-out", e))?;
                debug!("Control out thread started");
                Some(tx)
            }
            None => None,
        };

        Ok(Self { out })
    }

    pub fn is_active(&self) -> bool {
        self.out.is_some()
    }

    /// Queue a message for control-out. Dropped if there is no such pipe.
    pub fn send(&self, message: ControlMessage) {
        if let Some(out) = &self.out {
            if out.send(message).is_err() {
                trace!("Control out thread is gone, message dropped");
            }
        }
    }

    pub fn log(&self, line: &str) {
        self.send(ControlMessage::log_line(line));
    }

    pub fn error_message(&self, message: &str) {
        self.send(ControlMessage::error(message));
    }

    /// Let control-out finish its queue and exit.
    pub fn stop(&mut self) {
        if self.out.take().is_some() {
            debug!("Control out channel closed");
        }
    }
}

fn read_control_in(path: &Path, termination: &Termination) {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open control in pipe");
            return;
        }
    };
    debug!("Control in opened");

    loop {
        match ControlMessage::read_from(&mut file) {
            Ok(Some(message)) => {
                debug!(control = message.control, command = ?message.command, "Control message received")
            }
            Ok(None) => {
                debug!("Control in closed, requesting capture stop");
                termination.raise(SignalReason::CaptureStop);
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Control in failed, requesting capture stop");
                termination.raise(SignalReason::CaptureStop);
                return;
            }
        }
    }
}

fn write_control_out(path: &Path, messages: mpsc::Receiver<ControlMessage>) {
    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open control out pipe");
            return;
        }
    };
    debug!("Control out opened");

    for message in messages {
        let frame = message.encode();
        if let Err(e) = file.write_all(&frame).and_then(|()| file.flush()) {
            warn!(error = %e, "Control out write failed");
            return;
        }
        trace!(command = ?message.command, len = frame.len(), "Control message sent");
    }
    debug!("Control out thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn encode_information_message() {
        let message = ControlMessage::new(0, ControlCommand::InformationMessage, "hi");
        assert_eq!(message.encode(), vec![b'T', 0, 0, 4, 0, 7, b'h', b'i']);
    }

    #[test]
    fn log_line_is_add_with_newline() {
        let message = ControlMessage::log_line("started");
        assert_eq!(message.control, LOGGER_BUTTON);
        assert_eq!(message.command, ControlCommand::Add);
        assert_eq!(message.payload, b"started\n");
    }

    #[test]
    fn read_messages_until_end_of_stream() {
        let mut stream = ControlMessage::new(HELP_BUTTON, ControlCommand::Set, "").encode();
        stream.extend(ControlMessage::error("boom").encode());
        let mut reader = stream.as_slice();

        let first = ControlMessage::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(first.control, HELP_BUTTON);
        assert!(first.payload.is_empty());
        let second = ControlMessage::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(second.command, ControlCommand::ErrorMessage);
        assert_eq!(second.payload, b"boom");
        assert!(ControlMessage::read_from(&mut reader).unwrap().is_none());
    }

    #[test]
    fn bad_frames_are_rejected() {
        let mut bad_sync: &[u8] = &[b'X', 0, 0, 2, 0, 0];
        assert!(ControlMessage::read_from(&mut bad_sync).is_err());

        let mut bad_command: &[u8] = &[b'T', 0, 0, 2, 0, 42];
        assert!(ControlMessage::read_from(&mut bad_command).is_err());

        let mut truncated: &[u8] = &[b'T', 0, 0, 9, 0, 2, b'a'];
        assert!(ControlMessage::read_from(&mut truncated).is_err());
    }

    #[test]
    fn control_in_end_requests_capture_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control-in");
        std::fs::write(&path, ControlMessage::new(0, ControlCommand::Initialized, "").encode())
            .unwrap();

        let termination = Termination::manual(SignalReason::Unknown);
        let _channel = ControlChannel::start(Some(&path), None, &termination).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !termination.is_pending() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let err = termination.check().unwrap_err();
        assert_eq!(err.termination_reason(), Some(SignalReason::CaptureStop));
    }

    #[test]
    fn control_out_writes_queued_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control-out");
        std::fs::write(&path, b"").unwrap();

        let termination = Termination::manual(SignalReason::CaptureStop);
        let mut channel = ControlChannel::start(None, Some(&path), &termination).unwrap();
        assert!(channel.is_active());
        channel.log("Capture started");
        channel.error_message("JLinkRTTLogger exited unexpectedly.");
        channel.stop();

        let mut expected = ControlMessage::log_line("Capture started").encode();
        expected.extend(ControlMessage::error("JLinkRTTLogger exited unexpectedly.").encode());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let written = std::fs::read(&path).unwrap();
            if written == expected || Instant::now() > deadline {
                assert_eq!(written, expected);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}
