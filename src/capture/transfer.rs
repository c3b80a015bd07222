//! The blocking transfer loop moving monitor data to the capture output.

use tracing::{debug, trace};

use crate::btmon::BtmonParser;
use crate::pcap::{PcapEncoder, PcapOptions};
use crate::pipe::Pipe;
use crate::signal::{SignalReason, Termination};
use crate::{CaptureError, Result};

/// Largest single read from the input pipe.
pub const READ_CHUNK_SIZE: usize = 2048;

/// Last I/O direction of the transfer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reading from the logger.
    Input,
    /// Writing to the analysis tool.
    Output,
}

/// Termination reason of a broken pipe seen while moving in `direction`.
///
/// A broken pipe while reading only blames the logger if the capture output
/// is still alive; otherwise the analysis tool went away first.
pub fn classify(direction: Direction, output_writeable: bool) -> SignalReason {
    if direction == Direction::Input && output_writeable {
        SignalReason::InputPipe
    } else {
        SignalReason::OutputPipe
    }
}

/// Parser and encoder state of one capture plus the loop driving them.
#[derive(Debug)]
pub struct TransferLoop {
    parser: BtmonParser,
    encoder: PcapEncoder,
    direction: Direction,
    bytes_in: u64,
    bytes_out: u64,
}

impl TransferLoop {
    pub fn new(options: PcapOptions) -> Self {
        Self {
            parser: BtmonParser::new(),
            encoder: PcapEncoder::new(options),
            direction: Direction::Output,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn encoder_mut(&mut self) -> &mut PcapEncoder {
        &mut self.encoder
    }

    /// Move data until something ends the capture.
    ///
    /// Never returns `Ok`. Broken pipes come back as
    /// [`CaptureError::Terminated`] with the reason given by [`classify`].
    pub fn run<I, O>(&mut self, input: &mut I, output: &mut O, termination: &Termination) -> Result<()>
    where
        I: Pipe + ?Sized,
        O: Pipe + ?Sized,
    {
        loop {
            if let Err(e) = self.step(input, output, termination) {
                if e.is_broken_pipe() {
                    let reason = classify(self.direction, output.writeable());
                    debug!(direction = ?self.direction, %reason, error = %e, "Pipe closed");
                    return Err(CaptureError::terminated(reason));
                }
                return Err(e);
            }
        }
    }

    /// One iteration: flush pending output, then read and decode one chunk.
    pub fn step<I, O>(&mut self, input: &mut I, output: &mut O, termination: &Termination) -> Result<()>
    where
        I: Pipe + ?Sized,
        O: Pipe + ?Sized,
    {
        termination.check()?;
        self.flush_to(output, termination)?;

        termination.check()?;
        self.direction = Direction::Input;
        let data = loop {
            match input.read1(READ_CHUNK_SIZE) {
                Ok(Some(data)) => break data,
                Ok(None) => {
                    debug!(bytes_in = self.bytes_in, "Input ended from the logger side");
                    return Err(CaptureError::broken_pipe(input.name().unwrap_or("<input>")));
                }
                Err(e) => {
                    termination.check()?;
                    if e.is_interrupted() {
                        trace!("Input read interrupted, retrying");
                        continue;
                    }
                    return Err(e);
                }
            }
        };
        self.bytes_in += data.len() as u64;
        trace!(len = data.len(), "Parsing input chunk");

        self.parser.feed(&data);
        for record in self.parser.drain() {
            self.encoder.generate(&record);
        }
        Ok(())
    }

    /// Write everything the encoder queued, flushing after the write.
    pub fn flush_to<O>(&mut self, output: &mut O, termination: &Termination) -> Result<()>
    where
        O: Pipe + ?Sized,
    {
        if !self.encoder.has_output() {
            return Ok(());
        }
        let data = self.encoder.take_output();
        self.direction = Direction::Output;
        loop {
            match output.write(&data).and_then(|()| output.flush()) {
                Ok(()) => break,
                Err(e) => {
                    termination.check()?;
                    if e.is_interrupted() {
                        trace!("Output write interrupted, retrying");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        self.bytes_out += data.len() as u64;
        trace!(len = data.len(), "Output written");
        Ok(())
    }
}
