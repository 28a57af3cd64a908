//! Serial transports
//!
//! A [`Transport`] is a blocking, bounded source of newline-delimited frames.
//! Every call returns within roughly the configured read timeout, so the
//! acquisition side can run it through `spawn_blocking` one poll at a time.
//! [`Connector`] opens transports and is the seam used by tests.

use std::io::{self, Read};
use std::time::Duration;

use tracing::{debug, warn};

use ms_core::constants::limits::MAX_FRAME_SIZE;
use ms_error::{MedisenseError, Result};

/// A duplex byte stream to one device, read as text frames
pub trait Transport: Send {
    /// Return the next complete frame, `Ok(None)` when nothing is ready yet.
    /// Errors are I/O failures of the underlying device.
    fn poll_frame(&mut self) -> io::Result<Option<String>>;
}

/// Opens transports for a device path and speed
pub trait Connector: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Splits a byte stream into text lines.
///
/// Decoding is lossy: invalid UTF-8 becomes U+FFFD instead of an error. A
/// line growing past `max_len` without a terminator is dropped whole.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len),
            max_len,
            overflowed: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > self.max_len {
                    warn!("ACQ: discarding {} bytes without line terminator", self.buf.len());
                    self.buf.clear();
                    self.overflowed = true;
                }
                return None;
            };

            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if std::mem::take(&mut self.overflowed) {
                // Tail of a line already discarded
                continue;
            }
            if line.len() > self.max_len + 1 {
                warn!("ACQ: discarding oversized frame ({} bytes)", line.len());
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            return Some(text.trim_end_matches(['\r', '\n']).to_string());
        }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

/// Transport over a real serial port
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    lines: LineAssembler,
    chunk: [u8; 256],
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| MedisenseError::unavailable(path, e))?;

        debug!("ACQ: opened {} at {} baud", path, baud_rate);
        Ok(Self {
            port,
            lines: LineAssembler::default(),
            chunk: [0u8; 256],
        })
    }
}

impl Transport for SerialTransport {
    fn poll_frame(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }

        let waiting = self.port.bytes_to_read().map_err(io::Error::from)?;
        if waiting == 0 {
            return Ok(None);
        }

        let want = (waiting as usize).min(self.chunk.len());
        match self.port.read(&mut self.chunk[..want]) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device closed")),
            Ok(n) => {
                self.lines.push(&self.chunk[..n]);
                Ok(self.lines.next_line())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Opens [`SerialTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn Transport>> {
        let transport = SerialTransport::open(port, baud_rate, read_timeout)?;
        Ok(Box::new(transport))
    }
}
