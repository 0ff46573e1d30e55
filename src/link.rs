//! Byte-level access to the tapping peripheral.
//!
//! Everything above this module talks to a [`SerialLink`]: a full-duplex byte
//! pipe that can report how many bytes are waiting, read them one at a time,
//! read a line of text (used only by the handshake banner), and drop whatever
//! input is pending. [`SerialPortLink`] is the real thing; `ScriptedLink`
//! replays a fixed device script and records what the host wrote.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, trace};
use serialport::{ClearBuffer, SerialPort};

use crate::errors::Result;

// ============================================================================
// Constants
// ============================================================================

/// Baud rate of the reference tapping pad firmware.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Read timeout for the port. Also bounds a single banner line read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Traits
// ============================================================================

/// A source of single bytes that can say how many are ready.
pub trait ByteSource {
    /// Number of bytes readable without waiting.
    ///
    /// An error whose kind satisfies [`is_closed`] means the source is gone
    /// for good.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read exactly one byte.
    fn read_byte(&mut self) -> io::Result<u8>;
}

/// The full-duplex link to the peripheral.
pub trait SerialLink: ByteSource + Write {
    /// Read one line of text including its terminator. Returns an empty
    /// buffer when nothing arrives within the read timeout.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Discard any input received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Whether an I/O error means the link has been permanently closed.
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

// ============================================================================
// Serial port
// ============================================================================

/// A [`SerialLink`] over an OS serial port. The port is closed on drop.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialPortLink {
    /// Open the serial port at `path` (e.g. `/dev/ttyACM0` or `COM6`).
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        debug!("opened serial port {} at {} baud", path, baud_rate);
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> Result<Vec<String>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn serial_to_io(err: serialport::Error) -> io::Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice => io::Error::new(io::ErrorKind::NotConnected, err),
        _ => io::Error::from(err),
    }
}

impl ByteSource for SerialPortLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(serial_to_io)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

impl SerialLink for SerialPortLink {
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::with_capacity(32);
        loop {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        Ok(line)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(serial_to_io)
    }
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Drop for SerialPortLink {
    fn drop(&mut self) {
        debug!("closing serial port {}", self.path);
    }
}

// ============================================================================
// Scripted link
// ============================================================================

/// An in-memory peripheral that plays back a script.
///
/// Bytes given to [`ScriptedLink::with_input`] are readable immediately. Each
/// chunk queued with [`ScriptedLink::then`] is released by one
/// `bytes_available` poll that finds the input empty, so an empty chunk models
/// a poll that sees no data. Once the script is exhausted, a link marked
/// [`closed`](ScriptedLink::closed) reports a broken pipe; otherwise it keeps
/// reporting zero bytes.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct ScriptedLink {
    pending: VecDeque<u8>,
    schedule: VecDeque<Vec<u8>>,
    closed: bool,
    written: Vec<u8>,
    clears: usize,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes already waiting when the link opens (the boot banner).
    pub fn with_input(mut self, bytes: &[u8]) -> Self {
        self.pending.extend(bytes);
        self
    }

    /// Queue a chunk to be released by a later poll.
    pub fn then(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.schedule.push_back(chunk.into());
        self
    }

    /// Queue a poll that sees nothing.
    pub fn then_silence(self) -> Self {
        self.then(Vec::new())
    }

    /// Report the stream as closed once the script runs out.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    /// Everything the host has written so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// How many times input was cleared.
    pub fn clear_count(&self) -> usize {
        self.clears
    }

    /// Bytes currently waiting to be read, not counting queued chunks.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl ByteSource for ScriptedLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.schedule.pop_front() {
                Some(chunk) => {
                    trace!("scripted link released {} bytes", chunk.len());
                    self.pending.extend(chunk);
                }
                None if self.closed => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "scripted link exhausted",
                    ))
                }
                None => {}
            }
        }
        Ok(self.pending.len())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if self.pending.is_empty() {
            self.bytes_available()?;
        }
        self.pending
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no scripted data ready"))
    }
}

impl SerialLink for ScriptedLink {
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        while let Some(byte) = self.pending.pop_front() {
            line.push(byte);
            if byte == b'\n' {
                break;
            }
        }
        Ok(line)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.clears += 1;
        Ok(())
    }
}

impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
