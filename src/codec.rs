//! Fixed-width unsigned timestamps sent by the peripheral.
//!
//! The firmware sends its `micros()` clock as a little-endian `unsigned long`
//! after every timestamped tag. Decoding waits until the whole width has
//! arrived; a partial timestamp is never interpreted.

use log::trace;

use crate::errors::ProtocolError;
use crate::link::{is_closed, ByteSource};

/// Width of a timestamp on the wire.
pub const TIMESTAMP_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Interpret up to four bytes as an unsigned integer.
pub fn decode_bytes(bytes: &[u8], order: ByteOrder) -> Result<u32, ProtocolError> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(ProtocolError::InvalidWidth(bytes.len()));
    }
    let mut buf = [0u8; 4];
    Ok(match order {
        ByteOrder::LittleEndian => {
            buf[..bytes.len()].copy_from_slice(bytes);
            u32::from_le_bytes(buf)
        }
        ByteOrder::BigEndian => {
            buf[4 - bytes.len()..].copy_from_slice(bytes);
            u32::from_be_bytes(buf)
        }
    })
}

/// Block until `count` bytes are readable from `source`.
///
/// Spins on the availability signal with no deadline. Fails only when the
/// source reports that it has closed.
pub fn wait_for_bytes<S: ByteSource + ?Sized>(
    source: &mut S,
    count: usize,
) -> Result<(), ProtocolError> {
    loop {
        match source.bytes_available() {
            Ok(n) if n >= count => return Ok(()),
            Ok(_) => std::hint::spin_loop(),
            Err(e) if is_closed(&e) => return Err(ProtocolError::StreamClosed),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wait for and read a single byte.
pub(crate) fn next_byte<S: ByteSource + ?Sized>(source: &mut S) -> Result<u8, ProtocolError> {
    wait_for_bytes(source, 1)?;
    source.read_byte().map_err(|e| {
        if is_closed(&e) {
            ProtocolError::StreamClosed
        } else {
            ProtocolError::Io(e)
        }
    })
}

/// Read a `width`-byte unsigned timestamp in the given byte order.
pub fn decode<S: ByteSource + ?Sized>(
    source: &mut S,
    width: usize,
    order: ByteOrder,
) -> Result<u32, ProtocolError> {
    if width == 0 || width > 4 {
        return Err(ProtocolError::InvalidWidth(width));
    }
    let mut buf = [0u8; 4];
    for slot in buf.iter_mut().take(width) {
        *slot = next_byte(source)?;
    }
    let value = decode_bytes(&buf[..width], order)?;
    trace!("decoded timestamp {:02X?} -> {}", &buf[..width], value);
    Ok(value)
}

/// Read a wire timestamp: four bytes, little-endian.
pub fn read_timestamp<S: ByteSource + ?Sized>(source: &mut S) -> Result<u32, ProtocolError> {
    decode(source, TIMESTAMP_WIDTH, ByteOrder::LittleEndian)
}
