//! Length-prefixed framing.
//!
//! Frame layout:
//!
//! ```text
//! +----------------------+---------------------------+
//! | length: u64 (BE)     | payload: `length` bytes   |
//! +----------------------+---------------------------+
//! ```
//!
//! The payload is read in full before it is parsed. A peer that closes early
//! produces [`ProtocolError::Truncated`].

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload accepted (256 MiB). Checked before allocating.
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len, max: MAX_FRAME_LEN });
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, enforcing `max_len`.
pub fn read_frame<R: Read>(reader: &mut R, max_len: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let got = read_full(reader, &mut header)?;
    if got < FRAME_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: FRAME_HEADER_LEN as u64,
            received: got as u64,
        });
    }

    let len = u64::from_be_bytes(header);
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_full(reader, &mut payload)?;
    if (got as u64) < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            received: got as u64,
        });
    }
    Ok(payload)
}

/// Serialize `message` as JSON and write it as one frame.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload)
}

/// Read one frame and parse it as JSON.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, ProtocolError> {
    let payload = read_frame(reader, MAX_FRAME_LEN)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Fill `buf` as far as the stream allows. Returns the number of bytes read,
/// which is less than `buf.len()` only at EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
