//! Wire framing (length + crc32c) for transports that carry envelopes over a
//! byte stream.
//!
//! Layout: `u32 LE payload length | u32 LE crc32c | payload`. The checksum
//! covers the payload only; a corrupted header shows up as a bogus length or
//! a checksum mismatch on whatever follows.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame length: {reason}")]
    BadLength { reason: &'static str },
    #[error("frame of {got_bytes} bytes exceeds limit of {limit_bytes}")]
    Oversize {
        limit_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame checksum mismatch: header says {expected:#010x}, payload hashes to {got:#010x}")]
    Checksum { expected: u32, got: u32 },
}

fn checked_length(len: usize, limit: usize) -> Result<u32, FrameError> {
    if len == 0 {
        return Err(FrameError::BadLength {
            reason: "zero-length frame",
        });
    }
    if len > limit {
        return Err(FrameError::Oversize {
            limit_bytes: limit,
            got_bytes: len,
        });
    }
    u32::try_from(len).map_err(|_| FrameError::BadLength {
        reason: "length does not fit u32",
    })
}

/// Frame a payload for the wire.
pub fn encode_frame(payload: &[u8], max_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let length = checked_length(payload.len(), max_bytes)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc32c(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    max_bytes: usize,
) -> Result<(), FrameError> {
    writer.write_all(&encode_frame(payload, max_bytes)?)?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream.
///
/// A stream that ends inside a header or body is an error: the peer went
/// away mid-frame.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    // The first read tells clean EOF apart from a torn frame.
    let first = reader.read(&mut header)?;
    if first == 0 {
        return Ok(None);
    }
    if first < FRAME_HEADER_LEN {
        reader.read_exact(&mut header[first..])?;
    }
    let (length_bytes, crc_bytes) = header.split_at(4);
    let length = u32::from_le_bytes(length_bytes.try_into().expect("4-byte split")) as usize;
    checked_length(length, max_bytes)?;
    let expected = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte split"));

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    let got = crc32c(&payload);
    if got != expected {
        return Err(FrameError::Checksum { expected, got });
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip_validates_crc() {
        let payload = b"chunk state";
        let frame = encode_frame(payload, 1024).unwrap();
        let mut cursor = Cursor::new(frame);
        let decoded = read_frame(&mut cursor, 1024).unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let mut frame = encode_frame(b"payload", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut cursor = Cursor::new(frame);
        assert!(matches!(
            read_frame(&mut cursor, 1024),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn oversize_frames_are_rejected_both_ways() {
        assert!(matches!(
            encode_frame(&[0u8; 32], 16),
            Err(FrameError::Oversize { .. })
        ));
        let frame = encode_frame(&[0u8; 32], 64).unwrap();
        let mut cursor = Cursor::new(frame);
        assert!(matches!(
            read_frame(&mut cursor, 16),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(
            encode_frame(&[], 64),
            Err(FrameError::BadLength { .. })
        ));
    }

    #[test]
    fn end_of_stream_is_none_but_torn_frame_is_error() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor, 64).unwrap().is_none());

        let frame = encode_frame(b"payload", 64).unwrap();
        let mut cursor = Cursor::new(frame[..frame.len() - 2].to_vec());
        assert!(matches!(
            read_frame(&mut cursor, 64),
            Err(FrameError::Io(_))
        ));
    }
}
