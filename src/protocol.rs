//! Command Framing
//!
//! An optional framing for byte-oriented transports: a bincode-encoded
//! [`Command`] behind a fixed header carrying its length and CRC32.
//! Transports are free to use any other encoding of the command tuple.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Command;
use crate::error::{Error, Result};

/// Frame header for length-prefixed commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a header describing `body`.
    ///
    /// Fails if the body is too long for the 32-bit length field.
    pub fn new(body: &[u8]) -> Result<Self> {
        Ok(Self {
            length: body_length(body.len())?,
            checksum: crc32fast::hash(body),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Total frame size including the header
    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.length as usize
    }
}

fn body_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::FrameCorrupted(format!("body of {} bytes exceeds the {} byte frame limit", len, u32::MAX))
    })
}

/// Encode a command into a single frame
pub fn encode<K, V>(command: &Command<K, V>) -> Result<Vec<u8>>
where
    K: Serialize,
    V: Serialize,
{
    let body = bincode::serialize(command)?;
    let header = FrameHeader::new(&body)?;

    let mut frame = Vec::with_capacity(header.frame_len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame produced by [`encode`]
pub fn decode<K, V>(frame: &[u8]) -> Result<Command<K, V>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let header = peek_header(frame)
        .ok_or_else(|| Error::FrameCorrupted(format!("frame of {} bytes has no header", frame.len())))?;

    let body = &frame[FrameHeader::SIZE..];
    if body.len() != header.length as usize {
        return Err(Error::FrameCorrupted(format!(
            "expected {} body bytes, got {}",
            header.length,
            body.len()
        )));
    }

    let checksum = crc32fast::hash(body);
    if checksum != header.checksum {
        return Err(Error::FrameCorrupted(format!(
            "checksum mismatch: header {:08x}, body {:08x}",
            header.checksum, checksum
        )));
    }

    Ok(bincode::deserialize(body)?)
}

/// Read the header at the start of `buf`, if enough bytes are present.
/// Useful for splitting a byte stream into frames.
pub fn peek_header(buf: &[u8]) -> Option<FrameHeader> {
    let bytes: &[u8; FrameHeader::SIZE] = buf.get(..FrameHeader::SIZE)?.try_into().ok()?;
    Some(FrameHeader::from_bytes(bytes))
}
