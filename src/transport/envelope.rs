//! Wire envelope for messages read from a partition.
//!
//! Frame layout (little endian):
//!
//! ```text
//! magic(4) | version(1) | flags(1) | body_len(4) | crc32(4) | body
//! ```
//!
//! The body is a MessagePack-encoded [`EnvelopeBody`]; the checksum covers
//! the body only.

use crate::error::{ClientError, Result};
use crate::types::{CorrelationId, Message, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Magic bytes opening every frame.
const ENVELOPE_MAGIC: &[u8; 4] = b"TRB\0";

/// Current envelope format version.
const ENVELOPE_VERSION: u8 = 1;

/// Fixed header size.
pub const HEADER_SIZE: usize = 4 + 1 + 1 + 4 + 4; // magic + version + flags + len + crc

/// Decoded envelope contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeBody {
    pub offset: u64,
    pub timestamp: Timestamp,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub subject: Option<String>,
    pub correlation_id: Option<CorrelationId>,
}

impl EnvelopeBody {
    /// Attach the partition coordinates the frame was read from.
    pub fn into_message(self, stream: &str, partition: u32) -> Message {
        Message {
            stream: stream.to_string(),
            partition,
            offset: self.offset,
            key: self.key,
            value: self.value,
            headers: self.headers,
            timestamp: self.timestamp,
            subject: self.subject,
            correlation_id: self.correlation_id,
        }
    }
}

/// Encode a body into a frame.
pub fn encode(body: &EnvelopeBody) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(body)?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());

    frame.extend_from_slice(ENVELOPE_MAGIC);
    frame.push(ENVELOPE_VERSION);
    // Flags (reserved)
    frame.push(0u8);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Decode a frame, verifying framing and checksum.
pub fn decode(frame: &[u8]) -> Result<EnvelopeBody> {
    if frame.len() < HEADER_SIZE {
        return Err(ClientError::DecodeFailure(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }

    if &frame[0..4] != ENVELOPE_MAGIC {
        return Err(ClientError::DecodeFailure("invalid envelope magic".into()));
    }

    if frame[4] != ENVELOPE_VERSION {
        return Err(ClientError::DecodeFailure(format!(
            "unsupported envelope version: {}",
            frame[4]
        )));
    }

    let body_len = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
    let stored_checksum = u32::from_le_bytes([frame[10], frame[11], frame[12], frame[13]]);

    let body = &frame[HEADER_SIZE..];
    if body.len() != body_len {
        return Err(ClientError::DecodeFailure(format!(
            "body length mismatch: header says {}, frame has {}",
            body_len,
            body.len()
        )));
    }

    let computed_checksum = crc32fast::hash(body);
    if stored_checksum != computed_checksum {
        return Err(ClientError::DecodeFailure(format!(
            "checksum mismatch: expected {}, got {}",
            stored_checksum, computed_checksum
        )));
    }

    Ok(rmp_serde::from_slice(body)?)
}
