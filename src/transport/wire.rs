//! Length-prefixed CBOR framing for the socket transport
//!
//! Every frame is a `u32` big-endian length followed by a CBOR-encoded
//! message. The length is validated against a hard limit on both the read
//! and write paths, so a corrupt or hostile peer cannot make a reader
//! allocate unbounded memory.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{LatticeError, Result};

/// Default hard limit on a single wire frame (10MB).
pub const MESSAGE_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Write a length-prefixed CBOR frame.
pub fn write_frame<W: Write, M: Serialize>(io: &mut W, message: &M, limit: usize) -> Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| LatticeError::Serialization(e.to_string()))?;

    if buf.len() > limit {
        return Err(LatticeError::Serialization(format!(
            "message size {} exceeds limit {}",
            buf.len(),
            limit
        )));
    }

    let len = buf.len() as u32;
    io.write_all(&len.to_be_bytes())?;
    io.write_all(&buf)?;
    io.flush()?;

    Ok(())
}

/// Read a length-prefixed CBOR frame, enforcing the size limit before
/// allocating the payload buffer.
pub fn read_frame<R: Read, M: DeserializeOwned>(io: &mut R, limit: usize) -> Result<M> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > limit {
        return Err(LatticeError::Serialization(format!(
            "message size {} exceeds limit {}",
            len, limit
        )));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf)?;

    ciborium::from_reader(&buf[..]).map_err(|e| LatticeError::Serialization(e.to_string()))
}

/// Encode an `f32` buffer as little-endian payload bytes.
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian payload bytes back into an `f32` buffer.
pub fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(LatticeError::Serialization(format!(
            "payload length {} is not a whole number of f32 elements",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
