//! Mesh Binary Frame
//!
//! Fixed frame carried in the service data of a BLE advertisement:
//!
//! ```text
//! [16 bytes message id][1 byte ttl][8 bytes seq][1 byte last flag][payload]
//! ```
//!
//! All integers are big-endian. The origin is not part of the frame; the
//! receiver stamps it from the radio address the blob arrived from.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Service UUID whose service data carries mesh frames
pub const SERVICE_UUID: &str = "5a7e2f41-15d3-4f3e-b4c4-7b1e7da7e2a1";

/// 16 (id) + 1 (ttl) + 8 (seq) + 1 (flag)
pub const HEADER_LEN: usize = 26;

/// Usable service data bytes of the simulated radio: 13 payload bytes per frame
pub const DEFAULT_PAYLOAD_CAPACITY: usize = 39;

const TTL_OFFSET: usize = 16;
const SEQ_OFFSET: usize = 17;
const FLAG_OFFSET: usize = 25;

/// One fragment of a mesh message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub message_id: Uuid,
    /// Radio address the packet was heard from (empty when built locally
    /// for transmission)
    pub origin: String,
    pub seq: u64,
    pub ttl: u8,
    pub is_last: bool,
    pub payload: Vec<u8>,
}

/// Identity of a single fragment, used for hop-level dedup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub message_id: Uuid,
    pub seq: u64,
}

impl MeshPacket {
    pub fn new(message_id: Uuid, origin: String, seq: u64, ttl: u8, is_last: bool, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            origin,
            seq,
            ttl,
            is_last,
            payload,
        }
    }

    /// Copy for the next hop with one less TTL, or `None` once exhausted
    pub fn relayed(&self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        Some(Self {
            ttl: self.ttl - 1,
            ..self.clone()
        })
    }

    pub fn fragment_key(&self) -> FragmentKey {
        FragmentKey {
            message_id: self.message_id,
            seq: self.seq,
        }
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Largest payload chunk a radio with `capacity` usable bytes can carry
pub fn chunk_size(capacity: usize) -> Result<usize> {
    if capacity <= HEADER_LEN {
        return Err(MeshError::PayloadTooSmall {
            capacity,
            header: HEADER_LEN,
        });
    }
    Ok(capacity - HEADER_LEN)
}

/// Encoder/decoder for the mesh frame
pub struct MeshProtocol;

impl MeshProtocol {
    /// Encode to exactly `HEADER_LEN + payload.len()` bytes
    pub fn encode(packet: &MeshPacket) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(packet.frame_len());

        buffer.extend_from_slice(packet.message_id.as_bytes()); // 16 bytes
        buffer.push(packet.ttl); // 1 byte
        buffer.extend_from_slice(&packet.seq.to_be_bytes()); // 8 bytes
        buffer.push(u8::from(packet.is_last)); // 1 byte
        buffer.extend_from_slice(&packet.payload);

        buffer
    }

    /// Decode a frame heard from `origin`
    pub fn decode(data: &[u8], origin: &str) -> Result<MeshPacket> {
        if data.len() < HEADER_LEN {
            return Err(MeshError::malformed(format!(
                "frame too short: {} bytes, header needs {}",
                data.len(),
                HEADER_LEN
            )));
        }

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&data[..TTL_OFFSET]);

        let ttl = data[TTL_OFFSET];

        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&data[SEQ_OFFSET..FLAG_OFFSET]);

        let is_last = data[FLAG_OFFSET] == 1;

        Ok(MeshPacket {
            message_id: Uuid::from_bytes(id_bytes),
            origin: origin.to_string(),
            seq: u64::from_be_bytes(seq_bytes),
            ttl,
            is_last,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}
