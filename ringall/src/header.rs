use std::convert::TryInto;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized size of [`RingHeader`] on the wire.
pub const HEADER_LEN: usize = 25;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record too short: {0} bytes, need {1}")]
    Truncated(usize, usize),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingMessage {
    ScatterReduceData = 1,
    AllGatherData = 2,
    RoundComplete = 3,
}

impl RingMessage {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            1 => RingMessage::ScatterReduceData,
            2 => RingMessage::AllGatherData,
            3 => RingMessage::RoundComplete,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// The fixed 25-byte framing record of the ring protocol. Every record on
/// the stream is this header followed by a fixed-size payload; there is no
/// length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub message_type: RingMessage,
    /// position within the global array of total_packets entries
    pub original_packet_index: u32,
    pub agg_data: i32,
    /// round index within the current phase
    pub pass_number: u32,
    /// which of the N logical chunks this record belongs to
    pub logical_chunk: u32,
    pub sender_node_id: u32,
    /// mirror of the sender's phase
    pub current_phase: u32,
}

impl Default for RingHeader {
    fn default() -> Self {
        RingHeader {
            message_type: RingMessage::ScatterReduceData,
            original_packet_index: 0,
            agg_data: 0,
            pass_number: 0,
            logical_chunk: 0,
            sender_node_id: 0,
            current_phase: 0,
        }
    }
}

impl RingHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.message_type as u8);
        buf.extend_from_slice(&self.original_packet_index.to_be_bytes());
        buf.extend_from_slice(&self.agg_data.to_be_bytes());
        buf.extend_from_slice(&self.pass_number.to_be_bytes());
        buf.extend_from_slice(&self.logical_chunk.to_be_bytes());
        buf.extend_from_slice(&self.sender_node_id.to_be_bytes());
        buf.extend_from_slice(&self.current_phase.to_be_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<RingHeader, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated(buf.len(), HEADER_LEN));
        }
        let u32_at = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(RingHeader {
            message_type: RingMessage::from_u8(buf[0])?,
            original_packet_index: u32_at(1),
            agg_data: u32_at(5) as i32,
            pass_number: u32_at(9),
            logical_chunk: u32_at(13),
            sender_node_id: u32_at(17),
            current_phase: u32_at(21),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = RingHeader {
            message_type: RingMessage::AllGatherData,
            original_packet_index: 11,
            agg_data: -4,
            pass_number: 2,
            logical_chunk: 3,
            sender_node_id: 1,
            current_phase: 3,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(RingHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_short_buffer() {
        let bytes = RingHeader::default().to_bytes();
        assert!(RingHeader::decode(&bytes[..HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut bytes = RingHeader::default().to_bytes();
        bytes[0] = 9;
        assert!(RingHeader::decode(&bytes).is_err());
    }
}
