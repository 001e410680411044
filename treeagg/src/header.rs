use std::convert::TryInto;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized size of [`AggHeader`] on the wire.
pub const HEADER_LEN: usize = 28;

/// Default filler payload carried behind a data record.
pub const DATA_PAYLOAD_LEN: usize = 1024;

pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_NACK: u8 = 0x02;
pub const FLAG_SYNC: u8 = 0x04;
pub const FLAG_CTRL: u8 = 0x08;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record too short: {0} bytes, need {1}")]
    Truncated(usize, usize),
    #[error("unknown operation {0}")]
    UnknownOperation(u8),
    #[error("unknown data type {0}")]
    UnknownDataType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum = 1,
    Average = 2,
    Min = 3,
    Max = 4,
    Product = 5,
    Custom = 6,
}

impl ReduceOp {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            1 => ReduceOp::Sum,
            2 => ReduceOp::Average,
            3 => ReduceOp::Min,
            4 => ReduceOp::Max,
            5 => ReduceOp::Product,
            6 => ReduceOp::Custom,
            other => return Err(CodecError::UnknownOperation(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int32 = 1,
}

impl DataType {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(DataType::Int32),
            other => Err(CodecError::UnknownDataType(other)),
        }
    }
}

/// The fixed 28-byte record prefix of the tree aggregation protocol.
///
/// Source and destination addresses travel inside the record; every engine
/// on the path matches on these carried values, never on the enclosing
/// packet's own IP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggHeader {
    pub src_qp: u16,
    pub dst_qp: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub psn: u32,
    pub operation: ReduceOp,
    /// high nibble data type, low nibble flag bits; use the accessors
    pub type_and_flags: u8,
    pub cwnd: u16,
    pub group_id: u16,
    pub length: u16,
    pub agg_data: i32,
}

impl Default for AggHeader {
    fn default() -> Self {
        let mut h = AggHeader {
            src_qp: 0,
            dst_qp: 0,
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            psn: 0,
            operation: ReduceOp::Sum,
            type_and_flags: 0,
            cwnd: 0,
            group_id: 0,
            length: 0,
            agg_data: 0,
        };
        h.set_data_type(DataType::Int32);
        h
    }
}

impl AggHeader {
    pub fn set_data_type(&mut self, data_type: DataType) {
        self.type_and_flags = (self.type_and_flags & 0x0F) | ((data_type as u8) << 4);
    }

    pub fn data_type(&self) -> Result<DataType, CodecError> {
        DataType::from_u8((self.type_and_flags >> 4) & 0x0F)
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.type_and_flags |= flag & 0x0F;
    }

    pub fn unset_flag(&mut self, flag: u8) {
        self.type_and_flags &= !(flag & 0x0F);
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.type_and_flags & (flag & 0x0F) != 0
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.type_and_flags & 0x0F
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.src_qp.to_be_bytes());
        buf.extend_from_slice(&self.dst_qp.to_be_bytes());
        buf.extend_from_slice(&u32::from(self.src_addr).to_be_bytes());
        buf.extend_from_slice(&u32::from(self.dst_addr).to_be_bytes());
        buf.extend_from_slice(&self.psn.to_be_bytes());
        buf.push(self.operation as u8);
        buf.push(self.type_and_flags);
        buf.extend_from_slice(&self.cwnd.to_be_bytes());
        buf.extend_from_slice(&self.group_id.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.agg_data.to_be_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<AggHeader, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated(buf.len(), HEADER_LEN));
        }
        let u16_at = |off: usize| u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
        let u32_at = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        let header = AggHeader {
            src_qp: u16_at(0),
            dst_qp: u16_at(2),
            src_addr: Ipv4Addr::from(u32_at(4)),
            dst_addr: Ipv4Addr::from(u32_at(8)),
            psn: u32_at(12),
            operation: ReduceOp::from_u8(buf[16])?,
            type_and_flags: buf[17],
            cwnd: u16_at(18),
            group_id: u16_at(20),
            length: u16_at(22),
            agg_data: u32_at(24) as i32,
        };
        header.data_type()?;
        Ok(header)
    }

    /// Build the ACK answering this record: addresses and QPs reversed, same
    /// psn, payload echoing `value`, header-only length.
    pub fn ack_reply(&self, value: i32) -> AggHeader {
        let mut ack = AggHeader {
            src_qp: self.dst_qp,
            dst_qp: self.src_qp,
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            psn: self.psn,
            operation: self.operation,
            group_id: self.group_id,
            length: HEADER_LEN as u16,
            agg_data: value,
            ..Default::default()
        };
        if let Ok(dt) = self.data_type() {
            ack.set_data_type(dt);
        }
        ack.set_flag(FLAG_ACK);
        ack
    }

    /// Build the NAK answering this record. `psn` carries the sequence the
    /// replier actually expects, not the one that triggered the NAK.
    pub fn nak_reply(&self, psn: u32) -> AggHeader {
        let mut nak = self.ack_reply(0);
        nak.unset_flag(FLAG_ACK);
        nak.set_flag(FLAG_NACK);
        nak.psn = psn;
        nak.agg_data = 0;
        nak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> AggHeader {
        let mut header = AggHeader {
            src_qp: 1001,
            dst_qp: 2002,
            src_addr: Ipv4Addr::new(192, 168, 1, 1),
            dst_addr: Ipv4Addr::new(192, 168, 1, 2),
            psn: 12345,
            operation: ReduceOp::Sum,
            cwnd: 100,
            group_id: 5,
            length: 1024,
            ..Default::default()
        };
        header.set_data_type(DataType::Int32);
        header.set_flag(FLAG_ACK);
        header
    }

    #[test]
    fn roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);

        let decoded = AggHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.src_qp, 1001);
        assert_eq!(decoded.dst_qp, 2002);
        assert_eq!(decoded.src_addr, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(decoded.dst_addr, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(decoded.psn, 12345);
        assert_eq!(decoded.operation, ReduceOp::Sum);
        assert_eq!(decoded.data_type().unwrap(), DataType::Int32);
        assert!(decoded.has_flag(FLAG_ACK));
        assert_eq!(decoded.cwnd, 100);
        assert_eq!(decoded.group_id, 5);
        assert_eq!(decoded.length, 1024);
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_short_buffer() {
        let bytes = sample_header().to_bytes();
        assert!(AggHeader::decode(&bytes[..HEADER_LEN - 1]).is_err());
        assert!(AggHeader::decode(&[]).is_err());
    }

    #[test]
    fn flags_are_distinguishable() {
        let mut header = AggHeader::default();
        header.set_flag(FLAG_ACK);
        header.set_flag(FLAG_SYNC);
        assert!(header.has_flag(FLAG_ACK));
        assert!(header.has_flag(FLAG_SYNC));
        assert!(!header.has_flag(FLAG_NACK));
        assert!(!header.has_flag(FLAG_CTRL));
        header.unset_flag(FLAG_ACK);
        assert!(!header.has_flag(FLAG_ACK));
        // the data type nibble is untouched by flag operations
        assert_eq!(header.data_type().unwrap(), DataType::Int32);
    }

    #[test]
    fn negative_payload_survives() {
        let mut header = sample_header();
        header.agg_data = -42;
        let decoded = AggHeader::decode(&header.to_bytes()).unwrap();
        assert_eq!(decoded.agg_data, -42);
    }

    #[test]
    fn ack_reply_reverses_direction() {
        let mut data = sample_header();
        data.unset_flag(FLAG_ACK);
        let ack = data.ack_reply(77);
        assert_eq!(ack.src_addr, data.dst_addr);
        assert_eq!(ack.dst_addr, data.src_addr);
        assert_eq!(ack.src_qp, data.dst_qp);
        assert_eq!(ack.dst_qp, data.src_qp);
        assert_eq!(ack.psn, data.psn);
        assert_eq!(ack.agg_data, 77);
        assert_eq!(ack.length as usize, HEADER_LEN);
        assert!(ack.has_flag(FLAG_ACK));
        assert!(!ack.has_flag(FLAG_NACK));
    }

    #[test]
    fn nak_reply_carries_expected_psn() {
        let data = sample_header();
        let nak = data.nak_reply(4096);
        assert_eq!(nak.psn, 4096);
        assert!(nak.has_flag(FLAG_NACK));
        assert!(!nak.has_flag(FLAG_ACK));
    }
}
