//! Transport control messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::lower::SEQ_ZERO_MASK;

/// Segment Acknowledgment opcode
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

/// Segment Acknowledgment parameter size
pub const SEGMENT_ACK_SIZE: usize = 6;

/// Segment Acknowledgment message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAck {
    /// Sent by a friend on behalf of a low power node
    pub obo: bool,
    /// SeqZero of the acknowledged message
    pub seq_zero: u16,
    /// Bit `n` set when segment `n` was received
    pub block_ack: u32,
}

impl SegmentAck {
    /// Encode parameters: `OBO | SeqZero | RFU(2)` then `BlockAck`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SEGMENT_ACK_SIZE);
        let head = ((self.obo as u16) << 15) | ((self.seq_zero & SEQ_ZERO_MASK as u16) << 2);
        buf.put_u16(head);
        buf.put_u32(self.block_ack);
        buf.freeze()
    }

    /// Decode parameters
    pub fn decode(mut params: &[u8]) -> Result<Self, WireError> {
        if params.len() != SEGMENT_ACK_SIZE {
            return Err(WireError::Size(params.len()));
        }
        let head = params.get_u16();
        let block_ack = params.get_u32();
        Ok(Self {
            obo: head & 0x8000 != 0,
            seq_zero: (head >> 2) & SEQ_ZERO_MASK as u16,
            block_ack,
        })
    }

    /// True when every segment `0..=seg_n` is acknowledged
    pub fn acknowledges_all(&self, seg_n: u8) -> bool {
        let expected = full_block_ack(seg_n);
        self.block_ack & expected == expected
    }
}

/// Block ack with bits `0..=seg_n` set
pub fn full_block_ack(seg_n: u8) -> u32 {
    if seg_n >= 31 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// Decoded transport control payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPayload {
    /// Segment Acknowledgment
    SegmentAck(SegmentAck),
    /// Any other control opcode, carried opaquely
    Other {
        /// 7-bit opcode
        opcode: u8,
        /// Parameters
        params: Bytes,
    },
}

impl ControlPayload {
    /// Opcode of this payload
    pub fn opcode(&self) -> u8 {
        match self {
            ControlPayload::SegmentAck(_) => SEGMENT_ACK_OPCODE,
            ControlPayload::Other { opcode, .. } => *opcode,
        }
    }

    /// Parameters of this payload
    pub fn params(&self) -> Bytes {
        match self {
            ControlPayload::SegmentAck(ack) => ack.encode(),
            ControlPayload::Other { params, .. } => params.clone(),
        }
    }

    /// Interpret opcode and parameters
    pub fn decode(opcode: u8, params: Bytes) -> Result<Self, WireError> {
        match opcode & 0x7f {
            SEGMENT_ACK_OPCODE => Ok(ControlPayload::SegmentAck(SegmentAck::decode(&params)?)),
            opcode => Ok(ControlPayload::Other { opcode, params }),
        }
    }
}
