//! Lower transport PDU formats.
//!
//! ```text
//! Unsegmented access:  SEG=0 | AKF | AID(6)   UpperTransportPDU (<= 15)
//! Segmented access:    SEG=1 | AKF | AID(6)   SZMIC | SeqZero(13) | SegO(5) | SegN(5)   segment (<= 12)
//! Unsegmented control: SEG=0 | Opcode(7)      parameters (<= 11)
//! Segmented control:   SEG=1 | Opcode(7)      RFU   | SeqZero(13) | SegO(5) | SegN(5)   segment (<= 8)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Maximum upper transport access PDU carried unsegmented
pub const UNSEGMENTED_ACCESS_MAX: usize = 15;
/// Maximum control parameters carried unsegmented
pub const UNSEGMENTED_CONTROL_MAX: usize = 11;
/// Access segment payload size
pub const SEGMENT_ACCESS_SIZE: usize = 12;
/// Control segment payload size
pub const SEGMENT_CONTROL_SIZE: usize = 8;
/// Maximum number of segments per message
pub const MAX_SEGMENTS: usize = 32;
/// Mask for the 13-bit SeqZero field
pub const SEQ_ZERO_MASK: u32 = 0x1fff;

const SEG_BIT: u8 = 0x80;
const AKF_BIT: u8 = 0x40;
const AID_MASK: u8 = 0x3f;
const OPCODE_MASK: u8 = 0x7f;

/// Low 13 bits of a sequence number
pub fn seq_zero(seq: u32) -> u16 {
    (seq & SEQ_ZERO_MASK) as u16
}

/// Rebuild SeqAuth from any segment's sequence number and the SeqZero field
pub fn seq_auth(seq: u32, seq_zero: u16) -> u32 {
    let seq_zero = u32::from(seq_zero) & SEQ_ZERO_MASK;
    let mut auth = (seq & !SEQ_ZERO_MASK) | seq_zero;
    if seq_zero > seq & SEQ_ZERO_MASK {
        auth = auth.wrapping_sub(SEQ_ZERO_MASK + 1);
    }
    auth
}

/// Segmentation header shared by access and control segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// SZMIC for access segments, RFU (always false) for control
    pub szmic: bool,
    /// Low 13 bits of SeqAuth
    pub seq_zero: u16,
    /// Segment offset
    pub seg_o: u8,
    /// Last segment number
    pub seg_n: u8,
}

impl SegmentHeader {
    /// Pack into three octets
    pub fn pack(&self) -> [u8; 3] {
        let value = ((self.szmic as u32) << 23)
            | ((u32::from(self.seq_zero) & SEQ_ZERO_MASK) << 10)
            | ((u32::from(self.seg_o) & 0x1f) << 5)
            | (u32::from(self.seg_n) & 0x1f);
        let be = value.to_be_bytes();
        [be[1], be[2], be[3]]
    }

    /// Unpack from three octets
    pub fn unpack(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 3 {
            return Err(WireError::Incomplete);
        }
        let value = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let header = Self {
            szmic: value & (1 << 23) != 0,
            seq_zero: ((value >> 10) & SEQ_ZERO_MASK) as u16,
            seg_o: ((value >> 5) & 0x1f) as u8,
            seg_n: (value & 0x1f) as u8,
        };
        if header.seg_o > header.seg_n {
            return Err(WireError::Malformed);
        }
        Ok(header)
    }

    /// True for the final segment
    pub fn is_last(&self) -> bool {
        self.seg_o == self.seg_n
    }
}

/// Lower transport PDU variants, selected by the CTL and SEG bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    /// Whole upper transport access PDU
    UnsegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// Encrypted access payload and TransMIC
        upper: Bytes,
    },
    /// One segment of an upper transport access PDU
    SegmentedAccess {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// Segmentation header
        header: SegmentHeader,
        /// Segment payload
        segment: Bytes,
    },
    /// Whole transport control message
    UnsegmentedControl {
        /// Control opcode
        opcode: u8,
        /// Parameters
        params: Bytes,
    },
    /// One segment of a transport control message
    SegmentedControl {
        /// Control opcode
        opcode: u8,
        /// Segmentation header
        header: SegmentHeader,
        /// Segment payload
        segment: Bytes,
    },
}

impl LowerTransportPdu {
    /// Segmentation header, if segmented
    pub fn segment_header(&self) -> Option<&SegmentHeader> {
        match self {
            LowerTransportPdu::SegmentedAccess { header, .. }
            | LowerTransportPdu::SegmentedControl { header, .. } => Some(header),
            _ => None,
        }
    }

    /// True for control PDUs
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            LowerTransportPdu::UnsegmentedControl { .. } | LowerTransportPdu::SegmentedControl { .. }
        )
    }

    /// Serialize
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + SEGMENT_ACCESS_SIZE);
        match self {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper } => {
                buf.put_u8(akf_aid(*akf, *aid));
                buf.put_slice(upper);
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                header,
                segment,
            } => {
                buf.put_u8(SEG_BIT | akf_aid(*akf, *aid));
                buf.put_slice(&header.pack());
                buf.put_slice(segment);
            }
            LowerTransportPdu::UnsegmentedControl { opcode, params } => {
                buf.put_u8(opcode & OPCODE_MASK);
                buf.put_slice(params);
            }
            LowerTransportPdu::SegmentedControl {
                opcode,
                header,
                segment,
            } => {
                let rfu = SegmentHeader {
                    szmic: false,
                    ..*header
                };
                buf.put_u8(SEG_BIT | (opcode & OPCODE_MASK));
                buf.put_slice(&rfu.pack());
                buf.put_slice(segment);
            }
        }
        buf.freeze()
    }

    /// Parse a lower transport PDU, `ctl` taken from the network header
    pub fn decode(ctl: bool, bytes: &[u8]) -> Result<Self, WireError> {
        let (&first, rest) = bytes.split_first().ok_or(WireError::Incomplete)?;
        let segmented = first & SEG_BIT != 0;

        let pdu = match (ctl, segmented) {
            (false, false) => {
                if rest.is_empty() || rest.len() > UNSEGMENTED_ACCESS_MAX {
                    return Err(WireError::Size(rest.len()));
                }
                LowerTransportPdu::UnsegmentedAccess {
                    akf: first & AKF_BIT != 0,
                    aid: first & AID_MASK,
                    upper: Bytes::copy_from_slice(rest),
                }
            }
            (false, true) => {
                let header = SegmentHeader::unpack(rest)?;
                let segment = &rest[3..];
                if segment.is_empty() || segment.len() > SEGMENT_ACCESS_SIZE {
                    return Err(WireError::Size(segment.len()));
                }
                LowerTransportPdu::SegmentedAccess {
                    akf: first & AKF_BIT != 0,
                    aid: first & AID_MASK,
                    header,
                    segment: Bytes::copy_from_slice(segment),
                }
            }
            (true, false) => {
                if rest.len() > UNSEGMENTED_CONTROL_MAX {
                    return Err(WireError::Size(rest.len()));
                }
                LowerTransportPdu::UnsegmentedControl {
                    opcode: first & OPCODE_MASK,
                    params: Bytes::copy_from_slice(rest),
                }
            }
            (true, true) => {
                let mut header = SegmentHeader::unpack(rest)?;
                header.szmic = false;
                let segment = &rest[3..];
                if segment.is_empty() || segment.len() > SEGMENT_CONTROL_SIZE {
                    return Err(WireError::Size(segment.len()));
                }
                LowerTransportPdu::SegmentedControl {
                    opcode: first & OPCODE_MASK,
                    header,
                    segment: Bytes::copy_from_slice(segment),
                }
            }
        };

        Ok(pdu)
    }
}

fn akf_aid(akf: bool, aid: u8) -> u8 {
    ((akf as u8) << 6) | (aid & AID_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_zero() {
        assert_eq!(seq_zero(0x3129ab), 0x09ab);
        assert_eq!(seq_zero(0x3129ac), 0x09ac);
    }

    #[test]
    fn test_seq_auth() {
        assert_eq!(seq_auth(0x3129ac, 0x09ab), 0x3129ab);
        assert_eq!(seq_auth(0x3129ab, 0x09ab), 0x3129ab);
        // SeqZero from before a 13-bit rollover
        assert_eq!(seq_auth(0x002001, 0x1fff), 0x001fff);
    }

    #[test]
    fn test_segment_header_pack() {
        let header = SegmentHeader {
            szmic: false,
            seq_zero: 0x09ab,
            seg_o: 1,
            seg_n: 1,
        };
        assert_eq!(header.pack(), [0x26, 0xac, 0x21]);
        assert_eq!(SegmentHeader::unpack(&[0x26, 0xac, 0x21]).unwrap(), header);
        assert!(header.is_last());

        let szmic = SegmentHeader::unpack(&[0x80, 0x00, 0x00]).unwrap();
        assert!(szmic.szmic);
    }

    #[test]
    fn test_segment_header_rejects_offset_past_end() {
        // SegO = 2, SegN = 1
        assert_eq!(SegmentHeader::unpack(&[0x00, 0x00, 0x41]), Err(WireError::Malformed));
        assert_eq!(SegmentHeader::unpack(&[0x00, 0x00]), Err(WireError::Incomplete));
    }

    #[test]
    fn test_decode_unsegmented_access() {
        let bytes = hex::decode("0089511bf1d1a81c11dcef").unwrap();
        let pdu = LowerTransportPdu::decode(false, &bytes).unwrap();
        match &pdu {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper } => {
                assert!(!akf);
                assert_eq!(*aid, 0);
                assert_eq!(upper.len(), 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pdu.encode().as_ref(), bytes.as_slice());
    }

    #[test]
    fn test_decode_segmented_access() {
        let bytes = hex::decode("8026ac01ee9dddfd2169326d23f3afdf").unwrap();
        let pdu = LowerTransportPdu::decode(false, &bytes).unwrap();
        let header = pdu.segment_header().copied().unwrap();
        assert_eq!(header.seq_zero, 0x09ab);
        assert_eq!(header.seg_o, 0);
        assert_eq!(header.seg_n, 1);
        assert_eq!(pdu.encode().as_ref(), bytes.as_slice());
    }

    #[test]
    fn test_control_rfu_bit_cleared() {
        let pdu = LowerTransportPdu::SegmentedControl {
            opcode: 0x0a,
            header: SegmentHeader {
                szmic: true,
                seq_zero: 1,
                seg_o: 0,
                seg_n: 1,
            },
            segment: Bytes::from_static(&[0u8; 8]),
        };
        let encoded = pdu.encode();
        assert_eq!(encoded[0], 0x8a);
        assert_eq!(encoded[1] & 0x80, 0);

        let decoded = LowerTransportPdu::decode(true, &encoded).unwrap();
        assert!(decoded.is_control());
        assert!(!decoded.segment_header().unwrap().szmic);
    }

    #[test]
    fn test_decode_size_limits() {
        let mut oversized = vec![0x00];
        oversized.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            LowerTransportPdu::decode(false, &oversized),
            Err(WireError::Size(16))
        );
        assert_eq!(LowerTransportPdu::decode(false, &[]), Err(WireError::Incomplete));

        let mut control = vec![0x0a];
        control.extend_from_slice(&[0u8; 12]);
        assert_eq!(
            LowerTransportPdu::decode(true, &control),
            Err(WireError::Size(12))
        );
    }
}
