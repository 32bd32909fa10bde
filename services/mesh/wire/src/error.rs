//! Wire protocol error types.

use mesh_crypto::CryptoError;
use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete PDU (need more data)
    #[error("incomplete pdu")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Malformed PDU structure
    #[error("malformed pdu")]
    Malformed,

    /// Unknown proxy PDU type
    #[error("unknown type {0}")]
    Type(u8),

    /// Reserved or truncated opcode
    #[error("invalid opcode {0:#04x}")]
    Opcode(u8),

    /// Invalid TTL
    #[error("invalid ttl {0}")]
    Ttl(u8),

    /// Address not valid for this field
    #[error("invalid address {0:#06x}")]
    Address(u16),

    /// Sequence number outside 24 bits
    #[error("invalid sequence number {0:#x}")]
    Sequence(u32),

    /// Network or transport MIC did not verify
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Segmentation or reassembly failure
    #[error("segment: {0}")]
    Segment(#[from] SegmentError),

    /// Other crypto failure
    #[error("crypto: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for WireError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailure => WireError::AuthenticationFailure,
            other => WireError::Crypto(other),
        }
    }
}

/// Lower transport segmentation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// Segment count or header fields disagree with earlier segments
    #[error("inconsistent segment header")]
    Inconsistent,

    /// Same segment index seen twice with different content
    #[error("conflicting duplicate of segment {0}")]
    Conflict(u8),

    /// Payload needs more than 32 segments
    #[error("too many segments: {0}")]
    TooMany(usize),

    /// Segment belongs to an older message than the one in progress
    #[error("stale segment")]
    Stale,
}
