//! Clear network header fields and address classification.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Largest TTL encodable in 7 bits
pub const MAX_TTL: u8 = 0x7f;

/// Highest sequence number a node may transmit
pub const SEQUENCE_NUMBER_MAX: u32 = 0x00ff_fffe;

/// Mask for the 24-bit sequence field
pub const SEQUENCE_NUMBER_MASK: u32 = 0x00ff_ffff;

/// Unassigned address
pub const UNASSIGNED_ADDRESS: u16 = 0x0000;

/// All-nodes fixed group address
pub const ALL_NODES_ADDRESS: u16 = 0xffff;

/// Mesh address classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// 0x0000
    Unassigned,
    /// 0x0001..=0x7fff
    Unicast,
    /// 0x8000..=0xbfff
    Virtual,
    /// 0xc000..=0xffff
    Group,
}

impl AddressType {
    /// Classify a 16-bit address
    pub fn of(addr: u16) -> Self {
        match addr {
            0x0000 => AddressType::Unassigned,
            0x0001..=0x7fff => AddressType::Unicast,
            0x8000..=0xbfff => AddressType::Virtual,
            _ => AddressType::Group,
        }
    }
}

/// True for addresses in the unicast range
pub fn is_unicast(addr: u16) -> bool {
    AddressType::of(addr) == AddressType::Unicast
}

/// Clear (pre-obfuscation) network header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHeader {
    /// Control message flag; selects the 64-bit NetMIC
    pub ctl: bool,
    /// Time to live (0..=127)
    pub ttl: u8,
    /// 24-bit sequence number
    pub seq: u32,
    /// Source unicast address
    pub src: u16,
    /// Destination address
    pub dst: u16,
}

impl NetworkHeader {
    /// Create a header for an access message
    pub fn access(ttl: u8, seq: u32, src: u16, dst: u16) -> Self {
        Self {
            ctl: false,
            ttl,
            seq,
            src,
            dst,
        }
    }

    /// Create a header for a control message
    pub fn control(ttl: u8, seq: u32, src: u16, dst: u16) -> Self {
        Self {
            ctl: true,
            ..Self::access(ttl, seq, src, dst)
        }
    }

    /// `CTL || TTL` octet
    pub fn ctl_ttl(&self) -> u8 {
        ((self.ctl as u8) << 7) | (self.ttl & MAX_TTL)
    }

    /// Check field ranges before encoding
    pub fn validate(&self) -> Result<(), WireError> {
        if self.ttl > MAX_TTL {
            return Err(WireError::Ttl(self.ttl));
        }
        if self.seq > SEQUENCE_NUMBER_MASK {
            return Err(WireError::Sequence(self.seq));
        }
        if !is_unicast(self.src) {
            return Err(WireError::Address(self.src));
        }
        if self.dst == UNASSIGNED_ADDRESS {
            return Err(WireError::Address(self.dst));
        }
        Ok(())
    }
}
