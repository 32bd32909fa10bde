//! Access layer opcode envelope.
//!
//! Opcodes are 1, 2 or 3 octets; the two high bits of the first octet
//! select the form. Model semantics are left to the application.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Largest access payload (opcode plus parameters) in one message
pub const MAX_ACCESS_PAYLOAD: usize = 380;

/// Access message opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// `0xxxxxxx`, 0x7f reserved
    OneOctet(u8),
    /// `10xxxxxx xxxxxxxx`
    TwoOctet(u16),
    /// `11xxxxxx` followed by a company identifier (little-endian on the wire)
    Vendor {
        /// 6-bit vendor opcode
        opcode: u8,
        /// Bluetooth SIG company identifier
        company_id: u16,
    },
}

impl Opcode {
    /// Encoded length in octets
    pub fn len(&self) -> usize {
        match self {
            Opcode::OneOctet(_) => 1,
            Opcode::TwoOctet(_) => 2,
            Opcode::Vendor { .. } => 3,
        }
    }

    /// Opcodes are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check reserved values and form bits
    pub fn validate(&self) -> Result<(), WireError> {
        match *self {
            Opcode::OneOctet(op) if op >= 0x7f => Err(WireError::Opcode(op)),
            Opcode::TwoOctet(op) if op & 0xc000 != 0x8000 => Err(WireError::Opcode((op >> 8) as u8)),
            Opcode::Vendor { opcode, .. } if opcode > 0x3f => Err(WireError::Opcode(opcode)),
            _ => Ok(()),
        }
    }

    /// Append the wire form to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Opcode::OneOctet(op) => buf.put_u8(op),
            Opcode::TwoOctet(op) => buf.put_u16(op),
            Opcode::Vendor { opcode, company_id } => {
                buf.put_u8(0xc0 | (opcode & 0x3f));
                buf.put_u16_le(company_id);
            }
        }
    }

    /// Parse an opcode from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let first = *bytes.first().ok_or(WireError::Incomplete)?;
        let opcode = match first >> 6 {
            0b00 | 0b01 => {
                if first == 0x7f {
                    return Err(WireError::Opcode(first));
                }
                Opcode::OneOctet(first)
            }
            0b10 => {
                let second = *bytes.get(1).ok_or(WireError::Opcode(first))?;
                Opcode::TwoOctet(u16::from_be_bytes([first, second]))
            }
            _ => {
                if bytes.len() < 3 {
                    return Err(WireError::Opcode(first));
                }
                Opcode::Vendor {
                    opcode: first & 0x3f,
                    company_id: u16::from_le_bytes([bytes[1], bytes[2]]),
                }
            }
        };
        Ok(opcode)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::OneOctet(op) => write!(f, "{:02x}", op),
            Opcode::TwoOctet(op) => write!(f, "{:04x}", op),
            Opcode::Vendor { opcode, company_id } => {
                write!(f, "{:02x}{:04x}", 0xc0 | opcode, company_id)
            }
        }
    }
}

/// Opcode plus model parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPayload {
    /// Message opcode
    pub opcode: Opcode,
    /// Model-specific parameters
    pub params: Bytes,
}

impl AccessPayload {
    /// Create a payload
    pub fn new(opcode: Opcode, params: Bytes) -> Self {
        Self { opcode, params }
    }

    /// Serialize opcode and parameters
    pub fn encode(&self) -> Result<Bytes, WireError> {
        self.opcode.validate()?;
        let len = self.opcode.len() + self.params.len();
        if len > MAX_ACCESS_PAYLOAD {
            return Err(WireError::Size(len));
        }
        let mut buf = BytesMut::with_capacity(len);
        self.opcode.encode(&mut buf);
        buf.put_slice(&self.params);
        Ok(buf.freeze())
    }

    /// Parse opcode and parameters
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let opcode = Opcode::decode(bytes)?;
        Ok(Self {
            opcode,
            params: Bytes::copy_from_slice(&bytes[opcode.len()..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_two_octet() {
        let payload = AccessPayload::decode(&hex::decode("800300563412").unwrap()).unwrap();
        assert_eq!(payload.opcode, Opcode::TwoOctet(0x8003));
        assert_eq!(payload.params.as_ref(), &[0x00, 0x56, 0x34, 0x12]);
        assert_eq!(payload.opcode.to_string(), "8003");
    }

    #[test]
    fn test_one_octet_and_reserved() {
        let payload = AccessPayload::decode(&[0x04, 0xaa]).unwrap();
        assert_eq!(payload.opcode, Opcode::OneOctet(0x04));
        assert_eq!(Opcode::decode(&[0x7f]), Err(WireError::Opcode(0x7f)));
        assert_eq!(
            AccessPayload::new(Opcode::OneOctet(0x7f), Bytes::new()).encode(),
            Err(WireError::Opcode(0x7f))
        );
    }

    #[test]
    fn test_vendor_company_id_little_endian() {
        let payload = AccessPayload::new(
            Opcode::Vendor {
                opcode: 0x01,
                company_id: 0x0059,
            },
            Bytes::from_static(&[0xff]),
        );
        let encoded = payload.encode().unwrap();
        assert_eq!(encoded.as_ref(), &[0xc1, 0x59, 0x00, 0xff]);
        assert_eq!(AccessPayload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_truncated_opcodes() {
        assert_eq!(Opcode::decode(&[]), Err(WireError::Incomplete));
        assert_eq!(Opcode::decode(&[0x80]), Err(WireError::Opcode(0x80)));
        assert_eq!(Opcode::decode(&[0xc1, 0x59]), Err(WireError::Opcode(0xc1)));
    }

    #[test]
    fn test_two_octet_form_bits_checked() {
        assert_eq!(
            Opcode::TwoOctet(0x4003).validate(),
            Err(WireError::Opcode(0x40))
        );
        assert!(Opcode::TwoOctet(0x8201).validate().is_ok());
    }
}
