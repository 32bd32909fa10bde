//! Proxy PDU framing.
//!
//! Every PDU on the GATT bearer starts with a one-byte header
//! `SAR (2 bits) | type (6 bits)`. Payloads larger than the bearer MTU are
//! split with the SAR field and rebuilt by [`ProxyReassembler`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WireError;
use crate::network::NETWORK_PDU_MAX;

/// Proxy header size in bytes
pub const PROXY_HEADER_SIZE: usize = 1;

/// Largest provisioning PDU (Public Key: opcode plus 64 bytes)
pub const PROVISIONING_PDU_MAX: usize = 65;

/// Proxy PDU message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyPduType {
    /// Network PDU
    Network = 0x00,
    /// Mesh beacon
    Beacon = 0x01,
    /// Proxy configuration
    ProxyConfig = 0x02,
    /// Provisioning PDU
    Provisioning = 0x03,
}

impl ProxyPduType {
    /// Largest reassembled message of this type
    pub fn max_message_size(&self) -> usize {
        match self {
            ProxyPduType::Provisioning => PROVISIONING_PDU_MAX,
            ProxyPduType::Network | ProxyPduType::Beacon | ProxyPduType::ProxyConfig => {
                NETWORK_PDU_MAX
            }
        }
    }
}

impl TryFrom<u8> for ProxyPduType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ProxyPduType::Network),
            0x01 => Ok(ProxyPduType::Beacon),
            0x02 => Ok(ProxyPduType::ProxyConfig),
            0x03 => Ok(ProxyPduType::Provisioning),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// Segmentation and reassembly flag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SarFlag {
    /// Whole message in one PDU
    Complete = 0,
    /// First segment
    First = 1,
    /// Middle segment
    Continuation = 2,
    /// Last segment
    Last = 3,
}

impl From<u8> for SarFlag {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0 => SarFlag::Complete,
            1 => SarFlag::First,
            2 => SarFlag::Continuation,
            _ => SarFlag::Last,
        }
    }
}

/// A single proxy PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPdu {
    /// SAR field
    pub sar: SarFlag,
    /// Message type
    pub typ: ProxyPduType,
    /// Payload after the header
    pub payload: Bytes,
}

impl ProxyPdu {
    /// Create an unsegmented proxy PDU
    pub fn new(typ: ProxyPduType, payload: Bytes) -> Self {
        Self {
            sar: SarFlag::Complete,
            typ,
            payload,
        }
    }

    /// Header octet
    pub fn header(&self) -> u8 {
        ((self.sar as u8) << 6) | self.typ as u8
    }

    /// Encode header and payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PROXY_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a proxy PDU
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (&header, rest) = bytes.split_first().ok_or(WireError::Incomplete)?;
        Ok(Self {
            sar: SarFlag::from(header >> 6),
            typ: ProxyPduType::try_from(header & 0x3f)?,
            payload: Bytes::copy_from_slice(rest),
        })
    }

    /// Split a payload into encoded proxy PDUs no larger than `mtu`
    pub fn split(typ: ProxyPduType, payload: &[u8], mtu: usize) -> Result<Vec<Bytes>, WireError> {
        if mtu <= PROXY_HEADER_SIZE {
            return Err(WireError::Size(mtu));
        }
        let room = mtu - PROXY_HEADER_SIZE;

        if payload.len() <= room {
            return Ok(vec![
                Self::new(typ, Bytes::copy_from_slice(payload)).encode()
            ]);
        }

        let chunks: Vec<&[u8]> = payload.chunks(room).collect();
        let last = chunks.len() - 1;
        let pdus = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let sar = match i {
                    0 => SarFlag::First,
                    i if i == last => SarFlag::Last,
                    _ => SarFlag::Continuation,
                };
                ProxyPdu {
                    sar,
                    typ,
                    payload: Bytes::copy_from_slice(chunk),
                }
                .encode()
            })
            .collect();

        Ok(pdus)
    }
}

/// Reassembler for SAR-segmented proxy PDUs from one bearer
#[derive(Debug, Default)]
pub struct ProxyReassembler {
    pending: Option<(ProxyPduType, BytesMut)>,
}

impl ProxyReassembler {
    /// Create a new reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a segmented message is in progress
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Add a PDU and return the complete message when available
    pub fn push(&mut self, pdu: ProxyPdu) -> Result<Option<(ProxyPduType, Bytes)>, WireError> {
        match pdu.sar {
            SarFlag::Complete => {
                if self.pending.take().is_some() {
                    debug!("Unsegmented proxy PDU interrupted a segmented message");
                    return Err(WireError::Malformed);
                }
                Ok(Some((pdu.typ, pdu.payload)))
            }
            SarFlag::First => {
                if self.pending.take().is_some() {
                    debug!("Restarting proxy reassembly on new first segment");
                }
                check_size(pdu.typ, pdu.payload.len())?;
                let mut buf = BytesMut::with_capacity(pdu.typ.max_message_size());
                buf.extend_from_slice(&pdu.payload);
                self.pending = Some((pdu.typ, buf));
                Ok(None)
            }
            SarFlag::Continuation | SarFlag::Last => {
                let (typ, mut buf) = self.pending.take().ok_or(WireError::Malformed)?;
                if typ != pdu.typ {
                    return Err(WireError::Malformed);
                }
                check_size(typ, buf.len() + pdu.payload.len())?;
                buf.extend_from_slice(&pdu.payload);

                if pdu.sar == SarFlag::Last {
                    Ok(Some((typ, buf.freeze())))
                } else {
                    self.pending = Some((typ, buf));
                    Ok(None)
                }
            }
        }
    }
}

fn check_size(typ: ProxyPduType, len: usize) -> Result<(), WireError> {
    if len > typ.max_message_size() {
        debug!("Dropping oversized segmented {:?} proxy message", typ);
        return Err(WireError::Size(len));
    }
    Ok(())
}
