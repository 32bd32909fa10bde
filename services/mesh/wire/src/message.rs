//! Messages delivered to and accepted from the application.

use bytes::Bytes;

use crate::access::AccessPayload;
use crate::control::ControlPayload;

/// Key an access message was (or is to be) protected with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySelector {
    /// Device key of the peer (or of this node)
    Device,
    /// Application key by global key index
    Application(u16),
}

/// Decrypted access message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMessage {
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// TTL of the (last) network PDU
    pub ttl: u8,
    /// SeqAuth of the message
    pub seq_auth: u32,
    /// IV index used
    pub iv_index: u32,
    /// Key that decrypted the payload
    pub key: KeySelector,
    /// Opcode and parameters
    pub payload: AccessPayload,
}

/// Transport control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// TTL of the (last) network PDU
    pub ttl: u8,
    /// Decoded payload
    pub payload: ControlPayload,
}

/// Inbound mesh message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    /// Access layer message
    Access(AccessMessage),
    /// Transport control message
    Control(ControlMessage),
}

impl MeshMessage {
    /// Source address
    pub fn src(&self) -> u16 {
        match self {
            MeshMessage::Access(msg) => msg.src,
            MeshMessage::Control(msg) => msg.src,
        }
    }

    /// Destination address
    pub fn dst(&self) -> u16 {
        match self {
            MeshMessage::Access(msg) => msg.dst,
            MeshMessage::Control(msg) => msg.dst,
        }
    }
}

/// Upper transport PDU before access decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperTransportPdu {
    /// Encrypted access payload and TransMIC
    Access {
        /// Application key flag
        akf: bool,
        /// Application key identifier
        aid: u8,
        /// 64-bit TransMIC in use
        szmic: bool,
        /// Ciphertext and MIC
        payload: Bytes,
    },
    /// Control opcode and parameters
    Control {
        /// 7-bit opcode
        opcode: u8,
        /// Parameters
        params: Bytes,
    },
}

/// Complete upper transport PDU with the network context it arrived in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPdu {
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// TTL of the last network PDU
    pub ttl: u8,
    /// SeqAuth (sequence number for unsegmented PDUs)
    pub seq_auth: u32,
    /// IV index
    pub iv_index: u32,
    /// Upper transport PDU
    pub pdu: UpperTransportPdu,
}
