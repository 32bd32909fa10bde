//! Bluetooth Mesh PDU codecs: proxy framing, network layer, lower and upper
//! transport, and the access opcode envelope.
//!
//! This crate holds the synchronous, allocation-light half of the mesh stack.
//! Everything here is a pure function of its inputs plus caller-supplied keys;
//! sequence number allocation and key lookup live in the node layer.
//!
//! ## Features
//!
//! - **Proxy PDU**: one-byte `SAR | type` header with MTU splitting and reassembly
//! - **Network PDU**: AES-CCM encryption with NetMIC and PECB header obfuscation
//! - **Lower Transport**: segmented and unsegmented access/control PDUs
//! - **Reassembly**: concurrent, per `(src, seq_zero)`, fixed 32 slots, timeout driven by the caller
//! - **Upper Transport**: device and application key nonces, 32/64-bit TransMIC
//! - **Access**: 1, 2 and 3 octet opcodes
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-------------------------------------------+
//! | Proxy header (1B)    | SAR(2) | type(6)                          |
//! +----------------------+-------------------------------------------+
//! | IVI|NID (1B)         | clear                                     |
//! +----------------------+-------------------------------------------+
//! | CTL|TTL SEQ SRC (6B) | obfuscated                                |
//! +----------------------+-------------------------------------------+
//! | DST (2B)             | encrypted                                 |
//! +----------------------+-------------------------------------------+
//! | Lower transport PDU  | encrypted (<= 16B access, <= 12B control) |
//! +----------------------+-------------------------------------------+
//! | NetMIC               | 4B access, 8B control                     |
//! +----------------------+-------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod control;
pub mod error;
pub mod header;
pub mod lower;
pub mod message;
pub mod network;
pub mod proxy;
pub mod segment;
pub mod upper;

// Re-export main types
pub use access::{AccessPayload, Opcode, MAX_ACCESS_PAYLOAD};
pub use control::{full_block_ack, ControlPayload, SegmentAck, SEGMENT_ACK_OPCODE};
pub use error::{SegmentError, WireError};
pub use header::{
    is_unicast, AddressType, NetworkHeader, ALL_NODES_ADDRESS, MAX_TTL, SEQUENCE_NUMBER_MASK,
    SEQUENCE_NUMBER_MAX, UNASSIGNED_ADDRESS,
};
pub use lower::{
    seq_auth, seq_zero, LowerTransportPdu, SegmentHeader, MAX_SEGMENTS, SEGMENT_ACCESS_SIZE,
    SEGMENT_CONTROL_SIZE, UNSEGMENTED_ACCESS_MAX, UNSEGMENTED_CONTROL_MAX,
};
pub use message::{
    AccessMessage, AssembledPdu, ControlMessage, KeySelector, MeshMessage, UpperTransportPdu,
};
pub use network::{
    max_transport_pdu, net_mic_size, network_nonce, obfuscate, NetworkPdu, NetworkPduBuilder,
    NETWORK_PDU_MAX,
};
pub use proxy::{
    ProxyPdu, ProxyPduType, ProxyReassembler, SarFlag, PROVISIONING_PDU_MAX, PROXY_HEADER_SIZE,
};
pub use segment::{ReassemblyKey, Reassembler, Segmenter, DEFAULT_REASSEMBLY_TIMEOUT};
pub use upper::{
    access_nonce, decrypt_access, encrypt_access, AccessNonceParams, UpperTransportKey,
    APPLICATION_NONCE, DEVICE_NONCE,
};
