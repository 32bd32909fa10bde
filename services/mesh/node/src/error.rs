//! Node error types.

use mesh_provisioning::{ProvisioningError, TransportError};
use mesh_wire::{ProxyPduType, WireError};
use thiserror::Error;

/// Errors raised by node records, stores and the node context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The 24-bit sequence space is used up for this IV index
    #[error("sequence numbers exhausted")]
    SequenceExhausted,

    /// Sequence numbers only move forward within one IV index
    #[error("sequence number {requested:#08x} is behind {current:#08x}")]
    SequenceRewind {
        /// Next number the record would issue
        current: u32,
        /// Rejected value
        requested: u32,
    },

    /// The IV index only moves forward
    #[error("iv index {requested:#x} is not after {current:#x}")]
    IvIndexRewind {
        /// Current IV index
        current: u32,
        /// Rejected value
        requested: u32,
    },

    /// A segmented message was not completed in time
    #[error("reassembly timed out for src={src:#06x} seq_zero={seq_zero:#x}")]
    ReassemblyTimeout {
        /// Source address
        src: u16,
        /// SeqZero of the message
        seq_zero: u16,
    },

    /// Wire codec failure
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Transport callback failed
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Provisioning failure
    #[error("provisioning: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// No application key bound to this index
    #[error("unknown application key index {0:#05x}")]
    UnknownAppKey(u16),

    /// No application key matches this AID
    #[error("no application key with aid {0:#04x}")]
    UnknownAid(u8),

    /// Address outside the range required here
    #[error("invalid address {0:#06x}")]
    InvalidAddress(u16),

    /// Proxy PDU type this node does not handle
    #[error("unsupported proxy pdu type {0:?}")]
    UnsupportedPdu(ProxyPduType),

    /// Invalid node configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Node store failure
    #[error("store: {0}")]
    Store(String),
}
