//! Provisioning error types.

use mesh_crypto::CryptoError;
use thiserror::Error;

use crate::pdu::FailureCode;
use crate::transport::TransportError;

/// Errors surfaced by the provisioning state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// Malformed or unexpected PDU
    #[error("protocol error: {0}")]
    Protocol(FailureCode),

    /// Confirmation did not match the revealed random
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Device sent a Provisioning Failed PDU
    #[error("device reported failure: {0}")]
    Remote(FailureCode),

    /// Transport callback failed
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Caller reported a timeout
    #[error("provisioning timed out")]
    Timeout,

    /// Provisioning was aborted locally
    #[error("provisioning aborted")]
    Aborted,

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Provisioning parameters or auth input rejected
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Cryptographic primitive failed
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}
