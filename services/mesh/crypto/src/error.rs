//! Crypto error types.

use thiserror::Error;

/// Errors returned by the security toolbox
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// MIC did not verify
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Peer public key is not a valid P-256 point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Private key scalar is zero or out of range
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Input length not accepted by the primitive
    #[error("invalid length: {0}")]
    InvalidLength(usize),
}
