//! Bluetooth Mesh security toolbox.
//!
//! This crate provides the cryptographic building blocks used by provisioning
//! and by the network and transport layers. Every function is pure: no I/O,
//! no global state, and verification failures are returned as values.
//!
//! ## Functions
//!
//! - **s1**: salt generation (AES-CMAC with a zero key)
//! - **k1**: key derivation used for confirmation, session and device keys
//! - **k2**: network key expansion into NID, encryption key and privacy key
//! - **k3**: 64-bit network ID derivation
//! - **k4**: 6-bit application key identifier (AID)
//! - **AES-CMAC / AES-ECB / AES-CCM**: MAC, obfuscation block and AEAD
//! - **P-256 ECDH**: shared secret agreement for provisioning

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod ecdh;
pub mod error;
pub mod kdf;
pub mod primitives;

// Re-export main types
pub use aead::{aes_ccm_decrypt, aes_ccm_encrypt, MicSize, NONCE_SIZE};
pub use ecdh::{ecdh_agree, KeyPair, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};
pub use error::CryptoError;
pub use kdf::{k1, k2, k3, k4, s1, NetworkKeys, K2_MASTER_INPUT, PRCK, PRDK, PRSK, PRSN};
pub use primitives::{
    aes_ecb_encrypt, cmac_aes128, constant_time_eq, random_bytes, Key128, KEY_SIZE,
};
