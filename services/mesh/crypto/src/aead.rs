//! AES-CCM with the 13-byte nonce used by every mesh layer.

use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;

use crate::error::CryptoError;
use crate::primitives::Key128;

/// CCM nonce size used by network, transport and provisioning
pub const NONCE_SIZE: usize = 13;

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// Message integrity check length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicSize {
    /// 32-bit MIC
    Short,
    /// 64-bit MIC
    Long,
}

impl MicSize {
    /// MIC length in bytes
    pub fn size(self) -> usize {
        match self {
            MicSize::Short => 4,
            MicSize::Long => 8,
        }
    }
}

/// Encrypt and authenticate, returning `ciphertext || mic`
pub fn aes_ccm_encrypt(
    key: &Key128,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let mut buf = plaintext.to_vec();
    let nonce = GenericArray::from_slice(nonce);
    let key = GenericArray::from_slice(key);

    match mic {
        MicSize::Short => {
            let tag = Ccm32::new(key)
                .encrypt_in_place_detached(nonce, aad, &mut buf)
                .map_err(|_| CryptoError::InvalidLength(plaintext.len()))?;
            buf.extend_from_slice(&tag);
        }
        MicSize::Long => {
            let tag = Ccm64::new(key)
                .encrypt_in_place_detached(nonce, aad, &mut buf)
                .map_err(|_| CryptoError::InvalidLength(plaintext.len()))?;
            buf.extend_from_slice(&tag);
        }
    }

    Ok(buf)
}

/// Verify and decrypt `ciphertext || mic`
pub fn aes_ccm_decrypt(
    key: &Key128,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    sealed: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let mic_len = mic.size();
    if sealed.len() < mic_len {
        return Err(CryptoError::InvalidLength(sealed.len()));
    }

    let (ciphertext, tag) = sealed.split_at(sealed.len() - mic_len);
    let mut buf = ciphertext.to_vec();
    let nonce = GenericArray::from_slice(nonce);
    let key = GenericArray::from_slice(key);

    let result = match mic {
        MicSize::Short => Ccm32::new(key).decrypt_in_place_detached(
            nonce,
            aad,
            &mut buf,
            GenericArray::from_slice(tag),
        ),
        MicSize::Long => Ccm64::new(key).decrypt_in_place_detached(
            nonce,
            aad,
            &mut buf,
            GenericArray::from_slice(tag),
        ),
    };

    result.map_err(|_| CryptoError::AuthenticationFailure)?;
    Ok(buf)
}
