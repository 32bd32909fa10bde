//! P-256 key agreement for provisioning.
//!
//! Public keys travel as 64 bytes `X || Y` (the uncompressed SEC1 point
//! without its `0x04` prefix).

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// Private scalar size
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Raw public key size (`X || Y`)
pub const PUBLIC_KEY_SIZE: usize = 64;
/// ECDH shared secret size
pub const SHARED_SECRET_SIZE: usize = 32;

/// Ephemeral provisioning key pair
///
/// The secret scalar is zeroized when dropped.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS CSPRNG
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Rebuild a key pair from a big-endian private scalar
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidLength(bytes.len()));
        }
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { secret })
    }

    /// Public key as `X || Y`
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        // Uncompressed encoding is 0x04 || X || Y
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    /// Compute the shared secret with a peer public key
    pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
        let peer = parse_public_key(peer_public)?;
        let shared =
            p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut out = [0u8; SHARED_SECRET_SIZE];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

/// Compute the ECDH shared secret from a raw private scalar and `X || Y`
pub fn ecdh_agree(
    private_key: &[u8],
    peer_public: &[u8],
) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
    KeyPair::from_private_bytes(private_key)?.agree(peer_public)
}

fn parse_public_key(raw: &[u8]) -> Result<PublicKey, CryptoError> {
    if raw.len() != PUBLIC_KEY_SIZE {
        return Err(CryptoError::InvalidLength(raw.len()));
    }
    let mut sec1 = [0u8; PUBLIC_KEY_SIZE + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}
