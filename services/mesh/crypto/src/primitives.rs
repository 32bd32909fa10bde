//! AES-128 based primitives shared by the key derivation functions and the
//! network layer.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// AES-128 key size in bytes
pub const KEY_SIZE: usize = 16;

/// 128-bit key
pub type Key128 = [u8; KEY_SIZE];

/// AES-CMAC over AES-128 (RFC 4493)
pub fn cmac_aes128(key: &Key128, message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(message);
    let tag = mac.finalize().into_bytes();

    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

/// Encrypt a single block with AES-128 in ECB mode
pub fn aes_ecb_encrypt(key: &Key128, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);

    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

/// Fill an array from the operating system CSPRNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Compare two byte strings without data-dependent early exit
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_cmac_rfc4493_vectors() {
        let k = key("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(
            hex::encode(cmac_aes128(&k, &[])),
            "bb1d6929e95937287fa37d129b756746"
        );
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(
            hex::encode(cmac_aes128(&k, &msg)),
            "070a16b46b4d4144f79bdd9dd04a287c"
        );
    }

    #[test]
    fn test_aes_ecb_fips197_vector() {
        let k = key("000102030405060708090a0b0c0d0e0f");
        let block: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            hex::encode(aes_ecb_encrypt(&k, &block)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[test]
    fn test_random_bytes_differ() {
        let a = random_bytes::<16>();
        let b = random_bytes::<16>();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
