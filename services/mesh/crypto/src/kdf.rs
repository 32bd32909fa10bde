//! Mesh key derivation functions (s1, k1, k2, k3, k4).

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::primitives::{cmac_aes128, Key128};

/// k1 label for the confirmation key
pub const PRCK: &[u8] = b"prck";
/// k1 label for the session key
pub const PRSK: &[u8] = b"prsk";
/// k1 label for the session nonce
pub const PRSN: &[u8] = b"prsn";
/// k1 label for the device key
pub const PRDK: &[u8] = b"prdk";
/// k2 `P` for master security credentials
pub const K2_MASTER_INPUT: &[u8] = &[0x00];

/// Salt generation: AES-CMAC with a zero key
pub fn s1(input: &[u8]) -> [u8; 16] {
    cmac_aes128(&[0u8; 16], input)
}

/// k1 derivation: `CMAC(CMAC(salt, n), p)`
pub fn k1(n: &[u8], salt: &Key128, p: &[u8]) -> [u8; 16] {
    let t = cmac_aes128(salt, n);
    cmac_aes128(&t, p)
}

/// Keys expanded from a network key by k2
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKeys {
    /// 7-bit network identifier carried in every network PDU
    pub nid: u8,
    /// Network layer AES-CCM key
    pub encryption_key: Key128,
    /// Header obfuscation key
    pub privacy_key: Key128,
}

impl fmt::Debug for NetworkKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKeys")
            .field("nid", &format_args!("{:#04x}", self.nid))
            .field("encryption_key", &"<redacted>")
            .field("privacy_key", &"<redacted>")
            .finish()
    }
}

/// k2 derivation of NID, encryption key and privacy key
pub fn k2(n: &Key128, p: &[u8]) -> NetworkKeys {
    let salt = s1(b"smk2");
    let t = cmac_aes128(&salt, n);

    let mut input = Vec::with_capacity(16 + p.len() + 1);
    input.extend_from_slice(p);
    input.push(0x01);
    let t1 = cmac_aes128(&t, &input);

    input.clear();
    input.extend_from_slice(&t1);
    input.extend_from_slice(p);
    input.push(0x02);
    let t2 = cmac_aes128(&t, &input);

    input.clear();
    input.extend_from_slice(&t2);
    input.extend_from_slice(p);
    input.push(0x03);
    let t3 = cmac_aes128(&t, &input);

    NetworkKeys {
        nid: t1[15] & 0x7f,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// k3 derivation of the 64-bit network ID
pub fn k3(n: &Key128) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = cmac_aes128(&salt, n);
    let full = cmac_aes128(&t, b"id64\x01");

    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..16]);
    out
}

/// k4 derivation of the 6-bit application key identifier
pub fn k4(n: &Key128) -> u8 {
    let salt = s1(b"smk4");
    let t = cmac_aes128(&salt, n);
    cmac_aes128(&t, b"id6\x01")[15] & 0x3f
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key128 {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_s1_sample() {
        assert_eq!(hex::encode(s1(b"test")), "b73cefbd641ef2ea598c2b6efb62f79c");
    }

    #[test]
    fn test_k1_sample() {
        let n = hex::decode("3216d1509884b533248541792b877f98").unwrap();
        let salt = key("2ba14ffa0df84a2831938d57d276cab4");
        let p = hex::decode("5a09d60797eeb4478aada59db3352a0d").unwrap();
        assert_eq!(
            hex::encode(k1(&n, &salt, &p)),
            "f6ed15a8934afbe7d83e8dcb57fcf5d7"
        );
    }

    #[test]
    fn test_k2_master_sample() {
        let keys = k2(&key("f7a2a44f8e8a8029064f173ddc1e2b00"), K2_MASTER_INPUT);
        assert_eq!(keys.nid, 0x7f);
        assert_eq!(
            hex::encode(keys.encryption_key),
            "9f589181a0f50de73c8070c7a6d27f46"
        );
        assert_eq!(
            hex::encode(keys.privacy_key),
            "4c715bd4a64b938f99b453351653124f"
        );
    }

    #[test]
    fn test_k2_nid_for_message_vectors() {
        let keys = k2(&key("7dd7364cd842ad18c17c2b820c84c3d6"), K2_MASTER_INPUT);
        assert_eq!(keys.nid, 0x68);
    }

    #[test]
    fn test_k3_sample() {
        assert_eq!(
            hex::encode(k3(&key("f7a2a44f8e8a8029064f173ddc1e2b00"))),
            "ff046958233db014"
        );
    }

    #[test]
    fn test_k4_sample() {
        assert_eq!(k4(&key("3216d1509884b533248541792b877f98")), 0x38);
    }

    #[test]
    fn test_network_keys_debug_redacts() {
        let keys = k2(&key("7dd7364cd842ad18c17c2b820c84c3d6"), K2_MASTER_INPUT);
        let rendered = format!("{:?}", keys);
        assert!(rendered.contains("0x68"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&hex::encode(keys.encryption_key)));
    }
}
