//! Upper transport access PDU encryption.

use bytes::Bytes;
use mesh_crypto::{aes_ccm_decrypt, aes_ccm_encrypt, Key128, MicSize};

use crate::error::WireError;

/// Application nonce type
pub const APPLICATION_NONCE: u8 = 0x01;
/// Device nonce type
pub const DEVICE_NONCE: u8 = 0x02;

/// Key protecting an upper transport access PDU
#[derive(Debug, Clone, Copy)]
pub enum UpperTransportKey<'a> {
    /// Device key (AKF = 0)
    Device(&'a Key128),
    /// Application key (AKF = 1) with its AID
    Application {
        /// Application key
        key: &'a Key128,
        /// k4 identifier of `key`
        aid: u8,
    },
}

impl<'a> UpperTransportKey<'a> {
    /// Application key flag
    pub fn akf(&self) -> bool {
        matches!(self, UpperTransportKey::Application { .. })
    }

    /// AID field (zero for the device key)
    pub fn aid(&self) -> u8 {
        match self {
            UpperTransportKey::Device(_) => 0,
            UpperTransportKey::Application { aid, .. } => *aid,
        }
    }

    fn key(&self) -> &'a Key128 {
        match *self {
            UpperTransportKey::Device(key) => key,
            UpperTransportKey::Application { key, .. } => key,
        }
    }

    fn nonce_type(&self) -> u8 {
        if self.akf() {
            APPLICATION_NONCE
        } else {
            DEVICE_NONCE
        }
    }
}

/// Addressing that enters the application/device nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessNonceParams {
    /// SeqAuth of the message
    pub seq_auth: u32,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// IV index
    pub iv_index: u32,
}

/// Application or device nonce: `type || ASZMIC || SeqAuth || SRC || DST || IV index`
pub fn access_nonce(nonce_type: u8, szmic: bool, params: &AccessNonceParams) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[0] = nonce_type;
    nonce[1] = (szmic as u8) << 7;
    nonce[2..5].copy_from_slice(&params.seq_auth.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&params.src.to_be_bytes());
    nonce[7..9].copy_from_slice(&params.dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&params.iv_index.to_be_bytes());
    nonce
}

/// TransMIC size for the SZMIC flag
pub fn trans_mic_size(szmic: bool) -> MicSize {
    if szmic {
        MicSize::Long
    } else {
        MicSize::Short
    }
}

/// Encrypt an access payload into an upper transport access PDU
pub fn encrypt_access(
    key: UpperTransportKey<'_>,
    szmic: bool,
    params: &AccessNonceParams,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    let nonce = access_nonce(key.nonce_type(), szmic, params);
    let sealed = aes_ccm_encrypt(key.key(), &nonce, &[], payload, trans_mic_size(szmic))?;
    Ok(Bytes::from(sealed))
}

/// Decrypt an upper transport access PDU
pub fn decrypt_access(
    key: UpperTransportKey<'_>,
    szmic: bool,
    params: &AccessNonceParams,
    upper: &[u8],
) -> Result<Bytes, WireError> {
    let nonce = access_nonce(key.nonce_type(), szmic, params);
    let plain = aes_ccm_decrypt(key.key(), &nonce, &[], upper, trans_mic_size(szmic))?;
    Ok(Bytes::from(plain))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_key() -> Key128 {
        hex::decode("9d6dd0e96eb25dc19a40ed9914f8f03f")
            .unwrap()
            .try_into()
            .unwrap()
    }

    #[test]
    fn test_device_nonce_layout() {
        let params = AccessNonceParams {
            seq_auth: 0x000006,
            src: 0x1201,
            dst: 0x0003,
            iv_index: 0x12345678,
        };
        assert_eq!(
            hex::encode(access_nonce(DEVICE_NONCE, false, &params)),
            "02000000061201000312345678"
        );
    }

    #[test]
    fn test_decrypt_unsegmented_vector() {
        let key = device_key();
        let params = AccessNonceParams {
            seq_auth: 0x000006,
            src: 0x1201,
            dst: 0x0003,
            iv_index: 0x12345678,
        };
        let upper = hex::decode("89511bf1d1a81c11dcef").unwrap();
        let plain = decrypt_access(UpperTransportKey::Device(&key), false, &params, &upper).unwrap();
        assert_eq!(hex::encode(&plain), "800300563412");

        let sealed = encrypt_access(UpperTransportKey::Device(&key), false, &params, &plain).unwrap();
        assert_eq!(sealed.as_ref(), upper.as_slice());
    }

    #[test]
    fn test_application_key_fields() {
        let key = [0x11; 16];
        let app = UpperTransportKey::Application { key: &key, aid: 0x26 };
        assert!(app.akf());
        assert_eq!(app.aid(), 0x26);

        let device = UpperTransportKey::Device(&key);
        assert!(!device.akf());
        assert_eq!(device.aid(), 0);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = device_key();
        let params = AccessNonceParams {
            seq_auth: 1,
            src: 1,
            dst: 2,
            iv_index: 0,
        };
        let sealed = encrypt_access(UpperTransportKey::Device(&key), true, &params, b"abc").unwrap();
        assert_eq!(sealed.len(), 3 + 8);

        let other = [0u8; 16];
        assert_eq!(
            decrypt_access(UpperTransportKey::Device(&other), true, &params, &sealed),
            Err(WireError::AuthenticationFailure)
        );
    }
}
