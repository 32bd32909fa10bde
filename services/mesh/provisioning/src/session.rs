//! Provisioning session state: parameters, secrets and key derivation.
//!
//! A [`ProvisioningSession`] owns every secret of one in-progress
//! provisioning. All of them are wiped on drop and on [`ProvisioningSession::wipe`].

use std::fmt;

use bitflags::bitflags;
use mesh_crypto::{
    aes_ccm_encrypt, cmac_aes128, constant_time_eq, k1, random_bytes, s1, Key128, KeyPair,
    MicSize, PUBLIC_KEY_SIZE, PRCK, PRDK, PRSK, PRSN,
};
use rand::rngs::OsRng;
use rand::Rng;
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ProvisioningError;
use crate::pdu::{PROVISIONING_DATA_MIC_SIZE, PROVISIONING_DATA_SIZE};
use crate::transport::Peer;

/// Highest IV index accepted in provisioner-entered parameters
pub const IV_INDEX_MAX: u32 = 4096;
/// Highest global key index (12 bits)
pub const KEY_INDEX_MAX: u16 = 0x0fff;
/// Highest unicast address
pub const UNICAST_ADDRESS_MAX: u16 = 0x7fff;
/// Maximum OOB size in digits or characters
pub const MAX_OOB_SIZE: u8 = 8;

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

bitflags! {
    /// Flags octet of the provisioning data
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProvisioningFlags: u8 {
        /// Key refresh phase 2 in progress
        const KEY_REFRESH = 1 << 0;
        /// IV update in progress
        const IV_UPDATE = 1 << 1;
    }
}

impl ProvisioningFlags {
    /// Build the flags octet from the two update states
    pub fn from_update_flags(key_refresh: bool, iv_update: bool) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::KEY_REFRESH, key_refresh);
        flags.set(Self::IV_UPDATE, iv_update);
        flags
    }

    /// Set or clear the IV update flag, leaving key refresh untouched
    pub fn with_iv_update(mut self, on: bool) -> Self {
        self.set(Self::IV_UPDATE, on);
        self
    }

    /// Set or clear the key refresh flag, leaving IV update untouched
    pub fn with_key_refresh(mut self, on: bool) -> Self {
        self.set(Self::KEY_REFRESH, on);
        self
    }
}

/// Network credentials and address handed to the device
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct ProvisioningParams {
    /// Network key
    pub network_key: Key128,
    /// Global index of the network key
    pub key_index: u16,
    /// Key refresh / IV update flags
    #[zeroize(skip)]
    pub flags: ProvisioningFlags,
    /// Current IV index
    pub iv_index: u32,
    /// Address assigned to the primary element
    pub unicast_address: u16,
}

impl ProvisioningParams {
    /// Parameters with key index 0, no flags and IV index 0
    pub fn new(network_key: Key128, unicast_address: u16) -> Self {
        Self {
            network_key,
            key_index: 0,
            flags: ProvisioningFlags::empty(),
            iv_index: 0,
            unicast_address,
        }
    }

    /// Check ranges before provisioning starts
    pub fn validate(&self) -> Result<(), ProvisioningError> {
        if self.key_index > KEY_INDEX_MAX {
            return Err(ProvisioningError::InvalidParams(format!(
                "key index {:#x} exceeds {:#x}",
                self.key_index, KEY_INDEX_MAX
            )));
        }
        if self.iv_index > IV_INDEX_MAX {
            return Err(ProvisioningError::InvalidParams(format!(
                "iv index {} outside 0..={}",
                self.iv_index, IV_INDEX_MAX
            )));
        }
        if self.unicast_address == 0 || self.unicast_address > UNICAST_ADDRESS_MAX {
            return Err(ProvisioningError::InvalidParams(format!(
                "{:#06x} is not a unicast address",
                self.unicast_address
            )));
        }
        Ok(())
    }

    /// True when `element_count` consecutive unicast addresses fit
    pub fn fits_elements(&self, element_count: u8) -> bool {
        let last = u32::from(self.unicast_address) + u32::from(element_count.max(1)) - 1;
        last <= u32::from(UNICAST_ADDRESS_MAX)
    }

    /// Provisioning data plaintext:
    /// `NetKey || KeyIndex || Flags || IVIndex || UnicastAddress`
    pub fn encode(&self) -> [u8; PROVISIONING_DATA_SIZE] {
        let mut out = [0u8; PROVISIONING_DATA_SIZE];
        out[0..16].copy_from_slice(&self.network_key);
        out[16..18].copy_from_slice(&self.key_index.to_be_bytes());
        out[18] = self.flags.bits();
        out[19..23].copy_from_slice(&self.iv_index.to_be_bytes());
        out[23..25].copy_from_slice(&self.unicast_address.to_be_bytes());
        out
    }
}

impl fmt::Debug for ProvisioningParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningParams")
            .field("network_key", &"<redacted>")
            .field("key_index", &self.key_index)
            .field("flags", &self.flags)
            .field("iv_index", &self.iv_index)
            .field("unicast_address", &format_args!("{:#06x}", self.unicast_address))
            .finish()
    }
}

/// Out-of-band value used to build the AuthValue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthInput {
    /// Number (also used for blink/beep/vibrate/push/twist counts)
    Numeric(u32),
    /// Uppercase letters and digits
    Alphanumeric(String),
    /// 16-byte static OOB value
    Static(Key128),
}

impl AuthInput {
    /// 16-byte AuthValue
    ///
    /// Numbers are big-endian in the last four octets; strings are ASCII,
    /// left-aligned and zero padded.
    pub fn auth_value(&self) -> Key128 {
        let mut value = [0u8; 16];
        match self {
            AuthInput::Numeric(n) => value[12..16].copy_from_slice(&n.to_be_bytes()),
            AuthInput::Alphanumeric(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(16);
                value[..len].copy_from_slice(&bytes[..len]);
            }
            AuthInput::Static(key) => value = *key,
        }
        value
    }

    /// Check the value against an OOB size of `size` digits or characters
    pub fn validate(&self, size: u8) -> Result<(), ProvisioningError> {
        match self {
            AuthInput::Numeric(n) => {
                let limit = 10u64.pow(u32::from(size.min(MAX_OOB_SIZE)));
                if u64::from(*n) >= limit {
                    return Err(ProvisioningError::InvalidParams(format!(
                        "{} has more than {} digits",
                        n, size
                    )));
                }
            }
            AuthInput::Alphanumeric(s) => {
                if s.is_empty() || s.len() > usize::from(size) {
                    return Err(ProvisioningError::InvalidParams(format!(
                        "expected 1..={} characters",
                        size
                    )));
                }
                if !s.bytes().all(|b| ALPHANUMERIC.contains(&b)) {
                    return Err(ProvisioningError::InvalidParams(
                        "only 0-9 and A-Z allowed".to_string(),
                    ));
                }
            }
            AuthInput::Static(_) => {}
        }
        Ok(())
    }

    /// Random number with at most `size` digits, at least 1 when `nonzero`
    pub fn random_numeric(size: u8, nonzero: bool) -> Self {
        let limit = 10u32.pow(u32::from(size.clamp(1, MAX_OOB_SIZE)));
        let low = u32::from(nonzero);
        AuthInput::Numeric(OsRng.gen_range(low..limit))
    }

    /// Random string of `size` characters from 0-9 and A-Z
    pub fn random_alphanumeric(size: u8) -> Self {
        let value = (0..size.clamp(1, MAX_OOB_SIZE))
            .map(|_| ALPHANUMERIC[OsRng.gen_range(0..ALPHANUMERIC.len())] as char)
            .collect();
        AuthInput::Alphanumeric(value)
    }
}

/// Result of a successful provisioning, used to create the node record
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProvisioningOutcome {
    /// Provisioned device
    #[zeroize(skip)]
    pub peer: Peer,
    /// Device key derived during provisioning
    pub device_key: Key128,
    /// Network key handed to the device
    pub network_key: Key128,
    /// Global index of the network key
    pub key_index: u16,
    /// Flags handed to the device
    #[zeroize(skip)]
    pub flags: ProvisioningFlags,
    /// IV index handed to the device
    pub iv_index: u32,
    /// Primary element address
    pub unicast_address: u16,
    /// Number of elements reported by the device
    pub element_count: u8,
}

impl fmt::Debug for ProvisioningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningOutcome")
            .field("peer", &self.peer)
            .field("key_index", &self.key_index)
            .field("iv_index", &self.iv_index)
            .field("unicast_address", &format_args!("{:#06x}", self.unicast_address))
            .field("element_count", &self.element_count)
            .finish_non_exhaustive()
    }
}

/// Secrets of one provisioning run, provisioner side
pub struct ProvisioningSession {
    key_pair: Option<KeyPair>,
    public_key: [u8; PUBLIC_KEY_SIZE],
    confirmation_inputs: Vec<u8>,
    inputs_sealed: bool,
    ecdh_secret: Option<[u8; 32]>,
    confirmation_salt: Key128,
    confirmation_key: Key128,
    auth_value: Key128,
    own_random: Key128,
    peer_random: Key128,
    own_confirmation: Key128,
    peer_confirmation: Option<Key128>,
    provisioning_salt: Key128,
    session_key: Key128,
    session_nonce: [u8; 13],
    device_key: Option<Key128>,
}

impl ProvisioningSession {
    /// Start a session with a fresh ephemeral key pair
    pub fn new() -> Self {
        Self::with_key_pair(KeyPair::generate())
    }

    /// Start a session with a caller-supplied key pair
    pub fn with_key_pair(key_pair: KeyPair) -> Self {
        let public_key = key_pair.public_key();
        Self {
            key_pair: Some(key_pair),
            public_key,
            confirmation_inputs: Vec::with_capacity(1 + 11 + 5 + 2 * PUBLIC_KEY_SIZE),
            inputs_sealed: false,
            ecdh_secret: None,
            confirmation_salt: [0; 16],
            confirmation_key: [0; 16],
            auth_value: [0; 16],
            own_random: [0; 16],
            peer_random: [0; 16],
            own_confirmation: [0; 16],
            peer_confirmation: None,
            provisioning_salt: [0; 16],
            session_key: [0; 16],
            session_nonce: [0; 13],
            device_key: None,
        }
    }

    /// Own public key `X || Y`
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public_key
    }

    /// Bytes collected so far for the confirmation salt
    pub fn confirmation_inputs(&self) -> &[u8] {
        &self.confirmation_inputs
    }

    /// Append exchanged PDU parameters to the confirmation inputs
    pub fn append_confirmation_inputs(&mut self, params: &[u8]) -> Result<(), ProvisioningError> {
        if self.inputs_sealed {
            return Err(ProvisioningError::InvalidState("confirmation inputs sealed"));
        }
        self.confirmation_inputs.extend_from_slice(params);
        Ok(())
    }

    /// Record the device public key, compute the ECDH secret and the
    /// confirmation key, and seal the confirmation inputs
    pub fn set_peer_public_key(
        &mut self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<(), ProvisioningError> {
        let key_pair = self.key_pair.as_ref().ok_or(ProvisioningError::Aborted)?;
        let secret = key_pair.agree(peer_public)?;

        self.append_confirmation_inputs(peer_public)?;
        self.inputs_sealed = true;

        self.confirmation_salt = s1(&self.confirmation_inputs);
        self.confirmation_key = k1(&secret, &self.confirmation_salt, PRCK);
        self.ecdh_secret = Some(secret);

        trace!(
            "Confirmation inputs sealed ({} bytes)",
            self.confirmation_inputs.len()
        );
        Ok(())
    }

    /// Generate the provisioner random and compute the confirmation value
    pub fn confirm(&mut self, auth_value: Key128) -> Result<Key128, ProvisioningError> {
        self.confirm_with_random(auth_value, random_bytes::<16>())
    }

    fn confirm_with_random(
        &mut self,
        auth_value: Key128,
        random: Key128,
    ) -> Result<Key128, ProvisioningError> {
        if self.ecdh_secret.is_none() {
            return Err(ProvisioningError::InvalidState("no shared secret"));
        }
        self.auth_value = auth_value;
        self.own_random = random;
        self.own_confirmation = confirmation_value(&self.confirmation_key, &random, &auth_value);
        Ok(self.own_confirmation)
    }

    /// Store the device confirmation for verification after the random exchange
    pub fn set_peer_confirmation(&mut self, confirmation: Key128) {
        self.peer_confirmation = Some(confirmation);
    }

    /// Own random, revealed after both confirmations are exchanged
    pub fn own_random(&self) -> &Key128 {
        &self.own_random
    }

    /// Verify the device random against its confirmation and derive the
    /// session key, session nonce and device key
    pub fn verify_peer_random(&mut self, peer_random: &Key128) -> Result<(), ProvisioningError> {
        let peer_confirmation = self
            .peer_confirmation
            .ok_or(ProvisioningError::InvalidState("no device confirmation"))?;
        let secret = self
            .ecdh_secret
            .ok_or(ProvisioningError::InvalidState("no shared secret"))?;

        if constant_time_eq(peer_random, &self.own_random) {
            return Err(ProvisioningError::AuthenticationFailure);
        }
        let expected = confirmation_value(&self.confirmation_key, peer_random, &self.auth_value);
        if !constant_time_eq(&expected, &peer_confirmation) {
            return Err(ProvisioningError::AuthenticationFailure);
        }
        self.peer_random = *peer_random;

        let mut salt_input = [0u8; 48];
        salt_input[..16].copy_from_slice(&self.confirmation_salt);
        salt_input[16..32].copy_from_slice(&self.own_random);
        salt_input[32..].copy_from_slice(peer_random);
        self.provisioning_salt = s1(&salt_input);

        self.session_key = k1(&secret, &self.provisioning_salt, PRSK);
        let nonce = k1(&secret, &self.provisioning_salt, PRSN);
        self.session_nonce.copy_from_slice(&nonce[3..16]);
        self.device_key = Some(k1(&secret, &self.provisioning_salt, PRDK));
        Ok(())
    }

    /// Device key, available after the random exchange
    pub fn device_key(&self) -> Option<&Key128> {
        self.device_key.as_ref()
    }

    /// Encrypt the provisioning data with the session key and nonce
    pub fn encrypt_data(
        &self,
        params: &ProvisioningParams,
    ) -> Result<[u8; PROVISIONING_DATA_SIZE + PROVISIONING_DATA_MIC_SIZE], ProvisioningError> {
        if self.device_key.is_none() {
            return Err(ProvisioningError::InvalidState("session keys not derived"));
        }
        let mut plaintext = params.encode();
        let sealed = aes_ccm_encrypt(
            &self.session_key,
            &self.session_nonce,
            &[],
            &plaintext,
            MicSize::Long,
        );
        plaintext.zeroize();

        let mut out = [0u8; PROVISIONING_DATA_SIZE + PROVISIONING_DATA_MIC_SIZE];
        out.copy_from_slice(&sealed?);
        Ok(out)
    }

    /// Discard every secret
    pub fn wipe(&mut self) {
        self.key_pair = None;
        self.confirmation_inputs.zeroize();
        self.ecdh_secret.zeroize();
        self.confirmation_salt.zeroize();
        self.confirmation_key.zeroize();
        self.auth_value.zeroize();
        self.own_random.zeroize();
        self.peer_random.zeroize();
        self.own_confirmation.zeroize();
        self.peer_confirmation.zeroize();
        self.provisioning_salt.zeroize();
        self.session_key.zeroize();
        self.session_nonce.zeroize();
        self.device_key.zeroize();
    }

    /// True once [`wipe`](Self::wipe) ran
    pub fn is_wiped(&self) -> bool {
        self.key_pair.is_none()
    }
}

impl Default for ProvisioningSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProvisioningSession {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for ProvisioningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningSession")
            .field("confirmation_inputs_len", &self.confirmation_inputs.len())
            .field("inputs_sealed", &self.inputs_sealed)
            .field("has_secret", &self.ecdh_secret.is_some())
            .field("has_device_key", &self.device_key.is_some())
            .finish_non_exhaustive()
    }
}

/// `CMAC(ConfirmationKey, Random || AuthValue)`
fn confirmation_value(confirmation_key: &Key128, random: &Key128, auth_value: &Key128) -> Key128 {
    let mut input = [0u8; 32];
    input[..16].copy_from_slice(random);
    input[16..].copy_from_slice(auth_value);
    let value = cmac_aes128(confirmation_key, &input);
    input.zeroize();
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_update_flags_are_independent() {
        let both = ProvisioningFlags::from_update_flags(true, true);
        assert_eq!(both.bits(), 0x03);

        // Clearing IV update must leave key refresh set
        let cleared = both.with_iv_update(false);
        assert_eq!(cleared, ProvisioningFlags::KEY_REFRESH);
        assert_eq!(cleared.with_key_refresh(false).bits(), 0x00);

        assert_eq!(ProvisioningFlags::from_update_flags(false, true).bits(), 0x02);
    }

    #[test]
    fn test_params_validate() {
        let mut params = ProvisioningParams::new([0x11; 16], 0x0005);
        assert!(params.validate().is_ok());

        params.iv_index = IV_INDEX_MAX;
        assert!(params.validate().is_ok());
        params.iv_index = IV_INDEX_MAX + 1;
        assert!(matches!(
            params.validate(),
            Err(ProvisioningError::InvalidParams(_))
        ));
        params.iv_index = 0;

        params.key_index = 0x1000;
        assert!(params.validate().is_err());
        params.key_index = 0x0fff;

        params.unicast_address = 0;
        assert!(params.validate().is_err());
        params.unicast_address = 0x8000;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_fits_elements() {
        let params = ProvisioningParams::new([0; 16], 0x7ffe);
        assert!(params.fits_elements(2));
        assert!(!params.fits_elements(3));
    }

    #[test]
    fn test_params_encode_layout() {
        let mut params = ProvisioningParams::new([0xaa; 16], 0x0b0c);
        params.key_index = 0x0567;
        params.flags = ProvisioningFlags::IV_UPDATE;
        params.iv_index = 0x0102;
        let data = params.encode();
        assert_eq!(&data[..16], &[0xaa; 16]);
        assert_eq!(hex::encode(&data[16..]), "056702000001020b0c");
    }

    #[test]
    fn test_auth_values() {
        let mut expected = [0u8; 16];
        expected[12..].copy_from_slice(&[0x00, 0x01, 0xe2, 0x40]);
        assert_eq!(AuthInput::Numeric(123456).auth_value(), expected);

        let alpha = AuthInput::Alphanumeric("AB12".to_string()).auth_value();
        assert_eq!(&alpha[..4], b"AB12");
        assert_eq!(&alpha[4..], &[0u8; 12]);

        assert_eq!(AuthInput::Static([7; 16]).auth_value(), [7; 16]);
    }

    #[test]
    fn test_auth_input_validation() {
        assert!(AuthInput::Numeric(9999).validate(4).is_ok());
        assert!(AuthInput::Numeric(10000).validate(4).is_err());
        assert!(AuthInput::Alphanumeric("A1".into()).validate(2).is_ok());
        assert!(AuthInput::Alphanumeric("a1".into()).validate(2).is_err());
        assert!(AuthInput::Alphanumeric("ABC".into()).validate(2).is_err());
    }

    #[test]
    fn test_random_auth_inputs_respect_size() {
        for _ in 0..32 {
            let AuthInput::Numeric(n) = AuthInput::random_numeric(3, true) else {
                panic!("numeric expected");
            };
            assert!((1..1000).contains(&n));
        }
        let value = AuthInput::random_alphanumeric(6);
        assert!(value.validate(6).is_ok());
    }

    fn exchanged_pair() -> (ProvisioningSession, KeyPair) {
        let mut session = ProvisioningSession::new();
        session.append_confirmation_inputs(&[0x05]).unwrap();
        let device = KeyPair::generate();
        session.set_peer_public_key(&device.public_key()).unwrap();
        (session, device)
    }

    #[test]
    fn test_confirmation_inputs_sealed_after_public_keys() {
        let (mut session, _) = exchanged_pair();
        assert_eq!(session.confirmation_inputs().len(), 1 + 64);
        assert!(matches!(
            session.append_confirmation_inputs(&[0x00]),
            Err(ProvisioningError::InvalidState(_))
        ));
    }

    #[test]
    fn test_peer_random_verification() {
        let (mut session, device) = exchanged_pair();
        session.confirm([0; 16]).unwrap();

        // Device side computed independently
        let secret = device.agree(session.public_key()).unwrap();
        let salt = s1(session.confirmation_inputs());
        let key = k1(&secret, &salt, PRCK);
        let device_random = [0x42; 16];
        session.set_peer_confirmation(confirmation_value(&key, &device_random, &[0; 16]));

        session.verify_peer_random(&device_random).unwrap();
        assert!(session.device_key().is_some());
        assert!(session
            .encrypt_data(&ProvisioningParams::new([1; 16], 2))
            .is_ok());
    }

    #[test]
    fn test_tampered_random_fails() {
        let (mut session, device) = exchanged_pair();
        session.confirm([0; 16]).unwrap();

        let secret = device.agree(session.public_key()).unwrap();
        let key = k1(&secret, &s1(session.confirmation_inputs()), PRCK);
        session.set_peer_confirmation(confirmation_value(&key, &[0x42; 16], &[0; 16]));

        assert_eq!(
            session.verify_peer_random(&[0x43; 16]),
            Err(ProvisioningError::AuthenticationFailure)
        );
        assert!(session.device_key().is_none());
    }

    #[test]
    fn test_reflected_random_rejected() {
        let (mut session, _) = exchanged_pair();
        session.confirm_with_random([0; 16], [0x99; 16]).unwrap();
        let reflected = session.own_confirmation;
        session.set_peer_confirmation(reflected);

        assert_eq!(
            session.verify_peer_random(&[0x99; 16]),
            Err(ProvisioningError::AuthenticationFailure)
        );
    }

    #[test]
    fn test_wipe_clears_secrets() {
        let (mut session, _) = exchanged_pair();
        session.confirm([0; 16]).unwrap();
        session.wipe();

        assert!(session.is_wiped());
        assert!(session.confirmation_inputs().is_empty());
        assert_eq!(session.own_random(), &[0u8; 16]);
        assert!(matches!(
            session.set_peer_public_key(&[0u8; 64]),
            Err(ProvisioningError::Aborted)
        ));
    }

    #[test]
    fn test_outcome_debug_redacts_keys() {
        let outcome = ProvisioningOutcome {
            peer: Peer(Uuid::nil()),
            device_key: [0xde; 16],
            network_key: [0xad; 16],
            key_index: 0,
            flags: ProvisioningFlags::empty(),
            iv_index: 0,
            unicast_address: 0x0002,
            element_count: 1,
        };
        let rendered = format!("{:?}", outcome);
        assert!(!rendered.contains("device_key"));
        assert!(!rendered.contains("network_key"));
        assert!(rendered.contains("0x0002"));
    }
}
