//! Network PDU encryption and header obfuscation.
//!
//! ```text
//! +--------+---------------------------+----------------------------+---------+
//! | IVI|NID| CTL|TTL, SEQ(3), SRC(2)     | DST(2) || TransportPDU    | NetMIC  |
//! | clear  | obfuscated with PECB      | AES-CCM encrypted          | 4 or 8  |
//! +--------+---------------------------+----------------------------+---------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use mesh_crypto::{aes_ccm_decrypt, aes_ccm_encrypt, aes_ecb_encrypt, Key128, MicSize, NetworkKeys};
use tracing::{debug, trace};

use crate::error::WireError;
use crate::header::NetworkHeader;

/// Maximum network PDU size
pub const NETWORK_PDU_MAX: usize = 29;

/// IVI/NID octet plus the six obfuscated octets
pub const OBFUSCATED_HEADER_END: usize = 7;

/// Length of the privacy random taken from the encrypted part
pub const PRIVACY_RANDOM_SIZE: usize = 7;

/// NetMIC size selected by the CTL bit
pub fn net_mic_size(ctl: bool) -> MicSize {
    if ctl {
        MicSize::Long
    } else {
        MicSize::Short
    }
}

/// Largest transport PDU that fits one network PDU
pub fn max_transport_pdu(ctl: bool) -> usize {
    NETWORK_PDU_MAX - OBFUSCATED_HEADER_END - 2 - net_mic_size(ctl).size()
}

/// Network nonce: `0x00 || CTL|TTL || SEQ || SRC || 0x0000 || IV index`
pub fn network_nonce(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// XOR the six header octets with PECB
///
/// Applying it twice with the same privacy random restores the input.
pub fn obfuscate(
    privacy_key: &Key128,
    iv_index: u32,
    privacy_random: &[u8; PRIVACY_RANDOM_SIZE],
    header: &mut [u8; 6],
) {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(privacy_random);
    let pecb = aes_ecb_encrypt(privacy_key, &block);

    for (byte, mask) in header.iter_mut().zip(pecb.iter()) {
        *byte ^= mask;
    }
}

/// A decoded (or to-be-encoded) network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Clear header fields
    pub header: NetworkHeader,
    /// IV index the PDU was (or will be) protected with
    pub iv_index: u32,
    /// Lower transport PDU
    pub transport_pdu: Bytes,
}

impl NetworkPdu {
    /// Create a network PDU
    pub fn new(header: NetworkHeader, iv_index: u32, transport_pdu: Bytes) -> Self {
        Self {
            header,
            iv_index,
            transport_pdu,
        }
    }

    /// Least significant bit of the IV index
    pub fn ivi(&self) -> u8 {
        (self.iv_index & 1) as u8
    }

    /// Identity used by replay protection
    pub fn replay_key(&self) -> (u16, u32, u32) {
        (self.header.src, self.header.seq, self.iv_index)
    }

    /// Encrypt, obfuscate and serialize
    pub fn encode(&self, keys: &NetworkKeys) -> Result<Bytes, WireError> {
        self.header.validate()?;
        let ctl = self.header.ctl;
        let mic = net_mic_size(ctl);

        let max = max_transport_pdu(ctl);
        if self.transport_pdu.is_empty() || self.transport_pdu.len() > max {
            return Err(WireError::Size(self.transport_pdu.len()));
        }

        let ctl_ttl = self.header.ctl_ttl();
        let nonce = network_nonce(ctl_ttl, self.header.seq, self.header.src, self.iv_index);

        let mut plaintext = Vec::with_capacity(2 + self.transport_pdu.len());
        plaintext.extend_from_slice(&self.header.dst.to_be_bytes());
        plaintext.extend_from_slice(&self.transport_pdu);
        let sealed = aes_ccm_encrypt(&keys.encryption_key, &nonce, &[], &plaintext, mic)?;

        let mut clear = [0u8; 6];
        clear[0] = ctl_ttl;
        clear[1..4].copy_from_slice(&self.header.seq.to_be_bytes()[1..]);
        clear[4..6].copy_from_slice(&self.header.src.to_be_bytes());
        obfuscate(
            &keys.privacy_key,
            self.iv_index,
            &privacy_random(&sealed)?,
            &mut clear,
        );

        let mut buf = BytesMut::with_capacity(1 + clear.len() + sealed.len());
        buf.put_u8((self.ivi() << 7) | (keys.nid & 0x7f));
        buf.put_slice(&clear);
        buf.put_slice(&sealed);

        debug!(
            "Encoded network PDU seq={:#08x} src={:#06x} dst={:#06x} ctl={} len={}",
            self.header.seq,
            self.header.src,
            self.header.dst,
            ctl,
            buf.len()
        );
        Ok(buf.freeze())
    }

    /// Parse, deobfuscate and decrypt
    ///
    /// Returns `Ok(None)` when the NID does not belong to `keys`, and
    /// `Err(AuthenticationFailure)` when the NetMIC does not verify.
    pub fn decode(
        keys: &NetworkKeys,
        iv_index: u32,
        bytes: &[u8],
    ) -> Result<Option<Self>, WireError> {
        if bytes.len() > NETWORK_PDU_MAX {
            return Err(WireError::Size(bytes.len()));
        }
        // Smallest legal PDU: header, DST, one transport octet, 32-bit MIC
        if bytes.len() < OBFUSCATED_HEADER_END + 2 + 1 + MicSize::Short.size() {
            return Err(WireError::Incomplete);
        }

        let nid = bytes[0] & 0x7f;
        if nid != keys.nid {
            trace!("Ignoring network PDU for nid {:#04x}", nid);
            return Ok(None);
        }

        let ivi = u32::from(bytes[0] >> 7);
        let iv_index = if ivi == iv_index & 1 {
            iv_index
        } else {
            match iv_index.checked_sub(1) {
                Some(previous) => previous,
                None => return Ok(None),
            }
        };

        let sealed = &bytes[OBFUSCATED_HEADER_END..];
        let mut clear = [0u8; 6];
        clear.copy_from_slice(&bytes[1..OBFUSCATED_HEADER_END]);
        obfuscate(
            &keys.privacy_key,
            iv_index,
            &privacy_random(sealed)?,
            &mut clear,
        );

        let ctl_ttl = clear[0];
        let ctl = ctl_ttl & 0x80 != 0;
        let seq = u32::from_be_bytes([0, clear[1], clear[2], clear[3]]);
        let src = u16::from_be_bytes([clear[4], clear[5]]);

        let mic = net_mic_size(ctl);
        if sealed.len() < 2 + 1 + mic.size() {
            return Err(WireError::Incomplete);
        }

        let nonce = network_nonce(ctl_ttl, seq, src, iv_index);
        let plaintext = aes_ccm_decrypt(&keys.encryption_key, &nonce, &[], sealed, mic)
            .map_err(|err| {
                debug!("Network MIC check failed for src={:#06x} seq={:#08x}", src, seq);
                WireError::from(err)
            })?;

        let dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        let header = NetworkHeader {
            ctl,
            ttl: ctl_ttl & 0x7f,
            seq,
            src,
            dst,
        };

        Ok(Some(Self {
            header,
            iv_index,
            transport_pdu: Bytes::copy_from_slice(&plaintext[2..]),
        }))
    }
}

/// Builder for outbound network PDUs
#[derive(Debug)]
pub struct NetworkPduBuilder {
    header: NetworkHeader,
    iv_index: u32,
    transport_pdu: Bytes,
}

impl NetworkPduBuilder {
    /// Start from a clear header
    pub fn new(header: NetworkHeader) -> Self {
        Self {
            header,
            iv_index: 0,
            transport_pdu: Bytes::new(),
        }
    }

    /// Set the IV index
    pub fn iv_index(mut self, iv_index: u32) -> Self {
        self.iv_index = iv_index;
        self
    }

    /// Set the lower transport PDU
    pub fn transport_pdu(mut self, pdu: Bytes) -> Self {
        self.transport_pdu = pdu;
        self
    }

    /// Build the PDU without encoding
    pub fn build(self) -> NetworkPdu {
        NetworkPdu::new(self.header, self.iv_index, self.transport_pdu)
    }

    /// Build and encode with the given network keys
    pub fn encode(self, keys: &NetworkKeys) -> Result<Bytes, WireError> {
        self.build().encode(keys)
    }
}

fn privacy_random(sealed: &[u8]) -> Result<[u8; PRIVACY_RANDOM_SIZE], WireError> {
    let head = sealed
        .get(..PRIVACY_RANDOM_SIZE)
        .ok_or(WireError::Incomplete)?;
    let mut out = [0u8; PRIVACY_RANDOM_SIZE];
    out.copy_from_slice(head);
    Ok(out)
}
