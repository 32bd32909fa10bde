//! Provisioning PDU formats.
//!
//! A provisioning PDU is `opcode (1) || parameters`, carried in a proxy PDU of
//! type Provisioning.

use std::fmt;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProvisioningError;

/// Public key parameter size (`X || Y`)
pub const PUBLIC_KEY_SIZE: usize = 64;
/// Confirmation and random parameter size
pub const CONFIRMATION_SIZE: usize = 16;
/// Encrypted provisioning data size
pub const PROVISIONING_DATA_SIZE: usize = 25;
/// Provisioning data MIC size
pub const PROVISIONING_DATA_MIC_SIZE: usize = 8;
/// Capabilities parameter size
pub const CAPABILITIES_SIZE: usize = 11;
/// Start parameter size
pub const START_SIZE: usize = 5;

/// Provisioning PDU opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningPduType {
    /// Provisioning Invite
    Invite = 0x00,
    /// Provisioning Capabilities
    Capabilities = 0x01,
    /// Provisioning Start
    Start = 0x02,
    /// Provisioning Public Key
    PublicKey = 0x03,
    /// Provisioning Input Complete
    InputComplete = 0x04,
    /// Provisioning Confirmation
    Confirmation = 0x05,
    /// Provisioning Random
    Random = 0x06,
    /// Provisioning Data
    Data = 0x07,
    /// Provisioning Complete
    Complete = 0x08,
    /// Provisioning Failed
    Failed = 0x09,
}

impl ProvisioningPduType {
    /// Required parameter length
    pub fn params_len(self) -> usize {
        match self {
            ProvisioningPduType::Invite => 1,
            ProvisioningPduType::Capabilities => CAPABILITIES_SIZE,
            ProvisioningPduType::Start => START_SIZE,
            ProvisioningPduType::PublicKey => PUBLIC_KEY_SIZE,
            ProvisioningPduType::InputComplete => 0,
            ProvisioningPduType::Confirmation => CONFIRMATION_SIZE,
            ProvisioningPduType::Random => CONFIRMATION_SIZE,
            ProvisioningPduType::Data => PROVISIONING_DATA_SIZE + PROVISIONING_DATA_MIC_SIZE,
            ProvisioningPduType::Complete => 0,
            ProvisioningPduType::Failed => 1,
        }
    }
}

impl TryFrom<u8> for ProvisioningPduType {
    type Error = ProvisioningError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ProvisioningPduType::Invite),
            0x01 => Ok(ProvisioningPduType::Capabilities),
            0x02 => Ok(ProvisioningPduType::Start),
            0x03 => Ok(ProvisioningPduType::PublicKey),
            0x04 => Ok(ProvisioningPduType::InputComplete),
            0x05 => Ok(ProvisioningPduType::Confirmation),
            0x06 => Ok(ProvisioningPduType::Random),
            0x07 => Ok(ProvisioningPduType::Data),
            0x08 => Ok(ProvisioningPduType::Complete),
            0x09 => Ok(ProvisioningPduType::Failed),
            _ => Err(ProvisioningError::Protocol(FailureCode::InvalidPdu)),
        }
    }
}

/// Provisioning Failed error codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// Unknown opcode or bad PDU
    InvalidPdu = 0x01,
    /// Parameters outside their range or wrong length
    InvalidFormat = 0x02,
    /// PDU not expected at this point
    UnexpectedPdu = 0x03,
    /// Confirmation value mismatch
    ConfirmationFailed = 0x04,
    /// Device cannot store the data
    OutOfResources = 0x05,
    /// Provisioning data did not decrypt
    DecryptionFailed = 0x06,
    /// Unexpected device error
    UnexpectedError = 0x07,
    /// Device cannot assign consecutive unicast addresses
    CannotAssignAddresses = 0x08,
}

impl From<u8> for FailureCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => FailureCode::InvalidPdu,
            0x02 => FailureCode::InvalidFormat,
            0x03 => FailureCode::UnexpectedPdu,
            0x04 => FailureCode::ConfirmationFailed,
            0x05 => FailureCode::OutOfResources,
            0x06 => FailureCode::DecryptionFailed,
            0x08 => FailureCode::CannotAssignAddresses,
            // Prohibited and RFU codes collapse to a generic device error
            _ => FailureCode::UnexpectedError,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCode::InvalidPdu => "invalid pdu",
            FailureCode::InvalidFormat => "invalid format",
            FailureCode::UnexpectedPdu => "unexpected pdu",
            FailureCode::ConfirmationFailed => "confirmation failed",
            FailureCode::OutOfResources => "out of resources",
            FailureCode::DecryptionFailed => "decryption failed",
            FailureCode::UnexpectedError => "unexpected error",
            FailureCode::CannotAssignAddresses => "cannot assign addresses",
        };
        write!(f, "{} ({:#04x})", name, *self as u8)
    }
}

bitflags! {
    /// Supported provisioning algorithms
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Algorithms: u16 {
        /// FIPS P-256 elliptic curve
        const FIPS_P256 = 1 << 0;
    }
}

bitflags! {
    /// Supported public key OOB types
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PublicKeyType: u8 {
        /// Public key available out of band
        const OOB_AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// Supported static OOB types
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StaticOobType: u8 {
        /// Static OOB information available
        const AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// Output OOB actions a device supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputOobActions: u16 {
        /// Blink
        const BLINK = 1 << 0;
        /// Beep
        const BEEP = 1 << 1;
        /// Vibrate
        const VIBRATE = 1 << 2;
        /// Output numeric
        const NUMERIC = 1 << 3;
        /// Output alphanumeric
        const ALPHANUMERIC = 1 << 4;
    }
}

bitflags! {
    /// Input OOB actions a device supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputOobActions: u16 {
        /// Push
        const PUSH = 1 << 0;
        /// Twist
        const TWIST = 1 << 1;
        /// Input numeric
        const NUMERIC = 1 << 2;
        /// Input alphanumeric
        const ALPHANUMERIC = 1 << 3;
    }
}

/// A single output OOB action selected in the Start PDU
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAction {
    /// Blink
    Blink = 0,
    /// Beep
    Beep = 1,
    /// Vibrate
    Vibrate = 2,
    /// Output numeric
    Numeric = 3,
    /// Output alphanumeric
    Alphanumeric = 4,
}

impl OutputAction {
    fn flag(self) -> OutputOobActions {
        OutputOobActions::from_bits_truncate(1 << self as u16)
    }
}

/// A single input OOB action selected in the Start PDU
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Push
    Push = 0,
    /// Twist
    Twist = 1,
    /// Input numeric
    Numeric = 2,
    /// Input alphanumeric
    Alphanumeric = 3,
}

impl InputAction {
    fn flag(self) -> InputOobActions {
        InputOobActions::from_bits_truncate(1 << self as u16)
    }
}

/// Authentication method chosen by the provisioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// No OOB authentication
    #[default]
    NoOob,
    /// Static OOB value known to both sides
    StaticOob,
    /// Device outputs a value the user enters on the provisioner
    OutputOob {
        /// Output action
        action: OutputAction,
        /// Digits or characters (1..=8)
        size: u8,
    },
    /// Provisioner displays a value the user enters on the device
    InputOob {
        /// Input action
        action: InputAction,
        /// Digits or characters (1..=8)
        size: u8,
    },
}

impl AuthMethod {
    /// Start PDU parameters for this method
    pub fn start(&self) -> Start {
        let (auth_method, auth_action, auth_size) = match *self {
            AuthMethod::NoOob => (0, 0, 0),
            AuthMethod::StaticOob => (1, 0, 0),
            AuthMethod::OutputOob { action, size } => (2, action as u8, size),
            AuthMethod::InputOob { action, size } => (3, action as u8, size),
        };
        Start {
            algorithm: 0,
            public_key: 0,
            auth_method,
            auth_action,
            auth_size,
        }
    }

    /// True if the device advertised support for this method
    pub fn supported_by(&self, caps: &Capabilities) -> bool {
        match *self {
            AuthMethod::NoOob => true,
            AuthMethod::StaticOob => caps.static_oob_type.contains(StaticOobType::AVAILABLE),
            AuthMethod::OutputOob { action, size } => {
                caps.output_oob_actions.contains(action.flag())
                    && (1..=caps.output_oob_size).contains(&size)
            }
            AuthMethod::InputOob { action, size } => {
                caps.input_oob_actions.contains(action.flag())
                    && (1..=caps.input_oob_size).contains(&size)
            }
        }
    }
}

/// Provisioning Invite parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invite {
    /// Attention timer in seconds
    pub attention_duration: u8,
}

/// Provisioning Capabilities parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of elements on the device
    pub element_count: u8,
    /// Supported algorithms
    pub algorithms: Algorithms,
    /// Supported public key types
    pub public_key_type: PublicKeyType,
    /// Supported static OOB types
    pub static_oob_type: StaticOobType,
    /// Maximum output OOB size
    pub output_oob_size: u8,
    /// Supported output OOB actions
    pub output_oob_actions: OutputOobActions,
    /// Maximum input OOB size
    pub input_oob_size: u8,
    /// Supported input OOB actions
    pub input_oob_actions: InputOobActions,
}

impl Capabilities {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.element_count);
        buf.put_u16(self.algorithms.bits());
        buf.put_u8(self.public_key_type.bits());
        buf.put_u8(self.static_oob_type.bits());
        buf.put_u8(self.output_oob_size);
        buf.put_u16(self.output_oob_actions.bits());
        buf.put_u8(self.input_oob_size);
        buf.put_u16(self.input_oob_actions.bits());
    }

    fn decode(mut params: &[u8]) -> Result<Self, ProvisioningError> {
        let caps = Self {
            element_count: params.get_u8(),
            algorithms: Algorithms::from_bits_retain(params.get_u16()),
            public_key_type: PublicKeyType::from_bits_retain(params.get_u8()),
            static_oob_type: StaticOobType::from_bits_retain(params.get_u8()),
            output_oob_size: params.get_u8(),
            output_oob_actions: OutputOobActions::from_bits_retain(params.get_u16()),
            input_oob_size: params.get_u8(),
            input_oob_actions: InputOobActions::from_bits_retain(params.get_u16()),
        };
        if caps.element_count == 0 || !caps.algorithms.contains(Algorithms::FIPS_P256) {
            return Err(ProvisioningError::Protocol(FailureCode::InvalidFormat));
        }
        Ok(caps)
    }
}

/// Provisioning Start parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    /// Algorithm (0 = FIPS P-256)
    pub algorithm: u8,
    /// Public key (0 = no OOB public key)
    pub public_key: u8,
    /// Authentication method
    pub auth_method: u8,
    /// Authentication action
    pub auth_action: u8,
    /// Authentication size
    pub auth_size: u8,
}

/// Provisioning PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPdu {
    /// Invite
    Invite(Invite),
    /// Capabilities
    Capabilities(Capabilities),
    /// Start
    Start(Start),
    /// Public key `X || Y`
    PublicKey([u8; PUBLIC_KEY_SIZE]),
    /// Input complete
    InputComplete,
    /// Confirmation value
    Confirmation([u8; CONFIRMATION_SIZE]),
    /// Random value
    Random([u8; CONFIRMATION_SIZE]),
    /// Encrypted provisioning data and MIC
    Data(Box<[u8; PROVISIONING_DATA_SIZE + PROVISIONING_DATA_MIC_SIZE]>),
    /// Complete
    Complete,
    /// Failed
    Failed(FailureCode),
}

impl ProvisioningPdu {
    /// Opcode of this PDU
    pub fn pdu_type(&self) -> ProvisioningPduType {
        match self {
            ProvisioningPdu::Invite(_) => ProvisioningPduType::Invite,
            ProvisioningPdu::Capabilities(_) => ProvisioningPduType::Capabilities,
            ProvisioningPdu::Start(_) => ProvisioningPduType::Start,
            ProvisioningPdu::PublicKey(_) => ProvisioningPduType::PublicKey,
            ProvisioningPdu::InputComplete => ProvisioningPduType::InputComplete,
            ProvisioningPdu::Confirmation(_) => ProvisioningPduType::Confirmation,
            ProvisioningPdu::Random(_) => ProvisioningPduType::Random,
            ProvisioningPdu::Data(_) => ProvisioningPduType::Data,
            ProvisioningPdu::Complete => ProvisioningPduType::Complete,
            ProvisioningPdu::Failed(_) => ProvisioningPduType::Failed,
        }
    }

    /// Parameters without the opcode
    pub fn params(&self) -> Bytes {
        let typ = self.pdu_type();
        let mut buf = BytesMut::with_capacity(typ.params_len());
        match self {
            ProvisioningPdu::Invite(invite) => buf.put_u8(invite.attention_duration),
            ProvisioningPdu::Capabilities(caps) => caps.encode(&mut buf),
            ProvisioningPdu::Start(start) => {
                buf.put_u8(start.algorithm);
                buf.put_u8(start.public_key);
                buf.put_u8(start.auth_method);
                buf.put_u8(start.auth_action);
                buf.put_u8(start.auth_size);
            }
            ProvisioningPdu::PublicKey(key) => buf.put_slice(key),
            ProvisioningPdu::Confirmation(value) | ProvisioningPdu::Random(value) => {
                buf.put_slice(value)
            }
            ProvisioningPdu::Data(data) => buf.put_slice(&data[..]),
            ProvisioningPdu::Failed(code) => buf.put_u8(*code as u8),
            ProvisioningPdu::InputComplete | ProvisioningPdu::Complete => {}
        }
        buf.freeze()
    }

    /// Encode `opcode || parameters`
    pub fn encode(&self) -> Bytes {
        let params = self.params();
        let mut buf = BytesMut::with_capacity(1 + params.len());
        buf.put_u8(self.pdu_type() as u8);
        buf.put_slice(&params);
        buf.freeze()
    }

    /// Decode `opcode || parameters`
    pub fn decode(bytes: &[u8]) -> Result<Self, ProvisioningError> {
        let (&opcode, params) = bytes
            .split_first()
            .ok_or(ProvisioningError::Protocol(FailureCode::InvalidPdu))?;
        let typ = ProvisioningPduType::try_from(opcode)?;
        if params.len() != typ.params_len() {
            return Err(ProvisioningError::Protocol(FailureCode::InvalidFormat));
        }

        let pdu = match typ {
            ProvisioningPduType::Invite => ProvisioningPdu::Invite(Invite {
                attention_duration: params[0],
            }),
            ProvisioningPduType::Capabilities => {
                ProvisioningPdu::Capabilities(Capabilities::decode(params)?)
            }
            ProvisioningPduType::Start => ProvisioningPdu::Start(Start {
                algorithm: params[0],
                public_key: params[1],
                auth_method: params[2],
                auth_action: params[3],
                auth_size: params[4],
            }),
            ProvisioningPduType::PublicKey => ProvisioningPdu::PublicKey(to_array(params)?),
            ProvisioningPduType::InputComplete => ProvisioningPdu::InputComplete,
            ProvisioningPduType::Confirmation => ProvisioningPdu::Confirmation(to_array(params)?),
            ProvisioningPduType::Random => ProvisioningPdu::Random(to_array(params)?),
            ProvisioningPduType::Data => ProvisioningPdu::Data(Box::new(to_array(params)?)),
            ProvisioningPduType::Complete => ProvisioningPdu::Complete,
            ProvisioningPduType::Failed => ProvisioningPdu::Failed(FailureCode::from(params[0])),
        };
        Ok(pdu)
    }
}

fn to_array<const N: usize>(params: &[u8]) -> Result<[u8; N], ProvisioningError> {
    params
        .try_into()
        .map_err(|_| ProvisioningError::Protocol(FailureCode::InvalidFormat))
}
