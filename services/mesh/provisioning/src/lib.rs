//! Provisioner-side Bluetooth Mesh provisioning over PB-GATT.
//!
//! The provisioner drives a device through Invite, Capabilities, Start,
//! public key exchange, confirmation, random reveal and encrypted
//! provisioning data. Every outbound PDU is framed as a proxy PDU of type
//! Provisioning and handed to a [`PduTransport`]; progress is reported to a
//! [`ProvisioningEventSink`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mesh_provisioning::{
//!     ChannelEventSink, ChannelTransport, Peer, Provisioner, ProvisioningParams,
//! };
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), mesh_provisioning::ProvisioningError> {
//! let (transport, mut outbound) = ChannelTransport::new();
//! let (events, _event_rx) = ChannelEventSink::new();
//! let params = ProvisioningParams::new([0x11; 16], 0x0010);
//!
//! let mut provisioner = Provisioner::new(
//!     Peer(Uuid::new_v4()),
//!     params,
//!     Arc::new(transport),
//!     Arc::new(events),
//! )?;
//!
//! provisioner.send_next().await?;
//! while let Some((_peer, frame)) = outbound.recv().await {
//!     // write `frame` to the device, feed replies to on_pdu_received
//!     # let _ = frame;
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod handshake;
pub mod pdu;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::ProvisioningError;
pub use events::{ChannelEventSink, LoggingEventSink, ProvisioningEvent, ProvisioningEventSink};
pub use handshake::{Provisioner, ProvisioningState, DEFAULT_ATTENTION_DURATION};
pub use pdu::{
    Algorithms, AuthMethod, Capabilities, FailureCode, InputAction, InputOobActions, Invite,
    OutputAction, OutputOobActions, ProvisioningPdu, ProvisioningPduType, PublicKeyType, Start,
    StaticOobType, CAPABILITIES_SIZE, CONFIRMATION_SIZE, PROVISIONING_DATA_MIC_SIZE,
    PROVISIONING_DATA_SIZE, PUBLIC_KEY_SIZE, START_SIZE,
};
pub use session::{
    AuthInput, ProvisioningFlags, ProvisioningOutcome, ProvisioningParams, ProvisioningSession,
    IV_INDEX_MAX, KEY_INDEX_MAX, MAX_OOB_SIZE, UNICAST_ADDRESS_MAX,
};
pub use transport::{ChannelTransport, Peer, PduTransport, TransportError};
