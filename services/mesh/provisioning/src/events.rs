//! Provisioning status events.

use std::fmt::Debug;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ProvisioningError;
use crate::pdu::{AuthMethod, Capabilities, InputAction};
use crate::session::AuthInput;
use crate::transport::Peer;

/// Progress reported by a provisioner, in protocol order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    /// Invite sent
    InviteSent,
    /// Device capabilities received
    CapabilitiesReceived(Capabilities),
    /// Start sent
    StartSent,
    /// Own public key sent
    PublicKeySent,
    /// Device public key received and ECDH secret computed
    PublicKeyExchanged,
    /// Caller must supply the static OOB value or the value the device outputs
    AuthInputRequested(AuthMethod),
    /// Value to display so the user can enter it on the device
    InputOobDisplay {
        /// How the user enters the value
        action: InputAction,
        /// Value to display
        value: AuthInput,
    },
    /// Confirmation sent
    ConfirmationSent,
    /// Device confirmation received
    ConfirmationReceived,
    /// Own random sent
    RandomSent,
    /// Device random received and verified
    RandomReceived,
    /// Provisioning data sent
    DataSent,
    /// Device acknowledged the data
    Complete {
        /// Primary element address
        unicast_address: u16,
        /// Number of elements
        element_count: u8,
    },
    /// Provisioning failed
    Failed(ProvisioningError),
}

/// Receiver of provisioning events
pub trait ProvisioningEventSink: Send + Sync + Debug {
    /// Called for every state change
    fn on_event(&self, peer: &Peer, event: ProvisioningEvent);
}

/// Sink that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<(Peer, ProvisioningEvent)>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Peer, ProvisioningEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProvisioningEventSink for ChannelEventSink {
    fn on_event(&self, peer: &Peer, event: ProvisioningEvent) {
        if self.tx.send((*peer, event)).is_err() {
            warn!("Dropping provisioning event for {}: receiver closed", peer);
        }
    }
}

/// Sink that only logs events
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl ProvisioningEventSink for LoggingEventSink {
    fn on_event(&self, peer: &Peer, event: ProvisioningEvent) {
        match &event {
            ProvisioningEvent::Complete {
                unicast_address, ..
            } => info!("Provisioning of {} complete at {:#06x}", peer, unicast_address),
            ProvisioningEvent::Failed(reason) => {
                warn!("Provisioning of {} failed: {:?}", peer, reason)
            }
            other => debug!("Provisioning {}: {:?}", peer, other),
        }
    }
}
