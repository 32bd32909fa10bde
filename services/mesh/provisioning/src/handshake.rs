//! Provisioner-side provisioning state machine.
//!
//! The [`Provisioner`] is a plain value advanced by two entry points:
//! [`Provisioner::send_next`] emits the next provisioner PDU and
//! [`Provisioner::on_pdu_received`] consumes a device PDU. It can be parked
//! between calls and resumed from any task.

use std::fmt;
use std::sync::Arc;

use mesh_crypto::{KeyPair, Key128};
use mesh_wire::{ProxyPdu, ProxyPduType};
use tracing::{debug, info, warn};

use crate::error::ProvisioningError;
use crate::events::{ProvisioningEvent, ProvisioningEventSink};
use crate::pdu::{
    AuthMethod, Capabilities, FailureCode, InputAction, Invite, OutputAction, ProvisioningPdu,
};
use crate::session::{AuthInput, ProvisioningOutcome, ProvisioningParams, ProvisioningSession};
use crate::transport::{PduTransport, Peer, TransportError};

/// Default attention timer sent in the Invite
pub const DEFAULT_ATTENTION_DURATION: u8 = 5;

/// Provisioning progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Nothing sent yet
    Idle,
    /// Invite sent, waiting for capabilities
    InviteSent,
    /// Capabilities received, Start next
    CapabilitiesReceived,
    /// Start sent, public key next
    StartSent,
    /// Own public key sent, waiting for the device key
    PublicKeySent,
    /// ECDH secret computed, ready to confirm
    PublicKeyExchanged,
    /// Waiting for the caller to supply the OOB value
    AwaitingAuthInput,
    /// Waiting for the device Input Complete PDU
    AwaitingInputComplete,
    /// Own confirmation sent
    ConfirmationSent,
    /// Device confirmation stored, random next
    ConfirmationReceived,
    /// Own random sent
    RandomSent,
    /// Device random verified, data next
    RandomReceived,
    /// Provisioning data sent, waiting for Complete
    DataSent,
    /// Device acknowledged the data
    Complete,
    /// Terminal failure
    Failed(ProvisioningError),
}

impl ProvisioningState {
    /// True for `Complete` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Complete | ProvisioningState::Failed(_))
    }
}

/// Provisioner for one device
pub struct Provisioner {
    peer: Peer,
    params: ProvisioningParams,
    auth_method: AuthMethod,
    attention_duration: u8,
    proxy_mtu: Option<usize>,
    state: ProvisioningState,
    session: ProvisioningSession,
    capabilities: Option<Capabilities>,
    auth_input: Option<AuthInput>,
    outcome: Option<ProvisioningOutcome>,
    transport: Arc<dyn PduTransport>,
    events: Arc<dyn ProvisioningEventSink>,
}

impl Provisioner {
    /// Create a provisioner; parameters are validated up front
    pub fn new(
        peer: Peer,
        params: ProvisioningParams,
        transport: Arc<dyn PduTransport>,
        events: Arc<dyn ProvisioningEventSink>,
    ) -> Result<Self, ProvisioningError> {
        params.validate()?;
        Ok(Self {
            peer,
            params,
            auth_method: AuthMethod::NoOob,
            attention_duration: DEFAULT_ATTENTION_DURATION,
            proxy_mtu: None,
            state: ProvisioningState::Idle,
            session: ProvisioningSession::new(),
            capabilities: None,
            auth_input: None,
            outcome: None,
            transport,
            events,
        })
    }

    /// Select the authentication method used in the Start PDU
    pub fn with_auth_method(mut self, auth_method: AuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    /// Set the attention timer sent in the Invite
    pub fn with_attention_duration(mut self, seconds: u8) -> Self {
        self.attention_duration = seconds;
        self
    }

    /// Split outbound proxy PDUs to fit `mtu` bytes
    pub fn with_proxy_mtu(mut self, mtu: usize) -> Self {
        self.proxy_mtu = Some(mtu);
        self
    }

    /// Use a specific ephemeral key pair
    pub fn with_key_pair(mut self, key_pair: KeyPair) -> Self {
        self.session = ProvisioningSession::with_key_pair(key_pair);
        self
    }

    /// Device being provisioned
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Current state
    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    /// Device capabilities, once received
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Result of a completed provisioning
    pub fn outcome(&self) -> Option<&ProvisioningOutcome> {
        self.outcome.as_ref()
    }

    /// Move the result out of a completed provisioner
    pub fn take_outcome(&mut self) -> Option<ProvisioningOutcome> {
        self.outcome.take()
    }

    /// True when [`send_next`](Self::send_next) has a PDU to emit
    pub fn wants_to_send(&self) -> bool {
        match self.state {
            ProvisioningState::Idle
            | ProvisioningState::CapabilitiesReceived
            | ProvisioningState::StartSent
            | ProvisioningState::ConfirmationReceived
            | ProvisioningState::RandomReceived => true,
            ProvisioningState::PublicKeyExchanged => self.auth_value().is_ok(),
            _ => false,
        }
    }

    /// Emit the next provisioner PDU through the transport
    pub async fn send_next(&mut self) -> Result<(), ProvisioningError> {
        let (pdu, next, event) = match self.prepare_outbound() {
            Ok(step) => step,
            Err(err @ ProvisioningError::InvalidState(_)) => return Err(err),
            Err(err) => return Err(self.fail(err)),
        };

        if let Err(err) = self.transmit(&pdu).await {
            return Err(self.fail(err.into()));
        }

        debug!("Sent {:?} to {}", pdu.pdu_type(), self.peer);
        self.state = next;
        self.events.on_event(&self.peer, event);
        Ok(())
    }

    /// Consume one provisioning PDU (`opcode || parameters`) from the device
    pub fn on_pdu_received(&mut self, bytes: &[u8]) -> Result<(), ProvisioningError> {
        if self.state.is_terminal() {
            return Err(ProvisioningError::InvalidState("provisioning finished"));
        }

        let pdu = match ProvisioningPdu::decode(bytes) {
            Ok(pdu) => pdu,
            Err(err) => return Err(self.fail(err)),
        };
        debug!("Received {:?} from {} in {:?}", pdu.pdu_type(), self.peer, self.state);

        if let ProvisioningPdu::Failed(code) = pdu {
            return Err(self.fail(ProvisioningError::Remote(code)));
        }

        match self.handle_inbound(pdu) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Supply the static OOB value or the value output by the device
    ///
    /// A rejected value leaves the session running so the user can retry.
    pub fn set_auth_input(&mut self, input: AuthInput) -> Result<(), ProvisioningError> {
        match self.state {
            ProvisioningState::Idle
            | ProvisioningState::InviteSent
            | ProvisioningState::CapabilitiesReceived
            | ProvisioningState::StartSent
            | ProvisioningState::PublicKeySent
            | ProvisioningState::PublicKeyExchanged
            | ProvisioningState::AwaitingAuthInput => {}
            _ => return Err(ProvisioningError::InvalidState("confirmation already sent")),
        }

        match (self.auth_method, &input) {
            (AuthMethod::StaticOob, AuthInput::Static(_)) => {}
            (AuthMethod::OutputOob { action, size }, AuthInput::Numeric(_))
                if action != OutputAction::Alphanumeric =>
            {
                input.validate(size)?
            }
            (
                AuthMethod::OutputOob {
                    action: OutputAction::Alphanumeric,
                    size,
                },
                AuthInput::Alphanumeric(_),
            ) => input.validate(size)?,
            (AuthMethod::NoOob, _) | (AuthMethod::InputOob { .. }, _) => {
                return Err(ProvisioningError::InvalidState(
                    "auth method takes no caller input",
                ))
            }
            _ => {
                return Err(ProvisioningError::InvalidParams(
                    "auth input does not match the selected method".to_string(),
                ))
            }
        }

        self.auth_input = Some(input);
        if self.state == ProvisioningState::AwaitingAuthInput {
            self.state = ProvisioningState::PublicKeyExchanged;
        }
        Ok(())
    }

    /// Abort and discard all session secrets
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.fail(ProvisioningError::Aborted);
        }
    }

    /// Report that the caller's timer for this session expired
    pub fn on_timeout(&mut self) {
        if !self.state.is_terminal() {
            self.fail(ProvisioningError::Timeout);
        }
    }

    fn prepare_outbound(
        &mut self,
    ) -> Result<(ProvisioningPdu, ProvisioningState, ProvisioningEvent), ProvisioningError> {
        match self.state {
            ProvisioningState::Idle => {
                let pdu = ProvisioningPdu::Invite(Invite {
                    attention_duration: self.attention_duration,
                });
                self.session.append_confirmation_inputs(&pdu.params())?;
                Ok((pdu, ProvisioningState::InviteSent, ProvisioningEvent::InviteSent))
            }
            ProvisioningState::CapabilitiesReceived => {
                let caps = self
                    .capabilities
                    .ok_or(ProvisioningError::InvalidState("no capabilities"))?;
                if !self.auth_method.supported_by(&caps) {
                    return Err(ProvisioningError::InvalidParams(format!(
                        "device does not support {:?}",
                        self.auth_method
                    )));
                }
                if !self.params.fits_elements(caps.element_count) {
                    return Err(ProvisioningError::Protocol(
                        FailureCode::CannotAssignAddresses,
                    ));
                }
                let pdu = ProvisioningPdu::Start(self.auth_method.start());
                self.session.append_confirmation_inputs(&pdu.params())?;
                Ok((pdu, ProvisioningState::StartSent, ProvisioningEvent::StartSent))
            }
            ProvisioningState::StartSent => {
                let pdu = ProvisioningPdu::PublicKey(*self.session.public_key());
                self.session.append_confirmation_inputs(&pdu.params())?;
                Ok((
                    pdu,
                    ProvisioningState::PublicKeySent,
                    ProvisioningEvent::PublicKeySent,
                ))
            }
            ProvisioningState::PublicKeyExchanged => {
                let auth_value = self.auth_value()?;
                let confirmation = self.session.confirm(auth_value)?;
                Ok((
                    ProvisioningPdu::Confirmation(confirmation),
                    ProvisioningState::ConfirmationSent,
                    ProvisioningEvent::ConfirmationSent,
                ))
            }
            ProvisioningState::ConfirmationReceived => Ok((
                ProvisioningPdu::Random(*self.session.own_random()),
                ProvisioningState::RandomSent,
                ProvisioningEvent::RandomSent,
            )),
            ProvisioningState::RandomReceived => {
                let data = self.session.encrypt_data(&self.params)?;
                Ok((
                    ProvisioningPdu::Data(Box::new(data)),
                    ProvisioningState::DataSent,
                    ProvisioningEvent::DataSent,
                ))
            }
            _ => Err(ProvisioningError::InvalidState("nothing to send")),
        }
    }

    fn handle_inbound(&mut self, pdu: ProvisioningPdu) -> Result<(), ProvisioningError> {
        let state = self.state.clone();
        match (state, pdu) {
            (ProvisioningState::InviteSent, ProvisioningPdu::Capabilities(caps)) => {
                self.session
                    .append_confirmation_inputs(&ProvisioningPdu::Capabilities(caps).params())?;
                debug!(
                    "{} has {} element(s), static oob {:?}, output {:?}/{}, input {:?}/{}",
                    self.peer,
                    caps.element_count,
                    caps.static_oob_type,
                    caps.output_oob_actions,
                    caps.output_oob_size,
                    caps.input_oob_actions,
                    caps.input_oob_size
                );
                self.capabilities = Some(caps);
                self.advance(
                    ProvisioningState::CapabilitiesReceived,
                    ProvisioningEvent::CapabilitiesReceived(caps),
                );
            }
            (ProvisioningState::PublicKeySent, ProvisioningPdu::PublicKey(key)) => {
                if key == *self.session.public_key() {
                    return Err(ProvisioningError::Protocol(FailureCode::InvalidFormat));
                }
                self.session.set_peer_public_key(&key)?;
                self.advance(
                    ProvisioningState::PublicKeyExchanged,
                    ProvisioningEvent::PublicKeyExchanged,
                );
                self.request_auth_input();
            }
            (ProvisioningState::AwaitingInputComplete, ProvisioningPdu::InputComplete) => {
                self.state = ProvisioningState::PublicKeyExchanged;
            }
            (ProvisioningState::ConfirmationSent, ProvisioningPdu::Confirmation(value)) => {
                self.session.set_peer_confirmation(value);
                self.advance(
                    ProvisioningState::ConfirmationReceived,
                    ProvisioningEvent::ConfirmationReceived,
                );
            }
            (ProvisioningState::RandomSent, ProvisioningPdu::Random(random)) => {
                self.session.verify_peer_random(&random)?;
                self.advance(
                    ProvisioningState::RandomReceived,
                    ProvisioningEvent::RandomReceived,
                );
            }
            (ProvisioningState::DataSent, ProvisioningPdu::Complete) => {
                let device_key = *self
                    .session
                    .device_key()
                    .ok_or(ProvisioningError::InvalidState("no device key"))?;
                let element_count = self.capabilities.map(|c| c.element_count).unwrap_or(1);

                self.outcome = Some(ProvisioningOutcome {
                    peer: self.peer,
                    device_key,
                    network_key: self.params.network_key,
                    key_index: self.params.key_index,
                    flags: self.params.flags,
                    iv_index: self.params.iv_index,
                    unicast_address: self.params.unicast_address,
                    element_count,
                });
                self.session.wipe();

                info!(
                    "Provisioned {} at {:#06x} with {} element(s)",
                    self.peer, self.params.unicast_address, element_count
                );
                self.advance(
                    ProvisioningState::Complete,
                    ProvisioningEvent::Complete {
                        unicast_address: self.params.unicast_address,
                        element_count,
                    },
                );
            }
            (state, pdu) => {
                warn!(
                    "Unexpected {:?} from {} in {:?}",
                    pdu.pdu_type(),
                    self.peer,
                    state
                );
                return Err(ProvisioningError::Protocol(FailureCode::UnexpectedPdu));
            }
        }
        Ok(())
    }

    fn request_auth_input(&mut self) {
        match self.auth_method {
            AuthMethod::NoOob => {}
            AuthMethod::StaticOob | AuthMethod::OutputOob { .. } => {
                if self.auth_input.is_none() {
                    self.advance(
                        ProvisioningState::AwaitingAuthInput,
                        ProvisioningEvent::AuthInputRequested(self.auth_method),
                    );
                }
            }
            AuthMethod::InputOob { action, size } => {
                let value = match action {
                    InputAction::Alphanumeric => AuthInput::random_alphanumeric(size),
                    InputAction::Numeric => AuthInput::random_numeric(size, false),
                    InputAction::Push | InputAction::Twist => AuthInput::random_numeric(size, true),
                };
                self.auth_input = Some(value.clone());
                self.advance(
                    ProvisioningState::AwaitingInputComplete,
                    ProvisioningEvent::InputOobDisplay { action, value },
                );
            }
        }
    }

    fn auth_value(&self) -> Result<Key128, ProvisioningError> {
        match (self.auth_method, &self.auth_input) {
            (AuthMethod::NoOob, _) => Ok([0u8; 16]),
            (_, Some(input)) => Ok(input.auth_value()),
            (_, None) => Err(ProvisioningError::InvalidState("auth input required")),
        }
    }

    async fn transmit(&self, pdu: &ProvisioningPdu) -> Result<(), TransportError> {
        let payload = pdu.encode();
        let frames = match self.proxy_mtu {
            Some(mtu) => ProxyPdu::split(ProxyPduType::Provisioning, &payload, mtu)
                .map_err(|e| TransportError::Send(e.to_string()))?,
            None => vec![ProxyPdu::new(ProxyPduType::Provisioning, payload).encode()],
        };
        for frame in frames {
            self.transport.send(&self.peer, frame).await?;
        }
        Ok(())
    }

    fn advance(&mut self, next: ProvisioningState, event: ProvisioningEvent) {
        self.state = next;
        self.events.on_event(&self.peer, event);
    }

    fn fail(&mut self, err: ProvisioningError) -> ProvisioningError {
        warn!("Provisioning {} failed in {:?}: {}", self.peer, self.state, err);
        self.session.wipe();
        self.auth_input = None;
        self.state = ProvisioningState::Failed(err.clone());
        self.events
            .on_event(&self.peer, ProvisioningEvent::Failed(err.clone()));
        err
    }
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("auth_method", &self.auth_method)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSink;
    use crate::transport::ChannelTransport;
    use uuid::Uuid;

    fn provisioner() -> (
        Provisioner,
        tokio::sync::mpsc::UnboundedReceiver<(Peer, bytes::Bytes)>,
    ) {
        let (transport, rx) = ChannelTransport::new();
        let (events, _) = ChannelEventSink::new();
        let provisioner = Provisioner::new(
            Peer(Uuid::new_v4()),
            ProvisioningParams::new([0x11; 16], 0x0010),
            Arc::new(transport),
            Arc::new(events),
        )
        .unwrap();
        (provisioner, rx)
    }

    #[tokio::test]
    async fn test_invite_is_first() {
        let (mut provisioner, mut rx) = provisioner();
        assert!(provisioner.wants_to_send());
        provisioner.send_next().await.unwrap();

        let (_, pdu) = rx.recv().await.unwrap();
        assert_eq!(pdu.as_ref(), &[0x03, 0x00, DEFAULT_ATTENTION_DURATION]);
        assert_eq!(provisioner.state(), &ProvisioningState::InviteSent);
        assert!(!provisioner.wants_to_send());
    }

    #[tokio::test]
    async fn test_send_next_without_work_keeps_state() {
        let (mut provisioner, _rx) = provisioner();
        provisioner.send_next().await.unwrap();
        assert!(matches!(
            provisioner.send_next().await,
            Err(ProvisioningError::InvalidState(_))
        ));
        assert_eq!(provisioner.state(), &ProvisioningState::InviteSent);
    }

    #[tokio::test]
    async fn test_unexpected_pdu_fails() {
        let (mut provisioner, _rx) = provisioner();
        provisioner.send_next().await.unwrap();

        let result = provisioner.on_pdu_received(&[0x08]);
        assert_eq!(
            result,
            Err(ProvisioningError::Protocol(FailureCode::UnexpectedPdu))
        );
        assert!(provisioner.state().is_terminal());
        assert!(matches!(
            provisioner.on_pdu_received(&[0x08]),
            Err(ProvisioningError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_fails_session() {
        let (mut provisioner, rx) = provisioner();
        drop(rx);
        assert_eq!(
            provisioner.send_next().await,
            Err(ProvisioningError::Transport(TransportError::Closed))
        );
        assert_eq!(
            provisioner.state(),
            &ProvisioningState::Failed(ProvisioningError::Transport(TransportError::Closed))
        );
    }

    #[test]
    fn test_invalid_params_rejected() {
        let (transport, _rx) = ChannelTransport::new();
        let (events, _) = ChannelEventSink::new();
        let mut params = ProvisioningParams::new([0; 16], 0x0001);
        params.iv_index = 5000;
        let result = Provisioner::new(
            Peer(Uuid::nil()),
            params,
            Arc::new(transport),
            Arc::new(events),
        );
        assert!(matches!(result, Err(ProvisioningError::InvalidParams(_))));
    }

    #[test]
    fn test_abort_and_timeout_are_terminal() {
        let (mut provisioner, _rx) = provisioner();
        provisioner.abort();
        assert_eq!(
            provisioner.state(),
            &ProvisioningState::Failed(ProvisioningError::Aborted)
        );
        // Already terminal, timeout does not overwrite the reason
        provisioner.on_timeout();
        assert_eq!(
            provisioner.state(),
            &ProvisioningState::Failed(ProvisioningError::Aborted)
        );
    }

    #[test]
    fn test_auth_input_rejected_for_no_oob() {
        let (mut provisioner, _rx) = provisioner();
        assert!(matches!(
            provisioner.set_auth_input(AuthInput::Numeric(1)),
            Err(ProvisioningError::InvalidState(_))
        ));
        assert_eq!(provisioner.state(), &ProvisioningState::Idle);
    }
}
