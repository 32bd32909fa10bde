//! End-to-end provisioning runs against a scripted device.

use std::sync::Arc;

use bytes::Bytes;
use mesh_crypto::{
    aes_ccm_decrypt, cmac_aes128, k1, s1, KeyPair, MicSize, PRCK, PRDK, PRSK, PRSN,
};
use mesh_provisioning::{
    Algorithms, AuthInput, AuthMethod, Capabilities, ChannelEventSink, ChannelTransport,
    FailureCode, InputAction, InputOobActions, OutputAction, OutputOobActions, Peer, Provisioner,
    ProvisioningError, ProvisioningEvent, ProvisioningParams, ProvisioningPdu, ProvisioningState,
    PublicKeyType, StaticOobType,
};
use mesh_wire::{ProxyPdu, ProxyPduType, ProxyReassembler};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const NETWORK_KEY: [u8; 16] = [
    0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84, 0xc3, 0xd6,
];
const STATIC_OOB: [u8; 16] = [0x5a; 16];

fn capabilities(element_count: u8) -> Capabilities {
    Capabilities {
        element_count,
        algorithms: Algorithms::FIPS_P256,
        public_key_type: PublicKeyType::empty(),
        static_oob_type: StaticOobType::AVAILABLE,
        output_oob_size: 4,
        output_oob_actions: OutputOobActions::NUMERIC | OutputOobActions::BLINK,
        input_oob_size: 6,
        input_oob_actions: InputOobActions::NUMERIC | InputOobActions::PUSH,
    }
}

fn confirmation(key: &[u8; 16], random: &[u8; 16], auth: &[u8; 16]) -> [u8; 16] {
    let mut input = [0u8; 32];
    input[..16].copy_from_slice(random);
    input[16..].copy_from_slice(auth);
    cmac_aes128(key, &input)
}

/// Device half of the protocol, built directly on the crypto primitives
struct FakeDevice {
    key_pair: KeyPair,
    caps: Capabilities,
    auth_value: [u8; 16],
    random: [u8; 16],
    inputs: Vec<u8>,
    secret: [u8; 32],
    confirmation_salt: [u8; 16],
    confirmation_key: [u8; 16],
    provisioner_confirmation: [u8; 16],
    device_key: Option<[u8; 16]>,
    provisioning_data: Option<Vec<u8>>,
    reflect_random: bool,
    corrupt_confirmation: bool,
}

impl FakeDevice {
    fn new(caps: Capabilities, auth_value: [u8; 16]) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            caps,
            auth_value,
            random: [0x42; 16],
            inputs: Vec::new(),
            secret: [0; 32],
            confirmation_salt: [0; 16],
            confirmation_key: [0; 16],
            provisioner_confirmation: [0; 16],
            device_key: None,
            provisioning_data: None,
            reflect_random: false,
            corrupt_confirmation: false,
        }
    }

    fn handle(&mut self, pdu: &[u8]) -> Vec<Vec<u8>> {
        let (&opcode, params) = pdu.split_first().unwrap();
        let reply = match opcode {
            0x00 => {
                self.inputs.extend_from_slice(params);
                Some(ProvisioningPdu::Capabilities(self.caps))
            }
            0x02 => {
                self.inputs.extend_from_slice(params);
                None
            }
            0x03 => {
                let own = self.key_pair.public_key();
                self.inputs.extend_from_slice(params);
                self.inputs.extend_from_slice(&own);
                self.secret = self.key_pair.agree(params).unwrap();
                self.confirmation_salt = s1(&self.inputs);
                self.confirmation_key = k1(&self.secret, &self.confirmation_salt, PRCK);
                Some(ProvisioningPdu::PublicKey(own))
            }
            0x05 => {
                self.provisioner_confirmation.copy_from_slice(params);
                let mut value = confirmation(&self.confirmation_key, &self.random, &self.auth_value);
                if self.corrupt_confirmation {
                    value[0] ^= 0x01;
                }
                Some(ProvisioningPdu::Confirmation(value))
            }
            0x06 => {
                let mut provisioner_random = [0u8; 16];
                provisioner_random.copy_from_slice(params);
                let expected =
                    confirmation(&self.confirmation_key, &provisioner_random, &self.auth_value);
                if expected != self.provisioner_confirmation {
                    Some(ProvisioningPdu::Failed(FailureCode::ConfirmationFailed))
                } else {
                    let mut salt_input = Vec::with_capacity(48);
                    salt_input.extend_from_slice(&self.confirmation_salt);
                    salt_input.extend_from_slice(&provisioner_random);
                    salt_input.extend_from_slice(&self.random);
                    let provisioning_salt = s1(&salt_input);
                    self.device_key = Some(k1(&self.secret, &provisioning_salt, PRDK));
                    self.confirmation_salt = provisioning_salt;

                    let random = if self.reflect_random {
                        provisioner_random
                    } else {
                        self.random
                    };
                    Some(ProvisioningPdu::Random(random))
                }
            }
            0x07 => {
                let provisioning_salt = self.confirmation_salt;
                let session_key = k1(&self.secret, &provisioning_salt, PRSK);
                let mut nonce = [0u8; 13];
                nonce.copy_from_slice(&k1(&self.secret, &provisioning_salt, PRSN)[3..]);
                match aes_ccm_decrypt(&session_key, &nonce, &[], params, MicSize::Long) {
                    Ok(data) => {
                        self.provisioning_data = Some(data);
                        Some(ProvisioningPdu::Complete)
                    }
                    Err(_) => Some(ProvisioningPdu::Failed(FailureCode::DecryptionFailed)),
                }
            }
            _ => Some(ProvisioningPdu::Failed(FailureCode::UnexpectedPdu)),
        };
        reply.map(|pdu| pdu.encode().to_vec()).into_iter().collect()
    }
}

struct Harness {
    provisioner: Provisioner,
    outbound: UnboundedReceiver<(Peer, Bytes)>,
    events: UnboundedReceiver<(Peer, ProvisioningEvent)>,
    device: FakeDevice,
    proxy: ProxyReassembler,
    frames: Vec<usize>,
}

impl Harness {
    fn new(
        params: ProvisioningParams,
        auth_method: AuthMethod,
        device: FakeDevice,
        mtu: Option<usize>,
    ) -> Self {
        let (transport, outbound) = ChannelTransport::new();
        let (sink, events) = ChannelEventSink::new();
        let mut provisioner = Provisioner::new(
            Peer(Uuid::new_v4()),
            params,
            Arc::new(transport),
            Arc::new(sink),
        )
        .unwrap()
        .with_auth_method(auth_method);
        if let Some(mtu) = mtu {
            provisioner = provisioner.with_proxy_mtu(mtu);
        }
        Self {
            provisioner,
            outbound,
            events,
            device,
            proxy: ProxyReassembler::new(),
            frames: Vec::new(),
        }
    }

    async fn step(&mut self) -> Result<(), ProvisioningError> {
        self.provisioner.send_next().await?;

        let mut frames = 0;
        while let Ok((_, frame)) = self.outbound.try_recv() {
            frames += 1;
            let pdu = ProxyPdu::decode(&frame).unwrap();
            if let Some((typ, payload)) = self.proxy.push(pdu).unwrap() {
                assert_eq!(typ, ProxyPduType::Provisioning);
                for reply in self.device.handle(&payload) {
                    self.provisioner.on_pdu_received(&reply)?;
                }
            }
        }
        self.frames.push(frames);
        Ok(())
    }

    async fn run(&mut self) -> Result<(), ProvisioningError> {
        while self.provisioner.wants_to_send() {
            self.step().await?;
        }
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<ProvisioningEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn params() -> ProvisioningParams {
    ProvisioningParams::new(NETWORK_KEY, 0x0010)
}

#[tokio::test]
async fn test_no_oob_handshake_completes() {
    let params = params();
    let expected_data = params.encode();
    let mut harness = Harness::new(
        params,
        AuthMethod::NoOob,
        FakeDevice::new(capabilities(2), [0; 16]),
        None,
    );

    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::Complete);

    let events = harness.drain_events();
    assert_eq!(
        events,
        vec![
            ProvisioningEvent::InviteSent,
            ProvisioningEvent::CapabilitiesReceived(capabilities(2)),
            ProvisioningEvent::StartSent,
            ProvisioningEvent::PublicKeySent,
            ProvisioningEvent::PublicKeyExchanged,
            ProvisioningEvent::ConfirmationSent,
            ProvisioningEvent::ConfirmationReceived,
            ProvisioningEvent::RandomSent,
            ProvisioningEvent::RandomReceived,
            ProvisioningEvent::DataSent,
            ProvisioningEvent::Complete {
                unicast_address: 0x0010,
                element_count: 2,
            },
        ]
    );

    let outcome = harness.provisioner.take_outcome().unwrap();
    assert_eq!(Some(outcome.device_key), harness.device.device_key);
    assert_eq!(outcome.network_key, NETWORK_KEY);
    assert_eq!(outcome.unicast_address, 0x0010);
    assert_eq!(outcome.element_count, 2);
    assert_eq!(
        harness.device.provisioning_data.as_deref(),
        Some(&expected_data[..])
    );
    assert!(harness.frames.iter().all(|&n| n == 1));
}

#[tokio::test]
async fn test_static_oob_waits_for_input() {
    let mut harness = Harness::new(
        params(),
        AuthMethod::StaticOob,
        FakeDevice::new(capabilities(1), STATIC_OOB),
        None,
    );

    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::AwaitingAuthInput);
    assert!(harness
        .drain_events()
        .contains(&ProvisioningEvent::AuthInputRequested(AuthMethod::StaticOob)));

    harness
        .provisioner
        .set_auth_input(AuthInput::Static(STATIC_OOB))
        .unwrap();
    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::Complete);
    assert_eq!(
        harness.provisioner.outcome().map(|o| o.device_key),
        harness.device.device_key
    );
}

#[tokio::test]
async fn test_output_oob_numeric() {
    let method = AuthMethod::OutputOob {
        action: OutputAction::Numeric,
        size: 4,
    };
    let shown = AuthInput::Numeric(4711);
    let mut harness = Harness::new(
        params(),
        method,
        FakeDevice::new(capabilities(1), shown.auth_value()),
        None,
    );

    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::AwaitingAuthInput);

    // Five digits do not fit a four digit output
    assert!(matches!(
        harness.provisioner.set_auth_input(AuthInput::Numeric(12345)),
        Err(ProvisioningError::InvalidParams(_))
    ));
    assert_eq!(harness.provisioner.state(), &ProvisioningState::AwaitingAuthInput);

    harness.provisioner.set_auth_input(shown).unwrap();
    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::Complete);
}

#[tokio::test]
async fn test_input_oob_displays_value() {
    let method = AuthMethod::InputOob {
        action: InputAction::Numeric,
        size: 6,
    };
    let mut harness = Harness::new(
        params(),
        method,
        FakeDevice::new(capabilities(1), [0; 16]),
        None,
    );

    harness.run().await.unwrap();
    assert_eq!(
        harness.provisioner.state(),
        &ProvisioningState::AwaitingInputComplete
    );

    let value = harness
        .drain_events()
        .into_iter()
        .find_map(|event| match event {
            ProvisioningEvent::InputOobDisplay { action, value } => {
                assert_eq!(action, InputAction::Numeric);
                Some(value)
            }
            _ => None,
        })
        .unwrap();
    value.validate(6).unwrap();

    // User typed the value on the device
    harness.device.auth_value = value.auth_value();
    harness
        .provisioner
        .on_pdu_received(&ProvisioningPdu::InputComplete.encode())
        .unwrap();
    assert!(harness.provisioner.wants_to_send());

    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::Complete);
}

#[tokio::test]
async fn test_wrong_static_oob_rejected_by_device() {
    let mut harness = Harness::new(
        params(),
        AuthMethod::StaticOob,
        FakeDevice::new(capabilities(1), STATIC_OOB),
        None,
    );
    harness.run().await.unwrap();
    harness
        .provisioner
        .set_auth_input(AuthInput::Static([0x01; 16]))
        .unwrap();

    let result = harness.run().await;
    assert_eq!(
        result,
        Err(ProvisioningError::Remote(FailureCode::ConfirmationFailed))
    );
    assert!(matches!(
        harness.provisioner.state(),
        ProvisioningState::Failed(ProvisioningError::Remote(_))
    ));
    assert_eq!(
        harness.drain_events().last(),
        Some(&ProvisioningEvent::Failed(ProvisioningError::Remote(
            FailureCode::ConfirmationFailed
        )))
    );
}

#[tokio::test]
async fn test_tampered_device_confirmation() {
    let mut device = FakeDevice::new(capabilities(1), [0; 16]);
    device.corrupt_confirmation = true;
    let mut harness = Harness::new(params(), AuthMethod::NoOob, device, None);

    assert_eq!(
        harness.run().await,
        Err(ProvisioningError::AuthenticationFailure)
    );
    assert!(harness.provisioner.outcome().is_none());
    assert!(!harness.provisioner.wants_to_send());
}

#[tokio::test]
async fn test_reflected_random_rejected() {
    let mut device = FakeDevice::new(capabilities(1), [0; 16]);
    device.reflect_random = true;
    let mut harness = Harness::new(params(), AuthMethod::NoOob, device, None);

    assert_eq!(
        harness.run().await,
        Err(ProvisioningError::AuthenticationFailure)
    );
    assert_eq!(
        harness.provisioner.state(),
        &ProvisioningState::Failed(ProvisioningError::AuthenticationFailure)
    );
}

#[tokio::test]
async fn test_malformed_capabilities() {
    let mut harness = Harness::new(
        params(),
        AuthMethod::NoOob,
        FakeDevice::new(capabilities(1), [0; 16]),
        None,
    );
    harness.provisioner.send_next().await.unwrap();

    let result = harness.provisioner.on_pdu_received(&[0x01, 0x01, 0x00]);
    assert_eq!(
        result,
        Err(ProvisioningError::Protocol(FailureCode::InvalidFormat))
    );
    assert!(harness.provisioner.state().is_terminal());
}

#[tokio::test]
async fn test_unsupported_auth_method() {
    let method = AuthMethod::OutputOob {
        action: OutputAction::Alphanumeric,
        size: 4,
    };
    let mut harness = Harness::new(
        params(),
        method,
        FakeDevice::new(capabilities(1), [0; 16]),
        None,
    );

    let result = harness.run().await;
    assert!(matches!(result, Err(ProvisioningError::InvalidParams(_))));
    assert!(matches!(
        harness.provisioner.state(),
        ProvisioningState::Failed(ProvisioningError::InvalidParams(_))
    ));
}

#[tokio::test]
async fn test_elements_past_unicast_range() {
    let mut harness = Harness::new(
        ProvisioningParams::new(NETWORK_KEY, 0x7fff),
        AuthMethod::NoOob,
        FakeDevice::new(capabilities(2), [0; 16]),
        None,
    );

    assert_eq!(
        harness.run().await,
        Err(ProvisioningError::Protocol(FailureCode::CannotAssignAddresses))
    );
}

#[tokio::test]
async fn test_abort_discards_session() {
    let mut harness = Harness::new(
        params(),
        AuthMethod::StaticOob,
        FakeDevice::new(capabilities(1), STATIC_OOB),
        None,
    );
    harness.run().await.unwrap();
    harness.provisioner.abort();

    assert_eq!(
        harness.provisioner.state(),
        &ProvisioningState::Failed(ProvisioningError::Aborted)
    );
    assert!(matches!(
        harness.provisioner.set_auth_input(AuthInput::Static(STATIC_OOB)),
        Err(ProvisioningError::InvalidState(_))
    ));
    assert!(matches!(
        harness.provisioner.send_next().await,
        Err(ProvisioningError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_timeout_reported_once() {
    let mut harness = Harness::new(
        params(),
        AuthMethod::NoOob,
        FakeDevice::new(capabilities(1), [0; 16]),
        None,
    );
    harness.provisioner.send_next().await.unwrap();
    harness.provisioner.on_timeout();
    harness.provisioner.on_timeout();

    let failures: Vec<_> = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ProvisioningEvent::Failed(_)))
        .collect();
    assert_eq!(
        failures,
        vec![ProvisioningEvent::Failed(ProvisioningError::Timeout)]
    );
}

#[tokio::test]
async fn test_small_mtu_splits_pdus() {
    let mut harness = Harness::new(
        params(),
        AuthMethod::NoOob,
        FakeDevice::new(capabilities(1), [0; 16]),
        Some(20),
    );

    harness.run().await.unwrap();
    assert_eq!(harness.provisioner.state(), &ProvisioningState::Complete);

    // Invite, Start, PublicKey (65 bytes), Confirmation, Random, Data
    assert_eq!(harness.frames, vec![1, 1, 4, 1, 1, 2]);
}
