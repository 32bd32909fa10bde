//! Node send/receive pipeline.
//!
//! A [`NodeContext`] owns the local node record and connects the layers:
//! access payloads go through upper transport encryption, segmentation,
//! network encryption and proxy framing before reaching the transport;
//! inbound proxy PDUs are dispatched by type and travel the same path in
//! reverse. Provisioning PDUs are handed to the attached [`Provisioner`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use mesh_crypto::{Key128, MicSize};
use mesh_provisioning::{
    AuthInput, AuthMethod, PduTransport, Peer, Provisioner, ProvisioningError,
    ProvisioningEventSink, ProvisioningParams, ProvisioningState,
};
use mesh_wire::{
    decrypt_access, encrypt_access, full_block_ack, is_unicast, seq_zero, AccessMessage,
    AccessNonceParams, AccessPayload, ControlMessage, ControlPayload, KeySelector,
    LowerTransportPdu, MeshMessage, NetworkHeader, NetworkPdu, NetworkPduBuilder, ProxyPdu,
    ProxyPduType, ProxyReassembler, Reassembler, SegmentAck, Segmenter, UpperTransportKey,
    UpperTransportPdu, WireError, SEGMENT_ACCESS_SIZE, SEGMENT_CONTROL_SIZE, UNASSIGNED_ADDRESS,
    UNSEGMENTED_ACCESS_MAX, UNSEGMENTED_CONTROL_MAX,
};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroize;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::record::MeshNodeRecord;
use crate::store::NodeStore;

/// Local node: record, reassembly state and the attached provisioner
pub struct NodeContext {
    config: NodeConfig,
    proxy: Peer,
    unicast_address: u16,
    record: Mutex<MeshNodeRecord>,
    store: Arc<dyn NodeStore>,
    transport: Arc<dyn PduTransport>,
    segmenter: Segmenter,
    reassembler: Reassembler,
    proxy_reassembly: DashMap<Peer, ProxyReassembler>,
    provisioner: Mutex<Option<Provisioner>>,
}

impl NodeContext {
    /// Create a context sending through `proxy`
    pub fn new(
        record: MeshNodeRecord,
        config: NodeConfig,
        store: Arc<dyn NodeStore>,
        transport: Arc<dyn PduTransport>,
        proxy: Peer,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        info!(
            "Node {:#06x} attached to {} (nid={:#04x}, iv_index={:#x})",
            record.unicast_address(),
            proxy,
            record.network_keys().nid,
            record.iv_index()
        );
        Ok(Self {
            unicast_address: record.unicast_address(),
            reassembler: Reassembler::new(config.reassembly_timeout),
            config,
            proxy,
            record: Mutex::new(record),
            store,
            transport,
            segmenter: Segmenter::new(),
            proxy_reassembly: DashMap::new(),
            provisioner: Mutex::new(None),
        })
    }

    /// Primary element address of the local node
    pub fn unicast_address(&self) -> u16 {
        self.unicast_address
    }

    /// Configuration in use
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Store holding provisioned node records
    pub fn store(&self) -> Arc<dyn NodeStore> {
        self.store.clone()
    }

    /// Copy of the local node record
    pub async fn snapshot(&self) -> MeshNodeRecord {
        self.record.lock().await.clone()
    }

    /// Next sequence number the node will use
    pub async fn sequence_number(&self) -> u32 {
        self.record.lock().await.sequence_number()
    }

    /// Move the sequence counter forward
    pub async fn set_sequence_number(&self, seq: u32) -> Result<(), NodeError> {
        self.record.lock().await.set_sequence_number(seq)
    }

    /// Enter a later IV index, restarting the sequence counter
    pub async fn set_iv_index(&self, iv_index: u32) -> Result<(), NodeError> {
        self.record.lock().await.set_iv_index(iv_index)
    }

    /// Bind an application key to the local node
    pub async fn add_app_key(&self, index: u16, key: Key128) -> Result<u8, NodeError> {
        self.record.lock().await.add_app_key(index, key)
    }

    /// Encrypt and send an access message, returning its SeqAuth
    ///
    /// `KeySelector::Device` uses the device key of the stored record for
    /// `dst`, falling back to the local device key.
    pub async fn send_access(
        &self,
        dst: u16,
        ttl: Option<u8>,
        key: KeySelector,
        payload: &AccessPayload,
    ) -> Result<u32, NodeError> {
        if dst == UNASSIGNED_ADDRESS {
            return Err(NodeError::InvalidAddress(dst));
        }
        let plaintext = payload.encode()?;
        let peer_device_key = match key {
            KeySelector::Device => self.store.load(dst).await?.map(|r| *r.device_key()),
            KeySelector::Application(_) => None,
        };

        let (frames, first) = {
            let mut record = self.record.lock().await;
            let (mut upper_key, aid) = match key {
                KeySelector::Device => (peer_device_key.unwrap_or(*record.device_key()), None),
                KeySelector::Application(index) => {
                    let app = record.app_key(index).ok_or(NodeError::UnknownAppKey(index))?;
                    (app.key, Some(app.aid))
                }
            };

            let count = segment_count(
                plaintext.len() + MicSize::Short.size(),
                UNSEGMENTED_ACCESS_MAX,
                SEGMENT_ACCESS_SIZE,
            );
            let first = record.reserve_sequence_numbers(count)?;
            let nonce = AccessNonceParams {
                seq_auth: first,
                src: self.unicast_address,
                dst,
                iv_index: record.iv_index(),
            };
            let sealed = match aid {
                Some(aid) => encrypt_access(
                    UpperTransportKey::Application {
                        key: &upper_key,
                        aid,
                    },
                    false,
                    &nonce,
                    &plaintext,
                ),
                None => encrypt_access(
                    UpperTransportKey::Device(&upper_key),
                    false,
                    &nonce,
                    &plaintext,
                ),
            };
            upper_key.zeroize();

            let upper = UpperTransportPdu::Access {
                akf: aid.is_some(),
                aid: aid.unwrap_or(0),
                szmic: false,
                payload: sealed?,
            };
            let lower = self.segmenter.split(&upper, seq_zero(first))?;
            let ttl = ttl.unwrap_or(self.config.default_ttl);
            (self.encode_network(&record, false, ttl, first, dst, &lower)?, first)
        };

        debug!(
            "Access {} to {:#06x} seq_auth={:#08x} in {} pdu(s)",
            payload.opcode,
            dst,
            first,
            frames.len()
        );
        self.transmit(frames).await?;
        Ok(first)
    }

    /// Send a transport control message, returning its SeqAuth
    pub async fn send_control(
        &self,
        dst: u16,
        ttl: Option<u8>,
        payload: &ControlPayload,
    ) -> Result<u32, NodeError> {
        if dst == UNASSIGNED_ADDRESS {
            return Err(NodeError::InvalidAddress(dst));
        }
        let opcode = payload.opcode();
        if opcode > 0x7f {
            return Err(WireError::Opcode(opcode).into());
        }
        let params = payload.params();

        let (frames, first) = {
            let mut record = self.record.lock().await;
            let count = segment_count(params.len(), UNSEGMENTED_CONTROL_MAX, SEGMENT_CONTROL_SIZE);
            let first = record.reserve_sequence_numbers(count)?;
            let upper = UpperTransportPdu::Control { opcode, params };
            let lower = self.segmenter.split(&upper, seq_zero(first))?;
            let ttl = ttl.unwrap_or(self.config.default_ttl);
            (self.encode_network(&record, true, ttl, first, dst, &lower)?, first)
        };

        debug!(
            "Control {:#04x} to {:#06x} seq_auth={:#08x} in {} pdu(s)",
            opcode,
            dst,
            first,
            frames.len()
        );
        self.transmit(frames).await?;
        Ok(first)
    }

    /// Handle one PDU written by the proxy or device `peer`
    ///
    /// Returns the decoded message once a network PDU completes one.
    pub async fn on_pdu_received(
        &self,
        peer: &Peer,
        bytes: &[u8],
    ) -> Result<Option<MeshMessage>, NodeError> {
        let pdu = ProxyPdu::decode(bytes)?;
        let complete = {
            let mut reassembler = self.proxy_reassembly.entry(*peer).or_default();
            reassembler.push(pdu)?
        };
        let (typ, payload) = match complete {
            Some(complete) => complete,
            None => return Ok(None),
        };

        match typ {
            ProxyPduType::Network => self.on_network_pdu(&payload).await,
            ProxyPduType::Provisioning => {
                self.on_provisioning_pdu(peer, &payload).await?;
                Ok(None)
            }
            other => {
                warn!("Dropping {:?} PDU from {}", other, peer);
                Err(NodeError::UnsupportedPdu(other))
            }
        }
    }

    /// Drop partial segmented messages older than the reassembly timeout
    pub fn expire_reassembly(&self, now: Instant) -> Vec<NodeError> {
        self.reassembler
            .expire(now)
            .into_iter()
            .map(|key| NodeError::ReassemblyTimeout {
                src: key.src,
                seq_zero: key.seq_zero,
            })
            .collect()
    }

    /// Start provisioning `peer` and send the Invite
    pub async fn start_provisioning(
        &self,
        peer: Peer,
        params: ProvisioningParams,
        auth_method: AuthMethod,
        events: Arc<dyn ProvisioningEventSink>,
    ) -> Result<(), NodeError> {
        let mut slot = self.provisioner.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.state().is_terminal() {
                return Err(
                    ProvisioningError::InvalidState("provisioning already in progress").into(),
                );
            }
        }

        let mut provisioner = Provisioner::new(peer, params, self.transport.clone(), events)?
            .with_auth_method(auth_method);
        if let Some(mtu) = self.config.proxy_mtu {
            provisioner = provisioner.with_proxy_mtu(mtu);
        }
        info!("Provisioning {} with {:?}", peer, auth_method);
        self.drive(&mut provisioner).await?;
        *slot = Some(provisioner);
        Ok(())
    }

    /// State of the current or last provisioning run
    pub async fn provisioning_state(&self) -> Option<ProvisioningState> {
        self.provisioner
            .lock()
            .await
            .as_ref()
            .map(|p| p.state().clone())
    }

    /// Supply the OOB value for the running provisioning
    pub async fn set_auth_input(&self, input: AuthInput) -> Result<(), NodeError> {
        let mut slot = self.provisioner.lock().await;
        let provisioner = slot.as_mut().ok_or(ProvisioningError::InvalidState(
            "no provisioning in progress",
        ))?;
        provisioner.set_auth_input(input)?;
        self.drive(provisioner).await
    }

    /// Abort the running provisioning
    pub async fn abort_provisioning(&self) {
        if let Some(provisioner) = self.provisioner.lock().await.as_mut() {
            provisioner.abort();
        }
    }

    /// Report a provisioning timeout from the caller's timer
    pub async fn provisioning_timeout(&self) {
        if let Some(provisioner) = self.provisioner.lock().await.as_mut() {
            provisioner.on_timeout();
        }
    }

    async fn on_provisioning_pdu(&self, peer: &Peer, payload: &[u8]) -> Result<(), NodeError> {
        let mut slot = self.provisioner.lock().await;
        let provisioner = match slot.as_mut() {
            Some(provisioner) if provisioner.peer() == peer => provisioner,
            _ => {
                warn!("Provisioning PDU from {} without a session", peer);
                return Err(ProvisioningError::InvalidState("no provisioning in progress").into());
            }
        };
        provisioner.on_pdu_received(payload)?;
        self.drive(provisioner).await
    }

    async fn drive(&self, provisioner: &mut Provisioner) -> Result<(), NodeError> {
        while provisioner.wants_to_send() {
            provisioner.send_next().await?;
        }
        if *provisioner.state() == ProvisioningState::Complete {
            if let Some(outcome) = provisioner.take_outcome() {
                let record = MeshNodeRecord::from_provisioning(&outcome)?;
                self.store.store(record).await?;
            }
        }
        Ok(())
    }

    async fn on_network_pdu(&self, bytes: &[u8]) -> Result<Option<MeshMessage>, NodeError> {
        let net = {
            let record = self.record.lock().await;
            let net = match NetworkPdu::decode(record.network_keys(), record.iv_index(), bytes)? {
                Some(net) => net,
                None => return Ok(None),
            };
            if record.contains_address(net.header.src) {
                trace!("Ignoring own PDU seq={:#08x}", net.header.seq);
                return Ok(None);
            }
            if is_unicast(net.header.dst) && !record.contains_address(net.header.dst) {
                debug!(
                    "Ignoring PDU for {:#06x} from {:#06x}",
                    net.header.dst, net.header.src
                );
                return Ok(None);
            }
            net
        };

        let lower = LowerTransportPdu::decode(net.header.ctl, &net.transport_pdu)?;
        let segmented = lower.segment_header().map(|h| (h.seq_zero, h.seg_n));
        let assembled = match self.reassembler.accept(&net, lower, Instant::now())? {
            Some(assembled) => assembled,
            None => return Ok(None),
        };

        if let Some((seq_zero, seg_n)) = segmented {
            if self.config.ack_segments && is_unicast(assembled.dst) {
                self.acknowledge(assembled.src, seq_zero, seg_n).await;
            }
        }

        let message = match assembled.pdu {
            UpperTransportPdu::Control { opcode, params } => MeshMessage::Control(ControlMessage {
                src: assembled.src,
                dst: assembled.dst,
                ttl: assembled.ttl,
                payload: ControlPayload::decode(opcode, params)?,
            }),
            UpperTransportPdu::Access {
                akf,
                aid,
                szmic,
                payload,
            } => {
                let nonce = AccessNonceParams {
                    seq_auth: assembled.seq_auth,
                    src: assembled.src,
                    dst: assembled.dst,
                    iv_index: assembled.iv_index,
                };
                let (key, plain) = if akf {
                    self.decrypt_with_app_key(aid, szmic, &nonce, &payload).await?
                } else {
                    self.decrypt_with_device_key(szmic, &nonce, &payload).await?
                };
                MeshMessage::Access(AccessMessage {
                    src: assembled.src,
                    dst: assembled.dst,
                    ttl: assembled.ttl,
                    seq_auth: assembled.seq_auth,
                    iv_index: assembled.iv_index,
                    key,
                    payload: AccessPayload::decode(&plain)?,
                })
            }
        };

        debug!(
            "Received message from {:#06x} to {:#06x}",
            message.src(),
            message.dst()
        );
        Ok(Some(message))
    }

    async fn decrypt_with_app_key(
        &self,
        aid: u8,
        szmic: bool,
        nonce: &AccessNonceParams,
        upper: &[u8],
    ) -> Result<(KeySelector, Bytes), NodeError> {
        let record = self.record.lock().await;
        let mut candidates = record.app_keys_with_aid(aid).peekable();
        if candidates.peek().is_none() {
            return Err(NodeError::UnknownAid(aid));
        }
        for (index, app) in candidates {
            let key = UpperTransportKey::Application { key: &app.key, aid };
            match decrypt_access(key, szmic, nonce, upper) {
                Ok(plain) => return Ok((KeySelector::Application(index), plain)),
                Err(WireError::AuthenticationFailure) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(WireError::AuthenticationFailure.into())
    }

    async fn decrypt_with_device_key(
        &self,
        szmic: bool,
        nonce: &AccessNonceParams,
        upper: &[u8],
    ) -> Result<(KeySelector, Bytes), NodeError> {
        let mut keys: Vec<Key128> = Vec::with_capacity(2);
        if let Some(peer) = self.store.load(nonce.src).await? {
            keys.push(*peer.device_key());
        }
        keys.push(*self.record.lock().await.device_key());

        let mut result: Result<(KeySelector, Bytes), NodeError> =
            Err(WireError::AuthenticationFailure.into());
        for key in &keys {
            match decrypt_access(UpperTransportKey::Device(key), szmic, nonce, upper) {
                Ok(plain) => {
                    result = Ok((KeySelector::Device, plain));
                    break;
                }
                Err(WireError::AuthenticationFailure) => continue,
                Err(err) => {
                    result = Err(err.into());
                    break;
                }
            }
        }
        keys.zeroize();
        result
    }

    async fn acknowledge(&self, src: u16, seq_zero: u16, seg_n: u8) {
        let ack = ControlPayload::SegmentAck(SegmentAck {
            obo: false,
            seq_zero,
            block_ack: full_block_ack(seg_n),
        });
        if let Err(err) = self.send_control(src, None, &ack).await {
            warn!(
                "Failed to acknowledge seq_zero={:#x} from {:#06x}: {}",
                seq_zero, src, err
            );
        }
    }

    fn encode_network(
        &self,
        record: &MeshNodeRecord,
        ctl: bool,
        ttl: u8,
        first: u32,
        dst: u16,
        lower: &[LowerTransportPdu],
    ) -> Result<Vec<Bytes>, NodeError> {
        lower
            .iter()
            .enumerate()
            .map(|(i, pdu)| {
                let header = NetworkHeader {
                    ctl,
                    ttl,
                    seq: first + i as u32,
                    src: self.unicast_address,
                    dst,
                };
                NetworkPduBuilder::new(header)
                    .iv_index(record.iv_index())
                    .transport_pdu(pdu.encode())
                    .encode(record.network_keys())
                    .map_err(NodeError::from)
            })
            .collect()
    }

    async fn transmit(&self, network_pdus: Vec<Bytes>) -> Result<(), NodeError> {
        for pdu in network_pdus {
            let frames = match self.config.proxy_mtu {
                Some(mtu) => ProxyPdu::split(ProxyPduType::Network, &pdu, mtu)?,
                None => vec![ProxyPdu::new(ProxyPduType::Network, pdu).encode()],
            };
            for frame in frames {
                self.transport.send(&self.proxy, frame).await?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("unicast_address", &format_args!("{:#06x}", self.unicast_address))
            .field("proxy", &self.proxy)
            .field("config", &self.config)
            .field("pending_reassembly", &self.reassembler.pending())
            .finish_non_exhaustive()
    }
}

/// Number of lower transport PDUs needed for an upper PDU of `len` octets
fn segment_count(len: usize, unsegmented_max: usize, segment_size: usize) -> u32 {
    if len <= unsegmented_max {
        1
    } else {
        ((len + segment_size - 1) / segment_size) as u32
    }
}
