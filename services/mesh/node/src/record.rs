//! Provisioned node record.

use std::collections::BTreeMap;
use std::fmt;

use mesh_crypto::{k2, k3, k4, Key128, NetworkKeys, K2_MASTER_INPUT};
use mesh_provisioning::{Peer, ProvisioningOutcome, KEY_INDEX_MAX};
use mesh_wire::{is_unicast, seq_zero, SEQUENCE_NUMBER_MAX};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::error::NodeError;

/// Application key with its k4 identifier
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct AppKey {
    /// 128-bit key
    pub key: Key128,
    /// 6-bit AID
    pub aid: u8,
}

impl AppKey {
    /// Wrap a key and derive its AID
    pub fn new(key: Key128) -> Self {
        Self { aid: k4(&key), key }
    }
}

impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKey")
            .field("aid", &format_args!("{:#04x}", self.aid))
            .finish_non_exhaustive()
    }
}

/// Key material and counters of one provisioned node
///
/// `sequence_number` is the next number [`next_sequence_number`] hands out.
/// It only moves forward until [`set_iv_index`] starts a new IV index.
///
/// [`next_sequence_number`]: MeshNodeRecord::next_sequence_number
/// [`set_iv_index`]: MeshNodeRecord::set_iv_index
#[derive(Clone)]
pub struct MeshNodeRecord {
    peer: Option<Peer>,
    unicast_address: u16,
    element_count: u8,
    device_key: Key128,
    network_key: Key128,
    network_key_index: u16,
    app_keys: BTreeMap<u16, AppKey>,
    iv_index: u32,
    sequence_number: u32,
    network_keys: NetworkKeys,
    network_id: [u8; 8],
}

impl MeshNodeRecord {
    /// Create a record for a node at `unicast_address`
    pub fn new(
        unicast_address: u16,
        element_count: u8,
        device_key: Key128,
        network_key: Key128,
        network_key_index: u16,
        iv_index: u32,
    ) -> Result<Self, NodeError> {
        if element_count == 0 {
            return Err(NodeError::Config("node needs at least one element".to_string()));
        }
        let last = u32::from(unicast_address) + u32::from(element_count) - 1;
        if !is_unicast(unicast_address) || last > 0x7fff {
            return Err(NodeError::InvalidAddress(unicast_address));
        }
        if network_key_index > KEY_INDEX_MAX {
            return Err(NodeError::Config(format!(
                "network key index {:#x} exceeds {:#x}",
                network_key_index, KEY_INDEX_MAX
            )));
        }

        Ok(Self {
            peer: None,
            unicast_address,
            element_count,
            device_key,
            network_key,
            network_key_index,
            app_keys: BTreeMap::new(),
            iv_index,
            sequence_number: 0,
            network_keys: k2(&network_key, K2_MASTER_INPUT),
            network_id: k3(&network_key),
        })
    }

    /// Create the record of a freshly provisioned device
    pub fn from_provisioning(outcome: &ProvisioningOutcome) -> Result<Self, NodeError> {
        let mut record = Self::new(
            outcome.unicast_address,
            outcome.element_count,
            outcome.device_key,
            outcome.network_key,
            outcome.key_index,
            outcome.iv_index,
        )?;
        record.peer = Some(outcome.peer);
        info!(
            "Created node record {:#06x} ({} element(s)) for {}",
            record.unicast_address, record.element_count, outcome.peer
        );
        Ok(record)
    }

    /// Device the record was provisioned from, if known
    pub fn peer(&self) -> Option<Peer> {
        self.peer
    }

    /// Primary element address
    pub fn unicast_address(&self) -> u16 {
        self.unicast_address
    }

    /// Number of elements
    pub fn element_count(&self) -> u8 {
        self.element_count
    }

    /// True if `addr` is one of this node's element addresses
    pub fn contains_address(&self, addr: u16) -> bool {
        let first = u32::from(self.unicast_address);
        (first..first + u32::from(self.element_count)).contains(&u32::from(addr))
    }

    /// Device key
    pub fn device_key(&self) -> &Key128 {
        &self.device_key
    }

    /// Network key
    pub fn network_key(&self) -> &Key128 {
        &self.network_key
    }

    /// Global index of the network key
    pub fn network_key_index(&self) -> u16 {
        self.network_key_index
    }

    /// NID, encryption key and privacy key of the network key
    pub fn network_keys(&self) -> &NetworkKeys {
        &self.network_keys
    }

    /// 64-bit network ID (k3 of the network key)
    pub fn network_id(&self) -> [u8; 8] {
        self.network_id
    }

    /// Current IV index
    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    /// Next sequence number to be issued
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// SeqZero of the next sequence number
    pub fn seq_zero(&self) -> u16 {
        seq_zero(self.sequence_number)
    }

    /// Issue one sequence number
    pub fn next_sequence_number(&mut self) -> Result<u32, NodeError> {
        self.reserve_sequence_numbers(1)
    }

    /// Issue `count` consecutive sequence numbers, returning the first
    pub fn reserve_sequence_numbers(&mut self, count: u32) -> Result<u32, NodeError> {
        let first = self.sequence_number;
        let last = first
            .checked_add(count.saturating_sub(1))
            .ok_or(NodeError::SequenceExhausted)?;
        if count == 0 || last > SEQUENCE_NUMBER_MAX {
            return Err(NodeError::SequenceExhausted);
        }
        self.sequence_number = last + 1;
        Ok(first)
    }

    /// Move the counter forward to `seq`
    pub fn set_sequence_number(&mut self, seq: u32) -> Result<(), NodeError> {
        if seq > SEQUENCE_NUMBER_MAX + 1 {
            return Err(NodeError::SequenceExhausted);
        }
        if seq < self.sequence_number {
            return Err(NodeError::SequenceRewind {
                current: self.sequence_number,
                requested: seq,
            });
        }
        self.sequence_number = seq;
        Ok(())
    }

    /// Enter a later IV index; the sequence counter restarts at zero
    pub fn set_iv_index(&mut self, iv_index: u32) -> Result<(), NodeError> {
        if iv_index <= self.iv_index {
            return Err(NodeError::IvIndexRewind {
                current: self.iv_index,
                requested: iv_index,
            });
        }
        debug!(
            "Node {:#06x}: IV index {:#x} -> {:#x}, sequence reset",
            self.unicast_address, self.iv_index, iv_index
        );
        self.iv_index = iv_index;
        self.sequence_number = 0;
        Ok(())
    }

    /// Bind an application key, returning its AID
    pub fn add_app_key(&mut self, index: u16, key: Key128) -> Result<u8, NodeError> {
        if index > KEY_INDEX_MAX {
            return Err(NodeError::UnknownAppKey(index));
        }
        let app_key = AppKey::new(key);
        let aid = app_key.aid;
        if let Some(mut old) = self.app_keys.insert(index, app_key) {
            old.zeroize();
        }
        Ok(aid)
    }

    /// Remove an application key
    pub fn remove_app_key(&mut self, index: u16) -> bool {
        match self.app_keys.remove(&index) {
            Some(mut old) => {
                old.zeroize();
                true
            }
            None => false,
        }
    }

    /// Application key by index
    pub fn app_key(&self, index: u16) -> Option<&AppKey> {
        self.app_keys.get(&index)
    }

    /// Application keys whose AID equals `aid`
    pub fn app_keys_with_aid(&self, aid: u8) -> impl Iterator<Item = (u16, &AppKey)> + '_ {
        self.app_keys
            .iter()
            .filter(move |(_, key)| key.aid == aid)
            .map(|(index, key)| (*index, key))
    }

    /// Indexes of all bound application keys
    pub fn app_key_indexes(&self) -> Vec<u16> {
        self.app_keys.keys().copied().collect()
    }
}

impl Drop for MeshNodeRecord {
    fn drop(&mut self) {
        self.device_key.zeroize();
        self.network_key.zeroize();
        for key in self.app_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl fmt::Debug for MeshNodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshNodeRecord")
            .field("peer", &self.peer)
            .field("unicast_address", &format_args!("{:#06x}", self.unicast_address))
            .field("element_count", &self.element_count)
            .field("network_key_index", &self.network_key_index)
            .field("app_keys", &self.app_keys.keys().collect::<Vec<_>>())
            .field("iv_index", &self.iv_index)
            .field("sequence_number", &self.sequence_number)
            .field("nid", &format_args!("{:#04x}", self.network_keys.nid))
            .finish_non_exhaustive()
    }
}
