//! Node context configuration.

use std::time::Duration;

use mesh_wire::{DEFAULT_REASSEMBLY_TIMEOUT, MAX_TTL, PROXY_HEADER_SIZE};

use crate::error::NodeError;

/// Default TTL for outbound messages
pub const DEFAULT_TTL: u8 = 5;

/// Settings of a [`NodeContext`](crate::NodeContext)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// TTL used when a send does not name one
    pub default_ttl: u8,
    /// How long a partial segmented message is kept
    pub reassembly_timeout: Duration,
    /// GATT MTU for outbound proxy PDUs; `None` sends whole PDUs
    pub proxy_mtu: Option<usize>,
    /// Answer completed segmented messages with a Segment Acknowledgment
    pub ack_segments: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            proxy_mtu: None,
            ack_segments: true,
        }
    }
}

impl NodeConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), NodeError> {
        // TTL 1 is reserved for outbound messages
        if self.default_ttl == 1 || self.default_ttl > MAX_TTL {
            return Err(NodeError::Config(format!(
                "default ttl {} not in 0, 2..=127",
                self.default_ttl
            )));
        }
        if self.reassembly_timeout.is_zero() {
            return Err(NodeError::Config(
                "reassembly timeout must be positive".to_string(),
            ));
        }
        if let Some(mtu) = self.proxy_mtu {
            if mtu <= PROXY_HEADER_SIZE {
                return Err(NodeError::Config(format!("proxy mtu {} too small", mtu)));
            }
        }
        Ok(())
    }
}
