//! Configuration handling for the btmesh tool.
//!
//! Settings come from a YAML file and are then overridden by `BTMESH_*`
//! environment variables. Library crates only ever see the plain structs
//! built from here ([`MeshNodeRecord`], [`NodeConfig`]).

use anyhow::{anyhow, Context, Result};
use mesh_crypto::Key128;
use mesh_node::{MeshNodeRecord, NodeConfig, DEFAULT_TTL};
use mesh_wire::DEFAULT_REASSEMBLY_TIMEOUT;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the primary unicast address
pub const ENV_UNICAST_ADDRESS: &str = "BTMESH_UNICAST_ADDRESS";
/// Environment variable overriding the IV index
pub const ENV_IV_INDEX: &str = "BTMESH_IV_INDEX";
/// Environment variable overriding the default TTL
pub const ENV_DEFAULT_TTL: &str = "BTMESH_DEFAULT_TTL";
/// Environment variable overriding the reassembly timeout
pub const ENV_REASSEMBLY_TIMEOUT: &str = "BTMESH_REASSEMBLY_TIMEOUT";

/// btmesh configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Primary element address of the local node
    pub unicast_address: u16,
    /// Number of elements of the local node
    pub element_count: u8,
    /// Current IV index
    pub iv_index: u32,
    /// Next sequence number to use
    pub sequence_number: u32,
    /// Network key (hex)
    pub network_key: Option<String>,
    /// Global network key index
    pub network_key_index: u16,
    /// Local device key (hex)
    pub device_key: Option<String>,
    /// Application keys bound to the local node
    pub app_keys: Vec<AppKeyConfig>,
    /// Network and transport settings
    pub transport: TransportConfig,
}

/// One application key entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppKeyConfig {
    /// Global application key index
    pub index: u16,
    /// Key material (hex)
    pub key: String,
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TTL used when a send does not specify one
    pub default_ttl: u8,
    /// Incomplete segmented messages are dropped after this long
    pub reassembly_timeout: Duration,
    /// GATT MTU for proxy PDUs
    pub proxy_mtu: Option<usize>,
    /// Acknowledge completed segmented messages
    pub ack_segments: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            proxy_mtu: None,
            ack_segments: true,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            unicast_address: 0x0001,
            element_count: 1,
            iv_index: 0,
            sequence_number: 0,
            network_key: None,
            network_key_index: 0,
            device_key: None,
            app_keys: Vec::new(),
            transport: TransportConfig::default(),
        }
    }
}

/// File layout; every field is optional so partial files work
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    node: Option<NodeSection>,
    transport: Option<TransportSection>,
    #[serde(default)]
    app_keys: Vec<AppKeyConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeSection {
    unicast_address: Option<u16>,
    element_count: Option<u8>,
    iv_index: Option<u32>,
    sequence_number: Option<u32>,
    network_key: Option<String>,
    network_key_index: Option<u16>,
    device_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransportSection {
    default_ttl: Option<u8>,
    reassembly_timeout: Option<String>,
    proxy_mtu: Option<usize>,
    ack_segments: Option<bool>,
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    ///
    /// A missing file yields the defaults; a file that cannot be read or
    /// parsed is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let file: FileConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                config.apply_file_config(file)?;
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path))
            }
        }

        config.apply_environment_overrides(|name| std::env::var(name).ok())?;

        info!(
            "Node configuration: unicast={:#06x}, elements={}, iv_index={:#x}, ttl={}",
            config.unicast_address,
            config.element_count,
            config.iv_index,
            config.transport.default_ttl
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if let Some(node) = file.node {
            if let Some(address) = node.unicast_address {
                self.unicast_address = address;
            }
            if let Some(count) = node.element_count {
                self.element_count = count;
            }
            if let Some(iv_index) = node.iv_index {
                self.iv_index = iv_index;
            }
            if let Some(seq) = node.sequence_number {
                self.sequence_number = seq;
            }
            if let Some(index) = node.network_key_index {
                self.network_key_index = index;
            }
            self.network_key = node.network_key.or(self.network_key.take());
            self.device_key = node.device_key.or(self.device_key.take());
        }

        if let Some(transport) = file.transport {
            if let Some(ttl) = transport.default_ttl {
                self.transport.default_ttl = ttl;
            }
            if let Some(timeout) = transport.reassembly_timeout {
                self.transport.reassembly_timeout = humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid reassembly_timeout {:?}", timeout))?;
            }
            if transport.proxy_mtu.is_some() {
                self.transport.proxy_mtu = transport.proxy_mtu;
            }
            if let Some(ack) = transport.ack_segments {
                self.transport.ack_segments = ack;
            }
        }

        self.app_keys.extend(file.app_keys);
        Ok(())
    }

    /// Apply `BTMESH_*` overrides read through `lookup`
    fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_UNICAST_ADDRESS) {
            self.unicast_address = parse_number(&value)
                .and_then(|v| u16::try_from(v).map_err(|_| anyhow!("{} out of range", v)))
                .with_context(|| format!("Invalid {}", ENV_UNICAST_ADDRESS))?;
            info!(
                "Unicast address overridden by environment: {:#06x}",
                self.unicast_address
            );
        }

        if let Some(value) = lookup(ENV_IV_INDEX) {
            self.iv_index = parse_number(&value)
                .and_then(|v| u32::try_from(v).map_err(|_| anyhow!("{} out of range", v)))
                .with_context(|| format!("Invalid {}", ENV_IV_INDEX))?;
            info!("IV index overridden by environment: {:#x}", self.iv_index);
        }

        if let Some(value) = lookup(ENV_DEFAULT_TTL) {
            self.transport.default_ttl = parse_number(&value)
                .and_then(|v| u8::try_from(v).map_err(|_| anyhow!("{} out of range", v)))
                .with_context(|| format!("Invalid {}", ENV_DEFAULT_TTL))?;
            info!(
                "Default TTL overridden by environment: {}",
                self.transport.default_ttl
            );
        }

        if let Some(value) = lookup(ENV_REASSEMBLY_TIMEOUT) {
            self.transport.reassembly_timeout = humantime::parse_duration(&value)
                .with_context(|| format!("Invalid {}", ENV_REASSEMBLY_TIMEOUT))?;
            info!(
                "Reassembly timeout overridden by environment: {}",
                humantime::format_duration(self.transport.reassembly_timeout)
            );
        }

        Ok(())
    }

    /// Transport settings as the node layer expects them
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            default_ttl: self.transport.default_ttl,
            reassembly_timeout: self.transport.reassembly_timeout,
            proxy_mtu: self.transport.proxy_mtu,
            ack_segments: self.transport.ack_segments,
        }
    }

    /// Build the local node record, keys included
    pub fn node_record(&self) -> Result<MeshNodeRecord> {
        let network_key = self
            .network_key
            .as_deref()
            .ok_or_else(|| anyhow!("network_key is not configured"))
            .and_then(parse_key)?;
        let device_key = match self.device_key.as_deref() {
            Some(hex) => parse_key(hex)?,
            None => [0u8; 16],
        };

        let mut record = MeshNodeRecord::new(
            self.unicast_address,
            self.element_count,
            device_key,
            network_key,
            self.network_key_index,
            self.iv_index,
        )?;
        record.set_sequence_number(self.sequence_number)?;
        for app in &self.app_keys {
            let key = parse_key(&app.key)
                .with_context(|| format!("Invalid application key {:#05x}", app.index))?;
            record.add_app_key(app.index, key)?;
        }
        Ok(record)
    }
}

/// Parse a 128-bit key from hex
pub fn parse_key(hex_str: &str) -> Result<Key128> {
    let bytes = hex::decode(hex_str.trim()).context("key is not valid hex")?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow!("key must be 16 bytes, got {}", len))
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
pub fn parse_number(value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.with_context(|| format!("{:?} is not a number", value))
}
