//! btmesh command line tool.
//!
//! Derives mesh key material and runs access messages through the node
//! stack, printing the proxy PDUs a GATT bearer would carry.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mesh_crypto::{k2, k3, k4, K2_MASTER_INPUT};
use mesh_node::{MemoryNodeStore, MeshNodeRecord, NodeContext, NodeStore};
use mesh_provisioning::{ChannelTransport, Peer};
use mesh_wire::{AccessPayload, ControlPayload, KeySelector, MeshMessage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[macro_use]
mod logging;
mod config;

use config::{parse_key, parse_number, MeshConfig};
use logging::MeshLogFormatter;

const LOG_TARGETS: [&str; 5] = [
    "btmesh",
    "mesh_crypto",
    "mesh_wire",
    "mesh_provisioning",
    "mesh_node",
];

/// Bluetooth Mesh key derivation and PDU tooling
#[derive(Parser, Debug)]
#[command(name = "btmesh", version, about = "Bluetooth Mesh key derivation and PDU tooling")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "btmesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive NID, encryption, privacy and network ID from a network key
    Keys {
        /// Network key (hex)
        #[arg(long)]
        netkey: String,

        /// Application key (hex) to derive an AID for
        #[arg(long)]
        appkey: Option<String>,
    },

    /// Encrypt an access message from the configured node into proxy PDUs
    Encode {
        /// Destination address, e.g. 0x1201
        #[arg(long, value_parser = parse_u16)]
        dst: u16,

        /// Access opcode (hex, 1 to 3 octets)
        #[arg(long)]
        opcode: String,

        /// Access parameters (hex)
        #[arg(long, default_value = "")]
        params: String,

        /// TTL; the configured default when omitted
        #[arg(long)]
        ttl: Option<u8>,

        /// Encrypt with this application key index instead of a device key
        #[arg(long, value_parser = parse_u16)]
        app_key_index: Option<u16>,

        /// Sequence number to start from
        #[arg(long, value_parser = parse_u32)]
        seq: Option<u32>,

        /// Device key of a remote node as ADDRESS=HEX (repeatable)
        #[arg(long = "node", value_parser = parse_remote_node)]
        nodes: Vec<(u16, String)>,
    },

    /// Decrypt proxy PDUs received by the configured node
    Decode {
        /// Proxy PDUs (hex) in arrival order
        #[arg(required = true)]
        pdus: Vec<String>,

        /// Device key of a remote node as ADDRESS=HEX (repeatable)
        #[arg(long = "node", value_parser = parse_remote_node)]
        nodes: Vec<(u16, String)>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let mut filter = EnvFilter::new("warn");
            for target in LOG_TARGETS {
                filter = filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
            }
            filter
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("btmesh"))
        .init();

    info!("btmesh v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Keys { netkey, appkey } => derive_keys(&netkey, appkey.as_deref()),
        Command::Encode {
            dst,
            opcode,
            params,
            ttl,
            app_key_index,
            seq,
            nodes,
        } => {
            let config = MeshConfig::load_from_file(&args.config)?;
            let payload = access_payload(&opcode, &params)?;
            let key = match app_key_index {
                Some(index) => KeySelector::Application(index),
                None => KeySelector::Device,
            };
            encode(&config, &nodes, dst, ttl, key, seq, &payload).await
        }
        Command::Decode { pdus, nodes } => {
            let config = MeshConfig::load_from_file(&args.config)?;
            decode(&config, &nodes, &pdus).await
        }
    }
}

fn derive_keys(netkey: &str, appkey: Option<&str>) -> Result<()> {
    let netkey = parse_key(netkey).context("Invalid --netkey")?;
    let keys = k2(&netkey, K2_MASTER_INPUT);
    component_debug!("keys", "Derived network credentials");

    println!("nid:            {:#04x}", keys.nid);
    println!("encryption key: {}", hex::encode(keys.encryption_key));
    println!("privacy key:    {}", hex::encode(keys.privacy_key));
    println!("network id:     {}", hex::encode(k3(&netkey)));

    if let Some(appkey) = appkey {
        let appkey = parse_key(appkey).context("Invalid --appkey")?;
        println!("aid:            {:#04x}", k4(&appkey));
    }
    Ok(())
}

/// Build an access payload, checking the opcode is exactly the given octets
fn access_payload(opcode: &str, params: &str) -> Result<AccessPayload> {
    let opcode = hex::decode(opcode.trim_start_matches("0x")).context("Opcode is not hex")?;
    let params = hex::decode(params).context("Parameters are not hex")?;

    let mut encoded = opcode.clone();
    encoded.extend_from_slice(&params);
    let payload = AccessPayload::decode(&encoded)?;
    if payload.opcode.len() != opcode.len() {
        bail!(
            "opcode {} is {} octets but its format needs {}",
            hex::encode(&opcode),
            opcode.len(),
            payload.opcode.len()
        );
    }
    Ok(payload)
}

async fn build_node(
    config: &MeshConfig,
    nodes: &[(u16, String)],
) -> Result<(NodeContext, tokio::sync::mpsc::UnboundedReceiver<(Peer, Bytes)>)> {
    let record = config.node_record()?;
    let store = Arc::new(MemoryNodeStore::new());
    for (address, device_key) in nodes {
        let device_key = parse_key(device_key)
            .with_context(|| format!("Invalid device key for {:#06x}", address))?;
        let remote = MeshNodeRecord::new(
            *address,
            1,
            device_key,
            *record.network_key(),
            record.network_key_index(),
            record.iv_index(),
        )?;
        store.store(remote).await?;
    }

    let (transport, outbound) = ChannelTransport::new();
    let context = NodeContext::new(
        record,
        config.node_config(),
        store,
        Arc::new(transport),
        Peer(Uuid::nil()),
    )?;
    Ok((context, outbound))
}

async fn encode(
    config: &MeshConfig,
    nodes: &[(u16, String)],
    dst: u16,
    ttl: Option<u8>,
    key: KeySelector,
    seq: Option<u32>,
    payload: &AccessPayload,
) -> Result<()> {
    let (node, mut outbound) = build_node(config, nodes).await?;
    if let Some(seq) = seq {
        node.set_sequence_number(seq).await?;
    }

    let seq_auth = node.send_access(dst, ttl, key, payload).await?;
    let mut frames = 0;
    while let Ok((_, frame)) = outbound.try_recv() {
        println!("{}", hex::encode(&frame));
        frames += 1;
    }

    component_info!(
        "encode",
        "{} to {:#06x}: seq_auth={:#08x}, {} proxy pdu(s), next sequence number {:#08x}",
        payload.opcode,
        dst,
        seq_auth,
        frames,
        node.sequence_number().await
    );
    Ok(())
}

async fn decode(config: &MeshConfig, nodes: &[(u16, String)], pdus: &[String]) -> Result<()> {
    let (node, _outbound) = build_node(config, nodes).await?;
    let proxy = Peer(Uuid::nil());

    for (i, pdu) in pdus.iter().enumerate() {
        let bytes = hex::decode(pdu).with_context(|| format!("PDU {} is not hex", i))?;
        match node.on_pdu_received(&proxy, &bytes).await {
            Ok(Some(message)) => println!("{}", describe(&message)),
            Ok(None) => component_debug!("decode", "PDU {} consumed, no message yet", i),
            Err(err) => component_warn!("decode", "PDU {} rejected: {}", i, err),
        }
    }

    let deadline = Instant::now() + config.transport.reassembly_timeout;
    for incomplete in node.expire_reassembly(deadline) {
        component_warn!("decode", "{}", incomplete);
    }
    Ok(())
}

fn describe(message: &MeshMessage) -> String {
    match message {
        MeshMessage::Access(access) => {
            let key = match access.key {
                KeySelector::Device => "device".to_string(),
                KeySelector::Application(index) => format!("app {:#05x}", index),
            };
            format!(
                "access src={:#06x} dst={:#06x} ttl={} seq_auth={:#08x} key={} opcode={} params={}",
                access.src,
                access.dst,
                access.ttl,
                access.seq_auth,
                key,
                access.payload.opcode,
                hex::encode(&access.payload.params)
            )
        }
        MeshMessage::Control(control) => match &control.payload {
            ControlPayload::SegmentAck(ack) => format!(
                "segment-ack src={:#06x} dst={:#06x} seq_zero={:#06x} block_ack={:#010x}",
                control.src, control.dst, ack.seq_zero, ack.block_ack
            ),
            ControlPayload::Other { opcode, params } => format!(
                "control src={:#06x} dst={:#06x} ttl={} opcode={:#04x} params={}",
                control.src,
                control.dst,
                control.ttl,
                opcode,
                hex::encode(params)
            ),
        },
    }
}

fn parse_u16(value: &str) -> Result<u16> {
    Ok(u16::try_from(parse_number(value)?)?)
}

fn parse_u32(value: &str) -> Result<u32> {
    Ok(u32::try_from(parse_number(value)?)?)
}

fn parse_remote_node(value: &str) -> Result<(u16, String)> {
    let Some((address, key)) = value.split_once('=') else {
        bail!("expected ADDRESS=DEVICE_KEY, got {:?}", value);
    };
    Ok((parse_u16(address)?, key.to_string()))
}
