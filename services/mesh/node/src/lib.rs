//! Provisioned mesh nodes and the node send/receive pipeline.
//!
//! This crate holds the [`MeshNodeRecord`] created when provisioning
//! completes, the [`NodeStore`] persistence interface with an in-memory
//! backend, and the [`NodeContext`] that moves access and control messages
//! between the application and the proxy bearer.
//!
//! ## Features
//!
//! - **Node record**: device, network and application keys, IV index and a
//!   sequence counter that only moves forward
//! - **Node store**: async load/store/remove/list of provisioned nodes
//! - **Send pipeline**: access/control payload to encrypted, segmented,
//!   obfuscated network PDUs framed as proxy PDUs
//! - **Receive pipeline**: proxy dispatch, network decrypt, reassembly,
//!   segment acknowledgment and upper transport decrypt
//! - **Provisioning**: inbound provisioning PDUs drive an attached
//!   provisioner; completed devices land in the node store

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod record;
pub mod store;

// Re-export main types
pub use backend::mem::MemoryNodeStore;
pub use config::{NodeConfig, DEFAULT_TTL};
pub use context::NodeContext;
pub use error::NodeError;
pub use record::{AppKey, MeshNodeRecord};
pub use store::NodeStore;
