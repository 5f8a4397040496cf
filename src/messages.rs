//! # State Exchange Records
//!
//! The only message the maintenance core exchanges is the routing
//! [`State`]: a map of node ids to network addresses plus three small
//! flags. Everything else on the wire belongs to outer layers.
//!
//! | Record | Carries | Produced by |
//! |--------|---------|-------------|
//! | join | own addresses, `updated = 0` | a freshly authenticated link |
//! | state | leaves + recipient's prefix row | the manager after a commit |
//! | beat | `updated` + `passive` only | the beater |
//!
//! Serialization uses bincode with explicit size limits so a hostile
//! peer cannot force an oversized allocation before the record is even
//! looked at. Trailing bytes are rejected.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::id::NodeId;

/// Maximum encoded size of a state exchange record (256 KiB). A full
/// exchange carries one address list per leaf plus one prefix row,
/// which stays far below this even at maximum table occupancy.
pub const MAX_STATE_SIZE: u64 = 256 * 1024;

/// Routing state exchange: the addresses of known peers keyed by hex
/// node id, the sender's table epoch, and the heartbeat flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Hex node id → advertised network addresses.
    pub addrs: HashMap<String, Vec<String>>,
    /// The sender's routing table epoch at send time.
    pub updated: u64,
    /// Set on broadcasts after a route slot was lost: recipients should
    /// answer with their full state so the cell can be refilled.
    pub repair: bool,
    /// Heartbeat tag: true when the recipient is connected but absent
    /// from the sender's leaves and routes.
    pub passive: bool,
}

impl State {
    /// A heartbeat: no addresses, just the epoch and the passive tag.
    pub fn beat(updated: u64, passive: bool) -> Self {
        Self {
            updated,
            passive,
            ..Self::default()
        }
    }

    /// Whether this record is a bare heartbeat.
    pub fn is_beat(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// A state record addressed on the overlay ring. Full exchanges carry
/// the sender's own id as destination; heartbeats target the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub dest: NodeId,
    pub state: State,
}

/// Bincode options shared by both directions: varint integers, bounded
/// input, trailing bytes refused.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STATE_SIZE)
        .reject_trailing_bytes()
}

/// Encode an envelope for the wire.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>> {
    bincode_options()
        .serialize(env)
        .context("failed to encode state envelope")
}

/// Decode an envelope, refusing inputs over [`MAX_STATE_SIZE`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    deserialize_bounded(bytes)
}

/// Size-bounded deserialization for any core record.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() as u64 > MAX_STATE_SIZE {
        anyhow::bail!(
            "record of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_STATE_SIZE
        );
    }
    bincode_options()
        .deserialize(bytes)
        .context("failed to decode state record")
}
