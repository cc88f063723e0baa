//! src/keystore/protocol.rs
//!
//! Wire-level shapes for the gossip transport: the payload carried inside
//! a `Signed<GossipPayload>` envelope, and the peer-fanout selection
//! algorithm used when forwarding an update.

use crate::domain::{Key, PeerName};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr};

/// Everything this node can say to a peer over the gossip transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipPayload {
    /// A single key changed locally (or is being re-forwarded).
    KeyUpdate {
        key: Key,
        value: Option<serde_json::Value>,
        timestamp: u64,
    },
    /// A best-effort anti-entropy digest: this node's view of
    /// `key -> timestamp` for everything it currently holds, so a peer can
    /// ask back for anything it's missing or stale on.
    AntiEntropyDigest { entries: Vec<(Key, u64)> },
    /// A request for the full current record for each listed key, sent in
    /// response to a digest that revealed gaps or staleness.
    AntiEntropyRequest { keys: Vec<Key> },
}

/// Selects a random subset of known peers to forward a message to,
/// excluding the originator so messages don't boomerang straight back.
pub fn select_peers<'a>(
    known_peers: &'a HashMap<PeerName, SocketAddr>,
    exclude_originator: &PeerName,
    gossip_factor: usize,
) -> Vec<(&'a PeerName, &'a SocketAddr)> {
    let mut rng = thread_rng();
    known_peers
        .iter()
        .filter(|(id, _)| *id != exclude_originator)
        .collect::<Vec<_>>()
        .choose_multiple(&mut rng, gossip_factor)
        .cloned()
        .collect()
}
