//! src/keystore/mod.rs
//!
//! The replicated keystore: a `Key -> (Value, Timestamp,
//! Origin)` map with last-writer-wins conflict resolution, prefix queries,
//! and a durable backing file. This is the core of the coordination layer;
//! everything else (election, dispatcher, model, REST) is a layer on top.

pub mod protocol;

use crate::domain::{Clock, Key, PeerName};
use crate::error::Result;
use crate::store::{Store, StoredRecord};
use std::collections::HashMap;
use std::sync::Arc;

/// A single record held by the keystore: the current value (`None` for a
/// tombstone), the timestamp it was accepted at, and the peer that
/// proposed it.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub value: Option<serde_json::Value>,
    pub timestamp: u64,
    pub origin: PeerName,
}

/// A change accepted by `set`/`delete`/`apply_remote`, ready to be
/// announced over the gossip transport by the caller (the keystore never
/// talks to the transport directly, to avoid an object cycle between the
/// two.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub key: Key,
    pub value: Option<serde_json::Value>,
    pub timestamp: u64,
}

pub struct Keystore {
    store: Store,
    records: HashMap<Key, Record>,
    clock: Arc<dyn Clock>,
    local_origin: PeerName,
}

impl Keystore {
    /// Loads existing records from `store`, if any.
    pub fn new(store: Store, clock: Arc<dyn Clock>, local_origin: PeerName) -> Self {
        let mut records = HashMap::new();
        for (key, stored) in store.iter() {
            records.insert(
                Key(key.clone()),
                Record {
                    value: stored.value.clone(),
                    timestamp: stored.timestamp,
                    origin: PeerName(stored.origin.clone()),
                },
            );
        }
        Self {
            store,
            records,
            clock,
            local_origin,
        }
    }

    /// Returns the current value for `key`, or `None` if absent,
    /// tombstoned, or reserved for the election component.
    pub fn get(&self, key: &Key) -> Option<serde_json::Value> {
        if key.is_reserved() {
            return None;
        }
        self.records.get(key).and_then(|r| r.value.clone())
    }

    pub fn timestamp_of(&self, key: &Key) -> Option<u64> {
        if key.is_reserved() {
            return None;
        }
        self.records.get(key).map(|r| r.timestamp)
    }

    /// The current time per this keystore's clock, for callers (the
    /// resource model) that need to stamp fields outside the record value
    /// itself, such as `updated_at`.
    pub fn clock_now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// The full record for a non-reserved key, tombstone or not. Unlike
    /// `get`, this is how the anti-entropy request handler answers for a
    /// deleted key, so the deletion itself replicates rather than looking
    /// like the key was never requested.
    pub fn record(&self, key: &Key) -> Option<&Record> {
        if key.is_reserved() {
            return None;
        }
        self.records.get(key)
    }

    /// `key -> timestamp` for every non-reserved key this node holds,
    /// tombstoned or not — the digest a peer uses to spot gaps or
    /// staleness in its own copy.
    pub fn entries(&self) -> Vec<(Key, u64)> {
        self.records
            .iter()
            .filter(|(k, _)| !k.is_reserved())
            .map(|(k, r)| (k.clone(), r.timestamp))
            .collect()
    }

    /// Local write: stamps with the current clock, persists, and returns
    /// the `Change` to announce over gossip.
    pub fn set(&mut self, key: Key, value: serde_json::Value) -> Result<Change> {
        self.write_local(key, Some(value))
    }

    /// Equivalent to `set(key, tombstone)`.
    pub fn delete(&mut self, key: Key) -> Result<Change> {
        self.write_local(key, None)
    }

    fn write_local(&mut self, key: Key, value: Option<serde_json::Value>) -> Result<Change> {
        let timestamp = self.clock.now_ms();
        self.persist(&key, value.clone(), timestamp, self.local_origin.clone())?;
        self.records.insert(
            key.clone(),
            Record {
                value: value.clone(),
                timestamp,
                origin: self.local_origin.clone(),
            },
        );
        Ok(Change {
            key,
            value,
            timestamp,
        })
    }

    /// Deterministic (current keystore wins) prefix queries. `prefix_glob`
    /// is either a literal prefix or one ending in `*`; trailing `*` is
    /// stripped before matching. Tombstoned and reserved
    /// keys are never returned.
    pub fn keys(&self, prefix_glob: &str) -> Vec<Key> {
        let prefix = prefix_glob.strip_suffix('*').unwrap_or(prefix_glob);
        let mut matched: Vec<Key> = self
            .records
            .iter()
            .filter(|(k, r)| !k.is_reserved() && r.value.is_some() && k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        matched.sort();
        matched
    }

    /// Applies a remote peer's claim about `key`. Returns `Ok(true)` if it
    /// changed local state (and should therefore be re-gossiped /
    /// trigger notification matching), `Ok(false)` if it was stale and
    /// discarded.
    ///
    /// Conflict resolution: last-writer-wins by timestamp;
    /// ties broken by the lexicographically *smaller* origin name winning
    /// (matches the election tie-break rule).
    pub fn apply_remote(
        &mut self,
        peer: PeerName,
        key: Key,
        value: Option<serde_json::Value>,
        timestamp: u64,
    ) -> Result<bool> {
        let accept = match self.records.get(&key) {
            None => true,
            Some(existing) => {
                timestamp > existing.timestamp
                    || (timestamp == existing.timestamp && peer < existing.origin)
            }
        };
        if !accept {
            return Ok(false);
        }
        self.persist(&key, value.clone(), timestamp, peer.clone())?;
        self.records.insert(
            key,
            Record {
                value,
                timestamp,
                origin: peer,
            },
        );
        Ok(true)
    }

    fn persist(
        &mut self,
        key: &Key,
        value: Option<serde_json::Value>,
        timestamp: u64,
        origin: PeerName,
    ) -> Result<()> {
        self.store.put(
            key.clone(),
            StoredRecord {
                value,
                timestamp,
                origin: origin.0,
            },
        )
    }

    // --- Reserved-key access, used only by the election component ---
    //
    // Election state (`__leader__`, `__vote__:<peer>`, `__prio__:<peer>`) is
    // ephemeral: a restarted node re-runs its election from scratch rather
    // than trusting a stale persisted belief, so unlike `set`/`delete` a
    // persistence failure here is logged and swallowed rather than rejecting
    // the write.

    pub(crate) fn raw_get(&self, key: &str) -> Option<Record> {
        self.records.get(&Key::from(key)).cloned()
    }

    pub(crate) fn raw_set(&mut self, key: &str, value: serde_json::Value, origin: PeerName) -> u64 {
        let timestamp = self.clock.now_ms();
        let key = Key::from(key);
        if let Err(e) = self.persist(&key, Some(value.clone()), timestamp, origin.clone()) {
            tracing::warn!(key = %key, error = %e, "failed to persist election state");
        }
        self.records.insert(
            key,
            Record {
                value: Some(value),
                timestamp,
                origin,
            },
        );
        timestamp
    }
}
